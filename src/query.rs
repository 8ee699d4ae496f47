//! Data structures that must be filled with the input and the parameters for a scan

use crate::common::LookupError;
use crate::system::WindowsSystem;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct LookupTarget {
    /// Path to the root executable
    pub target_exe: PathBuf,
    /// Parent directory of target_exe, cached for performance purposes
    pub app_dir: PathBuf,
    /// Working directory as it should appear in the search path
    pub working_dir: PathBuf,
    /// Additional executable search path set by the user
    pub user_path: Vec<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct LookupParameters {
    /// Maximum library recursion depth for the search
    pub max_depth: Option<usize>,
}

/// Complete specification of a dependency resolution run
#[derive(Clone, Debug)]
pub struct LookupQuery {
    pub system: Option<WindowsSystem>,
    pub target: LookupTarget,
    pub parameters: LookupParameters,
}

impl LookupQuery {
    /// autodetects the settings with sensible defaults
    ///
    /// The working directory will be set to the one containing the executable (i.e. the app_dir)
    pub fn deduce_from_executable_location<P: AsRef<Path>>(
        target_exe: P,
    ) -> Result<Self, LookupError> {
        let app_dir = target_exe.as_ref().parent().ok_or_else(|| {
            LookupError::ContextDeductionError(
                "Could not find application directory for given executable ".to_owned()
                    + target_exe.as_ref().to_str().unwrap_or(""),
            )
        })?;

        #[cfg(windows)]
        let system = Some(WindowsSystem::current()?);
        #[cfg(not(windows))]
        let system = WindowsSystem::from_exe_location(&target_exe)?;

        Ok(Self {
            system,
            target: LookupTarget {
                user_path: Vec::new(),
                target_exe: target_exe.as_ref().to_owned(),
                app_dir: app_dir.to_owned(),
                working_dir: app_dir.to_owned(),
            },
            parameters: LookupParameters { max_depth: None },
        })
    }
}
