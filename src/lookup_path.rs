//! Deterministic module-name-to-file resolution along an ordered search path

use crate::pe::{BinaryReader, Bitness};
use crate::query::LookupQuery;
use crate::system::WinFileSystemCache;
use crate::LookupError;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Directory to be searched when resolving a module name, and its role in the
/// search order
#[derive(Eq, PartialEq, Debug, Clone, Serialize)]
pub enum LookupPathEntry {
    /// Directory where the root executable sits
    ExecutableDir(PathBuf),
    /// Windows System directory matching the target bitness
    /// (typically C:\Windows\System32, or SysWOW64 for 32-bit targets)
    SystemDir(PathBuf),
    /// Windows directory (typically C:\Windows)
    WindowsDir(PathBuf),
    /// Working directory of the (virtual) process whose DLL lookup we are simulating
    WorkingDir(PathBuf),
    /// PATH as specified by the system
    SystemPath(PathBuf),
    /// Additional path entries specified by the user
    UserPath(PathBuf),
}

impl LookupPathEntry {
    pub fn is_system(&self) -> bool {
        matches!(self, Self::SystemDir(_) | Self::WindowsDir(_))
    }

    pub fn get_path(&self) -> &PathBuf {
        match self {
            Self::ExecutableDir(p)
            | Self::SystemDir(p)
            | Self::WindowsDir(p)
            | Self::WorkingDir(p)
            | Self::SystemPath(p)
            | Self::UserPath(p) => p,
        }
    }
}

/// Full location of a module found during lookup
#[derive(Debug, Clone)]
pub struct ResolvedModulePath {
    pub location: LookupPathEntry,
    pub fullpath: PathBuf,
}

/// Sorted list of directories to be searched when resolving a module name
///
/// The order mirrors the standard desktop application search order:
/// executable directory first, then the system directories matching the
/// target bitness, the working directory, the system PATH and finally any
/// user-provided entries.
pub struct LookupPath {
    pub entries: Vec<LookupPathEntry>,
    fs_cache: std::cell::RefCell<WinFileSystemCache>,
}

impl LookupPath {
    pub fn new(entries: Vec<LookupPathEntry>) -> Self {
        Self {
            entries,
            fs_cache: std::cell::RefCell::new(WinFileSystemCache::new()),
        }
    }

    /// Build the search path for a query, selecting system directories that
    /// match the target bitness
    pub fn deduce(query: &LookupQuery, bitness: Bitness) -> Self {
        let system_entries = if let Some(system) = &query.system {
            vec![
                LookupPathEntry::SystemDir(system.sys_dir_for(bitness).clone()),
                LookupPathEntry::WindowsDir(system.win_dir.clone()),
            ]
        } else {
            Vec::new()
        };

        let entries = [
            vec![LookupPathEntry::ExecutableDir(query.target.app_dir.clone())],
            system_entries,
            vec![LookupPathEntry::WorkingDir(query.target.working_dir.clone())],
            Self::system_path_entries(query),
            Self::user_path_entries(query),
        ]
        .concat();

        Self::new(entries)
    }

    /// Get the PATH entries specified by the system
    fn system_path_entries(q: &LookupQuery) -> Vec<LookupPathEntry> {
        q.system
            .as_ref()
            .and_then(|s| s.system_path.as_ref())
            .map(|path| {
                path.iter()
                    .map(|s| LookupPathEntry::SystemPath(s.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get the PATH entries that were provided by the user when running the program
    fn user_path_entries(q: &LookupQuery) -> Vec<LookupPathEntry> {
        q.target
            .user_path
            .iter()
            .map(|s| LookupPathEntry::UserPath(s.clone()))
            .collect()
    }

    /// Linearize the lookup context into a single vector of directories
    pub fn search_path(&self) -> Vec<PathBuf> {
        self.entries.iter().map(|e| e.get_path().clone()).collect()
    }

    /// Look for a module by name, case-insensitively, returning the first
    /// existing match whose bitness is compatible with the target
    ///
    /// A same-named file of the wrong bitness is skipped, and the search
    /// continues in the remaining directories. Directories that cannot be
    /// read are skipped as well.
    pub fn search_module(
        &self,
        module_name: &str,
        bitness: Bitness,
        reader: &dyn BinaryReader,
    ) -> Result<Option<ResolvedModulePath>, LookupError> {
        for e in &self.entries {
            let candidate = self.search_file_in_folder(module_name, e.get_path());
            if let Ok(Some(fullpath)) = candidate {
                match reader.probe_bitness(&fullpath) {
                    Ok(b) if b == bitness => {
                        return Ok(Some(ResolvedModulePath {
                            location: e.clone(),
                            fullpath,
                        }));
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        eprintln!("skipping unreadable candidate {}: {}", fullpath.display(), err);
                        continue;
                    }
                }
            }
        }
        Ok(None)
    }

    fn search_file_in_folder(
        &self,
        filename: &str,
        folder: &Path,
    ) -> Result<Option<PathBuf>, LookupError> {
        self.fs_cache
            .borrow_mut()
            .test_file_in_folder_case_insensitive(filename, folder)
    }
}
