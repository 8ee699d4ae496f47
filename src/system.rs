//! Description of the Windows installation hosting the scanned executable

#[cfg(windows)]
extern crate winapi;
use crate::common::LookupError;
use crate::pe::Bitness;
use fs_err as fs;
use std::collections::HashMap;
#[cfg(windows)]
use std::ffi::OsString;
#[cfg(windows)]
use std::os::windows::ffi::OsStringExt;
use std::path::{Path, PathBuf};

/// Description of a Windows system
///
/// If running from within Windows we extract the available information from
/// the environment variables and the Windows API.
/// If running in another OS we can only guess the directories, and can't do
/// anything about the PATH
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowsSystem {
    /// Windows directory (typically C:\Windows)
    pub win_dir: PathBuf,
    /// System directory holding native-bitness DLLs (typically C:\Windows\System32)
    pub sys_dir: PathBuf,
    /// 32-bit system directory of a 64-bit installation (C:\Windows\SysWOW64), if present
    pub sys_wow_dir: Option<PathBuf>,
    /// PATH as specified by the system
    pub system_path: Option<Vec<PathBuf>>,
}

impl WindowsSystem {
    /// Collect information about the host operating system
    #[cfg(windows)]
    pub fn current() -> Result<Self, LookupError> {
        let win_dir = get_windows_directory()?;
        let sys_dir = get_system_directory()?;
        let sys_wow_dir = Some(win_dir.join("SysWOW64")).filter(|p| p.is_dir());

        let system_path = std::env::var("PATH")
            .map(|s| {
                s.split(';')
                    .filter_map(|subs| fs::canonicalize(subs).ok())
                    .collect()
            })
            .ok();

        Ok(Self {
            win_dir,
            sys_dir,
            sys_wow_dir,
            system_path,
        })
    }

    /// Collect information about the Windows operating system installed on the
    /// partition the target executable lies into
    #[cfg(not(windows))]
    pub fn from_exe_location<P: AsRef<Path>>(p: P) -> Result<Option<Self>, LookupError> {
        if let Some(root) = Self::find_root(&p) {
            Ok(Self::from_root(root))
        } else {
            Ok(None)
        }
    }

    /// Try finding a Windows installation along the path to the target executable
    /// Rationale: the user may have mounted a Windows partition at an unknown depth in the filesystem
    #[cfg(not(windows))]
    fn find_root<P: AsRef<Path>>(p: P) -> Option<PathBuf> {
        for a in p.as_ref().parent()?.ancestors() {
            if Self::from_root(a).is_some() {
                return Some(a.to_owned());
            }
        }
        None
    }

    /// Collect information about the Windows installation at the given path
    /// The path should point to the C:\ partition
    pub fn from_root<P: AsRef<Path>>(root_path: P) -> Option<Self> {
        let win_dir = root_path.as_ref().join("Windows");
        let sys_dir = win_dir.join("System32");
        if sys_dir.is_dir() {
            let sys_wow_dir = Some(win_dir.join("SysWOW64")).filter(|p| p.is_dir());
            Some(Self {
                win_dir,
                sys_dir,
                sys_wow_dir,
                system_path: None,
            })
        } else {
            None
        }
    }

    /// System directory whose DLLs match the given bitness
    ///
    /// On a 64-bit installation 32-bit processes load from SysWOW64; if no
    /// SysWOW64 exists the installation itself is 32-bit and System32 is the
    /// right answer for both
    pub fn sys_dir_for(&self, bitness: Bitness) -> &PathBuf {
        match bitness {
            Bitness::X64 => &self.sys_dir,
            Bitness::X86 => self.sys_wow_dir.as_ref().unwrap_or(&self.sys_dir),
        }
    }
}

/// Fetch the path to a system directory through the Windows API
#[cfg(windows)]
fn get_winapi_directory(
    a: unsafe extern "system" fn(
        winapi::um::winnt::LPWSTR,
        winapi::shared::minwindef::UINT,
    ) -> winapi::shared::minwindef::UINT,
) -> Result<PathBuf, std::io::Error> {
    use std::io::Error;

    const BFR_SIZE: usize = 512;
    let mut bfr: [u16; BFR_SIZE] = [0; BFR_SIZE];

    let ret: u32 = unsafe { a(bfr.as_mut_ptr(), BFR_SIZE as u32) };
    if ret == 0 {
        Err(Error::last_os_error())
    } else {
        let valid_bfr = &bfr[..ret as usize];
        fs::canonicalize(OsString::from_wide(valid_bfr))
    }
}

/// Get the path to the System directory (typically C:\Windows\System32)
#[cfg(windows)]
fn get_system_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::sysinfoapi::GetSystemDirectoryW)
}

/// Get the path to the Windows directory (typically C:\Windows)
#[cfg(windows)]
fn get_windows_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::sysinfoapi::GetWindowsDirectoryW)
}

/// Caches the content of already scanned directories, to avoid repeated expensive filesystem access
pub(crate) struct WinFileSystemCache {
    files_in_dirs: HashMap<PathBuf, HashMap<String, PathBuf>>,
}

impl WinFileSystemCache {
    pub(crate) fn new() -> Self {
        Self {
            files_in_dirs: HashMap::new(),
        }
    }

    /// Look for a file by name in the given folder, matching case-insensitively
    /// Returns the full path with the on-disk spelling of the filename
    pub(crate) fn test_file_in_folder_case_insensitive<P: AsRef<Path>, Q: AsRef<Path>>(
        &mut self,
        filename: P,
        folder: Q,
    ) -> Result<Option<PathBuf>, LookupError> {
        self.scan_folder(folder.as_ref())?;
        let dir = self
            .files_in_dirs
            .get(folder.as_ref())
            .ok_or_else(|| {
                LookupError::ScanError(format!(
                    "Could not scan directory {}",
                    folder.as_ref().display()
                ))
            })?;
        let lower_filename = filename
            .as_ref()
            .to_str()
            .map(str::to_lowercase)
            .ok_or_else(|| {
                LookupError::ScanError(format!(
                    "Could not look up non-UTF-8 filename {}",
                    filename.as_ref().display()
                ))
            })?;
        Ok(dir.get(&lower_filename).map(|p| folder.as_ref().join(p)))
    }

    fn scan_folder(&mut self, folder: &Path) -> Result<(), LookupError> {
        if let std::collections::hash_map::Entry::Vacant(e) =
            self.files_in_dirs.entry(folder.to_owned())
        {
            let matching_entries: HashMap<String, PathBuf> = fs::read_dir(folder)?
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.metadata().map_or_else(|_| false, |m| m.is_file()))
                .filter_map(|entry| {
                    entry
                        .file_name()
                        .to_str()
                        .map(|s| (s.to_lowercase(), entry.file_name().into()))
                })
                .collect();
            e.insert(matching_entries);
        }
        Ok(())
    }
}
