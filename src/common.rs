//! Error type and path display helpers shared by the whole crate

use std::ffi::OsStr;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("PE file scan error: {0}")]
    ScanError(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("lookup context building error: {0}")]
    ContextDeductionError(String),

    #[error("could not demangle symbol {0}")]
    DemanglingError(String),

    #[error("file is not in PE format")]
    WrongFileFormatError(#[source] pelite::Error),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    PEError(#[from] pelite::Error),

    #[error(transparent)]
    GoblinError(#[from] goblin::error::Error),
}

pub fn osstring_to_string(s: &OsStr) -> String {
    s.to_string_lossy().into_owned()
}

pub fn path_to_string<P: AsRef<Path>>(p: P) -> String {
    osstring_to_string(p.as_ref().as_os_str())
}

/// Strip the `\\?\` prefix that `canonicalize` prepends on Windows
pub fn decanonicalize(s: &str) -> String {
    s.replacen(r"\\?\", "", 1)
}

/// Canonical path of `p`, in a form suitable for printing
pub fn readable_canonical_path<P: AsRef<Path>>(p: P) -> Result<String, LookupError> {
    Ok(decanonicalize(&path_to_string(fs_err::canonicalize(
        p.as_ref(),
    )?)))
}
