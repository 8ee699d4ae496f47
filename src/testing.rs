//! In-memory stand-ins shared by the engine tests
//!
//! Real PE fixtures are not checked in; the resolution logic is exercised
//! against stub files on disk plus metadata served by a fake reader.

use crate::common::LookupError;
use crate::pe::{BinaryReader, Bitness, ExportedSymbol, ModuleImport, PeMetadata};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// `BinaryReader` keyed by full path, logging every full parse
///
/// Clones share the same module map and parse log, so a test can keep one
/// handle while the tree owns another.
#[derive(Clone, Default)]
pub(crate) struct FakeReader {
    modules: Rc<RefCell<HashMap<PathBuf, PeMetadata>>>,
    corrupt: Rc<RefCell<std::collections::HashSet<PathBuf>>>,
    parse_log: Rc<RefCell<Vec<PathBuf>>>,
}

impl FakeReader {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Create a stub file on disk and register its metadata under that path
    pub(crate) fn place(&self, dir: &Path, name: &str, metadata: PeMetadata) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"stub").unwrap();
        self.modules.borrow_mut().insert(path.clone(), metadata);
        path
    }

    /// Like `place`, but the file answers the bitness probe and then fails
    /// the full parse, as a truncated or corrupted PE would
    pub(crate) fn place_corrupt(&self, dir: &Path, name: &str, bitness: Bitness) -> PathBuf {
        let path = self.place(dir, name, metadata(bitness, &[]));
        self.corrupt.borrow_mut().insert(path.clone());
        path
    }

    pub(crate) fn parse_count(&self, path: &Path) -> usize {
        self.parse_log
            .borrow()
            .iter()
            .filter(|p| p.as_path() == path)
            .count()
    }

    pub(crate) fn total_parses(&self) -> usize {
        self.parse_log.borrow().len()
    }
}

impl BinaryReader for FakeReader {
    fn parse(&self, path: &Path) -> Result<PeMetadata, LookupError> {
        self.parse_log.borrow_mut().push(path.to_owned());
        if self.corrupt.borrow().contains(path) {
            return Err(LookupError::ScanError(format!(
                "corrupted file {}",
                path.display()
            )));
        }
        self.modules.borrow().get(path).cloned().ok_or_else(|| {
            LookupError::ScanError(format!("no metadata registered for {}", path.display()))
        })
    }

    fn probe_bitness(&self, path: &Path) -> Result<Bitness, LookupError> {
        self.modules.borrow().get(path).map(|m| m.bitness).ok_or_else(|| {
            LookupError::ScanError(format!("no metadata registered for {}", path.display()))
        })
    }
}

pub(crate) fn metadata(bitness: Bitness, dependencies: &[&str]) -> PeMetadata {
    PeMetadata {
        bitness,
        imports: dependencies
            .iter()
            .map(|d| ModuleImport {
                name: d.to_string(),
                symbols: Vec::new(),
            })
            .collect(),
        exports: Vec::new(),
    }
}

pub(crate) fn metadata_with_exports(
    bitness: Bitness,
    dependencies: &[&str],
    exports: &[&str],
) -> PeMetadata {
    let mut md = metadata(bitness, dependencies);
    md.exports = exports
        .iter()
        .enumerate()
        .map(|(i, name)| ExportedSymbol {
            name: Some(name.to_string()),
            rva: 0x1000 + i,
        })
        .collect();
    md
}
