//! Low-level PE file format access through the goblin and pelite libraries

use crate::common::LookupError;
use serde::Serialize;
use std::path::Path;

/// Target architecture width of a PE file
///
/// A process only ever loads modules matching its own bitness, so this drives
/// both the system directory selection and the candidate filtering during
/// module resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Bitness {
    X86,
    X64,
}

/// A single entry of an import thunk table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ImportedSymbol {
    ByName { name: String, rva: usize },
    ByOrdinal { ordinal: u16, rva: usize },
}

/// One row of the import directory: a required module and the symbols
/// imported from it, in table order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleImport {
    pub name: String,
    pub symbols: Vec<ImportedSymbol>,
}

/// One row of the export directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedSymbol {
    pub name: Option<String>,
    pub rva: usize,
}

/// Structural metadata of a PE file, as extracted in a single parse pass
#[derive(Debug, Clone, Serialize)]
pub struct PeMetadata {
    pub bitness: Bitness,
    /// Import directory, in file order
    pub imports: Vec<ModuleImport>,
    /// Export directory, in file order
    pub exports: Vec<ExportedSymbol>,
}

impl PeMetadata {
    /// Names of the modules this file depends on, in import table order
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.imports.iter().map(|m| m.name.as_str())
    }
}

/// Access to PE metadata on disk
///
/// The engine only relies on this contract; the concrete parser is
/// interchangeable, which also keeps the resolution logic testable without
/// real PE fixtures.
pub trait BinaryReader {
    /// Open, parse and close the file at `path` within this single call
    fn parse(&self, path: &Path) -> Result<PeMetadata, LookupError>;

    /// Cheap header-only check of a candidate file's bitness
    fn probe_bitness(&self, path: &Path) -> Result<Bitness, LookupError> {
        Ok(self.parse(path)?.bitness)
    }
}

/// The real parser, backed by goblin for table contents and pelite for the
/// lightweight header probe
#[derive(Debug, Default)]
pub struct PeReader;

impl PeReader {
    pub fn new() -> Self {
        Self
    }
}

impl BinaryReader for PeReader {
    fn parse(&self, path: &Path) -> Result<PeMetadata, LookupError> {
        let content = fs_err::read(path)?;
        let pe = match goblin::Object::parse(&content)? {
            goblin::Object::PE(pe) => pe,
            _ => {
                return Err(LookupError::ScanError(format!(
                    "{} is not a PE file",
                    path.display()
                )))
            }
        };

        let bitness = if pe.is_64 { Bitness::X64 } else { Bitness::X86 };

        // goblin walks the import descriptors sequentially, so the flat list
        // is already grouped per DLL in table order
        let grouped: multimap::MultiMap<&str, ImportedSymbol> = pe
            .imports
            .iter()
            .map(|i| (i.dll, imported_symbol(i)))
            .collect();
        let imports = pe
            .libraries
            .iter()
            .map(|dll| ModuleImport {
                name: dll.to_string(),
                symbols: grouped.get_vec(dll).cloned().unwrap_or_default(),
            })
            .collect();

        let exports = pe
            .exports
            .iter()
            .map(|e| ExportedSymbol {
                name: e.name.map(str::to_string),
                rva: e.rva,
            })
            .collect();

        Ok(PeMetadata {
            bitness,
            imports,
            exports,
        })
    }

    fn probe_bitness(&self, path: &Path) -> Result<Bitness, LookupError> {
        let filemap = pelite::FileMap::open(path)?;
        match pelite::PeFile::from_bytes(&filemap) {
            Ok(pelite::Wrap::T32(_)) => Ok(Bitness::X86),
            Ok(pelite::Wrap::T64(_)) => Ok(Bitness::X64),
            Err(e @ (pelite::Error::BadMagic | pelite::Error::PeMagic)) => {
                Err(LookupError::WrongFileFormatError(e))
            }
            Err(e) => Err(LookupError::PEError(e)),
        }
    }
}

fn imported_symbol(i: &goblin::pe::import::Import) -> ImportedSymbol {
    // goblin synthesizes "ORDINAL n" names for imports without a name table entry
    if i.name.starts_with("ORDINAL ") {
        ImportedSymbol::ByOrdinal {
            ordinal: i.ordinal,
            rva: i.rva,
        }
    } else {
        ImportedSymbol::ByName {
            name: i.name.to_string(),
            rva: i.rva,
        }
    }
}

/// Get a humanly-readable version of the (imported or exported) symbol
pub fn demangle_symbol(symbol: &str) -> Result<String, LookupError> {
    let flags =
        msvc_demangler::DemangleFlags::llvm() | msvc_demangler::DemangleFlags::NO_MS_KEYWORDS;
    msvc_demangler::demangle(symbol, flags)
        .map_err(|_| LookupError::DemanglingError(symbol.to_owned()))
}
