//! Recursive DLL dependency tree inspection for Windows executables
//!
//! Given a root executable, the engine parses its import table, resolves each
//! imported module along the platform search order (matching the root's
//! bitness), and recurses until the whole dependency closure is covered. Each
//! distinct file is parsed and expanded at most once; per-node symbol detail
//! is loaded lazily on first access.

mod builder;
pub mod common;
pub mod lookup_path;
pub mod pe;
pub mod query;
pub mod system;
#[cfg(test)]
pub(crate) mod testing;
pub mod tree;

pub use common::{
    decanonicalize, osstring_to_string, path_to_string, readable_canonical_path, LookupError,
};
pub use lookup_path::{LookupPath, LookupPathEntry, ResolvedModulePath};
pub use pe::{
    BinaryReader, Bitness, ExportedSymbol, ImportedSymbol, ModuleImport, PeMetadata, PeReader,
};
pub use query::LookupQuery;
pub use system::WindowsSystem;
pub use tree::{DependencyNode, DependencyTree, NodeDetails, NodeId};

/// Resolve the full dependency tree of the query's target executable
///
/// Deduces the search path from the query and the target's bitness; fails
/// only if the root itself cannot be read or parsed.
pub fn analyze(query: &LookupQuery) -> Result<DependencyTree, LookupError> {
    let reader = PeReader::new();
    let bitness = reader.probe_bitness(&query.target.target_exe)?;
    let context = LookupPath::deduce(query, bitness);
    build_tree(query, &context, Box::new(reader))
}

/// Build a dependency tree with an explicit search path and metadata reader
pub fn build_tree(
    query: &LookupQuery,
    context: &LookupPath,
    reader: Box<dyn BinaryReader>,
) -> Result<DependencyTree, LookupError> {
    builder::TreeBuilder::new(query, context, reader).run()
}
