//! Arena-backed dependency tree with lazily loaded per-node symbol detail
//!
//! The tree reifies the (potentially cyclic) import graph: a file that is
//! referenced from several importers appears as several nodes, but only the
//! first occurrence carries metadata and children. Handle-based child links
//! keep back-references explicit and rule out unbounded recursion.

use crate::common::LookupError;
use crate::lookup_path::LookupPathEntry;
use crate::pe::{BinaryReader, ExportedSymbol, ModuleImport, PeMetadata};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;

/// Handle to a node within its `DependencyTree` arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct NodeId(pub(crate) usize);

/// Imported and exported symbol lists of one node, populated on first access
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeDetails {
    pub imports: Vec<ModuleImport>,
    pub exports: Vec<ExportedSymbol>,
}

/// One module occurrence in the dependency tree
#[derive(Debug, Serialize)]
pub struct DependencyNode {
    /// Name as it appears in the importer's import table (filename for the root)
    pub module_name: String,
    /// Import-table row that led to this node; absent for the root
    pub import: Option<ModuleImport>,
    /// Whether the module was resolved to a file on disk
    pub found: bool,
    /// Resolved location, if found
    pub full_path: Option<PathBuf>,
    /// Kind of search-path entry that produced the resolution
    pub location: Option<LookupPathEntry>,
    /// Depth at which this occurrence sits, root being 0
    pub depth: usize,
    /// Child occurrences, in import table order; empty for missing modules
    /// and for references to already-expanded files
    pub children: Vec<NodeId>,
    /// Structural metadata, retained only by the node that first expanded the file
    #[serde(skip)]
    pub(crate) metadata: Option<PeMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) details: Option<NodeDetails>,
}

impl DependencyNode {
    pub fn is_system(&self) -> bool {
        self.location
            .as_ref()
            .map(LookupPathEntry::is_system)
            .unwrap_or(false)
    }
}

/// Result of one dependency resolution run
///
/// Owns its nodes and the visited-state of the run that produced it; detail
/// accessors may still re-open files for nodes that did not retain metadata.
pub struct DependencyTree {
    arena: Vec<DependencyNode>,
    /// Resolved file paths that have been expanded into the tree
    pub(crate) found: HashSet<PathBuf>,
    /// Lowercased module names that could not be resolved
    pub(crate) not_found: HashSet<String>,
    reader: Box<dyn BinaryReader>,
}

impl DependencyTree {
    pub(crate) fn new(reader: Box<dyn BinaryReader>) -> Self {
        Self {
            arena: Vec::new(),
            found: HashSet::new(),
            not_found: HashSet::new(),
            reader,
        }
    }

    pub(crate) fn push_node(
        &mut self,
        parent: Option<NodeId>,
        node: DependencyNode,
    ) -> NodeId {
        let id = NodeId(self.arena.len());
        self.arena.push(node);
        if let Some(p) = parent {
            self.arena[p.0].children.push(id);
        }
        id
    }

    pub(crate) fn reader(&self) -> &dyn BinaryReader {
        self.reader.as_ref()
    }

    /// The root node; the arena is filled root-first
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &DependencyNode {
        &self.arena[id.0]
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.arena[id.0].children
    }

    /// All nodes in creation order (root first, then level by level)
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &DependencyNode)> {
        self.arena.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    /// Paths of the distinct files that were resolved and expanded
    pub fn found_paths(&self) -> &HashSet<PathBuf> {
        &self.found
    }

    /// Lowercased names of the modules that could not be resolved
    pub fn missing_modules(&self) -> &HashSet<String> {
        &self.not_found
    }

    /// Symbol detail of a node, loading it on first access
    ///
    /// Missing nodes yield empty lists. For found nodes the detail comes from
    /// the metadata retained at build time, or from a single re-parse if this
    /// occurrence is a reference to a file expanded elsewhere. Once computed,
    /// the lists are cached for the lifetime of the tree.
    pub fn ensure_details(&mut self, id: NodeId) -> Result<&NodeDetails, LookupError> {
        if self.arena[id.0].details.is_none() {
            let details = self.load_details(id)?;
            self.arena[id.0].details = Some(details);
        }
        self.arena[id.0]
            .details
            .as_ref()
            .ok_or_else(|| LookupError::ScanError("node details vanished after load".to_owned()))
    }

    pub fn get_imports(&mut self, id: NodeId) -> Result<&[ModuleImport], LookupError> {
        Ok(&self.ensure_details(id)?.imports)
    }

    pub fn get_exports(&mut self, id: NodeId) -> Result<&[ExportedSymbol], LookupError> {
        Ok(&self.ensure_details(id)?.exports)
    }

    fn load_details(&self, id: NodeId) -> Result<NodeDetails, LookupError> {
        let node = &self.arena[id.0];
        if !node.found {
            return Ok(NodeDetails::default());
        }
        if let Some(metadata) = &node.metadata {
            return Ok(NodeDetails {
                imports: metadata.imports.clone(),
                exports: metadata.exports.clone(),
            });
        }
        let path = node.full_path.as_ref().ok_or_else(|| {
            LookupError::ScanError(format!(
                "found module {} has no resolved path",
                node.module_name
            ))
        })?;
        let metadata = self.reader.parse(path)?;
        Ok(NodeDetails {
            imports: metadata.imports,
            exports: metadata.exports,
        })
    }
}
