//! Breadth-first construction of the dependency tree
//!
//! Resolution state (the found / not-found sets) lives in the builder's
//! output, scoped to a single run; nothing here is process-wide, so several
//! analyses can run independently.

use crate::common::LookupError;
use crate::lookup_path::LookupPath;
use crate::pe::{BinaryReader, Bitness, ModuleImport};
use crate::query::LookupQuery;
use crate::tree::{DependencyNode, DependencyTree, NodeId};
use std::collections::VecDeque;

pub(crate) struct TreeBuilder<'a> {
    query: &'a LookupQuery,
    context: &'a LookupPath,
    tree: DependencyTree,
    /// Nodes whose children still have to be created, in level order
    to_expand: VecDeque<NodeId>,
}

impl<'a> TreeBuilder<'a> {
    pub(crate) fn new(
        query: &'a LookupQuery,
        context: &'a LookupPath,
        reader: Box<dyn BinaryReader>,
    ) -> Self {
        Self {
            query,
            context,
            tree: DependencyTree::new(reader),
            to_expand: VecDeque::new(),
        }
    }

    /// Resolve the whole dependency closure of the query's target
    ///
    /// A root parse failure is fatal; any per-module failure degrades that
    /// module to a missing node. Each distinct resolved file is parsed and
    /// expanded at most once, which also bounds the traversal on cyclic
    /// import graphs.
    pub(crate) fn run(mut self) -> Result<DependencyTree, LookupError> {
        let target_exe = &self.query.target.target_exe;
        let root_name = target_exe
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                LookupError::ScanError(format!(
                    "could not derive a module name from {}",
                    target_exe.display()
                ))
            })?
            .to_owned();

        let root_metadata = self.tree.reader().parse(target_exe)?;
        let bitness = root_metadata.bitness;

        self.tree.found.insert(target_exe.clone());
        let root = self.tree.push_node(
            None,
            DependencyNode {
                module_name: root_name,
                import: None,
                found: true,
                full_path: Some(target_exe.clone()),
                location: None,
                depth: 0,
                children: Vec::new(),
                metadata: Some(root_metadata),
                details: None,
            },
        );
        self.to_expand.push_back(root);

        while let Some(node_id) = self.to_expand.pop_front() {
            self.expand(node_id, bitness);
        }

        Ok(self.tree)
    }

    /// Create the direct children of an expanded node and enqueue the
    /// first-visit ones for expansion of their own
    fn expand(&mut self, node_id: NodeId, bitness: Bitness) {
        let depth = self.tree.node(node_id).depth;
        if let Some(max_depth) = self.query.parameters.max_depth {
            if depth >= max_depth {
                return;
            }
        }

        let imports: Vec<ModuleImport> = self
            .tree
            .node(node_id)
            .metadata
            .as_ref()
            .map(|md| md.imports.clone())
            .unwrap_or_default();

        for import in imports {
            let name_key = import.name.to_lowercase();

            // a name that already failed resolution is never retried within a run
            if self.tree.not_found.contains(&name_key) {
                self.push_missing(node_id, import, depth);
                continue;
            }

            let resolved = self
                .context
                .search_module(&import.name, bitness, self.tree.reader())
                .unwrap_or(None);
            let Some(resolved) = resolved else {
                self.tree.not_found.insert(name_key);
                self.push_missing(node_id, import, depth);
                continue;
            };

            if self.tree.found.contains(&resolved.fullpath) {
                // already expanded elsewhere: terminal reference, no re-parse
                self.tree.push_node(
                    Some(node_id),
                    DependencyNode {
                        module_name: import.name.clone(),
                        import: Some(import),
                        found: true,
                        full_path: Some(resolved.fullpath),
                        location: Some(resolved.location),
                        depth: depth + 1,
                        children: Vec::new(),
                        metadata: None,
                        details: None,
                    },
                );
                continue;
            }

            match self.tree.reader().parse(&resolved.fullpath) {
                Ok(metadata) => {
                    self.tree.found.insert(resolved.fullpath.clone());
                    let child = self.tree.push_node(
                        Some(node_id),
                        DependencyNode {
                            module_name: import.name.clone(),
                            import: Some(import),
                            found: true,
                            full_path: Some(resolved.fullpath),
                            location: Some(resolved.location),
                            depth: depth + 1,
                            children: Vec::new(),
                            metadata: Some(metadata),
                            details: None,
                        },
                    );
                    self.to_expand.push_back(child);
                }
                Err(e) => {
                    // a located but unparsable module degrades to missing
                    eprintln!(
                        "could not parse {}: {}",
                        resolved.fullpath.display(),
                        e
                    );
                    self.tree.not_found.insert(name_key);
                    self.push_missing(node_id, import, depth);
                }
            }
        }
    }

    fn push_missing(&mut self, parent: NodeId, import: ModuleImport, parent_depth: usize) {
        self.tree.push_node(
            Some(parent),
            DependencyNode {
                module_name: import.name.clone(),
                import: Some(import),
                found: false,
                full_path: None,
                location: None,
                depth: parent_depth + 1,
                children: Vec::new(),
                metadata: None,
                details: None,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::lookup_path::{LookupPath, LookupPathEntry};
    use crate::pe::Bitness;
    use crate::query::LookupQuery;
    use crate::testing::{metadata, FakeReader};
    use crate::{DependencyTree, LookupError};
    use std::path::Path;

    fn build(
        reader: &FakeReader,
        dir: &Path,
        root: &Path,
    ) -> Result<DependencyTree, LookupError> {
        build_with_depth(reader, dir, root, None)
    }

    fn build_with_depth(
        reader: &FakeReader,
        dir: &Path,
        root: &Path,
        max_depth: Option<usize>,
    ) -> Result<DependencyTree, LookupError> {
        let mut query = LookupQuery::deduce_from_executable_location(root)?;
        query.parameters.max_depth = max_depth;
        let context = LookupPath::new(vec![LookupPathEntry::ExecutableDir(dir.to_owned())]);
        crate::build_tree(&query, &context, Box::new(reader.clone()))
    }

    fn child_names(tree: &DependencyTree, id: crate::NodeId) -> Vec<String> {
        tree.children(id)
            .iter()
            .map(|&c| tree.node(c).module_name.clone())
            .collect()
    }

    #[test]
    fn unparsable_root_is_fatal() -> Result<(), LookupError> {
        let dir = tempfile::tempdir()?;
        let reader = FakeReader::new();
        let root = dir.path().join("Root.exe");
        std::fs::write(&root, b"stub")?;
        // no metadata registered: the root parse fails

        assert!(build(&reader, dir.path(), &root).is_err());
        Ok(())
    }

    #[test]
    fn children_preserve_import_table_order() -> Result<(), LookupError> {
        let dir = tempfile::tempdir()?;
        let reader = FakeReader::new();
        let root = reader.place(
            dir.path(),
            "Root.exe",
            metadata(Bitness::X64, &["Zeta.dll", "Alpha.dll", "Mid.dll"]),
        );
        for name in ["Zeta.dll", "Alpha.dll", "Mid.dll"] {
            reader.place(dir.path(), name, metadata(Bitness::X64, &[]));
        }

        let tree = build(&reader, dir.path(), &root)?;
        assert_eq!(
            child_names(&tree, tree.root()),
            vec!["Zeta.dll", "Alpha.dll", "Mid.dll"]
        );
        Ok(())
    }

    #[test]
    fn diamond_dependency_is_parsed_once() -> Result<(), LookupError> {
        let dir = tempfile::tempdir()?;
        let reader = FakeReader::new();
        let root = reader.place(
            dir.path(),
            "Root.exe",
            metadata(Bitness::X64, &["A.dll", "B.dll"]),
        );
        reader.place(dir.path(), "A.dll", metadata(Bitness::X64, &["Common.dll"]));
        reader.place(dir.path(), "B.dll", metadata(Bitness::X64, &["Common.dll"]));
        let common = reader.place(dir.path(), "Common.dll", metadata(Bitness::X64, &[]));

        let tree = build(&reader, dir.path(), &root)?;

        assert_eq!(reader.parse_count(&common), 1);
        assert_eq!(
            tree.found_paths().iter().filter(|p| **p == common).count(),
            1
        );
        // both importers still see a child occurrence pointing at the same file
        let a = tree.children(tree.root())[0];
        let b = tree.children(tree.root())[1];
        assert_eq!(child_names(&tree, a), vec!["Common.dll"]);
        assert_eq!(child_names(&tree, b), vec!["Common.dll"]);
        let a_common = tree.children(a)[0];
        let b_common = tree.children(b)[0];
        assert_eq!(
            tree.node(a_common).full_path,
            tree.node(b_common).full_path
        );
        // only the first occurrence got expanded
        let occurrences = [a_common, b_common];
        let expanded: Vec<_> = occurrences
            .iter()
            .filter(|&&id| !tree.children(id).is_empty() || tree.node(id).metadata.is_some())
            .collect();
        assert_eq!(expanded.len(), 1);
        Ok(())
    }

    #[test]
    fn cyclic_imports_terminate() -> Result<(), LookupError> {
        let dir = tempfile::tempdir()?;
        let reader = FakeReader::new();
        let a = reader.place(dir.path(), "A.dll", metadata(Bitness::X64, &["B.dll"]));
        reader.place(dir.path(), "B.dll", metadata(Bitness::X64, &["A.dll"]));

        let tree = build(&reader, dir.path(), &a)?;

        let b_node = tree.children(tree.root())[0];
        assert_eq!(child_names(&tree, tree.root()), vec!["B.dll"]);
        assert_eq!(child_names(&tree, b_node), vec!["A.dll"]);
        // the back-reference to A is a leaf, not expanded again
        let a_leaf = tree.children(b_node)[0];
        assert!(tree.children(a_leaf).is_empty());
        assert_eq!(reader.parse_count(&a), 1);
        Ok(())
    }

    #[test]
    fn missing_module_is_recorded_and_never_retried() -> Result<(), LookupError> {
        let dir = tempfile::tempdir()?;
        let reader = FakeReader::new();
        let root = reader.place(
            dir.path(),
            "Root.exe",
            metadata(Bitness::X64, &["A.dll", "Ghost.dll"]),
        );
        // A references the same unresolvable name again
        reader.place(dir.path(), "A.dll", metadata(Bitness::X64, &["Ghost.dll"]));

        let tree = build(&reader, dir.path(), &root)?;

        assert!(tree.missing_modules().contains("ghost.dll"));
        let a_node = tree.children(tree.root())[0];
        let ghost_under_root = tree.children(tree.root())[1];
        let ghost_under_a = tree.children(a_node)[0];
        assert!(!tree.node(ghost_under_root).found);
        assert!(!tree.node(ghost_under_a).found);
        // no stub file was ever created for it, so nothing was parsed
        assert_eq!(reader.parse_count(&dir.path().join("Ghost.dll")), 0);
        Ok(())
    }

    #[test]
    fn unparsable_dependency_degrades_to_missing() -> Result<(), LookupError> {
        let dir = tempfile::tempdir()?;
        let reader = FakeReader::new();
        let root = reader.place(dir.path(), "Root.exe", metadata(Bitness::X64, &["Bad.dll"]));
        // Bad.dll resolves and answers the bitness probe but fails the full parse
        let bad = reader.place_corrupt(dir.path(), "Bad.dll", Bitness::X64);

        let tree = build(&reader, dir.path(), &root)?;

        let bad_node = tree.children(tree.root())[0];
        assert!(!tree.node(bad_node).found);
        assert!(!tree.found_paths().contains(&bad));
        assert!(tree.missing_modules().contains("bad.dll"));
        Ok(())
    }

    #[test]
    fn bitness_is_inherited_from_the_root() -> Result<(), LookupError> {
        let dir = tempfile::tempdir()?;
        let reader = FakeReader::new();
        // 32-bit root; a 64-bit file with the imported name must not resolve
        let root = reader.place(dir.path(), "Root.exe", metadata(Bitness::X86, &["Dep.dll"]));
        reader.place(dir.path(), "Dep.dll", metadata(Bitness::X64, &[]));

        let tree = build(&reader, dir.path(), &root)?;

        let dep = tree.children(tree.root())[0];
        assert!(!tree.node(dep).found);
        assert!(tree.missing_modules().contains("dep.dll"));
        Ok(())
    }

    #[test]
    fn max_depth_bounds_expansion() -> Result<(), LookupError> {
        let dir = tempfile::tempdir()?;
        let reader = FakeReader::new();
        let root = reader.place(dir.path(), "Root.exe", metadata(Bitness::X64, &["A.dll"]));
        reader.place(dir.path(), "A.dll", metadata(Bitness::X64, &["B.dll"]));
        reader.place(dir.path(), "B.dll", metadata(Bitness::X64, &[]));

        let tree = build_with_depth(&reader, dir.path(), &root, Some(1))?;

        let a_node = tree.children(tree.root())[0];
        assert!(tree.node(a_node).found);
        // A sits at the depth limit, so its own imports are not walked
        assert!(tree.children(a_node).is_empty());
        Ok(())
    }

    #[test]
    fn composite_scenario_with_cycle_and_missing_sibling() -> Result<(), LookupError> {
        // R imports A and B; A imports C; C imports A again; B is unresolvable
        let dir = tempfile::tempdir()?;
        let reader = FakeReader::new();
        let root = reader.place(
            dir.path(),
            "R.exe",
            metadata(Bitness::X64, &["A.dll", "B.dll"]),
        );
        let a = reader.place(dir.path(), "A.dll", metadata(Bitness::X64, &["C.dll"]));
        reader.place(dir.path(), "C.dll", metadata(Bitness::X64, &["A.dll"]));

        let tree = build(&reader, dir.path(), &root)?;

        assert_eq!(child_names(&tree, tree.root()), vec!["A.dll", "B.dll"]);
        let a_node = tree.children(tree.root())[0];
        let b_node = tree.children(tree.root())[1];
        assert!(!tree.node(b_node).found);

        let c_node = tree.children(a_node)[0];
        assert_eq!(tree.node(c_node).module_name, "C.dll");
        let a_leaf = tree.children(c_node)[0];
        assert_eq!(tree.node(a_leaf).module_name, "A.dll");
        assert!(tree.node(a_leaf).found);
        assert!(tree.children(a_leaf).is_empty());

        assert_eq!(reader.parse_count(&a), 1);
        // R, A, C: three expansions in total
        assert_eq!(reader.total_parses(), 3);
        assert_eq!(tree.found_paths().len(), 3);
        Ok(())
    }
}
