//! Published index state and its lookup tables.
//!
//! An [`IndexSnapshot`] is immutable once built. [`SharedIndex`] holds the
//! current one behind an `Arc` so readers clone the pointer and never wait on
//! a rebuild; the scheduler publishes a replacement by swapping it. Root and
//! folder nodes are shared as `Arc<PathNode>`, so node lookups never copy a
//! subtree.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::tree::{IndexState, Leaf, PathNode};

/// Root name to the root's shared directory node.
pub type RootMap = BTreeMap<String, Arc<PathNode>>;

/// Denormalized views over the roots. Every list is sorted by path.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct LookupTables {
    pub by_filename: BTreeMap<String, Vec<Leaf>>,
    pub by_root: BTreeMap<String, Vec<Leaf>>,
    pub by_parent_folder: BTreeMap<String, Vec<Leaf>>,
    /// `by_parent_folder` as directory nodes, see [`folder_node`].
    pub folder_nodes: BTreeMap<String, Arc<PathNode>>,
}

impl LookupTables {
    pub fn derive(roots: &RootMap) -> Self {
        let mut tables = Self::default();
        for (root, node) in roots {
            let mut root_leaves = Vec::new();
            node.for_each_leaf(&mut |leaf: &Leaf| {
                root_leaves.push(leaf.clone());
                if let Some(name) = leaf.file_name() {
                    tables.by_filename.entry(name).or_default().push(leaf.clone());
                }
                if let Some(folder) = leaf.parent_folder() {
                    tables
                        .by_parent_folder
                        .entry(folder)
                        .or_default()
                        .push(leaf.clone());
                }
            });
            tables.by_root.insert(root.clone(), root_leaves);
        }
        for leaves in tables
            .by_filename
            .values_mut()
            .chain(tables.by_root.values_mut())
            .chain(tables.by_parent_folder.values_mut())
        {
            leaves.sort();
        }
        tables.folder_nodes = tables
            .by_parent_folder
            .iter()
            .map(|(folder, leaves)| (folder.clone(), Arc::new(folder_node(leaves))))
            .collect();
        tables
    }
}

/// A directory of `leaves` keyed by file name; when two leaves share a name
/// they are keyed by their absolute path instead.
pub fn folder_node(leaves: &[Leaf]) -> PathNode {
    let mut name_counts: BTreeMap<String, usize> = BTreeMap::new();
    for leaf in leaves {
        if let Some(name) = leaf.file_name() {
            *name_counts.entry(name).or_default() += 1;
        }
    }
    let mut children = BTreeMap::new();
    for leaf in leaves {
        let key = match leaf.file_name() {
            Some(name) if name_counts.get(&name) == Some(&1) => name,
            _ => leaf.path.to_string_lossy().into_owned(),
        };
        children.insert(key, PathNode::Leaf(leaf.clone()));
    }
    PathNode::Directory(children)
}

/// One consistent generation of the index.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    /// Fingerprint of the full scan this was built from. `None` once a
    /// change-driven update has patched a root.
    pub fingerprint: Option<Fingerprint>,
    pub roots: RootMap,
    pub tables: LookupTables,
    /// Unix seconds.
    pub built_at: u64,
}

impl IndexSnapshot {
    pub fn new(fingerprint: Option<Fingerprint>, state: IndexState, built_at: u64) -> Self {
        let roots = state
            .into_iter()
            .map(|(name, node)| (name, Arc::new(node)))
            .collect();
        Self::from_roots(fingerprint, roots, built_at)
    }

    /// Builds a snapshot around already shared root nodes.
    pub fn from_roots(fingerprint: Option<Fingerprint>, roots: RootMap, built_at: u64) -> Self {
        let tables = LookupTables::derive(&roots);
        Self {
            fingerprint,
            roots,
            tables,
            built_at,
        }
    }

    /// Every file with this exact name, across all roots.
    pub fn find_by_filename(&self, name: &str) -> Vec<Leaf> {
        self.tables
            .by_filename
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn find_by_root(&self, root: &str) -> Option<Arc<PathNode>> {
        self.roots.get(root).cloned()
    }

    /// A directory of every file whose parent folder has this name.
    pub fn find_by_parent_folder(&self, folder: &str) -> Option<Arc<PathNode>> {
        self.tables.folder_nodes.get(folder).cloned()
    }

    pub fn leaves_in_root(&self, root: &str) -> &[Leaf] {
        self.tables
            .by_root
            .get(root)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn leaves_in_folder(&self, folder: &str) -> &[Leaf] {
        self.tables
            .by_parent_folder
            .get(folder)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn root_names(&self) -> Vec<String> {
        self.roots.keys().cloned().collect()
    }

    pub fn leaf_count(&self) -> usize {
        self.tables.by_root.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// The current snapshot, shared between the scheduler and readers.
#[derive(Debug, Default)]
pub struct SharedIndex {
    current: RwLock<Arc<IndexSnapshot>>,
}

impl SharedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// The snapshot at the time of the call. Later swaps don't affect it.
    pub fn current(&self) -> Arc<IndexSnapshot> {
        self.current.read().clone()
    }

    /// Replaces the current snapshot wholesale.
    pub(crate) fn publish(&self, snapshot: IndexSnapshot) -> Arc<IndexSnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.current.write() = snapshot.clone();
        snapshot
    }

    pub fn find_by_filename(&self, name: &str) -> Vec<Leaf> {
        self.current().find_by_filename(name)
    }

    pub fn find_by_root(&self, root: &str) -> Option<Arc<PathNode>> {
        self.current().find_by_root(root)
    }

    pub fn find_by_parent_folder(&self, folder: &str) -> Option<Arc<PathNode>> {
        self.current().find_by_parent_folder(folder)
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.current().fingerprint
    }
}
