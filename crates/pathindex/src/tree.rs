//! The nested path tree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One indexed file.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Leaf {
    /// Absolute filesystem path.
    pub path: PathBuf,
    /// MIME type, when classification ran and succeeded.
    pub classification: Option<String>,
}

impl Leaf {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            classification: None,
        }
    }

    pub fn with_classification(mut self, classification: Option<String>) -> Self {
        self.classification = classification;
        self
    }

    pub fn file_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    /// Base name of the directory holding this file.
    pub fn parent_folder(&self) -> Option<String> {
        self.path
            .parent()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
    }
}

/// A directory or a file in the index tree.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum PathNode {
    Directory(BTreeMap<String, PathNode>),
    Leaf(Leaf),
}

/// Root name to the root's directory node.
pub type IndexState = BTreeMap<String, PathNode>;

impl Default for PathNode {
    fn default() -> Self {
        Self::directory()
    }
}

impl PathNode {
    pub fn directory() -> Self {
        Self::Directory(BTreeMap::new())
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    pub fn children(&self) -> Option<&BTreeMap<String, PathNode>> {
        match self {
            Self::Directory(children) => Some(children),
            Self::Leaf(_) => None,
        }
    }

    /// Inserts `leaf` at `segments`, creating directories on the way.
    ///
    /// The last segment names the leaf. A segment that collides with an
    /// existing node of the other kind replaces it, so the tree always
    /// reflects the latest insert. Inserting into a leaf is a no-op.
    pub fn insert(&mut self, segments: &[String], leaf: Leaf) {
        let Some((last, parents)) = segments.split_last() else {
            return;
        };
        let mut node = self;
        for segment in parents {
            let Self::Directory(children) = node else {
                return;
            };
            let child = children
                .entry(segment.clone())
                .or_insert_with(Self::directory);
            if child.is_leaf() {
                *child = Self::directory();
            }
            node = child;
        }
        if let Self::Directory(children) = node {
            children.insert(last.clone(), Self::Leaf(leaf));
        }
    }

    /// Looks up the node at `segments` below this one.
    pub fn get(&self, segments: &[&str]) -> Option<&PathNode> {
        let mut node = self;
        for segment in segments {
            node = node.children()?.get(*segment)?;
        }
        Some(node)
    }

    /// Folds `other` into this node. Directories merge child by child; on any
    /// other pairing `other` replaces this node.
    pub fn merge(&mut self, other: PathNode) {
        match (self, other) {
            (Self::Directory(children), Self::Directory(incoming)) => {
                for (name, child) in incoming {
                    match children.get_mut(&name) {
                        Some(existing) => existing.merge(child),
                        None => {
                            children.insert(name, child);
                        }
                    }
                }
            }
            (node, other) => *node = other,
        }
    }

    /// Removes every directory without descendant leaves. Returns `true` if
    /// this node itself is now empty.
    pub fn prune(&mut self) -> bool {
        match self {
            Self::Leaf(_) => false,
            Self::Directory(children) => {
                children.retain(|_, child| !child.prune());
                children.is_empty()
            }
        }
    }

    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::Directory(children) => children.values().map(PathNode::leaf_count).sum(),
        }
    }

    /// Visits every leaf depth-first in key order.
    pub fn for_each_leaf<'a>(&'a self, visit: &mut impl FnMut(&'a Leaf)) {
        match self {
            Self::Leaf(leaf) => visit(leaf),
            Self::Directory(children) => {
                for child in children.values() {
                    child.for_each_leaf(visit);
                }
            }
        }
    }

    pub fn leaves(&self) -> Vec<&Leaf> {
        let mut leaves = Vec::new();
        self.for_each_leaf(&mut |leaf| leaves.push(leaf));
        leaves
    }
}

/// Drops empty directories and roots whose node has no leaves left.
pub fn prune_state(state: &mut IndexState) {
    state.retain(|_, node| !node.prune());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segs(path: &str) -> Vec<String> {
        path.split('/').map(str::to_string).collect()
    }

    #[test]
    fn insert_builds_nested_directories() {
        let mut root = PathNode::directory();
        root.insert(&segs("2023/summer/a.jpg"), Leaf::new("/p/2023/summer/a.jpg"));
        root.insert(&segs("b.jpg"), Leaf::new("/p/b.jpg"));

        assert_eq!(root.leaf_count(), 2);
        let leaf = root.get(&["2023", "summer", "a.jpg"]).unwrap();
        assert_eq!(leaf, &PathNode::Leaf(Leaf::new("/p/2023/summer/a.jpg")));
        assert!(root.get(&["2023"]).unwrap().children().is_some());
        assert!(root.get(&["missing"]).is_none());
    }

    #[test]
    fn prune_removes_empty_directories_only() {
        let mut root = PathNode::directory();
        root.insert(&segs("keep/a.txt"), Leaf::new("/r/keep/a.txt"));
        if let PathNode::Directory(children) = &mut root {
            children.insert("empty".into(), PathNode::directory());
            let mut nested = PathNode::directory();
            if let PathNode::Directory(inner) = &mut nested {
                inner.insert("deeper".into(), PathNode::directory());
            }
            children.insert("nested".into(), nested);
        }

        assert!(!root.prune());
        let children = root.children().unwrap();
        assert_eq!(children.keys().collect::<Vec<_>>(), vec!["keep"]);
    }

    #[test]
    fn prune_state_drops_empty_roots() {
        let mut state = IndexState::new();
        let mut photos = PathNode::directory();
        photos.insert(&segs("a.jpg"), Leaf::new("/media/photos/a.jpg"));
        state.insert("photos".into(), photos);
        state.insert("empty".into(), PathNode::directory());

        prune_state(&mut state);
        assert_eq!(state.keys().collect::<Vec<_>>(), vec!["photos"]);
    }

    #[test]
    fn merge_combines_directories_and_replaces_leaves() {
        let mut left = PathNode::directory();
        left.insert(&segs("2023/a.jpg"), Leaf::new("/l/2023/a.jpg"));
        left.insert(&segs("b.jpg"), Leaf::new("/l/b.jpg"));
        let mut right = PathNode::directory();
        right.insert(&segs("2023/c.jpg"), Leaf::new("/r/2023/c.jpg"));
        right.insert(&segs("b.jpg"), Leaf::new("/r/b.jpg"));

        left.merge(right);
        assert_eq!(left.leaf_count(), 3);
        assert!(left.get(&["2023", "a.jpg"]).is_some());
        assert!(left.get(&["2023", "c.jpg"]).is_some());
        assert_eq!(left.get(&["b.jpg"]), Some(&PathNode::Leaf(Leaf::new("/r/b.jpg"))));
    }

    #[test]
    fn leaf_names() {
        let leaf = Leaf::new("/media/photos/2023/a.jpg");
        assert_eq!(leaf.file_name().as_deref(), Some("a.jpg"));
        assert_eq!(leaf.parent_folder().as_deref(), Some("2023"));
    }

    #[test]
    fn leaves_are_visited_in_key_order() {
        let mut root = PathNode::directory();
        root.insert(&segs("b/z.txt"), Leaf::new("/r/b/z.txt"));
        root.insert(&segs("a.txt"), Leaf::new("/r/a.txt"));
        let paths: Vec<_> = root.leaves().iter().map(|leaf| leaf.path.clone()).collect();
        assert_eq!(
            paths,
            vec![PathBuf::from("/r/a.txt"), PathBuf::from("/r/b/z.txt")]
        );
    }
}
