//! Document views: observers notified of every item operation, plus a
//! ready-made tree projection of the current path set.

use crate::format::entry::Operator;
use std::collections::BTreeMap;

/// Observer of item operations on a document.
///
/// Registered views receive one `update` per operation, both for edits
/// staged through the API and for the replay performed at registration
/// time.
pub trait View {
    fn update(&mut self, path: &str, operator: Operator);
}

#[derive(Debug, Default)]
struct TreeNode {
    children: BTreeMap<String, TreeNode>,
    is_item: bool,
}

impl TreeNode {
    fn insert(&mut self, segments: &[&str]) {
        match segments.split_first() {
            None => self.is_item = true,
            Some((head, rest)) => self
                .children
                .entry((*head).to_string())
                .or_default()
                .insert(rest),
        }
    }

    /// Remove the item at `segments`, pruning directories left empty.
    /// Returns whether this node itself became removable.
    fn remove(&mut self, segments: &[&str]) -> bool {
        match segments.split_first() {
            None => {
                self.is_item = false;
            }
            Some((head, rest)) => {
                if let Some(child) = self.children.get_mut(*head) {
                    if child.remove(rest) {
                        self.children.remove(*head);
                    }
                }
            }
        }
        !self.is_item && self.children.is_empty()
    }

    fn find(&self, segments: &[&str]) -> Option<&TreeNode> {
        match segments.split_first() {
            None => Some(self),
            Some((head, rest)) => self.children.get(*head)?.find(rest),
        }
    }

    fn collect(&self, prefix: &str, out: &mut Vec<String>) {
        for (name, child) in &self.children {
            let path = format!("{prefix}\\{name}");
            if child.is_item {
                out.push(path.clone());
            }
            child.collect(&path, out);
        }
    }
}

/// A live directory-tree projection of a document's item paths
#[derive(Debug, Default)]
pub struct TreeView {
    root: TreeNode,
}

impl TreeView {
    pub fn new() -> Self {
        Self::default()
    }

    fn segments(path: &str) -> Vec<&str> {
        path.split(['\\', '/']).filter(|s| !s.is_empty()).collect()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.root
            .find(&Self::segments(path))
            .map(|node| node.is_item)
            .unwrap_or(false)
    }

    /// Child names directly under `dir` ("" or "\\" for the root)
    pub fn children(&self, dir: &str) -> Vec<String> {
        self.root
            .find(&Self::segments(dir))
            .map(|node| node.children.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// All item paths, sorted, with `\` separators
    pub fn item_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.root.collect("", &mut out);
        out
    }
}

impl View for TreeView {
    fn update(&mut self, path: &str, operator: Operator) {
        let segments = Self::segments(path);
        match operator {
            Operator::New => self.root.insert(&segments),
            Operator::Delete => {
                self.root.remove(&segments);
            }
            Operator::Append | Operator::Replace => {}
        }
    }
}
