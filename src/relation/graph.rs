//! Wait-for graph used to detect identifiers that transitively await
//! themselves.

use std::collections::{HashMap, HashSet};

use crate::record::Identifier;

/// Directed edges `owner -> awaited identifier` for records currently
/// suspended.
#[derive(Debug, Default)]
pub(crate) struct WaitGraph {
    edges: HashMap<Identifier, Vec<Identifier>>,
}

impl WaitGraph {
    /// Returns the cycle `owner -> .. -> owner` that awaiting `deps` would
    /// close, if any.
    pub(crate) fn cycle_through(&self, owner: &Identifier, deps: &[Identifier]) -> Option<Vec<Identifier>> {
        for dep in deps {
            if let Some(mut path) = self.path(dep, owner) {
                path.insert(0, owner.clone());
                return Some(path);
            }
        }
        None
    }

    /// Depth-first search for a path `from -> .. -> to`, both ends included.
    fn path(&self, from: &Identifier, to: &Identifier) -> Option<Vec<Identifier>> {
        let mut visited = HashSet::new();
        let mut stack = vec![(from, 0usize)];
        let mut path: Vec<&Identifier> = Vec::new();

        while let Some((node, depth)) = stack.pop() {
            path.truncate(depth);
            path.push(node);
            if node == to {
                return Some(path.into_iter().cloned().collect());
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(next) = self.edges.get(node) {
                stack.extend(next.iter().map(|n| (n, depth + 1)));
            }
        }
        None
    }

    pub(crate) fn add(&mut self, owner: Identifier, deps: impl IntoIterator<Item = Identifier>) {
        let entry = self.edges.entry(owner).or_default();
        for dep in deps {
            if !entry.contains(&dep) {
                entry.push(dep);
            }
        }
    }

    pub(crate) fn remove(&mut self, owner: &Identifier) {
        self.edges.remove(owner);
    }
}
