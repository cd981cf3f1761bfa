//! Naming results
//!
//! The outcome of applying one naming to one tree: the name and namelet of
//! every node, and the inverse index from names to nodes.

use ape_common::NodeId;
use serde::{Deserialize, Serialize};

use crate::name::NameId;
use crate::naming::NameletId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamingResult {
    node_names: Vec<NameId>,
    node_namelets: Vec<NameletId>,
    /// Sorted, unique
    names: Vec<NameId>,
    /// Aligned with `names`
    nodes: Vec<Vec<NodeId>>,
}

impl NamingResult {
    /// Build from per-node assignments indexed by [`NodeId`]
    pub fn new(node_names: Vec<NameId>, node_namelets: Vec<NameletId>) -> Self {
        let mut pairs: Vec<(NameId, NodeId)> = node_names
            .iter()
            .enumerate()
            .map(|(i, name)| (*name, NodeId(i as u32)))
            .collect();
        pairs.sort();

        let mut names: Vec<NameId> = Vec::new();
        let mut nodes: Vec<Vec<NodeId>> = Vec::new();
        for (name, node) in pairs {
            if names.last() == Some(&name) {
                if let Some(group) = nodes.last_mut() {
                    group.push(node);
                }
            } else {
                names.push(name);
                nodes.push(vec![node]);
            }
        }

        Self {
            node_names,
            node_namelets,
            names,
            nodes,
        }
    }

    pub fn names(&self) -> &[NameId] {
        &self.names
    }

    pub fn name_count(&self) -> usize {
        self.names.len()
    }

    pub fn node_count(&self) -> usize {
        self.node_names.len()
    }

    pub fn name_of(&self, node: NodeId) -> Option<NameId> {
        self.node_names.get(node.index()).copied()
    }

    pub fn namelet_of(&self, node: NodeId) -> Option<NameletId> {
        self.node_namelets.get(node.index()).copied()
    }

    pub fn contains(&self, name: NameId) -> bool {
        self.names.binary_search(&name).is_ok()
    }

    /// Nodes carrying `name`, in node order
    pub fn nodes_of(&self, name: NameId) -> &[NodeId] {
        match self.names.binary_search(&name) {
            Ok(i) => &self.nodes[i],
            Err(_) => &[],
        }
    }

    /// Namelets that produced `name`, deduplicated
    pub fn namelets_of(&self, name: NameId) -> Vec<NameletId> {
        let mut out: Vec<NameletId> = self
            .nodes_of(name)
            .iter()
            .filter_map(|n| self.namelet_of(*n))
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Iterate `(name, nodes)` groups in name order
    pub fn groups(&self) -> impl Iterator<Item = (NameId, &[NodeId])> {
        self.names
            .iter()
            .copied()
            .zip(self.nodes.iter().map(|v| v.as_slice()))
    }
}
