//! Naming assignment
//!
//! Every tree starts from the base naming and follows refinement edges: an
//! edge `naming -(state key)-> child` says that trees whose key under
//! `naming` is `state key` are named by `child`. Refinement adds an edge,
//! abstraction removes the edges up to the target ancestor, replacement
//! swaps a leaf for its sibling.

use std::collections::HashMap;
use std::sync::Arc;

use ape_common::{NamingError, Result, TreeId};
use ape_naming::{BaseNaming, NamerLattice, NamingId, NamingResult, NamingTree};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::state_key::StateKey;
use crate::tree::GuiTree;

/// The namer lattice and the naming tree, evaluated together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingContext {
    pub lattice: NamerLattice,
    pub namings: NamingTree,
}

impl NamingContext {
    pub fn new(use_ancestor: bool, use_patch: bool, base: BaseNaming) -> Result<Self> {
        let lattice = NamerLattice::new(use_ancestor, use_patch)?;
        let namings = NamingTree::new(&lattice, base)?;
        Ok(Self { lattice, namings })
    }

    pub fn result(&mut self, naming: NamingId, tree: &GuiTree) -> Result<Arc<NamingResult>> {
        self.namings
            .naming_result(&mut self.lattice, naming, tree.id, tree.ui())
    }

    pub fn state_key(&mut self, naming: NamingId, tree: &GuiTree) -> Result<StateKey> {
        let result = self.result(naming, tree)?;
        Ok(StateKey::from_result(tree.activity(), naming, &result))
    }

    pub fn release(&mut self, tree: TreeId) {
        self.namings.release(tree);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateNamingManager {
    tree_to_naming: HashMap<TreeId, NamingId>,
    edges: HashMap<NamingId, HashMap<StateKey, NamingId>>,
    version: u32,
}

impl StateNamingManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumped on every update
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Naming assigned to `tree`, walking the edges on first request
    pub fn get_naming(&mut self, ctx: &mut NamingContext, tree: &GuiTree) -> Result<NamingId> {
        if let Some(naming) = self.tree_to_naming.get(&tree.id) {
            return Ok(*naming);
        }
        let naming = self.walk(ctx, tree)?;
        self.tree_to_naming.insert(tree.id, naming);
        Ok(naming)
    }

    fn walk(&self, ctx: &mut NamingContext, tree: &GuiTree) -> Result<NamingId> {
        let mut source = ctx.namings.base();
        loop {
            let Some(edges) = self.edges.get(&source) else {
                return Ok(source);
            };
            let key = ctx.state_key(source, tree)?;
            match edges.get(&key) {
                Some(target) => source = *target,
                None => return Ok(source),
            }
        }
    }

    pub fn is_leaf(&self, naming: NamingId) -> bool {
        self.edges.get(&naming).map_or(true, |e| e.is_empty())
    }

    /// Assign `new` to `tree`, whose current naming is `tree.naming()`.
    /// On error the assignment and the edges are left untouched.
    #[instrument(level = "debug", skip(self, ctx, tree), fields(tree = %tree.id))]
    pub fn update_naming(&mut self, ctx: &mut NamingContext, tree: &GuiTree, new: NamingId) -> Result<()> {
        let old = tree
            .naming()
            .ok_or_else(|| NamingError::NamingConflict(format!("tree {} has no naming", tree.id)))?;
        if old == new {
            self.commit(tree.id, new);
            return Ok(());
        }
        let existing = self.walk(ctx, tree)?;
        if existing == new {
            self.commit(tree.id, new);
            return Ok(());
        }

        if ctx.namings.parent(new) == Some(old) {
            // refinement
            let key = ctx.state_key(old, tree)?;
            if let Some(previous) = self.edges.get(&old).and_then(|e| e.get(&key)) {
                if *previous != new {
                    return Err(NamingError::NamingConflict(format!(
                        "{} already refines to {} for this key, not {}",
                        old, previous, new
                    ))
                    .into());
                }
            }
            self.edges.entry(old).or_default().insert(key, new);
        } else if ctx.namings.is_ancestor(new, old) {
            // abstraction
            let mut removals = Vec::new();
            let mut child = old;
            let mut parent = ctx.namings.parent(child);
            while let Some(p) = parent {
                let key = ctx.state_key(p, tree)?;
                let edges = self.edges.get(&p).ok_or_else(|| {
                    NamingError::NamingConflict(format!("{} has no refinement edges", p))
                })?;
                match edges.get(&key) {
                    None => {
                        return Err(NamingError::NamingConflict(format!(
                            "missing refinement edge below {}",
                            p
                        ))
                        .into())
                    }
                    Some(found) if *found != child => {
                        return Err(NamingError::NamingConflict(format!(
                            "edge below {} leads to {}, expected {}",
                            p, found, child
                        ))
                        .into())
                    }
                    _ => removals.push((p, key)),
                }
                if p == new {
                    break;
                }
                child = p;
                parent = ctx.namings.parent(child);
            }
            if parent.is_none() {
                return Err(NamingError::NamingConflict(format!("{} is not above {}", new, old)).into());
            }
            for (p, key) in removals {
                if let Some(edges) = self.edges.get_mut(&p) {
                    edges.remove(&key);
                }
            }
        } else if ctx.namings.parent(new).is_some() && ctx.namings.parent(new) == ctx.namings.parent(old) {
            // replacement
            if !self.is_leaf(new) || !self.is_leaf(old) {
                return Err(NamingError::NamingConflict(format!(
                    "only leaves can be replaced: {} -> {}",
                    old, new
                ))
                .into());
            }
            let parent = ctx
                .namings
                .parent(new)
                .ok_or_else(|| NamingError::NamingConflict(format!("{} has no parent", new)))?;
            let key = ctx.state_key(parent, tree)?;
            self.edges
                .get_mut(&parent)
                .ok_or_else(|| NamingError::NamingConflict(format!("{} has no refinement edges", parent)))?
                .insert(key, new);
        } else {
            return Err(NamingError::NamingConflict(format!(
                "cannot move a tree from {} to {}",
                old, new
            ))
            .into());
        }
        self.commit(tree.id, new);
        debug!(old = %old, new = %new, "naming updated");
        Ok(())
    }

    fn commit(&mut self, tree: TreeId, naming: NamingId) {
        self.version += 1;
        self.tree_to_naming.insert(tree, naming);
    }

    pub fn release(&mut self, tree: TreeId) {
        self.tree_to_naming.remove(&tree);
    }

    pub fn dump(&self) {
        for (naming, edges) in &self.edges {
            for (key, child) in edges {
                debug!(naming = %naming, key = %key, child = %child, "refinement edge");
            }
        }
    }
}
