//! Observed trees and tree transitions
//!
//! Every snapshot the agent observes becomes a [`GuiTree`]: the immutable
//! UI tree plus the naming currently assigned to it, the naming result under
//! that naming and the state it resolved to. Executed actions link trees
//! into [`GuiTreeTransition`]s, the concrete evidence behind every edge of
//! the graph.

use std::sync::Arc;

use ape_common::{ActionType, GraphError, NodeId, Result, TreeId, UiTree};
use ape_naming::{NameId, NamingId, NamingResult};
use serde::{Deserialize, Serialize};

use crate::action::ActionId;
use crate::state::StateId;
use crate::transition::TransitionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreeTransitionId(pub u32);

impl TreeTransitionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuiTree {
    pub id: TreeId,
    /// Agent step at which the tree was observed
    pub timestamp: u64,
    ui: UiTree,
    naming: Option<NamingId>,
    state: Option<StateId>,
    #[serde(skip)]
    result: Option<Arc<NamingResult>>,
}

impl GuiTree {
    pub fn ui(&self) -> &UiTree {
        &self.ui
    }

    pub fn activity(&self) -> &str {
        self.ui.activity()
    }

    pub fn naming(&self) -> Option<NamingId> {
        self.naming
    }

    pub fn state(&self) -> Option<StateId> {
        self.state
    }

    pub fn result(&self) -> Option<&Arc<NamingResult>> {
        self.result.as_ref()
    }

    pub fn set_naming(&mut self, naming: NamingId, result: Arc<NamingResult>) {
        self.naming = Some(naming);
        self.result = Some(result);
    }

    pub fn set_state(&mut self, state: StateId) {
        self.state = Some(state);
    }

    pub fn name_of(&self, node: NodeId) -> Option<NameId> {
        self.result.as_ref().and_then(|r| r.name_of(node))
    }

    /// Nodes named `name` under the current naming
    pub fn nodes_of(&self, name: NameId) -> &[NodeId] {
        match &self.result {
            Some(r) => r.nodes_of(name),
            None => &[],
        }
    }
}

/// The concrete side of an executed action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeAction {
    pub action_type: ActionType,
    /// Node of the source tree the action was performed on
    pub node: Option<NodeId>,
    pub model_action: ActionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuiTreeTransition {
    pub id: TreeTransitionId,
    pub source: TreeId,
    pub action: TreeAction,
    pub target: TreeId,
    pub throttle: u32,
    /// Timestamp of the source tree
    pub timestamp: u64,
    pub state_transition: Option<TransitionId>,
}

/// Append-only store of trees and tree transitions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeStore {
    trees: Vec<GuiTree>,
    transitions: Vec<GuiTreeTransition>,
}

impl TreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ui: UiTree, timestamp: u64) -> TreeId {
        let id = TreeId(self.trees.len() as u32);
        self.trees.push(GuiTree {
            id,
            timestamp,
            ui,
            naming: None,
            state: None,
            result: None,
        });
        id
    }

    pub fn get(&self, id: TreeId) -> Result<&GuiTree> {
        self.trees
            .get(id.0 as usize)
            .ok_or_else(|| GraphError::UnknownTree(id.0).into())
    }

    pub fn get_mut(&mut self, id: TreeId) -> Result<&mut GuiTree> {
        self.trees
            .get_mut(id.0 as usize)
            .ok_or_else(|| GraphError::UnknownTree(id.0).into())
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GuiTree> {
        self.trees.iter()
    }

    pub fn add_transition(
        &mut self,
        source: TreeId,
        action: TreeAction,
        target: TreeId,
        throttle: u32,
    ) -> Result<TreeTransitionId> {
        let timestamp = self.get(source)?.timestamp;
        self.get(target)?;
        let id = TreeTransitionId(self.transitions.len() as u32);
        self.transitions.push(GuiTreeTransition {
            id,
            source,
            action,
            target,
            throttle,
            timestamp,
            state_transition: None,
        });
        Ok(id)
    }

    pub fn transition(&self, id: TreeTransitionId) -> Result<&GuiTreeTransition> {
        self.transitions.get(id.index()).ok_or_else(|| {
            GraphError::InvalidTransition(format!("unknown tree transition {}", id.0)).into()
        })
    }

    pub fn transition_mut(&mut self, id: TreeTransitionId) -> Result<&mut GuiTreeTransition> {
        self.transitions.get_mut(id.index()).ok_or_else(|| {
            GraphError::InvalidTransition(format!("unknown tree transition {}", id.0)).into()
        })
    }

    pub fn transitions(&self) -> &[GuiTreeTransition] {
        &self.transitions
    }
}
