//! Paths over the graph

use serde::{Deserialize, Serialize};

use crate::action::ActionId;
use crate::state::StateId;
use crate::transition::{StateTransition, TransitionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathStep {
    pub edge: TransitionId,
    pub action: ActionId,
    pub target: StateId,
}

/// A path starting at `start`; a closed path is no longer extended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subsequence {
    pub start: StateId,
    steps: Vec<PathStep>,
    closed: bool,
}

impl Subsequence {
    pub fn new(start: StateId) -> Self {
        Self {
            start,
            steps: Vec::new(),
            closed: false,
        }
    }

    /// Copy of `self` followed by `edge`
    pub fn extended(&self, edge: &StateTransition) -> Self {
        let mut steps = self.steps.clone();
        steps.push(PathStep {
            edge: edge.id,
            action: edge.action,
            target: edge.target,
        });
        Self {
            start: self.start,
            steps,
            closed: false,
        }
    }

    pub fn from_edges(edges: &[&StateTransition]) -> Option<Self> {
        let first = edges.first()?;
        let mut path = Self::new(first.source);
        for edge in edges {
            path = path.extended(edge);
        }
        Some(path)
    }

    /// The first `len` steps of this path
    pub fn truncated(&self, len: usize) -> Self {
        Self {
            start: self.start,
            steps: self.steps.iter().take(len).copied().collect(),
            closed: self.closed,
        }
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[PathStep] {
        &self.steps
    }

    pub fn edges(&self) -> impl Iterator<Item = TransitionId> + '_ {
        self.steps.iter().map(|s| s.edge)
    }

    pub fn last_state(&self) -> StateId {
        self.steps.last().map(|s| s.target).unwrap_or(self.start)
    }

    pub fn last_last_state(&self) -> StateId {
        match self.steps.len() {
            0 | 1 => self.start,
            n => self.steps[n - 2].target,
        }
    }

    pub fn first_action(&self) -> Option<ActionId> {
        self.steps.first().map(|s| s.action)
    }

    pub fn contains_state(&self, state: StateId) -> bool {
        self.start == state || self.steps.iter().any(|s| s.target == state)
    }

    pub fn contains_action(&self, action: ActionId) -> bool {
        self.steps.iter().any(|s| s.action == action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transition::VisitKind;

    fn edge(id: u32, source: u32, target: u32) -> StateTransition {
        StateTransition::new(
            TransitionId(id),
            format!("e{}", id),
            StateId(source),
            ActionId {
                state: StateId(source),
                index: id,
            },
            StateId(target),
            VisitKind::NewAction,
        )
    }

    #[test]
    fn test_path_accessors() {
        let path = Subsequence::new(StateId(0));
        assert_eq!(path.last_state(), StateId(0));
        assert_eq!(path.first_action(), None);

        let path = path.extended(&edge(1, 0, 1));
        assert_eq!(path.last_last_state(), StateId(0));
        let path = path.extended(&edge(2, 1, 2));
        assert_eq!(path.last_state(), StateId(2));
        assert_eq!(path.last_last_state(), StateId(1));
        assert!(path.contains_state(StateId(1)));
        assert!(!path.contains_state(StateId(7)));
        assert_eq!(path.first_action().map(|a| a.index), Some(1));
        assert_eq!(path.len(), 2);

        let head = path.truncated(1);
        assert_eq!(head.len(), 1);
        assert_eq!(head.last_state(), StateId(1));
    }
}
