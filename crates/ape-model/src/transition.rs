//! State transitions

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::action::ActionId;
use crate::state::StateId;
use crate::tree::TreeTransitionId;
use crate::visit::VisitStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransitionId(pub u32);

impl TransitionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TransitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// How the latest visit related to the edges already known for the action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisitKind {
    /// First out-edge of the action
    NewAction,
    /// The action already led elsewhere
    NewActionTarget,
    Existing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub id: TransitionId,
    pub label: String,
    pub source: StateId,
    pub action: ActionId,
    pub target: StateId,
    pub kind: VisitKind,
    pub hits: u32,
    pub misses: u32,
    pub throttle: u32,
    pub visits: VisitStats,
    pub(crate) trees: Vec<TreeTransitionId>,
}

impl StateTransition {
    pub(crate) fn new(
        id: TransitionId,
        label: String,
        source: StateId,
        action: ActionId,
        target: StateId,
        kind: VisitKind,
    ) -> Self {
        Self {
            id,
            label,
            source,
            action,
            target,
            kind,
            hits: 0,
            misses: 0,
            throttle: u32::MAX,
            visits: VisitStats::default(),
            trees: Vec::new(),
        }
    }

    pub fn strengthen(&mut self) {
        self.hits += 1;
    }

    pub fn weaken(&mut self) {
        self.misses += 1;
    }

    pub fn strength(&self) -> i64 {
        self.hits as i64 - self.misses as i64
    }

    pub fn is_strong(&self) -> bool {
        if self.misses == 0 {
            return self.hits >= 1;
        }
        self.strength() >= 2
    }

    pub fn is_circle(&self) -> bool {
        self.source == self.target
    }

    pub fn update_throttle(&mut self, throttle: u32) {
        self.throttle = self.throttle.min(throttle);
    }

    pub fn tree_transitions(&self) -> &[TreeTransitionId] {
        &self.trees
    }

    pub fn last_tree_transition(&self) -> Option<TreeTransitionId> {
        self.trees.last().copied()
    }
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@[H({}),M({})] {} =[{}]=> {}",
            self.label, self.hits, self.misses, self.source, self.action, self.target
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn edge() -> StateTransition {
        StateTransition::new(
            TransitionId(0),
            "g0e0".into(),
            StateId(0),
            ActionId {
                state: StateId(0),
                index: 0,
            },
            StateId(1),
            VisitKind::NewAction,
        )
    }

    #[test]
    fn test_strength() {
        let mut e = edge();
        assert!(!e.is_strong());
        e.strengthen();
        assert!(e.is_strong());
        e.weaken();
        assert!(!e.is_strong());
        e.strengthen();
        e.strengthen();
        assert_eq!(e.strength(), 2);
        assert!(e.is_strong());
    }

    #[test]
    fn test_throttle_keeps_minimum() {
        let mut e = edge();
        e.update_throttle(300);
        e.update_throttle(500);
        assert_eq!(e.throttle, 300);
    }

    proptest! {
        #[test]
        fn prop_strength_is_hits_minus_misses(hits in 0u32..50, misses in 0u32..50) {
            let mut e = edge();
            for _ in 0..hits { e.strengthen(); }
            for _ in 0..misses { e.weaken(); }
            prop_assert_eq!(e.strength(), hits as i64 - misses as i64);
            let expected = (misses == 0 && hits >= 1) || hits as i64 - misses as i64 >= 2;
            prop_assert_eq!(e.is_strong(), expected);
        }
    }
}
