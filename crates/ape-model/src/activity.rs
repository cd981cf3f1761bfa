//! Activity nodes
//!
//! Groups the states of one activity and tracks how often the activity was
//! visited.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::state::StateId;
use crate::visit::VisitStats;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityNode {
    pub activity: String,
    pub(crate) states: BTreeSet<StateId>,
    pub visits: VisitStats,
}

impl ActivityNode {
    pub fn new(activity: impl Into<String>) -> Self {
        Self {
            activity: activity.into(),
            states: BTreeSet::new(),
            visits: VisitStats::default(),
        }
    }

    pub fn states(&self) -> &BTreeSet<StateId> {
        &self.states
    }

    pub fn is_trivial(&self, state_threshold: usize, visit_threshold: u32) -> bool {
        self.states.len() < state_threshold && self.visits.count < visit_threshold
    }

    /// Ascending by visit count, then last visit, then name
    pub fn compare(&self, other: &Self) -> Ordering {
        self.visits
            .count
            .cmp(&other.visits.count)
            .then_with(|| self.visits.cmp_last_visit(&other.visits))
            .then_with(|| self.activity.cmp(&other.activity))
    }
}
