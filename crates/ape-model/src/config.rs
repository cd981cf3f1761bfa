//! Model tuning

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Try action refinement before state refinement on non-determinism
    pub action_refinement_first: bool,
    /// Resolved node count above which an action is a refinement candidate
    pub action_refinement_threshold: usize,
    pub max_initial_names_per_state: usize,
    pub trivial_state_widget_threshold: usize,
    pub trivial_state_action_threshold: usize,
    pub trivial_activity_state_threshold: usize,
    pub trivial_activity_visit_threshold: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            action_refinement_first: true,
            action_refinement_threshold: 3,
            max_initial_names_per_state: 20,
            trivial_state_widget_threshold: 5,
            trivial_state_action_threshold: 5,
            trivial_activity_state_threshold: 5,
            trivial_activity_visit_threshold: 16,
        }
    }
}
