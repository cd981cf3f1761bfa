//! Exploration agents
//!
//! [`StatefulAgent`] runs the model-maintenance part of every step; a
//! [`Strategy`] decides which action to take once the model is up to date.
//! [`ApeAgent`] wraps both with restarts, text input and bad-state recovery.

pub mod random;
pub mod replay;
pub mod sata;
pub mod stateful;
pub mod supervisor;

use std::path::Path;

use ape_common::{Result, UiTree};
use ape_model::{Action, ActionId, Model};
use serde::{Deserialize, Serialize};

use crate::device::{Device, SnapshotSource};

pub use random::RandomStrategy;
pub use replay::ReplayStrategy;
pub use sata::SataStrategy;
pub use stateful::{StatefulAgent, StepPhase};
pub use supervisor::ApeAgent;

/// Outcome of action selection
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// An action of the new state
    Model(ActionId),
    /// Anything else; the trace restarts
    Other(Action),
}

/// Why an action was chosen, counted over a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AgentEvent {
    UseBuffer,
    FillBuffer,
    BufferLoss,
    EarlyStage,
    TrivialActivity,
    EpsilonGreedy,
    Random,
    Null,
    BadState,
    Replay,
    Restart,
    Fuzzing,
}

/// Selection policy plugged into [`StatefulAgent::step`]
pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    /// Pick an action for the new state; the model is already evolved and
    /// every action of the new state is validated
    fn select(&mut self, agent: &mut StatefulAgent, source: &mut dyn SnapshotSource) -> Result<Selection>;

    /// Whether stable counters may request a restart
    fn restarts_on_stability(&self) -> bool {
        true
    }

    /// Whether the supervisor may inject fuzzing
    fn allows_fuzzing(&self) -> bool {
        true
    }
}

/// What the runner drives
pub trait Agent {
    fn name(&self) -> &'static str;

    /// Digest a snapshot and return the next action to perform
    fn update_state(
        &mut self,
        ui: UiTree,
        source: &mut dyn SnapshotSource,
        device: &mut dyn Device,
    ) -> Result<Action>;

    fn can_fuzz(&self) -> bool;

    fn generate_fuzzing_action(&mut self) -> Action;

    fn on_app_started(&mut self, clean: bool);

    fn on_activity_stopped(&mut self);

    fn start_new_episode(&mut self);

    /// Append an executed action to the history
    fn record(&mut self, clock_timestamp: i64, action: Action);

    fn model(&self) -> &Model;

    /// Write the graph and model snapshot into `dir`
    fn save(&self, dir: &Path) -> Result<()>;

    fn tear_down(&mut self);
}
