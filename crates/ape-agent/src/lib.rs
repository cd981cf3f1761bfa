//! # APE Agent
//!
//! Drives a model-based exploration of an Android app: takes UI snapshots,
//! keeps the GSTG up to date and picks the next action.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐ snapshot ┌───────────────────────────────┐ action ┌──────────┐
//! │ SnapshotSource │ ───────> │ ApeAgent                      │ ─────> │  Device  │
//! └────────────────┘          │  ├─ StatefulAgent (model)     │        └──────────┘
//!         ^                   │  └─ Strategy (sata/random/    │             │
//!         │                   │               replay)         │             │
//!         │                   └───────────────────────────────┘             │
//!         │                                  ^                              │
//!         └──────────────────────── Explorer (loop, log, screenshots) ──────┘
//! ```
//!
//! - [`Explorer`]: the step loop with void-tree handling and fuzzing
//! - [`ApeAgent`]: restarts, text input and bad-state recovery
//! - [`StatefulAgent`]: model maintenance shared by every strategy
//! - [`ActionLogWriter`]: the replayable action log

pub mod action_log;
pub mod agent;
pub mod config;
pub mod device;
pub mod fuzzer;
pub mod image_queue;
pub mod runner;

#[cfg(test)]
mod testing;

pub use action_log::{read_action_log, ActionLogWriter, LogEntry};
pub use agent::{
    Agent, AgentEvent, ApeAgent, RandomStrategy, ReplayStrategy, SataStrategy, Selection, StatefulAgent, StepPhase,
    Strategy,
};
pub use config::{AgentKind, AgentSettings, ApeConfig, IoSettings, NamingSettings};
pub use device::{Component, CrashReport, Device, DirectorySource, DryRunDevice, SnapshotSource};
pub use image_queue::ImageWriterQueue;
pub use runner::{Explorer, RunSummary};
