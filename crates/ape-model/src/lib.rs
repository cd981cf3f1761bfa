//! # APE Model
//!
//! The GUI state/transition graph (GSTG) and the machinery that keeps its
//! abstraction level right.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  naming   ┌───────────────────┐   keys   ┌──────────┐
//! │  TreeStore   │ ────────> │ StateNamingManager│ ───────> │  Graph   │
//! │ (snapshots)  │           │ (per-tree naming) │          │ (states) │
//! └──────────────┘           └───────────────────┘          └──────────┘
//!        ^                            ^                          │
//!        │        rebuild             │ update_naming            │ edges
//!        └────────────────── ┌────────────────┐ <────────────────┘
//!                            │   Controller   │
//!                            │ (refine/abstr) │
//!                            └────────────────┘
//! ```
//!
//! - [`Model`]: owns trees, namings and the graph; rebuilds after naming changes
//! - [`Graph`]: arena of states, actions and transitions with path search
//! - [`Controller`]: refinement and abstraction searches guarded by predicates
//! - [`ModelSnapshot`]: bincode persistence of a whole run

pub mod action;
pub mod activity;
pub mod config;
pub mod controller;
pub mod differ;
pub mod filter;
pub mod graph;
pub mod model;
pub mod naming_manager;
pub mod snapshot;
pub mod state;
pub mod state_key;
pub mod subsequence;
pub mod transition;
pub mod tree;
pub mod visit;

#[cfg(test)]
mod testing;

pub use action::{
    Action, ActionFilter, ActionId, ActionPayload, ActionPredicate, FuzzEvent, ModelAction, ModelPayload,
    Resolution,
};
pub use activity::ActivityNode;
pub use config::ModelConfig;
pub use controller::{Controller, Predicate, PredicateKind};
pub use filter::{FnFilter, SubsequenceFilter};
pub use graph::Graph;
pub use model::{ActionRecord, Model, ModelEvent};
pub use naming_manager::{NamingContext, StateNamingManager};
pub use snapshot::ModelSnapshot;
pub use state::{State, StateId};
pub use state_key::StateKey;
pub use subsequence::{PathStep, Subsequence};
pub use transition::{StateTransition, TransitionId, VisitKind};
pub use tree::{GuiTree, GuiTreeTransition, TreeAction, TreeStore, TreeTransitionId};
pub use visit::VisitStats;
