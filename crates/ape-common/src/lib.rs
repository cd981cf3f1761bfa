//! # APE Common
//!
//! Shared types and errors for the APE exploration engine.
//!
//! ## Core Types
//!
//! - [`UiTree`]: arena-backed snapshot of a concrete UI tree
//! - [`ActionType`]: kinds of executable actions and their priorities
//! - [`ApeError`]: unified error type with naming, graph and agent domains

pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{AgentError, ApeError, GraphError, NamingError, Result};
pub use types::{
    action_type::ActionType,
    ui_tree::{
        is_edit_text, NodeId, RawNode, RawSnapshot, Rect, ScrollType, TreeId, TreeOptions, UiNode,
        UiTree,
    },
};

/// APE version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Upper bound of the priority bonus for aliased actions
pub const MAX_EXTRA_PRIORITY_ALIASED_ACTIONS: i32 = 5;

/// Priority bonus for unvisited targeted actions
pub const UNVISITED_TARGETED_PRIORITY: i32 = 20;

/// Priority bonus for unvisited untargeted actions
pub const UNVISITED_UNTARGETED_PRIORITY: i32 = 5;

/// Priority adjustment contributed by an outgoing edge
pub const EDGE_PRIORITY_ADJUSTMENT: i32 = 10;

/// Upper bound on states returned by a state-abstraction check
pub const MAX_ABSTRACTION_STATES: usize = 8;

/// Upper bound on the state-count threshold used during refinement
pub const MAX_REFINEMENT_STATES: usize = 8;
