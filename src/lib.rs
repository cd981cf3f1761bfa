//! # APE
//!
//! Model-based GUI exploration with adaptive state abstraction.
//!
//! This crate re-exports the workspace members:
//!
//! - [`common`]: UI trees, action types, errors
//! - [`naming`]: namers, the naming lattice and naming trees
//! - [`model`]: the GUI state/transition graph and its refinement controller
//! - [`agent`]: exploration policies and the step loop

pub use ape_agent as agent;
pub use ape_common as common;
pub use ape_model as model;
pub use ape_naming as naming;

pub use ape_agent::{ApeAgent, ApeConfig, Explorer};
pub use ape_common::{ApeError, Result, UiTree};
pub use ape_model::{Graph, Model};
