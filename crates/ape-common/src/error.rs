//! Error types for the exploration engine
//!
//! Provides a unified error type and domain-specific error variants

use thiserror::Error;

/// Result type alias using ApeError
pub type Result<T> = std::result::Result<T, ApeError>;

/// Unified error type for exploration operations
#[derive(Debug, Error)]
pub enum ApeError {
    // Naming errors
    #[error("Naming error: {0}")]
    Naming(#[from] NamingError),

    // Graph errors
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    // Agent errors
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    /// No valid action exists on the current state, or resolution failed
    #[error("Bad state: {0}")]
    BadState(String),

    /// Terminates the exploration loop
    #[error("Stop testing: {0}")]
    StopTesting(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApeError {
    /// Whether this error should end the exploration run
    pub fn is_fatal(&self) -> bool {
        matches!(self, ApeError::StopTesting(_))
    }

    /// Whether this error is the recoverable bad-state condition
    pub fn is_bad_state(&self) -> bool {
        matches!(self, ApeError::BadState(_))
    }
}

/// Naming lattice and naming tree errors
#[derive(Debug, Error)]
pub enum NamingError {
    #[error("Incomplete namer lattice: {0}")]
    IncompleteLattice(String),

    #[error("Duplicate namer for types {0}")]
    DuplicateNamer(String),

    #[error("No namer for types {0}")]
    UnknownNamer(String),

    #[error("Invalid selector `{expr}`: {reason}")]
    Selector { expr: String, reason: String },

    #[error("No namelet applies to node {node}")]
    NoNamelet { node: u32 },

    #[error("Ambiguous namelets for node {node}")]
    AmbiguousNamelet { node: u32 },

    #[error("Namelet does not belong to naming {naming}")]
    NotContained { naming: u32 },

    #[error("Namer does not refine the parent namelet's namer")]
    NotRefinement,

    #[error("Namelet cannot be replaced: {0}")]
    NotReplaceable(String),

    #[error("Naming conflict: {0}")]
    NamingConflict(String),

    #[error("Unknown base naming: {0}")]
    UnknownBaseNaming(String),
}

/// GSTG graph errors
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Unknown state: {0}")]
    UnknownState(u32),

    #[error("Stale state: {0}")]
    StaleState(u32),

    #[error("Unknown action {action} on state {state}")]
    UnknownAction { state: u32, action: u32 },

    #[error("No such widget action {action_type} on state {state}")]
    NoSuchAction { state: u32, action_type: String },

    #[error("Missing transition: {0}")]
    MissingTransition(String),

    #[error("Unknown tree: {0}")]
    UnknownTree(u32),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Agent and boundary errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("No current state")]
    NoCurrentState,

    #[error("Void GUI tree after {retries} retries")]
    VoidTree { retries: u32 },

    #[error("Action cannot be resolved: {0}")]
    Unresolved(String),

    #[error("Malformed action log entry: {0}")]
    MalformedLogEntry(String),

    #[error("Device error: {0}")]
    Device(String),
}

// Implement From for common external error types
impl From<serde_json::Error> for ApeError {
    fn from(err: serde_json::Error) -> Self {
        ApeError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for ApeError {
    fn from(err: bincode::Error) -> Self {
        ApeError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ApeError {
    fn from(err: std::io::Error) -> Self {
        ApeError::Storage(err.to_string())
    }
}

impl From<anyhow::Error> for ApeError {
    fn from(err: anyhow::Error) -> Self {
        ApeError::Internal(err.to_string())
    }
}
