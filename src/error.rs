//! Error types for chart construction and transition computation

use thiserror::Error;

/// Error types for chart construction and transition computation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChartError {
    /// A transition target or state reference did not resolve to any node
    #[error("unknown state '{id}'")]
    UnknownState { id: String },

    /// An `initial` selector resolved to itself or an ancestor
    #[error("initial target of '{id}' does not descend into the state")]
    InitialCycle { id: String },

    /// Two transitions entered the same region with different leaves
    #[error("non-deterministic entry into region '{region}': '{first}' vs '{second}'")]
    NonDeterministicEntry {
        region: String,
        first: String,
        second: String,
    },

    /// The chart violates a structural invariant at construction
    #[error("invalid chart configuration: {0}")]
    InvalidConfig(String),

    /// A serialized state could not be rehydrated
    #[error("malformed state snapshot: {0}")]
    MalformedState(String),

    /// The interpreter received an event before `start`
    #[error("service '{id}' is not running")]
    ServiceNotRunning { id: String },
}

/// Result type for chart operations
pub type ChartResult<T> = Result<T, ChartError>;
