use crate::node::NodeId;

/// Errors surfaced by the engine. Every error reaches the immediate caller;
/// empty result sets and consolidation no-ops are not errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Root-system validation failed. Fatal at startup and on reload.
    #[error("root system invalid: {0}")]
    Structural(String),

    /// Embedding length does not match the frozen projection matrix.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    ProjectionDimension { expected: usize, actual: usize },

    #[error("embedding component {index} is not finite")]
    NonFiniteEmbedding { index: usize },

    /// An insert or reload would break the index/lineage invariants.
    #[error("index consistency violated: {0}")]
    IndexConsistency(String),

    #[error("k must be at least 1")]
    InvalidK,

    #[error("invalid mood state: {0}")]
    InvalidMood(String),

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
