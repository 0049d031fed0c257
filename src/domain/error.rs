//! Domain-level errors (no I/O concerns)

use thiserror::Error;

/// Domain errors represent violations of the tree contract or of node access rules.
/// These are independent of infrastructure concerns.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("invalid index {index} for parent '{parent}' with {len} children")]
    InvalidIndex {
        parent: String,
        index: usize,
        len: usize,
    },

    #[error("node '{0}' is already attached to a parent")]
    AlreadyAttached(String),

    #[error("node '{node}' is not a child of '{parent}'")]
    NotAChild { node: String, parent: String },

    #[error("moving '{node}' below '{target}' would create a cycle")]
    CycleDetected { node: String, target: String },

    #[error("the root node cannot be moved")]
    RootImmovable,

    #[error("the root node cannot be deleted")]
    CannotDeleteRoot,

    #[error("map has no root node")]
    NoRoot,

    #[error("node '{0}' is encrypted and locked")]
    NodeLocked(String),

    #[error("invalid map document: {message}")]
    InvalidDocument { message: String },

    #[error("invalid rewrite rules: {message}")]
    InvalidRules { message: String },
}

impl DomainError {
    pub fn invalid_document(message: impl Into<String>) -> Self {
        Self::InvalidDocument {
            message: message.into(),
        }
    }
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
