//! Error types for uacore.
//!
//! Per-item outcomes are `StatusCode`s and never abort a batch. The enums
//! here cover the remaining failure classes: node graph mutations, invalid
//! configuration and whole-call service failures.

use thiserror::Error;

use crate::node_id::NodeId;
use crate::status::StatusCode;

/// Errors raised by node graph mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Node already exists: {0}")]
    NodeExists(NodeId),

    #[error("Reference not found: {source_id} -[{reference_type_id}]-> {target_id}")]
    ReferenceNotFound {
        source_id: NodeId,
        reference_type_id: NodeId,
        target_id: String,
    },

    #[error("Invalid reference: {reason}")]
    InvalidReference {
        reason: String,
    },

    #[error("Invalid node: {reason}")]
    InvalidNode {
        reason: String,
    },

    #[error("Type definition not found: {0}")]
    TypeDefinitionNotFound(NodeId),

    #[error("Lock poisoned: {context}")]
    LockPoisoned {
        context: &'static str,
    },
}

impl GraphError {
    /// The per-item status this error is reported as.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::NodeNotFound(_) | Self::TypeDefinitionNotFound(_) => StatusCode::BadNodeIdUnknown,
            Self::NodeExists(_) => StatusCode::BadNodeIdExists,
            Self::ReferenceNotFound { .. } => StatusCode::BadNotFound,
            Self::InvalidReference { .. } => StatusCode::BadReferenceTypeIdInvalid,
            Self::InvalidNode { .. } => StatusCode::BadNodeClassInvalid,
            Self::LockPoisoned { .. } => StatusCode::BadInternalError,
        }
    }
}

impl From<GraphError> for StatusCode {
    fn from(err: GraphError) -> Self {
        err.status()
    }
}

/// Configuration errors. These are fatal at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid sampling rate band: {reason}")]
    InvalidSamplingRate {
        reason: String,
    },

    #[error("Invalid limit '{field}': {reason}")]
    InvalidLimit {
        field: &'static str,
        reason: String,
    },

    #[error("Missing required node manager: {reason}")]
    MissingManager {
        reason: String,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failures that end a whole service call rather than a single item.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service failed: {0}")]
    Status(StatusCode),

    #[error("Request cancelled after {completed} items")]
    Cancelled {
        completed: usize,
    },

    #[error("Request timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl ServiceError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The status reported to the client for this failure.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Status(s) => *s,
            Self::Cancelled { .. } => StatusCode::BadRequestCancelledByClient,
            Self::Timeout { .. } => StatusCode::BadTimeout,
            Self::Config(_) | Self::Internal { .. } => StatusCode::BadInternalError,
        }
    }

    /// Returns true if this is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<StatusCode> for ServiceError {
    fn from(status: StatusCode) -> Self {
        Self::Status(status)
    }
}

/// Result type alias for whole-call service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;
