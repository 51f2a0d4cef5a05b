//! Error types for the upgrade orchestrator
//!
//! Errors carry enough context (record keys, operations, versions) to be
//! diagnosed from a single log line. Classification helpers decide whether a
//! failure is retried at the call site, abandons the upgrade attempt, or is
//! swallowed as best-effort.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Error codes reported by the cluster execution service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionErrorCode {
    /// An upgrade is already running
    UpgradeInProgress,
    /// The cluster already runs the requested version
    AlreadyInTargetVersion,
    /// The service could not be reached or is temporarily unavailable
    Unavailable,
    /// The referenced node, version or service does not exist
    NotFound,
    /// The request was rejected as malformed
    InvalidArgument,
    /// Any other failure
    Other,
}

impl std::fmt::Display for ExecutionErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpgradeInProgress => write!(f, "UpgradeInProgress"),
            Self::AlreadyInTargetVersion => write!(f, "AlreadyInTargetVersion"),
            Self::Unavailable => write!(f, "Unavailable"),
            Self::NotFound => write!(f, "NotFound"),
            Self::InvalidArgument => write!(f, "InvalidArgument"),
            Self::Other => write!(f, "Other"),
        }
    }
}

/// Main error type for orchestrator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Persistent store failure (I/O, unavailable replica, store timeout)
    #[error("store error [{key}]: {message}")]
    Store {
        /// Record key the operation targeted
        key: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Optimistic concurrency check failed; the record changed since it was read
    #[error("conflict writing {key}: {message}")]
    Conflict {
        /// Record key the write targeted
        key: String,
        /// Description of the mismatch
        message: String,
    },

    /// A required record or object does not exist
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Kind of object (e.g., "cluster resource", "package")
        kind: String,
        /// Name or key that was looked up
        name: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The record kind being serialized (if known)
        kind: Option<String>,
    },

    /// Invalid user input (configuration document, requested version)
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "nodes[2].nodeTypeRef")
        field: Option<String>,
    },

    /// The target configuration recorded on the cluster resource is malformed
    #[error("invalid upgrade target: {message}")]
    InvalidTarget {
        /// Description of what's invalid
        message: String,
    },

    /// The cluster execution service rejected or failed a command
    #[error("execution service error [{operation}] {code}: {message}")]
    Execution {
        /// Command that failed (e.g., "start_upgrade")
        operation: String,
        /// Error code reported by the service
        code: ExecutionErrorCode,
        /// Description of what failed
        message: String,
    },

    /// A bounded wait expired
    #[error("timeout [{operation}]: {message}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Description of what was being waited for
        message: String,
    },

    /// Package download, extraction or provisioning failure
    #[error("package error for {version}: {message}")]
    Package {
        /// Code version of the package
        version: String,
        /// Description of what failed
        message: String,
    },

    /// Goal-state manifest could not be fetched or parsed
    #[error("goal state error: {message}")]
    GoalState {
        /// Description of what failed
        message: String,
    },

    /// The operation observed a cancellation request
    #[error("cancelled: {operation}")]
    Cancelled {
        /// Operation that was interrupted
        operation: String,
    },

    /// Filesystem error
    #[error("io error: {source}")]
    Io {
        /// The underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "orchestrator", "nodes")
        context: String,
    },
}

impl Error {
    /// Create a retryable store error for the given key
    pub fn store(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Store {
            key: key.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a conflict error for the given key
    pub fn conflict(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with record kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with a field path
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an invalid-target error
    pub fn invalid_target(msg: impl Into<String>) -> Self {
        Self::InvalidTarget { message: msg.into() }
    }

    /// Create an execution service error
    pub fn execution(
        operation: impl Into<String>,
        code: ExecutionErrorCode,
        msg: impl Into<String>,
    ) -> Self {
        Self::Execution {
            operation: operation.into(),
            code,
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a package error
    pub fn package(version: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Package {
            version: version.into(),
            message: msg.into(),
        }
    }

    /// Create a goal-state error
    pub fn goal_state(msg: impl Into<String>) -> Self {
        Self::GoalState { message: msg.into() }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable at the call site
    ///
    /// Conflicts are never retried: the caller must re-read and recompute.
    /// Execution errors are retried only when the service reported itself
    /// unavailable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store { retryable, .. } => *retryable,
            Error::Conflict { .. } => false,
            Error::NotFound { .. } => false,
            Error::Serialization { .. } => false,
            Error::Validation { .. } => false,
            Error::InvalidTarget { .. } => false,
            Error::Execution { code, .. } => *code == ExecutionErrorCode::Unavailable,
            Error::Timeout { .. } => true,
            Error::Package { .. } => false,
            Error::GoalState { .. } => true,
            Error::Cancelled { .. } => false,
            Error::Io { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// True for optimistic concurrency failures
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// True when a bounded wait expired
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// True when the operation was interrupted by cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// The execution service error code, if this is an execution error
    pub fn execution_code(&self) -> Option<ExecutionErrorCode> {
        match self {
            Error::Execution { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Stable error code recorded in the persisted upgrade error detail
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Store { .. } => "StoreFailure",
            Error::Conflict { .. } => "Conflict",
            Error::NotFound { .. } => "NotFound",
            Error::Serialization { .. } => "SerializationFailure",
            Error::Validation { .. } => "InvalidConfiguration",
            Error::InvalidTarget { .. } => "InvalidTarget",
            Error::Execution { .. } => "ExecutionFailure",
            Error::Timeout { .. } => "Timeout",
            Error::Package { .. } => "PackageFailure",
            Error::GoalState { .. } => "GoalStateFailure",
            Error::Cancelled { .. } => "Cancelled",
            Error::Io { .. } => "IoFailure",
            Error::Internal { .. } => "InternalError",
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Store { key, .. } | Error::Conflict { key, .. } => Some(key),
            Error::Execution { operation, .. }
            | Error::Timeout { operation, .. }
            | Error::Cancelled { operation } => Some(operation),
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
