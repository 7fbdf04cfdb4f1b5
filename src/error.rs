//! Error types for the migration controller
//!
//! Every variant is handed to the controller's error policy, which requeues
//! the Migration with backoff. Terminal outcomes (VM missing, another migration in flight,
//! target pod failed) are not errors: they are recorded as `Failed` on the
//! Migration itself.

use thiserror::Error;

/// Main error type for migration controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error (network, conflict, 5xx)
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The Migration node selector disagrees with the VM node selector
    #[error("conflicting node selectors: {keys:?}")]
    ConstraintConflict {
        /// Selector keys present on both sides with different values
        keys: Vec<String>,
    },

    /// A node has no address usable as a migration endpoint
    #[error("node {node} has no InternalIP address")]
    NodeAddress {
        /// Name of the node without an address
        node: String,
    },

    /// Cluster state violates an assumption the controller relies on
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Where the error occurred (e.g. "reconciler", "watcher")
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a constraint conflict error for the given selector keys
    pub fn constraint_conflict(keys: Vec<String>) -> Self {
        Self::ConstraintConflict { keys }
    }

    /// Create an invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }
}
