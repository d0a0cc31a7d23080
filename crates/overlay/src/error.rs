//! Error types for overlay operations

use std::future::Future;

use satnet_overlay_db::{NodeStoreError, NodeStoreErrorKind};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Result alias for overlay operations.
pub type OverlayResult<T> = Result<T, OverlayError>;

/// Overlay errors.
///
/// Validation errors mean the request was bad; `Internal` means the system is
/// broken. Callers can retry `NotEnoughNodes` with relaxed criteria.
#[derive(Clone, Debug, Error)]
pub enum OverlayError {
    /// Malformed request, rejected before touching the store.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Fewer eligible nodes than requested.
    #[error("not enough nodes: requested {requested}, found {found}")]
    NotEnoughNodes {
        /// Nodes requested.
        requested: usize,

        /// Nodes found.
        found: usize,
    },

    /// The node never checked in.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// Store failure, propagated unchanged.
    #[error("store error: {0}")]
    Store(String),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OverlayError {
    /// Whether the request itself was at fault.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Maps a store error by its kind.
    pub fn from_store<E: NodeStoreError>(err: &E) -> Self {
        match err.kind() {
            NodeStoreErrorKind::NodeNotFound => Self::NodeNotFound(err.to_string()),
            NodeStoreErrorKind::IllegalTransition | NodeStoreErrorKind::Corrupt => {
                error!("node store invariant violated: {err}");
                Self::Internal(err.to_string())
            }
            NodeStoreErrorKind::Unavailable | NodeStoreErrorKind::Other => {
                Self::Store(err.to_string())
            }
        }
    }
}

/// Runs a store call, aborting it with [`OverlayError::Cancelled`] once
/// `cancel` fires.
pub(crate) async fn cancellable<T, E, F>(cancel: &CancellationToken, fut: F) -> OverlayResult<T>
where
    E: NodeStoreError,
    F: Future<Output = Result<T, E>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(OverlayError::Cancelled),
        result = fut => result.map_err(|e| OverlayError::from_store(&e)),
    }
}
