//! Error types for the in-memory node store.

use satnet_overlay_db::{NodeId, NodeStoreError, NodeStoreErrorKind, ReputationError};
use thiserror::Error;

/// Error type for the in-memory node store.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The node never checked in.
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    /// The requested reputation transition is not permitted.
    #[error(transparent)]
    IllegalTransition(#[from] ReputationError),
}

impl NodeStoreError for Error {
    fn kind(&self) -> NodeStoreErrorKind {
        match self {
            Self::NodeNotFound(_) => NodeStoreErrorKind::NodeNotFound,
            Self::IllegalTransition(_) => NodeStoreErrorKind::IllegalTransition,
        }
    }
}
