//! Abstract interface to the durable node record store behind the overlay,
//! plus the node, criteria and reputation types shared by every store engine.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod criteria;
pub mod node;
pub mod node_id;
pub mod reputation;

pub use criteria::NodeCriteria;
pub use node::{
    ContactHistory, EligibleNodes, InfoResponse, NodeCapacity, NodeCheckInInfo, NodeDossier,
    NodeOperator, NodePlacement, NodeType, NodeVersion, SelectedNode, parse_version,
};
pub use node_id::{NODE_ID_LEN, NodeId, NodeIdParseError};
pub use reputation::{
    AuditCounters, AuditOutcome, Disqualification, DisqualificationReason, Reputation,
    ReputationError, ReputationStatus, Transition, TransitionOutcome,
};

use std::error::Error;
use std::fmt::{self, Debug};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// The kind of node store error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeStoreErrorKind {
    /// The node has never checked in.
    NodeNotFound,

    /// A reputation transition violated the lifecycle.
    IllegalTransition,

    /// A persisted record could not be decoded.
    Corrupt,

    /// The backing engine failed or timed out.
    Unavailable,

    /// Other/unknown error
    Other,
}

impl fmt::Display for NodeStoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Marker trait for `NodeStore` errors
pub trait NodeStoreError: Debug + Error + Send + Sync + 'static {
    /// Returns the kind of this error
    fn kind(&self) -> NodeStoreErrorKind;
}

/// Nodes split by whether they are currently online.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Reliability {
    /// Known, selectable and online.
    pub online: Vec<SelectedNode>,

    /// Known and selectable but offline.
    pub offline: Vec<SelectedNode>,
}

/// Durable table of nodes.
///
/// Engines must make every method safe under arbitrary interleaving: each call
/// is a single-record (or read-only) operation and concurrent writers to the
/// same node are reconciled per field group, never per whole record.
#[async_trait]
pub trait NodeStore
where
    Self: Send + Sync + 'static,
{
    /// The error type for this store.
    type Error: NodeStoreError;

    /// Upserts a check-in. Creates the record on first contact.
    ///
    /// Only field groups present in `info` are written; reputation is never
    /// touched.
    async fn update_check_in(
        &self,
        info: NodeCheckInInfo,
        observed_at: DateTime<Utc>,
    ) -> Result<(), Self::Error>;

    /// Applies a node's self-description to an existing record.
    async fn update_node_info(
        &self,
        node_id: NodeId,
        info: InfoResponse,
    ) -> Result<NodeDossier, Self::Error>;

    /// Reads one node.
    async fn get(&self, node_id: NodeId) -> Result<NodeDossier, Self::Error>;

    /// Reads every node admitted by `criteria`, partitioned by tier.
    async fn read_by_criteria(&self, criteria: &NodeCriteria)
    -> Result<EligibleNodes, Self::Error>;

    /// Applies a reputation transition atomically.
    async fn update_reputation(
        &self,
        node_id: NodeId,
        transition: Transition,
    ) -> Result<Reputation, Self::Error>;

    /// Counts an audit outcome atomically and returns the updated reputation.
    async fn record_audit(
        &self,
        node_id: NodeId,
        outcome: AuditOutcome,
    ) -> Result<Reputation, Self::Error>;

    /// Networks of the given nodes. Unknown nodes are skipped.
    async fn get_nodes_network(&self, node_ids: &[NodeId]) -> Result<Vec<String>, Self::Error>;

    /// Splits the known, selectable nodes among `node_ids` into online and
    /// offline. Unknown and disqualified nodes are in neither list.
    async fn known_reliable(
        &self,
        node_ids: &[NodeId],
        online_window: Duration,
        as_of_system_interval: Option<Duration>,
    ) -> Result<Reliability, Self::Error>;
}
