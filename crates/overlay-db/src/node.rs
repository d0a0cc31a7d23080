//! Node records and the reports that update them.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::NodeId;
use crate::reputation::{Reputation, ReputationStatus};

/// The role a peer plays in the network. Only storage nodes are ever selected.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum NodeType {
    /// Type not reported yet.
    #[default]
    Invalid,

    /// Stores pieces.
    Storage,

    /// Coordinates the network.
    Satellite,

    /// Client library.
    Uplink,

    /// Bootstrap peer.
    Bootstrap,
}

/// Software version reported by a node.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeVersion {
    /// Semantic version string, optionally prefixed with `v`.
    pub version: String,

    /// Commit the binary was built from.
    pub commit_hash: String,

    /// Build timestamp.
    pub timestamp: Option<DateTime<Utc>>,

    /// Whether this is a release build.
    pub release: bool,
}

impl NodeVersion {
    /// Creates a version with only the version string set.
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Self::default()
        }
    }

    /// Parses the version string.
    #[must_use]
    pub fn semver(&self) -> Option<semver::Version> {
        parse_version(&self.version)
    }
}

/// Parses a version string with an optional leading `v`.
#[must_use]
pub fn parse_version(version: &str) -> Option<semver::Version> {
    let trimmed = version.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    semver::Version::parse(trimmed).ok()
}

/// Operator metadata. Descriptive only, never gates eligibility.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeOperator {
    /// Payout wallet.
    pub wallet: String,

    /// Contact email.
    pub email: String,
}

/// Capacity report.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeCapacity {
    /// Free disk space in bytes. Zero means unknown.
    pub free_disk: i64,
}

/// A check-in report, after the address has been resolved to its network.
///
/// `None` fields were not part of the report and leave the stored value alone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCheckInInfo {
    /// Reporting node.
    pub node_id: NodeId,

    /// Advertised address.
    pub address: String,

    /// Last observed `ip:port`.
    pub last_ip_port: String,

    /// Network the address belongs to.
    pub last_net: String,

    /// ISO-3166 country code, when the caller resolved one.
    pub country_code: Option<String>,

    /// Whether the node was reachable.
    pub is_up: bool,

    /// Operator metadata.
    pub operator: Option<NodeOperator>,

    /// Capacity.
    pub capacity: Option<NodeCapacity>,

    /// Software version.
    pub version: Option<NodeVersion>,
}

/// A node's self-description, fetched by the satellite after contact.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoResponse {
    /// Role of the peer.
    pub node_type: NodeType,

    /// Operator metadata.
    pub operator: Option<NodeOperator>,

    /// Capacity.
    pub capacity: Option<NodeCapacity>,

    /// Software version.
    pub version: Option<NodeVersion>,
}

/// Network placement of a node.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct NodePlacement {
    /// Advertised address.
    pub address: String,

    /// Last observed `ip:port`.
    pub last_ip_port: String,

    /// Subnet-granularity network.
    pub last_net: String,

    /// ISO-3166 country code.
    pub country_code: Option<String>,
}

/// Last contact outcomes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ContactHistory {
    /// Last successful check-in.
    pub last_contact_success: Option<DateTime<Utc>>,

    /// Last failed contact attempt.
    pub last_contact_failure: Option<DateTime<Utc>>,
}

impl ContactHistory {
    /// Whether the last successful contact is within `online_window` of `now`.
    #[must_use]
    pub fn is_online(&self, now: DateTime<Utc>, online_window: TimeDelta) -> bool {
        self.last_contact_success
            .is_some_and(|at| now.signed_duration_since(at) <= online_window)
    }
}

/// Everything known about a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDossier {
    /// Identity.
    pub id: NodeId,

    /// Role.
    pub node_type: NodeType,

    /// Network placement.
    pub placement: NodePlacement,

    /// Operator metadata.
    pub operator: NodeOperator,

    /// Capacity.
    pub capacity: NodeCapacity,

    /// Software version.
    pub version: NodeVersion,

    /// Contact history.
    pub contact: ContactHistory,

    /// Reputation.
    pub reputation: Reputation,

    /// First check-in.
    pub created_at: DateTime<Utc>,
}

impl NodeDossier {
    /// Reputation status.
    #[must_use]
    pub const fn status(&self) -> ReputationStatus {
        self.reputation.status()
    }

    /// Selection view of this node.
    #[must_use]
    pub fn selected(&self) -> SelectedNode {
        SelectedNode {
            id: self.id,
            address: self.placement.address.clone(),
            last_net: self.placement.last_net.clone(),
            last_ip_port: self.placement.last_ip_port.clone(),
            country_code: self.placement.country_code.clone(),
        }
    }
}

/// A node as returned from selection.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct SelectedNode {
    /// Identity.
    pub id: NodeId,

    /// Advertised address.
    pub address: String,

    /// Network used for diversity.
    pub last_net: String,

    /// Last observed `ip:port`.
    pub last_ip_port: String,

    /// ISO-3166 country code.
    pub country_code: Option<String>,
}

impl fmt::Display for SelectedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id.short(), self.address)
    }
}

/// Eligible nodes partitioned by reputation tier.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EligibleNodes {
    /// Vetted nodes.
    pub reputable: Vec<SelectedNode>,

    /// Not yet vetted nodes.
    pub new: Vec<SelectedNode>,
}

impl EligibleNodes {
    /// Total number of eligible nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reputable.len() + self.new.len()
    }

    /// Whether there are no eligible nodes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reputable.is_empty() && self.new.is_empty()
    }
}
