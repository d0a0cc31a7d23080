//! Eligibility criteria for a single selection query.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::node::{NodeDossier, NodeType};
use crate::NodeId;

/// Immutable filter for one selection query.
///
/// Tier membership is decided by the store; this only says whether a node may
/// be considered at all.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeCriteria {
    /// Minimum free disk in bytes.
    pub free_disk: i64,

    /// Nodes that must not be returned.
    pub excluded_ids: HashSet<NodeId>,

    /// Networks that must not be returned.
    pub excluded_networks: HashSet<String>,

    /// Minimum node software version.
    pub minimum_version: Option<semver::Version>,

    /// A node is online if it checked in within this window.
    pub online_window: Duration,

    /// At most one node per network.
    pub distinct_ip: bool,

    /// How stale a read the query tolerates. `None` asks for the latest state.
    pub as_of_system_interval: Option<Duration>,
}

impl NodeCriteria {
    /// Online window as a signed delta.
    #[must_use]
    pub fn online_window_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.online_window).unwrap_or(TimeDelta::MAX)
    }

    /// Whether `node` passes every filter at time `now`.
    #[must_use]
    pub fn admits(&self, node: &NodeDossier, now: DateTime<Utc>) -> bool {
        if node.node_type != NodeType::Storage || !node.reputation.is_selectable() {
            return false;
        }
        if node.capacity.free_disk < self.free_disk {
            return false;
        }
        if !node.contact.is_online(now, self.online_window_delta()) {
            return false;
        }
        if self.excluded_ids.contains(&node.id)
            || self.excluded_networks.contains(&node.placement.last_net)
        {
            return false;
        }
        match &self.minimum_version {
            Some(minimum) => node.version.semver().is_some_and(|v| v >= *minimum),
            None => true,
        }
    }
}
