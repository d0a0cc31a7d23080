//! Turns a selection request plus the process-wide policy into criteria and a
//! quota plan. Pure: never touches storage.

use std::time::Duration;

use satnet_overlay_db::{NodeCriteria, NodeId};
use serde::{Deserialize, Serialize};

use crate::config::{NodeSelectionConfig, parse_minimum_version};
use crate::error::{OverlayError, OverlayResult};
use crate::placement::PlacementConstraint;

/// A request for storage nodes.
///
/// `None` fields fall back to the process-wide configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FindStorageNodesRequest {
    /// Number of nodes wanted.
    pub requested_count: usize,

    /// Upper bound on the number of new nodes.
    pub new_node_count: Option<usize>,

    /// Nodes that must not be returned.
    pub excluded_ids: Vec<NodeId>,

    /// Minimum node software version.
    pub minimum_version: Option<String>,

    /// Staleness tolerated for store reads.
    pub as_of_system_interval: Option<Duration>,

    /// Placement the data is bound to.
    pub placement: PlacementConstraint,

    /// Cover a shortfall in one tier with nodes from the other.
    pub allow_tier_substitution: bool,

    /// Return fewer nodes instead of failing.
    pub best_effort: bool,
}

impl FindStorageNodesRequest {
    /// Request for `count` nodes with everything else defaulted.
    #[must_use]
    pub fn with_count(count: usize) -> Self {
        Self {
            requested_count: count,
            ..Self::default()
        }
    }
}

/// How many nodes to draw from each tier and under which rules.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SelectionPlan {
    /// Nodes drawn from the new tier.
    pub new_share: usize,

    /// Nodes drawn from the vetted tier.
    pub reliable_share: usize,

    /// At most one node per network.
    pub distinct_network: bool,

    /// Cover a shortfall in one tier with the other.
    pub allow_tier_substitution: bool,

    /// Return partial results instead of failing.
    pub best_effort: bool,
}

impl SelectionPlan {
    /// Total nodes requested.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.new_share + self.reliable_share
    }

    /// Plan with an explicit new-node share.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `count` is zero or `new_count` exceeds it.
    pub fn exact(count: usize, new_count: usize, distinct_network: bool) -> OverlayResult<Self> {
        if count == 0 {
            return Err(OverlayError::Validation(
                "requested node count must be positive".to_string(),
            ));
        }
        if new_count > count {
            return Err(OverlayError::Validation(format!(
                "new node count {new_count} exceeds requested count {count}"
            )));
        }
        Ok(Self {
            new_share: new_count,
            reliable_share: count - new_count,
            distinct_network,
            allow_tier_substitution: false,
            best_effort: false,
        })
    }
}

/// Criteria and plan for one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedRequest {
    /// Store-side filter. Excluded networks are filled in by the caller since
    /// resolving them needs the store or a snapshot.
    pub criteria: NodeCriteria,

    /// Tier quota.
    pub plan: SelectionPlan,

    /// Placement of the data.
    pub placement: PlacementConstraint,
}

/// Number of new nodes in a selection of `count`.
#[must_use]
pub fn new_node_share(count: usize, fraction: f64, cap: Option<usize>) -> usize {
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let share = (count as f64 * fraction.clamp(0.0, 1.0)).round() as usize;
    let share = share.min(count);
    cap.map_or(share, |cap| share.min(cap))
}

/// Builds criteria and a plan, letting request fields override `config`.
///
/// # Errors
///
/// Returns a validation error for malformed requests and a configuration error
/// if the fallback policy itself is invalid.
pub fn resolve(
    request: &FindStorageNodesRequest,
    config: &NodeSelectionConfig,
) -> OverlayResult<ResolvedRequest> {
    let count = request.requested_count;
    if count == 0 {
        return Err(OverlayError::Validation(
            "requested node count must be positive".to_string(),
        ));
    }
    if request.excluded_ids.iter().any(NodeId::is_zero) {
        return Err(OverlayError::Validation(
            "excluded ids contain the empty node id".to_string(),
        ));
    }

    let minimum_version = match request.minimum_version.as_deref() {
        Some(raw) => parse_minimum_version(raw)
            .map_err(|v| OverlayError::Validation(format!("invalid minimum version '{v}'")))?,
        None => None,
    };
    let minimum_version = match minimum_version {
        Some(version) => Some(version),
        None => config.minimum_version()?,
    };

    let new_share = new_node_share(count, config.new_node_fraction, request.new_node_count);

    Ok(ResolvedRequest {
        criteria: NodeCriteria {
            free_disk: config.minimum_disk_space,
            excluded_ids: request.excluded_ids.iter().copied().collect(),
            excluded_networks: Default::default(),
            minimum_version,
            online_window: config.online_window,
            distinct_ip: config.distinct_ip,
            as_of_system_interval: request
                .as_of_system_interval
                .or_else(|| config.default_as_of_interval()),
        },
        plan: SelectionPlan {
            new_share,
            reliable_share: count - new_share,
            distinct_network: config.distinct_ip,
            allow_tier_substitution: request.allow_tier_substitution,
            best_effort: request.best_effort,
        },
        placement: request.placement,
    })
}

/// Criteria the snapshot cache is built from: the policy with no exclusions.
///
/// # Errors
///
/// Returns a configuration error if the policy is invalid.
pub fn default_criteria(config: &NodeSelectionConfig) -> OverlayResult<NodeCriteria> {
    Ok(NodeCriteria {
        free_disk: config.minimum_disk_space,
        minimum_version: config.minimum_version()?,
        online_window: config.online_window,
        distinct_ip: config.distinct_ip,
        as_of_system_interval: config.default_as_of_interval(),
        ..NodeCriteria::default()
    })
}
