//! Overlay facade: check-in ingestion, reputation changes and the selection
//! entry points.

use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use satnet_overlay_db::{
    AuditOutcome, DisqualificationReason, InfoResponse, NodeCapacity, NodeCheckInInfo,
    NodeCriteria, NodeDossier, NodeId, NodeOperator, NodeStore, NodeVersion, Reliability,
    Reputation, SelectedNode, Transition,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{SelectionCache, SelectionSnapshot};
use crate::config::{NodeSelectionConfig, OverlayConfig};
use crate::criteria::{FindStorageNodesRequest, SelectionPlan, resolve};
use crate::error::{OverlayError, OverlayResult, cancellable};
use crate::network::resolve_network;
use crate::placement::{NodeFilter, PlacementRules, allow_all, filter_for};
use crate::reputation::{ReputationTracker, ThresholdVettingPolicy, VettingPolicy};
use crate::selection::{Exclusions, select_nodes};

/// A node reporting in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInRequest {
    /// Reporting node.
    pub node_id: NodeId,

    /// Advertised address, `host:port` or `ip:port`.
    pub address: String,

    /// Two letter country code of the address, when known.
    pub country_code: Option<String>,

    /// Whether the node answered.
    pub is_up: bool,

    /// Operator metadata, if reported.
    pub operator: Option<NodeOperator>,

    /// Capacity, if reported.
    pub capacity: Option<NodeCapacity>,

    /// Software version, if reported.
    pub version: Option<NodeVersion>,
}

impl CheckInRequest {
    /// A bare liveness report.
    #[must_use]
    pub fn new(node_id: NodeId, address: impl Into<String>, is_up: bool) -> Self {
        Self {
            node_id,
            address: address.into(),
            country_code: None,
            is_up,
            operator: None,
            capacity: None,
            version: None,
        }
    }
}

fn normalize_country(code: Option<String>) -> OverlayResult<Option<String>> {
    match code {
        None => Ok(None),
        Some(code) if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) => {
            Ok(Some(code.to_ascii_uppercase()))
        }
        Some(code) => Err(OverlayError::Validation(format!(
            "invalid country code '{code}'"
        ))),
    }
}

/// Node overlay over a [`NodeStore`].
pub struct OverlayService<S>
where
    S: NodeStore,
{
    store: Arc<S>,
    config: OverlayConfig,
    placement: Arc<dyn PlacementRules>,
    cache: SelectionCache<S>,
    reputation: ReputationTracker<S>,
}

impl<S> OverlayService<S>
where
    S: NodeStore,
{
    /// Create a service with the threshold vetting policy from `config`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(
        store: Arc<S>,
        config: OverlayConfig,
        placement: Arc<dyn PlacementRules>,
    ) -> OverlayResult<Self> {
        let policy = Arc::new(ThresholdVettingPolicy::new(config.reputation.clone()));
        Self::with_vetting_policy(store, config, placement, policy)
    }

    /// Create a service with a custom vetting policy.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn with_vetting_policy(
        store: Arc<S>,
        config: OverlayConfig,
        placement: Arc<dyn PlacementRules>,
        policy: Arc<dyn VettingPolicy>,
    ) -> OverlayResult<Self> {
        config.validate()?;

        info!(
            "Creating overlay service (new node fraction {}, distinct ip {}, cache {})",
            config.node.new_node_fraction,
            config.node.distinct_ip,
            if config.selection_cache.disabled {
                "disabled"
            } else {
                "enabled"
            }
        );

        let cache = SelectionCache::new(
            Arc::clone(&store),
            config.node.clone(),
            config.selection_cache.clone(),
            Arc::clone(&placement),
        );
        let reputation = ReputationTracker::new(Arc::clone(&store), policy);

        Ok(Self {
            store,
            config,
            placement,
            cache,
            reputation,
        })
    }

    /// Start the selection cache, if enabled.
    ///
    /// # Errors
    ///
    /// Returns the error of the initial snapshot build.
    pub async fn start(&self) -> OverlayResult<()> {
        info!("Starting overlay service");

        if self.config.selection_cache.disabled {
            debug!("Selection cache disabled; every selection reads the store");
            return Ok(());
        }
        self.cache.start().await
    }

    /// Stop background work.
    pub async fn shutdown(&self) -> OverlayResult<()> {
        info!("Shutting down overlay service");
        self.cache.shutdown().await
    }

    /// The process-wide configuration.
    pub const fn config(&self) -> &OverlayConfig {
        &self.config
    }

    /// The selection cache.
    pub const fn cache(&self) -> &SelectionCache<S> {
        &self.cache
    }

    /// Record a check-in. Creates the node on first contact.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed report, the store error if
    /// the write fails, and `Cancelled` if `cancel` fires first.
    pub async fn check_in(
        &self,
        request: CheckInRequest,
        observed_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> OverlayResult<()> {
        if request.node_id.is_zero() {
            return Err(OverlayError::Validation("empty node id".to_string()));
        }
        let country_code = normalize_country(request.country_code)?;

        let network = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(OverlayError::Cancelled),
            network = resolve_network(&request.address, self.config.node.network_prefix) => network?,
        };

        let info = NodeCheckInInfo {
            node_id: request.node_id,
            address: request.address,
            last_ip_port: network.last_ip_port,
            last_net: network.last_net,
            country_code,
            is_up: request.is_up,
            operator: request.operator,
            capacity: request.capacity,
            version: request.version,
        };

        debug!(
            "Check-in from {} on {} (up: {})",
            info.node_id.short(),
            info.last_net,
            info.is_up
        );
        cancellable(cancel, self.store.update_check_in(info, observed_at)).await
    }

    /// Apply a node's self-description.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for nodes that never checked in.
    pub async fn update_node_info(
        &self,
        node_id: NodeId,
        info: InfoResponse,
        cancel: &CancellationToken,
    ) -> OverlayResult<NodeDossier> {
        cancellable(cancel, self.store.update_node_info(node_id, info)).await
    }

    /// Read one node.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for nodes that never checked in.
    pub async fn get(&self, node_id: NodeId, cancel: &CancellationToken) -> OverlayResult<NodeDossier> {
        cancellable(cancel, self.store.get(node_id)).await
    }

    /// Split `node_ids` into online and offline nodes. Unknown and
    /// unselectable nodes are dropped.
    ///
    /// # Errors
    ///
    /// Returns store errors unchanged.
    pub async fn known_reliable(
        &self,
        node_ids: &[NodeId],
        cancel: &CancellationToken,
    ) -> OverlayResult<Reliability> {
        cancellable(
            cancel,
            self.store.known_reliable(
                node_ids,
                self.config.node.online_window,
                self.config.node.default_as_of_interval(),
            ),
        )
        .await
    }

    /// Networks of `node_ids`, skipping unknown nodes.
    ///
    /// # Errors
    ///
    /// Returns store errors unchanged.
    pub async fn get_nodes_network(
        &self,
        node_ids: &[NodeId],
        cancel: &CancellationToken,
    ) -> OverlayResult<Vec<String>> {
        cancellable(cancel, self.store.get_nodes_network(node_ids)).await
    }

    /// Select nodes for an upload under the process-wide policy.
    ///
    /// Served from the snapshot when it can answer the request, otherwise from
    /// the store.
    ///
    /// # Errors
    ///
    /// Returns validation errors, `NotEnoughNodes`, store errors and
    /// `Cancelled`.
    pub async fn find_storage_nodes_for_upload(
        &self,
        request: &FindStorageNodesRequest,
        cancel: &CancellationToken,
    ) -> OverlayResult<Vec<SelectedNode>> {
        if self.cache.accepts(request) {
            return self.cache.get_nodes(request, cancel).await;
        }

        debug!(
            "Selecting {} nodes from the store ({} exclusions)",
            request.requested_count,
            request.excluded_ids.len()
        );
        self.find_storage_nodes_with_preferences(request, &self.config.node, cancel)
            .await
    }

    /// Select nodes under `preferences` instead of the process-wide policy.
    /// Always reads the store.
    ///
    /// # Errors
    ///
    /// Returns validation errors, `NotEnoughNodes`, store errors and
    /// `Cancelled`.
    pub async fn find_storage_nodes_with_preferences(
        &self,
        request: &FindStorageNodesRequest,
        preferences: &NodeSelectionConfig,
        cancel: &CancellationToken,
    ) -> OverlayResult<Vec<SelectedNode>> {
        preferences.validate()?;
        let resolved = resolve(request, preferences)?;
        let filter = filter_for(self.placement.as_ref(), resolved.placement)?;
        self.select_from_store(resolved.criteria, &resolved.plan, &filter, cancel)
            .await
    }

    /// Select exactly `count` nodes, `new_count` of them unvetted, matching
    /// `criteria`. Bypasses the cache.
    ///
    /// # Errors
    ///
    /// Returns validation errors, `NotEnoughNodes`, store errors and
    /// `Cancelled`.
    pub async fn select_storage_nodes(
        &self,
        count: usize,
        new_count: usize,
        criteria: NodeCriteria,
        cancel: &CancellationToken,
    ) -> OverlayResult<Vec<SelectedNode>> {
        let plan = SelectionPlan::exact(count, new_count, criteria.distinct_ip)?;
        self.select_from_store(criteria, &plan, &allow_all(), cancel)
            .await
    }

    async fn select_from_store(
        &self,
        mut criteria: NodeCriteria,
        plan: &SelectionPlan,
        filter: &NodeFilter,
        cancel: &CancellationToken,
    ) -> OverlayResult<Vec<SelectedNode>> {
        if plan.distinct_network && !criteria.excluded_ids.is_empty() {
            let excluded: Vec<NodeId> = criteria.excluded_ids.iter().copied().collect();
            let networks = cancellable(cancel, self.store.get_nodes_network(&excluded)).await?;
            criteria
                .excluded_networks
                .extend(networks.into_iter().filter(|net| !net.is_empty()));
        }

        let pools = cancellable(cancel, self.store.read_by_criteria(&criteria)).await?;
        let exclusions = Exclusions {
            ids: criteria.excluded_ids,
            networks: criteria.excluded_networks,
        };
        select_nodes(&pools, plan, &exclusions, filter, &mut rand::thread_rng())
    }

    /// Rebuild the selection snapshot now.
    ///
    /// # Errors
    ///
    /// Returns the rebuild error; the previous snapshot stays in place.
    pub async fn refresh_cache(&self) -> OverlayResult<Arc<SelectionSnapshot>> {
        self.cache.refresh().await
    }

    /// Mark a node vetted.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound`, or `Internal` if the node is disqualified.
    pub async fn vet_node(
        &self,
        node_id: NodeId,
        cancel: &CancellationToken,
    ) -> OverlayResult<Reputation> {
        self.reputation
            .apply(node_id, Transition::Vet { at: Utc::now() }, cancel)
            .await
    }

    /// Suspend a node after an unknown audit outcome.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound`, or `Internal` if the node is disqualified.
    pub async fn suspend_node_unknown_audit(
        &self,
        node_id: NodeId,
        at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> OverlayResult<Reputation> {
        self.reputation
            .apply(node_id, Transition::SuspendUnknownAudit { at }, cancel)
            .await
    }

    /// Lift an unknown-audit suspension.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound`, or `Internal` if the node is disqualified.
    pub async fn unsuspend_node(
        &self,
        node_id: NodeId,
        cancel: &CancellationToken,
    ) -> OverlayResult<Reputation> {
        self.reputation
            .apply(node_id, Transition::Unsuspend, cancel)
            .await
    }

    /// Disqualify a node permanently. Repeating this keeps the first reason.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for unknown nodes.
    pub async fn disqualify_node(
        &self,
        node_id: NodeId,
        at: DateTime<Utc>,
        reason: DisqualificationReason,
        cancel: &CancellationToken,
    ) -> OverlayResult<Reputation> {
        self.reputation
            .apply(node_id, Transition::Disqualify { at, reason }, cancel)
            .await
    }

    /// Count an audit outcome and apply the resulting reputation change.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for unknown nodes.
    pub async fn record_audit(
        &self,
        node_id: NodeId,
        outcome: AuditOutcome,
        cancel: &CancellationToken,
    ) -> OverlayResult<Reputation> {
        self.reputation
            .record_audit(node_id, outcome, Utc::now(), cancel)
            .await
    }
}

impl<S> Clone for OverlayService<S>
where
    S: NodeStore,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            placement: Arc::clone(&self.placement),
            cache: self.cache.clone(),
            reputation: self.reputation.clone(),
        }
    }
}

impl<S> Debug for OverlayService<S>
where
    S: NodeStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayService")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
