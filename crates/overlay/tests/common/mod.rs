#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use satnet_overlay::{
    CheckInRequest, NodeSelectionConfig, OverlayConfig, OverlayService, PlacementRuleSet,
    SelectionCacheConfig,
};
use satnet_overlay_db::{
    AuditOutcome, EligibleNodes, InfoResponse, NodeCapacity, NodeCheckInInfo, NodeCriteria,
    NodeDossier, NodeId, NodeStore, NodeStoreError, NodeStoreErrorKind, NodeVersion, Reliability,
    Reputation, Transition,
};
use satnet_overlay_db_memory::MemoryNodeStore;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const FREE_DISK: i64 = 1_000_000_000;

/// Policy with no version floor and an hour-long online window.
pub fn node_config() -> NodeSelectionConfig {
    NodeSelectionConfig {
        new_node_fraction: 0.05,
        online_window: Duration::from_secs(3600),
        ..NodeSelectionConfig::default()
    }
}

pub fn overlay_config() -> OverlayConfig {
    OverlayConfig {
        node: node_config(),
        selection_cache: SelectionCacheConfig {
            staleness: Duration::from_secs(3600),
            refresh_interval: Duration::from_secs(3600),
            ..SelectionCacheConfig::default()
        },
        ..OverlayConfig::default()
    }
}

pub fn service<S: NodeStore>(store: Arc<S>, config: OverlayConfig) -> OverlayService<S> {
    OverlayService::new(store, config, Arc::new(PlacementRuleSet::new())).unwrap()
}

/// Address of the `index`th node, `per_net` nodes to a /24.
pub fn address(index: usize, per_net: usize) -> String {
    let net = index / per_net;
    let host = index % per_net + 1;
    format!("10.{}.{}.{host}:28967", net / 256, net % 256)
}

pub fn full_check_in(node_id: NodeId, address: String) -> CheckInRequest {
    CheckInRequest {
        capacity: Some(NodeCapacity {
            free_disk: FREE_DISK,
        }),
        version: Some(NodeVersion::new("v1.2.3")),
        ..CheckInRequest::new(node_id, address, true)
    }
}

/// Seeded node IDs by tier.
#[derive(Debug, Default)]
pub struct Population {
    pub vetted: HashSet<NodeId>,
    pub new: HashSet<NodeId>,
}

/// Checks in `vetted + new` online nodes, `per_net` to a network, and vets the
/// first `vetted` of them.
pub async fn seed<S: NodeStore>(
    service: &OverlayService<S>,
    vetted: usize,
    new: usize,
    per_net: usize,
) -> Population {
    let cancel = CancellationToken::new();
    let now = Utc::now();
    let mut population = Population::default();

    for index in 0..vetted + new {
        let id = NodeId::random();
        service
            .check_in(full_check_in(id, address(index, per_net)), now, &cancel)
            .await
            .unwrap();
        if index < vetted {
            service.vet_node(id, &cancel).await.unwrap();
            population.vetted.insert(id);
        } else {
            population.new.insert(id);
        }
    }

    population
}

#[derive(Debug, Error)]
pub enum TestStoreError {
    #[error(transparent)]
    Memory(#[from] satnet_overlay_db_memory::Error),

    #[error("store unavailable")]
    Unavailable,
}

impl NodeStoreError for TestStoreError {
    fn kind(&self) -> NodeStoreErrorKind {
        match self {
            Self::Memory(e) => e.kind(),
            Self::Unavailable => NodeStoreErrorKind::Unavailable,
        }
    }
}

/// Memory store that counts criteria reads and can be made slow or failing.
#[derive(Debug, Default)]
pub struct InstrumentedStore {
    inner: MemoryNodeStore,
    reads: AtomicUsize,
    failing: AtomicBool,
    read_delay_ms: AtomicUsize,
}

impl InstrumentedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(usize::try_from(delay.as_millis()).unwrap(), Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeStore for InstrumentedStore {
    type Error = TestStoreError;

    async fn update_check_in(
        &self,
        info: NodeCheckInInfo,
        observed_at: DateTime<Utc>,
    ) -> Result<(), Self::Error> {
        Ok(self.inner.update_check_in(info, observed_at).await?)
    }

    async fn update_node_info(
        &self,
        node_id: NodeId,
        info: InfoResponse,
    ) -> Result<NodeDossier, Self::Error> {
        Ok(self.inner.update_node_info(node_id, info).await?)
    }

    async fn get(&self, node_id: NodeId) -> Result<NodeDossier, Self::Error> {
        Ok(self.inner.get(node_id).await?)
    }

    async fn read_by_criteria(
        &self,
        criteria: &NodeCriteria,
    ) -> Result<EligibleNodes, Self::Error> {
        self.reads.fetch_add(1, Ordering::SeqCst);

        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TestStoreError::Unavailable);
        }
        Ok(self.inner.read_by_criteria(criteria).await?)
    }

    async fn update_reputation(
        &self,
        node_id: NodeId,
        transition: Transition,
    ) -> Result<Reputation, Self::Error> {
        Ok(self.inner.update_reputation(node_id, transition).await?)
    }

    async fn record_audit(
        &self,
        node_id: NodeId,
        outcome: AuditOutcome,
    ) -> Result<Reputation, Self::Error> {
        Ok(self.inner.record_audit(node_id, outcome).await?)
    }

    async fn get_nodes_network(&self, node_ids: &[NodeId]) -> Result<Vec<String>, Self::Error> {
        Ok(self.inner.get_nodes_network(node_ids).await?)
    }

    async fn known_reliable(
        &self,
        node_ids: &[NodeId],
        online_window: Duration,
        as_of_system_interval: Option<Duration>,
    ) -> Result<Reliability, Self::Error> {
        Ok(self
            .inner
            .known_reliable(node_ids, online_window, as_of_system_interval)
            .await?)
    }
}
