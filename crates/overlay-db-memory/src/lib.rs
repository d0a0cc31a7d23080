//! In-memory (single process) node record store for local development and
//! tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use satnet_overlay_db::{
    AuditOutcome, ContactHistory, EligibleNodes, InfoResponse, NodeCapacity, NodeCheckInInfo,
    NodeCriteria, NodeDossier, NodeId, NodeOperator, NodePlacement, NodeStore, NodeType,
    NodeVersion, Reliability, Reputation, ReputationStatus, Transition,
};
use tracing::{debug, trace};

/// Software fields reported by the node itself.
#[derive(Clone, Debug, Default)]
struct Software {
    node_type: NodeType,
    operator: NodeOperator,
    version: NodeVersion,
}

/// One node, split into field groups that are locked independently so
/// concurrent partial reports compose instead of clobbering each other.
#[derive(Debug)]
struct NodeRecord {
    id: NodeId,
    created_at: DateTime<Utc>,
    placement: RwLock<NodePlacement>,
    software: RwLock<Software>,
    capacity: RwLock<NodeCapacity>,
    contact: RwLock<ContactHistory>,
    reputation: Mutex<Reputation>,
}

impl NodeRecord {
    fn new(id: NodeId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at,
            placement: RwLock::new(NodePlacement::default()),
            software: RwLock::new(Software {
                node_type: NodeType::Storage,
                ..Software::default()
            }),
            capacity: RwLock::new(NodeCapacity::default()),
            contact: RwLock::new(ContactHistory::default()),
            reputation: Mutex::new(Reputation::default()),
        }
    }

    fn dossier(&self) -> NodeDossier {
        let software = self.software.read().clone();
        NodeDossier {
            id: self.id,
            node_type: software.node_type,
            placement: self.placement.read().clone(),
            operator: software.operator,
            capacity: *self.capacity.read(),
            version: software.version,
            contact: *self.contact.read(),
            reputation: *self.reputation.lock(),
            created_at: self.created_at,
        }
    }

    fn apply_check_in(&self, info: NodeCheckInInfo, observed_at: DateTime<Utc>) {
        {
            let mut placement = self.placement.write();
            placement.address = info.address;
            placement.last_ip_port = info.last_ip_port;
            placement.last_net = info.last_net;
            if info.country_code.is_some() {
                placement.country_code = info.country_code;
            }
        }

        if info.operator.is_some() || info.version.is_some() {
            let mut software = self.software.write();
            if let Some(operator) = info.operator {
                software.operator = operator;
            }
            if let Some(version) = info.version {
                software.version = version;
            }
        }

        if let Some(capacity) = info.capacity {
            *self.capacity.write() = capacity;
        }

        let mut contact = self.contact.write();
        if info.is_up {
            contact.last_contact_success = Some(observed_at);
        } else {
            contact.last_contact_failure = Some(observed_at);
        }
    }
}

/// In-memory node store.
#[derive(Clone, Debug, Default)]
pub struct MemoryNodeStore {
    nodes: Arc<DashMap<NodeId, Arc<NodeRecord>>>,
}

impl MemoryNodeStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes that ever checked in.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node ever checked in.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn record(&self, node_id: NodeId) -> Result<Arc<NodeRecord>, Error> {
        self.nodes
            .get(&node_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(Error::NodeNotFound(node_id))
    }

    /// Clones the record handles so no map shard lock is held while reading
    /// field groups.
    fn records(&self) -> Vec<Arc<NodeRecord>> {
        self.nodes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

fn log_as_of(as_of_system_interval: Option<Duration>) {
    // The latest committed state always satisfies a bounded-staleness read.
    if let Some(interval) = as_of_system_interval {
        trace!("serving bounded-staleness read ({interval:?}) from latest state");
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    type Error = Error;

    async fn update_check_in(
        &self,
        info: NodeCheckInInfo,
        observed_at: DateTime<Utc>,
    ) -> Result<(), Self::Error> {
        let node_id = info.node_id;
        let record = Arc::clone(
            self.nodes
                .entry(node_id)
                .or_insert_with(|| {
                    debug!("node {} checked in for the first time", node_id.short());
                    Arc::new(NodeRecord::new(node_id, observed_at))
                })
                .value(),
        );

        record.apply_check_in(info, observed_at);

        Ok(())
    }

    async fn update_node_info(
        &self,
        node_id: NodeId,
        info: InfoResponse,
    ) -> Result<NodeDossier, Self::Error> {
        let record = self.record(node_id)?;

        {
            let mut software = record.software.write();
            software.node_type = info.node_type;
            if let Some(operator) = info.operator {
                software.operator = operator;
            }
            if let Some(version) = info.version {
                software.version = version;
            }
        }
        if let Some(capacity) = info.capacity {
            *record.capacity.write() = capacity;
        }

        Ok(record.dossier())
    }

    async fn get(&self, node_id: NodeId) -> Result<NodeDossier, Self::Error> {
        Ok(self.record(node_id)?.dossier())
    }

    async fn read_by_criteria(
        &self,
        criteria: &NodeCriteria,
    ) -> Result<EligibleNodes, Self::Error> {
        log_as_of(criteria.as_of_system_interval);

        let now = Utc::now();
        let mut eligible = EligibleNodes::default();

        for record in self.records() {
            let dossier = record.dossier();
            if !criteria.admits(&dossier, now) {
                continue;
            }
            match dossier.status() {
                ReputationStatus::Vetted => eligible.reputable.push(dossier.selected()),
                ReputationStatus::New => eligible.new.push(dossier.selected()),
                ReputationStatus::Suspended | ReputationStatus::Disqualified => {}
            }
        }

        trace!(
            "criteria admitted {} reputable and {} new nodes",
            eligible.reputable.len(),
            eligible.new.len()
        );

        Ok(eligible)
    }

    async fn update_reputation(
        &self,
        node_id: NodeId,
        transition: Transition,
    ) -> Result<Reputation, Self::Error> {
        let record = self.record(node_id)?;
        let mut reputation = record.reputation.lock();
        let outcome = reputation.apply(transition)?;
        debug!(
            "node {} reputation {:?}: {:?} -> {}",
            node_id.short(),
            transition,
            outcome,
            reputation.status()
        );
        Ok(*reputation)
    }

    async fn record_audit(
        &self,
        node_id: NodeId,
        outcome: AuditOutcome,
    ) -> Result<Reputation, Self::Error> {
        let record = self.record(node_id)?;
        let mut reputation = record.reputation.lock();
        reputation.record_audit(outcome);
        Ok(*reputation)
    }

    async fn get_nodes_network(&self, node_ids: &[NodeId]) -> Result<Vec<String>, Self::Error> {
        Ok(node_ids
            .iter()
            .filter_map(|id| self.nodes.get(id).map(|entry| Arc::clone(entry.value())))
            .map(|record| record.placement.read().last_net.clone())
            .collect())
    }

    async fn known_reliable(
        &self,
        node_ids: &[NodeId],
        online_window: Duration,
        as_of_system_interval: Option<Duration>,
    ) -> Result<Reliability, Self::Error> {
        log_as_of(as_of_system_interval);

        let now = Utc::now();
        let window = TimeDelta::from_std(online_window).unwrap_or(TimeDelta::MAX);
        let mut reliability = Reliability::default();

        for node_id in node_ids {
            let Ok(record) = self.record(*node_id) else {
                continue;
            };
            let dossier = record.dossier();
            if dossier.node_type != NodeType::Storage || !dossier.reputation.is_selectable() {
                continue;
            }
            if dossier.contact.is_online(now, window) {
                reliability.online.push(dossier.selected());
            } else {
                reliability.offline.push(dossier.selected());
            }
        }

        Ok(reliability)
    }
}
