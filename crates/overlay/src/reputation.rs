//! Audit-driven reputation changes.
//!
//! The store owns the lifecycle rules; this module only decides which
//! transition an audit outcome should trigger and hands it to the store.

use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use satnet_overlay_db::{
    AuditOutcome, DisqualificationReason, NodeId, NodeStore, NodeStoreError, NodeStoreErrorKind,
    Reputation, ReputationStatus, Transition,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ReputationConfig;
use crate::error::{OverlayError, OverlayResult, cancellable};

/// Decides whether an audit outcome changes a node's status.
pub trait VettingPolicy: Debug + Send + Sync + 'static {
    /// Transition to apply given `reputation` with `outcome` already counted.
    fn decide(
        &self,
        reputation: &Reputation,
        outcome: AuditOutcome,
        now: DateTime<Utc>,
    ) -> Option<Transition>;
}

/// Counter thresholds from [`ReputationConfig`]. A zero threshold for
/// suspension or disqualification disables that rule.
#[derive(Clone, Debug)]
pub struct ThresholdVettingPolicy {
    config: ReputationConfig,
}

impl ThresholdVettingPolicy {
    /// Policy with the given thresholds.
    #[must_use]
    pub const fn new(config: ReputationConfig) -> Self {
        Self { config }
    }
}

impl VettingPolicy for ThresholdVettingPolicy {
    fn decide(
        &self,
        reputation: &Reputation,
        outcome: AuditOutcome,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        let audits = reputation.audits();
        let reached = |count: u64, threshold: u64| threshold > 0 && count >= threshold;

        match reputation.status() {
            ReputationStatus::Disqualified => None,
            _ if reached(audits.failure, self.config.audit_failures_for_disqualification) => {
                Some(Transition::Disqualify {
                    at: now,
                    reason: DisqualificationReason::AuditFailure,
                })
            }
            ReputationStatus::Suspended => {
                if outcome == AuditOutcome::Success {
                    Some(Transition::Unsuspend)
                } else if reached(
                    audits.unknown_streak,
                    self.config.unknown_audits_for_disqualification,
                ) {
                    Some(Transition::Disqualify {
                        at: now,
                        reason: DisqualificationReason::Suspension,
                    })
                } else {
                    None
                }
            }
            _ if outcome == AuditOutcome::Unknown
                && reached(
                    audits.unknown_streak,
                    self.config.unknown_audits_for_suspension,
                ) =>
            {
                Some(Transition::SuspendUnknownAudit { at: now })
            }
            ReputationStatus::New if audits.success >= self.config.audits_for_vetting => {
                Some(Transition::Vet { at: now })
            }
            ReputationStatus::New | ReputationStatus::Vetted => None,
        }
    }
}

/// Applies reputation transitions through the store.
pub struct ReputationTracker<S>
where
    S: NodeStore,
{
    store: Arc<S>,
    policy: Arc<dyn VettingPolicy>,
}

impl<S> ReputationTracker<S>
where
    S: NodeStore,
{
    /// Tracker writing to `store` and consulting `policy` after audits.
    pub fn new(store: Arc<S>, policy: Arc<dyn VettingPolicy>) -> Self {
        Self { store, policy }
    }

    /// Applies `transition` to `node_id`.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for unknown nodes and `Internal` for a transition
    /// out of disqualification.
    pub async fn apply(
        &self,
        node_id: NodeId,
        transition: Transition,
        cancel: &CancellationToken,
    ) -> OverlayResult<Reputation> {
        let reputation =
            cancellable(cancel, self.store.update_reputation(node_id, transition)).await?;
        info!(
            "Node {} reputation is {} after {:?}",
            node_id.short(),
            reputation.status(),
            transition
        );
        Ok(reputation)
    }

    /// Counts an audit outcome and applies whatever transition the policy
    /// derives from the updated counters.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` for unknown nodes and store errors unchanged.
    pub async fn record_audit(
        &self,
        node_id: NodeId,
        outcome: AuditOutcome,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> OverlayResult<Reputation> {
        let reputation = cancellable(cancel, self.store.record_audit(node_id, outcome)).await?;

        let Some(transition) = self.policy.decide(&reputation, outcome, now) else {
            return Ok(reputation);
        };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(OverlayError::Cancelled),
            result = self.store.update_reputation(node_id, transition) => result,
        };

        match result {
            Ok(reputation) => {
                info!(
                    "Node {} reputation is {} after {:?} audit",
                    node_id.short(),
                    reputation.status(),
                    outcome
                );
                Ok(reputation)
            }
            // Someone disqualified the node between counting and deciding.
            Err(e) if e.kind() == NodeStoreErrorKind::IllegalTransition => {
                debug!(
                    "Dropping {:?} for node {}: {}",
                    transition,
                    node_id.short(),
                    e
                );
                let dossier = cancellable(cancel, self.store.get(node_id)).await?;
                Ok(dossier.reputation)
            }
            Err(e) => Err(OverlayError::from_store(&e)),
        }
    }
}

impl<S> Clone for ReputationTracker<S>
where
    S: NodeStore,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<S> Debug for ReputationTracker<S>
where
    S: NodeStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReputationTracker")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
