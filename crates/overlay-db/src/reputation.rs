//! Reputation lifecycle of a node.
//!
//! ```text
//! New ─Vet─▶ Vetted
//! New | Vetted ─SuspendUnknownAudit─▶ Suspended ─Unsuspend─▶ New | Vetted
//! New | Vetted | Suspended ─Disqualify─▶ Disqualified (terminal)
//! ```
//!
//! Every transition is an idempotent merge so concurrent writers can apply them
//! in any order. Disqualification is sticky: the first reason wins and nothing
//! leaves the disqualified state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse reputation status used by selection.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ReputationStatus {
    /// Not vetted yet. Limited to a minority share of selections.
    New,

    /// Vetted.
    Vetted,

    /// Temporarily excluded while an audit anomaly is resolved.
    Suspended,

    /// Permanently excluded.
    Disqualified,
}

impl fmt::Display for ReputationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Why a node was disqualified.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum DisqualificationReason {
    /// No reason recorded.
    Unknown,

    /// Failed too many audits.
    AuditFailure,

    /// Stayed in unknown-audit suspension for too long.
    Suspension,

    /// Runs non-compliant node software.
    NodeSoftware,
}

/// Disqualification record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Disqualification {
    /// When the node was disqualified.
    pub at: DateTime<Utc>,

    /// Why.
    pub reason: DisqualificationReason,
}

/// Outcome of a single audit.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AuditOutcome {
    /// Node returned valid data.
    Success,

    /// Node returned invalid data or refused.
    Failure,

    /// Node responded but the result could not be verified.
    Unknown,

    /// Node could not be reached.
    Offline,
}

/// Running audit counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct AuditCounters {
    /// All audits.
    pub total: u64,

    /// Successful audits.
    pub success: u64,

    /// Failed audits.
    pub failure: u64,

    /// Unknown outcomes.
    pub unknown: u64,

    /// Consecutive unknown outcomes since the last success.
    pub unknown_streak: u64,
}

impl AuditCounters {
    fn record(&mut self, outcome: AuditOutcome) {
        self.total += 1;
        match outcome {
            AuditOutcome::Success => {
                self.success += 1;
                self.unknown_streak = 0;
            }
            AuditOutcome::Failure => self.failure += 1,
            AuditOutcome::Unknown => {
                self.unknown += 1;
                self.unknown_streak += 1;
            }
            AuditOutcome::Offline => {}
        }
    }
}

/// A requested reputation change.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Transition {
    /// Promote to vetted.
    Vet {
        /// When vetting happened.
        at: DateTime<Utc>,
    },

    /// Suspend after an unknown audit outcome.
    SuspendUnknownAudit {
        /// When the suspension started.
        at: DateTime<Utc>,
    },

    /// Lift an unknown-audit suspension.
    Unsuspend,

    /// Disqualify permanently.
    Disqualify {
        /// When.
        at: DateTime<Utc>,

        /// Why.
        reason: DisqualificationReason,
    },
}

/// Whether applying a transition changed anything.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransitionOutcome {
    /// State changed.
    Changed,

    /// State already reflected the transition.
    Unchanged,
}

/// Illegal reputation transitions.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReputationError {
    /// Attempt to move a disqualified node to another state.
    #[error("node is disqualified ({reason:?} at {at}); {attempted:?} is not permitted")]
    Disqualified {
        /// Original disqualification reason.
        reason: DisqualificationReason,

        /// Original disqualification time.
        at: DateTime<Utc>,

        /// Rejected transition.
        attempted: Transition,
    },
}

/// Reputation fields of a node.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Reputation {
    vetted_at: Option<DateTime<Utc>>,
    unknown_audit_suspended: Option<DateTime<Utc>>,
    disqualified: Option<Disqualification>,
    audits: AuditCounters,
}

impl Reputation {
    /// Current status.
    #[must_use]
    pub const fn status(&self) -> ReputationStatus {
        if self.disqualified.is_some() {
            ReputationStatus::Disqualified
        } else if self.unknown_audit_suspended.is_some() {
            ReputationStatus::Suspended
        } else if self.vetted_at.is_some() {
            ReputationStatus::Vetted
        } else {
            ReputationStatus::New
        }
    }

    /// When the node was vetted.
    #[must_use]
    pub const fn vetted_at(&self) -> Option<DateTime<Utc>> {
        self.vetted_at
    }

    /// When the current unknown-audit suspension started.
    #[must_use]
    pub const fn suspended_at(&self) -> Option<DateTime<Utc>> {
        self.unknown_audit_suspended
    }

    /// Disqualification record, if any.
    #[must_use]
    pub const fn disqualification(&self) -> Option<Disqualification> {
        self.disqualified
    }

    /// Audit counters.
    #[must_use]
    pub const fn audits(&self) -> &AuditCounters {
        &self.audits
    }

    /// Whether the node may be selected for new data.
    #[must_use]
    pub const fn is_selectable(&self) -> bool {
        matches!(
            self.status(),
            ReputationStatus::New | ReputationStatus::Vetted
        )
    }

    /// Counts an audit outcome. Counters keep moving even for disqualified
    /// nodes; only status is frozen.
    pub fn record_audit(&mut self, outcome: AuditOutcome) {
        self.audits.record(outcome);
    }

    /// Applies `transition`.
    ///
    /// # Errors
    ///
    /// Returns [`ReputationError::Disqualified`] for any transition other than
    /// a repeated disqualification once the node is disqualified.
    pub fn apply(&mut self, transition: Transition) -> Result<TransitionOutcome, ReputationError> {
        if let Some(dq) = self.disqualified {
            return match transition {
                Transition::Disqualify { .. } => Ok(TransitionOutcome::Unchanged),
                attempted => Err(ReputationError::Disqualified {
                    reason: dq.reason,
                    at: dq.at,
                    attempted,
                }),
            };
        }

        let changed = match transition {
            Transition::Vet { at } => set_once(&mut self.vetted_at, at),
            Transition::SuspendUnknownAudit { at } => {
                set_once(&mut self.unknown_audit_suspended, at)
            }
            Transition::Unsuspend => self.unknown_audit_suspended.take().is_some(),
            Transition::Disqualify { at, reason } => {
                self.disqualified = Some(Disqualification { at, reason });
                true
            }
        };

        Ok(if changed {
            TransitionOutcome::Changed
        } else {
            TransitionOutcome::Unchanged
        })
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T) -> bool {
    if slot.is_some() {
        false
    } else {
        *slot = Some(value);
        true
    }
}
