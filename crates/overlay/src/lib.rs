//! Node overlay for the satnet control plane.
//!
//! This crate provides:
//! - Check-in ingestion with network derivation
//! - Audit-driven reputation changes
//! - Storage node selection, cached or straight from the store
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod cache;
pub mod config;
pub mod criteria;
pub mod error;
pub mod network;
pub mod placement;
pub mod reputation;
pub mod selection;
pub mod service;

pub use cache::{SelectionCache, SelectionSnapshot};
pub use config::{
    AsOfSystemTimeConfig, NetworkPrefixConfig, NodeSelectionConfig, OverlayConfig,
    ReputationConfig, SelectionCacheConfig,
};
pub use criteria::{FindStorageNodesRequest, ResolvedRequest, SelectionPlan};
pub use error::{OverlayError, OverlayResult};
pub use network::{ResolvedNetwork, resolve_network};
pub use placement::{NodeFilter, PlacementConstraint, PlacementRuleSet, PlacementRules};
pub use reputation::{ReputationTracker, ThresholdVettingPolicy, VettingPolicy};
pub use selection::{Exclusions, select_nodes};
pub use service::{CheckInRequest, OverlayService};
