//! Process-wide overlay configuration.

use std::time::Duration;

use satnet_overlay_db::parse_version;
use serde::{Deserialize, Serialize};

use crate::error::OverlayError;

/// Default share of a selection drawn from new nodes.
pub const DEFAULT_NEW_NODE_FRACTION: f64 = 0.05;

/// Default online window.
pub const DEFAULT_ONLINE_WINDOW: Duration = Duration::from_secs(4 * 60 * 60);

/// Default minimum free disk: 500 MB.
pub const DEFAULT_MINIMUM_DISK_SPACE: i64 = 500_000_000;

/// Default bounded-staleness interval for store reads.
pub const DEFAULT_AS_OF_SYSTEM_INTERVAL: Duration = Duration::from_secs(10);

/// Default maximum age of the selection snapshot.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(3 * 60);

/// Default interval of the background refresh loop.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Default largest exclusion list still served from the snapshot.
pub const DEFAULT_MAX_CACHED_EXCLUSIONS: usize = 100;

/// Bounded-staleness reads from the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsOfSystemTimeConfig {
    /// Whether requests without their own interval use `default_interval`.
    pub enabled: bool,

    /// Staleness tolerated by default.
    pub default_interval: Duration,
}

impl Default for AsOfSystemTimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_interval: DEFAULT_AS_OF_SYSTEM_INTERVAL,
        }
    }
}

/// Prefix lengths used to derive a node's network from its address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPrefixConfig {
    /// IPv4 prefix length.
    pub ipv4: u8,

    /// IPv6 prefix length.
    pub ipv6: u8,
}

impl Default for NetworkPrefixConfig {
    fn default() -> Self {
        Self { ipv4: 24, ipv6: 64 }
    }
}

/// Node selection policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSelectionConfig {
    /// Share of each selection that comes from new (unvetted) nodes.
    pub new_node_fraction: f64,

    /// Minimum node software version. Empty means no floor.
    pub minimum_version: String,

    /// A node is online if it checked in within this window.
    pub online_window: Duration,

    /// At most one selected node per network.
    pub distinct_ip: bool,

    /// Minimum free disk in bytes.
    pub minimum_disk_space: i64,

    /// Bounded-staleness store reads.
    pub as_of_system_time: AsOfSystemTimeConfig,

    /// Network derivation.
    pub network_prefix: NetworkPrefixConfig,
}

impl Default for NodeSelectionConfig {
    fn default() -> Self {
        Self {
            new_node_fraction: DEFAULT_NEW_NODE_FRACTION,
            minimum_version: String::new(),
            online_window: DEFAULT_ONLINE_WINDOW,
            distinct_ip: true,
            minimum_disk_space: DEFAULT_MINIMUM_DISK_SPACE,
            as_of_system_time: AsOfSystemTimeConfig::default(),
            network_prefix: NetworkPrefixConfig::default(),
        }
    }
}

impl NodeSelectionConfig {
    /// Parsed minimum version.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the version string is not semver.
    pub fn minimum_version(&self) -> Result<Option<semver::Version>, OverlayError> {
        parse_minimum_version(&self.minimum_version)
            .map_err(|v| OverlayError::Configuration(format!("invalid minimum version '{v}'")))
    }

    /// Default staleness tolerance for store reads.
    #[must_use]
    pub fn default_as_of_interval(&self) -> Option<Duration> {
        self.as_of_system_time
            .enabled
            .then_some(self.as_of_system_time.default_interval)
    }

    /// Checks the policy for values no selection could satisfy.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first bad value.
    pub fn validate(&self) -> Result<(), OverlayError> {
        if !(0.0..=1.0).contains(&self.new_node_fraction) {
            return Err(OverlayError::Configuration(format!(
                "new node fraction {} is outside [0, 1]",
                self.new_node_fraction
            )));
        }
        if self.network_prefix.ipv4 > 32 || self.network_prefix.ipv6 > 128 {
            return Err(OverlayError::Configuration(format!(
                "invalid network prefix {:?}",
                self.network_prefix
            )));
        }
        self.minimum_version()?;
        Ok(())
    }
}

/// Parses an optional minimum version. Empty strings mean "no floor".
pub(crate) fn parse_minimum_version(raw: &str) -> Result<Option<semver::Version>, String> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    parse_version(raw).map(Some).ok_or_else(|| raw.to_string())
}

/// Selection snapshot cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionCacheConfig {
    /// Serve every upload selection straight from the store.
    pub disabled: bool,

    /// Maximum snapshot age before a selection forces a refresh.
    pub staleness: Duration,

    /// Interval of the background refresh loop.
    pub refresh_interval: Duration,

    /// Requests excluding more nodes than this bypass the snapshot.
    pub max_cached_exclusions: usize,
}

impl Default for SelectionCacheConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            staleness: DEFAULT_STALENESS,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            max_cached_exclusions: DEFAULT_MAX_CACHED_EXCLUSIONS,
        }
    }
}

/// Thresholds used by the default vetting policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Successful audits needed before a new node is vetted.
    pub audits_for_vetting: u64,

    /// Failed audits after which a node is disqualified.
    pub audit_failures_for_disqualification: u64,

    /// Consecutive unknown audits after which a node is suspended.
    pub unknown_audits_for_suspension: u64,

    /// Consecutive unknown audits after which a suspended node is disqualified.
    pub unknown_audits_for_disqualification: u64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            audits_for_vetting: 100,
            audit_failures_for_disqualification: 10,
            unknown_audits_for_suspension: 1,
            unknown_audits_for_disqualification: 20,
        }
    }
}

/// Full overlay configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Selection policy.
    pub node: NodeSelectionConfig,

    /// Snapshot cache.
    pub selection_cache: SelectionCacheConfig,

    /// Vetting thresholds.
    pub reputation: ReputationConfig,
}

impl OverlayConfig {
    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first bad value.
    pub fn validate(&self) -> Result<(), OverlayError> {
        self.node.validate()?;
        if self.selection_cache.refresh_interval.is_zero() {
            return Err(OverlayError::Configuration(
                "selection cache refresh interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
