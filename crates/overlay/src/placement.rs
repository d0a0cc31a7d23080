//! Placement constraints layered on top of node criteria.
//!
//! Rule authoring lives elsewhere; the overlay only asks a [`PlacementRules`]
//! provider for an opaque predicate per placement.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use satnet_overlay_db::SelectedNode;
use serde::{Deserialize, Serialize};

use crate::error::{OverlayError, OverlayResult};

/// Placement identifier attached to a bucket or upload.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct PlacementConstraint(pub u16);

impl PlacementConstraint {
    /// No restriction.
    pub const EVERY_COUNTRY: Self = Self(0);
}

impl fmt::Display for PlacementConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "placement#{}", self.0)
    }
}

/// Predicate deciding whether a node may hold data for a placement.
pub type NodeFilter = Arc<dyn Fn(&SelectedNode) -> bool + Send + Sync>;

/// Source of placement filters.
pub trait PlacementRules: Send + Sync + 'static {
    /// Filter for `placement`, or `None` if the placement is unknown.
    fn create_filter(&self, placement: PlacementConstraint) -> Option<NodeFilter>;
}

/// Filter admitting every node.
#[must_use]
pub fn allow_all() -> NodeFilter {
    Arc::new(|_| true)
}

/// Filter for `placement`, rejecting placements `rules` does not know.
pub(crate) fn filter_for(
    rules: &dyn PlacementRules,
    placement: PlacementConstraint,
) -> OverlayResult<NodeFilter> {
    rules
        .create_filter(placement)
        .ok_or_else(|| OverlayError::Validation(format!("unknown {placement}")))
}

/// Country based rule.
#[derive(Clone, Debug, PartialEq, Eq)]
enum CountryRule {
    AllowOnly(HashSet<String>),
    Deny(HashSet<String>),
}

impl CountryRule {
    fn admits(&self, node: &SelectedNode) -> bool {
        let country = node.country_code.as_deref().map(str::to_ascii_uppercase);
        match self {
            Self::AllowOnly(allowed) => country.is_some_and(|c| allowed.contains(&c)),
            Self::Deny(denied) => country.is_none_or(|c| !denied.contains(&c)),
        }
    }
}

/// In-process rule table keyed by placement.
///
/// Placement 0 always admits every node.
#[derive(Clone, Debug, Default)]
pub struct PlacementRuleSet {
    rules: HashMap<PlacementConstraint, CountryRule>,
}

impl PlacementRuleSet {
    /// Empty rule set; only placement 0 is known.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts `placement` to nodes located in `countries`.
    #[must_use]
    pub fn allow_countries<I, C>(mut self, placement: PlacementConstraint, countries: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: AsRef<str>,
    {
        self.rules
            .insert(placement, CountryRule::AllowOnly(normalize(countries)));
        self
    }

    /// Keeps `placement` away from nodes located in `countries`.
    #[must_use]
    pub fn deny_countries<I, C>(mut self, placement: PlacementConstraint, countries: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: AsRef<str>,
    {
        self.rules
            .insert(placement, CountryRule::Deny(normalize(countries)));
        self
    }
}

fn normalize<I, C>(countries: I) -> HashSet<String>
where
    I: IntoIterator<Item = C>,
    C: AsRef<str>,
{
    countries
        .into_iter()
        .map(|c| c.as_ref().to_ascii_uppercase())
        .collect()
}

impl PlacementRules for PlacementRuleSet {
    fn create_filter(&self, placement: PlacementConstraint) -> Option<NodeFilter> {
        if placement == PlacementConstraint::EVERY_COUNTRY {
            return Some(allow_all());
        }
        let rule = self.rules.get(&placement)?.clone();
        Some(Arc::new(move |node| rule.admits(node)))
    }
}
