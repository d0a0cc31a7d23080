//! Random, diversity-aware draw of nodes from tiered pools.
//!
//! Every selection path (snapshot, direct store read, caller preferences) ends
//! here, so they all share the same quota, exclusion and network rules.

use std::collections::HashSet;

use rand::Rng;
use rand::seq::SliceRandom;
use satnet_overlay_db::{EligibleNodes, NodeId, SelectedNode};

use crate::criteria::SelectionPlan;
use crate::error::{OverlayError, OverlayResult};
use crate::placement::NodeFilter;

/// Nodes and networks a selection must avoid.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Exclusions {
    /// Node IDs.
    pub ids: HashSet<NodeId>,

    /// Networks.
    pub networks: HashSet<String>,
}

struct Draw<'a> {
    exclusions: &'a Exclusions,
    filter: &'a NodeFilter,
    distinct_network: bool,
    picked: HashSet<NodeId>,
    used_networks: HashSet<String>,
}

impl Draw<'_> {
    fn admits(&self, node: &SelectedNode) -> bool {
        !self.picked.contains(&node.id)
            && !self.exclusions.ids.contains(&node.id)
            && !self.exclusions.networks.contains(&node.last_net)
            && !(self.distinct_network && self.used_networks.contains(&node.last_net))
            && (self.filter)(node)
    }

    /// Draws up to `want` nodes from `pool` in random order, skipping
    /// collisions until the quota is met or the pool runs out.
    fn take<R: Rng + ?Sized>(
        &mut self,
        pool: &[SelectedNode],
        want: usize,
        rng: &mut R,
    ) -> Vec<SelectedNode> {
        let mut selected = Vec::with_capacity(want);
        if want == 0 {
            return selected;
        }

        let mut order: Vec<&SelectedNode> = pool.iter().collect();
        order.shuffle(rng);

        for node in order {
            if selected.len() == want {
                break;
            }
            if !self.admits(node) {
                continue;
            }
            self.picked.insert(node.id);
            if self.distinct_network {
                self.used_networks.insert(node.last_net.clone());
            }
            selected.push(node.clone());
        }

        selected
    }
}

/// Selects nodes from `pools` according to `plan`.
///
/// New nodes are drawn first. A shortfall in one tier is covered from the
/// other only when the plan allows substitution.
///
/// # Errors
///
/// Returns [`OverlayError::NotEnoughNodes`] when fewer nodes than planned were
/// found and the plan is not best effort.
pub fn select_nodes<R: Rng + ?Sized>(
    pools: &EligibleNodes,
    plan: &SelectionPlan,
    exclusions: &Exclusions,
    filter: &NodeFilter,
    rng: &mut R,
) -> OverlayResult<Vec<SelectedNode>> {
    let mut draw = Draw {
        exclusions,
        filter,
        distinct_network: plan.distinct_network,
        picked: HashSet::new(),
        used_networks: HashSet::new(),
    };

    let mut new = draw.take(&pools.new, plan.new_share, rng);
    let mut reliable = draw.take(&pools.reputable, plan.reliable_share, rng);

    if plan.allow_tier_substitution {
        let new_shortfall = plan.new_share - new.len();
        let reliable_shortfall = plan.reliable_share - reliable.len();
        reliable.extend(draw.take(&pools.reputable, new_shortfall, rng));
        new.extend(draw.take(&pools.new, reliable_shortfall, rng));
    }

    let found = new.len() + reliable.len();
    let requested = plan.total();
    if found < requested && !plan.best_effort {
        return Err(OverlayError::NotEnoughNodes { requested, found });
    }

    reliable.append(&mut new);
    Ok(reliable)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use crate::placement::allow_all;

    fn node(n: u16, net: u16) -> SelectedNode {
        let mut bytes = [0u8; 32];
        bytes[..2].copy_from_slice(&n.to_be_bytes());
        bytes[31] = 1;
        SelectedNode {
            id: NodeId::from_bytes(bytes),
            address: format!("node-{n}"),
            last_net: format!("net-{net}"),
            last_ip_port: format!("node-{n}:1"),
            country_code: None,
        }
    }

    /// `reputable` vetted and `new` unvetted nodes, `per_net` nodes per network.
    fn pools(reputable: u16, new: u16, per_net: u16) -> EligibleNodes {
        EligibleNodes {
            reputable: (0..reputable).map(|i| node(i, i / per_net)).collect(),
            new: (0..new)
                .map(|i| node(10_000 + i, 10_000 + i / per_net))
                .collect(),
        }
    }

    fn plan(new_share: usize, reliable_share: usize, distinct: bool) -> SelectionPlan {
        SelectionPlan {
            new_share,
            reliable_share,
            distinct_network: distinct,
            ..SelectionPlan::default()
        }
    }

    #[test]
    fn test_quota_split_is_exact() {
        let pools = pools(200, 200, 1);
        let new_ids: HashSet<NodeId> = pools.new.iter().map(|n| n.id).collect();
        let selected = select_nodes(
            &pools,
            &plan(5, 95, true),
            &Exclusions::default(),
            &allow_all(),
            &mut rand::thread_rng(),
        )
        .unwrap();

        assert_eq!(selected.len(), 100);
        assert_eq!(selected.iter().filter(|n| new_ids.contains(&n.id)).count(), 5);
        let unique: HashSet<NodeId> = selected.iter().map(|n| n.id).collect();
        assert_eq!(unique.len(), 100);
    }

    #[test]
    fn test_distinct_networks() {
        let pools = pools(100, 100, 4);
        let selected = select_nodes(
            &pools,
            &plan(10, 20, true),
            &Exclusions::default(),
            &allow_all(),
            &mut rand::thread_rng(),
        )
        .unwrap();

        let mut per_net: HashMap<&str, usize> = HashMap::new();
        for node in &selected {
            *per_net.entry(node.last_net.as_str()).or_default() += 1;
        }
        assert_eq!(selected.len(), 30);
        assert!(per_net.values().all(|count| *count == 1));
    }

    #[test]
    fn test_distinct_networks_exhaust_pool() {
        // 8 nodes on 2 networks can only yield 2 distinct picks.
        let pools = pools(8, 0, 4);
        let err = select_nodes(
            &pools,
            &plan(0, 3, true),
            &Exclusions::default(),
            &allow_all(),
            &mut rand::thread_rng(),
        )
        .unwrap_err();
        assert_matches!(err, OverlayError::NotEnoughNodes { requested: 3, found: 2 });
    }

    #[test]
    fn test_exclusions_are_never_returned() {
        let pools = pools(50, 0, 1);
        let exclusions = Exclusions {
            ids: pools.reputable[..10].iter().map(|n| n.id).collect(),
            networks: pools.reputable[10..20]
                .iter()
                .map(|n| n.last_net.clone())
                .collect(),
        };

        for _ in 0..20 {
            let selected = select_nodes(
                &pools,
                &plan(0, 30, true),
                &exclusions,
                &allow_all(),
                &mut rand::thread_rng(),
            )
            .unwrap();
            assert!(selected.iter().all(|n| !exclusions.ids.contains(&n.id)));
            assert!(
                selected
                    .iter()
                    .all(|n| !exclusions.networks.contains(&n.last_net))
            );
        }
    }

    #[test]
    fn test_shortfall_without_substitution_fails() {
        let pools = pools(100, 2, 1);
        let err = select_nodes(
            &pools,
            &plan(5, 10, true),
            &Exclusions::default(),
            &allow_all(),
            &mut rand::thread_rng(),
        )
        .unwrap_err();
        assert_matches!(err, OverlayError::NotEnoughNodes { requested: 15, found: 12 });
    }

    #[test]
    fn test_shortfall_with_substitution_uses_other_tier() {
        let pools = pools(100, 2, 1);
        let new_ids: HashSet<NodeId> = pools.new.iter().map(|n| n.id).collect();
        let selected = select_nodes(
            &pools,
            &SelectionPlan {
                allow_tier_substitution: true,
                ..plan(5, 10, true)
            },
            &Exclusions::default(),
            &allow_all(),
            &mut rand::thread_rng(),
        )
        .unwrap();
        assert_eq!(selected.len(), 15);
        assert_eq!(selected.iter().filter(|n| new_ids.contains(&n.id)).count(), 2);
    }

    #[test]
    fn test_best_effort_returns_partial() {
        let pools = pools(3, 0, 1);
        let selected = select_nodes(
            &pools,
            &SelectionPlan {
                best_effort: true,
                ..plan(0, 10, false)
            },
            &Exclusions::default(),
            &allow_all(),
            &mut rand::thread_rng(),
        )
        .unwrap();
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn test_filter_is_applied() {
        let pools = pools(20, 0, 1);
        let only_even: NodeFilter =
            std::sync::Arc::new(|n: &SelectedNode| n.id.as_bytes()[1] % 2 == 0);
        let selected = select_nodes(
            &pools,
            &SelectionPlan {
                best_effort: true,
                ..plan(0, 20, false)
            },
            &Exclusions::default(),
            &only_even,
            &mut rand::thread_rng(),
        )
        .unwrap();
        assert_eq!(selected.len(), 10);
        assert!(selected.iter().all(|n| n.id.as_bytes()[1] % 2 == 0));
    }
}
