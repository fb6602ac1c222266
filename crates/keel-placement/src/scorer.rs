//! Candidate ranking and balance scoring.
//!
//! Candidates are ranked by:
//! - **Violation profile** (lexicographic, lower wins)
//! - **Tie-break rules** in configured order: prefer swaps, prefer a
//!   replica's existing or standby location, lower move cost, lower
//!   target node load
//! - **Generation order** as a final deterministic fallback
//!
//! Balance is the weighted coefficient of variation of node load over
//! every metric that has a balancing threshold.

use std::cmp::Ordering;

use keel_core::config::TieBreakRule;

use crate::constraints::{ConstraintTable, ViolationProfile};
use crate::model::{MetricIndex, NodeIndex, Placement};
use crate::solution::{Solution, Transition};

/// A scored transition.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub transition: Transition,
    pub profile: ViolationProfile,
    /// Target is the replica's original node or a standby location.
    pub existing_location: bool,
    pub cost: f64,
    /// Target node utilisation after the transition.
    pub utilization: f64,
    /// Replicas on the target node after the transition.
    pub node_replicas: usize,
    pub order: usize,
}

/// Explicit ranked comparator: `Less` means `a` is the better candidate.
pub fn compare_candidates(a: &Candidate, b: &Candidate, rules: &[TieBreakRule]) -> Ordering {
    a.profile.cmp(&b.profile).then_with(|| {
        for rule in rules {
            let ordering = match rule {
                TieBreakRule::PreferSwap => b.transition.is_swap().cmp(&a.transition.is_swap()),
                TieBreakRule::PreferExistingLocation => b.existing_location.cmp(&a.existing_location),
                TieBreakRule::LowerMoveCost => a.cost.total_cmp(&b.cost),
                TieBreakRule::LowerNodeLoad => a
                    .utilization
                    .total_cmp(&b.utilization)
                    .then(a.node_replicas.cmp(&b.node_replicas)),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        a.order.cmp(&b.order)
    })
}

/// Score a transition by trial application. `None` when it would push
/// a node over capacity. The solution is left as it was.
pub fn score_transition(
    placement: &Placement,
    solution: &mut Solution,
    table: &ConstraintTable,
    transition: Transition,
    buffered: bool,
    order: usize,
) -> Option<Candidate> {
    let cost = solution.transition_cost(placement, &transition);
    let existing_location = match transition {
        Transition::Move { replica, to: Some(node) } => {
            let info = placement.replica(replica);
            info.original_node == Some(node) || placement.partition(info.partition).standby.contains(&node)
        }
        Transition::Move { to: None, .. } => false,
        Transition::Swap { .. } => true,
    };
    let inverse = solution.try_apply(placement, transition, buffered)?;
    let target = match transition {
        Transition::Move { to, .. } => to,
        Transition::Swap { second, .. } => solution.node_of(second),
    };
    let (utilization, node_replicas) = target.map_or((0.0, 0), |node| {
        (
            solution.ledger().utilization(placement, node),
            solution.replicas_on(node).len(),
        )
    });
    let candidate = Candidate {
        transition,
        profile: solution.profile(table),
        existing_location,
        cost,
        utilization,
        node_replicas,
        order,
    };
    solution.apply(placement, inverse);
    Some(candidate)
}

/// Pick the best candidate, if any.
pub fn best_candidate(candidates: Vec<Candidate>, rules: &[TieBreakRule]) -> Option<Candidate> {
    candidates
        .into_iter()
        .min_by(|a, b| compare_candidates(a, b, rules))
}

/// Metrics with a balancing threshold.
pub fn balanced_metrics(placement: &Placement) -> Vec<MetricIndex> {
    placement
        .metric_indices()
        .filter(|m| placement.metrics[m.0].balancing_threshold.is_some())
        .collect()
}

/// Nodes that take part in balancing.
pub fn balancing_nodes(placement: &Placement) -> Vec<NodeIndex> {
    placement
        .node_indices()
        .filter(|n| placement.node(*n).accepts_replicas)
        .collect()
}

/// Highest and lowest node load of a metric over balancing nodes.
pub fn load_spread(placement: &Placement, solution: &Solution, metric: MetricIndex) -> Option<(u64, u64)> {
    let loads = balancing_nodes(placement)
        .into_iter()
        .map(|n| solution.ledger().resident_load(n, metric));
    loads.fold(None, |acc, load| match acc {
        None => Some((load, load)),
        Some((max, min)) => Some((max.max(load), min.min(load))),
    })
}

/// A metric is imbalanced when its busiest node is active and the
/// max/min ratio exceeds the threshold.
pub fn is_imbalanced(placement: &Placement, solution: &Solution, metric: MetricIndex) -> bool {
    let entry = &placement.metrics[metric.0];
    let Some(threshold) = entry.balancing_threshold else {
        return false;
    };
    let Some((max, min)) = load_spread(placement, solution, metric) else {
        return false;
    };
    if max <= entry.activity_threshold || max == 0 {
        return false;
    }
    if min == 0 {
        return true;
    }
    max as f64 / min as f64 > threshold
}

pub fn needs_balancing(placement: &Placement, solution: &Solution) -> bool {
    balanced_metrics(placement)
        .into_iter()
        .any(|m| is_imbalanced(placement, solution, m))
}

/// Weighted sum of the coefficient of variation of node load.
pub fn balance_score(placement: &Placement, solution: &Solution) -> f64 {
    let nodes = balancing_nodes(placement);
    if nodes.is_empty() {
        return 0.0;
    }
    balanced_metrics(placement)
        .into_iter()
        .map(|m| {
            let loads: Vec<f64> = nodes
                .iter()
                .map(|n| solution.ledger().resident_load(*n, m) as f64)
                .collect();
            let mean = loads.iter().sum::<f64>() / loads.len() as f64;
            if mean == 0.0 {
                return 0.0;
            }
            let variance = loads.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / loads.len() as f64;
            placement.metrics[m.0].weight * variance.sqrt() / mean
        })
        .sum()
}

/// Objective minimised by balancing.
pub fn energy(placement: &Placement, solution: &Solution, move_cost_weight: f64) -> f64 {
    balance_score(placement, solution) + move_cost_weight * solution.churn_cost()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReplicaIndex;

    fn make_candidate(order: usize, swap: bool, existing: bool, cost: f64, utilization: f64) -> Candidate {
        let transition = if swap {
            Transition::Swap {
                first: ReplicaIndex(0),
                second: ReplicaIndex(1),
            }
        } else {
            Transition::Move {
                replica: ReplicaIndex(0),
                to: Some(NodeIndex(order)),
            }
        };
        Candidate {
            transition,
            profile: ViolationProfile(vec![0, 0]),
            existing_location: existing,
            cost,
            utilization,
            node_replicas: 0,
            order,
        }
    }

    const DEFAULT_RULES: [TieBreakRule; 4] = [
        TieBreakRule::PreferSwap,
        TieBreakRule::PreferExistingLocation,
        TieBreakRule::LowerMoveCost,
        TieBreakRule::LowerNodeLoad,
    ];

    #[test]
    fn profile_dominates_tie_breaks() {
        let mut worse = make_candidate(0, true, true, 0.0, 0.0);
        worse.profile = ViolationProfile(vec![0, 1]);
        let better = make_candidate(1, false, false, 10.0, 1.0);
        let best = best_candidate(vec![worse, better], &DEFAULT_RULES).unwrap();
        assert_eq!(best.order, 1);
    }

    #[test]
    fn swap_preferred_before_existing_location_by_default() {
        let swap = make_candidate(0, true, false, 0.1, 0.5);
        let existing = make_candidate(1, false, true, 1.0, 0.0);
        let best = best_candidate(vec![existing.clone(), swap.clone()], &DEFAULT_RULES).unwrap();
        assert!(best.transition.is_swap());

        let reordered = [TieBreakRule::PreferExistingLocation, TieBreakRule::PreferSwap];
        let best = best_candidate(vec![swap, existing], &reordered).unwrap();
        assert!(best.existing_location);
    }

    #[test]
    fn lower_load_then_generation_order() {
        let busy = make_candidate(0, false, false, 1.0, 0.9);
        let idle = make_candidate(1, false, false, 1.0, 0.1);
        let best = best_candidate(vec![busy, idle], &DEFAULT_RULES).unwrap();
        assert_eq!(best.order, 1);

        let first = make_candidate(0, false, false, 1.0, 0.5);
        let second = make_candidate(1, false, false, 1.0, 0.5);
        let best = best_candidate(vec![second, first], &DEFAULT_RULES).unwrap();
        assert_eq!(best.order, 0);
    }
}
