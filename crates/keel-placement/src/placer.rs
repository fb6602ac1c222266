//! Placement phase: new replicas and drops.
//!
//! 1. Every unplaced replica slot (parents before children) goes to the
//!    best-ranked target node, honouring the node buffer when any node
//!    can, falling back to full capacity otherwise.
//! 2. Partitions with surplus replicas drop one replica at a time,
//!    secondaries before primaries, fewest violations first.
//! 3. A short randomised refinement relocates only the replicas placed
//!    in this phase while that lowers the violation profile or, at equal
//!    profile, the energy.
//!
//! A slot no node can take stays unplaced and is reported back as
//! `RequestedPlacementNotPossible`.

use std::cmp::Ordering;

use keel_core::{KeelConfig, ReplicaRole};
use rand::Rng;
use rand::rngs::StdRng;
use tracing::{debug, warn};

use crate::constraints::ConstraintTable;
use crate::model::{NodeIndex, PartitionIndex, Placement, ReplicaIndex};
use crate::scorer::{Candidate, best_candidate, energy, score_transition};
use crate::search::Budget;
use crate::solution::{Solution, Transition};

const ENERGY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementOutcome {
    pub placed: usize,
    pub dropped: usize,
    pub refined: usize,
    /// Slots left without a node.
    pub unplaced: Vec<ReplicaIndex>,
    pub interrupted: bool,
}

/// Whether the snapshot has anything for the placement phase to do.
pub fn needs_placement(placement: &Placement, solution: &Solution) -> bool {
    placement
        .replicas
        .iter()
        .enumerate()
        .any(|(i, r)| r.is_new() && solution.node_of(ReplicaIndex(i)).is_none())
        || placement.partitions.iter().any(|p| p.drop_count > 0)
}

pub fn run_placement(
    placement: &Placement,
    solution: &mut Solution,
    config: &KeelConfig,
    table: &ConstraintTable,
    rng: &mut StdRng,
    budget: &mut Budget,
) -> PlacementOutcome {
    let mut outcome = PlacementOutcome::default();
    let rules = &config.search.tie_break;

    for &service in &placement.service_order {
        for &partition in &placement.service(service).partitions {
            for &replica in &placement.partition(partition).replicas {
                if !placement.replica(replica).is_new() || solution.node_of(replica).is_some() {
                    continue;
                }
                match place_replica(placement, solution, table, rules, replica) {
                    Some(candidate) => {
                        solution.apply(placement, candidate.transition);
                        outcome.placed += 1;
                    }
                    None => {
                        warn!(
                            domain = %placement.domain_id,
                            partition = %placement.partition(partition).id,
                            "no node can take new replica"
                        );
                        outcome.unplaced.push(replica);
                    }
                }
            }
        }
    }

    for (index, entry) in placement.partitions.iter().enumerate() {
        for _ in 0..entry.drop_count {
            let Some(replica) = choose_drop(placement, solution, table, PartitionIndex(index)) else {
                break;
            };
            solution.apply(placement, Transition::Move { replica, to: None });
            outcome.dropped += 1;
        }
    }

    let (refined, interrupted) = refine(placement, solution, config, table, rng, budget);
    outcome.refined = refined;
    outcome.interrupted = interrupted;

    debug!(
        domain = %placement.domain_id,
        placed = outcome.placed,
        dropped = outcome.dropped,
        refined = outcome.refined,
        unplaced = outcome.unplaced.len(),
        iterations = budget.used(),
        "placement phase finished"
    );
    outcome
}

fn target_nodes(placement: &Placement, solution: &Solution, replica: ReplicaIndex) -> Vec<NodeIndex> {
    let partition = placement.replica(replica).partition;
    let service = placement.service_of(replica);
    placement
        .node_indices()
        .filter(|&n| service.is_target(placement, n) && !solution.partition_occupies(placement, partition, n))
        .collect()
}

fn place_replica(
    placement: &Placement,
    solution: &mut Solution,
    table: &ConstraintTable,
    rules: &[keel_core::config::TieBreakRule],
    replica: ReplicaIndex,
) -> Option<Candidate> {
    let targets = target_nodes(placement, solution, replica);
    for buffered in [true, false] {
        let candidates: Vec<Candidate> = targets
            .iter()
            .enumerate()
            .filter_map(|(order, &node)| {
                let transition = Transition::Move { replica, to: Some(node) };
                score_transition(placement, solution, table, transition, buffered, order)
            })
            .collect();
        if let Some(best) = best_candidate(candidates, rules) {
            return Some(best);
        }
    }
    None
}

fn choose_drop(
    placement: &Placement,
    solution: &mut Solution,
    table: &ConstraintTable,
    partition: PartitionIndex,
) -> Option<ReplicaIndex> {
    let replicas: Vec<ReplicaIndex> = placement
        .partition(partition)
        .replicas
        .iter()
        .copied()
        .filter(|&r| {
            let info = placement.replica(r);
            info.movable && !info.is_new() && solution.node_of(r).is_some()
        })
        .collect();

    let mut scored = Vec::with_capacity(replicas.len());
    for replica in replicas {
        let Some(node) = solution.node_of(replica) else {
            continue;
        };
        let utilization = solution.ledger().utilization(placement, node);
        let primary = solution.role_of(replica) == ReplicaRole::Primary;
        let inverse = solution.apply(placement, Transition::Move { replica, to: None });
        let profile = solution.profile(table);
        solution.apply(placement, inverse);
        scored.push((primary, profile, utilization, replica));
    }

    scored
        .into_iter()
        .min_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| b.2.total_cmp(&a.2))
                .then_with(|| a.3.cmp(&b.3))
        })
        .map(|(_, _, _, replica)| replica)
}

/// Randomised local improvement over replicas placed in this phase.
fn refine(
    placement: &Placement,
    solution: &mut Solution,
    config: &KeelConfig,
    table: &ConstraintTable,
    rng: &mut StdRng,
    budget: &mut Budget,
) -> (usize, bool) {
    let pool: Vec<ReplicaIndex> = (0..placement.replicas.len())
        .map(ReplicaIndex)
        .filter(|&r| placement.replica(r).is_new() && solution.node_of(r).is_some())
        .collect();
    if pool.is_empty() {
        return (0, false);
    }

    let weight = config.move_cost.weight;
    let mut profile = solution.profile(table);
    let mut current = energy(placement, solution, weight);
    let mut accepted = 0;

    while budget.spend() {
        let replica = pool[rng.gen_range(0..pool.len())];
        let targets = target_nodes(placement, solution, replica);
        if targets.is_empty() {
            continue;
        }
        let node = targets[rng.gen_range(0..targets.len())];
        let Some(inverse) = solution.try_apply(placement, Transition::Move { replica, to: Some(node) }, true) else {
            continue;
        };
        let next_profile = solution.profile(table);
        let next = energy(placement, solution, weight);
        let better = match next_profile.cmp(&profile) {
            Ordering::Less => true,
            Ordering::Equal => next < current - ENERGY_EPSILON,
            Ordering::Greater => false,
        };
        if better {
            profile = next_profile;
            current = next;
            accepted += 1;
        } else {
            solution.apply(placement, inverse);
        }
    }
    (accepted, budget.timed_out())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use keel_core::*;
    use rand::SeedableRng;

    use super::*;
    use crate::convert::{DomainInput, PartitionInput, build_placement};

    fn make_nodes() -> Vec<NodeDescription> {
        (0..4)
            .map(|i| NodeDescription::new(format!("n{i}"), &format!("/fd{i}"), &format!("ud{i}")).with_capacity("Memory", 100))
            .collect()
    }

    fn make_placement(
        nodes: &[NodeDescription],
        services: &[ServiceDescription],
        units: &[FailoverUnitDescription],
        config: &KeelConfig,
    ) -> Placement {
        let types = BTreeMap::new();
        let input = DomainInput {
            domain_id: "d".into(),
            nodes: nodes.iter().collect(),
            service_types: &types,
            services: services.iter().collect(),
            applications: vec![],
            partitions: units
                .iter()
                .map(|unit| PartitionInput { unit, load: None, frozen: false })
                .collect(),
        };
        build_placement(&input, config).unwrap()
    }

    fn run(placement: &Placement, config: &KeelConfig) -> (Solution, PlacementOutcome) {
        let table = ConstraintTable::from_config(config);
        let mut solution = Solution::new(placement, config);
        let mut rng = StdRng::seed_from_u64(7);
        let mut budget = Budget::new(50, Duration::from_secs(5));
        let outcome = run_placement(placement, &mut solution, config, &table, &mut rng, &mut budget);
        (solution, outcome)
    }

    #[test]
    fn new_partition_spreads_across_fault_domains() {
        let config = KeelConfig::default();
        let nodes = make_nodes();
        let services = vec![ServiceDescription::stateful("svc", "T", 3).with_metric(ServiceMetric::new("Memory", 10, 5))];
        let units = vec![FailoverUnitDescription::new("p0", "svc", 1)];
        let placement = make_placement(&nodes, &services, &units, &config);
        assert!(needs_placement(&placement, &Solution::new(&placement, &config)));

        let (solution, outcome) = run(&placement, &config);
        assert_eq!(outcome.placed, 3);
        assert!(outcome.unplaced.is_empty());
        let table = ConstraintTable::from_config(&config);
        assert!(solution.profile(&table).is_clean());
        let primaries = (0..3)
            .filter(|&i| solution.role_of(ReplicaIndex(i)) == ReplicaRole::Primary)
            .count();
        assert_eq!(primaries, 1);
    }

    #[test]
    fn slot_without_target_is_reported() {
        let config = KeelConfig::default();
        let nodes = make_nodes();
        let services = vec![ServiceDescription::stateful("svc", "T", 5)];
        let units = vec![FailoverUnitDescription::new("p0", "svc", 1)];
        let placement = make_placement(&nodes, &services, &units, &config);
        let (_, outcome) = run(&placement, &config);
        assert_eq!(outcome.placed, 4);
        assert_eq!(outcome.unplaced.len(), 1);
    }

    #[test]
    fn placement_prefers_standby_location() {
        let config = KeelConfig::default();
        let nodes = make_nodes();
        let services = vec![ServiceDescription::stateful("svc", "T", 2)];
        let units = vec![FailoverUnitDescription::new("p0", "svc", 1)
            .with_replica("n0", ReplicaRole::Primary)
            .with_replica("n3", ReplicaRole::StandBy)];
        let placement = make_placement(&nodes, &services, &units, &config);
        let (solution, outcome) = run(&placement, &config);
        assert_eq!(outcome.placed, 1);
        assert_eq!(solution.node_of(ReplicaIndex(1)), Some(NodeIndex(3)));
    }

    #[test]
    fn surplus_drops_secondary_first() {
        let config = KeelConfig::default();
        let nodes = make_nodes();
        let services = vec![ServiceDescription::stateful("svc", "T", 2)];
        let units = vec![FailoverUnitDescription::new("p0", "svc", 1)
            .with_replica("n0", ReplicaRole::Primary)
            .with_replica("n1", ReplicaRole::Secondary)
            .with_replica("n2", ReplicaRole::Secondary)];
        let placement = make_placement(&nodes, &services, &units, &config);
        let (solution, outcome) = run(&placement, &config);
        assert_eq!(outcome.dropped, 1);
        assert_eq!(solution.node_of(ReplicaIndex(0)), Some(NodeIndex(0)));
        let remaining = (1..3).filter(|&i| solution.node_of(ReplicaIndex(i)).is_some()).count();
        assert_eq!(remaining, 1);
    }
}
