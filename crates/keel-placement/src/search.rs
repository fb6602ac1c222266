//! Three-phase search over one service domain.
//!
//! ```text
//!  placement ──► constraint check ──► balancing
//!  (new slots,    (repair only,        (annealing, skipped if an
//!   drops)         most severe first)   earlier phase moved anything)
//! ```
//!
//! Every phase runs under a [`Budget`] of iterations and wall-clock
//! time; on exhaustion it keeps the best assignment found so far. The
//! random source is a seeded [`StdRng`], so a fixed seed and snapshot
//! always give the same plan.
//!
//! Capacity is a hard filter: a transition is only considered when no
//! node whose load grows ends above capacity (buffered for placement
//! and balancing, full for constraint check).

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use keel_core::{KeelConfig, MovementBatch, ReplicaRole, SchedulerPhase};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::constraints::{ConstraintKind, ConstraintTable, ViolationProfile, ViolationSubject};
use crate::model::{NodeIndex, PartitionIndex, Placement, ReplicaIndex};
use crate::placer::{needs_placement, run_placement};
use crate::plan::build_batches;
use crate::scorer::{Candidate, best_candidate, energy, needs_balancing, score_transition};
use crate::solution::{Assignment, Solution, Transition};

const ENERGY_EPSILON: f64 = 1e-9;
const MIN_TEMPERATURE: f64 = 1e-3;

// ── Budget ─────────────────────────────────────────────────────

/// Iteration and wall-clock allowance for one phase.
#[derive(Debug, Clone)]
pub struct Budget {
    max_iterations: u32,
    deadline: Instant,
    used: u32,
    exhausted: bool,
}

impl Budget {
    pub fn new(max_iterations: u32, timeout: Duration) -> Self {
        Self {
            max_iterations,
            deadline: Instant::now() + timeout,
            used: 0,
            exhausted: false,
        }
    }

    /// Take one iteration; `false` once iterations or time run out.
    pub fn spend(&mut self) -> bool {
        if self.used >= self.max_iterations || Instant::now() >= self.deadline {
            self.exhausted = true;
            return false;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    /// The phase stopped because the budget ran out.
    pub fn interrupted(&self) -> bool {
        self.exhausted
    }

    pub fn timed_out(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

// ── Constraint check ───────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ConstraintCheckOutcome {
    pub fixes: usize,
    /// Violations no legal transition could improve.
    pub infeasible: Vec<(ViolationSubject, ConstraintKind)>,
    pub interrupted: bool,
}

/// Kinds the constraint check may repair in this pass.
pub fn fixable_kinds(table: &ConstraintTable, fix_domain_violations: bool) -> Vec<ConstraintKind> {
    table
        .kinds()
        .iter()
        .copied()
        .filter(|k| *k != ConstraintKind::PreferredLocation)
        .filter(|k| fix_domain_violations || !k.is_domain())
        .collect()
}

pub fn has_fixable_violations(solution: &Solution, table: &ConstraintTable, fix_domain_violations: bool) -> bool {
    fixable_kinds(table, fix_domain_violations)
        .into_iter()
        .any(|k| solution.totals()[k.index()] > 0)
}

/// Repair violations most severe first. Only strict improvements of the
/// whole profile are taken, so a fix never worsens a higher kind.
pub fn run_constraint_check(
    placement: &Placement,
    solution: &mut Solution,
    config: &KeelConfig,
    table: &ConstraintTable,
    fix_domain_violations: bool,
    budget: &mut Budget,
) -> ConstraintCheckOutcome {
    let kinds = fixable_kinds(table, fix_domain_violations);
    let move_parent = config.affinity.move_parent_to_fix_violation;
    let rules = &config.search.tie_break;
    let mut outcome = ConstraintCheckOutcome::default();
    let mut stuck: BTreeSet<(ConstraintKind, ReplicaIndex)> = BTreeSet::new();

    'search: loop {
        let current = solution.profile(table);
        let mut progressed = false;
        'kinds: for &kind in &kinds {
            if solution.totals()[kind.index()] == 0 {
                continue;
            }
            for replica in solution.offenders(placement, kind, move_parent) {
                if stuck.contains(&(kind, replica)) {
                    continue;
                }
                if !budget.spend() {
                    outcome.interrupted = true;
                    break 'search;
                }
                let candidates = repair_candidates(placement, solution, table, replica);
                let best = best_candidate(candidates, rules).filter(|c| c.profile < current);
                match best {
                    Some(candidate) => {
                        solution.apply(placement, candidate.transition);
                        outcome.fixes += 1;
                        progressed = true;
                        break 'kinds;
                    }
                    None => {
                        stuck.insert((kind, replica));
                    }
                }
            }
        }
        if !progressed {
            break;
        }
        stuck.clear();
    }

    if !outcome.interrupted {
        outcome.infeasible = solution
            .violations(placement, table)
            .into_iter()
            .filter(|(_, kind)| kind.reports_infeasible() && kinds.contains(kind))
            .collect();
    }

    debug!(
        domain = %placement.domain_id,
        fixes = outcome.fixes,
        infeasible = outcome.infeasible.len(),
        interrupted = outcome.interrupted,
        iterations = budget.used(),
        "constraint check finished"
    );
    outcome
}

/// Relocations of `replica` to every legal node plus role swaps within
/// its partition.
fn repair_candidates(
    placement: &Placement,
    solution: &mut Solution,
    table: &ConstraintTable,
    replica: ReplicaIndex,
) -> Vec<Candidate> {
    let mut transitions: Vec<Transition> = move_targets(placement, solution, replica)
        .into_iter()
        .map(|node| Transition::Move { replica, to: Some(node) })
        .collect();
    for other in swap_partners(placement, solution, replica) {
        transitions.push(swap_of(solution, replica, other));
    }

    transitions
        .into_iter()
        .enumerate()
        .filter_map(|(order, t)| score_transition(placement, solution, table, t, false, order))
        .collect()
}

fn move_targets(placement: &Placement, solution: &Solution, replica: ReplicaIndex) -> Vec<NodeIndex> {
    let partition = placement.replica(replica).partition;
    let service = placement.service_of(replica);
    placement
        .node_indices()
        .filter(|&n| service.is_target(placement, n) && !solution.partition_occupies(placement, partition, n))
        .collect()
}

/// Placed, movable replicas of the same partition whose role differs in
/// the primary/secondary sense.
fn swap_partners(placement: &Placement, solution: &Solution, replica: ReplicaIndex) -> Vec<ReplicaIndex> {
    if !placement.service_of(replica).stateful || solution.node_of(replica).is_none() {
        return Vec::new();
    }
    let is_primary = solution.role_of(replica) == ReplicaRole::Primary;
    placement
        .partition(placement.replica(replica).partition)
        .replicas
        .iter()
        .copied()
        .filter(|&other| {
            other != replica
                && placement.replica(other).movable
                && solution.node_of(other).is_some()
                && match solution.role_of(other) {
                    ReplicaRole::Primary => !is_primary,
                    ReplicaRole::Secondary => is_primary,
                    _ => false,
                }
        })
        .collect()
}

/// Swaps are written primary first.
fn swap_of(solution: &Solution, a: ReplicaIndex, b: ReplicaIndex) -> Transition {
    if solution.role_of(a) == ReplicaRole::Primary {
        Transition::Swap { first: a, second: b }
    } else {
        Transition::Swap { first: b, second: a }
    }
}

// ── Balancing ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct BalancingOutcome {
    pub accepted: usize,
    pub energy_before: f64,
    pub energy_after: f64,
    pub improved: bool,
    pub interrupted: bool,
}

fn random_transition(
    placement: &Placement,
    solution: &Solution,
    pool: &[ReplicaIndex],
    swap_probability: f64,
    rng: &mut StdRng,
) -> Option<Transition> {
    let replica = pool[rng.gen_range(0..pool.len())];
    if rng.gen_bool(swap_probability.clamp(0.0, 1.0)) {
        let partners = swap_partners(placement, solution, replica);
        if !partners.is_empty() {
            let other = partners[rng.gen_range(0..partners.len())];
            return Some(swap_of(solution, replica, other));
        }
    }
    let targets = move_targets(placement, solution, replica);
    if targets.is_empty() {
        return None;
    }
    let node = targets[rng.gen_range(0..targets.len())];
    Some(Transition::Move { replica, to: Some(node) })
}

/// Simulated annealing on load balance plus weighted churn. Never
/// accepts a profile worse than the starting one, and never relocates
/// more than the configured share of movable replicas.
pub fn run_balancing(
    placement: &Placement,
    solution: &mut Solution,
    config: &KeelConfig,
    table: &ConstraintTable,
    rng: &mut StdRng,
    budget: &mut Budget,
) -> BalancingOutcome {
    let search = &config.search;
    let weight = config.move_cost.weight;
    let pool: Vec<ReplicaIndex> = (0..placement.replicas.len())
        .map(ReplicaIndex)
        .filter(|&r| placement.replica(r).movable && solution.node_of(r).is_some())
        .collect();

    let start_profile = solution.profile(table);
    let start_energy = energy(placement, solution, weight);
    let mut outcome = BalancingOutcome {
        energy_before: start_energy,
        energy_after: start_energy,
        ..Default::default()
    };
    if pool.is_empty() {
        return outcome;
    }
    let start = solution.assignment().clone();
    let max_moved = (search.max_percentage_to_move.clamp(0.0, 1.0) * placement.movable_replica_count() as f64)
        .floor() as usize;

    // Size the initial temperature from the average energy change of a
    // few random transitions.
    let mut sampled_total = 0.0;
    let mut samples = 0u32;
    for _ in 0..search.initial_temperature_samples {
        let Some(transition) = random_transition(placement, solution, &pool, search.swap_primary_probability, rng) else {
            continue;
        };
        if let Some(inverse) = solution.try_apply(placement, transition, true) {
            sampled_total += (energy(placement, solution, weight) - start_energy).abs();
            samples += 1;
            solution.apply(placement, inverse);
        }
    }
    let mut temperature = if samples > 0 {
        (sampled_total / f64::from(samples)).max(MIN_TEMPERATURE)
    } else {
        MIN_TEMPERATURE
    };

    let mut current = start_energy;
    let mut best: (ViolationProfile, f64) = (start_profile.clone(), start_energy);
    let mut best_assignment: Option<Assignment> = None;
    let per_round = search.transitions_per_round.max(1);
    let mut step = 0u32;

    while budget.spend() {
        step += 1;
        if step % per_round == 0 {
            temperature = (temperature * search.temperature_decay_rate).max(MIN_TEMPERATURE);
        }
        let Some(transition) = random_transition(placement, solution, &pool, search.swap_primary_probability, rng) else {
            continue;
        };
        let Some(inverse) = solution.try_apply(placement, transition, true) else {
            continue;
        };
        let profile = solution.profile(table);
        if profile > start_profile || solution.moved_replicas() > max_moved {
            solution.apply(placement, inverse);
            continue;
        }
        let next = energy(placement, solution, weight);
        let delta = next - current;
        let accept = delta < 0.0 || rng.gen_bool((-delta / temperature).exp().clamp(0.0, 1.0));
        if !accept {
            solution.apply(placement, inverse);
            continue;
        }
        current = next;
        outcome.accepted += 1;
        if profile < best.0 || (profile == best.0 && next < best.1 - ENERGY_EPSILON) {
            best = (profile, next);
            best_assignment = Some(solution.assignment().clone());
        }
    }
    outcome.interrupted = budget.timed_out();

    let improved = best.0 < start_profile || best.1 < start_energy - ENERGY_EPSILON;
    let chosen = match best_assignment {
        Some(assignment) if improved => assignment,
        _ => start,
    };
    *solution = Solution::with_assignment(placement, config, chosen);
    outcome.improved = improved;
    outcome.energy_after = if improved { best.1 } else { start_energy };

    debug!(
        domain = %placement.domain_id,
        accepted = outcome.accepted,
        energy_before = outcome.energy_before,
        energy_after = outcome.energy_after,
        moved = solution.moved_replicas(),
        iterations = budget.used(),
        "balancing finished"
    );
    outcome
}

// ── Domain plan ────────────────────────────────────────────────

/// Which phases the refresh loop allows for this domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseRequest {
    pub placement: bool,
    pub constraint_check: bool,
    pub balancing: bool,
    /// Outside the partial-delay window after node churn.
    pub fix_domain_violations: bool,
    /// Mixed into the configured seed.
    pub seed: u64,
}

impl PhaseRequest {
    pub fn all() -> Self {
        Self {
            placement: true,
            constraint_check: true,
            balancing: true,
            fix_domain_violations: true,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DomainPlan {
    pub domain_id: String,
    pub batches: Vec<MovementBatch>,
    pub phases_run: Vec<SchedulerPhase>,
    pub profile_before: ViolationProfile,
    pub profile_after: ViolationProfile,
    /// Violations still present after the search.
    pub remaining: Vec<(ViolationSubject, ConstraintKind)>,
    /// Violations the search proved it cannot fix.
    pub infeasible: Vec<(ViolationSubject, ConstraintKind)>,
}

impl DomainPlan {
    pub fn movement_count(&self) -> usize {
        self.batches
            .iter()
            .flat_map(|b| &b.movements)
            .filter(|m| m.kind.is_change())
            .count()
    }
}

/// Record `phase` against every partition whose replicas differ from
/// `before`.
fn label_changes(
    placement: &Placement,
    before: &Assignment,
    after: &Assignment,
    phase: SchedulerPhase,
    labels: &mut [Option<SchedulerPhase>],
) -> bool {
    let mut changed = false;
    for (index, entry) in placement.partitions.iter().enumerate() {
        let differs = entry
            .replicas
            .iter()
            .any(|r| before.nodes[r.0] != after.nodes[r.0] || before.roles[r.0] != after.roles[r.0]);
        if differs {
            labels[index] = Some(phase);
            changed = true;
        }
    }
    changed
}

/// Run the requested phases on one domain and build its movement plan.
pub fn plan_domain(placement: &Placement, config: &KeelConfig, request: PhaseRequest) -> DomainPlan {
    let table = ConstraintTable::from_config(config);
    let mut rng = StdRng::seed_from_u64(config.search.seed.wrapping_add(request.seed));
    let mut solution = Solution::new(placement, config);
    let mut labels: Vec<Option<SchedulerPhase>> = vec![None; placement.partitions.len()];
    let mut infeasible: BTreeSet<PartitionIndex> = BTreeSet::new();
    let mut plan = DomainPlan {
        domain_id: placement.domain_id.clone(),
        profile_before: solution.profile(&table),
        ..Default::default()
    };
    let mut changed = false;

    if request.placement && needs_placement(placement, &solution) {
        let before = solution.assignment().clone();
        let mut budget = Budget::new(config.search.placement_iterations, config.search.placement_timeout());
        let outcome = run_placement(placement, &mut solution, config, &table, &mut rng, &mut budget);
        for replica in &outcome.unplaced {
            infeasible.insert(placement.replica(*replica).partition);
        }
        changed |= label_changes(placement, &before, solution.assignment(), SchedulerPhase::Placement, &mut labels);
        plan.phases_run.push(SchedulerPhase::Placement);
    }

    if request.constraint_check && has_fixable_violations(&solution, &table, request.fix_domain_violations) {
        let before = solution.assignment().clone();
        let mut budget = Budget::new(
            config.search.constraint_check_iterations,
            config.search.constraint_check_timeout(),
        );
        let outcome = run_constraint_check(
            placement,
            &mut solution,
            config,
            &table,
            request.fix_domain_violations,
            &mut budget,
        );
        for (subject, kind) in outcome.infeasible {
            if let ViolationSubject::Partition(id) = &subject {
                infeasible.extend(placement.partition_index(id));
            } else {
                warn!(domain = %placement.domain_id, %subject, %kind, "capacity violation cannot be fixed");
            }
            plan.infeasible.push((subject, kind));
        }
        changed |= label_changes(placement, &before, solution.assignment(), SchedulerPhase::ConstraintCheck, &mut labels);
        plan.phases_run.push(SchedulerPhase::ConstraintCheck);
    }

    if request.balancing
        && !changed
        && !has_fixable_violations(&solution, &table, request.fix_domain_violations)
        && needs_balancing(placement, &solution)
    {
        let before = solution.assignment().clone();
        let mut budget = Budget::new(config.search.balancing_iterations, config.search.balancing_timeout());
        run_balancing(placement, &mut solution, config, &table, &mut rng, &mut budget);
        label_changes(placement, &before, solution.assignment(), SchedulerPhase::Balancing, &mut labels);
        plan.phases_run.push(SchedulerPhase::Balancing);
    }

    plan.profile_after = solution.profile(&table);
    plan.remaining = solution.violations(placement, &table);
    plan.batches = build_batches(placement, solution.assignment(), &labels, &infeasible);

    info!(
        domain = %plan.domain_id,
        phases = ?plan.phases_run,
        moves = plan.movement_count(),
        infeasible = infeasible.len(),
        "domain planned"
    );
    plan
}
