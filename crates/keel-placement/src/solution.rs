//! Mutable replica assignment with incremental bookkeeping.
//!
//! A [`Solution`] maps every replica slot to a node (or none) and a role,
//! and keeps the capacity ledger, affinity presence, per-partition
//! violations, and churn in step with every [`Transition`]. Applying a
//! transition returns its inverse, which the search uses to back out
//! rejected candidates.
//!
//! Two replicas of one partition on one node, and load counters going
//! negative, are bookkeeping bugs and panic.

use std::collections::{BTreeMap, BTreeSet};

use keel_core::{KeelConfig, ReplicaRole};
use keel_core::config::MoveCostConfig;

use crate::capacity::CapacityLedger;
use crate::constraints::{
    ConstraintKind, ConstraintTable, KIND_COUNT, ViolationProfile, ViolationSubject, partition_violations,
};
use crate::model::*;

/// Node and role of every replica slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub nodes: Vec<Option<NodeIndex>>,
    pub roles: Vec<ReplicaRole>,
}

impl Assignment {
    /// The assignment described by the snapshot itself.
    pub fn original(placement: &Placement) -> Self {
        Self {
            nodes: placement.replicas.iter().map(|r| r.original_node).collect(),
            roles: placement.replicas.iter().map(|r| r.original_role).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Place, relocate, or (with `to: None`) drop a replica.
    Move { replica: ReplicaIndex, to: Option<NodeIndex> },
    /// Exchange the roles of two replicas of the same partition.
    Swap { first: ReplicaIndex, second: ReplicaIndex },
}

impl Transition {
    pub fn is_swap(&self) -> bool {
        matches!(self, Transition::Swap { .. })
    }
}

/// Replicas of one service on one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Presence {
    pub replicas: u32,
    pub primaries: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Churn {
    cost: f64,
    moved: u32,
}

#[derive(Debug, Clone)]
pub struct Solution {
    assignment: Assignment,
    ledger: CapacityLedger,
    presence: Vec<BTreeMap<NodeIndex, Presence>>,
    node_replicas: Vec<BTreeSet<ReplicaIndex>>,
    partition_violations: Vec<[u64; KIND_COUNT]>,
    node_overload: Vec<u64>,
    app_overload: Vec<u64>,
    app_scaleout: Vec<u64>,
    totals: [u64; KIND_COUNT],
    churn: Vec<Churn>,
    churn_cost: f64,
    moved: usize,
    prevent_transient_overcommit: bool,
    allow_higher_child_target: bool,
    move_cost: MoveCostConfig,
}

impl Solution {
    pub fn new(placement: &Placement, config: &KeelConfig) -> Self {
        Self::with_assignment(placement, config, Assignment::original(placement))
    }

    pub fn with_assignment(placement: &Placement, config: &KeelConfig, assignment: Assignment) -> Self {
        let mut solution = Self {
            assignment: Assignment {
                nodes: vec![None; placement.replicas.len()],
                roles: assignment.roles.clone(),
            },
            ledger: CapacityLedger::new(placement),
            presence: vec![BTreeMap::new(); placement.services.len()],
            node_replicas: vec![BTreeSet::new(); placement.nodes.len()],
            partition_violations: vec![[0; KIND_COUNT]; placement.partitions.len()],
            node_overload: vec![0; placement.nodes.len()],
            app_overload: vec![0; placement.applications.len()],
            app_scaleout: vec![0; placement.applications.len()],
            totals: [0; KIND_COUNT],
            churn: vec![Churn::default(); placement.partitions.len()],
            churn_cost: 0.0,
            moved: 0,
            prevent_transient_overcommit: config.load.prevent_transient_overcommit,
            allow_higher_child_target: config.affinity.allow_higher_child_target,
            move_cost: config.move_cost.clone(),
        };

        for (index, node) in assignment.nodes.iter().enumerate() {
            let replica = ReplicaIndex(index);
            if let Some(node) = *node {
                solution.attach(placement, replica, node);
            }
            solution.assignment.nodes[index] = *node;
            let original = placement.replica(replica).original_node;
            solution.update_hold(placement, replica, original, *node);
        }

        for p in 0..placement.partitions.len() {
            let violations = partition_violations(placement, &solution, PartitionIndex(p));
            solution.partition_violations[p] = violations;
            for kind in ConstraintKind::ALL.iter().filter(|k| k.is_partition_scoped()) {
                solution.totals[kind.index()] += violations[kind.index()];
            }
            let churn = solution.partition_churn(placement, PartitionIndex(p));
            solution.churn_cost += churn.cost;
            solution.moved += churn.moved as usize;
            solution.churn[p] = churn;
        }
        for n in placement.node_indices() {
            let overload = solution.ledger.node_overload(placement, n);
            solution.node_overload[n.0] = overload;
            solution.totals[ConstraintKind::NodeCapacity.index()] += overload;
        }
        for a in 0..placement.applications.len() {
            let app = ApplicationIndex(a);
            solution.app_overload[a] = solution.ledger.application_overload(placement, app);
            solution.app_scaleout[a] = solution.ledger.scaleout_excess(placement, app);
            solution.totals[ConstraintKind::ApplicationCapacity.index()] += solution.app_overload[a];
            solution.totals[ConstraintKind::ScaleoutCount.index()] += solution.app_scaleout[a];
        }
        solution
    }

    // ── Queries ────────────────────────────────────────────────

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    pub fn into_assignment(self) -> Assignment {
        self.assignment
    }

    pub fn node_of(&self, replica: ReplicaIndex) -> Option<NodeIndex> {
        self.assignment.nodes[replica.0]
    }

    pub fn role_of(&self, replica: ReplicaIndex) -> ReplicaRole {
        self.assignment.roles[replica.0]
    }

    pub fn ledger(&self) -> &CapacityLedger {
        &self.ledger
    }

    pub fn presence(&self, service: ServiceIndex) -> &BTreeMap<NodeIndex, Presence> {
        &self.presence[service.0]
    }

    pub fn replicas_on(&self, node: NodeIndex) -> &BTreeSet<ReplicaIndex> {
        &self.node_replicas[node.0]
    }

    pub fn allow_higher_child_target(&self) -> bool {
        self.allow_higher_child_target
    }

    pub fn totals(&self) -> &[u64; KIND_COUNT] {
        &self.totals
    }

    pub fn profile(&self, table: &ConstraintTable) -> ViolationProfile {
        table.profile(&self.totals)
    }

    pub fn partition_violation(&self, partition: PartitionIndex, kind: ConstraintKind) -> u64 {
        self.partition_violations[partition.0][kind.index()]
    }

    pub fn node_overload(&self, node: NodeIndex) -> u64 {
        self.node_overload[node.0]
    }

    pub fn application_overload(&self, app: ApplicationIndex) -> u64 {
        self.app_overload[app.0]
    }

    pub fn scaleout_excess(&self, app: ApplicationIndex) -> u64 {
        self.app_scaleout[app.0]
    }

    /// Weighted cost of every move and swap relative to the snapshot.
    pub fn churn_cost(&self) -> f64 {
        self.churn_cost
    }

    /// Existing replicas currently away from their original node.
    pub fn moved_replicas(&self) -> usize {
        self.moved
    }

    /// Whether `node` already holds a replica of `partition`, counting
    /// down and dropping replicas.
    pub fn partition_occupies(&self, placement: &Placement, partition: PartitionIndex, node: NodeIndex) -> bool {
        let entry = placement.partition(partition);
        entry.occupied.contains(&node)
            || entry.replicas.iter().any(|&r| self.node_of(r) == Some(node))
    }

    /// Cost of applying `transition` on its own.
    pub fn transition_cost(&self, placement: &Placement, transition: &Transition) -> f64 {
        match *transition {
            Transition::Move { replica, .. } => {
                let partition = placement.partition(placement.replica(replica).partition);
                f64::from(self.move_cost.value(partition.move_cost))
            }
            Transition::Swap { first, .. } => {
                let partition = placement.partition(placement.replica(first).partition);
                f64::from(self.move_cost.value(partition.move_cost)) * self.move_cost.swap_cost
            }
        }
    }

    /// Nodes whose load a transition changes.
    pub fn touched_nodes(&self, transition: &Transition) -> Vec<NodeIndex> {
        match *transition {
            Transition::Move { replica, to } => self.node_of(replica).into_iter().chain(to).collect(),
            Transition::Swap { first, second } => {
                self.node_of(first).into_iter().chain(self.node_of(second)).collect()
            }
        }
    }

    // ── Transitions ────────────────────────────────────────────

    /// Apply a transition and return its inverse.
    pub fn apply(&mut self, placement: &Placement, transition: Transition) -> Transition {
        match transition {
            Transition::Move { replica, to } => {
                let from = self.node_of(replica);
                if from == to {
                    return transition;
                }
                if let Some(node) = from {
                    self.detach(placement, replica, node);
                }
                if let Some(node) = to {
                    let partition = placement.replica(replica).partition;
                    assert!(
                        !self.partition_occupies(placement, partition, node),
                        "second replica of partition {} on node {}",
                        placement.partition(partition).id,
                        placement.node(node).id
                    );
                    self.attach(placement, replica, node);
                }
                self.assignment.nodes[replica.0] = to;
                self.update_hold(placement, replica, from, to);

                let mut nodes: Vec<NodeIndex> = from.into_iter().chain(to).collect();
                nodes.extend(placement.replica(replica).original_node);
                self.refresh(placement, placement.replica(replica).partition, &nodes);
                Transition::Move { replica, to: from }
            }
            Transition::Swap { first, second } => {
                let partition = placement.replica(first).partition;
                assert_eq!(partition, placement.replica(second).partition, "swap across partitions");
                let (Some(a), Some(b)) = (self.node_of(first), self.node_of(second)) else {
                    panic!("swap of an unplaced replica");
                };
                self.detach(placement, first, a);
                self.detach(placement, second, b);
                self.assignment.roles.swap(first.0, second.0);
                self.attach(placement, first, a);
                self.attach(placement, second, b);
                self.refresh(placement, partition, &[a, b]);
                transition
            }
        }
    }

    /// Apply a transition only if every node whose load grows stays
    /// within its capacity (less the node buffer when `buffered`).
    /// Returns the inverse when applied; leaves the solution untouched
    /// otherwise.
    pub fn try_apply(&mut self, placement: &Placement, transition: Transition, buffered: bool) -> Option<Transition> {
        let before: Vec<(NodeIndex, Vec<u64>)> = self
            .touched_nodes(&transition)
            .into_iter()
            .map(|node| {
                let loads = placement
                    .metric_indices()
                    .map(|m| self.ledger.effective_load(placement, node, m))
                    .collect();
                (node, loads)
            })
            .collect();

        let inverse = self.apply(placement, transition);
        let fits = before.iter().all(|(node, loads)| {
            placement.metric_indices().all(|m| {
                let now = self.ledger.effective_load(placement, *node, m);
                now <= loads[m.0]
                    || CapacityLedger::limit(placement, *node, m, buffered).is_none_or(|limit| now <= limit)
            })
        });
        if fits {
            Some(inverse)
        } else {
            self.apply(placement, inverse);
            None
        }
    }

    fn loads(&self, placement: &Placement, replica: ReplicaIndex, role: ReplicaRole, node: NodeIndex) -> Vec<(MetricIndex, u64)> {
        placement
            .replica_loads(placement.replica(replica).partition, role, node)
            .collect()
    }

    fn attach(&mut self, placement: &Placement, replica: ReplicaIndex, node: NodeIndex) {
        let role = self.role_of(replica);
        let loads = self.loads(placement, replica, role, node);
        let service = placement.service_of(replica);
        let service_index = placement.partition(placement.replica(replica).partition).service;
        self.ledger.add(node, service.application, &loads);
        assert!(self.node_replicas[node.0].insert(replica), "replica attached twice");
        if !placement.replica(replica).move_in_progress {
            let presence = self.presence[service_index.0].entry(node).or_default();
            presence.replicas += 1;
            if role == ReplicaRole::Primary {
                presence.primaries += 1;
            }
        }
    }

    fn detach(&mut self, placement: &Placement, replica: ReplicaIndex, node: NodeIndex) {
        let role = self.role_of(replica);
        let loads = self.loads(placement, replica, role, node);
        let service = placement.service_of(replica);
        let service_index = placement.partition(placement.replica(replica).partition).service;
        self.ledger.remove(node, service.application, &loads);
        assert!(self.node_replicas[node.0].remove(&replica), "replica detached from wrong node");
        if !placement.replica(replica).move_in_progress {
            let map = &mut self.presence[service_index.0];
            let Some(presence) = map.get_mut(&node) else {
                panic!("presence missing for occupied node");
            };
            presence.replicas -= 1;
            if role == ReplicaRole::Primary {
                presence.primaries -= 1;
            }
            if presence.replicas == 0 {
                map.remove(&node);
            }
        }
    }

    /// Keep the load of a replica reserved on its original node while it
    /// is elsewhere.
    fn update_hold(&mut self, placement: &Placement, replica: ReplicaIndex, from: Option<NodeIndex>, to: Option<NodeIndex>) {
        if !self.prevent_transient_overcommit {
            return;
        }
        let info = placement.replica(replica);
        let Some(original) = info.original_node else {
            return;
        };
        let was_away = from != Some(original);
        let is_away = to != Some(original);
        if was_away == is_away {
            return;
        }
        let loads = self.loads(placement, replica, info.original_role, original);
        if is_away {
            self.ledger.hold(original, &loads);
        } else {
            self.ledger.release(original, &loads);
        }
    }

    fn refresh(&mut self, placement: &Placement, partition: PartitionIndex, nodes: &[NodeIndex]) {
        let service = placement.service(placement.partition(partition).service);

        let mut partitions = vec![partition];
        for child in &service.children {
            partitions.extend(placement.service(*child).partitions.iter().copied());
        }
        for p in partitions {
            let fresh = partition_violations(placement, self, p);
            let old = std::mem::replace(&mut self.partition_violations[p.0], fresh);
            for kind in ConstraintKind::ALL.iter().filter(|k| k.is_partition_scoped()) {
                let i = kind.index();
                self.totals[i] = self.totals[i] - old[i] + fresh[i];
            }
        }

        let mut seen = BTreeSet::new();
        for &node in nodes {
            if !seen.insert(node) {
                continue;
            }
            let fresh = self.ledger.node_overload(placement, node);
            let i = ConstraintKind::NodeCapacity.index();
            self.totals[i] = self.totals[i] - self.node_overload[node.0] + fresh;
            self.node_overload[node.0] = fresh;
        }

        if let Some(app) = service.application {
            let overload = self.ledger.application_overload(placement, app);
            let scaleout = self.ledger.scaleout_excess(placement, app);
            let i = ConstraintKind::ApplicationCapacity.index();
            self.totals[i] = self.totals[i] - self.app_overload[app.0] + overload;
            let j = ConstraintKind::ScaleoutCount.index();
            self.totals[j] = self.totals[j] - self.app_scaleout[app.0] + scaleout;
            self.app_overload[app.0] = overload;
            self.app_scaleout[app.0] = scaleout;
        }

        let churn = self.partition_churn(placement, partition);
        let old = std::mem::replace(&mut self.churn[partition.0], churn);
        self.churn_cost += churn.cost - old.cost;
        self.moved = self.moved + churn.moved as usize - old.moved as usize;
    }

    fn partition_churn(&self, placement: &Placement, partition: PartitionIndex) -> Churn {
        let entry = placement.partition(partition);
        let value = f64::from(self.move_cost.value(entry.move_cost));
        let mut moved = 0u32;
        let mut role_changes = 0u32;
        for &replica in &entry.replicas {
            let info = placement.replica(replica);
            let Some(original) = info.original_node else {
                continue;
            };
            if let Some(node) = self.node_of(replica)
                && node != original
            {
                moved += 1;
            }
            if self.role_of(replica) != info.original_role {
                role_changes += 1;
            }
        }
        Churn {
            cost: value * (f64::from(moved) + f64::from(role_changes) / 2.0 * self.move_cost.swap_cost),
            moved,
        }
    }

    /// Every violation of an active kind, in table order.
    pub fn violations(&self, placement: &Placement, table: &ConstraintTable) -> Vec<(ViolationSubject, ConstraintKind)> {
        let mut out = Vec::new();
        for &kind in table.kinds() {
            match kind {
                ConstraintKind::NodeCapacity => out.extend(
                    placement
                        .node_indices()
                        .filter(|n| self.node_overload[n.0] > 0)
                        .map(|n| (ViolationSubject::Node(placement.node(n).id.clone()), kind)),
                ),
                ConstraintKind::ApplicationCapacity | ConstraintKind::ScaleoutCount => {
                    let values = if kind == ConstraintKind::ApplicationCapacity {
                        &self.app_overload
                    } else {
                        &self.app_scaleout
                    };
                    out.extend(
                        placement
                            .applications
                            .iter()
                            .zip(values)
                            .filter(|(_, value)| **value > 0)
                            .map(|(app, _)| (ViolationSubject::Application(app.name.clone()), kind)),
                    );
                }
                _ => out.extend(
                    placement
                        .partitions
                        .iter()
                        .zip(&self.partition_violations)
                        .filter(|(_, violations)| violations[kind.index()] > 0)
                        .map(|(entry, _)| (ViolationSubject::Partition(entry.id.clone()), kind)),
                ),
            }
        }
        out
    }

    // ── Offenders ──────────────────────────────────────────────

    /// Movable, placed replicas implicated in violations of `kind`.
    pub fn offenders(&self, placement: &Placement, kind: ConstraintKind, move_parent: bool) -> Vec<ReplicaIndex> {
        let mut out = BTreeSet::new();
        let add_partition = |p: PartitionIndex, out: &mut BTreeSet<ReplicaIndex>| {
            for &r in &placement.partition(p).replicas {
                if placement.replica(r).movable && self.node_of(r).is_some() {
                    out.insert(r);
                }
            }
        };

        match kind {
            ConstraintKind::NodeCapacity => {
                for node in placement.node_indices().filter(|n| self.node_overload[n.0] > 0) {
                    out.extend(
                        self.node_replicas[node.0]
                            .iter()
                            .copied()
                            .filter(|r| placement.replica(*r).movable),
                    );
                }
            }
            ConstraintKind::ApplicationCapacity | ConstraintKind::ScaleoutCount => {
                for (a, app) in placement.applications.iter().enumerate() {
                    let value = if kind == ConstraintKind::ApplicationCapacity {
                        self.app_overload[a]
                    } else {
                        self.app_scaleout[a]
                    };
                    if value == 0 {
                        continue;
                    }
                    for service in &app.services {
                        for &p in &placement.service(*service).partitions {
                            add_partition(p, &mut out);
                        }
                    }
                }
            }
            _ => {
                for p in 0..placement.partitions.len() {
                    if self.partition_violations[p][kind.index()] == 0 {
                        continue;
                    }
                    add_partition(PartitionIndex(p), &mut out);
                    if kind == ConstraintKind::Affinity
                        && move_parent
                        && let Some((parent, _)) = placement.service(placement.partitions[p].service).parent
                    {
                        for &q in &placement.service(parent).partitions {
                            add_partition(q, &mut out);
                        }
                    }
                }
            }
        }
        out.into_iter().collect()
    }
}
