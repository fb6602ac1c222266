//! Constraint evaluation.
//!
//! Constraint kinds form a closed enum; which kinds run and in what
//! order comes from the [`ConstraintTable`] built out of configuration.
//! A solution's violations fold into a [`ViolationProfile`] (one
//! magnitude per active kind, most important first) that compares
//! lexicographically, so a fix of a lower kind can never pay for itself
//! by worsening a higher one.

use std::fmt;

use keel_core::{AffinityKind, KeelConfig, NodeId, PartitionId, ReplicaRole};
use serde::{Deserialize, Serialize};

use crate::model::{NodeIndex, PartitionIndex, Placement};
use crate::solution::Solution;

pub const KIND_COUNT: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    /// Placement-constraint expression and service-type block list.
    Placement,
    FaultDomain,
    UpgradeDomain,
    NodeCapacity,
    ApplicationCapacity,
    ScaleoutCount,
    Affinity,
    /// Replicas on nodes that are being removed.
    NodeProperty,
    PreferredLocation,
}

impl ConstraintKind {
    pub const ALL: [ConstraintKind; KIND_COUNT] = [
        ConstraintKind::Placement,
        ConstraintKind::FaultDomain,
        ConstraintKind::UpgradeDomain,
        ConstraintKind::NodeCapacity,
        ConstraintKind::ApplicationCapacity,
        ConstraintKind::ScaleoutCount,
        ConstraintKind::Affinity,
        ConstraintKind::NodeProperty,
        ConstraintKind::PreferredLocation,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    fn configured_priority(self, config: &KeelConfig) -> i32 {
        let p = &config.constraints;
        match self {
            ConstraintKind::Placement => p.placement,
            ConstraintKind::FaultDomain if !config.domains.fault_domain_constraint => -1,
            ConstraintKind::FaultDomain => p.fault_domain,
            ConstraintKind::UpgradeDomain if !config.domains.upgrade_domain_constraint => -1,
            ConstraintKind::UpgradeDomain => p.upgrade_domain,
            ConstraintKind::NodeCapacity => p.node_capacity,
            ConstraintKind::ApplicationCapacity => p.application_capacity,
            ConstraintKind::ScaleoutCount => p.scaleout_count,
            ConstraintKind::Affinity => p.affinity,
            ConstraintKind::NodeProperty => p.node_property,
            ConstraintKind::PreferredLocation => p.preferred_location,
        }
    }

    pub fn is_domain(self) -> bool {
        matches!(self, ConstraintKind::FaultDomain | ConstraintKind::UpgradeDomain)
    }

    fn is_capacity(self) -> bool {
        matches!(
            self,
            ConstraintKind::NodeCapacity | ConstraintKind::ApplicationCapacity | ConstraintKind::ScaleoutCount
        )
    }

    /// Measured per partition rather than per node or application.
    pub fn is_partition_scoped(self) -> bool {
        !self.is_capacity()
    }

    /// An unfixable violation of this kind counts as infeasible.
    /// Partition-scoped ones also reach the caller as
    /// `RequestedPlacementNotPossible`.
    pub fn reports_infeasible(self) -> bool {
        self != ConstraintKind::PreferredLocation
    }
}

/// What a violation is measured against: capacity kinds are per node or
/// per application, everything else per partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum ViolationSubject {
    Partition(PartitionId),
    Node(NodeId),
    Application(String),
}

impl fmt::Display for ViolationSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationSubject::Partition(id) => write!(f, "partition {id}"),
            ViolationSubject::Node(id) => write!(f, "node {id}"),
            ViolationSubject::Application(name) => write!(f, "application {name}"),
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConstraintKind::Placement => "placement",
            ConstraintKind::FaultDomain => "fault_domain",
            ConstraintKind::UpgradeDomain => "upgrade_domain",
            ConstraintKind::NodeCapacity => "node_capacity",
            ConstraintKind::ApplicationCapacity => "application_capacity",
            ConstraintKind::ScaleoutCount => "scaleout_count",
            ConstraintKind::Affinity => "affinity",
            ConstraintKind::NodeProperty => "node_property",
            ConstraintKind::PreferredLocation => "preferred_location",
        };
        f.write_str(s)
    }
}

/// Active constraint kinds in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintTable {
    order: Vec<ConstraintKind>,
}

impl ConstraintTable {
    /// Sort enabled kinds by priority, ties in declaration order. Domain
    /// kinds never rank behind the capacity kinds.
    pub fn from_config(config: &KeelConfig) -> Self {
        let capacity_floor = ConstraintKind::ALL
            .iter()
            .filter(|k| k.is_capacity())
            .map(|k| k.configured_priority(config))
            .filter(|&p| p >= 0)
            .min();

        let mut ranked: Vec<(i32, ConstraintKind)> = ConstraintKind::ALL
            .iter()
            .filter_map(|&kind| {
                let priority = kind.configured_priority(config);
                if priority < 0 {
                    return None;
                }
                let effective = match capacity_floor {
                    Some(floor) if kind.is_domain() => priority.min(floor),
                    _ => priority,
                };
                Some((effective, kind))
            })
            .collect();
        ranked.sort();

        Self {
            order: ranked.into_iter().map(|(_, kind)| kind).collect(),
        }
    }

    pub fn kinds(&self) -> &[ConstraintKind] {
        &self.order
    }

    pub fn contains(&self, kind: ConstraintKind) -> bool {
        self.order.contains(&kind)
    }

    pub fn profile(&self, totals: &[u64; KIND_COUNT]) -> ViolationProfile {
        ViolationProfile(self.order.iter().map(|k| totals[k.index()]).collect())
    }
}

/// Violation magnitudes in table order; compares lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ViolationProfile(pub Vec<u64>);

impl ViolationProfile {
    pub fn is_clean(&self) -> bool {
        self.0.iter().all(|&v| v == 0)
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }
}

/// Violations of every partition-scoped kind for one partition.
pub fn partition_violations(
    placement: &Placement,
    solution: &Solution,
    partition: PartitionIndex,
) -> [u64; KIND_COUNT] {
    let mut out = [0u64; KIND_COUNT];
    let entry = placement.partition(partition);
    let service = placement.service(entry.service);

    let mut nodes: Vec<NodeIndex> = Vec::with_capacity(entry.replicas.len());
    let mut primary: Option<NodeIndex> = None;
    for &replica in &entry.replicas {
        let Some(node) = solution.node_of(replica) else {
            continue;
        };
        nodes.push(node);
        let info = placement.replica(replica);
        if solution.role_of(replica) == ReplicaRole::Primary && !info.move_in_progress {
            primary = Some(node);
        }

        if !service.expression_ok[node.0] {
            out[ConstraintKind::Placement.index()] += 1;
        } else if service.blocked[node.0]
            && (info.original_node != Some(node) || info.in_build)
        {
            out[ConstraintKind::Placement.index()] += 1;
        }

        let host = placement.node(node);
        if host.being_removed || host.deactivated {
            out[ConstraintKind::NodeProperty.index()] += 1;
        }
    }

    out[ConstraintKind::FaultDomain.index()] = placement.fault_tree.violation(entry.service, entry.target, &nodes);
    out[ConstraintKind::UpgradeDomain.index()] = placement.upgrade_tree.violation(entry.service, entry.target, &nodes);
    out[ConstraintKind::Affinity.index()] = affinity_violation(placement, solution, partition, primary);
    out[ConstraintKind::PreferredLocation.index()] = preferred_location_violation(placement, solution, partition, primary);
    out
}

fn affinity_violation(
    placement: &Placement,
    solution: &Solution,
    partition: PartitionIndex,
    primary: Option<NodeIndex>,
) -> u64 {
    let entry = placement.partition(partition);
    let service = placement.service(entry.service);
    let Some((parent, kind)) = service.parent else {
        return 0;
    };
    let presence = solution.presence(parent);
    if presence.is_empty() {
        return 0;
    }

    let tolerated = if solution.allow_higher_child_target() {
        service.target.saturating_sub(placement.service(parent).target)
    } else {
        0
    };
    let apart = entry
        .replicas
        .iter()
        .filter(|&&r| !placement.replica(r).move_in_progress)
        .filter_map(|&r| solution.node_of(r))
        .filter(|node| !presence.contains_key(node))
        .count() as u32;

    let mut violation = u64::from(apart.saturating_sub(tolerated));
    if kind == AffinityKind::Aligned
        && let Some(node) = primary
        && presence.values().any(|p| p.primaries > 0)
        && presence.get(&node).is_none_or(|p| p.primaries == 0)
    {
        violation += 1;
    }
    violation
}

fn preferred_location_violation(
    placement: &Placement,
    solution: &Solution,
    partition: PartitionIndex,
    primary: Option<NodeIndex>,
) -> u64 {
    let entry = placement.partition(partition);
    let service = placement.service(entry.service);
    let mut violation = 0;

    if !entry.standby.is_empty() {
        let placed: Vec<NodeIndex> = entry.replicas.iter().filter_map(|&r| solution.node_of(r)).collect();
        let free_standby = entry
            .standby
            .iter()
            .filter(|&&n| service.is_target(placement, n) && !placed.contains(&n))
            .count() as u64;
        let misplaced_new = entry
            .replicas
            .iter()
            .filter(|&&r| placement.replica(r).is_new())
            .filter_map(|&r| solution.node_of(r))
            .filter(|n| !entry.standby.contains(n))
            .count() as u64;
        violation += misplaced_new.min(free_standby);
    }

    if entry.upgrading
        && let Some(original) = entry.original_primary
        && primary != Some(original)
    {
        violation += 1;
    }
    violation
}
