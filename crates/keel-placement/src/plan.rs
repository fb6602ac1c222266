//! Movement plan builder.
//!
//! Diffs a solution against the snapshot it started from and turns every
//! changed partition into one [`MovementBatch`]:
//!
//! ```text
//!   snapshot        solution          batch
//!   P@n0 S@n1  ──►  S@n0 P@n1   ──►   SwapPrimarySecondary n0 → n1
//!   P@n0 S@n1  ──►  P@n0 S@n2   ──►   MoveSecondary n1 → n2
//!   P@n0       ──►  P@n0 S@n3   ──►   AddSecondary → n3
//! ```
//!
//! Within a batch: adds, then the role swap, then moves, then drops.
//! Two replicas trading nodes collapse into a swap. Partitions the search
//! could not satisfy get a trailing `RequestedPlacementNotPossible`.

use std::collections::{BTreeMap, BTreeSet};

use keel_core::{Movement, MovementBatch, MovementKind, ReplicaRole, SchedulerPhase};

use crate::model::{NodeIndex, PartitionIndex, Placement, ReplicaIndex};
use crate::solution::Assignment;

/// Final node and role of one replica after exchange collapsing.
#[derive(Debug, Clone, Copy)]
struct Outcome {
    replica: ReplicaIndex,
    original: Option<NodeIndex>,
    original_role: ReplicaRole,
    node: Option<NodeIndex>,
    role: ReplicaRole,
}

/// Build batches for every partition that changed or is infeasible.
///
/// `phases[p]` names the phase that last changed partition `p`.
pub fn build_batches(
    placement: &Placement,
    assignment: &Assignment,
    phases: &[Option<SchedulerPhase>],
    infeasible: &BTreeSet<PartitionIndex>,
) -> Vec<MovementBatch> {
    let mut batches = Vec::new();
    for index in 0..placement.partitions.len() {
        let partition = PartitionIndex(index);
        let mut movements = partition_movements(placement, assignment, partition);
        let reported = infeasible.contains(&partition);
        if reported {
            movements.push(Movement {
                kind: MovementKind::RequestedPlacementNotPossible,
                source: None,
                target: None,
            });
        }
        if movements.is_empty() {
            continue;
        }
        let entry = placement.partition(partition);
        let phase = phases[index].unwrap_or(if reported && movements.len() == 1 {
            SchedulerPhase::ConstraintCheck
        } else {
            SchedulerPhase::Placement
        });
        batches.push(MovementBatch {
            partition_id: entry.id.clone(),
            service: placement.service(entry.service).name.clone(),
            phase,
            movements,
        });
    }
    batches
}

fn outcomes(placement: &Placement, assignment: &Assignment, partition: PartitionIndex) -> Vec<Outcome> {
    let mut out: Vec<Outcome> = placement
        .partition(partition)
        .replicas
        .iter()
        .map(|&replica| {
            let info = placement.replica(replica);
            Outcome {
                replica,
                original: info.original_node,
                original_role: info.original_role,
                node: assignment.nodes[replica.0],
                role: assignment.roles[replica.0],
            }
        })
        .collect();

    // A→b with B→a is the same as both staying put with exchanged roles.
    let moved: BTreeMap<(NodeIndex, NodeIndex), usize> = out
        .iter()
        .enumerate()
        .filter_map(|(i, o)| match (o.original, o.node) {
            (Some(from), Some(to)) if from != to => Some(((from, to), i)),
            _ => None,
        })
        .collect();
    for (&(from, to), &i) in &moved {
        if from < to
            && let Some(&j) = moved.get(&(to, from))
        {
            let (role_i, role_j) = (out[i].role, out[j].role);
            out[i].node = Some(from);
            out[i].role = role_j;
            out[j].node = Some(to);
            out[j].role = role_i;
        }
    }
    out
}

fn role_kind(role: ReplicaRole, add: MovementKind, primary: MovementKind, secondary: MovementKind) -> MovementKind {
    match role {
        ReplicaRole::Primary => primary,
        ReplicaRole::Instance => add,
        _ => secondary,
    }
}

fn partition_movements(placement: &Placement, assignment: &Assignment, partition: PartitionIndex) -> Vec<Movement> {
    let outcomes = outcomes(placement, assignment, partition);
    let node_id = |n: NodeIndex| placement.node(n).id.clone();

    let mut adds = Vec::new();
    let mut swaps = Vec::new();
    let mut moves = Vec::new();
    let mut drops = Vec::new();

    let old_primary = outcomes
        .iter()
        .find(|o| o.original.is_some() && o.original_role == ReplicaRole::Primary);
    let new_primary = outcomes
        .iter()
        .find(|o| o.node.is_some() && o.role == ReplicaRole::Primary);
    if let Some(new) = new_primary
        && old_primary.is_none_or(|old| old.replica != new.replica)
        && (new.original.is_some() || old_primary.is_some())
    {
        // The replica taking over keeps its source node for the swap; a
        // brand-new one is added first and swapped in place.
        let target = new.original.or(new.node);
        swaps.push(Movement {
            kind: MovementKind::SwapPrimarySecondary,
            source: old_primary.and_then(|o| o.original).map(node_id),
            target: target.map(node_id),
        });
    }

    for o in &outcomes {
        match (o.original, o.node) {
            (None, Some(to)) => {
                // Swapped-in primaries arrive as secondaries.
                let role = if o.role == ReplicaRole::Primary && old_primary.is_some() {
                    ReplicaRole::Secondary
                } else {
                    o.role
                };
                adds.push(Movement {
                    kind: role_kind(role, MovementKind::AddInstance, MovementKind::AddPrimary, MovementKind::AddSecondary),
                    source: None,
                    target: Some(node_id(to)),
                });
            }
            (Some(from), Some(to)) if from != to => moves.push(Movement {
                kind: role_kind(o.role, MovementKind::MoveInstance, MovementKind::MovePrimary, MovementKind::MoveSecondary),
                source: Some(node_id(from)),
                target: Some(node_id(to)),
            }),
            (Some(from), None) => drops.push(Movement {
                kind: role_kind(o.role, MovementKind::DropInstance, MovementKind::DropPrimary, MovementKind::DropSecondary),
                source: Some(node_id(from)),
                target: None,
            }),
            _ => {}
        }
    }

    adds.into_iter().chain(swaps).chain(moves).chain(drops).collect()
}
