//! End-to-end balancer scenarios.
//!
//! Every test drives the public ingestion API, runs `refresh`, and
//! inspects what reached the movement sink. Movements are applied back
//! to the failover units the way the replica lifecycle would, so the
//! next refresh sees the result.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use keel_balancer::{Balancer, CollectingSink};
use keel_core::*;
use keel_placement::{ConstraintKind, ViolationSubject};

fn make_config(seed: u64) -> KeelConfig {
    let mut config = KeelConfig::default();
    config.search.seed = seed;
    config
}

fn make_balancer(block_list: &[&str]) -> Balancer<CollectingSink> {
    let mut balancer = Balancer::new(CollectingSink::default());
    balancer
        .update_service_type(ServiceTypeDescription {
            name: "T".into(),
            block_list: block_list.iter().map(|n| n.to_string()).collect(),
        })
        .unwrap();
    balancer
}

/// `count` nodes, each in its own fault and upgrade domain.
fn add_flat_nodes(balancer: &mut Balancer<CollectingSink>, count: usize) {
    for i in 0..count {
        balancer
            .update_node(NodeDescription::new(format!("n{i}"), &format!("/fd{i}"), &format!("ud{i}")))
            .unwrap();
    }
}

/// Every placement change emitted so far, in order.
fn emitted_changes(balancer: &Balancer<CollectingSink>) -> Vec<(PartitionId, Movement)> {
    balancer
        .sink()
        .emitted
        .iter()
        .flat_map(|(batches, _)| batches.values())
        .flat_map(|batch| {
            batch
                .movements
                .iter()
                .filter(|m| m.kind.is_change())
                .map(|m| (batch.partition_id.clone(), m.clone()))
        })
        .collect()
}

fn last_batches(balancer: &Balancer<CollectingSink>) -> BTreeMap<PartitionId, MovementBatch> {
    balancer
        .sink()
        .emitted
        .last()
        .map(|(batches, _)| batches.clone())
        .unwrap_or_default()
}

/// Carry out a batch on a failover unit and bump its version.
fn apply_batch(unit: &FailoverUnitDescription, batch: &MovementBatch) -> FailoverUnitDescription {
    let mut next = unit.clone();
    next.version += 1;
    for movement in &batch.movements {
        let source = movement.source.as_deref();
        let target = movement.target.as_deref();
        match movement.kind {
            MovementKind::AddPrimary | MovementKind::AddSecondary | MovementKind::AddInstance => {
                let role = match movement.kind {
                    MovementKind::AddPrimary => ReplicaRole::Primary,
                    MovementKind::AddSecondary => ReplicaRole::Secondary,
                    _ => ReplicaRole::Instance,
                };
                next.replicas.push(ReplicaDescription::new(target.unwrap(), role));
            }
            MovementKind::MovePrimary | MovementKind::MoveSecondary | MovementKind::MoveInstance => {
                let replica = next
                    .replicas
                    .iter_mut()
                    .find(|r| Some(r.node.as_str()) == source)
                    .unwrap();
                replica.node = target.unwrap().to_string();
            }
            MovementKind::SwapPrimarySecondary => {
                for replica in &mut next.replicas {
                    if Some(replica.node.as_str()) == source {
                        replica.role = ReplicaRole::Secondary;
                    } else if Some(replica.node.as_str()) == target {
                        replica.role = ReplicaRole::Primary;
                    }
                }
            }
            MovementKind::DropPrimary | MovementKind::DropSecondary | MovementKind::DropInstance => {
                next.replicas.retain(|r| Some(r.node.as_str()) != source);
            }
            MovementKind::RequestedPlacementNotPossible => {}
        }
    }
    next
}

/// Push the last emitted plan back into the balancer as new versions.
fn apply_last_plan(
    balancer: &mut Balancer<CollectingSink>,
    units: &mut BTreeMap<PartitionId, FailoverUnitDescription>,
) {
    for (id, batch) in last_batches(balancer) {
        let next = apply_batch(&units[&id], &batch);
        balancer.update_failover_unit(next.clone()).unwrap();
        units.insert(id, next);
    }
}

// ── Scenarios ──────────────────────────────────────────────────

#[test]
fn scenario_a_blocked_nodes_keep_existing_replicas() {
    let config = make_config(1);
    let mut balancer = make_balancer(&["n1", "n3"]);
    add_flat_nodes(&mut balancer, 5);
    balancer.update_service(ServiceDescription::stateful("single", "T", 1)).unwrap();
    balancer
        .update_service(ServiceDescription::stateless("web", "T", ReplicaTarget::Count(5)))
        .unwrap();
    for i in 0..5 {
        balancer
            .update_failover_unit(
                FailoverUnitDescription::new(&format!("p{i}"), "single", 1)
                    .with_replica(&format!("n{i}"), ReplicaRole::Primary),
            )
            .unwrap();
    }
    let mut web = FailoverUnitDescription::new("web0", "web", 1);
    for i in 0..5 {
        web = web.with_replica(&format!("n{i}"), ReplicaRole::Instance);
    }
    balancer.update_failover_unit(web).unwrap();

    let stats = balancer.refresh(Instant::now(), &config);
    assert_eq!(stats.movements, 0);
    assert!(balancer.sink().emitted.is_empty());
    assert!(balancer.violation_counters().is_empty());
}

#[test]
fn scenario_b_same_datacenter_pair_moves_once_across() {
    let config = make_config(2);
    let mut balancer = make_balancer(&[]);
    for i in 0..8 {
        let fault_domain = format!("/dc{}/r{}", i / 4, (i / 2) % 2);
        balancer
            .update_node(NodeDescription::new(format!("n{i}"), &fault_domain, &format!("ud{i}")))
            .unwrap();
    }
    balancer.update_service(ServiceDescription::stateful("svc", "T", 2)).unwrap();
    balancer
        .update_failover_unit(
            FailoverUnitDescription::new("p0", "svc", 1)
                .with_replica("n0", ReplicaRole::Primary)
                .with_replica("n2", ReplicaRole::Secondary),
        )
        .unwrap();

    let stats = balancer.refresh(Instant::now(), &config);
    assert_eq!(stats.movements, 1);
    let changes = emitted_changes(&balancer);
    assert_eq!(changes.len(), 1);
    let (partition, movement) = &changes[0];
    assert_eq!(partition, "p0");
    assert!(movement.kind.is_move());
    assert!(matches!(movement.source.as_deref(), Some("n0") | Some("n2")));
    let dc1: BTreeSet<&str> = ["n4", "n5", "n6", "n7"].into();
    assert!(dc1.contains(movement.target.as_deref().unwrap()));
}

#[test]
fn scenario_c_overloaded_node_sheds_exactly_the_excess() {
    let config = make_config(3);
    let mut balancer = make_balancer(&[]);
    balancer
        .update_node(NodeDescription::new("n0", "/fd0", "ud0").with_capacity("Count", 25))
        .unwrap();
    balancer.update_node(NodeDescription::new("n1", "/fd1", "ud1")).unwrap();
    balancer
        .update_service(ServiceDescription::stateful("svc", "T", 1).with_metric(ServiceMetric::new("Count", 1, 1)))
        .unwrap();
    for i in 0..50 {
        balancer
            .update_failover_unit(
                FailoverUnitDescription::new(&format!("p{i}"), "svc", 1).with_replica("n0", ReplicaRole::Primary),
            )
            .unwrap();
    }

    let stats = balancer.refresh(Instant::now(), &config);
    assert_eq!(stats.movements, 25);
    let changes = emitted_changes(&balancer);
    assert_eq!(changes.len(), 25);
    for (_, movement) in &changes {
        assert_eq!(movement.kind, MovementKind::MovePrimary);
        assert_eq!(movement.source.as_deref(), Some("n0"));
        assert_eq!(movement.target.as_deref(), Some("n1"));
    }
}

#[test]
fn scenario_d_higher_child_target_is_tolerated() {
    let config = make_config(4);
    let mut balancer = make_balancer(&[]);
    add_flat_nodes(&mut balancer, 4);
    balancer.update_service(ServiceDescription::stateful("parent", "T", 3)).unwrap();
    balancer
        .update_service(ServiceDescription::stateful("child", "T", 4).with_affinity("parent", AffinityKind::Aligned))
        .unwrap();
    balancer
        .update_failover_unit(
            FailoverUnitDescription::new("parent0", "parent", 1)
                .with_replica("n0", ReplicaRole::Primary)
                .with_replica("n1", ReplicaRole::Secondary)
                .with_replica("n2", ReplicaRole::Secondary),
        )
        .unwrap();
    balancer
        .update_failover_unit(
            FailoverUnitDescription::new("child0", "child", 1)
                .with_replica("n0", ReplicaRole::Primary)
                .with_replica("n1", ReplicaRole::Secondary)
                .with_replica("n2", ReplicaRole::Secondary)
                .with_replica("n3", ReplicaRole::Secondary),
        )
        .unwrap();

    let stats = balancer.refresh(Instant::now(), &config);
    assert_eq!(stats.domains, 1);
    assert_eq!(stats.movements, 0);
    assert_eq!(stats.infeasible, 0);
    assert!(balancer.violation_counters().is_empty());
    assert!(balancer.health_report(&config).is_empty());
}

// ── Properties ─────────────────────────────────────────────────

#[test]
fn refresh_is_idempotent_without_new_input() {
    let config = make_config(5);
    let mut balancer = make_balancer(&[]);
    balancer
        .update_node(NodeDescription::new("n0", "/fd0", "ud0").with_capacity("Count", 3))
        .unwrap();
    balancer.update_node(NodeDescription::new("n1", "/fd1", "ud1")).unwrap();
    balancer.update_node(NodeDescription::new("n2", "/fd2", "ud2")).unwrap();
    balancer
        .update_service(ServiceDescription::stateful("svc", "T", 1).with_metric(ServiceMetric::new("Count", 1, 1)))
        .unwrap();
    for i in 0..6 {
        balancer
            .update_failover_unit(
                FailoverUnitDescription::new(&format!("p{i}"), "svc", 1).with_replica("n0", ReplicaRole::Primary),
            )
            .unwrap();
    }
    balancer.update_service(ServiceDescription::stateful("fresh", "T", 3)).unwrap();
    balancer
        .update_failover_unit(FailoverUnitDescription::new("f0", "fresh", 1))
        .unwrap();

    let now = Instant::now();
    let first = balancer.refresh(now, &config);
    assert_eq!(first.movements, 3 + 3);
    let callbacks = balancer.sink().emitted.len();

    let second = balancer.refresh(now, &config);
    assert_eq!(second.movements, 0);
    assert_eq!(balancer.sink().emitted.len(), callbacks);
}

#[test]
fn applied_batch_clears_the_violation_it_targeted() {
    let config = make_config(6);
    let mut balancer = make_balancer(&[]);
    for (i, dc) in ["dc0", "dc0", "dc1", "dc1"].iter().enumerate() {
        balancer
            .update_node(NodeDescription::new(format!("n{i}"), &format!("/{dc}/r{i}"), &format!("ud{i}")))
            .unwrap();
    }
    balancer.update_service(ServiceDescription::stateful("svc", "T", 2)).unwrap();
    let unit = FailoverUnitDescription::new("p0", "svc", 1)
        .with_replica("n0", ReplicaRole::Primary)
        .with_replica("n1", ReplicaRole::Secondary);
    balancer.update_failover_unit(unit.clone()).unwrap();
    let mut units: BTreeMap<PartitionId, FailoverUnitDescription> = [("p0".to_string(), unit)].into();

    let now = Instant::now();
    balancer.refresh(now, &config);
    let batches = last_batches(&balancer);
    assert_eq!(batches["p0"].phase, SchedulerPhase::ConstraintCheck);

    apply_last_plan(&mut balancer, &mut units);
    let stats = balancer.refresh(now + Duration::from_secs(2), &config);
    assert_eq!(stats.movements, 0);
    assert!(
        !balancer
            .violation_counters()
            .contains_key(&(ViolationSubject::Partition("p0".into()), ConstraintKind::FaultDomain))
    );
    assert!(balancer.violation_counters().is_empty());
}

#[test]
fn fault_domains_end_balanced_in_both_modes() {
    for quorum in [false, true] {
        let mut config = make_config(7);
        config.domains.quorum_based_fault_domains = quorum;
        let mut balancer = make_balancer(&[]);
        for i in 0..9 {
            balancer
                .update_node(NodeDescription::new(format!("n{i}"), &format!("/fd{}", i / 3), &format!("ud{i}")))
                .unwrap();
        }
        balancer.update_service(ServiceDescription::stateful("svc", "T", 3)).unwrap();
        let mut units = BTreeMap::new();
        for p in 0..4 {
            let unit = FailoverUnitDescription::new(&format!("p{p}"), "svc", 1)
                .with_replica("n0", ReplicaRole::Primary)
                .with_replica("n1", ReplicaRole::Secondary)
                .with_replica("n2", ReplicaRole::Secondary);
            balancer.update_failover_unit(unit.clone()).unwrap();
            units.insert(unit.partition_id.clone(), unit);
        }

        balancer.refresh(Instant::now(), &config);
        apply_last_plan(&mut balancer, &mut units);

        for unit in units.values() {
            let mut per_domain = [0u32; 3];
            for replica in &unit.replicas {
                let index: usize = replica.node[1..].parse().unwrap();
                per_domain[index / 3] += 1;
            }
            let max = *per_domain.iter().max().unwrap();
            let min = *per_domain.iter().min().unwrap();
            if quorum {
                assert!(max <= 3 / 2, "{} quorum layout {per_domain:?}", unit.partition_id);
            } else {
                assert!(max - min <= 1, "{} layout {per_domain:?}", unit.partition_id);
            }
        }
    }
}

#[test]
fn aligned_child_roles_follow_parent() {
    let config = make_config(8);
    let mut balancer = make_balancer(&[]);
    add_flat_nodes(&mut balancer, 3);
    balancer.update_service(ServiceDescription::stateful("parent", "T", 3)).unwrap();
    balancer
        .update_service(ServiceDescription::stateful("child", "T", 3).with_affinity("parent", AffinityKind::Aligned))
        .unwrap();
    let parent = FailoverUnitDescription::new("parent0", "parent", 1)
        .with_replica("n0", ReplicaRole::Primary)
        .with_replica("n1", ReplicaRole::Secondary)
        .with_replica("n2", ReplicaRole::Secondary);
    let child = FailoverUnitDescription::new("child0", "child", 1)
        .with_replica("n1", ReplicaRole::Primary)
        .with_replica("n0", ReplicaRole::Secondary)
        .with_replica("n2", ReplicaRole::Secondary);
    balancer.update_failover_unit(parent.clone()).unwrap();
    balancer.update_failover_unit(child.clone()).unwrap();
    let mut units: BTreeMap<PartitionId, FailoverUnitDescription> =
        [("parent0".to_string(), parent), ("child0".to_string(), child)].into();

    let stats = balancer.refresh(Instant::now(), &config);
    assert_eq!(stats.movements, 1);
    let changes = emitted_changes(&balancer);
    assert_eq!(changes[0].1.kind, MovementKind::SwapPrimarySecondary);
    apply_last_plan(&mut balancer, &mut units);

    let parent_roles: BTreeMap<&str, ReplicaRole> = units["parent0"]
        .replicas
        .iter()
        .map(|r| (r.node.as_str(), r.role))
        .collect();
    for replica in &units["child0"].replicas {
        assert_eq!(parent_roles.get(replica.node.as_str()), Some(&replica.role), "node {}", replica.node);
    }
}

#[test]
fn placement_never_overfills_a_node() {
    let config = make_config(9);
    let mut balancer = make_balancer(&[]);
    for i in 0..3 {
        balancer
            .update_node(NodeDescription::new(format!("n{i}"), &format!("/fd{i}"), &format!("ud{i}")).with_capacity("Memory", 10))
            .unwrap();
    }
    balancer
        .update_service(ServiceDescription::stateful("svc", "T", 1).with_metric(ServiceMetric::new("Memory", 4, 4)))
        .unwrap();
    for i in 0..7 {
        balancer
            .update_failover_unit(FailoverUnitDescription::new(&format!("p{i}"), "svc", 1))
            .unwrap();
    }

    let stats = balancer.refresh(Instant::now(), &config);
    assert_eq!(stats.movements, 6);

    let mut load: BTreeMap<String, u64> = BTreeMap::new();
    for (_, movement) in emitted_changes(&balancer) {
        assert_eq!(movement.kind, MovementKind::AddPrimary);
        *load.entry(movement.target.unwrap()).or_default() += 4;
    }
    assert!(load.values().all(|&l| l <= 10), "node loads {load:?}");

    let not_possible = last_batches(&balancer)
        .values()
        .flat_map(|b| &b.movements)
        .filter(|m| m.kind == MovementKind::RequestedPlacementNotPossible)
        .count();
    assert_eq!(not_possible, 1);
}

#[test]
fn batched_output_uses_one_callback_per_refresh() {
    let mut config = make_config(10);
    config.refresh.batch_movements = true;
    let mut balancer = make_balancer(&[]);
    add_flat_nodes(&mut balancer, 3);
    for name in ["a", "b"] {
        balancer.update_service(ServiceDescription::stateful(name, "T", 2)).unwrap();
        balancer
            .update_failover_unit(FailoverUnitDescription::new(&format!("{name}0"), name, 1))
            .unwrap();
    }

    let stats = balancer.refresh(Instant::now(), &config);
    assert_eq!(stats.domains, 2);
    assert_eq!(stats.callbacks, 1);
    assert_eq!(stats.movements, 4);
    let (batches, token) = &balancer.sink().emitted[0];
    assert_eq!(batches.len(), 2);
    assert_eq!(*token, DecisionToken(1));
}

fn make_unit(id: &str, service: &str, replicas: &[(&str, ReplicaRole)]) -> FailoverUnitDescription {
    replicas
        .iter()
        .fold(FailoverUnitDescription::new(id, service, 1), |unit, (node, role)| {
            unit.with_replica(node, *role)
        })
}

fn not_possible(batches: &BTreeMap<PartitionId, MovementBatch>, partition: &str) -> bool {
    batches.get(partition).is_some_and(|batch| {
        batch
            .movements
            .iter()
            .any(|m| m.kind == MovementKind::RequestedPlacementNotPossible)
    })
}

// ── Capacity and application bounds ───────────────────────────

#[test]
fn overcommitted_node_surfaces_in_health_counters() {
    let config = make_config(11);
    let mut balancer = make_balancer(&[]);
    for i in 0..2 {
        balancer
            .update_node(NodeDescription::new(format!("n{i}"), &format!("/fd{i}"), &format!("ud{i}")).with_capacity("Count", 5))
            .unwrap();
    }
    balancer
        .update_service(ServiceDescription::stateful("svc", "T", 1).with_metric(ServiceMetric::new("Count", 20, 20)))
        .unwrap();
    balancer
        .update_failover_unit(make_unit("p0", "svc", &[("n0", ReplicaRole::Primary)]))
        .unwrap();

    let now = Instant::now();
    for at in [now, now + Duration::from_secs(2)] {
        let stats = balancer.refresh(at, &config);
        assert_eq!(stats.infeasible, 1);
        assert_eq!(stats.movements, 0);
    }
    assert!(balancer.sink().emitted.is_empty());

    let key = (ViolationSubject::Node("n0".into()), ConstraintKind::NodeCapacity);
    assert_eq!(balancer.violation_counters().get(&key), Some(&2));
    let report = balancer.health_report(&config);
    assert_eq!(report[0].subject, ViolationSubject::Node("n0".into()));
    assert_eq!(report[0].kind, ConstraintKind::NodeCapacity);
    assert_eq!(report[0].refreshes, 2);
}

fn add_application(balancer: &mut Balancer<CollectingSink>, application: ApplicationDescription, partitions: &[&str]) {
    let name = application.name.clone();
    balancer.update_application(application).unwrap();
    balancer
        .update_service(
            ServiceDescription::stateful("svc", "T", 1)
                .with_metric(ServiceMetric::new("Count", 1, 1))
                .with_application(&name),
        )
        .unwrap();
    for (i, node) in partitions.iter().enumerate() {
        balancer
            .update_failover_unit(make_unit(&format!("p{i}"), "svc", &[(*node, ReplicaRole::Primary)]))
            .unwrap();
    }
}

fn occupied_nodes(units: &BTreeMap<PartitionId, FailoverUnitDescription>) -> BTreeMap<String, usize> {
    let mut nodes = BTreeMap::new();
    for replica in units.values().flat_map(|unit| &unit.replicas) {
        *nodes.entry(replica.node.clone()).or_default() += 1;
    }
    nodes
}

#[test]
fn application_per_node_capacity_is_enforced() {
    let config = make_config(12);
    let mut balancer = make_balancer(&[]);
    add_flat_nodes(&mut balancer, 3);
    let application = ApplicationDescription {
        name: "app".into(),
        capacities: vec![ApplicationMetricCapacity {
            metric: "Count".into(),
            total_capacity: 0,
            max_node_capacity: 2,
            reservation: 0,
        }],
        ..Default::default()
    };
    add_application(&mut balancer, application, &["n0", "n0", "n0"]);
    let mut units: BTreeMap<PartitionId, FailoverUnitDescription> = (0..3)
        .map(|i| (format!("p{i}"), make_unit(&format!("p{i}"), "svc", &[("n0", ReplicaRole::Primary)])))
        .collect();

    let stats = balancer.refresh(Instant::now(), &config);
    assert_eq!(stats.movements, 1);
    let changes = emitted_changes(&balancer);
    assert_eq!(changes[0].1.source.as_deref(), Some("n0"));
    apply_last_plan(&mut balancer, &mut units);

    let nodes = occupied_nodes(&units);
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes["n0"], 2);
}

#[test]
fn application_scaleout_bounds_distinct_nodes() {
    let config = make_config(13);
    let mut balancer = make_balancer(&[]);
    add_flat_nodes(&mut balancer, 3);
    let application = ApplicationDescription {
        name: "app".into(),
        scaleout_count: 2,
        ..Default::default()
    };
    add_application(&mut balancer, application, &["n0", "n1", "n2"]);
    let mut units: BTreeMap<PartitionId, FailoverUnitDescription> = ["n0", "n1", "n2"]
        .iter()
        .enumerate()
        .map(|(i, node)| (format!("p{i}"), make_unit(&format!("p{i}"), "svc", &[(*node, ReplicaRole::Primary)])))
        .collect();

    let stats = balancer.refresh(Instant::now(), &config);
    assert_eq!(stats.movements, 1);
    apply_last_plan(&mut balancer, &mut units);
    assert_eq!(occupied_nodes(&units).len(), 2);

    let stats = balancer.refresh(Instant::now() + Duration::from_secs(2), &config);
    assert_eq!(stats.movements, 0);
    assert!(balancer.violation_counters().is_empty());
}

#[test]
fn transient_overcommit_prevention_holds_the_vacated_node() {
    for prevent in [true, false] {
        let mut config = make_config(14);
        config.load.prevent_transient_overcommit = prevent;
        let mut balancer = make_balancer(&[]);
        balancer
            .update_node(NodeDescription::new("n0", "/fd0", "ud0").with_capacity("Count", 1))
            .unwrap();
        let mut leaving = NodeDescription::new("n1", "/fd1", "ud1");
        leaving.deactivation_intent = NodeDeactivationIntent::RemoveData;
        leaving.deactivation_status = NodeDeactivationStatus::SafetyCheckInProgress;
        balancer.update_node(leaving).unwrap();
        balancer
            .update_node(NodeDescription::new("n2", "/fd2", "ud2").with_capacity("Count", 1))
            .unwrap();
        balancer
            .update_service(
                ServiceDescription::stateful("a", "T", 1)
                    .with_metric(ServiceMetric::new("Count", 1, 1))
                    .with_placement_constraint("NodeName != n0"),
            )
            .unwrap();
        balancer
            .update_service(ServiceDescription::stateful("b", "T", 1).with_metric(ServiceMetric::new("Count", 1, 1)))
            .unwrap();
        balancer
            .update_failover_unit(make_unit("p0", "a", &[("n0", ReplicaRole::Primary)]))
            .unwrap();
        balancer
            .update_failover_unit(make_unit("p1", "b", &[("n1", ReplicaRole::Primary)]))
            .unwrap();

        let stats = balancer.refresh(Instant::now(), &config);
        assert_eq!(stats.domains, 1);
        let changes: BTreeMap<PartitionId, Movement> = emitted_changes(&balancer).into_iter().collect();
        assert_eq!(changes["p0"].target.as_deref(), Some("n2"), "prevent {prevent}");
        if prevent {
            assert_eq!(stats.movements, 1);
            assert!(!changes.contains_key("p1"));
            assert!(not_possible(&last_batches(&balancer), "p1"));
        } else {
            assert_eq!(stats.movements, 2);
            assert_eq!(changes["p1"].target.as_deref(), Some("n0"));
        }
    }
}

// ── Domains and churn ──────────────────────────────────────────

#[test]
fn quorum_mode_when_target_exceeds_domains_plus_one() {
    for auto_switch in [true, false] {
        let mut config = make_config(15);
        config.domains.quorum_auto_switch = auto_switch;
        let mut balancer = make_balancer(&[]);
        for i in 0..9 {
            balancer
                .update_node(NodeDescription::new(format!("n{i}"), &format!("/fd{}", i / 3), &format!("ud{i}")))
                .unwrap();
        }
        balancer.update_service(ServiceDescription::stateful("svc", "T", 6)).unwrap();
        let unit = make_unit(
            "p0",
            "svc",
            &[
                ("n0", ReplicaRole::Primary),
                ("n1", ReplicaRole::Secondary),
                ("n2", ReplicaRole::Secondary),
                ("n3", ReplicaRole::Secondary),
                ("n4", ReplicaRole::Secondary),
                ("n5", ReplicaRole::Secondary),
            ],
        );
        balancer.update_failover_unit(unit.clone()).unwrap();
        let mut units: BTreeMap<PartitionId, FailoverUnitDescription> = [("p0".to_string(), unit)].into();

        let stats = balancer.refresh(Instant::now(), &config);
        if auto_switch {
            // R = 6 > D + 1 = 4: three per domain is within quorum.
            assert_eq!(stats.movements, 0);
            continue;
        }
        assert_eq!(stats.movements, 2);
        let empty_domain: BTreeSet<&str> = ["n6", "n7", "n8"].into();
        for (_, movement) in emitted_changes(&balancer) {
            assert!(empty_domain.contains(movement.target.as_deref().unwrap()));
        }
        apply_last_plan(&mut balancer, &mut units);
        let mut per_domain = [0u32; 3];
        for replica in &units["p0"].replicas {
            let index: usize = replica.node[1..].parse().unwrap();
            per_domain[index / 3] += 1;
        }
        assert_eq!(per_domain, [2, 2, 2]);
    }
}

#[test]
fn domain_fixes_wait_out_the_partial_delay() {
    let config = make_config(16);
    let mut balancer = make_balancer(&[]);
    balancer.update_node(NodeDescription::new("n0", "/dc0/r0", "ud0")).unwrap();
    balancer.update_node(NodeDescription::new("n1", "/dc0/r1", "ud1")).unwrap();
    balancer.update_service(ServiceDescription::stateful("svc", "T", 2)).unwrap();
    balancer
        .update_failover_unit(make_unit(
            "p0",
            "svc",
            &[("n0", ReplicaRole::Primary), ("n1", ReplicaRole::Secondary)],
        ))
        .unwrap();

    let t0 = Instant::now();
    assert_eq!(balancer.refresh(t0, &config).movements, 0);

    let t1 = t0 + Duration::from_secs(10);
    balancer.update_node(NodeDescription::new("n2", "/dc1/r0", "ud2")).unwrap();
    let stats = balancer.refresh(t1, &config);
    assert_eq!(stats.movements, 0);
    let key = (ViolationSubject::Partition("p0".into()), ConstraintKind::FaultDomain);
    assert!(balancer.violation_counters().contains_key(&key));

    let stats = balancer.refresh(t1 + Duration::from_secs(121), &config);
    assert_eq!(stats.movements, 1);
    let changes = emitted_changes(&balancer);
    assert_eq!(changes[0].1.target.as_deref(), Some("n2"));
    assert!(balancer.violation_counters().is_empty());
}

#[test]
fn balancing_waits_out_the_delay_after_new_nodes() {
    let mut config = make_config(17);
    config.load.balancing_thresholds.insert("Count".into(), 1.5);
    config.search.max_percentage_to_move = 1.0;
    let mut balancer = make_balancer(&[]);
    balancer
        .update_node(NodeDescription::new("n0", "/fd0", "ud0").with_capacity("Count", 1000))
        .unwrap();
    balancer
        .update_service(ServiceDescription::stateful("svc", "T", 1).with_metric(ServiceMetric::new("Count", 10, 10)))
        .unwrap();
    for i in 0..6 {
        balancer
            .update_failover_unit(make_unit(&format!("p{i}"), "svc", &[("n0", ReplicaRole::Primary)]))
            .unwrap();
    }

    let t0 = Instant::now();
    assert_eq!(balancer.refresh(t0, &config).movements, 0);

    let t1 = t0 + Duration::from_secs(10);
    for i in 1..3 {
        balancer
            .update_node(NodeDescription::new(format!("n{i}"), &format!("/fd{i}"), &format!("ud{i}")).with_capacity("Count", 1000))
            .unwrap();
    }
    let stats = balancer.refresh(t1, &config);
    assert!(!stats.phases.contains(&SchedulerPhase::Balancing));
    assert_eq!(stats.movements, 0);

    let stats = balancer.refresh(t1 + Duration::from_secs(121), &config);
    assert!(stats.phases.contains(&SchedulerPhase::Balancing));
    assert!(stats.movements > 0);
    assert!(last_batches(&balancer)
        .values()
        .all(|batch| batch.phase == SchedulerPhase::Balancing));
}

// ── Affinity ───────────────────────────────────────────────────

#[test]
fn parent_moves_when_child_cannot() {
    for move_parent in [false, true] {
        let mut config = make_config(18);
        config.affinity.move_parent_to_fix_violation = move_parent;
        let mut balancer = make_balancer(&[]);
        balancer
            .update_service_type(ServiceTypeDescription {
                name: "C".into(),
                block_list: ["n0".to_string()].into(),
            })
            .unwrap();
        add_flat_nodes(&mut balancer, 2);
        balancer.update_service(ServiceDescription::stateful("parent", "T", 1)).unwrap();
        balancer
            .update_service(ServiceDescription::stateful("child", "C", 1).with_affinity("parent", AffinityKind::NonAligned))
            .unwrap();
        balancer
            .update_failover_unit(make_unit("parent0", "parent", &[("n0", ReplicaRole::Primary)]))
            .unwrap();
        balancer
            .update_failover_unit(make_unit("child0", "child", &[("n1", ReplicaRole::Primary)]))
            .unwrap();

        let stats = balancer.refresh(Instant::now(), &config);
        let changes = emitted_changes(&balancer);
        if move_parent {
            assert_eq!(stats.movements, 1);
            assert_eq!(changes[0].0, "parent0");
            assert_eq!(changes[0].1.kind, MovementKind::MovePrimary);
            assert_eq!(changes[0].1.source.as_deref(), Some("n0"));
            assert_eq!(changes[0].1.target.as_deref(), Some("n1"));
        } else {
            assert_eq!(stats.movements, 0);
            assert_eq!(stats.infeasible, 1);
            assert!(not_possible(&last_batches(&balancer), "child0"));
        }
    }
}

#[test]
fn transitional_replicas_neither_anchor_nor_violate() {
    let config = make_config(19);
    let mut balancer = make_balancer(&[]);
    add_flat_nodes(&mut balancer, 3);
    balancer.update_service(ServiceDescription::stateful("parent", "T", 1)).unwrap();
    balancer
        .update_service(ServiceDescription::stateful("child", "T", 1).with_affinity("parent", AffinityKind::NonAligned))
        .unwrap();

    let mut parent = make_unit("parent0", "parent", &[("n0", ReplicaRole::Primary)]);
    let mut dropping = ReplicaDescription::new("n2", ReplicaRole::Secondary);
    dropping.to_be_dropped = true;
    parent.replicas.push(dropping);
    let mut moving = make_unit("child1", "child", &[("n1", ReplicaRole::Primary)]);
    moving.replicas[0].move_in_progress = true;
    balancer.update_failover_unit(parent).unwrap();
    balancer
        .update_failover_unit(make_unit("child0", "child", &[("n2", ReplicaRole::Primary)]))
        .unwrap();
    balancer.update_failover_unit(moving).unwrap();

    let stats = balancer.refresh(Instant::now(), &config);
    assert_eq!(stats.movements, 1);
    let changes = emitted_changes(&balancer);
    assert_eq!(changes[0].0, "child0");
    assert_eq!(changes[0].1.source.as_deref(), Some("n2"));
    assert_eq!(changes[0].1.target.as_deref(), Some("n0"));
}

#[test]
fn non_aligned_child_only_needs_parent_nodes() {
    let config = make_config(20);
    let mut balancer = make_balancer(&[]);
    add_flat_nodes(&mut balancer, 3);
    balancer.update_service(ServiceDescription::stateful("parent", "T", 2)).unwrap();
    balancer
        .update_service(ServiceDescription::stateful("child", "T", 2).with_affinity("parent", AffinityKind::NonAligned))
        .unwrap();
    let parent = make_unit(
        "parent0",
        "parent",
        &[("n0", ReplicaRole::Primary), ("n1", ReplicaRole::Secondary)],
    );
    let child = make_unit(
        "child0",
        "child",
        &[("n1", ReplicaRole::Primary), ("n2", ReplicaRole::Secondary)],
    );
    balancer.update_failover_unit(parent.clone()).unwrap();
    balancer.update_failover_unit(child.clone()).unwrap();
    let mut units: BTreeMap<PartitionId, FailoverUnitDescription> =
        [("parent0".to_string(), parent), ("child0".to_string(), child)].into();

    let now = Instant::now();
    let stats = balancer.refresh(now, &config);
    assert_eq!(stats.movements, 1);
    let changes = emitted_changes(&balancer);
    assert_eq!(changes[0].0, "child0");
    assert_eq!(changes[0].1.kind, MovementKind::MoveSecondary);
    assert_eq!(changes[0].1.source.as_deref(), Some("n2"));
    assert_eq!(changes[0].1.target.as_deref(), Some("n0"));

    apply_last_plan(&mut balancer, &mut units);
    let stats = balancer.refresh(now + Duration::from_secs(2), &config);
    assert_eq!(stats.movements, 0);
}

// ── Auto scaling ───────────────────────────────────────────────

fn report_load(balancer: &mut Balancer<CollectingSink>, partition: &str, load: u64) {
    balancer
        .update_load_or_move_cost(LoadOrMoveCostDescription {
            partition_id: partition.into(),
            service: "web".into(),
            loads: vec![MetricLoad {
                metric: "Metric1".into(),
                primary_load: Some(load),
                ..Default::default()
            }],
            move_cost: None,
        })
        .unwrap();
}

#[test]
fn instance_targets_follow_average_load() {
    let config = make_config(21);
    let mut balancer = make_balancer(&[]);
    add_flat_nodes(&mut balancer, 5);
    let policy = AutoScalingPolicy {
        scale_interval_secs: 1,
        min_instance_count: 2,
        max_instance_count: Some(4),
        scale_increment: 1,
        ..AutoScalingPolicy::new("Metric1", 10.0, 20.0)
    };
    balancer
        .update_service(
            ServiceDescription::stateless("web", "T", ReplicaTarget::Count(3))
                .with_metric(ServiceMetric::new("Metric1", 0, 0))
                .with_auto_scaling(policy),
        )
        .unwrap();
    let instances = [
        ("n0", ReplicaRole::Instance),
        ("n1", ReplicaRole::Instance),
        ("n2", ReplicaRole::Instance),
    ];
    for id in ["w0", "w1"] {
        balancer.update_failover_unit(make_unit(id, "web", &instances)).unwrap();
    }
    report_load(&mut balancer, "w0", 90);
    report_load(&mut balancer, "w1", 5);

    let now = Instant::now();
    let stats = balancer.refresh(now, &config);
    assert_eq!(stats.scaled, 2);
    assert_eq!(stats.movements, 0);
    let targets: BTreeMap<&str, (u32, u32)> = balancer
        .sink()
        .targets
        .iter()
        .map(|c| (c.partition_id.as_str(), (c.previous, c.target)))
        .collect();
    assert_eq!(targets["w0"], (3, 4));
    assert_eq!(targets["w1"], (3, 2));

    // Within the scale interval nothing is checked again.
    assert_eq!(balancer.refresh(now + Duration::from_millis(500), &config).scaled, 0);

    let mut scaled = make_unit("w0", "web", &instances);
    scaled.version = 2;
    scaled.target_replica_count = Some(4);
    balancer.update_failover_unit(scaled).unwrap();
    let stats = balancer.refresh(now + Duration::from_secs(2), &config);
    let added: Vec<(PartitionId, Movement)> = emitted_changes(&balancer)
        .into_iter()
        .filter(|(id, _)| id == "w0")
        .collect();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].1.kind, MovementKind::AddInstance);
    assert!(matches!(added[0].1.target.as_deref(), Some("n3") | Some("n4")));
    // w0 sits at its maximum; w1 asks for the same target again.
    assert_eq!(stats.scaled, 1);
    assert_eq!(balancer.sink().targets.last().map(|c| c.partition_id.as_str()), Some("w1"));
}
