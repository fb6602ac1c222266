//! Conversion from ingestion descriptions to the arena snapshot.
//!
//! Bridges `keel_core` descriptions to the engine's [`Placement`]:
//! resolves names to indices, evaluates block lists and placement
//! expressions per node, fills in default and averaged loads, and adds
//! a replica slot for every replica a partition is still missing.

use std::collections::{BTreeMap, BTreeSet};

use keel_core::{
    ApplicationDescription, FailoverUnitDescription, KeelConfig, LoadOrMoveCostDescription,
    NodeDescription, ReplicaRole, ReplicaStatus, ReplicaTarget, ServiceDescription,
    ServiceTypeDescription, domain_segments,
};
use tracing::debug;

use crate::domain_tree::{DomainKind, DomainTree};
use crate::expression::{Expression, ExpressionResult, NodeView};
use crate::model::*;

/// One partition as handed to the engine.
#[derive(Debug, Clone, Copy)]
pub struct PartitionInput<'a> {
    pub unit: &'a FailoverUnitDescription,
    pub load: Option<&'a LoadOrMoveCostDescription>,
    /// A movement for this partition is still in flight.
    pub frozen: bool,
}

/// Borrowed view of everything one service domain needs.
#[derive(Debug, Clone)]
pub struct DomainInput<'a> {
    pub domain_id: String,
    pub nodes: Vec<&'a NodeDescription>,
    pub service_types: &'a BTreeMap<String, ServiceTypeDescription>,
    pub services: Vec<&'a ServiceDescription>,
    pub applications: Vec<&'a ApplicationDescription>,
    pub partitions: Vec<PartitionInput<'a>>,
}

/// Build the arena snapshot of a service domain.
pub fn build_placement(input: &DomainInput<'_>, config: &KeelConfig) -> ExpressionResult<Placement> {
    let metrics = build_metrics(input, config);
    let metric_lookup: BTreeMap<&str, MetricIndex> = metrics
        .iter()
        .enumerate()
        .map(|(i, m)| (m.name.as_str(), MetricIndex(i)))
        .collect();

    let nodes: Vec<NodeEntry> = input
        .nodes
        .iter()
        .map(|node| NodeEntry {
            id: node.id.clone(),
            fault_domain: node.fault_domain.clone(),
            upgrade_domain: node.upgrade_domain.clone(),
            capacities: metrics
                .iter()
                .map(|m| node.capacities.get(&m.name).copied())
                .collect(),
            properties: node.properties.clone(),
            accepts_replicas: node.accepts_replicas(),
            being_removed: node.is_being_removed(),
            deactivated: node.is_deactivated(),
        })
        .collect();
    let node_lookup: BTreeMap<&str, NodeIndex> = input
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), NodeIndex(i)))
        .collect();

    let app_lookup: BTreeMap<&str, ApplicationIndex> = input
        .applications
        .iter()
        .enumerate()
        .map(|(i, a)| (a.name.as_str(), ApplicationIndex(i)))
        .collect();
    let mut applications: Vec<ApplicationEntry> = input
        .applications
        .iter()
        .map(|app| ApplicationEntry {
            name: app.name.clone(),
            metrics: app
                .capacities
                .iter()
                .filter_map(|c| {
                    metric_lookup.get(c.metric.as_str()).map(|&metric| ApplicationMetricEntry {
                        metric,
                        total: (c.total_capacity > 0).then_some(c.total_capacity),
                        per_node: (c.max_node_capacity > 0).then_some(c.max_node_capacity),
                        reservation: c.reservation,
                    })
                })
                .collect(),
            scaleout: (app.scaleout_count > 0).then_some(app.scaleout_count),
            minimum_nodes: app.minimum_nodes,
            services: Vec::new(),
        })
        .collect();

    let service_lookup: BTreeMap<&str, ServiceIndex> = input
        .services
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), ServiceIndex(i)))
        .collect();

    let mut services = Vec::with_capacity(input.services.len());
    for (index, desc) in input.services.iter().enumerate() {
        let blocked: Vec<bool> = match input.service_types.get(&desc.service_type) {
            Some(service_type) => nodes.iter().map(|n| service_type.block_list.contains(&n.id)).collect(),
            None => vec![false; nodes.len()],
        };
        let expression = match desc.placement_constraint.as_deref() {
            Some(text) => Expression::parse(text)?,
            None => None,
        };
        let expression_ok: Vec<bool> = nodes
            .iter()
            .map(|n| match &expression {
                Some(expr) => expr.evaluate(&NodeView {
                    name: &n.id,
                    fault_domain: &n.fault_domain,
                    upgrade_domain: &n.upgrade_domain,
                    properties: &n.properties,
                }),
                None => true,
            })
            .collect();
        let target = match desc.target {
            ReplicaTarget::Count(count) => count,
            ReplicaTarget::OnEveryNode => nodes
                .iter()
                .enumerate()
                .filter(|(i, n)| n.accepts_replicas && !blocked[*i] && expression_ok[*i])
                .count() as u32,
        };
        let parent = desc.affinity.as_ref().and_then(|affinity| {
            let found = service_lookup.get(affinity.parent.as_str()).copied();
            if found.is_none() {
                debug!(service = %desc.name, parent = %affinity.parent, "affinity parent outside domain, ignored");
            }
            found.map(|p| (p, affinity.kind))
        });
        let application = desc
            .application
            .as_deref()
            .and_then(|name| app_lookup.get(name).copied());
        if let Some(app) = application {
            applications[app.0].services.push(ServiceIndex(index));
        }

        services.push(ServiceEntry {
            name: desc.name.clone(),
            application,
            stateful: desc.stateful,
            target,
            metrics: desc
                .metrics
                .iter()
                .filter_map(|m| {
                    metric_lookup.get(m.name.as_str()).map(|&metric| ServiceMetricEntry {
                        metric,
                        primary_default: m.primary_default_load,
                        secondary_default: m.secondary_default_load,
                    })
                })
                .collect(),
            blocked,
            expression_ok,
            parent,
            children: Vec::new(),
            partitions: Vec::new(),
            move_cost: desc.default_move_cost,
        });
    }
    for index in 0..services.len() {
        if let Some((parent, _)) = services[index].parent {
            services[parent.0].children.push(ServiceIndex(index));
        }
    }

    let service_order = order_parents_first(&services);

    let fault_paths: Vec<Vec<String>> = nodes.iter().map(|n| domain_segments(&n.fault_domain)).collect();
    let upgrade_paths: Vec<Vec<String>> = nodes.iter().map(|n| domain_segments(&n.upgrade_domain)).collect();
    let mut fault_tree = DomainTree::new(
        DomainKind::Fault,
        &fault_paths,
        config.domains.quorum_based_fault_domains,
        config.domains.quorum_auto_switch,
    );
    let mut upgrade_tree = DomainTree::new(
        DomainKind::Upgrade,
        &upgrade_paths,
        config.domains.quorum_based_upgrade_domains,
        config.domains.quorum_auto_switch,
    );

    let mut placement = Placement {
        domain_id: input.domain_id.clone(),
        nodes,
        metrics,
        services,
        applications,
        partitions: Vec::new(),
        replicas: Vec::new(),
        disappearing: Vec::new(),
        fault_tree: fault_tree.clone(),
        upgrade_tree: upgrade_tree.clone(),
        service_order,
    };

    for service in &placement.services {
        let eligible: Vec<bool> = placement
            .node_indices()
            .map(|n| service.is_domain_eligible(&placement, n))
            .collect();
        fault_tree.add_service(&eligible);
        upgrade_tree.add_service(&eligible);
    }
    placement.fault_tree = fault_tree;
    placement.upgrade_tree = upgrade_tree;
    placement.disappearing = vec![vec![0; placement.metrics.len()]; placement.nodes.len()];

    for partition in &input.partitions {
        let Some(&service) = service_lookup.get(partition.unit.service.as_str()) else {
            debug!(partition = %partition.unit.partition_id, "partition of unknown service skipped");
            continue;
        };
        add_partition(&mut placement, service, partition, &node_lookup, config);
    }

    Ok(placement)
}

fn build_metrics(input: &DomainInput<'_>, config: &KeelConfig) -> Vec<MetricEntry> {
    let mut weights: BTreeMap<&str, f64> = BTreeMap::new();
    for service in &input.services {
        for metric in &service.metrics {
            let weight = weights.entry(metric.name.as_str()).or_insert(0.0);
            *weight = weight.max(metric.weight);
        }
    }
    let mut names: BTreeSet<&str> = weights.keys().copied().collect();
    for app in &input.applications {
        names.extend(app.capacities.iter().map(|c| c.metric.as_str()));
    }

    names
        .into_iter()
        .map(|name| MetricEntry {
            name: name.to_string(),
            weight: weights.get(name).copied().unwrap_or(1.0),
            buffer: config
                .load
                .node_buffer_percentage
                .get(name)
                .copied()
                .unwrap_or(0.0)
                .clamp(0.0, 1.0),
            balancing_threshold: config.load.balancing_thresholds.get(name).copied(),
            activity_threshold: config.load.activity_thresholds.get(name).copied().unwrap_or(0),
        })
        .collect()
}

fn order_parents_first(services: &[ServiceEntry]) -> Vec<ServiceIndex> {
    let depth = |mut index: usize| {
        let mut depth = 0;
        while let Some((parent, _)) = services[index].parent {
            depth += 1;
            index = parent.0;
            if depth > services.len() {
                break;
            }
        }
        depth
    };
    let mut order: Vec<ServiceIndex> = (0..services.len()).map(ServiceIndex).collect();
    order.sort_by_key(|s| (depth(s.0), s.0));
    order
}

fn add_partition(
    placement: &mut Placement,
    service_index: ServiceIndex,
    input: &PartitionInput<'_>,
    node_lookup: &BTreeMap<&str, NodeIndex>,
    config: &KeelConfig,
) {
    let unit = input.unit;
    let partition_index = PartitionIndex(placement.partitions.len());
    let movable = !input.frozen && !unit.in_quorum_loss;
    let use_separate = config.load.use_separate_secondary_load;

    let service = &placement.services[service_index.0];
    let loads: Vec<PartitionLoad> = service
        .metrics
        .iter()
        .map(|sm| {
            let name = &placement.metrics[sm.metric.0].name;
            let reported = input
                .load
                .and_then(|l| l.loads.iter().find(|m| &m.metric == name));
            let secondary_by_node: BTreeMap<NodeIndex, u64> = match reported {
                Some(r) if use_separate => r
                    .node_secondary_loads
                    .iter()
                    .filter_map(|(node, &load)| node_lookup.get(node.as_str()).map(|&n| (n, load)))
                    .collect(),
                _ => BTreeMap::new(),
            };
            let average = (!secondary_by_node.is_empty())
                .then(|| secondary_by_node.values().sum::<u64>() / secondary_by_node.len() as u64);
            PartitionLoad {
                primary: reported.and_then(|r| r.primary_load).unwrap_or(sm.primary_default),
                secondary: reported
                    .and_then(|r| r.secondary_load)
                    .or(average)
                    .unwrap_or(sm.secondary_default),
                secondary_by_node,
            }
        })
        .collect();
    let move_cost = match input.load.and_then(|l| l.move_cost) {
        Some(cost) if config.move_cost.use_move_cost_reports => cost,
        _ => service.move_cost,
    };
    let stateful = service.stateful;
    let target = unit.target_replica_count.unwrap_or(service.target);
    let metric_slots: Vec<MetricIndex> = service.metrics.iter().map(|m| m.metric).collect();

    let mut entry = PartitionEntry {
        id: unit.partition_id.clone(),
        service: service_index,
        version: unit.version,
        target,
        replicas: Vec::new(),
        occupied: Vec::new(),
        standby: Vec::new(),
        drop_count: 0,
        movable,
        upgrading: unit.upgrading,
        original_primary: None,
        move_cost,
        loads,
    };

    let mut active = 0u32;
    let mut has_primary = false;
    for replica in &unit.replicas {
        let Some(&node) = node_lookup.get(replica.node.as_str()) else {
            debug!(partition = %unit.partition_id, node = %replica.node, "replica on unknown node skipped");
            continue;
        };
        if replica.role == ReplicaRole::StandBy {
            entry.standby.push(node);
            continue;
        }
        if !replica.is_active() {
            entry.occupied.push(node);
            if replica.to_be_dropped && config.load.count_disappearing_load {
                for (slot, metric) in metric_slots.iter().enumerate() {
                    placement.disappearing[node.0][metric.0] += entry.loads[slot].for_role(replica.role, node);
                }
            }
            continue;
        }
        active += 1;
        if replica.role == ReplicaRole::Primary {
            has_primary = true;
            entry.original_primary = Some(node);
        }
        let index = ReplicaIndex(placement.replicas.len());
        placement.replicas.push(ReplicaEntry {
            partition: partition_index,
            original_node: Some(node),
            original_role: replica.role,
            in_build: replica.status == ReplicaStatus::InBuild,
            move_in_progress: replica.move_in_progress,
            movable: movable && !replica.move_in_progress,
        });
        entry.replicas.push(index);
    }

    let delta = if unit.replica_difference != 0 {
        i64::from(unit.replica_difference)
    } else {
        i64::from(target) - i64::from(active)
    };
    if movable && delta > 0 {
        for i in 0..delta {
            let role = if !stateful {
                ReplicaRole::Instance
            } else if i == 0 && !has_primary {
                ReplicaRole::Primary
            } else {
                ReplicaRole::Secondary
            };
            let index = ReplicaIndex(placement.replicas.len());
            placement.replicas.push(ReplicaEntry {
                partition: partition_index,
                original_node: None,
                original_role: role,
                in_build: false,
                move_in_progress: false,
                movable: true,
            });
            entry.replicas.push(index);
        }
    } else if movable && delta < 0 {
        entry.drop_count = delta.unsigned_abs().min(u64::from(active)) as u32;
    }

    placement.services[service_index.0].partitions.push(partition_index);
    placement.partitions.push(entry);
}
