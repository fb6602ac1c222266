//! Instance-count auto scaling for stateless partitions.
//!
//! Every partition of a service with an [`AutoScalingPolicy`] is checked
//! once per scale interval. The average load of its active instances is
//! compared with the policy thresholds and the target moves by the scale
//! increment, clamped to the policy bounds. Decisions reach the sink as
//! [`TargetChange`]s; the partition keeps its old target until a newer
//! failover unit carries the new one.

use std::time::Instant;

use keel_core::{
    AutoScalingPolicy, FailoverUnitDescription, KeelConfig, ReplicaTarget, ServiceDescription, TargetChange,
};
use keel_placement::Expression;
use keel_placement::expression::NodeView;
use tracing::{debug, info};

use crate::balancer::{Balancer, MovementSink};
use crate::diagnostics::LoadQuery;

impl<S: MovementSink> Balancer<S> {
    /// New targets for partitions whose scale interval elapsed.
    pub(crate) fn auto_scale(&mut self, now: Instant, config: &KeelConfig) -> Vec<TargetChange> {
        let mut changes = Vec::new();
        let mut checked = Vec::new();
        for unit in self.cluster.partitions.values() {
            let Some(service) = self.cluster.services.get(&unit.service) else {
                continue;
            };
            let (Some(policy), ReplicaTarget::Count(service_target)) = (&service.auto_scaling, service.target) else {
                continue;
            };
            if service.stateful || self.frozen.contains_key(&unit.partition_id) {
                continue;
            }
            if self
                .next_scale_check
                .get(&unit.partition_id)
                .is_some_and(|due| now < *due)
            {
                continue;
            }
            checked.push((unit.partition_id.clone(), now + policy.scale_interval()));

            let Some(average) = self.average_instance_load(config, unit, &policy.metric) else {
                debug!(partition = %unit.partition_id, "no active instances to scale from");
                continue;
            };
            let current = unit.target_replica_count.unwrap_or(service_target);
            let target = scaled_target(policy, current, average, || self.suitable_nodes(service));
            if target != current {
                info!(partition = %unit.partition_id, average, current, target, "instance target scaled");
                changes.push(TargetChange {
                    partition_id: unit.partition_id.clone(),
                    service: service.name.clone(),
                    previous: current,
                    target,
                });
            }
        }

        let partitions = &self.cluster.partitions;
        self.next_scale_check.retain(|id, _| partitions.contains_key(id));
        self.next_scale_check.extend(checked);
        changes
    }

    fn average_instance_load(&self, config: &KeelConfig, unit: &FailoverUnitDescription, metric: &str) -> Option<f64> {
        let loads: Vec<u64> = unit
            .replicas
            .iter()
            .filter(|replica| replica.is_active())
            .filter_map(|replica| {
                self.replica_load(
                    config,
                    LoadQuery {
                        service: &unit.service,
                        partition: &unit.partition_id,
                        node: &replica.node,
                        role: replica.role,
                        metric,
                    },
                )
            })
            .collect();
        if loads.is_empty() {
            return None;
        }
        Some(loads.iter().sum::<u64>() as f64 / loads.len() as f64)
    }

    /// Nodes that would accept a new instance of `service`.
    fn suitable_nodes(&self, service: &ServiceDescription) -> u32 {
        let block_list = self
            .cluster
            .service_types
            .get(&service.service_type)
            .map(|t| &t.block_list);
        // Validated at ingestion; an unparsable expression matches nothing.
        let expression = match service.placement_constraint.as_deref().map(Expression::parse) {
            Some(Ok(parsed)) => parsed,
            Some(Err(_)) => return 0,
            None => None,
        };
        self.cluster
            .nodes
            .values()
            .filter(|node| node.accepts_replicas())
            .filter(|node| block_list.is_none_or(|blocked| !blocked.contains(&node.id)))
            .filter(|node| {
                expression.as_ref().is_none_or(|expr| {
                    expr.evaluate(&NodeView {
                        name: &node.id,
                        fault_domain: &node.fault_domain,
                        upgrade_domain: &node.upgrade_domain,
                        properties: &node.properties,
                    })
                })
            })
            .count() as u32
    }
}

/// Target after one scaling step. Without a maximum, growth jumps to the
/// number of suitable nodes (never below the minimum).
fn scaled_target(policy: &AutoScalingPolicy, current: u32, average: f64, suitable: impl FnOnce() -> u32) -> u32 {
    if average > policy.upper_load_threshold {
        match policy.max_instance_count {
            Some(max) => current.saturating_add(policy.scale_increment).min(max).max(current),
            None => suitable().max(policy.min_instance_count),
        }
    } else if average < policy.lower_load_threshold {
        current
            .saturating_sub(policy.scale_increment)
            .max(policy.min_instance_count)
            .min(current)
    } else {
        current
    }
}
