//! Read-only queries over the balancer's applied state.
//!
//! Nothing here touches the pending buffer or the planner; queries see
//! the cluster as of the last applied update.

use std::collections::BTreeMap;

use keel_core::{KeelConfig, ReplicaRole};
use keel_placement::{ConstraintKind, ViolationSubject};
use serde::Serialize;

use crate::balancer::{Balancer, MovementSink};
use crate::service_domain::{ServiceDomain, partition_domains};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterCapacity {
    Bounded(u64),
    /// Some available node declares no capacity for the metric.
    Unbounded,
}

/// A replica whose load is asked for.
#[derive(Debug, Clone, Copy)]
pub struct LoadQuery<'a> {
    pub service: &'a str,
    pub partition: &'a str,
    pub node: &'a str,
    pub role: ReplicaRole,
    pub metric: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthEntry {
    #[serde(flatten)]
    pub subject: ViolationSubject,
    pub kind: ConstraintKind,
    /// Consecutive refreshes the violation survived.
    pub refreshes: u32,
}

impl<S: MovementSink> Balancer<S> {
    /// Capacity of a metric over nodes that are up and not deactivated.
    pub fn total_cluster_capacity(&self, metric: &str) -> ClusterCapacity {
        let mut total = 0u64;
        for node in self.cluster.nodes.values().filter(|n| n.is_up && !n.is_deactivated()) {
            match node.capacities.get(metric) {
                Some(capacity) => total = total.saturating_add(*capacity),
                None => return ClusterCapacity::Unbounded,
            }
        }
        ClusterCapacity::Bounded(total)
    }

    pub fn service_domains(&self) -> Vec<ServiceDomain> {
        partition_domains(&self.cluster)
    }

    /// Load one replica puts on its node, or `None` if the partition,
    /// service, or metric is unknown.
    pub fn replica_load(&self, config: &KeelConfig, query: LoadQuery<'_>) -> Option<u64> {
        let unit = self.cluster.partitions.get(query.partition)?;
        if unit.service != query.service {
            return None;
        }
        let service = self.cluster.services.get(query.service)?;
        let default = service.metrics.iter().find(|m| m.name == query.metric);
        let reported = self
            .cluster
            .loads
            .get(query.partition)
            .and_then(|l| l.loads.iter().find(|m| m.metric == query.metric));
        if default.is_none() && reported.is_none() {
            return None;
        }

        if matches!(query.role, ReplicaRole::Primary | ReplicaRole::Instance) {
            return reported
                .and_then(|r| r.primary_load)
                .or(default.map(|d| d.primary_default_load));
        }
        if config.load.use_separate_secondary_load
            && let Some(load) = reported.and_then(|r| r.node_secondary_loads.get(query.node))
        {
            return Some(*load);
        }
        let average = reported
            .filter(|r| config.load.use_separate_secondary_load && !r.node_secondary_loads.is_empty())
            .map(|r| r.node_secondary_loads.values().sum::<u64>() / r.node_secondary_loads.len() as u64);
        reported
            .and_then(|r| r.secondary_load)
            .or(average)
            .or(default.map(|d| d.secondary_default_load))
    }

    /// Sum of active replica loads on a node.
    pub fn node_load(&self, config: &KeelConfig, node: &str, metric: &str) -> u64 {
        self.cluster
            .partitions
            .values()
            .flat_map(|unit| unit.replicas.iter().map(move |r| (unit, r)))
            .filter(|(_, replica)| replica.node == node && replica.is_active())
            .filter_map(|(unit, replica)| {
                self.replica_load(
                    config,
                    LoadQuery {
                        service: &unit.service,
                        partition: &unit.partition_id,
                        node,
                        role: replica.role,
                        metric,
                    },
                )
            })
            .sum()
    }

    pub fn violation_counters(&self) -> &BTreeMap<(ViolationSubject, ConstraintKind), u32> {
        &self.violations
    }

    /// Longest-standing violations first, capped by the configured limit.
    pub fn health_report(&self, config: &KeelConfig) -> Vec<HealthEntry> {
        let mut entries: Vec<HealthEntry> = self
            .violations
            .iter()
            .map(|((subject, kind), refreshes)| HealthEntry {
                subject: subject.clone(),
                kind: *kind,
                refreshes: *refreshes,
            })
            .collect();
        entries.sort_by(|a, b| {
            b.refreshes
                .cmp(&a.refreshes)
                .then_with(|| a.subject.cmp(&b.subject))
                .then_with(|| a.kind.cmp(&b.kind))
        });
        entries.truncate(config.diagnostics.health_report_violation_limit);
        entries
    }
}
