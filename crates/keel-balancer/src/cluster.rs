//! Cluster-wide tables owned by the balancer.
//!
//! Only [`ClusterState::apply`] mutates them, and only while draining the
//! pending-update buffer. Node transitions are timestamped so the refresh
//! loop can hold off domain fixes and balancing after topology churn.

use std::collections::BTreeMap;
use std::time::Instant;

use keel_core::{
    ApplicationDescription, ApplicationName, FailoverUnitDescription, LoadOrMoveCostDescription,
    NodeDescription, NodeId, PartitionId, ServiceDescription, ServiceName, ServiceTypeDescription,
};
use tracing::{debug, info};

use crate::pending::PendingUpdate;

/// What applying one update changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Nothing,
    /// A partition moved to a newer version.
    NewVersion(PartitionId),
    Other,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    pub nodes: BTreeMap<NodeId, NodeDescription>,
    pub service_types: BTreeMap<String, ServiceTypeDescription>,
    pub services: BTreeMap<ServiceName, ServiceDescription>,
    pub applications: BTreeMap<ApplicationName, ApplicationDescription>,
    pub partitions: BTreeMap<PartitionId, FailoverUnitDescription>,
    pub loads: BTreeMap<PartitionId, LoadOrMoveCostDescription>,
    last_node_down: Option<Instant>,
    last_new_node: Option<Instant>,
    /// Set after the first refresh; earlier nodes are the initial topology.
    tracking_topology: bool,
}

impl ClusterState {
    pub fn last_node_down(&self) -> Option<Instant> {
        self.last_node_down
    }

    pub fn last_new_node(&self) -> Option<Instant> {
        self.last_new_node
    }

    pub fn start_tracking_topology(&mut self) {
        self.tracking_topology = true;
    }

    pub fn apply(&mut self, update: PendingUpdate, now: Instant) -> Applied {
        match update {
            PendingUpdate::Node(node) => {
                self.apply_node(node, now);
                Applied::Other
            }
            PendingUpdate::ServiceType(service_type) => {
                self.service_types.insert(service_type.name.clone(), service_type);
                Applied::Other
            }
            PendingUpdate::Service(service) => {
                self.services.insert(service.name.clone(), service);
                Applied::Other
            }
            PendingUpdate::DeleteService(name) => {
                if self.services.remove(&name).is_none() {
                    return Applied::Nothing;
                }
                let orphaned: Vec<PartitionId> = self
                    .partitions
                    .values()
                    .filter(|p| p.service == name)
                    .map(|p| p.partition_id.clone())
                    .collect();
                for id in &orphaned {
                    self.partitions.remove(id);
                    self.loads.remove(id);
                }
                debug!(service = %name, partitions = orphaned.len(), "service deleted");
                Applied::Other
            }
            PendingUpdate::Application(app) => {
                self.applications.insert(app.name.clone(), app);
                Applied::Other
            }
            PendingUpdate::FailoverUnit(unit) => self.apply_failover_unit(unit),
            PendingUpdate::DeleteFailoverUnit(id) => {
                self.loads.remove(&id);
                match self.partitions.remove(&id) {
                    Some(_) => Applied::Other,
                    None => Applied::Nothing,
                }
            }
            PendingUpdate::LoadOrMoveCost(report) => {
                self.apply_load(report);
                Applied::Other
            }
        }
    }

    fn apply_node(&mut self, node: NodeDescription, now: Instant) {
        let previous = self.nodes.get(&node.id);
        let was_available = previous.is_some_and(|p| p.is_up && !p.is_deactivated());
        let is_available = node.is_up && !node.is_deactivated();
        if self.tracking_topology {
            if was_available && !is_available {
                info!(node = %node.id, "node down");
                self.last_node_down = Some(now);
            } else if !was_available && is_available {
                info!(node = %node.id, "node joined");
                self.last_new_node = Some(now);
            }
        }
        self.nodes.insert(node.id.clone(), node);
    }

    fn apply_failover_unit(&mut self, unit: FailoverUnitDescription) -> Applied {
        match self.partitions.get(&unit.partition_id) {
            Some(existing) if existing.version > unit.version => {
                debug!(
                    partition = %unit.partition_id,
                    current = existing.version,
                    received = unit.version,
                    "stale failover unit ignored"
                );
                Applied::Nothing
            }
            Some(existing) if existing.version == unit.version => {
                self.partitions.insert(unit.partition_id.clone(), unit);
                Applied::Other
            }
            _ => {
                let id = unit.partition_id.clone();
                self.partitions.insert(id.clone(), unit);
                Applied::NewVersion(id)
            }
        }
    }

    /// Reports merge per metric; a report without a move cost keeps the
    /// previous one.
    fn apply_load(&mut self, report: LoadOrMoveCostDescription) {
        let entry = self
            .loads
            .entry(report.partition_id.clone())
            .or_insert_with(|| LoadOrMoveCostDescription {
                partition_id: report.partition_id.clone(),
                service: report.service.clone(),
                loads: Vec::new(),
                move_cost: None,
            });
        for load in report.loads {
            match entry.loads.iter_mut().find(|l| l.metric == load.metric) {
                Some(existing) => {
                    if load.primary_load.is_some() {
                        existing.primary_load = load.primary_load;
                    }
                    if load.secondary_load.is_some() {
                        existing.secondary_load = load.secondary_load;
                    }
                    existing.node_secondary_loads.extend(load.node_secondary_loads);
                }
                None => entry.loads.push(load),
            }
        }
        if report.move_cost.is_some() {
            entry.move_cost = report.move_cost;
        }
    }
}
