//! JSON cluster snapshots.
//!
//! A snapshot holds every description the balancer ingests. Loading one
//! replays it through the ingestion API in dependency order: service
//! types and applications first, then services (affinity parents before
//! children), nodes, failover units, and load reports.

use std::path::Path;

use anyhow::Context;
use keel_balancer::{Balancer, MovementSink};
use keel_core::{
    ApplicationDescription, FailoverUnitDescription, LoadOrMoveCostDescription, NodeDescription,
    ServiceDescription, ServiceTypeDescription,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub nodes: Vec<NodeDescription>,
    pub service_types: Vec<ServiceTypeDescription>,
    pub applications: Vec<ApplicationDescription>,
    pub services: Vec<ServiceDescription>,
    pub failover_units: Vec<FailoverUnitDescription>,
    pub loads: Vec<LoadOrMoveCostDescription>,
}

impl Snapshot {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading snapshot {}", path.display()))?;
        let snapshot = serde_json::from_str(&content).with_context(|| format!("parsing snapshot {}", path.display()))?;
        Ok(snapshot)
    }

    /// Services ordered so every affinity parent precedes its children.
    /// Services whose parent never appears keep their place at the end,
    /// where ingestion rejects them.
    fn ordered_services(&self) -> Vec<&ServiceDescription> {
        let mut remaining: Vec<&ServiceDescription> = self.services.iter().collect();
        let mut ordered: Vec<&ServiceDescription> = Vec::with_capacity(remaining.len());
        loop {
            let (ready, blocked): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|service| {
                service
                    .affinity
                    .as_ref()
                    .is_none_or(|a| ordered.iter().any(|known| known.name == a.parent))
            });
            if ready.is_empty() {
                ordered.extend(blocked);
                return ordered;
            }
            ordered.extend(ready);
            remaining = blocked;
        }
    }

    /// Queue every description on `balancer`. Nothing is applied until
    /// the next refresh or `process_pending_updates`.
    pub fn feed<S: MovementSink>(&self, balancer: &mut Balancer<S>) -> anyhow::Result<()> {
        for service_type in &self.service_types {
            balancer.update_service_type(service_type.clone())?;
        }
        for application in &self.applications {
            balancer.update_application(application.clone())?;
        }
        for service in self.ordered_services() {
            balancer
                .update_service(service.clone())
                .with_context(|| format!("service {}", service.name))?;
        }
        for node in &self.nodes {
            balancer.update_node(node.clone())?;
        }
        for unit in &self.failover_units {
            balancer
                .update_failover_unit(unit.clone())
                .with_context(|| format!("partition {}", unit.partition_id))?;
        }
        for report in &self.loads {
            balancer
                .update_load_or_move_cost(report.clone())
                .with_context(|| format!("load report for {}", report.partition_id))?;
        }
        debug!(
            nodes = self.nodes.len(),
            services = self.services.len(),
            partitions = self.failover_units.len(),
            "snapshot queued"
        );
        Ok(())
    }
}
