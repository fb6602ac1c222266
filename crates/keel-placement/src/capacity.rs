//! Capacity ledger.
//!
//! Tracks, per node and metric, the load of resident replicas plus
//! load that is still reserved on the node although the search moved it
//! elsewhere:
//!
//! - **disappearing load** of replicas being dropped (static per refresh)
//! - **held load** of replicas moved off their original node while
//!   transient overcommit prevention is on
//! - **unused application reservation** on nodes the application occupies
//!
//! Application load is tracked cluster-wide and per node for the
//! application capacity and scaleout checks.

use std::collections::BTreeMap;

use crate::model::{ApplicationIndex, MetricIndex, NodeIndex, Placement};

#[derive(Debug, Clone)]
pub struct CapacityLedger {
    /// Resident load per node per metric.
    node_load: Vec<Vec<u64>>,
    /// Load of replicas away from their original node, kept reserved there.
    held: Vec<Vec<u64>>,
    /// Per application per metric.
    app_load: Vec<Vec<u64>>,
    /// Per application: node -> per metric load.
    app_node_load: Vec<BTreeMap<NodeIndex, Vec<u64>>>,
    /// Per application: node -> resident replica count.
    app_node_replicas: Vec<BTreeMap<NodeIndex, u32>>,
}

impl CapacityLedger {
    pub fn new(placement: &Placement) -> Self {
        let metrics = placement.metrics.len();
        let nodes = placement.nodes.len();
        let apps = placement.applications.len();
        Self {
            node_load: vec![vec![0; metrics]; nodes],
            held: vec![vec![0; metrics]; nodes],
            app_load: vec![vec![0; metrics]; apps],
            app_node_load: vec![BTreeMap::new(); apps],
            app_node_replicas: vec![BTreeMap::new(); apps],
        }
    }

    /// Account a replica's load on a node.
    pub fn add(
        &mut self,
        node: NodeIndex,
        application: Option<ApplicationIndex>,
        loads: &[(MetricIndex, u64)],
    ) {
        for &(metric, load) in loads {
            self.node_load[node.0][metric.0] += load;
        }
        if let Some(app) = application {
            let metrics = self.app_load[app.0].len();
            *self.app_node_replicas[app.0].entry(node).or_insert(0) += 1;
            let per_node = self.app_node_load[app.0]
                .entry(node)
                .or_insert_with(|| vec![0; metrics]);
            for &(metric, load) in loads {
                per_node[metric.0] += load;
                self.app_load[app.0][metric.0] += load;
            }
        }
    }

    /// Release a replica's load. Underflow is a bookkeeping bug.
    pub fn remove(
        &mut self,
        node: NodeIndex,
        application: Option<ApplicationIndex>,
        loads: &[(MetricIndex, u64)],
    ) {
        for &(metric, load) in loads {
            let slot = &mut self.node_load[node.0][metric.0];
            assert!(*slot >= load, "node load underflow on node {} metric {}", node.0, metric.0);
            *slot -= load;
        }
        if let Some(app) = application {
            let count = self.app_node_replicas[app.0]
                .get_mut(&node)
                .expect("application replica count missing for occupied node");
            *count -= 1;
            if *count == 0 {
                self.app_node_replicas[app.0].remove(&node);
            }
            let per_node = self.app_node_load[app.0]
                .get_mut(&node)
                .expect("application node load missing for occupied node");
            for &(metric, load) in loads {
                assert!(per_node[metric.0] >= load, "application node load underflow");
                per_node[metric.0] -= load;
                self.app_load[app.0][metric.0] -= load;
            }
            if !self.app_node_replicas[app.0].contains_key(&node) {
                self.app_node_load[app.0].remove(&node);
            }
        }
    }

    pub fn hold(&mut self, node: NodeIndex, loads: &[(MetricIndex, u64)]) {
        for &(metric, load) in loads {
            self.held[node.0][metric.0] += load;
        }
    }

    pub fn release(&mut self, node: NodeIndex, loads: &[(MetricIndex, u64)]) {
        for &(metric, load) in loads {
            let slot = &mut self.held[node.0][metric.0];
            assert!(*slot >= load, "held load underflow on node {}", node.0);
            *slot -= load;
        }
    }

    /// Load of resident replicas only.
    pub fn resident_load(&self, node: NodeIndex, metric: MetricIndex) -> u64 {
        self.node_load[node.0][metric.0]
    }

    /// Load counted against the node's capacity.
    pub fn effective_load(&self, placement: &Placement, node: NodeIndex, metric: MetricIndex) -> u64 {
        self.node_load[node.0][metric.0]
            + self.held[node.0][metric.0]
            + placement.disappearing[node.0][metric.0]
            + self.unused_reservation(placement, node, metric)
    }

    /// Reservation of applications on the node not yet filled by their load.
    pub fn unused_reservation(&self, placement: &Placement, node: NodeIndex, metric: MetricIndex) -> u64 {
        placement
            .applications
            .iter()
            .enumerate()
            .filter(|(app, _)| self.app_node_replicas[*app].contains_key(&node))
            .map(|(app, entry)| {
                let used = self.app_node_load[app]
                    .get(&node)
                    .map_or(0, |loads| loads[metric.0]);
                entry.reservation(metric).saturating_sub(used)
            })
            .sum()
    }

    /// Capacity, reduced by the node buffer when `buffered`.
    pub fn limit(placement: &Placement, node: NodeIndex, metric: MetricIndex, buffered: bool) -> Option<u64> {
        let capacity = placement.node(node).capacities[metric.0]?;
        if !buffered {
            return Some(capacity);
        }
        let buffer = placement.metrics[metric.0].buffer;
        Some((capacity as f64 * (1.0 - buffer)).floor() as u64)
    }

    /// Load above full capacity, summed over metrics.
    pub fn node_overload(&self, placement: &Placement, node: NodeIndex) -> u64 {
        placement
            .metric_indices()
            .filter_map(|m| {
                let capacity = Self::limit(placement, node, m, false)?;
                Some(self.effective_load(placement, node, m).saturating_sub(capacity))
            })
            .sum()
    }

    /// Whether the node is within its (optionally buffered) capacity on
    /// every metric in `metrics`.
    pub fn fits(&self, placement: &Placement, node: NodeIndex, metrics: &[MetricIndex], buffered: bool) -> bool {
        metrics.iter().all(|&m| match Self::limit(placement, node, m, buffered) {
            Some(limit) => self.effective_load(placement, node, m) <= limit,
            None => true,
        })
    }

    /// Sum of load fractions over metrics; raw load for unbounded metrics
    /// is scaled down so bounded metrics dominate.
    pub fn utilization(&self, placement: &Placement, node: NodeIndex) -> f64 {
        placement
            .metric_indices()
            .map(|m| {
                let load = self.effective_load(placement, node, m) as f64;
                match Self::limit(placement, node, m, false) {
                    Some(0) => load,
                    Some(capacity) => load / capacity as f64,
                    None => load / 1_000_000.0,
                }
            })
            .sum()
    }

    /// Excess over the application's total and per-node capacities.
    pub fn application_overload(&self, placement: &Placement, app: ApplicationIndex) -> u64 {
        let entry = &placement.applications[app.0];
        let mut overload = 0;
        for metric in &entry.metrics {
            if let Some(total) = metric.total {
                overload += self.app_load[app.0][metric.metric.0].saturating_sub(total);
            }
            if let Some(per_node) = metric.per_node {
                overload += self.app_node_load[app.0]
                    .values()
                    .map(|loads| loads[metric.metric.0].saturating_sub(per_node))
                    .sum::<u64>();
            }
        }
        overload
    }

    /// Distinct nodes above the application's scaleout count.
    pub fn scaleout_excess(&self, placement: &Placement, app: ApplicationIndex) -> u64 {
        match placement.applications[app.0].scaleout {
            Some(limit) => (self.app_node_replicas[app.0].len() as u64).saturating_sub(u64::from(limit)),
            None => 0,
        }
    }

    pub fn application_load(&self, app: ApplicationIndex, metric: MetricIndex) -> u64 {
        self.app_load[app.0][metric.0]
    }

    pub fn application_nodes(&self, app: ApplicationIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.app_node_replicas[app.0].keys().copied()
    }
}
