//! Arena snapshot of one service domain.
//!
//! Nodes, services, applications, partitions, and replica slots live in
//! contiguous vectors addressed by typed indices. Cross references
//! (affinity parents, partition owners, replica nodes) are plain indices,
//! so the snapshot has no ownership cycles and is cheap to share
//! read-only across the search.

use std::collections::BTreeMap;

use keel_core::{AffinityKind, MoveCost, NodeId, PartitionId, ReplicaRole};

use crate::domain_tree::DomainTree;

macro_rules! arena_index {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub usize);

        impl $name {
            pub fn get(self) -> usize {
                self.0
            }
        }
    };
}

arena_index!(NodeIndex);
arena_index!(MetricIndex);
arena_index!(ServiceIndex);
arena_index!(ApplicationIndex);
arena_index!(PartitionIndex);
arena_index!(ReplicaIndex);

#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub id: NodeId,
    pub fault_domain: String,
    pub upgrade_domain: String,
    /// Capacity per metric; `None` is unbounded.
    pub capacities: Vec<Option<u64>>,
    pub properties: BTreeMap<String, String>,
    pub accepts_replicas: bool,
    /// Deactivating with data removal: resident replicas must leave.
    pub being_removed: bool,
    pub deactivated: bool,
}

#[derive(Debug, Clone)]
pub struct MetricEntry {
    pub name: String,
    pub weight: f64,
    /// Fraction of capacity placement and balancing leave free.
    pub buffer: f64,
    pub balancing_threshold: Option<f64>,
    pub activity_threshold: u64,
}

#[derive(Debug, Clone)]
pub struct ServiceMetricEntry {
    pub metric: MetricIndex,
    pub primary_default: u64,
    pub secondary_default: u64,
}

#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub name: String,
    pub application: Option<ApplicationIndex>,
    pub stateful: bool,
    pub target: u32,
    pub metrics: Vec<ServiceMetricEntry>,
    /// Per node: listed in the service type's block list.
    pub blocked: Vec<bool>,
    /// Per node: the placement-constraint expression holds.
    pub expression_ok: Vec<bool>,
    pub parent: Option<(ServiceIndex, AffinityKind)>,
    pub children: Vec<ServiceIndex>,
    pub partitions: Vec<PartitionIndex>,
    pub move_cost: MoveCost,
}

impl ServiceEntry {
    /// The node may receive a new or moved replica of this service.
    pub fn is_target(&self, placement: &Placement, node: NodeIndex) -> bool {
        placement.nodes[node.0].accepts_replicas && !self.blocked[node.0] && self.expression_ok[node.0]
    }

    /// Counts toward domain balance for this service.
    pub fn is_domain_eligible(&self, placement: &Placement, node: NodeIndex) -> bool {
        let entry = &placement.nodes[node.0];
        entry.accepts_replicas && !entry.deactivated && !self.blocked[node.0] && self.expression_ok[node.0]
    }
}

#[derive(Debug, Clone)]
pub struct ApplicationMetricEntry {
    pub metric: MetricIndex,
    pub total: Option<u64>,
    pub per_node: Option<u64>,
    pub reservation: u64,
}

#[derive(Debug, Clone)]
pub struct ApplicationEntry {
    pub name: String,
    pub metrics: Vec<ApplicationMetricEntry>,
    pub scaleout: Option<u32>,
    pub minimum_nodes: u32,
    pub services: Vec<ServiceIndex>,
}

impl ApplicationEntry {
    pub fn reservation(&self, metric: MetricIndex) -> u64 {
        self.metrics
            .iter()
            .find(|m| m.metric == metric)
            .map_or(0, |m| m.reservation)
    }
}

/// Load of one partition for one of its service's metrics.
#[derive(Debug, Clone)]
pub struct PartitionLoad {
    pub primary: u64,
    pub secondary: u64,
    pub secondary_by_node: BTreeMap<NodeIndex, u64>,
}

impl PartitionLoad {
    pub fn for_role(&self, role: ReplicaRole, node: NodeIndex) -> u64 {
        match role {
            ReplicaRole::Primary | ReplicaRole::Instance => self.primary,
            ReplicaRole::Secondary => self
                .secondary_by_node
                .get(&node)
                .copied()
                .unwrap_or(self.secondary),
            ReplicaRole::StandBy => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PartitionEntry {
    pub id: PartitionId,
    pub service: ServiceIndex,
    pub version: u64,
    /// Service target unless the failover unit carries its own.
    pub target: u32,
    pub replicas: Vec<ReplicaIndex>,
    /// Nodes holding a replica of this partition that is not a slot
    /// (down or being dropped); never targets.
    pub occupied: Vec<NodeIndex>,
    /// Nodes with a StandBy replica: preferred for new replicas.
    pub standby: Vec<NodeIndex>,
    /// Replicas the placement phase should remove.
    pub drop_count: u32,
    /// Frozen or in quorum loss partitions are never touched.
    pub movable: bool,
    pub upgrading: bool,
    pub original_primary: Option<NodeIndex>,
    pub move_cost: MoveCost,
    /// Aligned with the owning service's metrics.
    pub loads: Vec<PartitionLoad>,
}

#[derive(Debug, Clone)]
pub struct ReplicaEntry {
    pub partition: PartitionIndex,
    /// `None` for a replica the placement phase must create.
    pub original_node: Option<NodeIndex>,
    pub original_role: ReplicaRole,
    pub in_build: bool,
    pub move_in_progress: bool,
    pub movable: bool,
}

impl ReplicaEntry {
    pub fn is_new(&self) -> bool {
        self.original_node.is_none()
    }
}

/// Immutable snapshot of one service domain, rebuilt on every refresh.
#[derive(Debug, Clone)]
pub struct Placement {
    pub domain_id: String,
    pub nodes: Vec<NodeEntry>,
    pub metrics: Vec<MetricEntry>,
    pub services: Vec<ServiceEntry>,
    pub applications: Vec<ApplicationEntry>,
    pub partitions: Vec<PartitionEntry>,
    pub replicas: Vec<ReplicaEntry>,
    /// Per node per metric: load of replicas leaving the node.
    pub disappearing: Vec<Vec<u64>>,
    pub fault_tree: DomainTree,
    pub upgrade_tree: DomainTree,
    /// Services ordered parents first.
    pub service_order: Vec<ServiceIndex>,
}

impl Placement {
    pub fn node(&self, index: NodeIndex) -> &NodeEntry {
        &self.nodes[index.0]
    }

    pub fn service(&self, index: ServiceIndex) -> &ServiceEntry {
        &self.services[index.0]
    }

    pub fn partition(&self, index: PartitionIndex) -> &PartitionEntry {
        &self.partitions[index.0]
    }

    pub fn replica(&self, index: ReplicaIndex) -> &ReplicaEntry {
        &self.replicas[index.0]
    }

    pub fn service_of(&self, replica: ReplicaIndex) -> &ServiceEntry {
        let partition = self.partition(self.replica(replica).partition);
        self.service(partition.service)
    }

    pub fn node_index(&self, id: &str) -> Option<NodeIndex> {
        self.nodes.iter().position(|n| n.id == id).map(NodeIndex)
    }

    pub fn metric_index(&self, name: &str) -> Option<MetricIndex> {
        self.metrics.iter().position(|m| m.name == name).map(MetricIndex)
    }

    pub fn partition_index(&self, id: &str) -> Option<PartitionIndex> {
        self.partitions.iter().position(|p| p.id == id).map(PartitionIndex)
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        (0..self.nodes.len()).map(NodeIndex)
    }

    pub fn metric_indices(&self) -> impl Iterator<Item = MetricIndex> + '_ {
        (0..self.metrics.len()).map(MetricIndex)
    }

    /// Load a replica of `partition` in `role` would put on `node`, per
    /// service metric slot.
    pub fn replica_loads(
        &self,
        partition: PartitionIndex,
        role: ReplicaRole,
        node: NodeIndex,
    ) -> impl Iterator<Item = (MetricIndex, u64)> + '_ {
        let entry = self.partition(partition);
        let service = self.service(entry.service);
        service
            .metrics
            .iter()
            .zip(entry.loads.iter())
            .map(move |(sm, load)| (sm.metric, load.for_role(role, node)))
    }

    /// Existing replicas the search may relocate.
    pub fn movable_replica_count(&self) -> usize {
        self.replicas
            .iter()
            .filter(|r| r.movable && r.original_node.is_some())
            .count()
    }
}
