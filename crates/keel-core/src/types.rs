//! Cluster descriptions accepted by ingestion, and the movement actions
//! the balancer emits.
//!
//! Every description is a plain serde value so a whole cluster can be
//! captured as a JSON snapshot and replayed through the balancer.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub type NodeId = String;
pub type ServiceName = String;
pub type ServiceTypeName = String;
pub type ApplicationName = String;
pub type PartitionId = String;
pub type MetricName = String;

// ── Nodes ──────────────────────────────────────────────────────

/// What the operator asked the node to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeDeactivationIntent {
    #[default]
    None,
    Pause,
    Restart,
    RemoveData,
    RemoveNode,
}

/// How far the deactivation has progressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeDeactivationStatus {
    #[default]
    None,
    SafetyCheckInProgress,
    SafetyCheckComplete,
    DeactivationComplete,
    ActivationInProgress,
}

/// A cluster node as reported by ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    pub id: NodeId,
    /// Slash-separated fault domain path, e.g. `/dc0/rack1`.
    #[serde(default)]
    pub fault_domain: String,
    /// Slash-separated upgrade domain path, e.g. `ud3`.
    #[serde(default)]
    pub upgrade_domain: String,
    /// Declared capacity per metric. A metric missing here is unbounded.
    #[serde(default)]
    pub capacities: BTreeMap<MetricName, u64>,
    /// Node properties visible to placement-constraint expressions.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub is_up: bool,
    #[serde(default)]
    pub deactivation_intent: NodeDeactivationIntent,
    #[serde(default)]
    pub deactivation_status: NodeDeactivationStatus,
}

fn default_true() -> bool {
    true
}

impl NodeDescription {
    /// A node that is up, active, and has no declared capacities.
    pub fn new(id: impl Into<NodeId>, fault_domain: &str, upgrade_domain: &str) -> Self {
        Self {
            id: id.into(),
            fault_domain: fault_domain.to_string(),
            upgrade_domain: upgrade_domain.to_string(),
            capacities: BTreeMap::new(),
            properties: BTreeMap::new(),
            is_up: true,
            deactivation_intent: NodeDeactivationIntent::None,
            deactivation_status: NodeDeactivationStatus::None,
        }
    }

    pub fn with_capacity(mut self, metric: &str, capacity: u64) -> Self {
        self.capacities.insert(metric.to_string(), capacity);
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    /// The node finished deactivating and no longer takes part in planning.
    pub fn is_deactivated(&self) -> bool {
        self.deactivation_status == NodeDeactivationStatus::DeactivationComplete
    }

    /// A deactivation is requested and has not been cancelled.
    pub fn is_deactivating(&self) -> bool {
        self.deactivation_intent != NodeDeactivationIntent::None
            && !matches!(
                self.deactivation_status,
                NodeDeactivationStatus::None | NodeDeactivationStatus::ActivationInProgress
            )
    }

    /// Replicas on this node must be moved off: the node is losing its data.
    pub fn is_being_removed(&self) -> bool {
        self.is_deactivating()
            && matches!(
                self.deactivation_intent,
                NodeDeactivationIntent::RemoveData | NodeDeactivationIntent::RemoveNode
            )
    }

    /// The node may receive new replicas.
    pub fn accepts_replicas(&self) -> bool {
        self.is_up && !self.is_deactivating() && !self.is_deactivated()
    }
}

/// Split a domain path into its non-empty segments.
pub fn domain_segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Services ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTypeDescription {
    pub name: ServiceTypeName,
    /// Nodes that must not receive new replicas of services of this type.
    #[serde(default)]
    pub block_list: BTreeSet<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaTarget {
    Count(u32),
    OnEveryNode,
}

/// Per-service metric declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetric {
    pub name: MetricName,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub primary_default_load: u64,
    #[serde(default)]
    pub secondary_default_load: u64,
}

fn default_weight() -> f64 {
    1.0
}

impl ServiceMetric {
    pub fn new(name: &str, primary_default_load: u64, secondary_default_load: u64) -> Self {
        Self {
            name: name.to_string(),
            weight: 1.0,
            primary_default_load,
            secondary_default_load,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityKind {
    /// Child primary must sit with the parent primary.
    Aligned,
    /// Child replicas only need to sit on nodes holding a parent replica.
    NonAligned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityDescription {
    pub parent: ServiceName,
    pub kind: AffinityKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveCost {
    Zero,
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub name: ServiceName,
    pub service_type: ServiceTypeName,
    #[serde(default)]
    pub application: Option<ApplicationName>,
    #[serde(default = "default_true")]
    pub stateful: bool,
    pub target: ReplicaTarget,
    #[serde(default)]
    pub metrics: Vec<ServiceMetric>,
    /// Boolean expression over node properties, e.g. `NodeType == Back`.
    #[serde(default)]
    pub placement_constraint: Option<String>,
    #[serde(default)]
    pub affinity: Option<AffinityDescription>,
    #[serde(default)]
    pub default_move_cost: MoveCost,
    /// Instance-count scaling for stateless partitions.
    #[serde(default)]
    pub auto_scaling: Option<AutoScalingPolicy>,
}

impl ServiceDescription {
    pub fn stateful(name: &str, service_type: &str, target: u32) -> Self {
        Self {
            name: name.to_string(),
            service_type: service_type.to_string(),
            application: None,
            stateful: true,
            target: ReplicaTarget::Count(target),
            metrics: Vec::new(),
            placement_constraint: None,
            affinity: None,
            default_move_cost: MoveCost::Low,
            auto_scaling: None,
        }
    }

    pub fn stateless(name: &str, service_type: &str, target: ReplicaTarget) -> Self {
        Self {
            stateful: false,
            target,
            ..Self::stateful(name, service_type, 1)
        }
    }

    pub fn with_metric(mut self, metric: ServiceMetric) -> Self {
        self.metrics.push(metric);
        self
    }

    pub fn with_affinity(mut self, parent: &str, kind: AffinityKind) -> Self {
        self.affinity = Some(AffinityDescription {
            parent: parent.to_string(),
            kind,
        });
        self
    }

    pub fn with_application(mut self, application: &str) -> Self {
        self.application = Some(application.to_string());
        self
    }

    pub fn with_placement_constraint(mut self, expression: &str) -> Self {
        self.placement_constraint = Some(expression.to_string());
        self
    }

    pub fn with_auto_scaling(mut self, policy: AutoScalingPolicy) -> Self {
        self.auto_scaling = Some(policy);
        self
    }
}

/// Grow or shrink each partition's instance count from its average
/// instance load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoScalingPolicy {
    pub metric: MetricName,
    /// Below this average load the target shrinks.
    pub lower_load_threshold: f64,
    /// Above this average load the target grows.
    pub upper_load_threshold: f64,
    /// Zero is read as one second.
    #[serde(default)]
    pub scale_interval_secs: u64,
    #[serde(default)]
    pub min_instance_count: u32,
    /// `None` caps growth at the number of nodes that accept replicas.
    #[serde(default)]
    pub max_instance_count: Option<u32>,
    #[serde(default = "default_increment")]
    pub scale_increment: u32,
}

fn default_increment() -> u32 {
    1
}

impl AutoScalingPolicy {
    pub fn new(metric: &str, lower: f64, upper: f64) -> Self {
        Self {
            metric: metric.to_string(),
            lower_load_threshold: lower,
            upper_load_threshold: upper,
            scale_interval_secs: 1,
            min_instance_count: 1,
            max_instance_count: None,
            scale_increment: 1,
        }
    }

    pub fn scale_interval(&self) -> Duration {
        Duration::from_secs(self.scale_interval_secs.max(1))
    }

    /// Reason the policy cannot be used, if any.
    pub fn invalid_reason(&self) -> Option<&'static str> {
        let ordered = self
            .lower_load_threshold
            .partial_cmp(&self.upper_load_threshold)
            .is_some_and(|order| order.is_le());
        if !ordered {
            Some("lower load threshold above upper")
        } else if self.scale_increment == 0 {
            Some("zero scale increment")
        } else if self.max_instance_count.is_some_and(|max| max < self.min_instance_count) {
            Some("maximum instance count below minimum")
        } else {
            None
        }
    }
}

// ── Applications ───────────────────────────────────────────────

/// Application-scoped limits for one metric. Zero means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationMetricCapacity {
    pub metric: MetricName,
    #[serde(default)]
    pub total_capacity: u64,
    #[serde(default)]
    pub max_node_capacity: u64,
    /// Load held on every node the application occupies.
    #[serde(default)]
    pub reservation: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationDescription {
    pub name: ApplicationName,
    #[serde(default)]
    pub capacities: Vec<ApplicationMetricCapacity>,
    /// Maximum number of distinct nodes; zero is unlimited.
    #[serde(default)]
    pub scaleout_count: u32,
    #[serde(default)]
    pub minimum_nodes: u32,
}

// ── Partitions and replicas ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaRole {
    Primary,
    Secondary,
    /// Stateless replica.
    Instance,
    /// Kept for fast reactivation; not counted toward the target.
    StandBy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaStatus {
    #[default]
    Ready,
    InBuild,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescription {
    pub node: NodeId,
    pub role: ReplicaRole,
    #[serde(default)]
    pub status: ReplicaStatus,
    #[serde(default)]
    pub to_be_dropped: bool,
    #[serde(default)]
    pub move_in_progress: bool,
}

impl ReplicaDescription {
    pub fn new(node: &str, role: ReplicaRole) -> Self {
        Self {
            node: node.to_string(),
            role,
            status: ReplicaStatus::Ready,
            to_be_dropped: false,
            move_in_progress: false,
        }
    }

    /// Counts toward the partition's replica set.
    pub fn is_active(&self) -> bool {
        self.role != ReplicaRole::StandBy && self.status != ReplicaStatus::Down && !self.to_be_dropped
    }

    /// In flight: neither a fix candidate nor an affinity anchor.
    pub fn is_transitional(&self) -> bool {
        self.to_be_dropped || self.move_in_progress
    }
}

/// A partition (failover unit) and its current replica set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverUnitDescription {
    pub partition_id: PartitionId,
    pub service: ServiceName,
    pub version: u64,
    #[serde(default)]
    pub replicas: Vec<ReplicaDescription>,
    /// Replicas still to add (positive) or drop (negative). Zero means
    /// "derive from the service target".
    #[serde(default)]
    pub replica_difference: i32,
    /// Replica count set by the failover manager, e.g. after a
    /// [`TargetChange`]. Overrides the service target.
    #[serde(default)]
    pub target_replica_count: Option<u32>,
    #[serde(default)]
    pub upgrading: bool,
    #[serde(default)]
    pub in_quorum_loss: bool,
}

impl FailoverUnitDescription {
    pub fn new(partition_id: &str, service: &str, version: u64) -> Self {
        Self {
            partition_id: partition_id.to_string(),
            service: service.to_string(),
            version,
            replicas: Vec::new(),
            replica_difference: 0,
            target_replica_count: None,
            upgrading: false,
            in_quorum_loss: false,
        }
    }

    pub fn with_replica(mut self, node: &str, role: ReplicaRole) -> Self {
        self.replicas.push(ReplicaDescription::new(node, role));
        self
    }
}

// ── Load reports ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricLoad {
    pub metric: MetricName,
    /// Load of the primary (or of every instance when stateless).
    #[serde(default)]
    pub primary_load: Option<u64>,
    /// Default load of a secondary.
    #[serde(default)]
    pub secondary_load: Option<u64>,
    /// Secondary loads reported by individual nodes.
    #[serde(default)]
    pub node_secondary_loads: BTreeMap<NodeId, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOrMoveCostDescription {
    pub partition_id: PartitionId,
    pub service: ServiceName,
    #[serde(default)]
    pub loads: Vec<MetricLoad>,
    #[serde(default)]
    pub move_cost: Option<MoveCost>,
}

// ── Output ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    AddPrimary,
    AddSecondary,
    AddInstance,
    MovePrimary,
    MoveSecondary,
    MoveInstance,
    SwapPrimarySecondary,
    DropPrimary,
    DropSecondary,
    DropInstance,
    /// A required fix has no legal target.
    RequestedPlacementNotPossible,
}

impl MovementKind {
    /// Changes replica placement, as opposed to an infeasibility report.
    pub fn is_change(self) -> bool {
        self != MovementKind::RequestedPlacementNotPossible
    }

    pub fn is_move(self) -> bool {
        matches!(
            self,
            MovementKind::MovePrimary | MovementKind::MoveSecondary | MovementKind::MoveInstance
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
    pub kind: MovementKind,
    pub source: Option<NodeId>,
    pub target: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    Placement,
    ConstraintCheck,
    Balancing,
}

impl std::fmt::Display for SchedulerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SchedulerPhase::Placement => "placement",
            SchedulerPhase::ConstraintCheck => "constraint_check",
            SchedulerPhase::Balancing => "balancing",
        };
        f.write_str(s)
    }
}

/// All movements decided for one partition in one refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementBatch {
    pub partition_id: PartitionId,
    pub service: ServiceName,
    pub phase: SchedulerPhase,
    pub movements: Vec<Movement>,
}

/// New instance target for a partition decided by auto scaling. The
/// failover manager applies it by sending a newer failover unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetChange {
    pub partition_id: PartitionId,
    pub service: ServiceName,
    pub previous: u32,
    pub target: u32,
}

/// Monotonic marker attached to every emitted plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DecisionToken(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_segments_skip_empty_parts() {
        assert_eq!(domain_segments("/dc0/rack1"), vec!["dc0", "rack1"]);
        assert_eq!(domain_segments("ud3"), vec!["ud3"]);
        assert!(domain_segments("/").is_empty());
    }

    #[test]
    fn deactivation_states() {
        let mut node = NodeDescription::new("n1", "/dc0", "ud0");
        assert!(node.accepts_replicas());

        node.deactivation_intent = NodeDeactivationIntent::RemoveData;
        node.deactivation_status = NodeDeactivationStatus::SafetyCheckInProgress;
        assert!(node.is_deactivating());
        assert!(node.is_being_removed());
        assert!(!node.accepts_replicas());

        node.deactivation_intent = NodeDeactivationIntent::Pause;
        assert!(!node.is_being_removed());

        node.deactivation_status = NodeDeactivationStatus::DeactivationComplete;
        assert!(node.is_deactivated());
    }

    #[test]
    fn replica_activity() {
        let mut replica = ReplicaDescription::new("n1", ReplicaRole::Secondary);
        assert!(replica.is_active());
        replica.to_be_dropped = true;
        assert!(!replica.is_active());
        assert!(replica.is_transitional());

        let standby = ReplicaDescription::new("n1", ReplicaRole::StandBy);
        assert!(!standby.is_active());
    }

    #[test]
    fn auto_scaling_policy_validation() {
        let mut policy = AutoScalingPolicy::new("Cpu", 10.0, 20.0);
        assert_eq!(policy.invalid_reason(), None);
        policy.scale_interval_secs = 0;
        assert_eq!(policy.scale_interval(), Duration::from_secs(1));

        policy.max_instance_count = Some(0);
        assert!(policy.invalid_reason().is_some());
        policy.max_instance_count = None;
        policy.lower_load_threshold = 30.0;
        assert!(policy.invalid_reason().is_some());
        policy.lower_load_threshold = f64::NAN;
        assert!(policy.invalid_reason().is_some());
    }

    #[test]
    fn node_description_deserializes_with_defaults() {
        let node: NodeDescription =
            serde_json::from_str(r#"{"id":"n0","fault_domain":"/dc0/r0","capacities":{"Count":25}}"#)
                .unwrap();
        assert!(node.is_up);
        assert_eq!(node.capacities.get("Count"), Some(&25));
        assert_eq!(node.deactivation_intent, NodeDeactivationIntent::None);
    }
}
