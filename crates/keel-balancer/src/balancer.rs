//! Ingestion buffer and refresh loop.
//!
//! The `Balancer` is the single writer over the cluster tables:
//! - Ingestion calls are validated and queued, never applied directly
//! - `refresh` drains the queue, splits the cluster into service domains,
//!   and plans each domain (in parallel when configured)
//! - Phases are gated by their minimum intervals and by the delays that
//!   follow node churn
//! - Emitted partitions stay frozen until a newer version arrives or the
//!   movement expires
//! - Movements go to the [`MovementSink`] with a monotonic
//!   [`DecisionToken`]; auto scaling decisions go to the same sink as
//!   [`TargetChange`]s

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use keel_core::{
    ApplicationDescription, DecisionToken, FailoverUnitDescription, KeelConfig, LoadOrMoveCostDescription,
    MovementBatch, NodeDescription, PartitionId, ReplicaTarget, SchedulerPhase, ServiceDescription,
    ServiceTypeDescription, TargetChange,
};
use keel_placement::{ConstraintKind, DomainInput, DomainPlan, Expression, PartitionInput, PhaseRequest, ViolationSubject};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::cluster::{Applied, ClusterState};
use crate::error::{BalancerError, BalancerResult};
use crate::pending::PendingUpdate;
use crate::service_domain::{ServiceDomain, partition_domains};
use crate::throttle::MovementThrottle;

/// Receiver of movement plans.
pub trait MovementSink {
    fn process_movements(&mut self, movements: BTreeMap<PartitionId, MovementBatch>, token: DecisionToken);

    /// A partition's instance target changed. Ignored unless overridden.
    fn update_target(&mut self, change: TargetChange) {
        debug!(partition = %change.partition_id, target = change.target, "target change dropped by sink");
    }
}

impl<F> MovementSink for F
where
    F: FnMut(BTreeMap<PartitionId, MovementBatch>, DecisionToken),
{
    fn process_movements(&mut self, movements: BTreeMap<PartitionId, MovementBatch>, token: DecisionToken) {
        self(movements, token)
    }
}

/// Keeps every emitted plan and target change in order.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    pub emitted: Vec<(BTreeMap<PartitionId, MovementBatch>, DecisionToken)>,
    pub targets: Vec<TargetChange>,
}

impl MovementSink for CollectingSink {
    fn process_movements(&mut self, movements: BTreeMap<PartitionId, MovementBatch>, token: DecisionToken) {
        self.emitted.push((movements, token));
    }

    fn update_target(&mut self, change: TargetChange) {
        self.targets.push(change);
    }
}

/// Summary of one refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshStats {
    pub applied_updates: usize,
    pub domains: usize,
    pub phases: BTreeSet<SchedulerPhase>,
    /// Placement changes handed to the sink.
    pub movements: usize,
    pub infeasible: usize,
    pub throttled: usize,
    pub callbacks: usize,
    /// Partitions whose instance target auto scaling changed.
    pub scaled: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Freeze {
    version: u64,
    until: Instant,
}

/// Names accepted so far, including those still queued.
#[derive(Debug, Clone, Default)]
struct KnownNames {
    service_types: BTreeSet<String>,
    services: BTreeSet<String>,
    applications: BTreeSet<String>,
    partitions: BTreeMap<PartitionId, String>,
}

pub struct Balancer<S> {
    sink: S,
    pending: Vec<PendingUpdate>,
    known: KnownNames,
    pub(crate) cluster: ClusterState,
    pub(crate) frozen: BTreeMap<PartitionId, Freeze>,
    /// Earliest time each auto-scaled partition is looked at again.
    pub(crate) next_scale_check: BTreeMap<PartitionId, Instant>,
    last_run: BTreeMap<SchedulerPhase, Instant>,
    throttle: MovementThrottle,
    /// Consecutive refreshes each violation stayed unfixed.
    pub(crate) violations: BTreeMap<(ViolationSubject, ConstraintKind), u32>,
    next_token: u64,
}

impl<S: MovementSink> Balancer<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            pending: Vec::new(),
            known: KnownNames::default(),
            cluster: ClusterState::default(),
            frozen: BTreeMap::new(),
            next_scale_check: BTreeMap::new(),
            last_run: BTreeMap::new(),
            throttle: MovementThrottle::default(),
            violations: BTreeMap::new(),
            next_token: 0,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn pending_updates(&self) -> usize {
        self.pending.len()
    }

    // ── Ingestion ──────────────────────────────────────────────

    pub fn update_node(&mut self, node: NodeDescription) -> BalancerResult<()> {
        if node.id.is_empty() {
            return Err(BalancerError::InvalidDescription("node without id".into()));
        }
        self.pending.push(PendingUpdate::Node(node));
        Ok(())
    }

    pub fn update_service_type(&mut self, service_type: ServiceTypeDescription) -> BalancerResult<()> {
        self.known.service_types.insert(service_type.name.clone());
        self.pending.push(PendingUpdate::ServiceType(service_type));
        Ok(())
    }

    pub fn update_service(&mut self, service: ServiceDescription) -> BalancerResult<()> {
        if !self.known.service_types.contains(&service.service_type) {
            return Err(BalancerError::ServiceTypeNotFound(service.service_type.clone()));
        }
        if let Some(app) = &service.application
            && !self.known.applications.contains(app)
        {
            return Err(BalancerError::ApplicationNotFound(app.clone()));
        }
        if service.stateful && service.target == ReplicaTarget::Count(0) {
            return Err(BalancerError::InvalidDescription(format!(
                "stateful service {} with a target of zero replicas",
                service.name
            )));
        }
        if let Some(affinity) = &service.affinity {
            if affinity.parent == service.name {
                return Err(BalancerError::InvalidDescription(format!(
                    "service {} is its own affinity parent",
                    service.name
                )));
            }
            if !self.known.services.contains(&affinity.parent) {
                return Err(BalancerError::ServiceNotFound(affinity.parent.clone()));
            }
        }
        if let Some(text) = &service.placement_constraint {
            Expression::parse(text)?;
        }
        if let Some(policy) = &service.auto_scaling {
            if service.stateful || service.target == ReplicaTarget::OnEveryNode {
                return Err(BalancerError::InvalidDescription(format!(
                    "service {} scales instances but is not a stateless counted service",
                    service.name
                )));
            }
            if let Some(reason) = policy.invalid_reason() {
                return Err(BalancerError::InvalidDescription(format!(
                    "service {} auto scaling policy: {reason}",
                    service.name
                )));
            }
        }
        self.known.services.insert(service.name.clone());
        self.pending.push(PendingUpdate::Service(service));
        Ok(())
    }

    pub fn delete_service(&mut self, name: &str) -> BalancerResult<()> {
        if !self.known.services.remove(name) {
            return Err(BalancerError::ServiceNotFound(name.to_string()));
        }
        self.known.partitions.retain(|_, service| service != name);
        self.pending.push(PendingUpdate::DeleteService(name.to_string()));
        Ok(())
    }

    pub fn update_application(&mut self, application: ApplicationDescription) -> BalancerResult<()> {
        self.known.applications.insert(application.name.clone());
        self.pending.push(PendingUpdate::Application(application));
        Ok(())
    }

    pub fn update_failover_unit(&mut self, unit: FailoverUnitDescription) -> BalancerResult<()> {
        if !self.known.services.contains(&unit.service) {
            return Err(BalancerError::ServiceNotFound(unit.service.clone()));
        }
        let mut active_nodes = BTreeSet::new();
        for replica in unit.replicas.iter().filter(|r| r.is_active()) {
            if !active_nodes.insert(replica.node.as_str()) {
                return Err(BalancerError::InvalidDescription(format!(
                    "partition {} has two active replicas on node {}",
                    unit.partition_id, replica.node
                )));
            }
        }
        self.known
            .partitions
            .insert(unit.partition_id.clone(), unit.service.clone());
        self.pending.push(PendingUpdate::FailoverUnit(unit));
        Ok(())
    }

    pub fn delete_failover_unit(&mut self, partition_id: &str) -> BalancerResult<()> {
        if self.known.partitions.remove(partition_id).is_none() {
            return Err(BalancerError::PartitionNotFound(partition_id.to_string()));
        }
        self.pending.push(PendingUpdate::DeleteFailoverUnit(partition_id.to_string()));
        Ok(())
    }

    pub fn update_load_or_move_cost(&mut self, report: LoadOrMoveCostDescription) -> BalancerResult<()> {
        match self.known.partitions.get(&report.partition_id) {
            None => Err(BalancerError::PartitionNotFound(report.partition_id.clone())),
            Some(service) if *service != report.service => Err(BalancerError::InvalidDescription(format!(
                "load report for partition {} names service {}, expected {}",
                report.partition_id, report.service, service
            ))),
            Some(_) => {
                self.pending.push(PendingUpdate::LoadOrMoveCost(report));
                Ok(())
            }
        }
    }

    /// Apply every queued update. Returns how many were applied.
    pub fn process_pending_updates(&mut self, now: Instant) -> usize {
        let updates = std::mem::take(&mut self.pending);
        let count = updates.len();
        for update in updates {
            let kind = update.kind();
            match self.cluster.apply(update, now) {
                Applied::NewVersion(id) => {
                    if self.frozen.remove(&id).is_some() {
                        debug!(partition = %id, "partition unfrozen by newer version");
                    }
                }
                Applied::Nothing => debug!(update = kind, "update had no effect"),
                Applied::Other => {}
            }
        }
        if count > 0 {
            debug!(updates = count, "pending updates applied");
        }
        count
    }

    // ── Refresh ────────────────────────────────────────────────

    /// Run one planning cycle over every service domain.
    pub fn refresh(&mut self, now: Instant, config: &KeelConfig) -> RefreshStats {
        let mut stats = RefreshStats {
            applied_updates: self.process_pending_updates(now),
            ..Default::default()
        };
        self.frozen.retain(|id, freeze| {
            let live = freeze.until > now;
            if !live {
                debug!(partition = %id, version = freeze.version, "pending movement expired");
            }
            live
        });

        for change in self.auto_scale(now, config) {
            self.sink.update_target(change);
            stats.scaled += 1;
        }

        let request = self.phase_request(now, config);
        let domains = partition_domains(&self.cluster);
        stats.domains = domains.len();

        let plans = self.plan_domains(&domains, request, config);
        for plan in &plans {
            stats.phases.extend(plan.phases_run.iter().copied());
            stats.infeasible += plan.infeasible.len();
        }
        for phase in &stats.phases {
            self.last_run.insert(*phase, now);
        }
        self.update_violation_counters(&plans);

        let mut combined: BTreeMap<PartitionId, MovementBatch> = BTreeMap::new();
        for plan in plans {
            let (admitted, held) = self.throttle.admit(plan.batches, now, &config.throttle);
            stats.throttled += held;
            let mut emitted = BTreeMap::new();
            for batch in admitted {
                let changes = batch.movements.iter().filter(|m| m.kind.is_change()).count();
                if changes > 0
                    && let Some(unit) = self.cluster.partitions.get(&batch.partition_id)
                {
                    self.frozen.insert(
                        batch.partition_id.clone(),
                        Freeze {
                            version: unit.version,
                            until: now + config.timing.max_movement_execution(),
                        },
                    );
                }
                stats.movements += changes;
                emitted.insert(batch.partition_id.clone(), batch);
            }
            if config.refresh.batch_movements {
                combined.extend(emitted);
            } else if !emitted.is_empty() {
                self.emit(emitted);
                stats.callbacks += 1;
            }
        }
        if !combined.is_empty() {
            self.emit(combined);
            stats.callbacks += 1;
        }

        self.cluster.start_tracking_topology();
        info!(
            domains = stats.domains,
            phases = ?stats.phases,
            moves = stats.movements,
            infeasible = stats.infeasible,
            throttled = stats.throttled,
            scaled = stats.scaled,
            "refresh finished"
        );
        stats
    }

    fn emit(&mut self, movements: BTreeMap<PartitionId, MovementBatch>) {
        self.next_token += 1;
        self.sink.process_movements(movements, DecisionToken(self.next_token));
    }

    fn phase_due(&self, phase: SchedulerPhase, now: Instant, interval: Duration) -> bool {
        self.last_run
            .get(&phase)
            .is_none_or(|last| now.saturating_duration_since(*last) >= interval)
    }

    fn phase_request(&self, now: Instant, config: &KeelConfig) -> PhaseRequest {
        let timing = &config.timing;
        let within = |event: Option<Instant>, delay: Duration| {
            event.is_some_and(|at| now.saturating_duration_since(at) < delay)
        };
        let down = self.cluster.last_node_down();
        let joined = self.cluster.last_new_node();

        let fix_domain_violations = !within(down, timing.partial_delay_after_node_down())
            && !within(joined, timing.partial_delay_after_new_node());
        let balancing_delayed = within(down, timing.balancing_delay_after_node_down())
            || within(joined, timing.balancing_delay_after_new_node());
        if !fix_domain_violations {
            debug!("domain fixes held back after node churn");
        }

        PhaseRequest {
            placement: self.phase_due(SchedulerPhase::Placement, now, timing.min_placement_interval()),
            constraint_check: self.phase_due(
                SchedulerPhase::ConstraintCheck,
                now,
                timing.min_constraint_check_interval(),
            ),
            balancing: !balancing_delayed
                && self.phase_due(SchedulerPhase::Balancing, now, timing.min_balancing_interval()),
            fix_domain_violations,
            seed: 0,
        }
    }

    fn plan_domains(&self, domains: &[ServiceDomain], request: PhaseRequest, config: &KeelConfig) -> Vec<DomainPlan> {
        let placements: Vec<(keel_placement::Placement, PhaseRequest)> = domains
            .iter()
            .filter_map(|domain| {
                let input = self.domain_input(domain);
                match keel_placement::build_placement(&input, config) {
                    Ok(placement) => Some((
                        placement,
                        PhaseRequest {
                            seed: domain_seed(&domain.id),
                            ..request
                        },
                    )),
                    Err(e) => {
                        error!(domain = %domain.id, error = %e, "failed to build domain snapshot");
                        None
                    }
                }
            })
            .collect();

        if config.refresh.parallel_domains && placements.len() > 1 {
            std::thread::scope(|scope| {
                let handles: Vec<_> = placements
                    .iter()
                    .map(|(placement, request)| {
                        scope.spawn(move || keel_placement::plan_domain(placement, config, *request))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                    .collect()
            })
        } else {
            placements
                .iter()
                .map(|(placement, request)| keel_placement::plan_domain(placement, config, *request))
                .collect()
        }
    }

    fn domain_input<'a>(&'a self, domain: &ServiceDomain) -> DomainInput<'a> {
        let cluster = &self.cluster;
        let services: Vec<&ServiceDescription> = domain
            .services
            .iter()
            .filter_map(|name| cluster.services.get(name))
            .collect();
        let applications = domain
            .applications
            .iter()
            .filter_map(|name| cluster.applications.get(name))
            .collect();
        let members: BTreeSet<&str> = domain.services.iter().map(String::as_str).collect();
        let partitions = cluster
            .partitions
            .values()
            .filter(|unit| members.contains(unit.service.as_str()))
            .map(|unit| PartitionInput {
                unit,
                load: cluster.loads.get(&unit.partition_id),
                frozen: self.frozen.contains_key(&unit.partition_id),
            })
            .collect();
        DomainInput {
            domain_id: domain.id.clone(),
            nodes: cluster.nodes.values().collect(),
            service_types: &cluster.service_types,
            services,
            applications,
            partitions,
        }
    }

    fn update_violation_counters(&mut self, plans: &[DomainPlan]) {
        let mut next = BTreeMap::new();
        for plan in plans {
            for (subject, kind) in &plan.remaining {
                let key = (subject.clone(), *kind);
                let count = self.violations.get(&key).copied().unwrap_or(0) + 1;
                next.insert(key, count);
            }
        }
        self.violations = next;
    }
}

/// Stable per-domain seed (FNV-1a of the domain id).
fn domain_seed(id: &str) -> u64 {
    id.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}
