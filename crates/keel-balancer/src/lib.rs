//! keel-balancer — ingestion, service domains, and the refresh loop.
//!
//! Wraps the per-domain engine in `keel-placement` with the state a
//! long-running balancer needs:
//!
//! - Validates and buffers ingestion calls until the next refresh
//! - Splits the cluster into independently planned service domains
//! - Gates phases by interval and by delays after node churn
//! - Throttles and freezes emitted movements
//! - Scales stateless instance counts from reported load
//! - Answers capacity, load, and health queries
//!
//! # Architecture
//!
//! ```text
//! Balancer
//!   ├── pending buffer ──► ClusterState (nodes, services, partitions, loads)
//!   ├── autoscale ──► MovementSink::update_target
//!   ├── service_domain::partition_domains
//!   ├── per domain: keel_placement::plan_domain (scoped threads)
//!   ├── MovementThrottle ──► MovementSink (batches + DecisionToken)
//!   └── violation counters ──► health_report
//! ```

pub mod autoscale;
pub mod balancer;
pub mod cluster;
pub mod diagnostics;
pub mod error;
pub mod pending;
pub mod runner;
pub mod service_domain;
pub mod throttle;

pub use balancer::{Balancer, CollectingSink, MovementSink, RefreshStats};
pub use diagnostics::{ClusterCapacity, HealthEntry, LoadQuery};
pub use error::{BalancerError, BalancerResult};
pub use runner::{RunnerIntervals, run};
pub use service_domain::ServiceDomain;
