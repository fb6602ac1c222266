//! Keel placement engine for one service domain.
//!
//! Takes a read-only snapshot of a service domain and decides where its
//! replicas should live. It does NOT ingest updates or talk to nodes
//! (that's `keel-balancer`); it produces movement batches the balancer
//! hands to its caller.
//!
//! # Components
//!
//! - **`model`** — Arena snapshot with typed indices
//! - **`convert`** — Descriptions to snapshot
//! - **`domain_tree`** — Fault/upgrade domain trees, quorum and N+1 rules
//! - **`expression`** — Placement-constraint expressions
//! - **`capacity`** — Node and application capacity ledger
//! - **`constraints`** — Constraint kinds, priority table, evaluator
//! - **`solution`** — Mutable assignment with incremental bookkeeping
//! - **`scorer`** — Candidate ranking and balance objective
//! - **`placer`** — Placement phase
//! - **`search`** — Constraint check, annealing balancing, domain plan
//! - **`plan`** — Movement plan builder

pub mod capacity;
pub mod constraints;
pub mod convert;
pub mod domain_tree;
pub mod expression;
pub mod model;
pub mod placer;
pub mod plan;
pub mod scorer;
pub mod search;
pub mod solution;

pub use capacity::CapacityLedger;
pub use constraints::{ConstraintKind, ConstraintTable, ViolationProfile, ViolationSubject};
pub use convert::{DomainInput, PartitionInput, build_placement};
pub use domain_tree::{DomainKind, DomainTree};
pub use expression::{Expression, ExpressionError, ExpressionResult};
pub use model::Placement;
pub use search::{DomainPlan, PhaseRequest, plan_domain};
pub use solution::{Assignment, Solution, Transition};
