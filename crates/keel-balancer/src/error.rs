//! Balancer error types.

use keel_placement::ExpressionError;
use thiserror::Error;

/// Errors raised when an ingestion call is rejected.
#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("service type not found: {0}")]
    ServiceTypeNotFound(String),

    #[error("application not found: {0}")]
    ApplicationNotFound(String),

    #[error("partition not found: {0}")]
    PartitionNotFound(String),

    #[error("invalid description: {0}")]
    InvalidDescription(String),

    #[error("invalid placement constraint: {0}")]
    InvalidPlacementConstraint(#[from] ExpressionError),
}

pub type BalancerResult<T> = Result<T, BalancerError>;
