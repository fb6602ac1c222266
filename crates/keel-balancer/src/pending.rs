//! Buffered ingestion updates.

use keel_core::{
    ApplicationDescription, FailoverUnitDescription, LoadOrMoveCostDescription, NodeDescription,
    PartitionId, ServiceDescription, ServiceName, ServiceTypeDescription,
};

/// One accepted ingestion call, applied at the start of the next refresh.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingUpdate {
    Node(NodeDescription),
    ServiceType(ServiceTypeDescription),
    Service(ServiceDescription),
    DeleteService(ServiceName),
    Application(ApplicationDescription),
    FailoverUnit(FailoverUnitDescription),
    DeleteFailoverUnit(PartitionId),
    LoadOrMoveCost(LoadOrMoveCostDescription),
}

impl PendingUpdate {
    pub fn kind(&self) -> &'static str {
        match self {
            PendingUpdate::Node(_) => "node",
            PendingUpdate::ServiceType(_) => "service_type",
            PendingUpdate::Service(_) => "service",
            PendingUpdate::DeleteService(_) => "delete_service",
            PendingUpdate::Application(_) => "application",
            PendingUpdate::FailoverUnit(_) => "failover_unit",
            PendingUpdate::DeleteFailoverUnit(_) => "delete_failover_unit",
            PendingUpdate::LoadOrMoveCost(_) => "load_or_move_cost",
        }
    }
}
