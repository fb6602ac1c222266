//! Movement throttling over a counting interval.
//!
//! - **Per partition**: a batch is held when it would take its partition
//!   past `per_partition_threshold` moves in the interval. The first batch
//!   of a partition always passes, however large.
//! - **Global**: balancing batches stop once `global_movement_threshold`
//!   balancing movements were emitted in the interval. Placement and
//!   constraint fixes are never held back by the global limit.

use std::collections::BTreeMap;
use std::time::Instant;

use keel_core::config::ThrottleConfig;
use keel_core::{MovementBatch, PartitionId, SchedulerPhase};
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct MovementThrottle {
    window_start: Option<Instant>,
    balancing: u32,
    per_partition: BTreeMap<PartitionId, u32>,
}

impl MovementThrottle {
    /// Filter `batches`, counting what passes. Returns the admitted
    /// batches and the number of movements held back.
    pub fn admit(
        &mut self,
        batches: Vec<MovementBatch>,
        now: Instant,
        config: &ThrottleConfig,
    ) -> (Vec<MovementBatch>, usize) {
        match self.window_start {
            Some(start) if now.saturating_duration_since(start) < config.counting_interval() => {}
            _ => {
                self.window_start = Some(now);
                self.balancing = 0;
                self.per_partition.clear();
            }
        }

        let mut admitted = Vec::with_capacity(batches.len());
        let mut held = 0;
        for batch in batches {
            let changes = batch.movements.iter().filter(|m| m.kind.is_change()).count() as u32;
            if changes == 0 {
                admitted.push(batch);
                continue;
            }
            let partition_count = self.per_partition.get(&batch.partition_id).copied().unwrap_or(0);
            if config.per_partition_threshold > 0
                && partition_count > 0
                && partition_count + changes > config.per_partition_threshold
            {
                warn!(partition = %batch.partition_id, moves = changes, "partition movement threshold reached");
                held += changes as usize;
                continue;
            }
            let balancing = batch.phase == SchedulerPhase::Balancing;
            if balancing
                && config.global_movement_threshold > 0
                && self.balancing + changes > config.global_movement_threshold
            {
                warn!(partition = %batch.partition_id, moves = changes, "global balancing threshold reached");
                held += changes as usize;
                continue;
            }
            if balancing {
                self.balancing += changes;
            }
            *self.per_partition.entry(batch.partition_id.clone()).or_default() += changes;
            admitted.push(batch);
        }
        (admitted, held)
    }
}
