//! Periodic driver for a [`Balancer`].
//!
//! Applies pending updates on a short tick and runs a full refresh on a
//! longer one until the shutdown signal flips. A refresh is CPU-bound and
//! runs through `block_in_place`, so the runner needs the multi-threaded
//! runtime.

use std::time::{Duration, Instant};

use keel_core::KeelConfig;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::balancer::{Balancer, MovementSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerIntervals {
    pub process_pending: Duration,
    pub refresh: Duration,
}

impl Default for RunnerIntervals {
    fn default() -> Self {
        Self {
            process_pending: Duration::from_millis(100),
            refresh: Duration::from_secs(1),
        }
    }
}

/// Drive `balancer` until `shutdown` changes. Returns the number of
/// refreshes run.
pub async fn run<S: MovementSink>(
    balancer: &mut Balancer<S>,
    config: &KeelConfig,
    intervals: RunnerIntervals,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    info!(
        refresh_ms = intervals.refresh.as_millis() as u64,
        "balancer runner started"
    );

    let mut process_tick = tokio::time::interval(intervals.process_pending);
    let mut refresh_tick = tokio::time::interval(intervals.refresh);
    let mut refreshes = 0u64;

    loop {
        tokio::select! {
            _ = refresh_tick.tick() => {
                let stats = tokio::task::block_in_place(|| balancer.refresh(Instant::now(), config));
                debug!(moves = stats.movements, scaled = stats.scaled, "runner refresh");
                refreshes += 1;
            }
            _ = process_tick.tick() => {
                balancer.process_pending_updates(Instant::now());
            }
            _ = shutdown.changed() => {
                info!(refreshes, "balancer runner shutting down");
                break;
            }
        }
    }
    refreshes
}

#[cfg(test)]
mod tests {
    use keel_core::*;

    use super::*;
    use crate::balancer::CollectingSink;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runner_refreshes_until_shutdown() {
        let mut balancer = Balancer::new(CollectingSink::default());
        balancer.update_node(NodeDescription::new("n0", "/fd0", "ud0")).unwrap();
        balancer.update_node(NodeDescription::new("n1", "/fd1", "ud1")).unwrap();
        balancer
            .update_service_type(ServiceTypeDescription {
                name: "T".into(),
                ..Default::default()
            })
            .unwrap();
        balancer.update_service(ServiceDescription::stateful("svc", "T", 2)).unwrap();
        balancer
            .update_failover_unit(FailoverUnitDescription::new("p0", "svc", 1))
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let intervals = RunnerIntervals {
            process_pending: Duration::from_millis(5),
            refresh: Duration::from_millis(20),
        };
        let config = KeelConfig::default();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            tx.send(true).unwrap();
        });

        let refreshes = run(&mut balancer, &config, intervals, rx).await;
        stopper.await.unwrap();
        assert!(refreshes >= 1);
        assert_eq!(balancer.pending_updates(), 0);
        let emitted = &balancer.sink().emitted;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].1, DecisionToken(1));
    }
}
