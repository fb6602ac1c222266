use std::path::Path;
use std::time::Instant;

use keel_balancer::{Balancer, ClusterCapacity, CollectingSink};
use keel_core::KeelConfig;
use serde::Serialize;

use crate::snapshot::Snapshot;

fn load(path: &Path) -> anyhow::Result<(Snapshot, Balancer<CollectingSink>)> {
    let snapshot = Snapshot::from_file(path)?;
    let mut balancer = Balancer::new(CollectingSink::default());
    snapshot.feed(&mut balancer)?;
    balancer.process_pending_updates(Instant::now());
    Ok((snapshot, balancer))
}

pub fn domains(snapshot: &Path, format: &str) -> anyhow::Result<()> {
    let (_, balancer) = load(snapshot)?;
    let domains = balancer.service_domains();
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&domains)?),
        _ => {
            for domain in &domains {
                println!("{}: {}", domain.id, domain.services.join(", "));
                if !domain.metrics.is_empty() {
                    println!("  metrics: {}", domain.metrics.join(", "));
                }
                if !domain.applications.is_empty() {
                    println!("  applications: {}", domain.applications.join(", "));
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct CapacityReport {
    metric: String,
    total: ClusterCapacity,
    node_loads: Vec<(String, u64)>,
}

pub fn capacity(snapshot: &Path, config: &KeelConfig, metric: &str, format: &str) -> anyhow::Result<()> {
    let (snapshot, balancer) = load(snapshot)?;
    let report = CapacityReport {
        metric: metric.to_string(),
        total: balancer.total_cluster_capacity(metric),
        node_loads: snapshot
            .nodes
            .iter()
            .map(|n| (n.id.clone(), balancer.node_load(config, &n.id, metric)))
            .collect(),
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => {
            match report.total {
                ClusterCapacity::Bounded(total) => println!("{metric}: {total}"),
                ClusterCapacity::Unbounded => println!("{metric}: unbounded"),
            }
            for (node, load) in &report.node_loads {
                println!("  {node}: {load}");
            }
        }
    }
    Ok(())
}
