use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use keel_balancer::{Balancer, CollectingSink, RefreshStats};
use keel_core::{DecisionToken, KeelConfig, Movement, MovementBatch, PartitionId, TargetChange};
use serde::Serialize;
use tracing::info;

use crate::snapshot::Snapshot;

#[derive(Debug, Serialize)]
struct PlanReport {
    stats: RefreshStats,
    decisions: Vec<Decision>,
    targets: Vec<TargetChange>,
}

#[derive(Debug, Serialize)]
struct Decision {
    token: DecisionToken,
    batches: BTreeMap<PartitionId, MovementBatch>,
}

pub fn load_config(path: Option<&Path>, seed: Option<u64>) -> anyhow::Result<KeelConfig> {
    let mut config = match path {
        Some(path) => KeelConfig::from_file(path)?,
        None => KeelConfig::default(),
    };
    if let Some(seed) = seed {
        config.search.seed = seed;
    }
    Ok(config)
}

/// Run one refresh over the snapshot and print what would be emitted.
pub fn plan(snapshot: &Path, config: &KeelConfig, format: &str) -> anyhow::Result<()> {
    let snapshot = Snapshot::from_file(snapshot)?;
    let mut balancer = Balancer::new(CollectingSink::default());
    snapshot.feed(&mut balancer)?;

    let stats = balancer.refresh(Instant::now(), config);
    info!(moves = stats.movements, callbacks = stats.callbacks, scaled = stats.scaled, "plan computed");

    let sink = balancer.sink_mut();
    let decisions: Vec<Decision> = sink
        .emitted
        .drain(..)
        .map(|(batches, token)| Decision { token, batches })
        .collect();
    let targets = std::mem::take(&mut sink.targets);
    let report = PlanReport {
        stats,
        decisions,
        targets,
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print!("{}", format_plan(&report)),
    }
    Ok(())
}

fn format_movement(movement: &Movement) -> String {
    let kind = serde_json::to_value(movement.kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    match (&movement.source, &movement.target) {
        (Some(source), Some(target)) => format!("{kind} {source} -> {target}"),
        (Some(source), None) => format!("{kind} {source}"),
        (None, Some(target)) => format!("{kind} -> {target}"),
        (None, None) => kind,
    }
}

fn format_plan(report: &PlanReport) -> String {
    let mut out = String::new();
    for decision in &report.decisions {
        out.push_str(&format!("decision {}\n", decision.token.0));
        for batch in decision.batches.values() {
            out.push_str(&format!("  {} ({}, {})\n", batch.partition_id, batch.service, batch.phase));
            for movement in &batch.movements {
                out.push_str(&format!("    {}\n", format_movement(movement)));
            }
        }
    }
    for change in &report.targets {
        out.push_str(&format!(
            "scale {} ({}) {} -> {}\n",
            change.partition_id, change.service, change.previous, change.target
        ));
    }
    let stats = &report.stats;
    out.push_str(&format!(
        "{} domains, {} movements, {} infeasible, {} throttled\n",
        stats.domains, stats.movements, stats.infeasible, stats.throttled
    ));
    out
}
