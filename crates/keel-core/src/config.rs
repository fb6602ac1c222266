//! `keel.toml` configuration.
//!
//! Every section and field is defaulted, so an empty file is a valid
//! configuration. The balancer never reads global state: a `KeelConfig`
//! is handed to each refresh, and tests build modified copies.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::MoveCost;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    pub constraints: ConstraintPriorities,
    pub search: SearchConfig,
    pub timing: TimingConfig,
    pub move_cost: MoveCostConfig,
    pub load: LoadConfig,
    pub domains: DomainConfig,
    pub affinity: AffinityConfig,
    pub throttle: ThrottleConfig,
    pub diagnostics: DiagnosticsConfig,
    pub refresh: RefreshConfig,
}

impl KeelConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: KeelConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Priority per constraint kind. Lower runs first; `-1` disables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintPriorities {
    pub placement: i32,
    pub fault_domain: i32,
    pub upgrade_domain: i32,
    pub node_capacity: i32,
    pub application_capacity: i32,
    pub scaleout_count: i32,
    pub affinity: i32,
    pub node_property: i32,
    pub preferred_location: i32,
}

impl Default for ConstraintPriorities {
    fn default() -> Self {
        Self {
            placement: 0,
            fault_domain: 0,
            upgrade_domain: 1,
            node_capacity: 0,
            application_capacity: 0,
            scaleout_count: 0,
            affinity: 0,
            node_property: 0,
            preferred_location: 2,
        }
    }
}

/// Ranked rules used to pick between equally scored candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakRule {
    PreferSwap,
    PreferExistingLocation,
    LowerMoveCost,
    LowerNodeLoad,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub seed: u64,
    pub placement_iterations: u32,
    pub constraint_check_iterations: u32,
    pub balancing_iterations: u32,
    pub placement_timeout_ms: u64,
    pub constraint_check_timeout_ms: u64,
    pub balancing_timeout_ms: u64,
    /// Annealing transitions between temperature updates.
    pub transitions_per_round: u32,
    pub temperature_decay_rate: f64,
    /// Random transitions sampled to size the initial temperature.
    pub initial_temperature_samples: u32,
    pub swap_primary_probability: f64,
    /// Fraction of movable replicas balancing may relocate per domain.
    pub max_percentage_to_move: f64,
    pub tie_break: Vec<TieBreakRule>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            placement_iterations: 100,
            constraint_check_iterations: 1000,
            balancing_iterations: 2000,
            placement_timeout_ms: 500,
            constraint_check_timeout_ms: 500,
            balancing_timeout_ms: 10_000,
            transitions_per_round: 100,
            temperature_decay_rate: 0.8,
            initial_temperature_samples: 50,
            swap_primary_probability: 0.3,
            max_percentage_to_move: 0.3,
            tie_break: vec![
                TieBreakRule::PreferSwap,
                TieBreakRule::PreferExistingLocation,
                TieBreakRule::LowerMoveCost,
                TieBreakRule::LowerNodeLoad,
            ],
        }
    }
}

impl SearchConfig {
    pub fn placement_timeout(&self) -> Duration {
        Duration::from_millis(self.placement_timeout_ms)
    }

    pub fn constraint_check_timeout(&self) -> Duration {
        Duration::from_millis(self.constraint_check_timeout_ms)
    }

    pub fn balancing_timeout(&self) -> Duration {
        Duration::from_millis(self.balancing_timeout_ms)
    }
}

/// Phase intervals and topology-change delays, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub min_placement_interval_ms: u64,
    pub min_constraint_check_interval_ms: u64,
    pub min_balancing_interval_ms: u64,
    pub constraint_fix_partial_delay_after_node_down_ms: u64,
    pub constraint_fix_partial_delay_after_new_node_ms: u64,
    pub balancing_delay_after_node_down_ms: u64,
    pub balancing_delay_after_new_node_ms: u64,
    /// A partition with an emitted movement stays frozen this long
    /// unless a newer version of it arrives first.
    pub max_movement_execution_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            min_placement_interval_ms: 1_000,
            min_constraint_check_interval_ms: 1_000,
            min_balancing_interval_ms: 5_000,
            constraint_fix_partial_delay_after_node_down_ms: 120_000,
            constraint_fix_partial_delay_after_new_node_ms: 120_000,
            balancing_delay_after_node_down_ms: 120_000,
            balancing_delay_after_new_node_ms: 120_000,
            max_movement_execution_ms: 10_000,
        }
    }
}

impl TimingConfig {
    pub fn min_placement_interval(&self) -> Duration {
        Duration::from_millis(self.min_placement_interval_ms)
    }

    pub fn min_constraint_check_interval(&self) -> Duration {
        Duration::from_millis(self.min_constraint_check_interval_ms)
    }

    pub fn min_balancing_interval(&self) -> Duration {
        Duration::from_millis(self.min_balancing_interval_ms)
    }

    pub fn partial_delay_after_node_down(&self) -> Duration {
        Duration::from_millis(self.constraint_fix_partial_delay_after_node_down_ms)
    }

    pub fn partial_delay_after_new_node(&self) -> Duration {
        Duration::from_millis(self.constraint_fix_partial_delay_after_new_node_ms)
    }

    pub fn balancing_delay_after_node_down(&self) -> Duration {
        Duration::from_millis(self.balancing_delay_after_node_down_ms)
    }

    pub fn balancing_delay_after_new_node(&self) -> Duration {
        Duration::from_millis(self.balancing_delay_after_new_node_ms)
    }

    pub fn max_movement_execution(&self) -> Duration {
        Duration::from_millis(self.max_movement_execution_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoveCostConfig {
    pub zero: u32,
    pub low: u32,
    pub medium: u32,
    pub high: u32,
    /// Cost of a primary/secondary swap relative to a move.
    pub swap_cost: f64,
    /// Weight of accumulated move cost in the balancing objective.
    pub weight: f64,
    /// Honour move costs reported through load updates.
    pub use_move_cost_reports: bool,
}

impl Default for MoveCostConfig {
    fn default() -> Self {
        Self {
            zero: 0,
            low: 1,
            medium: 15,
            high: 40,
            swap_cost: 0.1,
            weight: 0.001,
            use_move_cost_reports: true,
        }
    }
}

impl MoveCostConfig {
    pub fn value(&self, cost: MoveCost) -> u32 {
        match cost {
            MoveCost::Zero => self.zero,
            MoveCost::Low => self.low,
            MoveCost::Medium => self.medium,
            MoveCost::High => self.high,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub use_separate_secondary_load: bool,
    pub prevent_transient_overcommit: bool,
    pub count_disappearing_load: bool,
    /// Fraction of node capacity kept free by placement and balancing.
    pub node_buffer_percentage: BTreeMap<String, f64>,
    /// Balance a metric when max/min node load exceeds this ratio.
    /// Empty by default: only metrics listed here are ever balanced.
    pub balancing_thresholds: BTreeMap<String, f64>,
    /// Balance a metric only when its busiest node carries more than this.
    pub activity_thresholds: BTreeMap<String, u64>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            use_separate_secondary_load: true,
            prevent_transient_overcommit: false,
            count_disappearing_load: true,
            node_buffer_percentage: BTreeMap::new(),
            balancing_thresholds: BTreeMap::new(),
            activity_thresholds: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    pub fault_domain_constraint: bool,
    pub upgrade_domain_constraint: bool,
    pub quorum_based_fault_domains: bool,
    pub quorum_based_upgrade_domains: bool,
    /// Switch to quorum semantics when the target exceeds domains + 1.
    pub quorum_auto_switch: bool,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            fault_domain_constraint: true,
            upgrade_domain_constraint: true,
            quorum_based_fault_domains: false,
            quorum_based_upgrade_domains: false,
            quorum_auto_switch: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AffinityConfig {
    pub move_parent_to_fix_violation: bool,
    pub allow_higher_child_target: bool,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            move_parent_to_fix_violation: false,
            allow_higher_child_target: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Balancing movements allowed per counting interval; zero disables.
    pub global_movement_threshold: u32,
    /// Movements allowed per partition per counting interval; zero disables.
    pub per_partition_threshold: u32,
    pub counting_interval_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_movement_threshold: 1000,
            per_partition_threshold: 50,
            counting_interval_ms: 600_000,
        }
    }
}

impl ThrottleConfig {
    pub fn counting_interval(&self) -> Duration {
        Duration::from_millis(self.counting_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub health_report_violation_limit: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            health_report_violation_limit: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Plan independent service domains on separate threads.
    pub parallel_domains: bool,
    /// One output callback per refresh instead of one per domain.
    pub batch_movements: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            parallel_domains: true,
            batch_movements: false,
        }
    }
}
