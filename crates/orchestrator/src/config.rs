//! Configuration parsing and validation for N-body simulations

use kernel::ClassRanges;
use serde::{Deserialize, Serialize};
use std::fs;

/// Main simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Human-readable simulation name
    pub name: String,
    /// Plummer softening length applied to every pair interaction
    #[serde(default = "default_softening")]
    pub softening: f32,
    /// Barnes-Hut opening angle; cells with `size/dist < theta` act as
    /// aggregates
    #[serde(default = "default_theta")]
    pub theta: f32,
    /// Shared step size for the first step
    #[serde(default = "default_dt")]
    pub dt_initial: f32,
    /// Lower clamp for the adaptive step
    #[serde(default = "default_dt_min")]
    pub dt_min: f32,
    /// Upper clamp for the adaptive step
    #[serde(default = "default_dt")]
    pub dt_max: f32,
    /// Accuracy parameter for the adaptive step `eta * sqrt(eps/|a|)`
    #[serde(default = "default_eta")]
    pub eta: f32,
    /// Stop once simulated time reaches this value
    #[serde(default = "default_t_end")]
    pub t_end: f64,
    /// Rebuild the tree from scratch every this many steps; moments are
    /// refreshed in between
    #[serde(default = "default_rebuild_interval")]
    pub rebuild_interval: u64,
    /// Re-run the domain decomposition every this many steps
    #[serde(default = "default_rebalance_interval")]
    pub rebalance_interval: u64,
    /// Drop particles farther than this from the origin (None disables
    /// removal)
    #[serde(default)]
    pub remove_distance: Option<f32>,
    /// Emit a snapshot every this many simulated time units (None disables
    /// snapshots)
    #[serde(default)]
    pub snapshot_interval: Option<f64>,
    /// Snapshot file name prefix; the sequence number is appended
    #[serde(default = "default_snapshot_base")]
    pub snapshot_base: String,
    /// Number of worker ranks
    #[serde(default = "default_num_ranks")]
    pub num_ranks: usize,
    /// Starting receive capacity (particles) for the exchange protocol
    #[serde(default = "default_recv_capacity")]
    pub initial_recv_capacity: usize,
    /// Largest particle count carried by one scatter message
    #[serde(default = "default_max_transfer")]
    pub max_transfer: usize,
    /// Id thresholds partitioning the population into classes
    #[serde(default)]
    pub class_ranges: ClassRanges,
}

// Default values

fn default_softening() -> f32 {
    0.05
}

fn default_theta() -> f32 {
    0.75
}

fn default_dt() -> f32 {
    1.0 / 16.0
}

fn default_dt_min() -> f32 {
    1.0 / 65536.0
}

fn default_eta() -> f32 {
    0.1
}

fn default_t_end() -> f64 {
    1.0
}

fn default_rebuild_interval() -> u64 {
    2
}

fn default_rebalance_interval() -> u64 {
    8
}

fn default_snapshot_base() -> String {
    "snapshot_".to_string()
}

fn default_num_ranks() -> usize {
    1
}

fn default_recv_capacity() -> usize {
    4096
}

fn default_max_transfer() -> usize {
    65536
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            name: "nbody".to_string(),
            softening: default_softening(),
            theta: default_theta(),
            dt_initial: default_dt(),
            dt_min: default_dt_min(),
            dt_max: default_dt(),
            eta: default_eta(),
            t_end: default_t_end(),
            rebuild_interval: default_rebuild_interval(),
            rebalance_interval: default_rebalance_interval(),
            remove_distance: None,
            snapshot_interval: None,
            snapshot_base: default_snapshot_base(),
            num_ranks: default_num_ranks(),
            initial_recv_capacity: default_recv_capacity(),
            max_transfer: default_max_transfer(),
            class_ranges: ClassRanges::default(),
        }
    }
}

impl SimulationConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &str) -> Result<Self, String> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        let config: SimulationConfig = serde_json::from_str(&contents)
            .map_err(|e| format!("Failed to parse config JSON: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.softening <= 0.0 {
            return Err("Softening length must be positive".to_string());
        }

        if self.theta <= 0.0 || self.theta > 2.0 {
            return Err("Opening angle theta must be in range (0, 2]".to_string());
        }

        if self.dt_min <= 0.0 {
            return Err("dt_min must be positive".to_string());
        }
        if self.dt_max < self.dt_min {
            return Err("dt_max must be at least dt_min".to_string());
        }
        if self.dt_initial < self.dt_min || self.dt_initial > self.dt_max {
            return Err("dt_initial must lie within [dt_min, dt_max]".to_string());
        }

        if self.eta <= 0.0 {
            return Err("eta must be positive".to_string());
        }

        if self.t_end <= 0.0 {
            return Err("t_end must be positive".to_string());
        }

        if self.rebuild_interval == 0 {
            return Err("rebuild_interval must be at least 1".to_string());
        }
        if self.rebalance_interval == 0 {
            return Err("rebalance_interval must be at least 1".to_string());
        }

        if let Some(d) = self.remove_distance {
            if d <= 0.0 {
                return Err("remove_distance must be positive".to_string());
            }
        }

        if let Some(si) = self.snapshot_interval {
            if si <= 0.0 {
                return Err("snapshot_interval must be positive".to_string());
            }
        }

        if self.num_ranks == 0 {
            return Err("num_ranks must be at least 1".to_string());
        }
        if self.initial_recv_capacity == 0 {
            return Err("initial_recv_capacity must be at least 1".to_string());
        }
        if self.max_transfer == 0 {
            return Err("max_transfer must be at least 1".to_string());
        }

        if self.class_ranges.dust_start >= self.class_ranges.dust_end {
            return Err("class_ranges dust range must be non-empty".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SimulationConfig::default();
        assert!(config.validate().is_ok());
        assert!((config.theta - 0.75).abs() < 1e-6);
        assert!((config.dt_initial - 0.0625).abs() < 1e-9);
        assert_eq!(config.rebuild_interval, 2);
    }

    #[test]
    fn validation_rejects_bad_theta() {
        let mut config = SimulationConfig::default();
        config.theta = 0.0;
        assert!(config.validate().is_err());
        config.theta = 2.5;
        assert!(config.validate().is_err());
        config.theta = 0.75;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_dt_ordering() {
        let mut config = SimulationConfig::default();
        config.dt_min = 0.5;
        config.dt_max = 0.25;
        assert!(config.validate().is_err());

        let mut config = SimulationConfig::default();
        config.dt_initial = config.dt_max * 2.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_intervals() {
        let mut config = SimulationConfig::default();
        config.rebuild_interval = 0;
        assert!(config.validate().is_err());

        let mut config = SimulationConfig::default();
        config.num_ranks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let json = r#"{ "name": "minimal" }"#;
        let config: SimulationConfig = serde_json::from_str(json).expect("parses");
        assert!(config.validate().is_ok());
        assert_eq!(config.name, "minimal");
        assert_eq!(config.num_ranks, 1);
        assert!(config.remove_distance.is_none());
        assert_eq!(config.class_ranges.dust_start, 50_000_000);
    }

    #[test]
    fn load_round_trip_through_file() {
        let mut config = SimulationConfig::default();
        config.name = "round-trip".to_string();
        config.num_ranks = 3;

        let path = std::env::temp_dir().join("nbody_config_round_trip.json");
        fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
        let loaded = SimulationConfig::load(path.to_str().unwrap()).expect("loads");
        let _ = fs::remove_file(&path);

        assert_eq!(loaded.name, "round-trip");
        assert_eq!(loaded.num_ranks, 3);
    }
}
