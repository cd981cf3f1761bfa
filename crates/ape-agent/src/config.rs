//! Explorer configuration
//!
//! Every section has serde defaults, so a partial file or a handful of
//! `APE_` variables override only what they name.

use std::path::{Path, PathBuf};

use ape_common::{ApeError, Result, TreeOptions};
use ape_model::ModelConfig;
use ape_naming::BaseNaming;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Explorer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApeConfig {
    pub naming: NamingSettings,
    pub model: ModelConfig,
    pub agent: AgentSettings,
    pub io: IoSettings,
}

impl ApeConfig {
    /// Load configuration from `.env`, an optional file and `APE_` variables.
    ///
    /// Nested keys use a double underscore, e.g. `APE_AGENT__DEFAULT_EPSILON`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // Try to load .env file
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("APE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ApeError::Config(e.to_string()))?;
        let cfg: ApeConfig = settings
            .try_deserialize()
            .map_err(|e| ApeError::Config(e.to_string()))?;
        cfg.validate()?;
        debug!(?cfg, "configuration loaded");
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let probabilities = [
            ("agent.clean_restart_probability", self.agent.clean_restart_probability),
            ("agent.input_rate", self.agent.input_rate),
            ("agent.default_epsilon", self.agent.default_epsilon),
            ("agent.fuzzing_rate", self.agent.fuzzing_rate),
        ];
        for (key, value) in probabilities {
            if !(0.0..=1.0).contains(&value) {
                return Err(ApeError::Config(format!("{} must be within [0, 1], got {}", key, value)));
            }
        }
        if self.io.image_writer_count == 0 {
            return Err(ApeError::Config("io.image_writer_count must be positive".into()));
        }
        if self.agent.max_path_length == 0 {
            return Err(ApeError::Config("agent.max_path_length must be positive".into()));
        }
        Ok(())
    }
}

/// Naming lattice settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingSettings {
    pub use_ancestor_namer: bool,
    pub use_patch_namer: bool,
    pub base_naming: BaseNaming,
}

impl Default for NamingSettings {
    fn default() -> Self {
        Self {
            use_ancestor_namer: true,
            use_patch_namer: true,
            base_naming: BaseNaming::ActionType,
        }
    }
}

/// Which selection policy drives the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    #[default]
    Sata,
    Random,
    Replay,
}

impl std::str::FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sata" => Ok(AgentKind::Sata),
            "random" => Ok(AgentKind::Random),
            "replay" => Ok(AgentKind::Replay),
            other => Err(format!("unknown agent kind: {}", other)),
        }
    }
}

/// Exploration policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub kind: AgentKind,
    /// Package of the app under test
    pub package: String,
    /// Activity launched by start actions
    pub main_activity: String,
    /// Action log replayed by the replay agent
    pub replay_log: Option<PathBuf>,
    /// Seed of the agent's random source; random when unset
    pub seed: Option<u64>,
    pub evolve_model: bool,
    pub throttle_for_unvisited_action: u32,
    pub throttle_for_activity_transition: u32,
    pub base_throttle: u32,
    pub max_throttle: u32,
    pub graph_stable_restart_threshold: u32,
    pub state_stable_restart_threshold: u32,
    pub activity_stable_restart_threshold: u32,
    pub max_extra_priority_aliased_actions: i32,
    pub check_restart: bool,
    pub restart_threshold_min: u64,
    pub restart_threshold_max: u64,
    pub clean_restart_probability: f64,
    pub input_rate: f64,
    pub default_epsilon: f64,
    pub trivial_activity_rank_threshold: usize,
    pub use_action_differ: bool,
    pub do_fuzzing: bool,
    pub fuzzing_rate: f64,
    pub max_bad_states: u32,
    pub max_consecutive_bad_states: u32,
    /// BFS depth bound of path searches
    pub max_path_length: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            kind: AgentKind::Sata,
            package: String::new(),
            main_activity: String::new(),
            replay_log: None,
            seed: None,
            evolve_model: true,
            throttle_for_unvisited_action: 200,
            throttle_for_activity_transition: 500,
            base_throttle: 0,
            max_throttle: 5000,
            graph_stable_restart_threshold: 100,
            state_stable_restart_threshold: 50,
            activity_stable_restart_threshold: u32::MAX,
            max_extra_priority_aliased_actions: ape_common::MAX_EXTRA_PRIORITY_ALIASED_ACTIONS,
            check_restart: true,
            restart_threshold_min: 100,
            restart_threshold_max: 300,
            clean_restart_probability: 0.2,
            input_rate: 0.8,
            default_epsilon: 0.05,
            trivial_activity_rank_threshold: 3,
            use_action_differ: true,
            do_fuzzing: true,
            fuzzing_rate: 0.02,
            max_bad_states: 100,
            max_consecutive_bad_states: 10,
            max_path_length: 10,
        }
    }
}

/// Boundary settings: snapshots, screenshots, logs and pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IoSettings {
    /// Directory the file-backed source reads snapshot documents from
    pub snapshot_dir: Option<PathBuf>,
    /// Directory receiving the action log, screenshots and graph dumps
    pub output_dir: PathBuf,
    /// Model snapshot loaded at start and saved on tear down
    pub model_path: Option<PathBuf>,
    pub take_screenshots: bool,
    pub flush_images_threshold: u64,
    pub image_writer_count: usize,
    pub default_gui_throttle: u32,
    pub nop_throttle: u32,
    pub snapshot_retries: u32,
    pub ignore_empty: bool,
    pub ignore_out_of_bounds: bool,
    pub patch_clickable_containers: bool,
}

impl Default for IoSettings {
    fn default() -> Self {
        Self {
            snapshot_dir: None,
            output_dir: PathBuf::from("ape-output"),
            model_path: None,
            take_screenshots: false,
            flush_images_threshold: 10,
            image_writer_count: 3,
            default_gui_throttle: 200,
            nop_throttle: 1000,
            snapshot_retries: 3,
            ignore_empty: true,
            ignore_out_of_bounds: true,
            patch_clickable_containers: true,
        }
    }
}

impl IoSettings {
    pub fn tree_options(&self) -> TreeOptions {
        TreeOptions {
            ignore_empty: self.ignore_empty,
            ignore_out_of_bounds: self.ignore_out_of_bounds,
            patch_clickable_containers: self.patch_clickable_containers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ApeConfig::default();
        assert!(cfg.naming.use_ancestor_namer);
        assert_eq!(cfg.naming.base_naming, BaseNaming::ActionType);
        assert_eq!(cfg.model.action_refinement_threshold, 3);
        assert_eq!(cfg.agent.max_throttle, 5000);
        assert_eq!(cfg.agent.activity_stable_restart_threshold, u32::MAX);
        assert_eq!(cfg.io.image_writer_count, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg: ApeConfig =
            serde_json::from_str(r#"{"agent": {"default_epsilon": 0.5}, "naming": {"base_naming": "stoat"}}"#)
                .unwrap();
        assert_eq!(cfg.agent.default_epsilon, 0.5);
        assert_eq!(cfg.agent.max_bad_states, 100);
        assert_eq!(cfg.naming.base_naming, BaseNaming::Stoat);
        assert!(cfg.naming.use_patch_namer);
    }

    #[test]
    fn test_validate_rejects_probability() {
        let mut cfg = ApeConfig::default();
        cfg.agent.fuzzing_rate = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_agent_kind_from_str() {
        assert_eq!("Random".parse::<AgentKind>().unwrap(), AgentKind::Random);
        assert!("greedy".parse::<AgentKind>().is_err());
    }

    #[test]
    fn test_load_file() {
        let dir = std::env::temp_dir().join(format!("ape-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ape.json");
        std::fs::write(&path, r#"{"io": {"snapshot_retries": 7}, "agent": {"kind": "random"}}"#).unwrap();
        let cfg = ApeConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.io.snapshot_retries, 7);
        assert_eq!(cfg.agent.kind, AgentKind::Random);
        std::fs::remove_dir_all(&dir).ok();
    }
}
