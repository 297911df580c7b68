//! section-loop configuration and its load fallback chain.

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent_runner: AgentRunnerConfig,
    pub concurrency: ConcurrencyConfig,
    pub coordination: CoordinationConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration with fallback chain: explicit `--config` path,
    /// then `.section-loop.yml` in the working directory, then
    /// `~/.config/section-loop/section-loop.yml`, then built-in defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".section-loop.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => tracing::warn!("failed to load config from {}: {}", local_config.display(), e),
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("section-loop").join("section-loop.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => tracing::warn!("failed to load config from {}: {}", user_config.display(), e),
                }
            }
        }

        tracing::info!("no config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("failed to parse config file")?;
        tracing::info!("loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Settings for invoking the external `agents` runner CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentRunnerConfig {
    /// Binary name on PATH, or an absolute path.
    #[serde(rename = "binary")]
    pub binary: String,
    /// Default model tier for each dispatch stage; escalation policy
    /// (§4.5, §4.7) overrides these per-dispatch.
    #[serde(rename = "proposer-model")]
    pub proposer_model: String,
    #[serde(rename = "proposer-escalated-model")]
    pub proposer_escalated_model: String,
    #[serde(rename = "alignment-judge-model")]
    pub alignment_judge_model: String,
    #[serde(rename = "implementation-model")]
    pub implementation_model: String,
    #[serde(rename = "impact-analysis-model")]
    pub impact_analysis_model: String,
    #[serde(rename = "coordination-planner-model")]
    pub coordination_planner_model: String,
    #[serde(rename = "fix-model")]
    pub fix_model: String,
    #[serde(rename = "fix-escalated-model")]
    pub fix_escalated_model: String,
    #[serde(rename = "bridge-model")]
    pub bridge_model: String,
    #[serde(rename = "re-explorer-model")]
    pub re_explorer_model: String,
    #[serde(rename = "monitor-model")]
    pub monitor_model: String,
    #[serde(rename = "state-adjudicator-model")]
    pub state_adjudicator_model: String,
    /// Wall-clock budget per agent dispatch, in seconds (spec §4.3: 600).
    #[serde(rename = "dispatch-timeout-secs")]
    pub dispatch_timeout_secs: u64,
    /// Wall-clock budget waiting for a monitor to ack `agent-finished`
    /// (spec §4.3: 30).
    #[serde(rename = "monitor-timeout-secs")]
    pub monitor_timeout_secs: u64,
    /// Monitor stall threshold with no narration, in seconds (spec §4.3:
    /// five minutes).
    #[serde(rename = "monitor-stall-secs")]
    pub monitor_stall_secs: u64,
}

impl Default for AgentRunnerConfig {
    fn default() -> Self {
        Self {
            binary: "agents".to_string(),
            proposer_model: "gpt-5-codex".to_string(),
            proposer_escalated_model: "gpt-5-codex-high".to_string(),
            alignment_judge_model: "claude-opus-4".to_string(),
            implementation_model: "gpt-5-codex".to_string(),
            impact_analysis_model: "claude-haiku-4".to_string(),
            coordination_planner_model: "claude-opus-4".to_string(),
            fix_model: "gpt-5-codex".to_string(),
            fix_escalated_model: "gpt-5-codex-high".to_string(),
            bridge_model: "gpt-5-codex-high".to_string(),
            re_explorer_model: "claude-opus-4".to_string(),
            monitor_model: "claude-haiku-4".to_string(),
            state_adjudicator_model: "claude-haiku-4".to_string(),
            dispatch_timeout_secs: 600,
            monitor_timeout_secs: 30,
            monitor_stall_secs: 300,
        }
    }
}

/// Concurrency limits (spec §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    #[serde(rename = "explore-workers")]
    pub explore_workers: u32,
    #[serde(rename = "coordinator-fix-workers")]
    pub coordinator_fix_workers: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            explore_workers: 5,
            coordinator_fix_workers: 4,
        }
    }
}

/// Coordination round bounds (spec §4.7, §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    #[serde(rename = "max-rounds")]
    pub max_rounds: u32,
    #[serde(rename = "min-rounds")]
    pub min_rounds: u32,
    #[serde(rename = "stall-escalate-at")]
    pub stall_escalate_at: u32,
    #[serde(rename = "stall-terminate-at")]
    pub stall_terminate_at: u32,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            min_rounds: 2,
            stall_escalate_at: 2,
            stall_terminate_at: 3,
        }
    }
}

/// Storage paths, relative to the planspace root unless absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "event-log-filename")]
    pub event_log_filename: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            event_log_filename: "run.db".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_constants() {
        let config = Config::default();
        assert_eq!(config.coordination.max_rounds, 10);
        assert_eq!(config.coordination.min_rounds, 2);
        assert_eq!(config.concurrency.explore_workers, 5);
        assert_eq!(config.concurrency.coordinator_fix_workers, 4);
        assert_eq!(config.agent_runner.dispatch_timeout_secs, 600);
        assert_eq!(config.agent_runner.monitor_timeout_secs, 30);
    }

    #[test]
    fn partial_yaml_uses_defaults_for_rest() {
        let yaml = "coordination:\n  max-rounds: 6\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.coordination.max_rounds, 6);
        assert_eq!(config.coordination.min_rounds, 2);
        assert_eq!(config.concurrency.explore_workers, 5);
    }

    // Mutates the process-wide working directory, so this must run
    // serialized against any other test that also does (spec §6 load
    // fallback chain: `.section-loop.yml` is resolved relative to cwd).
    #[test]
    #[serial_test::serial]
    fn load_falls_back_to_dot_file_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let original_cwd = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        std::fs::write(".section-loop.yml", "coordination:\n  max-rounds: 7\n").unwrap();
        let result = Config::load(None);

        std::env::set_current_dir(original_cwd).unwrap();

        let config = result.unwrap();
        assert_eq!(config.coordination.max_rounds, 7);
        assert_eq!(config.agent_runner.binary, "agents");
    }
}
