use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const OIDA_DIR: &str = ".oida";
pub const CONFIG_FILE: &str = "config.toml";

/// Fatal startup problems. The loop never starts while any of these hold.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("workspace root {0} does not exist or is not a directory")]
    InvalidWorkspace(PathBuf),
    #[error("agent binary `{0}` was not found on PATH")]
    MissingAgentBinary(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("action threshold {0} is outside [0, 1]")]
    Threshold(f64),
    #[error("reasoning endpoint `{0}` is not an http(s) URL")]
    Endpoint(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct OidaConfig {
    pub workspace_root: PathBuf,
    pub ignore_patterns: Vec<String>,
    pub debounce_ms: u64,
    pub cycle_interval_secs: u64,
    /// Consult the reasoning engine even when nothing changed.
    pub think_when_idle: bool,
    pub shutdown_grace_secs: u64,
    /// Relative paths resolve against `workspace_root`.
    pub state_path: PathBuf,
    pub reasoning: ReasoningConfig,
    pub decision: DecisionConfig,
    pub execution: ExecutionConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ReasoningConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub health_interval_secs: u64,
    /// How many recent cycle outcomes are fed back as context.
    pub history_window: usize,
    pub temperature: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DecisionConfig {
    pub action_threshold: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub agent_binary: String,
    pub agent_print_flag: String,
    pub swarm_binary: String,
    pub swarm_topology: String,
    pub swarm_max_agents: u32,
    pub timeout_secs: u64,
    pub kill_grace_ms: u64,
    pub output_limit_bytes: usize,
    pub launch_retries: u32,
}

impl Default for OidaConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            ignore_patterns: vec![
                ".git".to_string(),
                "target".to_string(),
                OIDA_DIR.to_string(),
                "node_modules".to_string(),
                "*.lock".to_string(),
                "*.swp".to_string(),
                "*~".to_string(),
            ],
            debounce_ms: 500,
            cycle_interval_secs: 5,
            think_when_idle: false,
            shutdown_grace_secs: 30,
            state_path: PathBuf::from(OIDA_DIR).join("state"),
            reasoning: ReasoningConfig::default(),
            decision: DecisionConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:1234/v1/chat/completions".to_string(),
            model: "local-model".to_string(),
            api_key: None,
            timeout_secs: 60,
            max_retries: 3,
            backoff_base_secs: 2,
            backoff_cap_secs: 60,
            health_interval_secs: 15,
            history_window: 5,
            temperature: 0.2,
        }
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            action_threshold: 0.7,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            agent_binary: "claude".to_string(),
            agent_print_flag: "-p".to_string(),
            swarm_binary: "claude-flow".to_string(),
            swarm_topology: "hierarchical".to_string(),
            swarm_max_agents: 5,
            timeout_secs: 600,
            kill_grace_ms: 2_000,
            output_limit_bytes: 1024 * 1024,
            launch_retries: 1,
        }
    }
}

impl OidaConfig {
    /// Default location of the config file inside a workspace.
    pub fn default_path(workspace: &Path) -> PathBuf {
        workspace.join(OIDA_DIR).join(CONFIG_FILE)
    }

    /// Loads the TOML config, falling back to defaults when the file is
    /// missing, then applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            toml::from_str::<OidaConfig>(&raw)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        } else {
            OidaConfig::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }

    fn apply_env(&mut self) {
        if let Ok(url) = env::var("OIDA_REASONING_URL") {
            self.reasoning.endpoint = url;
        }
        if let Ok(model) = env::var("OIDA_MODEL") {
            self.reasoning.model = model;
        }
        if let Ok(key) = env::var("OIDA_API_KEY") {
            self.reasoning.api_key = Some(key);
        }
    }

    /// Checks everything that must hold before the loop may start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.workspace_root.is_dir() {
            return Err(ConfigError::InvalidWorkspace(self.workspace_root.clone()));
        }
        for (field, value) in [
            ("debounce_ms", self.debounce_ms),
            ("cycle_interval_secs", self.cycle_interval_secs),
            ("reasoning.timeout_secs", self.reasoning.timeout_secs),
            ("reasoning.health_interval_secs", self.reasoning.health_interval_secs),
            ("execution.timeout_secs", self.execution.timeout_secs),
            ("execution.output_limit_bytes", self.execution.output_limit_bytes as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(field));
            }
        }
        let threshold = self.decision.action_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Threshold(threshold));
        }
        let endpoint = &self.reasoning.endpoint;
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(ConfigError::Endpoint(endpoint.clone()));
        }
        if which::which(&self.execution.agent_binary).is_err() {
            return Err(ConfigError::MissingAgentBinary(
                self.execution.agent_binary.clone(),
            ));
        }
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        if self.state_path.is_absolute() {
            self.state_path.clone()
        } else {
            self.workspace_root.join(&self.state_path)
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Lifecycle of the OIDA loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Starting,
    Cycling,
    Stopping,
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopState::Starting => write!(f, "starting"),
            LoopState::Cycling => write!(f, "cycling"),
            LoopState::Stopping => write!(f, "stopping"),
            LoopState::Stopped => write!(f, "stopped"),
        }
    }
}
