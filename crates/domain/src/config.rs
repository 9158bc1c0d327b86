//! Kernel configuration, loaded from `orchard.toml`. Every section and
//! field has a default so an empty file (or none at all) is valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub subtasks: SubtaskConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Workspace root — where `AGENTS.md` and other context files live.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Directory holding the JSONL logs and the projection snapshot file.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Interval between tool-call heartbeat UI events, in milliseconds.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// When true, agents stream deltas instead of waiting for completions.
    #[serde(default)]
    pub streaming: bool,
    /// Maximum LLM/tool loops per run before the agent gives up.
    #[serde(default = "default_max_agent_loops")]
    pub max_agent_loops: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_heartbeat_ms(),
            streaming: false,
            max_agent_loops: default_max_agent_loops(),
        }
    }
}

fn default_heartbeat_ms() -> u64 {
    4_000
}

fn default_max_agent_loops() -> u32 {
    25
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskConfig {
    /// Hard timeout for a parent waiting on one child, in seconds.
    #[serde(default = "default_subtask_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum parent-chain depth.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for SubtaskConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_subtask_timeout_secs(),
            max_depth: default_max_depth(),
        }
    }
}

fn default_subtask_timeout_secs() -> u64 {
    300
}

fn default_max_depth() -> usize {
    3
}

/// How risk classification treats borderline tools. Tools receive the mode
/// through their context and may downgrade their own risk under `Trusting`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    #[default]
    Guarded,
    Trusting,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolsConfig {
    #[serde(default)]
    pub policy: PolicyMode,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loading
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Config {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Sanity-check the configuration. Returns human-readable warnings;
    /// nothing here is fatal.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.runtime.heartbeat_ms < 100 {
            warnings.push(format!(
                "runtime.heartbeat_ms = {} is very low; UI consumers may be flooded",
                self.runtime.heartbeat_ms
            ));
        }
        if self.runtime.max_agent_loops == 0 {
            warnings.push("runtime.max_agent_loops = 0 means no agent can make progress".into());
        }
        if self.subtasks.max_depth == 0 {
            warnings.push("subtasks.max_depth = 0 disables subtask creation entirely".into());
        }
        warnings
    }
}
