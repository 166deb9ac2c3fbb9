//! Configuration loading with multi-layer merge

use super::WorkflowDefinition;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub trigger: TriggerConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub operators: OperatorsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Scheduling loop settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Interval between advancement passes in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Upper bound for a single dispatch call in milliseconds
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_dispatch_timeout_ms() -> u64 {
    5000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
        }
    }
}

impl ExecutorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

/// Schedule trigger loop settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_trigger_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_trigger_interval_ms() -> u64 {
    10_000
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: default_trigger_interval_ms(),
        }
    }
}

impl TriggerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Task queue backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// In-process queue polled by local agents
    #[default]
    Memory,
    /// Accepts everything, delivers nothing
    Noop,
    /// Remote queue service
    Http,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackend,

    /// Base URL of the queue service (http backend)
    pub url: Option<String>,

    /// Request timeout in milliseconds (http backend)
    #[serde(default = "default_queue_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_queue_timeout_ms() -> u64 {
    10_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            url: None,
            timeout_ms: default_queue_timeout_ms(),
        }
    }
}

impl QueueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Session/schedule store backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Database path for the sqlite backend, `~` is expanded
    pub path: Option<String>,
}

impl StoreConfig {
    /// Database path with `~` expanded
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path
            .as_ref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OperatorsConfig {
    /// Operator names accepted in addition to the built-in ones
    #[serde(default)]
    pub extra: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Directory for daily rolling log files
    pub dir: Option<String>,
}

impl LoggingConfig {
    pub fn resolved_dir(&self) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
    }
}

impl EngineConfig {
    /// Load configuration from the standard hierarchy
    ///
    /// Load order (later overrides earlier):
    /// 1. Built-in defaults
    /// 2. ~/.config/flowd/config.toml
    /// 3. .flowd/config.toml (project)
    pub fn load(project_dir: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(user_config_path) = Self::user_config_path() {
            if user_config_path.exists() {
                let user_config = Self::load_file(&user_config_path)
                    .with_context(|| format!("loading {}", user_config_path.display()))?;
                config.merge(user_config);
            }
        }

        let project_config_path = project_dir
            .map(|p| p.join(".flowd/config.toml"))
            .unwrap_or_else(|| PathBuf::from(".flowd/config.toml"));

        if project_config_path.exists() {
            let project_config = Self::load_file(&project_config_path)
                .with_context(|| format!("loading {}", project_config_path.display()))?;
            config.merge(project_config);
        }

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Get the user config path (~/.config/flowd/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("flowd/config.toml"))
    }

    /// Merge another config into this one (other takes precedence)
    ///
    /// A value in `other` wins only when it differs from the built-in default.
    pub fn merge(&mut self, other: Self) {
        let defaults = Self::default();

        if other.executor.tick_interval_ms != defaults.executor.tick_interval_ms {
            self.executor.tick_interval_ms = other.executor.tick_interval_ms;
        }
        if other.executor.dispatch_timeout_ms != defaults.executor.dispatch_timeout_ms {
            self.executor.dispatch_timeout_ms = other.executor.dispatch_timeout_ms;
        }

        if !other.trigger.enabled {
            self.trigger.enabled = false;
        }
        if other.trigger.tick_interval_ms != defaults.trigger.tick_interval_ms {
            self.trigger.tick_interval_ms = other.trigger.tick_interval_ms;
        }

        if other.queue.backend != defaults.queue.backend {
            self.queue.backend = other.queue.backend;
        }
        if other.queue.url.is_some() {
            self.queue.url = other.queue.url;
        }
        if other.queue.timeout_ms != defaults.queue.timeout_ms {
            self.queue.timeout_ms = other.queue.timeout_ms;
        }

        if other.store.backend != defaults.store.backend {
            self.store.backend = other.store.backend;
        }
        if other.store.path.is_some() {
            self.store.path = other.store.path;
        }

        for name in other.operators.extra {
            if !self.operators.extra.contains(&name) {
                self.operators.extra.push(name);
            }
        }

        if other.logging.dir.is_some() {
            self.logging.dir = other.logging.dir;
        }
    }
}

/// Load a workflow definition from a TOML file
///
/// When the file does not declare a `revision`, one is derived from the
/// file's modification time so that edits produce a new revision.
pub fn load_workflow(path: &Path) -> Result<WorkflowDefinition> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut workflow: WorkflowDefinition = toml::from_str(&contents)
        .with_context(|| format!("parsing {}", path.display()))?;

    if workflow.revision.is_none() {
        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .with_context(|| format!("reading metadata of {}", path.display()))?;
        let millis = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        workflow.revision = Some(format!("m{}", millis));
    }

    Ok(workflow)
}
