//! Runtime configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::core::StageName;
use crate::errors::{CraftflowError, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable multi-line output.
    Pretty,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Pretty => write!(f, "pretty"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = CraftflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(CraftflowError::Config(format!("unknown log format: {other}"))),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `craftflow=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A service exposed by generated projects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    /// Service name.
    pub name: String,
    /// Exposed port.
    pub port: u16,
}

impl ServicePort {
    /// Creates a service entry.
    #[must_use]
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }
}

/// Configuration for the pipeline coordinator and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CraftflowConfig {
    /// Time bound for a stage without an explicit override, in seconds.
    #[serde(default = "default_stage_timeout_secs")]
    pub default_stage_timeout_secs: u64,
    /// Per-stage time bounds, in seconds.
    #[serde(default = "default_stage_timeouts")]
    pub stage_timeouts: HashMap<StageName, u64>,
    /// Root directory for generated projects.
    #[serde(default = "default_projects_dir")]
    pub projects_dir: PathBuf,
    /// Deployment target passed to the deploy stage.
    #[serde(default = "default_deploy_target")]
    pub deploy_target: String,
    /// Services passed to the infrastructure stage.
    #[serde(default = "default_services")]
    pub services: Vec<ServicePort>,
    /// Per-observer event queue bound.
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,
    /// Logging setup.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_stage_timeout_secs() -> u64 {
    300
}

fn default_stage_timeouts() -> HashMap<StageName, u64> {
    HashMap::from([(StageName::Builder, 600), (StageName::Deployer, 600)])
}

fn default_projects_dir() -> PathBuf {
    PathBuf::from("./projects")
}

fn default_deploy_target() -> String {
    "docker-compose".to_string()
}

fn default_services() -> Vec<ServicePort> {
    vec![
        ServicePort::new("backend", 8000),
        ServicePort::new("frontend", 3000),
        ServicePort::new("db", 5432),
    ]
}

fn default_observer_buffer() -> usize {
    256
}

impl Default for CraftflowConfig {
    fn default() -> Self {
        Self {
            default_stage_timeout_secs: default_stage_timeout_secs(),
            stage_timeouts: default_stage_timeouts(),
            projects_dir: default_projects_dir(),
            deploy_target: default_deploy_target(),
            services: default_services(),
            observer_buffer: default_observer_buffer(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CraftflowConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from `CRAFTFLOW_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from a variable lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("CRAFTFLOW_STAGE_TIMEOUT_SECS") {
            config.default_stage_timeout_secs = parse_number("CRAFTFLOW_STAGE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("CRAFTFLOW_BUILD_TIMEOUT_SECS") {
            let secs = parse_number("CRAFTFLOW_BUILD_TIMEOUT_SECS", &value)?;
            config.stage_timeouts.insert(StageName::Builder, secs);
        }
        if let Some(value) = lookup("CRAFTFLOW_DEPLOY_TIMEOUT_SECS") {
            let secs = parse_number("CRAFTFLOW_DEPLOY_TIMEOUT_SECS", &value)?;
            config.stage_timeouts.insert(StageName::Deployer, secs);
        }
        if let Some(value) = lookup("CRAFTFLOW_PROJECTS_DIR") {
            config.projects_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("CRAFTFLOW_DEPLOY_TARGET") {
            config.deploy_target = value;
        }
        if let Some(value) = lookup("CRAFTFLOW_OBSERVER_BUFFER") {
            config.observer_buffer = parse_number("CRAFTFLOW_OBSERVER_BUFFER", &value)?;
        }
        if let Some(value) = lookup("CRAFTFLOW_LOG_LEVEL") {
            config.logging.level = value;
        }
        if let Some(value) = lookup("CRAFTFLOW_LOG_FORMAT") {
            config.logging.format = value.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Sets the default stage timeout.
    #[must_use]
    pub fn with_default_stage_timeout(mut self, timeout: Duration) -> Self {
        self.default_stage_timeout_secs = timeout.as_secs();
        self
    }

    /// Overrides the timeout of one stage.
    #[must_use]
    pub fn with_stage_timeout(mut self, stage: StageName, timeout: Duration) -> Self {
        self.stage_timeouts.insert(stage, timeout.as_secs());
        self
    }

    /// Sets the projects directory.
    #[must_use]
    pub fn with_projects_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.projects_dir = dir.into();
        self
    }

    /// Sets the deploy target.
    #[must_use]
    pub fn with_deploy_target(mut self, target: impl Into<String>) -> Self {
        self.deploy_target = target.into();
        self
    }

    /// Sets the per-observer queue bound.
    #[must_use]
    pub fn with_observer_buffer(mut self, buffer: usize) -> Self {
        self.observer_buffer = buffer;
        self
    }

    /// Sets the logging configuration.
    #[must_use]
    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Returns the time bound for a stage.
    #[must_use]
    pub fn stage_timeout(&self, stage: StageName) -> Duration {
        let secs = self
            .stage_timeouts
            .get(&stage)
            .copied()
            .unwrap_or(self.default_stage_timeout_secs);
        Duration::from_secs(secs)
    }

    /// Returns the working directory of a run's generated project.
    #[must_use]
    pub fn project_path(&self, run_id: uuid::Uuid) -> PathBuf {
        self.projects_dir.join(run_id.to_string())
    }

    /// Checks the configuration for values that can never work.
    pub fn validate(&self) -> Result<()> {
        if self.default_stage_timeout_secs == 0 {
            return Err(CraftflowError::Config(
                "default_stage_timeout_secs must be positive".into(),
            ));
        }
        if let Some((stage, _)) = self.stage_timeouts.iter().find(|(_, secs)| **secs == 0) {
            return Err(CraftflowError::Config(format!("timeout for {stage} must be positive")));
        }
        if self.observer_buffer == 0 {
            return Err(CraftflowError::Config("observer_buffer must be positive".into()));
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CraftflowError::Config(format!("{key} is not a valid number: {value}")))
}
