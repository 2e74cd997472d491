//! Run configuration.
//!
//! Loaded once from a JSON file, then overridden from the environment, then
//! validated. The result is passed explicitly into the pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::budget::BudgetConfig;
use crate::checkpoint::CheckpointConfig;
use crate::gateway::stateful::{DEFAULT_BASE_URL, DEFAULT_TIMEOUT};
use crate::retry::RetryPolicy;
use crate::stages::ReadinessPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {name}: {value}")]
    Env { name: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// One backend resource and its own concurrency ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ResourceEntry")]
pub struct ResourceConfig {
    pub name: String,
    pub max_concurrent: usize,
}

impl ResourceConfig {
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            name: name.into(),
            max_concurrent,
        }
    }
}

/// Either a bare name or a full entry.
#[derive(Deserialize)]
#[serde(untagged)]
enum ResourceEntry {
    Name(String),
    Full {
        name: String,
        #[serde(default = "default_resource_concurrency")]
        max_concurrent: usize,
    },
}

fn default_resource_concurrency() -> usize {
    1
}

impl From<ResourceEntry> for ResourceConfig {
    fn from(entry: ResourceEntry) -> Self {
        match entry {
            ResourceEntry::Name(name) => Self::new(name, default_resource_concurrency()),
            ResourceEntry::Full {
                name,
                max_concurrent,
            } => Self::new(name, max_concurrent),
        }
    }
}

/// Backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Bearer token; usually supplied through the environment.
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Ask for server-sent events instead of a single JSON body.
    pub stream: bool,
    pub temperature: f32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_token: None,
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            stream: false,
            temperature: 0.2,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub resources: Vec<ResourceConfig>,
    /// Ceiling on simultaneously in-flight items across all resources.
    pub global_concurrency: usize,
    pub api: ApiConfig,
    pub budget: BudgetConfig,
    pub retry: RetryPolicy,
    pub checkpoint: CheckpointConfig,
    pub readiness: ReadinessPolicy,
    /// Prefixed to every fresh-context input.
    pub system_message: Option<String>,
    /// File touched after every successful response.
    pub heartbeat_path: Option<PathBuf>,
    /// Items planned by a dry run; `None` plans every ready item.
    pub dry_run_limit: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            resources: Vec::new(),
            global_concurrency: 4,
            api: ApiConfig::default(),
            budget: BudgetConfig::default(),
            retry: RetryPolicy::default(),
            checkpoint: CheckpointConfig::default(),
            readiness: ReadinessPolicy::default(),
            system_message: None,
            heartbeat_path: None,
            dry_run_limit: None,
        }
    }
}

impl PipelineConfig {
    /// Read `path`, apply environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("STAGES_BASE_URL") {
            self.api.base_url = url;
        }
        if let Some(token) = get("STAGES_API_TOKEN")
            .or_else(|| get("LMSTUDIO_API_TOKEN"))
            .or_else(|| get("LM_API_TOKEN"))
        {
            self.api.api_token = Some(token);
        }
        if let Some(v) = get("STAGES_TIMEOUT_SECONDS") {
            self.api.timeout_secs = v.trim().parse().map_err(|_| ConfigError::Env {
                name: "STAGES_TIMEOUT_SECONDS",
                value: v.clone(),
            })?;
        }
        if let Some(v) = get("STAGES_STREAM") {
            self.api.stream = matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = get("STAGES_RESOURCES") {
            let per = self
                .resources
                .first()
                .map(|r| r.max_concurrent)
                .unwrap_or_else(default_resource_concurrency);
            self.resources = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|name| ResourceConfig::new(name, per))
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resources.is_empty() {
            return Err(ConfigError::Invalid("no resources configured".into()));
        }
        if let Some(r) = self.resources.iter().find(|r| r.name.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "resource with empty name (max_concurrent {})",
                r.max_concurrent
            )));
        }
        if self.global_concurrency == 0 {
            return Err(ConfigError::Invalid("global_concurrency must be > 0".into()));
        }
        if self.resources.iter().any(|r| r.max_concurrent == 0) {
            return Err(ConfigError::Invalid("max_concurrent must be > 0".into()));
        }
        if self.checkpoint.batch_size == 0 {
            return Err(ConfigError::Invalid("checkpoint.batch_size must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.budget.shrink_factor) || self.budget.shrink_factor == 0.0 {
            return Err(ConfigError::Invalid(
                "budget.shrink_factor must be in (0, 1)".into(),
            ));
        }
        Ok(())
    }

    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.resources.iter().map(|r| r.name.as_str())
    }
}

/// Serde adapter for durations written as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
