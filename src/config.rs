//! Pipeline configuration, persisted as TOML.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. API keys may also come from the `SYNTH_DIALOGUE_API_KEYS`
//! environment variable as a comma-separated list.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::{EngineConfig, StageJob};
use crate::error::ConfigError;
use crate::pipeline::{MissingFieldPolicy, StageKind};
use crate::record::DEFAULT_ID_FIELD;
use crate::retry::RetryPolicy;
use crate::store::CollectionFormat;

/// Environment variable holding comma-separated API keys.
pub const API_KEYS_ENV: &str = "SYNTH_DIALOGUE_API_KEYS";

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Field carrying each record's identifier.
    pub id_field: String,
    pub gateway: GatewayConfig,
    pub engine: EngineSettings,
    pub stages: StageTable,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            id_field: DEFAULT_ID_FIELD.into(),
            gateway: GatewayConfig::default(),
            engine: EngineSettings::default(),
            stages: StageTable::default(),
        }
    }
}

/// Where and how to reach the inference service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    /// One backend is created per key; calls rotate across them.
    pub api_keys: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".into(),
            api_keys: Vec::new(),
            timeout_secs: 120,
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Worker, checkpoint and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub workers: usize,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff: f64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 25,
            max_attempts: 3,
            retry_delay_ms: 1000,
            retry_backoff: 1.0,
            retry_max_delay_ms: 30_000,
            retry_jitter_ms: 0,
        }
    }
}

impl EngineSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            delay: Duration::from_millis(self.retry_delay_ms),
            backoff: self.retry_backoff,
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter: Duration::from_millis(self.retry_jitter_ms),
        }
    }

    pub fn to_engine_config(&self, show_progress: bool) -> EngineConfig {
        EngineConfig {
            workers: self.workers,
            batch_size: self.batch_size,
            retry: self.retry_policy(),
            show_progress,
        }
    }
}

/// Per-stage settings. Unset fields fall back to the stage's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<CollectionFormat>,
    pub on_missing_fields: MissingFieldPolicy,
}

/// `[stages.*]` tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTable {
    pub extract: StageSettings,
    pub converse: StageSettings,
    pub reply: StageSettings,
    pub filter: StageSettings,
}

impl StageTable {
    pub fn get(&self, kind: StageKind) -> &StageSettings {
        match kind {
            StageKind::Extract => &self.extract,
            StageKind::Converse => &self.converse,
            StageKind::Reply => &self.reply,
            StageKind::Filter => &self.filter,
        }
    }

    pub fn get_mut(&mut self, kind: StageKind) -> &mut StageSettings {
        match kind {
            StageKind::Extract => &mut self.extract,
            StageKind::Converse => &mut self.converse,
            StageKind::Reply => &mut self.reply,
            StageKind::Filter => &mut self.filter,
        }
    }
}

/// Default output file of each stage. Each stage reads the previous one's output.
pub fn default_output(kind: StageKind) -> &'static str {
    match kind {
        StageKind::Extract => "themes.jsonl",
        StageKind::Converse => "conversations.json",
        StageKind::Reply => "dialogues.json",
        StageKind::Filter => "decisions.json",
    }
}

pub fn default_input(kind: StageKind) -> &'static str {
    match kind {
        StageKind::Extract => "posts.json",
        StageKind::Converse => default_output(StageKind::Extract),
        StageKind::Reply => default_output(StageKind::Converse),
        StageKind::Filter => default_output(StageKind::Reply),
    }
}

impl PipelineConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&content, &path.display().to_string())
    }

    pub fn parse(content: &str, origin: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Encode {
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Load `path` when given, otherwise start from defaults.
    pub fn load_or_default(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Append keys from a comma-separated list, skipping blanks and duplicates.
    pub fn merge_api_keys(&mut self, list: &str) {
        for key in list.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            if !self.gateway.api_keys.iter().any(|k| k == key) {
                self.gateway.api_keys.push(key.to_string());
            }
        }
    }

    /// Pick up keys from [`API_KEYS_ENV`], if set.
    pub fn merge_env(&mut self) {
        if let Ok(list) = std::env::var(API_KEYS_ENV) {
            self.merge_api_keys(&list);
        }
    }

    /// Reject settings no run could use.
    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |message: String| Err(ConfigError::Invalid { message });
        if self.id_field.trim().is_empty() {
            return invalid("`id_field` must not be empty".into());
        }
        if self.engine.workers == 0 {
            return invalid("`engine.workers` must be at least 1".into());
        }
        if self.engine.max_attempts == 0 {
            return invalid("`engine.max_attempts` must be at least 1".into());
        }
        if !self.engine.retry_backoff.is_finite() || self.engine.retry_backoff < 1.0 {
            return invalid("`engine.retry_backoff` must be a finite number >= 1.0".into());
        }
        if self.gateway.timeout_secs == 0 {
            return invalid("`gateway.timeout_secs` must be at least 1".into());
        }
        for kind in StageKind::ALL {
            let settings = self.stages.get(kind);
            if settings.temperature.is_some_and(|t| !(0.0..=2.0).contains(&t)) {
                return invalid(format!("`stages.{kind}.temperature` must be within 0.0..=2.0"));
            }
            if settings.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
                return invalid(format!("`stages.{kind}.model` must not be empty"));
            }
        }
        Ok(())
    }

    /// Resolve the job for `kind`, filling unset fields from the stage defaults.
    pub fn job(&self, kind: StageKind) -> StageJob {
        let settings = self.stages.get(kind);
        let input = settings
            .input
            .clone()
            .unwrap_or_else(|| PathBuf::from(default_input(kind)));
        let output = settings
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from(default_output(kind)));
        StageJob::new(kind, input, output)
            .with_format(settings.format.unwrap_or(kind.default_format()))
            .with_model(
                settings
                    .model
                    .clone()
                    .unwrap_or_else(|| kind.default_model().to_string()),
                settings.temperature.unwrap_or(kind.default_temperature()),
            )
            .with_id_field(self.id_field.clone())
            .with_missing_fields(settings.on_missing_fields)
    }
}
