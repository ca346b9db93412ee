use crate::chat::ChatSettings;
use crate::chunker::ProducerOptions;
use crate::extract::SessionStrategy;
use crate::prompt::OutputSchema;
use crate::rules::RuleMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("invalid config {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorKind {
    #[default]
    Rules,
    Chat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub kind: ExtractorKind,
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            kind: ExtractorKind::Rules,
            endpoint: "http://localhost:8000/v1".to_string(),
            model: "granite-3-3-8b-instruct".to_string(),
            api_key_env: "INCIDENTSCOPE_API_KEY".to_string(),
            timeout_secs: 120,
            temperature: 0.0,
            max_tokens: 2000,
        }
    }
}

impl ExtractorConfig {
    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            api_key: std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty()),
            timeout: Duration::from_secs(self.timeout_secs),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub input_filename: PathBuf,
    pub lines_per_chunk: usize,
    /// Seconds to wait after each full chunk.
    pub delay_between_chunks: f64,
    pub skip_header: bool,
    /// Seconds a single queue poll waits before trying again.
    pub poll_timeout: f64,
    pub queue_capacity: Option<usize>,
    pub session: SessionStrategy,
    pub session_id: Option<String>,
    pub output_schema: OutputSchema,
    pub rules: RuleMode,
    pub extractor: ExtractorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_filename: PathBuf::from("sys_log.txt"),
            lines_per_chunk: 5,
            delay_between_chunks: 1.0,
            skip_header: false,
            poll_timeout: 1.0,
            queue_capacity: None,
            session: SessionStrategy::PerChunk,
            session_id: None,
            output_schema: OutputSchema::PerLine,
            rules: RuleMode::Off,
            extractor: ExtractorConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lines_per_chunk == 0 {
            return Err(ConfigError::Invalid("lines_per_chunk must be a positive integer".into()));
        }
        if !self.delay_between_chunks.is_finite() || self.delay_between_chunks < 0.0 {
            return Err(ConfigError::Invalid("delay_between_chunks must be a non-negative number of seconds".into()));
        }
        if !self.poll_timeout.is_finite() || self.poll_timeout <= 0.0 {
            return Err(ConfigError::Invalid("poll_timeout must be a positive number of seconds".into()));
        }
        if self.queue_capacity == Some(0) {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1 when set".into()));
        }
        if matches!(self.session_id.as_deref(), Some(s) if s.trim().is_empty()) {
            return Err(ConfigError::Invalid("session_id must not be blank".into()));
        }
        Ok(())
    }

    pub fn producer_options(&self) -> ProducerOptions {
        ProducerOptions {
            lines_per_chunk: self.lines_per_chunk,
            delay: Duration::from_secs_f64(self.delay_between_chunks.max(0.0)),
            skip_header: self.skip_header,
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.poll_timeout.max(0.001))
    }
}
