//! Engine configuration, loaded from TOML with serde defaults.
//!
//! Every section can be omitted; defaults mirror the reference deployment
//! (30-minute sessions, 6-digit codes valid 5 minutes, 16 kHz in / 24 kHz
//! out mono PCM).

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub step_up: StepUpConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {0}: {1}")]
    Io(String, String),
    #[error("Failed to parse config: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: i64,
    #[serde(default = "default_warn_window_minutes")]
    pub warn_window_minutes: i64,
    /// Whether `create_session` falls back to an anonymous placeholder when
    /// the identity hint resolves to no subject (vertical-dependent).
    #[serde(default)]
    pub allow_anonymous: bool,
}

fn default_timeout_minutes() -> i64 {
    30
}
fn default_warn_window_minutes() -> i64 {
    5
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_timeout_minutes(),
            warn_window_minutes: default_warn_window_minutes(),
            allow_anonymous: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepUpConfig {
    #[serde(default = "default_code_length")]
    pub code_length: u8,
    #[serde(default = "default_code_expiry_minutes")]
    pub code_expiry_minutes: i64,
}

fn default_code_length() -> u8 {
    6
}
fn default_code_expiry_minutes() -> i64 {
    5
}

impl Default for StepUpConfig {
    fn default() -> Self {
        Self {
            code_length: default_code_length(),
            code_expiry_minutes: default_code_expiry_minutes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_input_rate")]
    pub input_sample_rate: u32,
    #[serde(default = "default_output_rate")]
    pub output_sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_input_rate() -> u32 {
    16000
}
fn default_output_rate() -> u32 {
    24000
}
fn default_channels() -> u16 {
    1
}
fn default_chunk_size() -> usize {
    1024
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: default_input_rate(),
            output_sample_rate: default_output_rate(),
            channels: default_channels(),
            chunk_size: default_chunk_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Path to the vertical's system prompt text, if any.
    #[serde(default)]
    pub system_prompt_path: String,
}

fn default_model_id() -> String {
    "speech-duplex-v1".into()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
            system_prompt_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_dir")]
    pub log_dir: String,
}

fn default_audit_dir() -> String {
    "data/audit".into()
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_dir: default_audit_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// "memory" or "surreal".
    #[serde(default = "default_store_mode")]
    pub mode: String,
}

fn default_store_mode() -> String {
    "memory".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: default_store_mode(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let config = AppConfig::default();
        assert_eq!(config.session.timeout_minutes, 30);
        assert_eq!(config.step_up.code_length, 6);
        assert_eq!(config.step_up.code_expiry_minutes, 5);
        assert_eq!(config.audio.input_sample_rate, 16000);
        assert_eq!(config.audio.output_sample_rate, 24000);
        assert_eq!(config.audio.channels, 1);
        assert_eq!(config.audio.chunk_size, 1024);
        assert!(!config.session.allow_anonymous);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [session]
            timeout_minutes = 10

            [store]
            mode = "surreal"
            "#,
        )
        .unwrap();
        assert_eq!(config.session.timeout_minutes, 10);
        assert_eq!(config.session.warn_window_minutes, 5);
        assert_eq!(config.store.mode, "surreal");
        assert_eq!(config.audio.chunk_size, 1024);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load(Path::new("/nonexistent/cadenza.toml")).unwrap();
        assert_eq!(config.session.timeout_minutes, 30);
    }

    #[test]
    fn empty_toml_is_valid() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.model.model_id, "speech-duplex-v1");
    }
}
