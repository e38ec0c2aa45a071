// Configuration structs

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Oracle (Gemini) connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Override the API base URL (proxies, tests)
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            base_url: None,
        }
    }
}

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}

/// Upper bound on envelope retries accepted from config
pub const MAX_RETRIES: u32 = 10;

/// Retry/timeout policy applied to every oracle call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_retries() -> u32 {
    2
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_timeout_secs() -> u64 {
    120
}

/// Build pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Attempts per code step before the build fails
    #[serde(default = "default_max_code_attempts")]
    pub max_code_attempts: u32,
    /// Prior messages shown to the router and plan compiler
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Backend-need answer used when the classification is unreadable.
    /// Tunable default, not an invariant.
    #[serde(default = "default_true")]
    pub assume_backend_when_ambiguous: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_code_attempts: default_max_code_attempts(),
            history_window: default_history_window(),
            assume_backend_when_ambiguous: true,
        }
    }
}

fn default_max_code_attempts() -> u32 {
    3
}

fn default_history_window() -> usize {
    5
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    data_root().join("projects.db")
}

/// Local backend provisioning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    #[serde(default = "default_backend_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_poll_ms")]
    pub provision_poll_ms: u64,
    #[serde(default = "default_provision_timeout_secs")]
    pub provision_timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            data_dir: default_backend_dir(),
            provision_poll_ms: default_poll_ms(),
            provision_timeout_secs: default_provision_timeout_secs(),
        }
    }
}

fn default_backend_dir() -> PathBuf {
    data_root().join("backends")
}

fn default_poll_ms() -> u64 {
    500
}

fn default_provision_timeout_secs() -> u64 {
    60
}

fn data_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".appweaver")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub envelope: EnvelopeConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub backend: BackendSettings,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.oracle.model.trim().is_empty() {
            bail!("oracle.model must not be empty");
        }
        if self.envelope.retries > MAX_RETRIES {
            bail!("envelope.retries must be at most {MAX_RETRIES}");
        }
        if self.envelope.timeout_secs == 0 {
            bail!("envelope.timeout_secs must be greater than zero");
        }
        if self.build.max_code_attempts == 0 {
            bail!("build.max_code_attempts must be at least 1");
        }
        Ok(())
    }
}
