//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechEngineKind {
    /// Log utterances instead of speaking them
    Log,
    /// Run an external synthesizer per utterance
    Command,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_backend_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoConfig {
    #[serde(default = "default_true")]
    pub high_accuracy: bool,
    #[serde(default = "default_geo_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_fix_age_ms")]
    pub max_fix_age_ms: u64,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout_ms: default_geo_timeout_ms(),
            max_fix_age_ms: default_max_fix_age_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_geo_timeout_ms() -> u64 {
    5000
}

fn default_max_fix_age_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressConfigToml {
    /// Distance to a step's end point that counts as arrival
    #[serde(default = "default_arrival_threshold_m")]
    pub arrival_threshold_m: f64,
    /// Fixes less accurate than this never trigger advancement
    #[serde(default = "default_max_accuracy_m")]
    pub max_accuracy_m: f64,
}

impl Default for ProgressConfigToml {
    fn default() -> Self {
        Self {
            arrival_threshold_m: default_arrival_threshold_m(),
            max_accuracy_m: default_max_accuracy_m(),
        }
    }
}

fn default_arrival_threshold_m() -> f64 {
    30.0
}

fn default_max_accuracy_m() -> f64 {
    100.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct NarrationConfigToml {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_rate")]
    pub rate: f32,
    #[serde(default = "default_pitch")]
    pub pitch: f32,
    /// Language code to speech locale overrides (e.g., "pt" = "pt-BR")
    #[serde(default)]
    pub locales: HashMap<String, String>,
}

impl Default for NarrationConfigToml {
    fn default() -> Self {
        Self {
            language: default_language(),
            rate: default_rate(),
            pitch: default_pitch(),
            locales: HashMap::new(),
        }
    }
}

fn default_language() -> String {
    "en".to_string()
}

fn default_rate() -> f32 {
    0.9
}

fn default_pitch() -> f32 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpeechConfig {
    #[serde(default = "default_speech_engine")]
    pub engine: SpeechEngineKind,
    /// Program for the command engine
    #[serde(default = "default_speech_command")]
    pub command: String,
    /// Arguments; `{text}`, `{locale}`, `{rate}` and `{pitch}` are substituted
    #[serde(default = "default_speech_args")]
    pub args: Vec<String>,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            engine: default_speech_engine(),
            command: default_speech_command(),
            args: default_speech_args(),
        }
    }
}

fn default_speech_engine() -> SpeechEngineKind {
    SpeechEngineKind::Log
}

fn default_speech_command() -> String {
    "espeak-ng".to_string()
}

fn default_speech_args() -> Vec<String> {
    vec!["-v".to_string(), "{locale}".to_string(), "{text}".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Delay before the first content fetch after a session is created
    #[serde(default = "default_initial_fetch_grace_ms")]
    pub initial_fetch_grace_ms: u64,
    #[serde(default = "default_user_prefix")]
    pub user_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_fetch_grace_ms: default_initial_fetch_grace_ms(),
            user_prefix: default_user_prefix(),
        }
    }
}

fn default_initial_fetch_grace_ms() -> u64 {
    1000
}

fn default_user_prefix() -> String {
    "user".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub geo: GeoConfig,
    #[serde(default)]
    pub progress: ProgressConfigToml,
    #[serde(default)]
    pub narration: NarrationConfigToml,
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    backend_url: String,
    backend_timeout_ms: u64,
    geo_high_accuracy: bool,
    geo_timeout_ms: u64,
    max_fix_age_ms: u64,
    arrival_threshold_m: f64,
    max_accuracy_m: f64,
    language: String,
    speech_rate: f32,
    speech_pitch: f32,
    locale_overrides: HashMap<String, String>,
    speech_engine: SpeechEngineKind,
    speech_command: String,
    speech_args: Vec<String>,
    initial_fetch_grace_ms: u64,
    user_prefix: String,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8001".to_string(),
            backend_timeout_ms: default_backend_timeout_ms(),
            geo_high_accuracy: true,
            geo_timeout_ms: default_geo_timeout_ms(),
            max_fix_age_ms: default_max_fix_age_ms(),
            arrival_threshold_m: default_arrival_threshold_m(),
            max_accuracy_m: default_max_accuracy_m(),
            language: default_language(),
            speech_rate: default_rate(),
            speech_pitch: default_pitch(),
            locale_overrides: HashMap::new(),
            speech_engine: SpeechEngineKind::Log,
            speech_command: default_speech_command(),
            speech_args: default_speech_args(),
            initial_fetch_grace_ms: default_initial_fetch_grace_ms(),
            user_prefix: default_user_prefix(),
            metrics_interval_secs: default_metrics_interval_secs(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self {
            backend_url: toml_config.backend.base_url,
            backend_timeout_ms: toml_config.backend.timeout_ms,
            geo_high_accuracy: toml_config.geo.high_accuracy,
            geo_timeout_ms: toml_config.geo.timeout_ms,
            max_fix_age_ms: toml_config.geo.max_fix_age_ms,
            arrival_threshold_m: toml_config.progress.arrival_threshold_m,
            max_accuracy_m: toml_config.progress.max_accuracy_m,
            language: toml_config.narration.language,
            speech_rate: toml_config.narration.rate,
            speech_pitch: toml_config.narration.pitch,
            locale_overrides: toml_config.narration.locales,
            speech_engine: toml_config.speech.engine,
            speech_command: toml_config.speech.command,
            speech_args: toml_config.speech.args,
            initial_fetch_grace_ms: toml_config.session.initial_fetch_grace_ms,
            user_prefix: toml_config.session.user_prefix,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration from an explicit path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    pub fn backend_timeout_ms(&self) -> u64 {
        self.backend_timeout_ms
    }

    pub fn geo_high_accuracy(&self) -> bool {
        self.geo_high_accuracy
    }

    pub fn geo_timeout_ms(&self) -> u64 {
        self.geo_timeout_ms
    }

    pub fn max_fix_age_ms(&self) -> u64 {
        self.max_fix_age_ms
    }

    pub fn arrival_threshold_m(&self) -> f64 {
        self.arrival_threshold_m
    }

    pub fn max_accuracy_m(&self) -> f64 {
        self.max_accuracy_m
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn speech_rate(&self) -> f32 {
        self.speech_rate
    }

    pub fn speech_pitch(&self) -> f32 {
        self.speech_pitch
    }

    pub fn locale_overrides(&self) -> &HashMap<String, String> {
        &self.locale_overrides
    }

    pub fn speech_engine(&self) -> &SpeechEngineKind {
        &self.speech_engine
    }

    pub fn speech_command(&self) -> &str {
        &self.speech_command
    }

    pub fn speech_args(&self) -> &[String] {
        &self.speech_args
    }

    pub fn initial_fetch_grace_ms(&self) -> u64 {
        self.initial_fetch_grace_ms
    }

    pub fn user_prefix(&self) -> &str {
        &self.user_prefix
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Override the narration language (CLI `--language`)
    pub fn with_language(mut self, language: &str) -> Self {
        self.language = language.to_string();
        self
    }

    /// Override the backend URL (CLI `--backend`)
    pub fn with_backend_url(mut self, url: &str) -> Self {
        self.backend_url = url.to_string();
        self
    }

    /// Builder method for tests to set the grace period
    #[cfg(test)]
    pub fn with_initial_fetch_grace_ms(mut self, ms: u64) -> Self {
        self.initial_fetch_grace_ms = ms;
        self
    }

    /// Builder method for tests to set (or disable, with 0) the fix timeout
    #[cfg(test)]
    pub fn with_geo_timeout_ms(mut self, ms: u64) -> Self {
        self.geo_timeout_ms = ms;
        self
    }

    /// Builder method for tests to set the accuracy ceiling
    #[cfg(test)]
    pub fn with_max_accuracy_m(mut self, meters: f64) -> Self {
        self.max_accuracy_m = meters;
        self
    }
}
