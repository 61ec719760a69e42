//! Infrastructure - configuration and metrics
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free metrics collection

pub mod config;
pub mod metrics;

pub use config::{Config, SpeechEngineKind};
pub use metrics::Metrics;
