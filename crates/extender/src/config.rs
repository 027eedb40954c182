//! Extender configuration

use serde::Deserialize;
use std::time::Duration;
use telemetry_lib::scorer::{ScoreWeights, ScorerConfig, ScoringModel};
use telemetry_lib::ScoringSeries;
use thiserror::Error;
use tracing::warn;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "NETSCHED_CONFIG";

const WEIGHT_SUM_TOLERANCE: f64 = 0.001;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("weight for {series} must be non-negative, got {value}")]
    NegativeWeight { series: &'static str, value: f64 },

    #[error("refresh timeout ({refresh_secs}s) must be shorter than the call budget ({budget_secs}s)")]
    RefreshExceedsBudget { refresh_secs: u64, budget_secs: u64 },

    #[error("cache TTL must be positive")]
    ZeroTtl,
}

/// Extender configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExtenderConfig {
    /// Base URL of the Prometheus-compatible metrics store
    #[serde(default = "default_metrics_store_url")]
    pub metrics_store_url: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Upper bound on one cache refresh
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,

    /// Response budget the orchestrator allows per extender call
    #[serde(default = "default_call_budget")]
    pub call_budget_secs: u64,

    #[serde(default = "default_debug")]
    pub debug: bool,

    #[serde(default)]
    pub weights: ScoreWeights,

    /// Reject nodes scoring below this in `filter`
    #[serde(default)]
    pub min_score: Option<f64>,
}

// Unprefixed variables as set by existing deployment manifests

fn default_metrics_store_url() -> String {
    std::env::var("PROMETHEUS_URL")
        .unwrap_or_else(|_| "http://prometheus.monitoring:9090".to_string())
}

fn default_port() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_cache_ttl() -> u64 {
    std::env::var("CACHE_TTL")
        .ok()
        .and_then(|t| t.parse().ok())
        .unwrap_or(10)
}

fn default_debug() -> bool {
    std::env::var("DEBUG")
        .ok()
        .and_then(|v| parse_legacy_bool(&v))
        .unwrap_or(false)
}

/// Boolean spellings accepted by the legacy `DEBUG` switch
fn parse_legacy_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn default_refresh_timeout() -> u64 {
    5
}

fn default_call_budget() -> u64 {
    10
}

impl ExtenderConfig {
    /// Load configuration from the optional config file and `EXTENDER_*`
    /// environment variables, then validate it
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path));
        }

        let config: ExtenderConfig = builder
            .add_source(
                config::Environment::with_prefix("EXTENDER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject unusable values; a weight sum other than 1 only warns
    pub fn validate(&self) -> Result<(), ConfigError> {
        for series in ScoringSeries::ALL {
            let value = self.weights.weight(series);
            if value < 0.0 || value.is_nan() {
                return Err(ConfigError::NegativeWeight {
                    series: series.metric_name(),
                    value,
                });
            }
        }

        let sum = self.weights.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            warn!(sum = sum, "Scoring weights do not sum to 1.0");
        }

        if self.cache_ttl_secs == 0 {
            return Err(ConfigError::ZeroTtl);
        }
        if self.refresh_timeout_secs >= self.call_budget_secs {
            return Err(ConfigError::RefreshExceedsBudget {
                refresh_secs: self.refresh_timeout_secs,
                budget_secs: self.call_budget_secs,
            });
        }

        Ok(())
    }

    pub fn scorer_config(&self) -> ScorerConfig {
        ScorerConfig {
            ttl: Duration::from_secs(self.cache_ttl_secs),
            refresh_timeout: Duration::from_secs(self.refresh_timeout_secs),
            model: ScoringModel::new(self.weights),
        }
    }

    pub fn log_filter(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}
