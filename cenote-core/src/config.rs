// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Configuration for Cenote aggregation
//!
//! Loaded from TOML with environment overrides:
//!
//! ```toml
//! [stats]
//! outlier_sensitivity = 4.47
//!
//! [retry]
//! max_attempts = 100
//! initial_delay_ms = 1
//!
//! [codec]
//! format = "json"
//!
//! [policy.table]
//! outlier_filter = true
//! histogram = { granularities = ["month", "day", "day_hour"], extrema = "day" }
//!
//! [policy.overrides.shop_orders]
//! outlier_filter = false
//!
//! [ingest]
//! entity_attribute = "user$id"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CoreError, Result};
use crate::histogram::{Granularity, HistogramAccumulator};
use crate::key::AggregateKey;
use crate::retry::RetryPolicy;
use crate::stats::{WelfordTierAccumulator, DEFAULT_OUTLIER_SENSITIVITY};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CenoteConfig {
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsConfig {
    /// `k` in `mean ± k·stddev`. Larger values admit more samples into tier 2.
    #[serde(default = "default_outlier_sensitivity")]
    pub outlier_sensitivity: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            outlier_sensitivity: default_outlier_sensitivity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

/// Stored snapshot encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecFormat {
    #[default]
    Json,
    Bincode,
}

impl std::str::FromStr for CodecFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(CodecFormat::Json),
            "bincode" => Ok(CodecFormat::Bincode),
            other => Err(CoreError::InvalidConfig(format!("unknown codec format {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodecConfig {
    #[serde(default)]
    pub format: CodecFormat,
}

/// Which buckets a histogram maintains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramPolicy {
    #[serde(default = "default_granularities")]
    pub granularities: Vec<Granularity>,
    /// The one granularity that also tracks min/max.
    #[serde(default = "default_extrema")]
    pub extrema: Option<Granularity>,
}

impl Default for HistogramPolicy {
    fn default() -> Self {
        Self {
            granularities: default_granularities(),
            extrema: default_extrema(),
        }
    }
}

impl HistogramPolicy {
    /// An empty granularity list disables the histogram, since TOML cannot
    /// express `histogram = None`.
    pub fn is_enabled(&self) -> bool {
        !self.granularities.is_empty()
    }

    pub fn accumulator(&self) -> HistogramAccumulator {
        HistogramAccumulator::new(self.granularities.clone(), self.extrema)
    }
}

/// Aggregation variant for one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationPolicy {
    /// When false, tier 2 admits every sample.
    #[serde(default = "default_true")]
    pub outlier_filter: bool,
    /// `None` disables historical tracking for the scope.
    #[serde(default = "default_histogram")]
    pub histogram: Option<HistogramPolicy>,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self {
            outlier_filter: true,
            histogram: default_histogram(),
        }
    }
}

impl AggregationPolicy {
    pub fn welford(&self, stats: &StatsConfig) -> WelfordTierAccumulator {
        WelfordTierAccumulator::new(stats.outlier_sensitivity)
            .with_outlier_filter(self.outlier_filter)
    }

    /// `None` when historical tracking is off for this scope.
    pub fn histogram_accumulator(&self) -> Option<HistogramAccumulator> {
        self.histogram
            .as_ref()
            .filter(|h| h.is_enabled())
            .map(HistogramPolicy::accumulator)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Table-scoped keys.
    #[serde(default)]
    pub table: AggregationPolicy,
    /// Entity-scoped keys.
    #[serde(default)]
    pub entity: AggregationPolicy,
    /// Per-table replacements for `table`.
    #[serde(default)]
    pub overrides: BTreeMap<String, AggregationPolicy>,
}

impl PolicyConfig {
    pub fn policy_for(&self, key: &AggregateKey) -> &AggregationPolicy {
        if key.is_entity_scoped() {
            return &self.entity;
        }
        self.overrides.get(&key.table).unwrap_or(&self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Joins nested payload keys into a flat column name.
    #[serde(default = "default_nested_separator")]
    pub nested_separator: String,
    /// Flattened columns never aggregated.
    #[serde(default = "default_excluded_columns")]
    pub excluded_columns: Vec<String>,
    /// Flattened column identifying the entity for per-entity aggregates.
    #[serde(default)]
    pub entity_attribute: Option<String>,
    /// Events processed concurrently in a batch.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            nested_separator: default_nested_separator(),
            excluded_columns: default_excluded_columns(),
            entity_attribute: None,
            concurrency: default_concurrency(),
        }
    }
}

// Default values
fn default_outlier_sensitivity() -> f64 {
    DEFAULT_OUTLIER_SENSITIVITY
}

fn default_max_attempts() -> u32 {
    100
}

fn default_initial_delay_ms() -> u64 {
    1
}

fn default_max_delay_ms() -> u64 {
    50
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.5
}

fn default_granularities() -> Vec<Granularity> {
    Granularity::ALL.to_vec()
}

fn default_extrema() -> Option<Granularity> {
    Some(Granularity::Day)
}

fn default_histogram() -> Option<HistogramPolicy> {
    Some(HistogramPolicy::default())
}

fn default_true() -> bool {
    true
}

fn default_nested_separator() -> String {
    "$".to_string()
}

fn default_excluded_columns() -> Vec<String> {
    vec!["uuid".to_string()]
}

fn default_concurrency() -> usize {
    16
}

impl CenoteConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.as_ref().display())))?;
        toml::from_str(&content).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().merge_env()
    }

    /// Apply environment overrides on top of `self`.
    ///
    /// Supported environment variables:
    /// - CENOTE_OUTLIER_SENSITIVITY: `k` for outlier bounds
    /// - CENOTE_RETRY_MAX_ATTEMPTS: compare-and-set attempts per update
    /// - CENOTE_RETRY_INITIAL_DELAY_MS / CENOTE_RETRY_MAX_DELAY_MS: backoff range
    /// - CENOTE_CODEC: `json` or `bincode`
    /// - CENOTE_ENTITY_ATTRIBUTE: flattened column for per-entity aggregates
    /// - CENOTE_INGEST_CONCURRENCY: events processed concurrently
    pub fn merge_env(mut self) -> Self {
        if let Some(k) = env_parse("CENOTE_OUTLIER_SENSITIVITY") {
            self.stats.outlier_sensitivity = k;
        }
        if let Some(attempts) = env_parse("CENOTE_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = attempts;
        }
        if let Some(ms) = env_parse("CENOTE_RETRY_INITIAL_DELAY_MS") {
            self.retry.initial_delay_ms = ms;
        }
        if let Some(ms) = env_parse("CENOTE_RETRY_MAX_DELAY_MS") {
            self.retry.max_delay_ms = ms;
        }
        if let Some(format) = env_parse("CENOTE_CODEC") {
            self.codec.format = format;
        }
        if let Ok(attr) = std::env::var("CENOTE_ENTITY_ATTRIBUTE") {
            self.ingest.entity_attribute = Some(attr).filter(|a| !a.is_empty());
        }
        if let Some(n) = env_parse("CENOTE_INGEST_CONCURRENCY") {
            self.ingest.concurrency = n;
        }
        self
    }

    /// Load configuration with priority: env > file > defaults
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let config = match config_file {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?
            }
            Some(path) => {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };

        let config = config.merge_env();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let k = self.stats.outlier_sensitivity;
        if !k.is_finite() || k < 0.0 {
            return Err(CoreError::InvalidConfig(format!(
                "outlier_sensitivity must be finite and non-negative, got {k}"
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(CoreError::InvalidConfig("retry.max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(CoreError::InvalidConfig("retry.jitter must be within 0.0..=1.0".into()));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(CoreError::InvalidConfig("retry.multiplier must be >= 1.0".into()));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(CoreError::InvalidConfig(
                "retry.max_delay_ms must not be below retry.initial_delay_ms".into(),
            ));
        }

        let scopes = [("table", &self.policy.table), ("entity", &self.policy.entity)]
            .into_iter()
            .chain(self.policy.overrides.iter().map(|(t, p)| (t.as_str(), p)));
        for (scope, policy) in scopes {
            let Some(histogram) = policy.histogram.as_ref().filter(|h| h.is_enabled()) else {
                continue;
            };
            if let Some(extrema) = histogram.extrema {
                if !histogram.granularities.contains(&extrema) {
                    return Err(CoreError::InvalidConfig(format!(
                        "policy {scope}: extrema granularity {extrema:?} is not maintained"
                    )));
                }
            }
        }

        if self.ingest.nested_separator.is_empty() {
            return Err(CoreError::InvalidConfig(
                "ingest.nested_separator must not be empty".into(),
            ));
        }
        if self.ingest.concurrency == 0 {
            return Err(CoreError::InvalidConfig("ingest.concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparseable {}={:?}", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = CenoteConfig::default();
        assert_eq!(config.stats.outlier_sensitivity, DEFAULT_OUTLIER_SENSITIVITY);
        assert_eq!(config.retry.max_attempts, 100);
        assert_eq!(config.codec.format, CodecFormat::Json);
        assert!(config.policy.table.outlier_filter);
        assert_eq!(
            config.policy.table.histogram.as_ref().unwrap().extrema,
            Some(Granularity::Day)
        );
        assert_eq!(config.ingest.nested_separator, "$");
        assert_eq!(config.ingest.excluded_columns, vec!["uuid".to_string()]);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [stats]
            outlier_sensitivity = 3.0

            [retry]
            max_attempts = 7

            [codec]
            format = "bincode"

            [policy.table]
            outlier_filter = true
            histogram = { granularities = ["day", "day_hour"] }

            [policy.overrides.shop_orders]
            outlier_filter = false
            histogram = { granularities = ["month"], extrema = "month" }

            [ingest]
            entity_attribute = "user$id"
        "#;
        let config: CenoteConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.stats.outlier_sensitivity, 3.0);
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.max_delay_ms, 50);
        assert_eq!(config.codec.format, CodecFormat::Bincode);
        assert_eq!(config.ingest.entity_attribute.as_deref(), Some("user$id"));

        let plain = AggregateKey::new("clicks", "price").unwrap();
        let orders = AggregateKey::new("shop_orders", "price").unwrap();
        let entity = AggregateKey::for_entity("shop_orders", "u1", "price").unwrap();

        let table = config.policy.policy_for(&plain);
        assert_eq!(
            table.histogram.as_ref().unwrap().granularities,
            vec![Granularity::Day, Granularity::DayHour]
        );
        assert!(!config.policy.policy_for(&orders).outlier_filter);
        assert_eq!(config.policy.policy_for(&entity), &config.policy.entity);
    }

    #[test]
    fn test_disable_histogram_from_toml() {
        let config: CenoteConfig = toml::from_str(
            r#"
            [policy.table.histogram]
            granularities = []
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert!(config.policy.table.histogram_accumulator().is_none());
        assert!(config.policy.entity.histogram_accumulator().is_some());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = CenoteConfig::default();
        config.stats.outlier_sensitivity = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = CenoteConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = CenoteConfig::default();
        config.policy.entity.histogram = Some(HistogramPolicy {
            granularities: vec![Granularity::Month],
            extrema: Some(Granularity::Day),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[retry]\nmax_attempts = 3").unwrap();

        let config = CenoteConfig::from_file(file.path()).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.policy().max_attempts, 3);
        assert!(CenoteConfig::from_file("/nonexistent/cenote.toml").is_err());
    }

    #[test]
    fn test_codec_format_from_str() {
        assert_eq!("JSON".parse::<CodecFormat>().unwrap(), CodecFormat::Json);
        assert_eq!("bincode".parse::<CodecFormat>().unwrap(), CodecFormat::Bincode);
        assert!("yaml".parse::<CodecFormat>().is_err());
    }
}
