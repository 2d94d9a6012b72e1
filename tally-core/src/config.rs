use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::Bucketing;

/// Hard cap the remote search API places on a single page.
pub const MAX_PAGE_SIZE: u32 = 100;
/// Upper bound for one inference batch.
pub const MAX_BATCH_SIZE: usize = 200;

/// Top-level Tally configuration, matching `.tally/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallyConfig {
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub github: GitHubSection,
    #[serde(default)]
    pub enrichment: EnrichmentSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub aggregation: AggregationSection,
    #[serde(default)]
    pub insights: InsightsSection,
}

impl TallyConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()).into());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        let config: Self = toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sync = &self.sync;
        if sync.quick_window_days == 0 {
            return Err(ConfigError::Invalid(
                "sync.quick_window_days must be at least 1".into(),
            ));
        }
        if sync.quick_window_days >= sync.lookback_days {
            return Err(ConfigError::Invalid(format!(
                "sync.quick_window_days ({}) must be smaller than sync.lookback_days ({})",
                sync.quick_window_days, sync.lookback_days
            )));
        }
        if sync.page_size == 0 {
            return Err(ConfigError::Invalid("sync.page_size must be positive".into()));
        }
        if sync.max_results_per_filter == 0 {
            return Err(ConfigError::Invalid(
                "sync.max_results_per_filter must be positive".into(),
            ));
        }
        if sync.workers == 0 {
            return Err(ConfigError::Invalid("sync.workers must be positive".into()));
        }
        if self.llm.max_tokens == 0 {
            return Err(ConfigError::Invalid("llm.max_tokens must be positive".into()));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::Invalid(format!(
                "llm.temperature ({}) must be between 0 and 2",
                self.llm.temperature
            )));
        }
        if self.enrichment.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "enrichment.max_attempts must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// Size of the recent window fetched by the quick phase.
    pub quick_window_days: u32,
    /// Total history covered by quick + deep.
    pub lookback_days: u32,
    /// Width of each deep-phase sub-filter; 0 fetches the deep window in one filter.
    pub deep_chunk_days: u32,
    /// Most results the remote will page through for one filter. Windows
    /// matching more are halved until each piece fits.
    pub max_results_per_filter: u64,
    pub page_size: u32,
    /// Attempts per page for transient failures before the phase fails.
    pub max_page_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,
    pub workers: usize,
}

impl SyncSection {
    /// Page size clamped to what the remote accepts.
    pub fn effective_page_size(&self) -> u32 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            quick_window_days: 30,
            lookback_days: 90,
            deep_chunk_days: 30,
            max_results_per_filter: 1000,
            page_size: 50,
            max_page_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_secs: 60,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubSection {
    pub token_env: String,
    pub api_url: String,
    /// Pause before a call when the remaining budget drops to this value.
    pub rate_limit_pause_threshold: u32,
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            token_env: "GITHUB_TOKEN".to_string(),
            api_url: "https://api.github.com/graphql".to_string(),
            rate_limit_pause_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentSection {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    /// Consecutive failed batches after which a sweep stops submitting.
    pub circuit_breaker_threshold: u32,
    /// Truncation applied to each record's summary in an inference request.
    pub max_summary_chars: usize,
    /// Period of the background sweep over every team while a sync runs; 0 disables it.
    pub sweep_interval_secs: u64,
}

impl EnrichmentSection {
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_SIZE)
    }
}

impl Default for EnrichmentSection {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_attempts: 3,
            initial_backoff_ms: 1000,
            circuit_breaker_threshold: 2,
            max_summary_chars: 4000,
            sweep_interval_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub enabled: bool,
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    pub base_url: Option<String>,
    /// Reply ceiling per batch; a batch answers with one JSON object per record.
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout_secs: u64,
    /// Override the built-in per-model rates (USD per 1K tokens).
    pub price_per_1k_input: Option<f64>,
    pub price_per_1k_output: Option<f64>,
    /// USD ceiling for one sweep. 0 means unlimited.
    pub cost_budget: f64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: None,
            max_tokens: 4096,
            temperature: 0.0,
            timeout_secs: 120,
            price_per_1k_input: None,
            price_per_1k_output: None,
            cost_budget: 5.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationSection {
    pub bucketing: Bucketing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightsSection {
    /// Buckets preceding the latest one that form the comparison baseline.
    pub baseline_buckets: usize,
    /// Minimum records in the latest bucket before any rule fires.
    pub min_sample_size: u64,
    /// Absolute change in AI-assisted rate (0..1) that counts as a shift.
    pub ai_rate_shift: f64,
    /// Ratio over baseline that counts as a regression for duration metrics.
    pub regression_ratio: f64,
    /// Fractional drop in PR count that counts as a throughput drop.
    pub throughput_drop: f64,
    /// Mean changed lines per PR above which changes are flagged as large.
    pub large_change_lines: f64,
}

impl Default for InsightsSection {
    fn default() -> Self {
        Self {
            baseline_buckets: 4,
            min_sample_size: 3,
            ai_rate_shift: 0.15,
            regression_ratio: 1.5,
            throughput_drop: 0.4,
            large_change_lines: 600.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TallyConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sync.quick_window_days, 30);
        assert_eq!(config.sync.lookback_days, 90);
        assert_eq!(config.github.token_env, "GITHUB_TOKEN");
        assert_eq!(config.aggregation.bucketing, Bucketing::Week);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: TallyConfig = toml::from_str(
            r#"
            [sync]
            lookback_days = 180
            page_size = 500

            [aggregation]
            bucketing = "month"
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.lookback_days, 180);
        assert_eq!(config.sync.quick_window_days, 30);
        assert_eq!(config.sync.effective_page_size(), MAX_PAGE_SIZE);
        assert_eq!(config.aggregation.bucketing, Bucketing::Month);
        assert_eq!(config.enrichment.batch_size, 50);
    }

    #[test]
    fn quick_window_must_fit_in_lookback() {
        let mut config = TallyConfig::default();
        config.sync.quick_window_days = 90;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_result_cap_is_rejected() {
        let mut config = TallyConfig::default();
        assert_eq!(config.sync.max_results_per_filter, 1000);
        config.sync.max_results_per_filter = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn llm_sampling_settings_are_validated() {
        let mut config: TallyConfig = toml::from_str(
            r#"
            [llm]
            enabled = true
            max_tokens = 2048
            temperature = 0.2
            price_per_1k_input = 0.001
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.llm.max_tokens, 2048);
        assert_eq!(config.llm.price_per_1k_input, Some(0.001));
        assert_eq!(config.llm.price_per_1k_output, None);

        config.llm.temperature = 3.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn batch_size_is_clamped() {
        let mut section = EnrichmentSection::default();
        section.batch_size = 10_000;
        assert_eq!(section.effective_batch_size(), MAX_BATCH_SIZE);
        section.batch_size = 0;
        assert_eq!(section.effective_batch_size(), 1);
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = TallyConfig::load(&dir.path().join("config.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn load_round_trips_serialized_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, toml::to_string(&TallyConfig::default()).unwrap()).unwrap();
        let loaded = TallyConfig::load(&path).unwrap();
        assert_eq!(loaded.sync.deep_chunk_days, 30);
        assert_eq!(loaded.llm.provider, "anthropic");
    }
}
