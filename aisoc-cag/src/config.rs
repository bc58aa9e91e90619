//! Engine configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::builder::Budget;
use crate::cache::CacheConfig;
use crate::error::{CagError, Result};
use crate::record::{ThreatPriority, DEFAULT_MAX_RAW_CHARS, DEFAULT_MAX_UNIT_CHARS, MAX_SEVERITY};

/// Settings for [`CagEngine`](crate::engine::CagEngine)
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cache: CacheConfig,

    /// Model context size for the prefix document
    pub budget: Budget,

    /// Part of the budget kept free for the question and the answer
    pub reserve_tokens: usize,

    pub max_raw_chars: usize,
    pub max_unit_chars: usize,

    /// Generation budget when the caller does not give one
    pub default_max_tokens: usize,

    /// Hard upper bound on any generation budget
    pub max_tokens_cap: usize,

    pub generation_timeout: Duration,

    /// New events at or above this level force a rebuild
    pub min_rebuild_severity: u8,

    /// Changed fraction of the unit set that forces a rebuild
    pub max_drift_ratio: f64,

    /// Rebuild in the background when a query finds its entry gone
    pub auto_rebuild: bool,

    /// Language the model is asked to answer in
    pub response_language: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            budget: Budget::Tokens(32_768),
            reserve_tokens: 2_000,
            max_raw_chars: DEFAULT_MAX_RAW_CHARS,
            max_unit_chars: DEFAULT_MAX_UNIT_CHARS,
            default_max_tokens: 256,
            max_tokens_cap: 2_048,
            generation_timeout: Duration::from_secs(120),
            min_rebuild_severity: ThreatPriority::High.min_level(),
            max_drift_ratio: 0.25,
            auto_rebuild: true,
            response_language: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `CAG_*` environment variables (and `.env`)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let mut config = Self::default();

        if let Ok(preset) = std::env::var("CAG_CACHE_PRESET") {
            if !preset.trim().is_empty() {
                config.cache = CacheConfig::preset(&preset)?;
            }
        }
        if let Ok(dir) = std::env::var("CAG_CACHE_DIR") {
            if !dir.trim().is_empty() {
                config.cache.persist_dir = Some(PathBuf::from(dir));
            }
        }
        if let Some(secs) = env_number::<u64>("CAG_CACHE_TTL_SECS")? {
            config.cache.default_ttl = Duration::from_secs(secs);
        }
        if let Some(tokens) = env_number::<usize>("CAG_CONTEXT_TOKENS")? {
            config.budget = Budget::Tokens(tokens);
        }
        if let Some(chars) = env_number::<usize>("CAG_CONTEXT_CHARS")? {
            config.budget = Budget::Characters(chars);
        }
        if let Some(reserve) = env_number::<usize>("CAG_RESERVE_TOKENS")? {
            config.reserve_tokens = reserve;
        }
        if let Some(max_tokens) = env_number::<usize>("CAG_MAX_TOKENS")? {
            config.default_max_tokens = max_tokens;
        }
        if let Some(secs) = env_number::<u64>("CAG_GENERATION_TIMEOUT_SECS")? {
            config.generation_timeout = Duration::from_secs(secs);
        }
        if let Ok(raw) = std::env::var("CAG_MIN_REBUILD_SEVERITY") {
            config.min_rebuild_severity = parse_severity(&raw)?;
        }
        if let Ok(language) = std::env::var("CAG_RESPONSE_LANGUAGE") {
            if !language.trim().is_empty() {
                config.response_language = Some(language.trim().to_string());
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Budget left for the prefix once the reserve is taken out
    ///
    /// The reserve only applies to token budgets.
    pub fn effective_budget(&self) -> Budget {
        match self.budget {
            Budget::Tokens(n) => Budget::Tokens(n.saturating_sub(self.reserve_tokens)),
            chars => chars,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;

        if self.effective_budget().limit() == 0 {
            return Err(CagError::ConfigError(
                "context budget leaves no room after the reserve".to_string(),
            ));
        }
        if self.max_tokens_cap == 0 || self.default_max_tokens == 0 {
            return Err(CagError::ConfigError(
                "token budgets must be greater than 0".to_string(),
            ));
        }
        if self.generation_timeout.is_zero() {
            return Err(CagError::ConfigError(
                "generation_timeout must be greater than 0".to_string(),
            ));
        }
        if self.min_rebuild_severity > MAX_SEVERITY {
            return Err(CagError::ConfigError(format!(
                "min_rebuild_severity must be at most {}",
                MAX_SEVERITY
            )));
        }
        if !(0.0..=1.0).contains(&self.max_drift_ratio) {
            return Err(CagError::ConfigError(
                "max_drift_ratio must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// A rule level, or a tier name standing for its lowest level
fn parse_severity(raw: &str) -> Result<u8> {
    let raw = raw.trim();
    match raw.parse::<u8>() {
        Ok(level) => Ok(level),
        Err(_) => raw.parse::<ThreatPriority>().map(|tier| tier.min_level()),
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CagError::ConfigError(format!("{} is not a valid number: {}", key, raw))),
        Err(_) => Ok(None),
    }
}
