//! Service configuration, read from the environment (and `.env` when present).

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_RETRIES};

const DEFAULT_GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Base URL this service is reachable at; used to mint document URLs.
    pub public_base_url: String,
    pub gemini: GeminiConfig,
    pub pipeline: PipelineConfig,
    pub sweeper: SweeperConfig,
    /// Supabase backend. In-memory storage is used when absent.
    pub supabase: Option<SupabaseConfig>,
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// Missing key is not a startup error: every run fails instead.
    pub api_key: Option<String>,
    pub model: String,
    pub api_url: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_GEMINI_MODEL.to_string(),
            api_url: DEFAULT_GEMINI_API_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Pause before each document after the first.
    pub pacing: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            pacing: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Runs stuck in `processing` longer than this are failed.
    pub stale_after: Duration,
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(900),
            interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub service_role_key: String,
    pub bucket: String,
    pub schema: String,
}

impl AppConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let gemini = GeminiConfig {
            api_key: var("GEMINI_API_KEY"),
            model: var("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            api_url: var("GEMINI_API_URL").unwrap_or_else(|| DEFAULT_GEMINI_API_URL.to_string()),
        };

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            max_retries: parse_or(&var, "RETRY_MAX_RETRIES", defaults.max_retries)?,
            base_delay: Duration::from_millis(parse_or(
                &var,
                "RETRY_BASE_DELAY_MS",
                defaults.base_delay.as_millis() as u64,
            )?),
            pacing: Duration::from_millis(parse_or(
                &var,
                "EXTRACTION_PACING_MS",
                defaults.pacing.as_millis() as u64,
            )?),
        };

        let defaults = SweeperConfig::default();
        let sweeper = SweeperConfig {
            stale_after: Duration::from_secs(parse_or(
                &var,
                "STALE_PROCESSING_SECS",
                defaults.stale_after.as_secs(),
            )?),
            interval: Duration::from_secs(parse_or(
                &var,
                "STALE_SWEEP_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )?),
        };

        if sweeper.interval.is_zero() {
            anyhow::bail!("STALE_SWEEP_INTERVAL_SECS must be greater than zero");
        }

        let supabase = match (var("SUPABASE_URL"), var("SUPABASE_SERVICE_ROLE_KEY")) {
            (Some(url), Some(service_role_key)) => Some(SupabaseConfig {
                url: url.trim_end_matches('/').to_string(),
                service_role_key,
                bucket: var("SUPABASE_BUCKET").unwrap_or_else(|| "quotes".to_string()),
                schema: var("SUPABASE_SCHEMA").unwrap_or_else(|| "public".to_string()),
            }),
            (None, None) => None,
            _ => anyhow::bail!("SUPABASE_URL and SUPABASE_SERVICE_ROLE_KEY must be set together"),
        };

        Ok(Self {
            bind_addr: var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            public_base_url: var("PUBLIC_BASE_URL")
                .unwrap_or_else(|| "http://localhost:3000".to_string())
                .trim_end_matches('/')
                .to_string(),
            gemini,
            pipeline,
            sweeper,
            supabase,
        })
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.public_base_url, "http://localhost:3000");
        assert!(config.gemini.api_key.is_none());
        assert_eq!(config.gemini.model, "gemini-2.0-flash");
        assert_eq!(config.pipeline.max_retries, 4);
        assert_eq!(config.pipeline.base_delay, Duration::from_millis(2000));
        assert_eq!(config.pipeline.pacing, Duration::from_millis(3000));
        assert_eq!(config.sweeper.stale_after, Duration::from_secs(900));
        assert!(config.supabase.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("GEMINI_API_KEY", "secret"),
            ("GEMINI_MODEL", "gemini-2.5-pro"),
            ("RETRY_MAX_RETRIES", "2"),
            ("EXTRACTION_PACING_MS", "0"),
            ("PUBLIC_BASE_URL", "https://quotes.example.com/"),
            ("SUPABASE_URL", "https://abc.supabase.co/"),
            ("SUPABASE_SERVICE_ROLE_KEY", "service"),
        ])
        .unwrap();

        assert_eq!(config.gemini.api_key.as_deref(), Some("secret"));
        assert_eq!(config.gemini.model, "gemini-2.5-pro");
        assert_eq!(config.pipeline.max_retries, 2);
        assert_eq!(config.pipeline.pacing, Duration::ZERO);
        assert_eq!(config.public_base_url, "https://quotes.example.com");
        let supabase = config.supabase.unwrap();
        assert_eq!(supabase.url, "https://abc.supabase.co");
        assert_eq!(supabase.bucket, "quotes");
    }

    #[test]
    fn test_blank_api_key_counts_as_missing() {
        let config = load(&[("GEMINI_API_KEY", "  ")]).unwrap();
        assert!(config.gemini.api_key.is_none());
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = load(&[("RETRY_BASE_DELAY_MS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("RETRY_BASE_DELAY_MS"));
    }

    #[test]
    fn test_partial_supabase_config_is_rejected() {
        assert!(load(&[("SUPABASE_URL", "https://abc.supabase.co")]).is_err());
    }

    #[test]
    fn test_zero_sweep_interval_is_rejected() {
        let err = load(&[("STALE_SWEEP_INTERVAL_SECS", "0")]).unwrap_err();
        assert!(err.to_string().contains("STALE_SWEEP_INTERVAL_SECS"));

        let config = load(&[("STALE_SWEEP_INTERVAL_SECS", "5")]).unwrap();
        assert_eq!(config.sweeper.interval, Duration::from_secs(5));
    }
}
