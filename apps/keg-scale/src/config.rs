use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BUFFER_SIZE: usize = 10;
pub const DEFAULT_MIN_WEIGHT_GRAMS: f64 = 6_000.0;
pub const DEFAULT_MAX_WEIGHT_GRAMS: f64 = 65_000.0;
pub const DEFAULT_STALENESS_SECONDS: u64 = 5 * 60;
pub const DEFAULT_RECHECK_INTERVAL_SECONDS: u64 = 15;
pub const DEFAULT_STORE_RETENTION: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Journal,
    Memory,
}

impl StoreBackend {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "journal" | "file" => Ok(Self::Journal),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(anyhow!("unknown KEG_SCALE_STORE backend {other:?}")),
        }
    }
}

/// Plausible weight range for a reading, in grams. Anything outside is treated as a sensor glitch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightBounds {
    pub min_grams: f64,
    pub max_grams: f64,
}

impl WeightBounds {
    pub fn contains(&self, weight: f64) -> bool {
        weight.is_finite() && weight >= self.min_grams && weight <= self.max_grams
    }
}

impl Default for WeightBounds {
    fn default() -> Self {
        Self {
            min_grams: DEFAULT_MIN_WEIGHT_GRAMS,
            max_grams: DEFAULT_MAX_WEIGHT_GRAMS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_bind: String,
    pub auth_token: String,

    pub buffer_size: usize,
    pub weight_bounds: WeightBounds,
    pub staleness_threshold: Duration,
    pub recheck_interval: Duration,

    pub store: StoreBackend,
    pub data_dir: PathBuf,
    pub store_retention: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // A missing .env is the normal production case.
        let _ = dotenvy::dotenv();

        let http_bind = env_string("KEG_SCALE_HTTP_BIND", Some("0.0.0.0:8080".to_string()))?;
        let auth_token = env_optional("KEG_SCALE_AUTH_TOKEN")
            .ok_or_else(|| anyhow!("missing env var KEG_SCALE_AUTH_TOKEN"))?;

        let buffer_size =
            env_u64("KEG_SCALE_BUFFER_SIZE", Some(DEFAULT_BUFFER_SIZE as u64))? as usize;
        let weight_bounds = WeightBounds {
            min_grams: env_f64("KEG_SCALE_MIN_WEIGHT_GRAMS", Some(DEFAULT_MIN_WEIGHT_GRAMS))?,
            max_grams: env_f64("KEG_SCALE_MAX_WEIGHT_GRAMS", Some(DEFAULT_MAX_WEIGHT_GRAMS))?,
        };
        let staleness_threshold = Duration::from_secs(env_u64(
            "KEG_SCALE_STALENESS_SECONDS",
            Some(DEFAULT_STALENESS_SECONDS),
        )?);
        let recheck_interval = Duration::from_secs(env_u64(
            "KEG_SCALE_RECHECK_INTERVAL_SECONDS",
            Some(DEFAULT_RECHECK_INTERVAL_SECONDS),
        )?);

        let store = StoreBackend::parse(&env_string(
            "KEG_SCALE_STORE",
            Some("journal".to_string()),
        )?)?;
        let data_dir = PathBuf::from(env_string("KEG_SCALE_DATA_DIR", Some("./data".to_string()))?);
        let store_retention =
            env_u64("KEG_SCALE_STORE_RETENTION", Some(DEFAULT_STORE_RETENTION as u64))? as usize;

        let config = Self {
            http_bind,
            auth_token,
            buffer_size,
            weight_bounds,
            staleness_threshold,
            recheck_interval,
            store,
            data_dir,
            store_retention,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            bail!("KEG_SCALE_BUFFER_SIZE must be at least 1");
        }
        if self.weight_bounds.min_grams >= self.weight_bounds.max_grams {
            bail!(
                "KEG_SCALE_MIN_WEIGHT_GRAMS ({}) must be below KEG_SCALE_MAX_WEIGHT_GRAMS ({})",
                self.weight_bounds.min_grams,
                self.weight_bounds.max_grams
            );
        }
        if self.staleness_threshold.is_zero() {
            bail!("KEG_SCALE_STALENESS_SECONDS must be positive");
        }
        if self.recheck_interval.is_zero() {
            bail!("KEG_SCALE_RECHECK_INTERVAL_SECONDS must be positive");
        }
        if self.store_retention == 0 {
            bail!("KEG_SCALE_STORE_RETENTION must be at least 1");
        }
        Ok(())
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_f64(key: &str, default: Option<f64>) -> Result<f64> {
    match env::var(key) {
        Ok(value) => {
            let parsed = value
                .trim()
                .parse::<f64>()
                .with_context(|| format!("invalid {key}"))?;
            if !parsed.is_finite() {
                bail!("invalid {key}: must be finite");
            }
            Ok(parsed)
        }
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
pub(crate) fn test_config(data_dir: &std::path::Path) -> Config {
    Config {
        http_bind: "127.0.0.1:0".to_string(),
        auth_token: "secret-token".to_string(),
        buffer_size: 3,
        weight_bounds: WeightBounds::default(),
        staleness_threshold: Duration::from_secs(DEFAULT_STALENESS_SECONDS),
        recheck_interval: Duration::from_secs(DEFAULT_RECHECK_INTERVAL_SECONDS),
        store: StoreBackend::Memory,
        data_dir: data_dir.to_path_buf(),
        store_retention: DEFAULT_STORE_RETENTION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_backend_accepts_aliases() {
        assert_eq!(StoreBackend::parse("journal").unwrap(), StoreBackend::Journal);
        assert_eq!(StoreBackend::parse(" File ").unwrap(), StoreBackend::Journal);
        assert_eq!(StoreBackend::parse("memory").unwrap(), StoreBackend::Memory);
        assert!(StoreBackend::parse("redis").is_err());
    }

    #[test]
    fn weight_bounds_are_inclusive_and_reject_nan() {
        let bounds = WeightBounds::default();
        assert!(bounds.contains(6_000.0));
        assert!(bounds.contains(65_000.0));
        assert!(!bounds.contains(100.0));
        assert!(!bounds.contains(90_000.0));
        assert!(!bounds.contains(f64::NAN));
    }

    #[test]
    fn validate_rejects_inverted_bounds_and_empty_buffer() {
        let dir = std::env::temp_dir();
        let mut config = test_config(&dir);
        assert!(config.validate().is_ok());

        config.buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = test_config(&dir);
        config.weight_bounds = WeightBounds {
            min_grams: 10.0,
            max_grams: 5.0,
        };
        assert!(config.validate().is_err());

        let mut config = test_config(&dir);
        config.recheck_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
