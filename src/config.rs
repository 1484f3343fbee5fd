//! Pipeline configuration.
//!
//! Every value is a plain scalar with a documented default. [`PipelineConfig::from_env`]
//! reads overrides from the process environment; tests build the struct directly.

use crate::error::{Error, Result};
use crate::section::Section;
use chrono_tz::Tz;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default vendor API root.
pub const DEFAULT_VENDOR_BASE_URL: &str = "https://api.flowhub.co";

/// Records per vendor page. The vendor caps page size at 500.
pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// Simultaneous in-flight entity fetches during a rebuild.
pub const DEFAULT_REBUILD_CONCURRENCY: usize = 2;

/// Vendor credentials.
#[derive(Clone, Default)]
pub struct VendorCredentials {
    pub client_id: String,
    pub api_key: String,
}

impl VendorCredentials {
    /// Both halves of the credential pair are present.
    pub fn is_complete(&self) -> bool {
        !self.client_id.is_empty() && !self.api_key.is_empty()
    }
}

impl std::fmt::Debug for VendorCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VendorCredentials")
            .field("client_id", &self.client_id)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "***" })
            .finish()
    }
}

/// Configuration for the vendor client and its retry budget.
#[derive(Clone, Debug)]
pub struct VendorConfig {
    pub base_url: String,
    pub credentials: VendorCredentials,
    pub page_size: u32,
    pub request_timeout: Duration,
    pub max_attempts: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for VendorConfig {
    fn default() -> Self {
        VendorConfig {
            base_url: DEFAULT_VENDOR_BASE_URL.to_string(),
            credentials: VendorCredentials::default(),
            page_size: DEFAULT_PAGE_SIZE,
            request_timeout: Duration::from_secs(120),
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub vendor: VendorConfig,
    /// Shared cache connection string. `None` keeps the shared layer in-process.
    pub redis_url: Option<String>,
    pub store_path: PathBuf,
    /// Quiet period before coalesced store writes hit the disk.
    pub store_flush_delay: Duration,
    pub rebuild_concurrency: usize,
    /// TTL of shared-layer report entries.
    pub cache_ttl: Duration,
    /// Per-section replacements for `cache_ttl`.
    pub section_ttls: HashMap<Section, Duration>,
    /// TTL of fast-layer copies. Never longer than `cache_ttl` in effect.
    pub fast_cache_ttl: Duration,
    /// Expiry of the rebuild lock; bounds how long a crashed rebuild blocks others.
    pub lock_ttl: Duration,
    pub timezone: Tz,
    pub trend_weeks: u32,
    pub velocity_weeks: u32,
    pub excluded_entities: Vec<String>,
    pub excluded_products: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            vendor: VendorConfig::default(),
            redis_url: None,
            store_path: PathBuf::from("period_store.json"),
            store_flush_delay: Duration::from_secs(2),
            rebuild_concurrency: DEFAULT_REBUILD_CONCURRENCY,
            cache_ttl: Duration::from_secs(600),
            section_ttls: HashMap::new(),
            fast_cache_ttl: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(900),
            timezone: chrono_tz::America::Los_Angeles,
            trend_weeks: 12,
            velocity_weeks: 4,
            excluded_entities: vec![
                "MBNV".to_string(),
                "Smoke & Mirrors".to_string(),
                "Cultivation".to_string(),
            ],
            excluded_products: vec!["EXIT BAG".to_string()],
        }
    }
}

impl PipelineConfig {
    /// Build configuration from environment variables, falling back to defaults.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let defaults = PipelineConfig::default();

        let vendor = VendorConfig {
            base_url: env_string("VENDOR_BASE_URL").unwrap_or(defaults.vendor.base_url),
            credentials: VendorCredentials {
                client_id: env_first(&["VENDOR_CLIENT_ID", "FLOWHUB_CLIENT_ID"]).unwrap_or_default(),
                api_key: env_first(&["VENDOR_API_KEY", "FLOWHUB_API_KEY"]).unwrap_or_default(),
            },
            page_size: env_parse("VENDOR_PAGE_SIZE", defaults.vendor.page_size)?,
            request_timeout: env_secs(
                "VENDOR_REQUEST_TIMEOUT_SECS",
                defaults.vendor.request_timeout,
            )?,
            max_attempts: env_parse("VENDOR_MAX_ATTEMPTS", defaults.vendor.max_attempts)?,
            backoff_base: env_millis("VENDOR_BACKOFF_BASE_MS", defaults.vendor.backoff_base)?,
            backoff_max: env_millis("VENDOR_BACKOFF_MAX_MS", defaults.vendor.backoff_max)?,
        };

        let timezone = match env_string("REPORT_TIMEZONE") {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|e| Error::ConfigError(format!("REPORT_TIMEZONE={}: {}", name, e)))?,
            None => defaults.timezone,
        };

        let config = PipelineConfig {
            vendor,
            redis_url: env_string("REDIS_URL"),
            store_path: env_string("PERIOD_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_path),
            store_flush_delay: env_millis("PERIOD_STORE_FLUSH_MS", defaults.store_flush_delay)?,
            rebuild_concurrency: env_parse("REBUILD_CONCURRENCY", defaults.rebuild_concurrency)?,
            cache_ttl: env_secs("CACHE_TTL_SECS", defaults.cache_ttl)?,
            section_ttls: env_section_ttls("SECTION_TTL_SECS")?,
            fast_cache_ttl: env_secs("FAST_CACHE_TTL_SECS", defaults.fast_cache_ttl)?,
            lock_ttl: env_secs("REBUILD_LOCK_TTL_SECS", defaults.lock_ttl)?,
            timezone,
            trend_weeks: env_parse("TREND_WEEKS", defaults.trend_weeks)?,
            velocity_weeks: env_parse("VELOCITY_WEEKS", defaults.velocity_weeks)?,
            excluded_entities: env_list("EXCLUDED_ENTITIES").unwrap_or(defaults.excluded_entities),
            excluded_products: env_list("EXCLUDED_PRODUCTS").unwrap_or(defaults.excluded_products),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` describing the first offending value.
    pub fn validate(&self) -> Result<()> {
        if self.vendor.page_size == 0 {
            return Err(Error::ConfigError("page size must be positive".to_string()));
        }
        if self.vendor.max_attempts == 0 {
            return Err(Error::ConfigError(
                "vendor max attempts must be positive".to_string(),
            ));
        }
        if self.rebuild_concurrency == 0 {
            return Err(Error::ConfigError(
                "rebuild concurrency must be positive".to_string(),
            ));
        }
        if self.trend_weeks == 0 || self.velocity_weeks == 0 {
            return Err(Error::ConfigError(
                "trend and velocity spans must cover at least one week".to_string(),
            ));
        }
        if self.cache_ttl.is_zero()
            || self.lock_ttl.is_zero()
            || self.section_ttls.values().any(Duration::is_zero)
        {
            return Err(Error::ConfigError(
                "cache and lock TTLs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// First of `names` that is set, so older deployments' variable names still work.
fn env_first(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| env_string(name))
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env_string(name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| Error::ConfigError(format!("{}={}: {}", name, raw, e))),
        None => Ok(default),
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    env_parse(name, default.as_secs()).map(Duration::from_secs)
}

fn env_millis(name: &str, default: Duration) -> Result<Duration> {
    env_parse(name, default.as_millis() as u64).map(Duration::from_millis)
}

fn env_list(name: &str) -> Option<Vec<String>> {
    env_string(name).map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

/// `section=secs` pairs, comma-separated, e.g. `staff=120,product_velocity=3600`.
fn env_section_ttls(name: &str) -> Result<HashMap<Section, Duration>> {
    let Some(pairs) = env_list(name) else {
        return Ok(HashMap::new());
    };
    pairs
        .iter()
        .map(|pair| {
            let invalid = |reason: String| Error::ConfigError(format!("{}: {}: {}", name, pair, reason));
            let (section, secs) = pair
                .split_once('=')
                .ok_or_else(|| invalid("expected section=secs".to_string()))?;
            let section: Section = section.trim().parse().map_err(|e: Error| invalid(e.to_string()))?;
            let secs: u64 = secs
                .trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| invalid(e.to_string()))?;
            Ok((section, Duration::from_secs(secs)))
        })
        .collect()
}
