//! Configuration layer
//!
//! Bulk settings come from code ([`BulkOperationConfig`] builders) or from the
//! environment via [`CatalogConfig::from_env`], which loads `.env` first.
//! Missing variables fall back to defaults; malformed ones are errors.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::resolution::DEFAULT_DUAL_PURPOSE_PAGE_SIZE;

pub const DEFAULT_BATCH_SIZE: usize = 250;
pub const MAX_BATCH_SIZE: usize = 5000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var} has an invalid value {value:?}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
}

/// Per-call settings for the bulk writer.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkOperationConfig {
    /// Items per batch; 100–500 is the sweet spot.
    pub batch_size: usize,
    /// One transaction per batch. Disable only for idempotent, re-runnable loads.
    pub enable_transactions: bool,
    /// Log final metrics at `info` instead of `debug`.
    pub enable_metrics: bool,
    /// Retries per item for transient store failures.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for BulkOperationConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            enable_transactions: true,
            enable_metrics: true,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl BulkOperationConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_transactions(mut self, enabled: bool) -> Self {
        self.enable_transactions = enabled;
        self
    }

    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = enabled;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(ConfigError::OutOfRange {
                field: "batch_size",
                value: self.batch_size as i64,
                min: 1,
                max: MAX_BATCH_SIZE as i64,
            });
        }
        Ok(())
    }
}

/// Crate-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogConfig {
    pub bulk: BulkOperationConfig,
    pub dual_purpose_page_size: i64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            bulk: BulkOperationConfig::default(),
            dual_purpose_page_size: DEFAULT_DUAL_PURPOSE_PAGE_SIZE,
        }
    }
}

impl CatalogConfig {
    /// Load `.env` (if present) and read `CATALOG_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let bulk = BulkOperationConfig {
            batch_size: parse_var(&lookup, "CATALOG_BULK_BATCH_SIZE")?
                .unwrap_or(defaults.bulk.batch_size),
            enable_transactions: parse_flag(&lookup, "CATALOG_BULK_TRANSACTIONS")?
                .unwrap_or(defaults.bulk.enable_transactions),
            enable_metrics: parse_flag(&lookup, "CATALOG_BULK_METRICS")?
                .unwrap_or(defaults.bulk.enable_metrics),
            max_retries: parse_var(&lookup, "CATALOG_BULK_MAX_RETRIES")?
                .unwrap_or(defaults.bulk.max_retries),
            retry_delay: parse_var::<u64, _>(&lookup, "CATALOG_BULK_RETRY_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.bulk.retry_delay),
        };
        bulk.validate()?;

        let dual_purpose_page_size = parse_var(&lookup, "CATALOG_DUAL_PURPOSE_PAGE_SIZE")?
            .unwrap_or(defaults.dual_purpose_page_size);
        if dual_purpose_page_size < 1 {
            return Err(ConfigError::OutOfRange {
                field: "dual_purpose_page_size",
                value: dual_purpose_page_size,
                min: 1,
                max: i64::MAX,
            });
        }

        Ok(Self {
            bulk,
            dual_purpose_page_size,
        })
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn parse_flag<F>(lookup: &F, var: &'static str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var).as_deref().map(str::trim) {
        None => Ok(None),
        Some("1" | "true" | "yes" | "on") => Ok(Some(true)),
        Some("0" | "false" | "no" | "off") => Ok(Some(false)),
        Some(other) => Err(ConfigError::InvalidValue {
            var,
            value: other.to_string(),
            reason: "expected true/false".to_string(),
        }),
    }
}

#[cfg(feature = "database")]
pub use database::DatabaseConfig;

#[cfg(feature = "database")]
mod database {
    use std::time::Duration;

    use sqlx::postgres::PgPoolOptions;
    use sqlx::PgPool;
    use tracing::info;

    /// Postgres pool settings.
    #[derive(Debug, Clone)]
    pub struct DatabaseConfig {
        pub database_url: String,
        pub max_connections: u32,
        pub connection_timeout: Duration,
        pub idle_timeout: Option<Duration>,
        pub max_lifetime: Option<Duration>,
    }

    impl Default for DatabaseConfig {
        fn default() -> Self {
            Self {
                database_url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgresql://localhost:5432/food_catalog".to_string()),
                max_connections: std::env::var("DATABASE_POOL_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                connection_timeout: Duration::from_secs(30),
                idle_timeout: Some(Duration::from_secs(600)),
                max_lifetime: Some(Duration::from_secs(1800)),
            }
        }
    }

    impl DatabaseConfig {
        pub fn from_env() -> Self {
            dotenvy::dotenv().ok();
            Self::default()
        }

        pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
            info!(
                "Connecting to database: {}",
                mask_database_url(&self.database_url)
            );
            let mut options = PgPoolOptions::new()
                .max_connections(self.max_connections)
                .acquire_timeout(self.connection_timeout);
            if let Some(idle_timeout) = self.idle_timeout {
                options = options.idle_timeout(idle_timeout);
            }
            if let Some(max_lifetime) = self.max_lifetime {
                options = options.max_lifetime(max_lifetime);
            }
            options.connect(&self.database_url).await
        }
    }

    /// Hide the password in a connection URL for logging.
    pub(super) fn mask_database_url(url: &str) -> String {
        match url::Url::parse(url) {
            Ok(mut parsed) if parsed.password().is_some() => {
                let _ = parsed.set_password(Some("****"));
                parsed.to_string()
            }
            _ => url.to_string(),
        }
    }
}
