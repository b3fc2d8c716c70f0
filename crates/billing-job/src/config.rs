//! Billing job configuration
//!
//! Loaded from the environment (and a `.env` file when present). Every
//! setting has a default, so an empty environment yields a working setup
//! with a `batch.db` SQLite file and a `staging/` directory in the current
//! working directory.

use anyhow::{bail, Context, Result};
use batch_core::config::{
    DEFAULT_BUSY_TIMEOUT_SECS, DEFAULT_CHUNK_SIZE, DEFAULT_DATABASE_MAX_CONNECTIONS,
    DEFAULT_DATABASE_URL, DEFAULT_RETRY_LIMIT, DEFAULT_SKIP_LIMIT, DEFAULT_STALE_EXECUTION_SECS,
};
use batch_core::{BatchConfig, RepositoryConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Default staging directory for input copies, reports and skip logs.
pub const DEFAULT_STAGING_DIR: &str = "staging";

/// Default report file name inside the staging directory.
pub const DEFAULT_OUTPUT_FILE_NAME: &str = "processed-report.csv";

/// Default skip log file name inside the staging directory.
pub const DEFAULT_SKIP_FILE_NAME: &str = "skipped-records.psv";

/// Default price per unit of data usage.
pub const DEFAULT_DATA_RATE: f64 = 0.01;

/// Default price per unit of call duration.
pub const DEFAULT_CALL_RATE: f64 = 0.5;

/// Default price per SMS.
pub const DEFAULT_SMS_RATE: f64 = 0.1;

/// Default minimum total for a record to appear in the report.
pub const DEFAULT_SPENDING_THRESHOLD: f64 = 150.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    pub database: RepositoryConfig,
    pub batch: BatchConfig,
    pub staging_dir: PathBuf,
    pub pricing: PricingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    pub data_rate: f64,
    pub call_rate: f64,
    pub sms_rate: f64,
    pub spending_threshold: f64,
    /// Simulate a pricing outage on every n-th data price lookup
    pub failure_every: Option<u64>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            data_rate: DEFAULT_DATA_RATE,
            call_rate: DEFAULT_CALL_RATE,
            sms_rate: DEFAULT_SMS_RATE,
            spending_threshold: DEFAULT_SPENDING_THRESHOLD,
            failure_every: None,
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            database: RepositoryConfig::default(),
            batch: BatchConfig::default(),
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            pricing: PricingConfig::default(),
        }
    }
}

impl BillingConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from `lookup`, which maps variable names to values
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            database: RepositoryConfig {
                url: text("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
                max_connections: number(&lookup, "DATABASE_MAX_CONNECTIONS")?
                    .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
                busy_timeout_secs: number(&lookup, "DATABASE_BUSY_TIMEOUT")?
                    .unwrap_or(DEFAULT_BUSY_TIMEOUT_SECS),
                stale_execution_secs: number(&lookup, "BILLING_STALE_EXECUTION_SECS")?
                    .unwrap_or(DEFAULT_STALE_EXECUTION_SECS),
            },
            batch: BatchConfig {
                chunk_size: number(&lookup, "BILLING_CHUNK_SIZE")?.unwrap_or(DEFAULT_CHUNK_SIZE),
                skip_limit: number(&lookup, "BILLING_SKIP_LIMIT")?.unwrap_or(DEFAULT_SKIP_LIMIT),
                retry_limit: number(&lookup, "BILLING_RETRY_LIMIT")?.unwrap_or(DEFAULT_RETRY_LIMIT),
                retry_backoff_ms: number(&lookup, "BILLING_RETRY_BACKOFF_MS")?.unwrap_or(0),
            },
            staging_dir: text("BILLING_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STAGING_DIR)),
            pricing: PricingConfig {
                data_rate: number(&lookup, "BILLING_PRICING_DATA")?.unwrap_or(DEFAULT_DATA_RATE),
                call_rate: number(&lookup, "BILLING_PRICING_CALL")?.unwrap_or(DEFAULT_CALL_RATE),
                sms_rate: number(&lookup, "BILLING_PRICING_SMS")?.unwrap_or(DEFAULT_SMS_RATE),
                spending_threshold: number(&lookup, "BILLING_SPENDING_THRESHOLD")?
                    .unwrap_or(DEFAULT_SPENDING_THRESHOLD),
                failure_every: number(&lookup, "BILLING_PRICING_FAILURE_EVERY")?,
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;
        self.batch.validate()?;

        if self.staging_dir.as_os_str().is_empty() {
            bail!("Staging directory cannot be empty");
        }

        let pricing = &self.pricing;
        for (name, rate) in [
            ("data", pricing.data_rate),
            ("call", pricing.call_rate),
            ("sms", pricing.sms_rate),
        ] {
            if !rate.is_finite() || rate < 0.0 {
                bail!("Pricing rate for {name} must be a non-negative number, got {rate}");
            }
        }
        if !pricing.spending_threshold.is_finite() {
            bail!("Spending threshold must be a finite number");
        }
        if matches!(pricing.failure_every, Some(n) if n < 2) {
            bail!("BILLING_PRICING_FAILURE_EVERY must be at least 2, or every lookup would fail");
        }

        Ok(())
    }

    pub fn default_output_file(&self) -> PathBuf {
        self.staging_dir.join(DEFAULT_OUTPUT_FILE_NAME)
    }

    pub fn default_skip_file(&self) -> PathBuf {
        self.staging_dir.join(DEFAULT_SKIP_FILE_NAME)
    }
}

fn number<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .map(|v| {
            v.trim()
                .parse::<T>()
                .with_context(|| format!("{key} has an invalid value: '{v}'"))
        })
        .transpose()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BillingConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.database.url, "sqlite://batch.db");
        assert_eq!(config.batch.chunk_size, 100);
        assert_eq!(config.batch.skip_limit, 10);
        assert_eq!(config.batch.retry_limit, 100);
        assert_eq!(config.pricing.spending_threshold, 150.0);
        assert_eq!(config.pricing.failure_every, None);
        assert_eq!(config.default_output_file(), PathBuf::from("staging/processed-report.csv"));
        assert_eq!(config.default_skip_file(), PathBuf::from("staging/skipped-records.psv"));
    }

    #[test]
    fn test_overrides() {
        let config = BillingConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite:///tmp/billing.db"),
            ("BILLING_CHUNK_SIZE", "250"),
            ("BILLING_SKIP_LIMIT", " 3 "),
            ("BILLING_STAGING_DIR", "/srv/staging"),
            ("BILLING_PRICING_SMS", "0.25"),
            ("BILLING_PRICING_FAILURE_EVERY", "7"),
        ]))
        .unwrap();

        assert_eq!(config.database.url, "sqlite:///tmp/billing.db");
        assert_eq!(config.batch.chunk_size, 250);
        assert_eq!(config.batch.skip_limit, 3);
        assert_eq!(config.staging_dir, PathBuf::from("/srv/staging"));
        assert_eq!(config.pricing.sms_rate, 0.25);
        assert_eq!(config.pricing.failure_every, Some(7));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = BillingConfig::from_lookup(lookup(&[("BILLING_CHUNK_SIZE", "lots")])).unwrap_err();
        assert!(err.to_string().contains("BILLING_CHUNK_SIZE"));

        assert!(BillingConfig::from_lookup(lookup(&[("BILLING_CHUNK_SIZE", "0")])).is_err());
        assert!(BillingConfig::from_lookup(lookup(&[("BILLING_PRICING_CALL", "-1")])).is_err());
        assert!(BillingConfig::from_lookup(lookup(&[("BILLING_PRICING_FAILURE_EVERY", "1")])).is_err());
        assert!(BillingConfig::from_lookup(lookup(&[(
            "BILLING_STALE_EXECUTION_SECS",
            "9223372036854775807"
        )]))
        .is_err());
    }
}
