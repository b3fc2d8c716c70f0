//! Pricing and the billing transform

use async_trait::async_trait;
use batch_core::{BatchError, ItemProcessor, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::PricingConfig;
use crate::model::{BillingData, ReportingData};

/// Source of unit prices.
///
/// Lookups may fail with [`BatchError::Transient`] when the catalog is
/// temporarily unavailable; the report step retries those.
#[async_trait]
pub trait PricingService: Send + Sync {
    /// Price per unit of data usage
    async fn data_pricing(&self) -> Result<f64>;

    /// Price per unit of call duration
    async fn call_pricing(&self) -> Result<f64>;

    async fn sms_pricing(&self) -> Result<f64>;
}

/// Unit prices
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricingRates {
    pub data: f64,
    pub call: f64,
    pub sms: f64,
}

impl Default for PricingRates {
    fn default() -> Self {
        Self {
            data: 0.01,
            call: 0.5,
            sms: 0.1,
        }
    }
}

/// Fixed-rate catalog with an optional simulated outage.
///
/// With `outage_every = Some(n)`, every n-th data price lookup fails
/// transiently. The pattern is deterministic so runs are reproducible.
#[derive(Debug)]
pub struct CatalogPricingService {
    rates: PricingRates,
    outage_every: Option<u64>,
    lookups: AtomicU64,
}

impl CatalogPricingService {
    pub fn new(rates: PricingRates) -> Self {
        Self {
            rates,
            outage_every: None,
            lookups: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &PricingConfig) -> Self {
        let service = Self::new(PricingRates {
            data: config.data_rate,
            call: config.call_rate,
            sms: config.sms_rate,
        });
        match config.failure_every {
            Some(n) => service.with_outage_every(n),
            None => service,
        }
    }

    pub fn with_outage_every(mut self, n: u64) -> Self {
        self.outage_every = Some(n.max(1));
        self
    }
}

#[async_trait]
impl PricingService for CatalogPricingService {
    async fn data_pricing(&self) -> Result<f64> {
        let lookup = self.lookups.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(n) = self.outage_every {
            if lookup % n == 0 {
                warn!(lookup, "Pricing catalog unavailable");
                return Err(BatchError::transient("error while retrieving data pricing"));
            }
        }
        Ok(self.rates.data)
    }

    async fn call_pricing(&self) -> Result<f64> {
        Ok(self.rates.call)
    }

    async fn sms_pricing(&self) -> Result<f64> {
        Ok(self.rates.sms)
    }
}

/// Prices each record and keeps those at or above the spending threshold
#[derive(Clone)]
pub struct BillingDataProcessor {
    pricing: Arc<dyn PricingService>,
    spending_threshold: f64,
}

impl BillingDataProcessor {
    pub fn new(pricing: Arc<dyn PricingService>, spending_threshold: f64) -> Self {
        Self {
            pricing,
            spending_threshold,
        }
    }
}

#[async_trait]
impl ItemProcessor for BillingDataProcessor {
    type Input = BillingData;
    type Output = ReportingData;

    async fn process(&self, item: &BillingData) -> Result<Option<ReportingData>> {
        if item.data_usage < 0.0 || item.call_duration < 0 || item.sms_count < 0 {
            return Err(BatchError::processing(format!(
                "negative usage for account {} in {}-{:02}",
                item.account_id, item.data_year, item.data_month
            )));
        }

        let billing_total = item.data_usage * self.pricing.data_pricing().await?
            + item.call_duration as f64 * self.pricing.call_pricing().await?
            + item.sms_count as f64 * self.pricing.sms_pricing().await?;

        if billing_total < self.spending_threshold {
            debug!(
                account_id = item.account_id,
                billing_total, "Below spending threshold, not reported"
            );
            return Ok(None);
        }

        Ok(Some(ReportingData::new(item.clone(), billing_total)))
    }
}
