//! Billing records

use serde::{Deserialize, Serialize, Serializer};

/// One month of usage for one subscriber line.
///
/// Field order matches the input feed and the `billing_data` columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingData {
    pub data_year: i32,
    pub data_month: i32,
    pub account_id: i64,
    pub phone_number: String,
    pub data_usage: f64,
    pub call_duration: i64,
    pub sms_count: i64,
}

/// A billing record with its computed charge
#[derive(Debug, Clone, PartialEq)]
pub struct ReportingData {
    pub billing_data: BillingData,
    pub billing_total: f64,
}

impl ReportingData {
    /// `billing_total` is rounded to cents
    pub fn new(billing_data: BillingData, billing_total: f64) -> Self {
        Self {
            billing_data,
            billing_total: (billing_total * 100.0).round() / 100.0,
        }
    }
}

// Flattened to a single report line: the input fields followed by the total
impl Serialize for ReportingData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let data = &self.billing_data;
        (
            data.data_year,
            data.data_month,
            data.account_id,
            &data.phone_number,
            data.data_usage,
            data.call_duration,
            data.sms_count,
            self.billing_total,
        )
            .serialize(serializer)
    }
}
