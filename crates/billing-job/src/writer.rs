//! Batched inserts into the `billing_data` table

use async_trait::async_trait;
use batch_core::{ItemWriter, Result, SqliteConnection};
use sqlx::{QueryBuilder, Sqlite};

use crate::model::BillingData;

/// Rows per INSERT statement; 7 binds per row stays well below SQLite's
/// host parameter limit.
const MAX_ROWS_PER_INSERT: usize = 1000;

/// Inserts each chunk with multi-row INSERTs on the chunk's transaction
#[derive(Debug, Default)]
pub struct BillingDataTableWriter;

impl BillingDataTableWriter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ItemWriter for BillingDataTableWriter {
    type Item = BillingData;

    async fn write(&mut self, items: &[BillingData], conn: &mut SqliteConnection) -> Result<()> {
        for rows in items.chunks(MAX_ROWS_PER_INSERT) {
            let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO billing_data \
                 (data_year, data_month, account_id, phone_number, data_usage, call_duration, sms_count) ",
            );
            query.push_values(rows, |mut row, item| {
                row.push_bind(item.data_year)
                    .push_bind(item.data_month)
                    .push_bind(item.account_id)
                    .push_bind(item.phone_number.clone())
                    .push_bind(item.data_usage)
                    .push_bind(item.call_duration)
                    .push_bind(item.sms_count);
            });
            query.build().execute(&mut *conn).await?;
        }
        Ok(())
    }
}
