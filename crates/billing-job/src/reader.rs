//! Paged reader over the `billing_data` table

use async_trait::async_trait;
use batch_core::{ItemReader, Result};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::VecDeque;
use tracing::debug;

use crate::model::BillingData;

/// Billing period filter: (year, month)
pub type BillingPeriod = (i32, i32);

/// Reads `billing_data` rows in insertion order, one page at a time.
///
/// Without a period every row in the table is read, including rows loaded
/// by earlier job instances sharing the database.
///
/// No connection is held between pages, so the chunk transaction never
/// waits on the reader. The position is a row offset, which makes restarts a
/// matter of skipping to the committed offset.
pub struct BillingDataTableReader {
    pool: SqlitePool,
    period: Option<BillingPeriod>,
    page_size: usize,
    offset: u64,
    page: VecDeque<BillingData>,
    exhausted: bool,
}

impl BillingDataTableReader {
    pub fn new(pool: SqlitePool, period: Option<BillingPeriod>, page_size: usize) -> Self {
        Self {
            pool,
            period,
            page_size: page_size.max(1),
            offset: 0,
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT data_year, data_month, account_id, phone_number, data_usage, call_duration, sms_count \
             FROM billing_data",
        );
        if let Some((year, month)) = self.period {
            query
                .push(" WHERE data_year = ")
                .push_bind(year)
                .push(" AND data_month = ")
                .push_bind(month);
        }
        query
            .push(" ORDER BY id LIMIT ")
            .push_bind(self.page_size as i64)
            .push(" OFFSET ")
            .push_bind(self.offset as i64);

        let rows: Vec<BillingData> = query.build_query_as().fetch_all(&self.pool).await?;
        debug!(offset = self.offset, rows = rows.len(), "Fetched billing page");

        self.exhausted = rows.len() < self.page_size;
        self.page.extend(rows);
        Ok(())
    }
}

#[async_trait]
impl ItemReader for BillingDataTableReader {
    type Item = BillingData;

    async fn read(&mut self) -> Result<Option<BillingData>> {
        if self.page.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }

        let item = self.page.pop_front();
        if item.is_some() {
            self.offset += 1;
        }
        Ok(item)
    }

    async fn jump_to_item(&mut self, offset: u64) -> Result<()> {
        self.page.clear();
        self.exhausted = false;
        self.offset = offset;
        Ok(())
    }
}
