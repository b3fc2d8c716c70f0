//! Billing database setup

use anyhow::{Context, Result};
use batch_core::JobRepository;
use sqlx::SqlitePool;

use crate::config::BillingConfig;

/// Open the ledger database and apply the billing schema next to it
pub async fn connect(config: &BillingConfig) -> Result<JobRepository> {
    let repository = JobRepository::connect(&config.database)
        .await
        .with_context(|| format!("Failed to open database {}", config.database.url))?;
    migrate(repository.pool()).await?;
    Ok(repository)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
        .run(pool)
        .await
        .context("Failed to apply billing migrations")?;
    Ok(())
}

pub async fn count_billing_rows(pool: &SqlitePool) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM billing_data")
        .fetch_one(pool)
        .await
        .context("Failed to count billing rows")?;
    Ok(count)
}
