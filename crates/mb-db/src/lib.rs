//! mb-db
//!
//! Postgres persistence for the reconciliation pipeline: connection,
//! embedded migrations, the store traits and their Postgres implementation.

mod pg;
mod store;

pub use pg::PgStore;
pub use store::{
    ConfigStore, ExportStore, IdentityStore, LedgerKey, LockStore, MatchingStore,
    NewMerchantIdentifier, ReferenceStore, RetryStore, SequenceStore, SettlementOverride, Store,
    TransactionStore,
};

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub const ENV_DB_URL: &str = "MB_DATABASE_URL";

/// Connect to Postgres using the URL held in the environment variable
/// `url_env` (normally [`ENV_DB_URL`]).
pub async fn connect_from_env(url_env: &str, max_connections: u32) -> Result<PgPool> {
    let url =
        std::env::var(url_env).with_context(|| format!("missing env var {url_env}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='pending_exports'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_schema: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_schema: bool,
}

/// Detect a Postgres unique constraint violation by name.
pub(crate) fn is_unique_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.constraint() == Some(constraint),
        _ => false,
    }
}
