//! The sentry table: a single row holding the sequence number of the last
//! tracked commit. Every tracked write transaction increments it exactly once,
//! and the replication monitor recognizes the increment in the WAL stream.

use tokio_postgres::Client;
use tracing::{debug, info};

use crate::{Error, Result};

/// Schema holding the sentry and key-value tables. Nothing else may write here.
pub const INTERNAL_SCHEMA: &str = "ledger_internal";
pub const SENTRY_TABLE: &str = "sentry";
pub const KV_TABLE: &str = "kv";

/// Creates the internal schema and tables, seeding the sentry row with 0.
pub(crate) async fn ensure_internal_tables(client: &Client) -> Result<()> {
    client
        .batch_execute(&format!(
            "CREATE SCHEMA IF NOT EXISTS {schema};
             CREATE TABLE IF NOT EXISTS {schema}.{sentry} (seq INT8 NOT NULL);
             ALTER TABLE {schema}.{sentry} REPLICA IDENTITY FULL;
             CREATE TABLE IF NOT EXISTS {schema}.{kv} (k BYTEA PRIMARY KEY, v BYTEA NOT NULL);",
            schema = INTERNAL_SCHEMA,
            sentry = SENTRY_TABLE,
            kv = KV_TABLE,
        ))
        .await?;

    let seeded = client
        .execute(
            &format!(
                "INSERT INTO {schema}.{sentry} (seq) SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM {schema}.{sentry})",
                schema = INTERNAL_SCHEMA,
                sentry = SENTRY_TABLE,
            ),
            &[],
        )
        .await?;
    if seeded > 0 {
        info!("Initialized {}.{} sequence", INTERNAL_SCHEMA, SENTRY_TABLE);
    }
    Ok(())
}

/// Reads the current sequence.
pub(crate) async fn current_seq(client: &Client) -> Result<i64> {
    let row = client
        .query_one(
            &format!("SELECT seq FROM {}.{}", INTERNAL_SCHEMA, SENTRY_TABLE),
            &[],
        )
        .await?;
    Ok(row.try_get(0)?)
}

/// Increments the sequence inside the caller's open transaction and returns
/// the new value.
pub(crate) async fn increment_seq(client: &Client) -> Result<i64> {
    let seq = current_seq(client).await? + 1;
    let affected = client
        .execute(
            &format!("UPDATE {}.{} SET seq = $1", INTERNAL_SCHEMA, SENTRY_TABLE),
            &[&seq],
        )
        .await?;
    if affected != 1 {
        return Err(Error::Invariant(format!(
            "sentry update affected {} rows, expected 1",
            affected
        )));
    }
    debug!(seq, "updated sequence");
    Ok(seq)
}

/// True if the relation is the sentry table.
pub fn is_sentry(schema: &str, table: &str) -> bool {
    schema == INTERNAL_SCHEMA && table == SENTRY_TABLE
}
