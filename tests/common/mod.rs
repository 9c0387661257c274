#![allow(dead_code)]

use pg_ledger::config::{ConnConfig, ReplicationConfig};
use pg_ledger::{Db, DbConfig};
use std::env;
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::{Client, NoTls};

/// Live tests share one sentry table, so only one `Db` may run at a time.
static SERIAL: Mutex<()> = Mutex::const_new(());

pub async fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().await
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("pg_ledger=debug,info")
        .try_init()
        .ok();
}

/// Get test connection settings from environment variables
pub fn conn_config() -> ConnConfig {
    ConnConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        user: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        connect_timeout_secs: 30,
    }
}

pub fn db_config() -> DbConfig {
    let mut config = DbConfig::new(conn_config());
    config.max_conns = 4;
    config.replication = ReplicationConfig {
        publication: format!("test_publication_{}", std::process::id()),
        keepalive_interval_secs: 1,
        ..ReplicationConfig::default()
    };
    config
}

pub async fn open_db() -> Db {
    Db::new(db_config()).await.expect("open db")
}

/// A plain client, for writes the `Db` does not track.
pub async fn raw_client() -> Client {
    let (client, connection) = conn_config()
        .pg_config()
        .connect(NoTls)
        .await
        .expect("connect");
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// Drops and recreates a tracked schema holding `accounts(id INT8 PRIMARY KEY, owner TEXT)`.
pub async fn reset_schema(client: &Client, schema: &str) {
    client
        .batch_execute(&format!(
            "DROP SCHEMA IF EXISTS {schema} CASCADE;
             CREATE SCHEMA {schema};
             CREATE TABLE {schema}.accounts (id INT8 PRIMARY KEY, owner TEXT);"
        ))
        .await
        .expect("reset schema");
}
