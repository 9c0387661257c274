use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::capture::{prefix_schema_filter, SchemaFilter};
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: ConnConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

/// Connection parameters shared by the writer, the readers and the
/// replication connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSettings {
    /// Total connections: one writer plus `max_conns - 1` readers.
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_publication")]
    pub publication: String,
    /// Temporary slot name. Generated when not set.
    #[serde(default)]
    pub slot_name: Option<String>,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    /// Schemas starting with this prefix are hashed and captured.
    #[serde(default = "default_schema_filter_prefix")]
    pub schema_filter_prefix: String,
    #[serde(default = "default_capture_changesets")]
    pub capture_changesets: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_conns: default_max_conns(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            publication: default_publication(),
            slot_name: None,
            keepalive_interval_secs: default_keepalive_interval_secs(),
            schema_filter_prefix: default_schema_filter_prefix(),
            capture_changesets: default_capture_changesets(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_LEDGER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))
    }

    pub fn db_config(&self) -> DbConfig {
        DbConfig {
            conn: self.postgres.clone(),
            max_conns: self.pool.max_conns,
            replication: self.replication.clone(),
            schema_filter: None,
        }
    }
}

impl ConnConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Client configuration for regular (non-replication) connections.
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut cfg = tokio_postgres::Config::new();
        cfg.host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.database)
            .application_name("pg-ledger")
            .connect_timeout(self.connect_timeout());
        if !self.password.is_empty() {
            cfg.password(&self.password);
        }
        cfg
    }
}

impl ReplicationConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn slot_name(&self) -> String {
        match &self.slot_name {
            Some(name) => name.clone(),
            None => {
                let id = uuid::Uuid::new_v4().simple().to_string();
                format!("ledger_{}", &id[..12])
            }
        }
    }
}

/// Everything needed to open a [`Db`](crate::Db).
#[derive(Clone)]
pub struct DbConfig {
    pub conn: ConnConfig,
    pub max_conns: usize,
    pub replication: ReplicationConfig,
    /// Overrides the prefix filter from `replication.schema_filter_prefix`.
    pub schema_filter: Option<SchemaFilter>,
}

impl DbConfig {
    pub fn new(conn: ConnConfig) -> Self {
        Self {
            conn,
            max_conns: default_max_conns(),
            replication: ReplicationConfig::default(),
            schema_filter: None,
        }
    }

    pub fn schema_filter(&self) -> SchemaFilter {
        self.schema_filter
            .clone()
            .unwrap_or_else(|| prefix_schema_filter(self.replication.schema_filter_prefix.clone()))
    }
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("conn", &self.conn)
            .field("max_conns", &self.max_conns)
            .field("replication", &self.replication)
            .field("schema_filter", &self.schema_filter.as_ref().map(|_| "custom"))
            .finish()
    }
}

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_max_conns() -> usize {
    10
}

fn default_publication() -> String {
    "ledger_repl".to_string()
}

fn default_keepalive_interval_secs() -> u64 {
    10
}

fn default_schema_filter_prefix() -> String {
    "ds_".to_string()
}

fn default_capture_changesets() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_from_file_with_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[postgres]
host = "db.internal"
user = "ledger"
database = "chain"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.postgres.host, "db.internal");
        assert_eq!(config.postgres.port, 5432);
        assert_eq!(config.postgres.password, "");
        assert_eq!(config.postgres.connect_timeout_secs, 30);
        assert_eq!(config.pool.max_conns, 10);
        assert_eq!(config.replication.publication, "ledger_repl");
        assert_eq!(config.replication.keepalive_interval_secs, 10);
        assert_eq!(config.replication.schema_filter_prefix, "ds_");
        assert!(config.replication.capture_changesets);
        assert!(config.replication.slot_name.is_none());
    }

    #[test]
    fn test_from_file_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[postgres]
host = "localhost"
port = 5433
user = "ledger"
password = "secret"
database = "chain"

[pool]
max_conns = 4

[replication]
publication = "custom_pub"
slot_name = "fixed_slot"
schema_filter_prefix = "app_"
capture_changesets = false
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.postgres.port, 5433);
        assert_eq!(config.pool.max_conns, 4);
        assert_eq!(config.replication.slot_name(), "fixed_slot");
        assert!(!config.replication.capture_changesets);

        let db = config.db_config();
        let filter = db.schema_filter();
        assert!(filter("app_one"));
        assert!(!filter("ds_one"));
    }

    #[test]
    fn test_missing_required_field() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[postgres]\nhost = \"localhost\"").unwrap();
        assert!(matches!(Config::from_file(file.path()), Err(Error::Config(_))));
    }

    #[test]
    fn test_generated_slot_name() {
        let repl = ReplicationConfig::default();
        let a = repl.slot_name();
        let b = repl.slot_name();
        assert!(a.starts_with("ledger_"));
        assert_eq!(a.len(), "ledger_".len() + 12);
        assert_ne!(a, b);
    }

    #[test]
    fn test_custom_schema_filter() {
        let mut db = DbConfig::new(ConnConfig {
            host: "localhost".to_string(),
            port: 5432,
            user: "u".to_string(),
            password: String::new(),
            database: "d".to_string(),
            connect_timeout_secs: 1,
        });
        assert!(db.schema_filter()("ds_x"));
        db.schema_filter = Some(std::sync::Arc::new(|s: &str| s == "public"));
        assert!(db.schema_filter()("public"));
        assert!(!db.schema_filter()("ds_x"));
        assert_eq!(format!("{:?}", db).contains("custom"), true);
    }
}
