//! Server compatibility checks and one-time setup run when a database handle
//! is opened.

use std::collections::HashMap;
use std::fmt;
use tokio_postgres::Client;
use tracing::{debug, info, warn};

use super::types::OidTypes;
use super::uint256::UINT256_DOMAIN;
use crate::sequence::INTERNAL_SCHEMA;
use crate::{Error, Result};

pub const REQUIRED_MAJOR: u32 = 16;
pub const MIN_MINOR: u32 = 1;

const REPLICA_IDENTITY_FUNCTION: &str = "set_replica_identity_full";
const REPLICA_IDENTITY_TRIGGER: &str = "ledger_replica_identity_full";

/// Checks the server version. Only one major release is supported because
/// WAL decoding output must not differ between nodes.
pub async fn check_version(client: &Client) -> Result<(u32, u32)> {
    let row = client.query_one("SHOW server_version_num", &[]).await?;
    let num: String = row.try_get(0)?;
    let (major, minor) = parse_version_num(&num)?;
    if major != REQUIRED_MAJOR || minor < MIN_MINOR {
        return Err(Error::Version {
            required_major: REQUIRED_MAJOR,
            required_minor: MIN_MINOR,
            major,
            minor,
        });
    }
    debug!("PostgreSQL server version {}.{}", major, minor);
    Ok((major, minor))
}

fn parse_version_num(num: &str) -> Result<(u32, u32)> {
    let num: u32 = num
        .trim()
        .parse()
        .map_err(|_| Error::ServerSettings(format!("invalid server_version_num {:?}", num)))?;
    Ok((num / 10000, num % 10000))
}

/// A rule a server setting must satisfy.
#[derive(Debug, Clone)]
pub enum Rule {
    ExactInt(i64),
    MinInt(i64),
    ExactStr(&'static str),
    OnOff(bool),
    AnyOf(Vec<Rule>),
}

impl Rule {
    pub fn check(&self, value: &str) -> bool {
        match self {
            Rule::ExactInt(want) => value.trim().parse::<i64>().map(|v| v == *want).unwrap_or(false),
            Rule::MinInt(min) => value.trim().parse::<i64>().map(|v| v >= *min).unwrap_or(false),
            Rule::ExactStr(want) => value.eq_ignore_ascii_case(want),
            Rule::OnOff(on) => match value.to_ascii_lowercase().as_str() {
                "on" | "true" | "yes" | "1" => *on,
                "off" | "false" | "no" | "0" => !*on,
                _ => false,
            },
            Rule::AnyOf(rules) => rules.iter().any(|r| r.check(value)),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::ExactInt(v) => write!(f, "{}", v),
            Rule::MinInt(v) => write!(f, ">= {}", v),
            Rule::ExactStr(v) => write!(f, "{}", v),
            Rule::OnOff(true) => f.write_str("on"),
            Rule::OnOff(false) => f.write_str("off"),
            Rule::AnyOf(rules) => {
                for (i, rule) in rules.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" or ")?;
                    }
                    write!(f, "{}", rule)?;
                }
                Ok(())
            }
        }
    }
}

/// Settings required for logical replication and for identical statement
/// behavior on every node.
pub fn required_settings() -> Vec<(&'static str, Rule)> {
    vec![
        ("wal_level", Rule::ExactStr("logical")),
        ("max_wal_senders", Rule::MinInt(10)),
        ("max_replication_slots", Rule::MinInt(10)),
        ("max_prepared_transactions", Rule::MinInt(2)),
        ("synchronous_commit", Rule::OnOff(true)),
        ("fsync", Rule::OnOff(true)),
        (
            "wal_sender_timeout",
            Rule::AnyOf(vec![Rule::ExactInt(0), Rule::MinInt(3_600_000)]),
        ),
        ("array_nulls", Rule::OnOff(true)),
        ("standard_conforming_strings", Rule::OnOff(true)),
        ("transform_null_equals", Rule::OnOff(false)),
        ("backslash_quote", Rule::ExactStr("safe_encoding")),
        ("server_encoding", Rule::ExactStr("UTF8")),
    ]
}

/// Returns a description of every setting that fails its rule.
pub fn validate_settings(settings: &HashMap<String, String>) -> Vec<String> {
    required_settings()
        .into_iter()
        .filter_map(|(name, rule)| match settings.get(name) {
            None => Some(format!("{}: not reported by server (want {})", name, rule)),
            Some(value) if !rule.check(value) => {
                Some(format!("{} = {} (want {})", name, value, rule))
            }
            Some(_) => None,
        })
        .collect()
}

pub async fn check_settings(client: &Client) -> Result<()> {
    let names: Vec<&str> = required_settings().iter().map(|(name, _)| *name).collect();
    let rows = client
        .query(
            "SELECT name, setting FROM pg_settings WHERE name = ANY($1)",
            &[&names],
        )
        .await?;
    let mut settings = HashMap::new();
    for row in rows {
        settings.insert(row.try_get::<_, String>(0)?, row.try_get::<_, String>(1)?);
    }

    let failures = validate_settings(&settings);
    if !failures.is_empty() {
        return Err(Error::ServerSettings(failures.join("; ")));
    }
    Ok(())
}

/// The connecting role must be a superuser: it creates event triggers,
/// publications and replication slots.
pub async fn check_role(client: &Client) -> Result<()> {
    let row = client
        .query_one(
            "SELECT rolname, rolsuper, rolreplication FROM pg_roles WHERE rolname = current_user",
            &[],
        )
        .await?;
    let name: String = row.try_get(0)?;
    let superuser: bool = row.try_get(1)?;
    let replication: bool = row.try_get(2)?;
    if !superuser {
        return Err(Error::ServerSettings(format!(
            "role {} must be a superuser (replication: {})",
            name, replication
        )));
    }
    Ok(())
}

/// Version, settings and role checks.
pub async fn verify_server(client: &Client) -> Result<()> {
    check_version(client).await?;
    check_settings(client).await?;
    check_role(client).await
}

pub(crate) async fn set_utc(client: &Client) -> Result<()> {
    client.batch_execute("SET TIME ZONE 'UTC'").await?;
    Ok(())
}

/// Rolls back prepared transactions left behind in this database. They hold
/// back WAL decoding until resolved.
pub(crate) async fn rollback_orphaned_prepared(client: &Client) -> Result<usize> {
    let rows = client
        .query(
            "SELECT gid FROM pg_prepared_xacts WHERE database = current_database()",
            &[],
        )
        .await?;
    for row in &rows {
        let gid: String = row.try_get(0)?;
        warn!("Rolling back orphaned prepared transaction {}", gid);
        client
            .batch_execute(&format!("ROLLBACK PREPARED {}", quote_literal(&gid)))
            .await?;
    }
    Ok(rows.len())
}

/// Installs an event trigger giving tables without a primary key
/// REPLICA IDENTITY FULL, so their UPDATE and DELETE records carry old tuples.
pub(crate) async fn ensure_replica_identity_trigger(client: &Client) -> Result<()> {
    client
        .batch_execute(&format!(
            r#"CREATE OR REPLACE FUNCTION {schema}.{function}() RETURNS event_trigger
LANGUAGE plpgsql AS $$
DECLARE
    obj record;
BEGIN
    FOR obj IN SELECT * FROM pg_event_trigger_ddl_commands() WHERE object_type = 'table'
    LOOP
        IF NOT EXISTS (
            SELECT 1 FROM pg_index WHERE indrelid = obj.objid AND (indisprimary OR indisreplident)
        ) THEN
            EXECUTE format('ALTER TABLE %s REPLICA IDENTITY FULL', obj.object_identity);
        END IF;
    END LOOP;
END;
$$;"#,
            schema = INTERNAL_SCHEMA,
            function = REPLICA_IDENTITY_FUNCTION,
        ))
        .await?;

    let exists = client
        .query_opt(
            "SELECT 1 FROM pg_event_trigger WHERE evtname = $1",
            &[&REPLICA_IDENTITY_TRIGGER],
        )
        .await?
        .is_some();
    if !exists {
        client
            .batch_execute(&format!(
                "CREATE EVENT TRIGGER {trigger} ON ddl_command_end
                 WHEN TAG IN ('CREATE TABLE', 'CREATE TABLE AS', 'SELECT INTO')
                 EXECUTE FUNCTION {schema}.{function}()",
                trigger = REPLICA_IDENTITY_TRIGGER,
                schema = INTERNAL_SCHEMA,
                function = REPLICA_IDENTITY_FUNCTION,
            ))
            .await?;
        info!("Created event trigger {}", REPLICA_IDENTITY_TRIGGER);
    }
    Ok(())
}

pub(crate) async fn ensure_publication(client: &Client, publication: &str) -> Result<()> {
    let exists = client
        .query_opt("SELECT 1 FROM pg_publication WHERE pubname = $1", &[&publication])
        .await?
        .is_some();
    if !exists {
        client
            .batch_execute(&format!(
                "CREATE PUBLICATION {} FOR ALL TABLES",
                quote_ident(publication)
            ))
            .await?;
        info!("Created publication {}", publication);
    }
    Ok(())
}

/// Creates the uint256 domain if needed and returns the type map with its
/// OIDs resolved for this database.
pub(crate) async fn ensure_uint256(client: &Client) -> Result<OidTypes> {
    let lookup = "SELECT t.oid, t.typarray FROM pg_type t
                  JOIN pg_namespace n ON n.oid = t.typnamespace
                  WHERE t.typname = $1 AND n.nspname = 'public'";

    let mut row = client.query_opt(lookup, &[&UINT256_DOMAIN]).await?;
    if row.is_none() {
        client
            .batch_execute(&format!(
                "CREATE DOMAIN public.{} AS NUMERIC(78) CHECK (VALUE >= 0 AND VALUE < 2::numeric ^ 256)",
                UINT256_DOMAIN
            ))
            .await?;
        info!("Created domain {}", UINT256_DOMAIN);
        row = client.query_opt(lookup, &[&UINT256_DOMAIN]).await?;
    }

    let row = row.ok_or_else(|| Error::ServerSettings(format!("domain {} not found", UINT256_DOMAIN)))?;
    let oid: u32 = row.try_get(0)?;
    let array_oid: u32 = row.try_get(1)?;
    debug!(oid, array_oid, "Resolved {} type", UINT256_DOMAIN);
    Ok(OidTypes::new(oid, array_oid))
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}
