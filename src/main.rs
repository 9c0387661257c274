use anyhow::Context;
use clap::{Parser, Subcommand};
use pg_ledger::changeset::Tuple;
use pg_ledger::sequence::{INTERNAL_SCHEMA, SENTRY_TABLE};
use pg_ledger::{deserialize_changeset, ChangesetGroup, Config, Db, Executor};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-ledger")]
#[command(about = "Single-writer PostgreSQL with deterministic commit IDs", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify the server, initialize internal tables and print the current sequence.
    Check,
    /// Run statements in one write transaction and print its commit ID.
    Exec {
        /// SQL statements, executed in order.
        #[arg(required = true)]
        statements: Vec<String>,

        /// Write the captured changeset to this file.
        #[arg(long, value_name = "FILE")]
        changeset_out: Option<PathBuf>,
    },
    /// Print a changeset file as JSON.
    DecodeChangeset {
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    match args.command {
        Command::DecodeChangeset { file } => {
            let data = std::fs::read(&file).with_context(|| format!("reading {:?}", file))?;
            let group = deserialize_changeset(&data)?;
            println!("{}", serde_json::to_string_pretty(&changeset_json(&group)?)?);
            Ok(())
        }
        Command::Check => {
            let db = open(&args.config).await?;
            let seq = db
                .query_pending(&format!("SELECT seq FROM {}.{}", INTERNAL_SCHEMA, SENTRY_TABLE), &[])
                .await?;
            println!("{}", json!({ "sequence": seq.scalar()? }));
            db.close().await?;
            Ok(())
        }
        Command::Exec {
            statements,
            changeset_out,
        } => {
            let db = open(&args.config).await?;
            let tx = db.begin_tx().await?;
            for stmt in &statements {
                let result = tx.execute(stmt, &[]).await?;
                info!(rows_affected = result.status.rows_affected, "{}", stmt);
            }
            let commit_id = tx.commit().await?.context("outer transaction has no commit ID")?;
            println!(
                "{}",
                json!({ "seq": commit_id.seq, "hash": hex::encode(commit_id.hash) })
            );

            if let Some(path) = changeset_out {
                match db.last_changeset().await {
                    Some(changeset) => std::fs::write(&path, changeset)
                        .with_context(|| format!("writing {:?}", path))?,
                    None => warn!("changeset capture is disabled, nothing written"),
                }
            }
            db.close().await?;
            Ok(())
        }
    }
}

async fn open(path: &Path) -> anyhow::Result<Db> {
    info!("Loading configuration from {:?}", path);
    let config = Config::from_file(path)?;

    info!(
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        publication = %config.replication.publication,
        "Configuration summary"
    );

    Ok(Db::new(config.db_config()).await?)
}

fn changeset_json(group: &ChangesetGroup) -> anyhow::Result<serde_json::Value> {
    let mut out = Vec::with_capacity(group.changesets.len());
    for cs in &group.changesets {
        let decode = |t: &Tuple| cs.decode_tuple(t);
        let inserts = cs.inserts.iter().map(decode).collect::<pg_ledger::Result<Vec<_>>>()?;
        let deletes = cs.deletes.iter().map(decode).collect::<pg_ledger::Result<Vec<_>>>()?;
        let mut updates = Vec::with_capacity(cs.updates.len());
        for (old, new) in &cs.updates {
            updates.push(json!({ "old": decode(old)?, "new": decode(new)? }));
        }
        let columns: Vec<_> = cs
            .columns
            .iter()
            .map(|c| json!({ "name": c.name, "type": c.data_type.to_string() }))
            .collect();

        out.push(json!({
            "schema": cs.schema,
            "table": cs.table,
            "columns": columns,
            "inserts": inserts,
            "updates": updates,
            "deletes": deletes,
        }));
    }
    Ok(serde_json::Value::Array(out))
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_ledger=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pg_ledger=info,warn"))
    };

    // Logs go to stderr so command output on stdout stays parseable.
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
