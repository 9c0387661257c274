//! One dedicated write connection plus a lazily filled pool of readers.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, warn};

use super::query;
use super::types::{OidTypes, Value};
use crate::config::ConnConfig;
use crate::sql::{AccessMode, Executor, QueryMode, ResultSet};
use crate::{Error, Result};

/// Opens a regular client connection and drives it on a background task.
pub(crate) async fn connect(conn: &ConnConfig) -> Result<Client> {
    let (client, connection) = conn.pg_config().connect(NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("Connection error: {}", e);
        }
    });
    Ok(client)
}

pub(crate) fn validate(conn: &ConnConfig, max_conns: usize) -> Result<()> {
    if max_conns < 2 {
        return Err(Error::Config(format!(
            "max_conns must be at least 2 (one writer, one reader), got {}",
            max_conns
        )));
    }
    if conn.user.is_empty() {
        return Err(Error::Config("postgres user must not be empty".to_string()));
    }
    Ok(())
}

struct Idle {
    client: Client,
    /// A read transaction was abandoned on this client.
    needs_rollback: bool,
}

pub struct Pool {
    conn: ConnConfig,
    oids: Arc<OidTypes>,
    writer: Client,
    idle: Mutex<Vec<Idle>>,
    permits: Semaphore,
}

impl Pool {
    /// Builds a pool around an already connected writer. Readers connect on
    /// first use, up to `max_conns - 1` of them.
    pub(crate) fn new(conn: ConnConfig, max_conns: usize, writer: Client, oids: Arc<OidTypes>) -> Result<Self> {
        validate(&conn, max_conns)?;
        Ok(Self {
            conn,
            oids,
            writer,
            idle: Mutex::new(Vec::new()),
            permits: Semaphore::new(max_conns - 1),
        })
    }

    pub fn oids(&self) -> &OidTypes {
        &self.oids
    }

    /// The write connection. Only the DB wrapper may use it.
    pub(crate) fn writer(&self) -> &Client {
        &self.writer
    }

    /// Executes a statement on the write connection, inside whatever
    /// transaction is open there.
    pub(crate) async fn execute_writer(&self, sql: &str, args: &[Value], mode: QueryMode) -> Result<ResultSet> {
        query::run(&self.writer, &self.oids, sql, args, mode).await
    }

    /// Runs a query in its own read-only, repeatable-read transaction.
    pub async fn query(&self, sql: &str, args: &[Value], mode: QueryMode) -> Result<ResultSet> {
        let tx = self.begin_read_tx().await?;
        let result = tx.run(sql, args, mode).await;
        match result {
            Ok(rs) => {
                tx.commit().await?;
                Ok(rs)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    debug!("Rollback after failed read: {}", rollback);
                }
                Err(e)
            }
        }
    }

    /// Starts a read-only, repeatable-read transaction on a pooled reader.
    pub async fn begin_read_tx(&self) -> Result<ReadTx<'_>> {
        let reader = self.acquire().await?;
        reader
            .client()?
            .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .await?;
        Ok(ReadTx {
            reader,
            done: false,
        })
    }

    async fn acquire(&self) -> Result<Reader<'_>> {
        let permit = self.permits.acquire().await.map_err(|_| Error::Shutdown)?;

        let idle = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop();
        let client = match idle {
            Some(idle) if !idle.client.is_closed() => {
                if idle.needs_rollback {
                    idle.client.batch_execute("ROLLBACK").await?;
                }
                idle.client
            }
            _ => {
                debug!("Opening reader connection");
                connect(&self.conn).await?
            }
        };

        Ok(Reader {
            pool: self,
            client: Some(client),
            dirty: false,
            _permit: permit,
        })
    }

    fn release(&self, client: Client, needs_rollback: bool) {
        if client.is_closed() {
            warn!("Discarding closed reader connection");
            return;
        }
        self.idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Idle { client, needs_rollback });
    }
}

/// A reader checked out of the pool. Returned on drop.
struct Reader<'a> {
    pool: &'a Pool,
    client: Option<Client>,
    dirty: bool,
    _permit: SemaphorePermit<'a>,
}

impl Reader<'_> {
    fn client(&self) -> Result<&Client> {
        // Only taken in drop.
        self.client.as_ref().ok_or(Error::Shutdown)
    }
}

impl Drop for Reader<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(client, self.dirty);
        }
    }
}

/// A read-only, repeatable-read transaction on a pooled reader. Sees a
/// consistent snapshot and never uncommitted writer state.
pub struct ReadTx<'a> {
    reader: Reader<'a>,
    done: bool,
}

impl ReadTx<'_> {
    pub async fn run(&self, sql: &str, args: &[Value], mode: QueryMode) -> Result<ResultSet> {
        query::run(self.reader.client()?, &self.reader.pool.oids, sql, args, mode).await
    }

    pub async fn commit(mut self) -> Result<()> {
        self.reader.client()?.batch_execute("COMMIT").await?;
        self.done = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        self.reader.client()?.batch_execute("ROLLBACK").await?;
        self.done = true;
        Ok(())
    }
}

impl Drop for ReadTx<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.reader.dirty = true;
        }
    }
}

#[async_trait]
impl Executor for ReadTx<'_> {
    async fn execute(&self, stmt: &str, args: &[Value]) -> Result<ResultSet> {
        self.run(stmt, args, QueryMode::Describe).await
    }

    async fn query(&self, stmt: &str, args: &[Value]) -> Result<ResultSet> {
        self.run(stmt, args, QueryMode::Describe).await
    }

    fn access_mode(&self) -> AccessMode {
        AccessMode::ReadOnly
    }
}
