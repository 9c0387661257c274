//! The single-writer database handle.
//!
//! At most one write transaction is open per [`Db`]. Committing the outermost
//! transaction increments the sentry sequence inside it, asks the replication
//! monitor for that sequence's commit ID, commits, and then waits until the
//! monitor has seen the transaction in the WAL stream:
//!
//! ```text
//! begin_tx ─▶ execute* ─▶ commit ─▶ increment seq ─▶ recv_id(seq) ─▶ COMMIT ─▶ wait
//! ```
//!
//! Nested [`Transaction::begin_tx`] calls create savepoints, so a failed inner
//! unit of work can be rolled back without aborting the outer transaction.

use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::capture::CommitId;
use crate::config::DbConfig;
use crate::monitor::{CommitReceiver, Committed, MonitorExit, ReplicationMonitor};
use crate::postgres::pool::{self, Pool, ReadTx};
use crate::postgres::system;
use crate::postgres::types::Value;
use crate::sequence::{self, INTERNAL_SCHEMA, KV_TABLE};
use crate::sql::{AccessMode, Executor, QueryMode, ResultSet};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpenTx {
    id: u64,
    /// Savepoint depth. 0 is the outer transaction.
    depth: usize,
}

#[derive(Debug, Default)]
struct WriterState {
    tx: Option<OpenTx>,
    auto_commit: bool,
    last_commit: Option<Committed>,
    next_tx_id: u64,
}

/// A rollback owed by a transaction handle dropped without commit or rollback.
#[derive(Debug, Clone, Copy)]
struct Cleanup {
    tx_id: u64,
    depth: usize,
}

pub struct Db {
    pool: Pool,
    monitor: ReplicationMonitor,
    state: Mutex<WriterState>,
    cleanup: StdMutex<Vec<Cleanup>>,
}

impl Db {
    /// Validates the server, prepares the internal schema, connects the pool
    /// and starts the replication monitor.
    pub async fn new(config: DbConfig) -> Result<Self> {
        pool::validate(&config.conn, config.max_conns)?;

        let writer = pool::connect(&config.conn).await?;
        system::verify_server(&writer).await?;
        system::set_utc(&writer).await?;
        let orphans = system::rollback_orphaned_prepared(&writer).await?;
        if orphans > 0 {
            warn!("Rolled back {} orphaned prepared transactions", orphans);
        }
        sequence::ensure_internal_tables(&writer).await?;
        system::ensure_replica_identity_trigger(&writer).await?;
        system::ensure_publication(&writer, &config.replication.publication).await?;
        let oids = Arc::new(system::ensure_uint256(&writer).await?);
        let seq = sequence::current_seq(&writer).await?;

        let pool = Pool::new(config.conn.clone(), config.max_conns, writer, oids.clone())?;
        let monitor =
            ReplicationMonitor::start(&config.conn, &config.replication, config.schema_filter(), oids).await?;

        info!(seq, "Database ready");
        Ok(Self {
            pool,
            monitor,
            state: Mutex::new(WriterState::default()),
            cleanup: StdMutex::new(Vec::new()),
        })
    }

    /// Opens the write transaction. Fails if one is already open or if
    /// auto-commit is on.
    pub async fn begin_tx(&self) -> Result<Transaction<'_>> {
        let mut state = self.lock().await?;
        if state.auto_commit {
            return Err(Error::AutoCommit);
        }
        let id = self.begin_locked(&mut state).await?;
        Ok(Transaction::new(self, id, 0))
    }

    /// Enables or disables auto-commit. Only allowed with no transaction open.
    pub async fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        let mut state = self.lock().await?;
        if state.tx.is_some() {
            return Err(Error::TransactionExists);
        }
        state.auto_commit = auto_commit;
        Ok(())
    }

    pub async fn auto_commit(&self) -> bool {
        self.state.lock().await.auto_commit
    }

    /// Executes a statement in the open transaction, or in its own tracked
    /// transaction when auto-commit is on.
    pub async fn execute_with(&self, mode: QueryMode, sql: &str, args: &[Value]) -> Result<ResultSet> {
        let mut state = self.lock().await?;
        if state.tx.is_some() {
            return self.pool.execute_writer(sql, args, mode).await;
        }
        if !state.auto_commit {
            return Err(Error::NoTransaction);
        }

        let id = self.begin_locked(&mut state).await?;
        let tx = Transaction::new(self, id, 0);
        let result = tx.execute_locked(&mut state, mode, sql, args).await;
        let result = match result {
            Ok(rs) => rs,
            Err(e) => {
                tx.rollback_locked(&mut state).await?;
                return Err(e);
            }
        };
        let id = tx.commit_outer_locked(&mut state, std::future::pending::<()>()).await?;
        debug!(seq = id.seq, "Auto-committed statement");
        Ok(result)
    }

    /// Reads through the write connection, seeing the open transaction's
    /// uncommitted changes. With no transaction open the query runs on the
    /// read pool, so it can never commit on the writer outside the sequence.
    pub async fn query_pending(&self, sql: &str, args: &[Value]) -> Result<ResultSet> {
        let state = self.lock().await?;
        if state.tx.is_none() {
            drop(state);
            return self.pool.query(sql, args, QueryMode::Describe).await;
        }
        self.pool.execute_writer(sql, args, QueryMode::Describe).await
    }

    /// Runs a read query on the read pool.
    pub async fn query_with(&self, mode: QueryMode, sql: &str, args: &[Value]) -> Result<ResultSet> {
        self.pool.query(sql, args, mode).await
    }

    /// A read-only, repeatable-read transaction for several consistent reads.
    pub async fn begin_read_tx(&self) -> Result<ReadTx<'_>> {
        self.pool.begin_read_tx().await
    }

    pub async fn kv_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let rs = self
            .pool
            .query(
                &format!("SELECT v FROM {}.{} WHERE k = $1", INTERNAL_SCHEMA, KV_TABLE),
                &[Value::from(key)],
                QueryMode::Describe,
            )
            .await?;
        match rs.scalar() {
            Ok(Value::Blob(v)) => Ok(Some(v.clone())),
            Ok(other) => Err(Error::Codec(format!("unexpected kv value {}", other))),
            Err(Error::NoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The commit ID of the last committed transaction. Cleared when the next
    /// transaction begins.
    pub async fn last_commit_id(&self) -> Option<CommitId> {
        self.state.lock().await.last_commit.as_ref().map(|c| c.id)
    }

    /// The serialized changeset of the last committed transaction.
    pub async fn last_changeset(&self) -> Option<Vec<u8>> {
        self.state
            .lock()
            .await
            .last_commit
            .as_ref()
            .and_then(|c| c.changeset.clone())
    }

    /// Resolves when the replication monitor stops. The handle is unusable
    /// for writes afterwards.
    pub fn done(&self) -> impl Future<Output = MonitorExit> + Send + 'static {
        self.monitor.done()
    }

    /// Why the replication monitor failed, if it has.
    pub fn err(&self) -> Option<String> {
        self.monitor.err()
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Rolls back any open transaction and stops the replication monitor.
    pub async fn close(self) -> Result<()> {
        let Db {
            pool,
            mut monitor,
            state,
            ..
        } = self;
        if state.into_inner().tx.is_some() {
            warn!("Closing with an open transaction, rolling back");
            pool.writer().batch_execute("ROLLBACK").await?;
        }
        monitor.stop().await;
        Ok(())
    }

    /// Locks the writer state and runs rollbacks owed by dropped transactions.
    async fn lock(&self) -> Result<MutexGuard<'_, WriterState>> {
        let mut state = self.state.lock().await;
        self.drain_cleanup(&mut state).await?;
        Ok(state)
    }

    async fn drain_cleanup(&self, state: &mut WriterState) -> Result<()> {
        let pending = std::mem::take(&mut *self.cleanup.lock().unwrap_or_else(|e| e.into_inner()));
        for cleanup in pending {
            let open = match state.tx.as_mut() {
                Some(open) if open.id == cleanup.tx_id && open.depth >= cleanup.depth => open,
                _ => continue,
            };
            if cleanup.depth == 0 {
                debug!("Rolling back abandoned transaction");
                state.tx = None;
                self.pool.writer().batch_execute("ROLLBACK").await?;
            } else {
                debug!(depth = cleanup.depth, "Rolling back abandoned savepoint");
                open.depth = cleanup.depth - 1;
                self.pool
                    .writer()
                    .batch_execute(&rollback_savepoint_sql(cleanup.depth))
                    .await?;
            }
        }
        Ok(())
    }

    fn defer_rollback(&self, cleanup: Cleanup) {
        self.cleanup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(cleanup);
    }

    fn ensure_running(&self) -> Result<()> {
        match self.monitor.exit_status() {
            None => Ok(()),
            Some(MonitorExit::Failed(e)) => Err(Error::ReplicationInterrupted(e)),
            Some(MonitorExit::Stopped) => Err(Error::ReplicationInterrupted(
                "replication monitor stopped".to_string(),
            )),
        }
    }

    async fn begin_locked(&self, state: &mut WriterState) -> Result<u64> {
        if state.tx.is_some() {
            return Err(Error::TransactionExists);
        }
        self.ensure_running()?;

        self.pool
            .writer()
            .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ WRITE")
            .await?;
        state.last_commit = None;
        state.next_tx_id += 1;
        let id = state.next_tx_id;
        state.tx = Some(OpenTx { id, depth: 0 });
        Ok(id)
    }

    /// Waits for the monitor to report the commit for `seq`, the monitor to
    /// stop, or `cancel` to complete, whichever comes first.
    async fn await_commit<F>(&self, seq: i64, receiver: CommitReceiver, cancel: F) -> Result<Committed>
    where
        F: Future,
    {
        tokio::select! {
            result = receiver => match result {
                Ok(committed) => Ok(committed),
                Err(_) => {
                    let reason = match self.monitor.done().await {
                        MonitorExit::Failed(e) => e,
                        MonitorExit::Stopped => "replication monitor stopped".to_string(),
                    };
                    warn!(seq, "No commit ID: {}", reason);
                    Err(Error::ReplicationInterrupted(reason))
                }
            },
            _ = cancel => {
                warn!(seq, "Commit wait cancelled, the commit may have succeeded without a confirmed commit ID");
                Err(Error::CommitUnconfirmed)
            }
        }
    }
}

#[async_trait]
impl Executor for Db {
    async fn execute(&self, stmt: &str, args: &[Value]) -> Result<ResultSet> {
        self.execute_with(QueryMode::Describe, stmt, args).await
    }

    async fn query(&self, stmt: &str, args: &[Value]) -> Result<ResultSet> {
        self.query_with(QueryMode::Describe, stmt, args).await
    }

    fn access_mode(&self) -> AccessMode {
        AccessMode::ReadWrite
    }
}

fn savepoint_name(depth: usize) -> String {
    format!("sp_{}", depth)
}

fn rollback_savepoint_sql(depth: usize) -> String {
    let name = savepoint_name(depth);
    format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}")
}

/// The write transaction, or a savepoint within it.
///
/// Dropping a transaction without committing or rolling back rolls it back
/// before the next write operation on the [`Db`].
pub struct Transaction<'a> {
    db: &'a Db,
    tx_id: u64,
    depth: usize,
    finished: bool,
}

impl<'a> Transaction<'a> {
    fn new(db: &'a Db, tx_id: u64, depth: usize) -> Self {
        Self {
            db,
            tx_id,
            depth,
            finished: false,
        }
    }

    /// Savepoint depth, 0 for the outer transaction.
    pub fn depth(&self) -> usize {
        self.depth
    }

    fn check(&self, state: &WriterState) -> Result<()> {
        match state.tx {
            Some(open) if open.id == self.tx_id && open.depth == self.depth => Ok(()),
            _ => Err(Error::NoTransaction),
        }
    }

    pub async fn execute_with(&self, mode: QueryMode, sql: &str, args: &[Value]) -> Result<ResultSet> {
        let mut state = self.db.lock().await?;
        self.execute_locked(&mut state, mode, sql, args).await
    }

    async fn execute_locked(
        &self,
        state: &mut WriterState,
        mode: QueryMode,
        sql: &str,
        args: &[Value],
    ) -> Result<ResultSet> {
        self.check(state)?;
        self.db.pool.execute_writer(sql, args, mode).await
    }

    /// Opens a savepoint nested in this transaction.
    pub async fn begin_tx(&mut self) -> Result<Transaction<'_>> {
        let mut state = self.db.lock().await?;
        self.check(&state)?;
        let depth = self.depth + 1;
        self.db
            .pool
            .writer()
            .batch_execute(&format!("SAVEPOINT {}", savepoint_name(depth)))
            .await?;
        if let Some(open) = state.tx.as_mut() {
            open.depth = depth;
        }
        Ok(Transaction::new(self.db, self.tx_id, depth))
    }

    /// Commits. For the outer transaction this returns the commit ID once the
    /// replication monitor has seen it; savepoints are released and return
    /// `None`.
    pub async fn commit(self) -> Result<Option<CommitId>> {
        self.commit_until(std::future::pending::<()>()).await
    }

    /// Like [`commit`](Self::commit), but stops waiting for the commit ID when
    /// `cancel` completes.
    ///
    /// If the wait is cancelled the result is [`Error::CommitUnconfirmed`]:
    /// postgres has already committed, but no commit ID was confirmed. Callers
    /// must not assume the write did not happen.
    pub async fn commit_until<F>(self, cancel: F) -> Result<Option<CommitId>>
    where
        F: Future,
    {
        let db = self.db;
        let mut state = db.lock().await?;
        if self.depth > 0 {
            self.check(&state)?;
            let mut this = self;
            this.finished = true;
            db.pool
                .writer()
                .batch_execute(&format!("RELEASE SAVEPOINT {}", savepoint_name(this.depth)))
                .await?;
            if let Some(open) = state.tx.as_mut() {
                open.depth = this.depth - 1;
            }
            return Ok(None);
        }
        self.commit_outer_locked(&mut state, cancel).await.map(Some)
    }

    async fn commit_outer_locked<F>(mut self, state: &mut WriterState, cancel: F) -> Result<CommitId>
    where
        F: Future,
    {
        self.check(state)?;
        let db = self.db;
        let writer = db.pool.writer();

        let seq = match sequence::increment_seq(writer).await {
            Ok(seq) => seq,
            Err(e) => {
                self.rollback_locked(state).await?;
                return Err(e);
            }
        };
        let receiver = db.monitor.recv_id(seq);

        self.finished = true;
        state.tx = None;
        writer.batch_execute("COMMIT").await?;
        debug!(seq, "Committed, waiting for commit ID");

        let committed = db.await_commit(seq, receiver, cancel).await?;
        let id = committed.id;
        state.last_commit = Some(committed);
        Ok(id)
    }

    /// Rolls back this transaction or savepoint.
    pub async fn rollback(self) -> Result<()> {
        let mut state = self.db.lock().await?;
        self.rollback_locked(&mut state).await
    }

    async fn rollback_locked(mut self, state: &mut WriterState) -> Result<()> {
        self.finished = true;
        // Already ended, e.g. by an enclosing rollback.
        if self.check(state).is_err() {
            return Ok(());
        }
        let writer = self.db.pool.writer();
        if self.depth == 0 {
            state.tx = None;
            writer.batch_execute("ROLLBACK").await?;
        } else {
            if let Some(open) = state.tx.as_mut() {
                open.depth = self.depth - 1;
            }
            writer.batch_execute(&rollback_savepoint_sql(self.depth)).await?;
        }
        Ok(())
    }

    /// Stores a value in the internal key-value table.
    pub async fn kv_set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.execute_with(
            QueryMode::Describe,
            &format!(
                "INSERT INTO {}.{} (k, v) VALUES ($1, $2) ON CONFLICT (k) DO UPDATE SET v = EXCLUDED.v",
                INTERNAL_SCHEMA, KV_TABLE
            ),
            &[Value::from(key), Value::from(value)],
        )
        .await?;
        Ok(())
    }

    pub async fn kv_delete(&self, key: &[u8]) -> Result<()> {
        self.execute_with(
            QueryMode::Describe,
            &format!("DELETE FROM {}.{} WHERE k = $1", INTERNAL_SCHEMA, KV_TABLE),
            &[Value::from(key)],
        )
        .await?;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.db.defer_rollback(Cleanup {
                tx_id: self.tx_id,
                depth: self.depth,
            });
        }
    }
}

#[async_trait]
impl Executor for Transaction<'_> {
    async fn execute(&self, stmt: &str, args: &[Value]) -> Result<ResultSet> {
        self.execute_with(QueryMode::Describe, stmt, args).await
    }

    /// Reads inside the transaction, seeing its own uncommitted writes.
    async fn query(&self, stmt: &str, args: &[Value]) -> Result<ResultSet> {
        self.execute_with(QueryMode::Describe, stmt, args).await
    }

    fn access_mode(&self) -> AccessMode {
        AccessMode::ReadWrite
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_savepoint_sql() {
        assert_eq!(savepoint_name(2), "sp_2");
        assert_eq!(
            rollback_savepoint_sql(1),
            "ROLLBACK TO SAVEPOINT sp_1; RELEASE SAVEPOINT sp_1"
        );
    }

    #[test]
    fn test_writer_state_starts_idle() {
        let state = WriterState::default();
        assert!(state.tx.is_none());
        assert!(!state.auto_commit);
        assert!(state.last_commit.is_none());
    }
}
