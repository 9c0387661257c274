//! The replication monitor: a task that owns the replication connection,
//! decodes every transaction, and hands `(seq, hash)` results to the
//! committers waiting for them.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::capture::{CommitId, FinishedTx, SchemaFilter, TxCapture};
use crate::config::{ConnConfig, ReplicationConfig};
use crate::postgres::connection::{ReplicationConnection, ReplicationMessage};
use crate::postgres::decoder::format_lsn;
use crate::postgres::types::OidTypes;
use crate::{Error, Result};

/// What the monitor produced for one tracked transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub id: CommitId,
    /// Serialized changeset, when capture is enabled.
    pub changeset: Option<Vec<u8>>,
}

/// Resolves with the commit for the requested sequence. Closes without a
/// value if the monitor stops first.
pub type CommitReceiver = oneshot::Receiver<Committed>;

/// Why the monitor stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    Stopped,
    Failed(String),
}

/// Pairs results from the WAL stream with committers waiting on a sequence.
/// A result can arrive before or after its promise is requested.
#[derive(Debug, Default)]
pub struct PromiseBroker {
    results: HashMap<i64, Committed>,
    promises: HashMap<i64, oneshot::Sender<Committed>>,
    last_seq: Option<i64>,
}

impl PromiseBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `seq`, delivering immediately if the result is
    /// already here. A second live waiter for the same sequence is an error.
    pub fn register(&mut self, seq: i64, promise: oneshot::Sender<Committed>) -> Result<()> {
        if let Some(committed) = self.results.remove(&seq) {
            trace!(seq, "delivering stored commit");
            if promise.send(committed).is_err() {
                debug!(seq, "commit waiter went away");
            }
            return Ok(());
        }

        match self.promises.entry(seq) {
            Entry::Vacant(entry) => {
                entry.insert(promise);
                Ok(())
            }
            // Left behind by a commit that failed before reaching the WAL.
            Entry::Occupied(mut entry) if entry.get().is_closed() => {
                entry.insert(promise);
                Ok(())
            }
            Entry::Occupied(_) => Err(Error::Invariant(format!(
                "commit ID for sequence {} already requested",
                seq
            ))),
        }
    }

    /// Delivers a result to its waiter, or stores it until one registers.
    pub fn fulfill(&mut self, committed: Committed) -> Result<()> {
        let seq = committed.id.seq;
        if let Some(last) = self.last_seq {
            if seq <= last {
                return Err(Error::Invariant(format!(
                    "sequence {} observed after {}",
                    seq, last
                )));
            }
        }
        self.last_seq = Some(seq);

        if let Some(promise) = self.promises.remove(&seq) {
            if promise.send(committed).is_err() {
                debug!(seq, "commit waiter went away");
            }
            return Ok(());
        }

        match self.results.entry(seq) {
            Entry::Vacant(entry) => {
                entry.insert(committed);
                Ok(())
            }
            Entry::Occupied(_) => Err(Error::Invariant(format!(
                "duplicate commit for sequence {}",
                seq
            ))),
        }
    }

    pub fn pending_promises(&self) -> usize {
        self.promises.len()
    }

    pub fn stored_results(&self) -> usize {
        self.results.len()
    }
}

struct Promise {
    seq: i64,
    sender: oneshot::Sender<Committed>,
}

/// Handle to the running monitor task.
pub struct ReplicationMonitor {
    requests: mpsc::UnboundedSender<Promise>,
    exit: watch::Receiver<Option<MonitorExit>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ReplicationMonitor {
    /// Connects in replication mode, creates a temporary slot and starts
    /// streaming. Returns once the stream is live, so any commit made
    /// afterwards is observed.
    pub async fn start(
        conn: &ConnConfig,
        replication: &ReplicationConfig,
        filter: SchemaFilter,
        oids: Arc<OidTypes>,
    ) -> Result<Self> {
        let mut connection = ReplicationConnection::connect(
            conn,
            replication.slot_name(),
            replication.publication.clone(),
        )
        .await?;
        let system = connection.identify_system().await?;
        info!(
            "Replication system {} timeline {} at {}",
            system.system_id, system.timeline, system.xlogpos
        );
        let start_lsn = connection.create_temporary_slot().await?;
        connection.start_replication(&start_lsn).await?;

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let worker = Worker {
            connection,
            capture: TxCapture::new(filter, oids, replication.capture_changesets),
            broker: PromiseBroker::new(),
            requests: requests_rx,
            keepalive_interval: replication.keepalive_interval(),
        };
        let task = tokio::spawn(async move {
            let exit = worker.run(shutdown_rx).await;
            match &exit {
                MonitorExit::Stopped => info!("Replication monitor stopped"),
                MonitorExit::Failed(e) => error!("Replication monitor failed: {}", e),
            }
            let _ = exit_tx.send(Some(exit));
        });

        Ok(Self {
            requests: requests_tx,
            exit: exit_rx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Requests the commit for `seq`. If the monitor has already stopped the
    /// returned receiver is closed.
    pub fn recv_id(&self, seq: i64) -> CommitReceiver {
        let (sender, receiver) = oneshot::channel();
        if self.exit.borrow().is_some() {
            return receiver;
        }
        if self.requests.send(Promise { seq, sender }).is_err() {
            debug!(seq, "monitor gone, commit ID unavailable");
        }
        receiver
    }

    /// The exit status, once stopped.
    pub fn exit_status(&self) -> Option<MonitorExit> {
        self.exit.borrow().clone()
    }

    pub fn err(&self) -> Option<String> {
        match self.exit_status() {
            Some(MonitorExit::Failed(e)) => Some(e),
            _ => None,
        }
    }

    /// Resolves when the monitor stops, for any reason.
    pub fn done(&self) -> impl std::future::Future<Output = MonitorExit> + Send + 'static {
        let mut exit = self.exit.clone();
        async move {
            loop {
                let current = exit.borrow_and_update().clone();
                if let Some(status) = current {
                    return status;
                }
                if exit.changed().await.is_err() {
                    return exit
                        .borrow()
                        .clone()
                        .unwrap_or_else(|| MonitorExit::Failed("monitor task aborted".to_string()));
                }
            }
        }
    }

    /// Stops the monitor and waits for it to close its connection.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Replication monitor task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ReplicationMonitor {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

struct Worker {
    connection: ReplicationConnection,
    capture: TxCapture,
    broker: PromiseBroker,
    requests: mpsc::UnboundedReceiver<Promise>,
    keepalive_interval: Duration,
}

impl Worker {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> MonitorExit {
        let result = self.receive_loop(&mut shutdown).await;
        if self.broker.pending_promises() > 0 {
            warn!(
                "Replication monitor exiting with {} unfulfilled commit promises",
                self.broker.pending_promises()
            );
        }
        if let Err(e) = self.connection.close().await {
            debug!("Error closing replication connection: {}", e);
        }
        match result {
            Ok(()) => MonitorExit::Stopped,
            Err(e) => MonitorExit::Failed(e.to_string()),
        }
    }

    async fn receive_loop(&mut self, shutdown: &mut oneshot::Receiver<()>) -> Result<()> {
        let mut keepalive = tokio::time::interval(self.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut *shutdown => return Ok(()),
                request = self.requests.recv() => match request {
                    Some(Promise { seq, sender }) => self.broker.register(seq, sender)?,
                    None => {
                        debug!("All monitor handles dropped");
                        return Ok(());
                    }
                },
                message = self.connection.recv() => {
                    let reply = self.handle(message?)?;
                    if reply {
                        self.connection.send_standby_status(false).await?;
                        keepalive.reset();
                    }
                }
                _ = keepalive.tick() => {
                    self.connection.send_standby_status(false).await?;
                }
            }
        }
    }

    /// Returns true when the server asked for an immediate status update.
    fn handle(&mut self, message: ReplicationMessage) -> Result<bool> {
        match message {
            ReplicationMessage::XLogData { wal_start, data, .. } => {
                trace!("XLogData at {} ({} bytes)", format_lsn(wal_start), data.len());
                if let Some(finished) = self.capture.process(&data)? {
                    self.on_finished(finished)?;
                }
                Ok(false)
            }
            ReplicationMessage::Keepalive { wal_end, reply, .. } => {
                trace!("Keepalive at {} (reply requested: {})", format_lsn(wal_end), reply);
                Ok(reply)
            }
        }
    }

    fn on_finished(&mut self, finished: FinishedTx) -> Result<()> {
        self.connection.confirm(finished.end_lsn);
        match finished.seq {
            Some(seq) => self.broker.fulfill(Committed {
                id: CommitId {
                    seq,
                    hash: finished.hash,
                },
                changeset: finished.changeset,
            }),
            None => {
                debug!("Discarding untracked commit at {}", format_lsn(finished.end_lsn));
                Ok(())
            }
        }
    }
}
