pub mod capture;
pub mod changeset;
pub mod config;
pub mod db;
pub mod error;
pub mod monitor;
pub mod postgres;
pub mod sequence;
pub mod sql;

pub use capture::{CommitId, SchemaFilter};
pub use changeset::{deserialize_changeset, Changeset, ChangesetGroup};
pub use config::{Config, DbConfig};
pub use db::{Db, Transaction};
pub use error::{Error, Result};
pub use monitor::{Committed, MonitorExit, ReplicationMonitor};
pub use sql::{AccessMode, Executor, QueryMode, ResultSet};
