//! Error types and result handling for pg-ledger.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use pg_ledger::{Error, Result};
//!
//! fn execute_outside_session() -> Result<()> {
//!     Err(Error::NoTransaction)
//! }
//!
//! match execute_outside_session() {
//!     Ok(()) => println!("Executed"),
//!     Err(Error::NoTransaction) => eprintln!("Begin a transaction first"),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for pg-ledger operations.
///
/// Connectivity errors (`Postgres`, `Io`, `Connection`, `ReplicationInterrupted`)
/// leave the instance unusable. Decode errors (`InvalidMessage`, `Changeset`) are
/// fatal to the replication monitor or changeset reader that raised them.
/// `Invariant` indicates a bug in the commit correlation protocol.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from an invalid file or environment variable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// I/O error on the replication connection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication failure with PostgreSQL.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The connected server is not the supported version.
    #[error("Required PostgreSQL version not satisfied. Required {required_major}.{required_minor} but connected to {major}.{minor}")]
    Version {
        required_major: u32,
        required_minor: u32,
        major: u32,
        minor: u32,
    },

    /// One or more server settings are incompatible with deterministic replication.
    #[error("Server settings error: {0}")]
    ServerSettings(String),

    /// Replication-specific error.
    #[error("Replication error: {message}")]
    Replication {
        /// Description of the replication error
        message: String,
    },

    /// The replication monitor stopped while a caller was waiting on it.
    #[error("Replication stream interrupted: {0}")]
    ReplicationInterrupted(String),

    /// Invalid or malformed replication message.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// Malformed changeset bytes.
    #[error("Changeset error: {0}")]
    Changeset(String),

    /// A value could not be converted to or from its changeset or wire form.
    #[error("Codec error: {0}")]
    Codec(String),

    /// No registered data type for a postgres type OID.
    #[error("Unsupported type OID {0}")]
    UnsupportedType(u32),

    /// A query that must return rows returned none.
    #[error("No rows in result set")]
    NoRows,

    /// A write was attempted outside a transaction and auto-commit is off.
    #[error("No transaction")]
    NoTransaction,

    /// The single writer transaction is already open.
    #[error("Writer transaction exists")]
    TransactionExists,

    /// An explicit transaction was requested while auto-commit is on.
    #[error("Auto-commit is on, explicit transactions are not allowed")]
    AutoCommit,

    /// Broken correlation protocol state. Treat as fatal.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Waiting for the commit ID was abandoned after postgres committed.
    ///
    /// The SQL-level commit has already taken effect. The transaction may
    /// have succeeded without a confirmed commit ID.
    #[error("Commit may have succeeded without a confirmed commit ID")]
    CommitUnconfirmed,

    /// The DB was closed.
    #[error("Shutdown requested")]
    Shutdown,
}

/// A convenient Result type alias for pg-ledger operations.
///
/// This is equivalent to `std::result::Result<T, pg_ledger::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid_message(message: impl Into<String>) -> Self {
        Error::InvalidMessage {
            message: message.into(),
        }
    }

    pub(crate) fn replication(message: impl Into<String>) -> Self {
        Error::Replication {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replication_error_message() {
        let err = Error::replication("slot \"x\" is active");
        assert!(matches!(&err, Error::Replication { message } if message == "slot \"x\" is active"));
        assert_eq!(err.to_string(), "Replication error: slot \"x\" is active");
    }

    #[test]
    fn test_invalid_message_error() {
        let err = Error::invalid_message(String::from("short frame"));
        assert_eq!(err.to_string(), "Invalid message format: short frame");
    }
}
