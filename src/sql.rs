//! The narrow execution contract that higher layers (the SQL engine, dataset
//! management) program against.

use async_trait::async_trait;
use serde::Serialize;

pub use crate::postgres::types::{DataType, ScalarType, Value};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
}

impl AccessMode {
    pub fn is_read_only(self) -> bool {
        matches!(self, AccessMode::ReadOnly)
    }
}

/// How statement arguments are typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryMode {
    /// The server describes parameter types and values are adapted to them.
    #[default]
    Describe,
    /// Parameter types are asserted from the argument values, for
    /// expressions like `SELECT $1` where the server cannot infer them.
    Inferred,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    /// Postgres type names of the result columns.
    pub column_types: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub status: CommandStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandStatus {
    pub rows_affected: u64,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First row, or `Error::NoRows`.
    pub fn first(&self) -> Result<&[Value]> {
        self.rows.first().map(Vec::as_slice).ok_or(Error::NoRows)
    }

    /// Single value of the first row's first column.
    pub fn scalar(&self) -> Result<&Value> {
        self.first()?.first().ok_or(Error::NoRows)
    }
}

/// Statement execution. Implemented by the database handle, write
/// transactions and read transactions.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executes a statement with positional arguments.
    async fn execute(&self, stmt: &str, args: &[Value]) -> Result<ResultSet>;

    /// Runs a read query.
    async fn query(&self, stmt: &str, args: &[Value]) -> Result<ResultSet>;

    fn access_mode(&self) -> AccessMode;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_on_empty_result() {
        let rs = ResultSet::default();
        assert!(rs.is_empty());
        assert!(matches!(rs.first(), Err(Error::NoRows)));
        assert!(matches!(rs.scalar(), Err(Error::NoRows)));
    }

    #[test]
    fn test_scalar() {
        let rs = ResultSet {
            columns: vec!["n".to_string()],
            column_types: vec!["int8".to_string()],
            rows: vec![vec![Value::Int(3)]],
            status: CommandStatus { rows_affected: 1 },
        };
        assert_eq!(rs.scalar().unwrap(), &Value::Int(3));
    }

    #[test]
    fn test_access_mode() {
        assert!(AccessMode::ReadOnly.is_read_only());
        assert!(!AccessMode::ReadWrite.is_read_only());
    }
}
