pub mod array;
pub mod connection;
pub mod decoder;
pub mod numeric;
pub mod pool;
pub mod query;
pub mod system;
pub mod types;
pub mod uint256;

#[cfg(test)]
pub mod test_utils;


pub use connection::{ReplicationConnection, ReplicationMessage, SystemInfo};
pub use decoder::{ColumnInfo, LogicalMessage, PgOutputDecoder, RelationInfo, TupleColumn, TupleData};
pub use pool::{Pool, ReadTx};
pub use numeric::Numeric;
pub use types::{DataType, OidTypes, ScalarType, Value};
pub use uint256::Uint256;
