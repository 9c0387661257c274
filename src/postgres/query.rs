use futures::{pin_mut, TryStreamExt};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::Client;
use tracing::trace;

use super::types::{OidTypes, Value, VOID_OID};
use crate::sql::{CommandStatus, QueryMode, ResultSet};
use crate::Result;

/// Runs one statement on `client` and collects its result.
pub(crate) async fn run(
    client: &Client,
    oids: &OidTypes,
    sql: &str,
    args: &[Value],
    mode: QueryMode,
) -> Result<ResultSet> {
    let stmt = match mode {
        QueryMode::Describe => client.prepare(sql).await?,
        QueryMode::Inferred => {
            let types: Vec<Type> = args
                .iter()
                .map(|arg| match arg.data_type() {
                    Some(data_type) => oids.pg_type(data_type),
                    None => Type::TEXT,
                })
                .collect();
            client.prepare_typed(sql, &types).await?
        }
    };

    // Functions returning void produce a column nobody can decode.
    let keep: Vec<usize> = stmt
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, c)| c.type_().oid() != VOID_OID)
        .map(|(i, _)| i)
        .collect();

    let mut result = ResultSet {
        columns: keep.iter().map(|&i| stmt.columns()[i].name().to_string()).collect(),
        column_types: keep
            .iter()
            .map(|&i| stmt.columns()[i].type_().name().to_string())
            .collect(),
        ..Default::default()
    };

    let params = args.iter().map(|arg| arg as &dyn ToSql);
    let stream = client.query_raw(&stmt, params).await?;
    pin_mut!(stream);
    while let Some(row) = stream.try_next().await? {
        let mut values = Vec::with_capacity(keep.len());
        for &i in &keep {
            values.push(row.try_get::<_, Value>(i)?);
        }
        result.rows.push(values);
    }
    result.status = CommandStatus {
        rows_affected: stream.rows_affected().unwrap_or(result.rows.len() as u64),
    };

    trace!(
        rows = result.rows.len(),
        rows_affected = result.status.rows_affected,
        "Executed {}",
        sql
    );
    Ok(result)
}
