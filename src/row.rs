//! Row mapping between result sets and domain records.
//!
//! Decoders resolve column positions by name once per statement execution
//! and then read each row by index, failing with
//! [`StoreError::ColumnNotFound`] when the result set lacks a column.

use rusqlite::{params_from_iter, Connection, OptionalExtension, Row, Statement};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StoreError};
use crate::sqlite::SqlQuery;

/// Typed decoder for one row shape.
pub trait RowDecoder: Sized {
    type Output;

    /// Resolve column positions against a prepared statement.
    fn resolve(stmt: &Statement<'_>) -> Result<Self>;

    fn decode(&self, row: &Row<'_>) -> Result<Self::Output>;
}

/// Position of `name` in the statement's result columns.
pub fn column(stmt: &Statement<'_>, name: &str) -> Result<usize> {
    stmt.column_index(name)
        .map_err(|_| StoreError::ColumnNotFound(name.to_string()))
}

/// Run `query` and decode every row with `D`.
pub fn fetch_all<D: RowDecoder>(conn: &Connection, query: &SqlQuery) -> Result<Vec<D::Output>> {
    fetch_rows::<D>(conn, query, None)
}

/// Like [`fetch_all`], checking `cancel` between rows.
pub fn fetch_all_cancellable<D: RowDecoder>(
    conn: &Connection,
    query: &SqlQuery,
    cancel: &CancellationToken,
) -> Result<Vec<D::Output>> {
    fetch_rows::<D>(conn, query, Some(cancel))
}

fn fetch_rows<D: RowDecoder>(
    conn: &Connection,
    query: &SqlQuery,
    cancel: Option<&CancellationToken>,
) -> Result<Vec<D::Output>> {
    let mut stmt = conn.prepare_cached(&query.statement)?;
    let decoder = D::resolve(&stmt)?;
    let mut rows = stmt.query(params_from_iter(query.params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(StoreError::Cancelled);
        }
        out.push(decoder.decode(row)?);
    }
    Ok(out)
}

/// Run a scalar count query. No row, or a NULL value, counts as zero.
pub fn fetch_count(conn: &Connection, query: &SqlQuery) -> Result<i64> {
    let mut stmt = conn.prepare_cached(&query.statement)?;
    let count: Option<Option<i64>> = stmt
        .query_row(params_from_iter(query.params.iter()), |row| row.get(0))
        .optional()?;
    Ok(count.flatten().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        name: usize,
        score: usize,
    }

    impl RowDecoder for Pair {
        type Output = (String, i64);

        fn resolve(stmt: &Statement<'_>) -> Result<Self> {
            Ok(Self {
                name: column(stmt, "name")?,
                score: column(stmt, "score")?,
            })
        }

        fn decode(&self, row: &Row<'_>) -> Result<Self::Output> {
            Ok((row.get(self.name)?, row.get(self.score)?))
        }
    }

    fn scores() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE scores (name TEXT NOT NULL, score INTEGER NOT NULL);
             INSERT INTO scores VALUES ('a', 1), ('b', 2);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn resolves_columns_by_name_not_position() {
        let conn = scores();
        let query = SqlQuery::new("SELECT score, name FROM scores ORDER BY name");
        let rows = fetch_all::<Pair>(&conn, &query).unwrap();
        assert_eq!(rows, vec![("a".to_string(), 1), ("b".to_string(), 2)]);
    }

    #[test]
    fn missing_column_fails_fast() {
        let conn = scores();
        let query = SqlQuery::new("SELECT name FROM scores");
        match fetch_all::<Pair>(&conn, &query) {
            Err(StoreError::ColumnNotFound(column)) => assert_eq!(column, "score"),
            other => panic!("expected ColumnNotFound, got {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn cancelled_token_stops_row_iteration() {
        let conn = scores();
        let token = CancellationToken::new();
        token.cancel();
        let query = SqlQuery::new("SELECT name, score FROM scores");
        let result = fetch_all_cancellable::<Pair>(&conn, &query, &token);
        assert!(matches!(result, Err(StoreError::Cancelled)));
    }

    #[test]
    fn empty_or_null_count_is_zero() {
        let conn = scores();
        let none = SqlQuery::new("SELECT score FROM scores WHERE name = ?1").bind("zzz");
        assert_eq!(fetch_count(&conn, &none).unwrap(), 0);
        let null = SqlQuery::new("SELECT SUM(score) FROM scores WHERE score > 10");
        assert_eq!(fetch_count(&conn, &null).unwrap(), 0);
        let count = SqlQuery::new("SELECT COUNT(*) FROM scores");
        assert_eq!(fetch_count(&conn, &count).unwrap(), 2);
    }
}
