//! Cursor over the result of [`Conn::query`](crate::Conn::query).

use std::sync::Arc;
use std::time::{Duration, Instant};

use strata_common::{Column, Context, StrataError, StrataResult, Value};
use strata_engine::StmtType;

use crate::admission::{AcquireKind, Permit};
use crate::conn::{ConnInner, QueryStart};
use crate::message::result_message;
use crate::metrics::Phase;
use crate::scan::{read_row, scan_index, FromRow, FromValue};
use crate::stmt::Stmt;

/// A live cursor. Drive it from one thread: `next` then `scan`/`get`.
///
/// The statement is freed exactly once, by [`Rows::close`] or on drop.
pub struct Rows {
    conn: Arc<ConnInner>,
    stmt: Option<Stmt>,
    sql: String,
    args: Vec<String>,
    stmt_type: StmtType,
    columns: Arc<Vec<Column>>,
    rows_affected: u64,
    fetched: u64,
    current: Option<Vec<Value>>,
    err: Option<StrataError>,
    permit: Option<Permit>,
    exec_time: Duration,
    fetch_time: Duration,
}

impl std::fmt::Debug for Rows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows")
            .field("sql", &self.sql)
            .field("columns", &self.columns.len())
            .field("fetched", &self.fetched)
            .field("closed", &self.stmt.is_none())
            .finish()
    }
}

impl Rows {
    pub(crate) fn new(conn: Arc<ConnInner>, sql: String, args: Vec<String>, q: QueryStart) -> Self {
        Self {
            conn,
            stmt: Some(q.stmt),
            sql,
            args,
            stmt_type: q.stmt_type,
            columns: Arc::new(q.columns),
            rows_affected: q.rows_affected,
            fetched: 0,
            current: None,
            err: None,
            permit: None,
            exec_time: q.exec_time,
            fetch_time: Duration::ZERO,
        }
    }

    /// Columns captured when the query executed.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// True when the statement was a select and has a cursor.
    pub fn is_fetchable(&self) -> bool {
        self.stmt_type.is_select()
    }

    pub fn stmt_type(&self) -> StmtType {
        self.stmt_type
    }

    /// Affected count of a non-select statement.
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// Statement text; kept after close so [`Rows::message`] stays valid.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Rows fetched so far.
    pub fn fetched(&self) -> u64 {
        self.fetched
    }

    /// Error that ended iteration, if any.
    pub fn err(&self) -> Option<&StrataError> {
        self.err.as_ref()
    }

    /// Take a token from the query limiter; returned on close.
    pub fn acquire_query_limit(&mut self, ctx: &Context) -> StrataResult<()> {
        if self.permit.is_some() || !self.is_fetchable() {
            return Ok(());
        }
        let db = self.conn.database();
        let permit = db.query_gate().acquire(ctx, None, AcquireKind::Query)?;
        db.metrics().observe(Phase::QueryWait, permit.waited);
        self.permit = Some(permit);
        Ok(())
    }

    /// Advance to the next row. `false` at the end or after an error, which
    /// is kept in [`Rows::err`].
    pub fn next(&mut self) -> bool {
        self.current = None;
        if self.err.is_some() || !self.is_fetchable() {
            return false;
        }
        let Some(stmt) = self.stmt.as_ref() else {
            return false;
        };
        let engine = Arc::clone(self.conn.database().engine());
        let handle = stmt.handle();
        let columns = Arc::clone(&self.columns);
        let start = Instant::now();
        let fetched = self.conn.database().run(move || {
            if engine.fetch(handle)? {
                read_row(engine.as_ref(), handle, &columns).map(Some)
            } else {
                Ok(None)
            }
        });
        self.fetch_time += start.elapsed();
        match fetched {
            Ok(Some(values)) => {
                self.fetched += 1;
                self.current = Some(values);
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.err = Some(match e {
                    StrataError::Engine { .. } => StrataError::Fetch(e.to_string()),
                    other => other,
                });
                false
            }
        }
    }

    /// Values of the current row.
    pub fn values(&self) -> Option<&[Value]> {
        self.current.as_deref()
    }

    /// Scan the current row positionally into a tuple.
    pub fn scan<T: FromRow>(&self) -> StrataResult<T> {
        match &self.current {
            Some(values) => T::from_row(values),
            None => Err(self.err.clone().unwrap_or(StrataError::NoRows)),
        }
    }

    /// Scan one column of the current row.
    pub fn get<T: FromValue>(&self, idx: usize) -> StrataResult<T> {
        match &self.current {
            Some(values) => scan_index(values, idx),
            None => Err(self.err.clone().unwrap_or(StrataError::NoRows)),
        }
    }

    /// Next row as owned values, `None` at the end.
    pub fn fetch(&mut self) -> StrataResult<Option<Vec<Value>>> {
        if self.next() {
            return Ok(self.current.clone());
        }
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(None),
        }
    }

    /// Message for the statement, e.g. `"3 rows fetched."`.
    pub fn message(&self) -> String {
        let rows = if self.is_fetchable() {
            self.fetched
        } else {
            self.rows_affected
        };
        result_message(self.stmt_type, &self.sql, rows)
    }

    /// Free the statement and return the limiter token. Idempotent.
    pub fn close(&mut self) -> StrataResult<()> {
        let Some(stmt) = self.stmt.take() else {
            return Ok(());
        };
        self.current = None;
        if let Some(mut permit) = self.permit.take() {
            permit.release();
        }
        let db = self.conn.database();
        if self.is_fetchable() {
            db.metrics().observe(Phase::QueryFetch, self.fetch_time);
            db.metrics().observe_query(
                &self.sql,
                &self.args,
                Duration::ZERO,
                self.exec_time,
                self.fetch_time,
            );
        }
        db.run(move || stmt.free())
    }
}

impl Drop for Rows {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::debug!(error = %e, "close rows on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::conn::{Conn, ConnectOption};
    use crate::database::Database;
    use std::sync::Arc;
    use strata_common::config::StrataConfig;
    use strata_common::Context;
    use strata_engine::mem::MemEngine;

    fn connect() -> (Database, Conn) {
        let db = Database::new(Arc::new(MemEngine::new()), StrataConfig::default()).unwrap();
        db.startup().unwrap();
        let conn = db
            .connect(&Context::background(), &[ConnectOption::trust("sys")])
            .unwrap();
        (db, conn)
    }

    #[test]
    fn test_message_survives_close() {
        let (_db, conn) = connect();
        let ctx = Context::background();
        let mut ddl = conn
            .query(&ctx, "create table logs (msg varchar(20))", &[])
            .unwrap();
        ddl.close().unwrap();
        assert_eq!(ddl.message(), "Created successfully.");
        assert_eq!(ddl.sql(), "create table logs (msg varchar(20))");

        conn.exec(&ctx, "insert into logs values ('a')", &[]).unwrap();
        let mut rows = conn.query(&ctx, "select * from logs", &[]).unwrap();
        while rows.fetch().unwrap().is_some() {}
        rows.close().unwrap();
        rows.close().unwrap();
        assert_eq!(rows.message(), "a row fetched.");
    }
}
