//! Client connection: exec, query, query-row, appender and explain over one
//! engine connection handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use strata_common::{Context, StrataError, StrataResult, Value};
use strata_engine::{ConnHandle, StmtType};

use crate::admission::Permit;
use crate::appender::Appender;
use crate::database::Database;
use crate::message::{result_message, rows_phrase, stmt_kind};
use crate::metrics::{Phase, Resource};
use crate::row::Row;
use crate::rows::Rows;
use crate::scan::{bind_params, read_row};
use crate::session::ConnState;
use crate::stmt::Stmt;

/// How to open a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOption {
    Password { user: String, password: String },
    /// Trusted identity, no password check.
    TrustUser(String),
    /// Give up waiting for an admission slot after this long.
    Timeout(Duration),
}

impl ConnectOption {
    pub fn password(user: impl Into<String>, password: impl Into<String>) -> Self {
        ConnectOption::Password {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn trust(user: impl Into<String>) -> Self {
        ConnectOption::TrustUser(user.into())
    }
}

/// Outcome of [`Conn::exec`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    pub rows_affected: u64,
    #[serde(skip)]
    pub stmt_type: StmtType,
    pub message: String,
}

type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

struct Latest {
    time: DateTime<Utc>,
    sql: String,
}

pub(crate) struct ConnInner {
    db: Database,
    handle: ConnHandle,
    id: u64,
    user: String,
    created: DateTime<Utc>,
    opened_at: Instant,
    latest: Mutex<Latest>,
    permit: Mutex<Option<Permit>>,
    closed: AtomicBool,
    on_close: Mutex<Option<CloseCallback>>,
}

impl ConnInner {
    pub(crate) fn new(
        db: Database,
        handle: ConnHandle,
        id: u64,
        user: String,
        permit: Option<Permit>,
    ) -> Self {
        let now = Utc::now();
        Self {
            db,
            handle,
            id,
            user,
            created: now,
            opened_at: Instant::now(),
            latest: Mutex::new(Latest {
                time: now,
                sql: String::new(),
            }),
            permit: Mutex::new(permit),
            closed: AtomicBool::new(false),
            on_close: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn handle(&self) -> ConnHandle {
        self.handle
    }

    pub(crate) fn database(&self) -> &Database {
        &self.db
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> StrataResult<()> {
        if self.is_closed() {
            Err(StrataError::Closed("connection"))
        } else {
            Ok(())
        }
    }

    pub(crate) fn set_latest_sql(&self, sql: &str) {
        let mut latest = self.latest.lock();
        latest.time = Utc::now();
        latest.sql.clear();
        latest.sql.push_str(sql);
    }

    pub(crate) fn state(&self) -> ConnState {
        let latest = self.latest.lock();
        ConnState {
            id: self.id,
            user: self.user.clone(),
            created_time: self.created,
            latest_time: latest.time,
            latest_sql: latest.sql.clone(),
        }
    }

    pub(crate) fn cancel_now(&self) -> StrataResult<()> {
        self.ensure_open()?;
        self.db.engine().cancel(self.handle)
    }

    /// Disconnect and release everything the connection holds. Runs once.
    pub(crate) fn close_now(&self) -> StrataResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.set_latest_sql("CLOSE");
        let result = self.db.engine().disconnect(self.handle);
        if let Some(mut permit) = self.permit.lock().take() {
            permit.release();
        }
        self.db.sessions().remove(self.id);
        let metrics = self.db.metrics();
        metrics.resource_closed(Resource::Conn);
        metrics.observe(Phase::ConnectHold, self.opened_at.elapsed());
        let cb = self.on_close.lock().take();
        if let Some(cb) = cb {
            cb();
        }
        tracing::debug!(session = self.id, user = %self.user, "connection closed");
        result
    }

    fn exec_now(&self, sql: &str, params: &[Value]) -> StrataResult<ExecResult> {
        self.ensure_open()?;
        self.set_latest_sql(sql);
        let engine = self.db.engine();
        let stmt = Stmt::alloc(engine, self.handle, self.db.metrics(), Resource::Stmt)?;
        let start = Instant::now();
        if params.is_empty() {
            engine.direct_execute(stmt.handle(), sql)?;
        } else {
            engine.prepare(stmt.handle(), sql)?;
            bind_params(engine.as_ref(), stmt.handle(), params)?;
            engine.execute(stmt.handle())?;
        }
        let rows_affected = engine.effect_rows(stmt.handle())?;
        let stmt_type = engine.stmt_type(stmt.handle())?;
        stmt.free()?;
        let elapsed = start.elapsed();
        self.observe_query(sql, params, elapsed, Duration::ZERO);
        strata_observability::record_query_metrics(
            elapsed.as_micros() as u64,
            stmt_kind(stmt_type),
            true,
        );
        Ok(ExecResult {
            rows_affected,
            stmt_type,
            message: result_message(stmt_type, sql, rows_affected),
        })
    }

    /// Allocate, prepare, bind and execute; the statement is freed on any failure.
    pub(crate) fn start_query(&self, sql: &str, params: &[Value]) -> StrataResult<QueryStart> {
        self.ensure_open()?;
        self.set_latest_sql(sql);
        let engine = self.db.engine();
        let stmt = Stmt::alloc(engine, self.handle, self.db.metrics(), Resource::Stmt)?;
        let start = Instant::now();
        engine.prepare(stmt.handle(), sql)?;
        bind_params(engine.as_ref(), stmt.handle(), params)?;
        engine.execute(stmt.handle())?;
        let stmt_type = engine.stmt_type(stmt.handle())?;
        let columns = stmt.columns()?;
        let rows_affected = if stmt_type.is_select() {
            0
        } else {
            engine.effect_rows(stmt.handle())?
        };
        Ok(QueryStart {
            stmt,
            stmt_type,
            columns,
            rows_affected,
            exec_time: start.elapsed(),
        })
    }

    fn query_row_now(&self, sql: &str, params: &[Value]) -> StrataResult<Row> {
        let q = self.start_query(sql, params)?;
        let engine = self.db.engine();
        if !q.stmt_type.is_select() {
            let message = result_message(q.stmt_type, sql, q.rows_affected);
            q.stmt.free()?;
            self.observe_query(sql, params, q.exec_time, Duration::ZERO);
            return Ok(Row::affected(q.stmt_type, q.rows_affected, message));
        }
        let fetch_start = Instant::now();
        let fetched = if engine.fetch(q.stmt.handle())? {
            Some(read_row(engine.as_ref(), q.stmt.handle(), &q.columns)?)
        } else {
            None
        };
        q.stmt.free()?;
        self.observe_query(sql, params, q.exec_time, fetch_start.elapsed());
        match fetched {
            Some(values) => Ok(Row::selected(
                q.stmt_type,
                q.columns,
                values,
                rows_phrase(1, "selected."),
            )),
            None => Err(StrataError::NoRows),
        }
    }

    fn explain_now(&self, sql: &str, full: bool) -> StrataResult<String> {
        self.ensure_open()?;
        self.set_latest_sql(&format!("EXPLAIN {}", sql));
        let engine = self.db.engine();
        let stmt = Stmt::alloc(engine, self.handle, self.db.metrics(), Resource::Stmt)?;
        if full {
            engine.direct_execute(stmt.handle(), sql)?;
        } else {
            engine.prepare(stmt.handle(), sql)?;
        }
        let plan = engine.explain(stmt.handle(), full)?;
        stmt.free()?;
        Ok(plan)
    }

    fn observe_query(&self, sql: &str, params: &[Value], exec: Duration, fetch: Duration) {
        let metrics = self.db.metrics();
        metrics.observe(Phase::QueryExec, exec);
        if fetch > Duration::ZERO {
            metrics.observe(Phase::QueryFetch, fetch);
        }
        let args: Vec<String> = params.iter().map(|v| v.to_string()).collect();
        metrics.observe_query(sql, &args, Duration::ZERO, exec, fetch);
    }
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        if let Err(e) = self.close_now() {
            tracing::debug!(session = self.id, error = %e, "close on drop failed");
        }
    }
}

/// An executed query whose statement is still open.
pub(crate) struct QueryStart {
    pub stmt: Stmt,
    pub stmt_type: StmtType,
    pub columns: Vec<strata_common::Column>,
    pub rows_affected: u64,
    pub exec_time: Duration,
}

/// A live engine connection.
///
/// Operations on one `Conn` are serialized by the engine handle; share it
/// across threads only to call [`Conn::cancel`] or [`Conn::close`].
pub struct Conn {
    inner: Arc<ConnInner>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.inner.id)
            .field("user", &self.inner.user)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

fn check_ctx(ctx: &Context) -> StrataResult<()> {
    match ctx.err() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

impl Conn {
    pub(crate) fn from_inner(inner: Arc<ConnInner>) -> Self {
        Self { inner }
    }

    /// Engine session id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn user(&self) -> &str {
        &self.inner.user
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.is_closed()
    }

    pub fn state(&self) -> ConnState {
        self.inner.state()
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    /// Run `cb` exactly once when the connection closes.
    pub fn set_close_callback(&self, cb: impl FnOnce() + Send + 'static) {
        *self.inner.on_close.lock() = Some(Box::new(cb));
    }

    /// Execute a statement that returns no cursor.
    ///
    /// Without parameters the text is executed directly; otherwise it is
    /// prepared and each parameter bound in order. The statement is always
    /// freed.
    pub fn exec(&self, ctx: &Context, sql: &str, params: &[Value]) -> StrataResult<ExecResult> {
        check_ctx(ctx)?;
        let inner = Arc::clone(&self.inner);
        let sql = sql.to_string();
        let params = params.to_vec();
        self.inner.db.run(move || inner.exec_now(&sql, &params))
    }

    /// Execute and return a cursor. The statement stays open until the
    /// returned [`Rows`] is closed or dropped.
    pub fn query(&self, ctx: &Context, sql: &str, params: &[Value]) -> StrataResult<Rows> {
        check_ctx(ctx)?;
        let inner = Arc::clone(&self.inner);
        let owned_sql = sql.to_string();
        let params = params.to_vec();
        let args: Vec<String> = params.iter().map(|v| v.to_string()).collect();
        let start = self
            .inner
            .db
            .run(move || inner.start_query(&owned_sql, &params))?;
        Ok(Rows::new(Arc::clone(&self.inner), sql.to_string(), args, start))
    }

    /// Execute and read at most one row.
    ///
    /// A non-select statement yields an empty row carrying the affected
    /// count. A select with no result fails with [`StrataError::NoRows`].
    pub fn query_row(&self, ctx: &Context, sql: &str, params: &[Value]) -> StrataResult<Row> {
        check_ctx(ctx)?;
        let inner = Arc::clone(&self.inner);
        let sql = sql.to_string();
        let params = params.to_vec();
        self.inner.db.run(move || inner.query_row_now(&sql, &params))
    }

    /// Plan text: the summary plan, or with `full` the executed plan.
    pub fn explain(&self, ctx: &Context, sql: &str, full: bool) -> StrataResult<String> {
        check_ctx(ctx)?;
        let inner = Arc::clone(&self.inner);
        let sql = sql.to_string();
        self.inner.db.run(move || inner.explain_now(&sql, full))
    }

    /// Open an appender on `table`; only log and tag tables accept append.
    pub fn appender(&self, ctx: &Context, table: &str) -> StrataResult<Appender> {
        check_ctx(ctx)?;
        self.inner.ensure_open()?;
        Appender::open(Arc::clone(&self.inner), table)
    }

    pub fn ping(&self) -> StrataResult<()> {
        self.inner.ensure_open()?;
        let inner = Arc::clone(&self.inner);
        self.inner
            .db
            .run(move || inner.db.engine().ping(inner.handle))
    }

    /// Abort the running operation, then close.
    pub fn cancel(&self) -> StrataResult<()> {
        if self.inner.is_closed() {
            return Ok(());
        }
        self.inner.cancel_now()?;
        self.close()
    }

    /// Idempotent.
    pub fn close(&self) -> StrataResult<()> {
        if self.inner.is_closed() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        self.inner.db.run(move || inner.close_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use strata_common::config::StrataConfig;
    use strata_engine::mem::MemEngine;

    fn started_db() -> Database {
        let db = Database::new(Arc::new(MemEngine::new()), StrataConfig::default()).unwrap();
        db.startup().unwrap();
        db
    }

    fn connect(db: &Database) -> Conn {
        db.connect(
            &Context::background(),
            &[ConnectOption::password("sys", "manager")],
        )
        .unwrap()
    }

    #[test]
    fn test_exec_frees_statement_on_failure() {
        let db = started_db();
        let conn = connect(&db);
        let ctx = Context::background();
        assert!(conn.exec(&ctx, "select * from missing", &[]).is_err());
        assert!(conn
            .exec(&ctx, "insert into missing values(?)", &[Value::Int32(1)])
            .is_err());
        assert_eq!(db.metrics().in_use(Resource::Stmt), 0);
        conn.close().unwrap();
    }

    #[test]
    fn test_latest_sql_tracks_operations() {
        let db = started_db();
        let conn = connect(&db);
        let ctx = Context::background();
        assert_eq!(conn.state().latest_sql, "CONNECT");
        conn.exec(&ctx, "create table t (a integer)", &[]).unwrap();
        assert_eq!(conn.state().latest_sql, "create table t (a integer)");
        conn.explain(&ctx, "select a from t", false).unwrap();
        assert_eq!(conn.state().latest_sql, "EXPLAIN select a from t");
    }

    #[test]
    fn test_close_is_idempotent_and_runs_callback_once() {
        let db = started_db();
        let conn = connect(&db);
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        conn.set_close_callback(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        conn.close().unwrap();
        conn.close().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!conn.is_connected());
        let err = conn
            .exec(&Context::background(), "select 1 from t", &[])
            .unwrap_err();
        assert!(matches!(err, StrataError::Closed("connection")));
    }

    #[test]
    fn test_canceled_context_stops_before_engine() {
        let db = started_db();
        let conn = connect(&db);
        let ctx = Context::background();
        ctx.cancel();
        let err = conn.exec(&ctx, "create table t (a integer)", &[]).unwrap_err();
        assert!(matches!(err, StrataError::Canceled));
        assert_eq!(db.metrics().snapshot().stmt.opened, 0);
    }

    #[test]
    fn test_query_row_non_select_reports_engine_count() {
        let db = started_db();
        let conn = connect(&db);
        let ctx = Context::background();
        conn.exec(&ctx, "create table t (a integer)", &[]).unwrap();
        let row = conn
            .query_row(&ctx, "delete from t where a = ?", &[Value::Int32(9)])
            .unwrap();
        assert_eq!(row.rows_affected(), 0);
        assert_eq!(row.message(), "no rows deleted.");
    }

    #[test]
    fn test_query_row_without_result_is_no_rows() {
        let db = started_db();
        let conn = connect(&db);
        let ctx = Context::background();
        conn.exec(&ctx, "create table t (a integer)", &[]).unwrap();
        let err = conn
            .query_row(&ctx, "select a from t where a = ?", &[Value::Int32(1)])
            .unwrap_err();
        assert!(err.is_no_rows());
        assert_eq!(db.metrics().in_use(Resource::Stmt), 0);
    }
}
