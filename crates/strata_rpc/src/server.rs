//! RPC session and stream manager.
//!
//! Engine calls are blocking, so every handler moves its work onto the
//! blocking pool and wraps it in a panic guard. A panic or error becomes a
//! failed [`Reply`]; the server keeps serving.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strata_access::{Conn, ConnectOption, Database};
use strata_common::config::RpcConfig;
use strata_common::crash_domain;
use strata_common::shutdown::ShutdownSignal;
use strata_common::{Context, StrataError, StrataResult, Value};
use tokio::sync::mpsc;

use crate::auth::{parse_otp, AuthProvider, DefaultAuthProvider};
use crate::inflight::{InflightInfo, InflightKind, InflightRegistry};
use crate::message::*;

struct Session {
    conn: Conn,
    user: String,
    created: Instant,
}

struct ServerInner {
    db: Database,
    auth: Arc<dyn AuthProvider>,
    config: RpcConfig,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    inflight: Arc<InflightRegistry>,
    sweeper_stop: ShutdownSignal,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.sweeper_stop.shutdown();
    }
}

/// One RPC server instance over a started [`Database`].
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("sessions", &self.session_count())
            .field("inflight", &self.inflight_count())
            .finish()
    }
}

impl RpcServer {
    pub fn new(db: Database, config: RpcConfig) -> Self {
        Self::with_auth_provider(db, config, Arc::new(DefaultAuthProvider))
    }

    /// Starts the idle sweeper when `inflight_ttl_ms > 0`.
    pub fn with_auth_provider(db: Database, config: RpcConfig, auth: Arc<dyn AuthProvider>) -> Self {
        let inner = Arc::new(ServerInner {
            db,
            auth,
            config,
            sessions: Mutex::new(HashMap::new()),
            inflight: Arc::new(InflightRegistry::new()),
            sweeper_stop: ShutdownSignal::new(),
        });
        if inner.config.inflight_ttl_ms > 0 {
            spawn_sweeper(&inner);
        }
        Self { inner }
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    // ── stats ──────────────────────────────────────────────────────────

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn inflight_count(&self) -> usize {
        self.inner.inflight.len()
    }

    pub fn list_inflight(&self) -> Vec<InflightInfo> {
        self.inner.inflight.list()
    }

    /// (handle, user, seconds open) of every session.
    pub fn list_sessions(&self) -> Vec<(String, String, u64)> {
        let mut out: Vec<_> = self
            .inner
            .sessions
            .lock()
            .iter()
            .map(|(h, s)| (h.clone(), s.user.clone(), s.created.elapsed().as_secs()))
            .collect();
        out.sort();
        out
    }

    /// Release idle detained objects now. Returns how many were released.
    pub fn sweep_inflight(&self, ttl: Duration) -> usize {
        let n = self.inner.inflight.sweep(ttl);
        self.inner.publish_gauges();
        n
    }

    /// Stop the sweeper, release every detained object and close every
    /// session.
    pub async fn shutdown(&self) {
        self.inner.sweeper_stop.shutdown();
        let inner = Arc::clone(&self.inner);
        let released = tokio::task::spawn_blocking(move || {
            let n = inner.inflight.release_all();
            let sessions: Vec<Arc<Session>> = inner.sessions.lock().drain().map(|(_, s)| s).collect();
            for s in sessions {
                if let Err(e) = s.conn.close() {
                    tracing::warn!(error = %e, "close session on shutdown failed");
                }
            }
            inner.publish_gauges();
            n
        })
        .await
        .unwrap_or(0);
        tracing::info!(released, "rpc server stopped");
    }

    // ── plumbing ───────────────────────────────────────────────────────

    async fn call<T, F>(&self, method: &'static str, ctx: String, f: F) -> Reply<T>
    where
        T: Send + 'static,
        F: FnOnce(&ServerInner) -> StrataResult<(T, String)> + Send + 'static,
    {
        let tick = Instant::now();
        let inner = Arc::clone(&self.inner);
        let result = blocking(method, ctx, move || f(&*inner)).await;
        finish(method, tick, result)
    }

    // ── handlers ───────────────────────────────────────────────────────

    /// Echo `token` after a round trip through the engine.
    pub async fn ping(&self, token: i64) -> Reply<PingBody> {
        self.call("Ping", String::new(), move |s| {
            s.db.ping()?;
            Ok((PingBody { token }, "success".to_string()))
        })
        .await
    }

    /// Open a session. A `$otp$:` password is checked by the auth provider
    /// and, on success, opens the session as a trusted user.
    pub async fn conn(&self, user: &str, password: &str) -> Reply<ConnBody> {
        let tick = Instant::now();
        let opt = match self.login_option(user, password).await {
            Ok(opt) => opt,
            Err(e) => return finish("Conn", tick, Err(e)),
        };
        let user = user.to_string();
        let inner = Arc::clone(&self.inner);
        let result = blocking("Conn", user.clone(), move || {
            let handle = inner.auth.generate_handle();
            let conn = inner.db.connect(&Context::background(), &[opt])?;
            tracing::debug!(handle = %handle, session = conn.id(), user = %user, "rpc session opened");
            let session = Arc::new(Session {
                conn,
                user,
                created: Instant::now(),
            });
            inner.sessions.lock().insert(handle.clone(), session);
            inner.publish_gauges();
            Ok((ConnBody { handle }, "success".to_string()))
        })
        .await;
        finish("Conn", tick, result)
    }

    async fn login_option(&self, user: &str, password: &str) -> StrataResult<ConnectOption> {
        match parse_otp(password) {
            Some(otp) => {
                if self.inner.auth.validate_user_otp(user, otp).await? {
                    Ok(ConnectOption::trust(user))
                } else {
                    Err(StrataError::Unauthorized("invalid user or password".into()))
                }
            }
            None => Ok(ConnectOption::password(user, password)),
        }
    }

    /// Close a session and release everything detained on it.
    pub async fn conn_close(&self, handle: &str) -> Reply<()> {
        let h = handle.to_string();
        self.call("ConnClose", h.clone(), move |s| {
            let session = s
                .session(&h)
                .map_err(|_| StrataError::HandleNotFound(h.clone()))?;
            let released = s.inflight.release_session(&h);
            session.conn.close()?;
            s.sessions.lock().remove(&h);
            s.publish_gauges();
            tracing::debug!(handle = %h, released, "rpc session closed");
            Ok(((), "success".to_string()))
        })
        .await
    }

    /// Check credentials without opening a session.
    pub async fn user_auth(&self, user: &str, password: &str) -> Reply<()> {
        let tick = Instant::now();
        let result = match parse_otp(password) {
            Some(otp) => self.inner.auth.validate_user_otp(user, otp).await,
            None => {
                let inner = Arc::clone(&self.inner);
                let (u, p) = (user.to_string(), password.to_string());
                blocking("UserAuth", u.clone(), move || inner.db.user_auth(&u, &p)).await
            }
        };
        let result = match result {
            Ok(true) => Ok(((), "success".to_string())),
            Ok(false) => Err(StrataError::Unauthorized("invalid user or password".into())),
            Err(e) => Err(e),
        };
        finish("UserAuth", tick, result)
    }

    pub async fn exec(&self, handle: &str, sql: &str, params: Vec<Value>) -> Reply<ExecBody> {
        let (h, sql) = (handle.to_string(), sql.to_string());
        self.call("Exec", h.clone(), move |s| {
            let session = s.session(&h)?;
            let res = session.conn.exec(&Context::background(), &sql, &params)?;
            Ok((
                ExecBody {
                    rows_affected: res.rows_affected,
                },
                res.message,
            ))
        })
        .await
    }

    /// Run a statement. A fetchable result is detained and its handle
    /// returned; anything else reports the affected count and is freed.
    pub async fn query(&self, handle: &str, sql: &str, params: Vec<Value>) -> Reply<QueryBody> {
        let (h, sql) = (handle.to_string(), sql.to_string());
        self.call("Query", h.clone(), move |s| {
            let session = s.session(&h)?;
            let mut rows = session.conn.query(&Context::background(), &sql, &params)?;
            if rows.is_fetchable() {
                let id = s.inflight.detain_rows(&h, rows);
                s.publish_gauges();
                return Ok((
                    QueryBody {
                        rows_handle: Some(id),
                        rows_affected: 0,
                    },
                    "success".to_string(),
                ));
            }
            let body = QueryBody {
                rows_handle: None,
                rows_affected: rows.rows_affected(),
            };
            let message = rows.message();
            rows.close()?;
            Ok((body, message))
        })
        .await
    }

    pub async fn query_row(&self, handle: &str, sql: &str, params: Vec<Value>) -> Reply<QueryRowBody> {
        let (h, sql) = (handle.to_string(), sql.to_string());
        self.call("QueryRow", h.clone(), move |s| {
            let session = s.session(&h)?;
            let row = session.conn.query_row(&Context::background(), &sql, &params)?;
            let message = row.message().to_string();
            let columns = row.columns().to_vec();
            let rows_affected = row.rows_affected();
            Ok((
                QueryRowBody {
                    columns,
                    values: row.into_values(),
                    rows_affected,
                },
                message,
            ))
        })
        .await
    }

    pub async fn columns(&self, rows_handle: &str) -> Reply<ColumnsBody> {
        let id = rows_handle.to_string();
        self.call("Columns", id.clone(), move |s| {
            let entry = s.inflight.rows(&id)?;
            let columns = entry.with_rows(|rows| Ok(rows.columns().to_vec()))?;
            Ok((ColumnsBody { columns }, "success".to_string()))
        })
        .await
    }

    /// Next row of a detained cursor. The end of data is a success with
    /// `has_no_rows` set.
    pub async fn rows_fetch(&self, rows_handle: &str) -> Reply<FetchBody> {
        let id = rows_handle.to_string();
        self.call("RowsFetch", id.clone(), move |s| {
            let entry = s.inflight.rows(&id)?;
            let body = match entry.with_rows(|rows| rows.fetch())? {
                Some(values) => FetchBody {
                    values,
                    has_no_rows: false,
                },
                None => FetchBody {
                    values: Vec::new(),
                    has_no_rows: true,
                },
            };
            Ok((body, "success".to_string()))
        })
        .await
    }

    /// Release a detained cursor. Closing an unknown or already released
    /// handle succeeds.
    pub async fn rows_close(&self, rows_handle: &str) -> Reply<()> {
        let id = rows_handle.to_string();
        self.call("RowsClose", id.clone(), move |s| {
            if let Some(kind) = s.inflight.kind_of(&id) {
                if kind != InflightKind::Rows {
                    return Err(StrataError::HandleNotValid(id));
                }
            }
            let released = s.inflight.release(&id);
            s.publish_gauges();
            released?;
            Ok(((), "success".to_string()))
        })
        .await
    }

    /// Open an appender on the session and detain it for [`RpcServer::append`].
    pub async fn appender(&self, handle: &str, table: &str) -> Reply<AppenderBody> {
        let (h, table) = (handle.to_string(), table.to_string());
        self.call("Appender", h.clone(), move |s| {
            let session = s.session(&h)?;
            let app = session.conn.appender(&Context::background(), &table)?;
            let table_name = app.table_name().to_string();
            let table_type = app.table_type();
            let columns = app.columns().to_vec();
            let id = s.inflight.detain_appender(&h, app);
            s.publish_gauges();
            Ok((
                AppenderBody {
                    handle: id,
                    table_name,
                    table_type,
                    columns,
                },
                "success".to_string(),
            ))
        })
        .await
    }

    /// Drive an append stream to its end.
    ///
    /// The first message names the appender. When the sender side closes,
    /// the appender is closed and its counts returned. The appender is
    /// released on every exit path.
    pub async fn append(&self, mut stream: mpsc::Receiver<AppendMessage>) -> Reply<AppendDone> {
        let tick = Instant::now();
        let mut handle: Option<String> = None;
        let result = loop {
            let Some(msg) = stream.recv().await else {
                let Some(id) = handle.take() else {
                    break Ok((AppendDone::default(), "success".to_string()));
                };
                let inner = Arc::clone(&self.inner);
                let res = blocking("Append", id.clone(), move || {
                    let released = inner.inflight.release(&id);
                    inner.publish_gauges();
                    let (success_count, fail_count) = released?.ok_or(StrataError::ClosedAppender)?;
                    Ok(AppendDone {
                        success_count,
                        fail_count,
                    })
                })
                .await;
                break res.map(|done| (done, "success".to_string()));
            };
            match &handle {
                None => {
                    if let Err(e) = self.inner.inflight.appender(&msg.handle) {
                        tracing::error!(handle = %msg.handle, error = %e, "append handle not found");
                        break Err(e);
                    }
                    handle = Some(msg.handle.clone());
                }
                Some(h) if *h != msg.handle => {
                    tracing::error!(handle = %msg.handle, "append handle changed");
                    break Err(StrataError::NotAllowed(
                        "not allowed changing handle in a stream".into(),
                    ));
                }
                Some(_) => {}
            }
            if msg.records.is_empty() {
                continue;
            }
            let inner = Arc::clone(&self.inner);
            let res = blocking("Append", msg.handle.clone(), move || {
                let entry = inner.inflight.appender(&msg.handle)?;
                entry.with_appender(|app| {
                    for rec in &msg.records {
                        app.append(rec)?;
                    }
                    Ok(())
                })
            })
            .await;
            if let Err(e) = res {
                tracing::error!(error = %e, "append failed");
                break Err(e);
            }
        };
        if let Some(id) = handle {
            let inner = Arc::clone(&self.inner);
            let _ = blocking("Append", id.clone(), move || {
                if let Err(e) = inner.inflight.release(&id) {
                    tracing::debug!(error = %e, "release after failed append stream");
                }
                inner.publish_gauges();
                Ok(())
            })
            .await;
        }
        finish("Append", tick, result)
    }

    pub async fn explain(&self, handle: &str, sql: &str, full: bool) -> Reply<ExplainBody> {
        let (h, sql) = (handle.to_string(), sql.to_string());
        self.call("Explain", h.clone(), move |s| {
            let session = s.session(&h)?;
            let plan = session.conn.explain(&Context::background(), &sql, full)?;
            Ok((ExplainBody { plan }, "success".to_string()))
        })
        .await
    }
}

impl ServerInner {
    fn session(&self, handle: &str) -> StrataResult<Arc<Session>> {
        self.sessions
            .lock()
            .get(handle)
            .cloned()
            .ok_or(StrataError::InvalidHandle)
    }

    fn publish_gauges(&self) {
        let (rows, appenders) = self.inflight.count_by_kind();
        let sessions = self.sessions.lock().len();
        strata_observability::record_rpc_inflight(rows, appenders, sessions);
    }
}

fn spawn_sweeper(inner: &Arc<ServerInner>) {
    let ttl = Duration::from_millis(inner.config.inflight_ttl_ms);
    let interval = Duration::from_millis(inner.config.inflight_sweep_interval_ms.max(1));
    let stop = inner.sweeper_stop.clone();
    let weak: Weak<ServerInner> = Arc::downgrade(inner);
    let spawned = std::thread::Builder::new()
        .name("strata-rpc-sweeper".into())
        .spawn(move || {
            while !stop.wait_timeout(interval) {
                let Some(inner) = weak.upgrade() else { break };
                let n = inner.inflight.sweep(ttl);
                if n > 0 {
                    inner.publish_gauges();
                }
            }
            tracing::debug!("rpc inflight sweeper stopped");
        });
    if let Err(e) = spawned {
        tracing::error!(error = %e, "failed to start rpc inflight sweeper");
    }
}

/// Run `f` on the blocking pool inside a panic guard.
async fn blocking<T, F>(method: &'static str, ctx: String, f: F) -> StrataResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StrataResult<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || crash_domain::catch_request_result(method, &ctx, f)).await
    {
        Ok(res) => res,
        Err(e) => Err(StrataError::Internal(format!("{} task failed: {}", method, e))),
    }
}

fn finish<T>(method: &'static str, tick: Instant, result: StrataResult<(T, String)>) -> Reply<T> {
    let elapse = tick.elapsed();
    strata_observability::record_rpc_request(method, elapse.as_micros() as u64, result.is_ok());
    match result {
        Ok((body, reason)) => Reply::ok(body, reason, elapse),
        Err(e) => {
            tracing::debug!(method, error = %e, "rpc call failed");
            Reply::fail(&e, elapse)
        }
    }
}
