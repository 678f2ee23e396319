//! Process-level database handle: engine environment, admission gates,
//! session registry, worker pool and metrics.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use strata_common::config::StrataConfig;
use strata_common::{Context, StrataError, StrataResult};
use strata_engine::{Engine, EnvHandle};

use crate::admission::{resolve_limit, AcquireKind, Admission, AdmissionStats};
use crate::conn::{Conn, ConnInner, ConnectOption};
use crate::metrics::{Metrics, Phase, Resource};
use crate::session::{ConnState, SessionRegistry};
use crate::worker_pool::{WorkerPool, WorkerPoolStats};

pub(crate) struct DatabaseInner {
    engine: Arc<dyn Engine>,
    env: EnvHandle,
    config: StrataConfig,
    conn_gate: Admission,
    query_gate: Admission,
    sessions: SessionRegistry,
    metrics: Arc<Metrics>,
    pool: RwLock<Option<WorkerPool>>,
    append_workers: AtomicUsize,
    started: AtomicBool,
    stopped: AtomicBool,
    lifecycle: Mutex<()>,
}

/// Cheap to clone; all clones share one environment.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("env", &self.inner.env)
            .field("started", &self.is_started())
            .field("sessions", &self.inner.sessions.count())
            .finish()
    }
}

struct ConnectRequest {
    user: String,
    password: Option<String>,
    timeout: Option<Duration>,
}

fn connect_request(opts: &[ConnectOption], default_timeout: Option<Duration>) -> StrataResult<ConnectRequest> {
    let mut req = ConnectRequest {
        user: String::new(),
        password: None,
        timeout: default_timeout,
    };
    for opt in opts {
        match opt {
            ConnectOption::Password { user, password } => {
                req.user = user.clone();
                req.password = Some(password.clone());
            }
            ConnectOption::TrustUser(user) => {
                req.user = user.clone();
                req.password = None;
            }
            ConnectOption::Timeout(d) => req.timeout = Some(*d),
        }
    }
    if req.user.is_empty() {
        return Err(StrataError::Unauthorized("user is not specified".into()));
    }
    Ok(req)
}

impl Database {
    /// Initialize the engine environment, creating the database if needed.
    /// Call [`Database::startup`] before connecting.
    pub fn new(engine: Arc<dyn Engine>, config: StrataConfig) -> StrataResult<Self> {
        let env = engine.initialize(&config.database.home)?;
        if !engine.exists_database(env)? {
            engine.create_database(env)?;
            tracing::info!(home = %config.database.home, "database created");
        }
        let db = &config.database;
        let conn_gate = Admission::new(
            "max_open_conns",
            resolve_limit(db.max_open_conns, db.max_open_conns_factor),
        );
        let query_gate = Admission::new(
            "max_open_query",
            resolve_limit(db.max_open_query, db.max_open_query_factor),
        );
        Ok(Self {
            inner: Arc::new(DatabaseInner {
                engine,
                env,
                conn_gate,
                query_gate,
                sessions: SessionRegistry::new(),
                metrics: Arc::new(Metrics::new()),
                pool: RwLock::new(None),
                append_workers: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                lifecycle: Mutex::new(()),
                config,
            }),
        })
    }

    /// Start the engine, the worker pool (when enabled) and the metrics
    /// sampler. Runs once; later calls are no-ops.
    pub fn startup(&self) -> StrataResult<()> {
        let _guard = self.inner.lifecycle.lock();
        if self.inner.started.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(StrataError::Closed("database"));
        }
        self.inner.engine.startup(self.inner.env)?;
        let pool_cfg = &self.inner.config.worker_pool;
        if pool_cfg.enabled {
            *self.inner.pool.write() = Some(WorkerPool::start(pool_cfg.size)?);
        }
        let weak: Weak<DatabaseInner> = Arc::downgrade(&self.inner);
        self.inner.metrics.start_sampler(Box::new(move || match weak.upgrade() {
            Some(db) => {
                let busy = db
                    .pool
                    .read()
                    .as_ref()
                    .map(|p| p.stats().busy)
                    .unwrap_or(0);
                (
                    db.sessions.count(),
                    busy,
                    db.append_workers.load(Ordering::Relaxed),
                )
            }
            None => (0, 0, 0),
        }));
        self.inner.started.store(true, Ordering::Release);
        tracing::info!(
            max_open_conns = ?self.inner.conn_gate.limit(),
            max_open_query = ?self.inner.query_gate.limit(),
            worker_pool = pool_cfg.enabled,
            "database started"
        );
        Ok(())
    }

    /// Stop the sampler and the pool, then shut the engine down. Runs once.
    pub fn shutdown(&self) -> StrataResult<()> {
        let _guard = self.inner.lifecycle.lock();
        if !self.inner.started.load(Ordering::Acquire)
            || self.inner.stopped.swap(true, Ordering::AcqRel)
        {
            return Ok(());
        }
        self.inner.metrics.stop_sampler();
        if let Some(pool) = self.inner.pool.write().take() {
            pool.stop();
        }
        let open = self.inner.sessions.count();
        if open > 0 {
            tracing::warn!(sessions = open, "shutting down with open sessions");
        }
        self.inner.engine.shutdown(self.inner.env)?;
        self.inner.started.store(false, Ordering::Release);
        tracing::info!("database shut down");
        Ok(())
    }

    /// Release the engine environment. Call after [`Database::shutdown`].
    pub fn finalize(&self) -> StrataResult<()> {
        self.shutdown()?;
        self.inner.engine.finalize(self.inner.env)
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    fn ensure_started(&self) -> StrataResult<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(StrataError::NotInitialized)
        }
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.inner.engine
    }

    pub fn env(&self) -> EnvHandle {
        self.inner.env
    }

    pub fn config(&self) -> &StrataConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub(crate) fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub(crate) fn query_gate(&self) -> &Admission {
        &self.inner.query_gate
    }

    pub(crate) fn append_worker_opened(&self) {
        self.inner.append_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn append_worker_closed(&self) {
        self.inner.append_workers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Run `f` on a pinned pool worker when the pool is enabled, otherwise
    /// on the calling thread.
    pub(crate) fn run<T, F>(&self, f: F) -> StrataResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> StrataResult<T> + Send + 'static,
    {
        let pool = self.inner.pool.read().clone();
        match pool {
            Some(pool) if pool.is_running() => pool.submit(f)?,
            _ => f(),
        }
    }

    // ── connections ─────────────────────────────────────────────────────────

    /// Open a connection. Waits for an admission slot until the
    /// [`ConnectOption::Timeout`] (or the configured default) elapses or
    /// `ctx` is canceled.
    pub fn connect(&self, ctx: &Context, opts: &[ConnectOption]) -> StrataResult<Conn> {
        self.ensure_started()?;
        let default_timeout = match self.inner.config.database.connect_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let req = connect_request(opts, default_timeout)?;
        let permit = self
            .inner
            .conn_gate
            .acquire(ctx, req.timeout, AcquireKind::Connect)?;
        self.inner.metrics.observe(Phase::ConnectWait, permit.waited);
        self.open_conn(req.user, req.password, Some(permit))
    }

    /// Open a trusted connection outside the admission gate, for schema
    /// lookups and append workers.
    pub fn connect_internal(&self, user: &str) -> StrataResult<Conn> {
        self.ensure_started()?;
        self.open_conn(user.to_string(), None, None)
    }

    fn open_conn(
        &self,
        user: String,
        password: Option<String>,
        permit: Option<crate::admission::Permit>,
    ) -> StrataResult<Conn> {
        let engine = Arc::clone(&self.inner.engine);
        let env = self.inner.env;
        let login = user.clone();
        let (handle, id) = self.run(move || {
            let handle = match password {
                Some(pw) => engine.connect(env, &login, &pw),
                None => engine.connect_trust(env, &login),
            }
            .map_err(|e| match e {
                StrataError::Engine { message, .. } => StrataError::Unauthorized(message),
                other => other,
            })?;
            match engine.session_id(handle) {
                Ok(id) => Ok((handle, id)),
                Err(e) => {
                    if let Err(de) = engine.disconnect(handle) {
                        tracing::warn!(error = %de, "disconnect after failed session lookup");
                    }
                    Err(e)
                }
            }
        })?;
        let inner = Arc::new(ConnInner::new(self.clone(), handle, id, user, permit));
        self.inner.sessions.register(&inner);
        self.inner.metrics.resource_opened(Resource::Conn);
        inner.set_latest_sql("CONNECT");
        tracing::debug!(session = id, "connection opened");
        Ok(Conn::from_inner(inner))
    }

    pub fn user_auth(&self, user: &str, password: &str) -> StrataResult<bool> {
        self.ensure_started()?;
        let engine = Arc::clone(&self.inner.engine);
        let env = self.inner.env;
        let (user, password) = (user.to_string(), password.to_string());
        self.run(move || engine.user_auth(env, &user, &password))
    }

    /// Round trip through a fresh trusted connection.
    pub fn ping(&self) -> StrataResult<Duration> {
        let start = std::time::Instant::now();
        let conn = self.connect_internal(&self.inner.config.database.trusted_user)?;
        let pinged = conn.ping();
        conn.close()?;
        pinged?;
        Ok(start.elapsed())
    }

    // ── limits ──────────────────────────────────────────────────────────────

    /// −1 = unlimited, 0 = NumCPU × the configured factor.
    pub fn set_max_open_conns(&self, limit: i32) {
        let factor = self.inner.config.database.max_open_conns_factor;
        self.inner.conn_gate.resize(resolve_limit(limit, factor));
    }

    pub fn set_max_open_query(&self, limit: i32) {
        let factor = self.inner.config.database.max_open_query_factor;
        self.inner.query_gate.resize(resolve_limit(limit, factor));
    }

    pub fn conn_gate_stats(&self) -> AdmissionStats {
        self.inner.conn_gate.stats()
    }

    pub fn query_gate_stats(&self) -> AdmissionStats {
        self.inner.query_gate.stats()
    }

    // ── sessions ────────────────────────────────────────────────────────────

    pub fn list_sessions(&self) -> Vec<ConnState> {
        self.inner.sessions.list()
    }

    pub fn get_session(&self, id: u64) -> Option<ConnState> {
        self.inner.sessions.get(id)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.count()
    }

    /// Kill a live session by id; `force` skips the cancel step.
    pub fn kill_session(&self, id: u64, force: bool) -> StrataResult<()> {
        self.inner.sessions.kill(id, force)
    }

    // ── worker pool ─────────────────────────────────────────────────────────

    pub fn worker_pool_stats(&self) -> Option<WorkerPoolStats> {
        self.inner.pool.read().as_ref().map(|p| p.stats())
    }

    /// Resize a running pool. Fails when the pool is disabled.
    pub fn set_worker_pool_size(&self, size: usize) -> StrataResult<usize> {
        let pool = self
            .inner
            .pool
            .read()
            .clone()
            .ok_or_else(|| StrataError::not_allowed("worker pool is not enabled"))?;
        pool.resize(size)
    }

    pub fn append_worker_count(&self) -> usize {
        self.inner.append_workers.load(Ordering::Relaxed)
    }
}
