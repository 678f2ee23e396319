//! Long-lived per-table append workers.
//!
//! One worker per fully-qualified table name owns a trusted connection and an
//! open [`Appender`] on a dedicated pinned thread. Callers get a cheap handle
//! whose `append` only enqueues; the worker feeds the engine in FIFO order.
//! Closing a handle drops a reference and leaves the worker warm. A sweeper
//! stops workers that have no references and have been idle for a while.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use strata_common::shutdown::ShutdownSignal;
use strata_common::value::datetime_to_nanos;
use strata_common::{Column, Context, StrataError, StrataResult, TableName, TableType, Value};

use crate::appender::{Appender, InputColumns};
use crate::conn::Conn;
use crate::database::Database;
use crate::worker_pool::pin_current_thread;

/// Outcome of stopping one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub table: String,
    pub success: u64,
    pub fail: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppendWorkerInfo {
    pub table: String,
    pub refs: usize,
    pub queued: usize,
    pub enqueued: u64,
    pub idle_ms: u64,
}

type Record = Vec<Value>;
type WorkerResult = StrataResult<(u64, u64)>;

struct AppendWorker {
    table: String,
    table_type: TableType,
    columns: Vec<Column>,
    tx: RwLock<Option<Sender<Record>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<WorkerResult>>>,
    refs: AtomicUsize,
    last_use: Mutex<Instant>,
    enqueued: AtomicU64,
}

impl AppendWorker {
    fn spawn(db: &Database, table: String, capacity: usize) -> StrataResult<AppendWorker> {
        let (tx, rx) = crossbeam_channel::bounded::<Record>(capacity.max(1));
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let (ready_tx, ready_rx) =
            crossbeam_channel::bounded::<StrataResult<(TableType, Vec<Column>)>>(1);
        let worker_db = db.clone();
        let name = table.clone();
        let thread = std::thread::Builder::new()
            .name(format!("strata-append-{}", table))
            .spawn(move || -> WorkerResult {
                pin_current_thread();
                let (conn, mut appender) = match open_appender(&worker_db, &name) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.clone()));
                        return Err(e);
                    }
                };
                let _ = ready_tx.send(Ok((appender.table_type(), appender.columns().to_vec())));
                drop(ready_tx);
                feed(&name, &mut appender, &rx, &stop_rx);
                let closed = appender.close();
                if let Err(e) = conn.close() {
                    tracing::warn!(table = %name, error = %e, "append worker connection close failed");
                }
                closed
            })?;
        let (table_type, columns) = match ready_rx.recv() {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(StrataError::Internal(format!(
                    "append worker for {} exited before it was ready",
                    table
                )));
            }
        };
        Ok(AppendWorker {
            table,
            table_type,
            columns,
            tx: RwLock::new(Some(tx)),
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
            refs: AtomicUsize::new(0),
            last_use: Mutex::new(Instant::now()),
            enqueued: AtomicU64::new(0),
        })
    }

    fn is_running(&self) -> bool {
        self.tx.read().is_some()
    }

    fn touch(&self) {
        *self.last_use.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_use.lock().elapsed()
    }

    /// Values the caller supplies per record: log tables exclude arrival time.
    fn input_width(&self) -> usize {
        self.columns.len()
    }

    fn enqueue(&self, record: Record) -> StrataResult<()> {
        // The send happens under the read lock so `stop` cannot take the
        // sender between the check and the send.
        let tx = self.tx.read();
        let tx = tx.as_ref().ok_or(StrataError::ClosedAppender)?;
        self.touch();
        // blocks while the queue is full
        tx.send(record).map_err(|_| StrataError::ClosedAppender)?;
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop accepting records, let the thread drain its queue and close the
    /// appender. Returns the engine's `(success, fail)`.
    fn stop(&self) -> WorkerResult {
        self.tx.write().take();
        self.stop_tx.lock().take();
        let thread = self.thread.lock().take();
        let Some(thread) = thread else {
            return Err(StrataError::Closed("append worker"));
        };
        let result = match thread.join() {
            Ok(r) => r,
            Err(_) => Err(StrataError::Internal(format!(
                "append worker for {} panicked",
                self.table
            ))),
        };
        if let Ok((success, fail)) = &result {
            strata_observability::record_append_batch(&self.table, *success, *fail);
        }
        result
    }

    fn report(&self, result: WorkerResult) -> FlushReport {
        match result {
            Ok((success, fail)) => FlushReport {
                table: self.table.clone(),
                success,
                fail,
                error: None,
            },
            Err(e) => FlushReport {
                table: self.table.clone(),
                success: 0,
                fail: 0,
                error: Some(e.to_string()),
            },
        }
    }
}

fn open_appender(db: &Database, table: &str) -> StrataResult<(Conn, Appender)> {
    let conn = db.connect_internal(&db.config().database.trusted_user)?;
    match conn.appender(&Context::background(), table) {
        Ok(appender) => Ok((conn, appender)),
        Err(e) => {
            let _ = conn.close();
            Err(e)
        }
    }
}

/// Append until stopped, then drain whatever is still queued.
fn feed(table: &str, appender: &mut Appender, rx: &Receiver<Record>, stop_rx: &Receiver<()>) {
    let mut append = |record: Record| {
        if let Err(e) = appender.append(&record) {
            tracing::warn!(table = %table, error = %e, "append worker record failed");
        }
    };
    loop {
        crossbeam_channel::select! {
            recv(stop_rx) -> _ => break,
            recv(rx) -> msg => match msg {
                Ok(record) => append(record),
                Err(_) => break,
            },
        }
    }
    let mut drained = 0usize;
    while let Ok(record) = rx.try_recv() {
        append(record);
        drained += 1;
    }
    tracing::debug!(table = %table, drained, "append worker stopping");
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Caller's reference to a shared append worker. `close` (or drop) only
/// releases the reference.
pub struct AppendWorkerHandle {
    worker: Arc<AppendWorker>,
    input: Option<InputColumns>,
    released: bool,
}

impl std::fmt::Debug for AppendWorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendWorkerHandle")
            .field("table", &self.worker.table)
            .field("released", &self.released)
            .finish()
    }
}

impl AppendWorkerHandle {
    pub fn table_name(&self) -> &str {
        &self.worker.table
    }

    pub fn table_type(&self) -> TableType {
        self.worker.table_type
    }

    /// Columns a record supplies values for.
    pub fn columns(&self) -> &[Column] {
        &self.worker.columns
    }

    /// Reorder values by name for this handle only; columns not named
    /// receive NULL.
    pub fn with_input_columns(mut self, names: &[&str]) -> Self {
        self.input = Some(InputColumns::new(&self.worker.columns, names));
        self
    }

    fn check_open(&self) -> StrataResult<()> {
        if self.released {
            return Err(StrataError::ClosedAppender);
        }
        Ok(())
    }

    /// Caller values in column order, one per input column.
    fn arrange(&self, values: &[Value]) -> StrataResult<Record> {
        let (record, expected) = match &self.input {
            Some(input) => (input.arrange(values), input.len()),
            None => {
                let width = self.worker.input_width();
                ((values.len() == width).then(|| values.to_vec()), width)
            }
        };
        record.ok_or_else(|| StrataError::LengthOfColumns {
            table: self.worker.table.clone(),
            expected,
            got: values.len(),
        })
    }

    /// Queue one record. Blocks only while the worker's queue is full.
    pub fn append(&self, values: &[Value]) -> StrataResult<()> {
        self.check_open()?;
        let record = self.arrange(values)?;
        self.worker.enqueue(record)
    }

    /// Queue one record for a log table with an explicit arrival time.
    pub fn append_log_time(&self, ts: DateTime<Utc>, values: &[Value]) -> StrataResult<()> {
        self.check_open()?;
        if self.worker.table_type != TableType::Log {
            return Err(StrataError::not_allowed(format!(
                "{} is not a log table, use append instead",
                self.worker.table
            )));
        }
        let mut record = self.arrange(values)?;
        record.insert(0, Value::Datetime(datetime_to_nanos(ts)));
        self.worker.enqueue(record)
    }

    /// Release this reference. Idempotent; the worker keeps running.
    pub fn close(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.worker.touch();
        self.worker.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for AppendWorkerHandle {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct RegistryInner {
    db: Database,
    capacity: usize,
    idle_timeout: Duration,
    workers: DashMap<String, Arc<AppendWorker>>,
    create_lock: Mutex<()>,
    sweeper: Mutex<Option<(ShutdownSignal, JoinHandle<()>)>>,
}

impl RegistryInner {
    fn remove_and_stop(&self, name: &str) -> Option<FlushReport> {
        let (_, worker) = self.workers.remove(name)?;
        let result = worker.stop();
        self.db.append_worker_closed();
        if let Err(e) = &result {
            tracing::warn!(table = %name, error = %e, "append worker stop failed");
        }
        Some(worker.report(result))
    }

    fn sweep(&self, idle: Duration) -> usize {
        let stale: Vec<String> = self
            .workers
            .iter()
            .filter(|e| {
                let w = e.value();
                w.refs.load(Ordering::Acquire) == 0 && w.idle_for() >= idle
            })
            .map(|e| e.key().clone())
            .collect();
        let _guard = self.create_lock.lock();
        let mut evicted = 0;
        for name in stale {
            // re-check under the create lock: a caller may have taken a reference
            let still_idle = self
                .workers
                .get(&name)
                .map(|w| w.refs.load(Ordering::Acquire) == 0)
                .unwrap_or(false);
            if still_idle && self.remove_and_stop(&name).is_some() {
                tracing::info!(table = %name, "idle append worker evicted");
                evicted += 1;
            }
        }
        evicted
    }
}

/// Process-wide registry of append workers keyed by table name.
#[derive(Clone)]
pub struct AppendWorkers {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for AppendWorkers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendWorkers")
            .field("workers", &self.count())
            .finish()
    }
}

impl AppendWorkers {
    /// Create the registry and start its idle sweeper.
    pub fn start(db: Database) -> StrataResult<Self> {
        let cfg = db.config().append_worker.clone();
        let registry = Self {
            inner: Arc::new(RegistryInner {
                db,
                capacity: cfg.queue_capacity,
                idle_timeout: Duration::from_millis(cfg.idle_timeout_ms),
                workers: DashMap::new(),
                create_lock: Mutex::new(()),
                sweeper: Mutex::new(None),
            }),
        };
        registry.start_sweeper(Duration::from_millis(cfg.sweep_interval_ms))?;
        Ok(registry)
    }

    fn start_sweeper(&self, interval: Duration) -> StrataResult<()> {
        let signal = ShutdownSignal::new();
        let stop = signal.clone();
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let handle = std::thread::Builder::new()
            .name("strata-append-sweeper".into())
            .spawn(move || {
                while !stop.wait_timeout(interval) {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    let evicted = inner.sweep(inner.idle_timeout);
                    if evicted > 0 {
                        tracing::debug!(evicted, "append worker sweep");
                    }
                }
            })?;
        *self.inner.sweeper.lock() = Some((signal, handle));
        Ok(())
    }

    /// Handle to the worker for `table`, starting one if needed.
    pub fn get(&self, ctx: &Context, table: &str) -> StrataResult<AppendWorkerHandle> {
        if let Some(e) = ctx.err() {
            return Err(e);
        }
        let name = TableName::parse(table).to_string();
        let _guard = self.inner.create_lock.lock();
        let existing = self.inner.workers.get(&name).map(|w| Arc::clone(w.value()));
        let worker = match existing {
            Some(w) if w.is_running() => w,
            _ => {
                let w = Arc::new(AppendWorker::spawn(
                    &self.inner.db,
                    name.clone(),
                    self.inner.capacity,
                )?);
                self.inner.workers.insert(name.clone(), Arc::clone(&w));
                self.inner.db.append_worker_opened();
                tracing::info!(table = %name, "append worker started");
                w
            }
        };
        worker.refs.fetch_add(1, Ordering::AcqRel);
        worker.touch();
        Ok(AppendWorkerHandle {
            worker,
            input: None,
            released: false,
        })
    }

    /// Stop the named workers, flushing their queues to the engine, and
    /// remove them. An empty list flushes **all** workers.
    pub fn flush(&self, tables: &[&str]) -> Vec<FlushReport> {
        let names: Vec<String> = if tables.is_empty() {
            self.inner.workers.iter().map(|e| e.key().clone()).collect()
        } else {
            tables
                .iter()
                .map(|t| TableName::parse(t).to_string())
                .collect()
        };
        let _guard = self.inner.create_lock.lock();
        names
            .iter()
            .filter_map(|name| self.inner.remove_and_stop(name))
            .collect()
    }

    /// Stop the sweeper and every worker, referenced or not.
    pub fn stop_all(&self) -> Vec<FlushReport> {
        let sweeper = self.inner.sweeper.lock().take();
        if let Some((signal, handle)) = sweeper {
            signal.shutdown();
            let _ = handle.join();
        }
        let reports = self.flush(&[]);
        tracing::info!(workers = reports.len(), "append workers stopped");
        reports
    }

    /// Evict unreferenced workers idle for at least `idle`. Returns the count.
    pub fn sweep(&self, idle: Duration) -> usize {
        self.inner.sweep(idle)
    }

    pub fn count(&self) -> usize {
        self.inner.workers.len()
    }

    pub fn list(&self) -> Vec<AppendWorkerInfo> {
        let mut out: Vec<AppendWorkerInfo> = self
            .inner
            .workers
            .iter()
            .map(|e| {
                let w = e.value();
                AppendWorkerInfo {
                    table: w.table.clone(),
                    refs: w.refs.load(Ordering::Acquire),
                    queued: w.tx.read().as_ref().map(|tx| tx.len()).unwrap_or(0),
                    enqueued: w.enqueued.load(Ordering::Relaxed),
                    idle_ms: w.idle_for().as_millis() as u64,
                }
            })
            .collect();
        out.sort_by(|a, b| a.table.cmp(&b.table));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ConnectOption;
    use chrono::TimeZone;
    use std::sync::Arc;
    use strata_common::config::StrataConfig;
    use strata_engine::mem::MemEngine;

    fn setup() -> (Database, AppendWorkers) {
        let mut cfg = StrataConfig::default();
        // keep the background sweeper out of the way
        cfg.append_worker.sweep_interval_ms = 60_000;
        let db = Database::new(Arc::new(MemEngine::new()), cfg).unwrap();
        db.startup().unwrap();
        let conn = db
            .connect(&Context::background(), &[ConnectOption::trust("sys")])
            .unwrap();
        conn.exec(
            &Context::background(),
            "create tag table tag (name varchar(20) primary key, time datetime basetime, value double)",
            &[],
        )
        .unwrap();
        conn.exec(&Context::background(), "create table logs (msg varchar(40))", &[])
            .unwrap();
        conn.close().unwrap();
        let workers = AppendWorkers::start(db.clone()).unwrap();
        (db, workers)
    }

    fn tag_record(i: i64) -> Vec<Value> {
        vec![
            Value::String(format!("t{}", i % 3)),
            Value::Datetime(1_700_000_000_000_000_000 + i),
            Value::Float64(i as f64),
        ]
    }

    #[test]
    fn test_handles_share_one_worker() {
        let (db, workers) = setup();
        let ctx = Context::background();
        let mut a = workers.get(&ctx, "tag").unwrap();
        let mut b = workers.get(&ctx, "sys.TAG").unwrap();
        assert_eq!(workers.count(), 1);
        assert_eq!(db.append_worker_count(), 1);
        assert_eq!(a.table_name(), b.table_name());
        assert_eq!(workers.list()[0].refs, 2);
        a.close();
        a.close();
        assert_eq!(workers.list()[0].refs, 1);
        b.close();
        // closing every handle leaves the worker warm
        assert_eq!(workers.count(), 1);
        workers.stop_all();
        assert_eq!(db.append_worker_count(), 0);
    }

    #[test]
    fn test_flush_reports_every_record() {
        let (_db, workers) = setup();
        let ctx = Context::background();
        let handle = workers.get(&ctx, "tag").unwrap();
        for i in 0..500 {
            handle.append(&tag_record(i)).unwrap();
        }
        let reports = workers.flush(&["tag"]);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].error, None);
        assert_eq!(reports[0].success + reports[0].fail, 500);
        assert_eq!(reports[0].success, 500);
        assert_eq!(workers.count(), 0);
        assert!(matches!(
            handle.append(&tag_record(1)),
            Err(StrataError::ClosedAppender)
        ));
    }

    #[test]
    fn test_wrong_width_is_rejected_synchronously() {
        let (_db, workers) = setup();
        let handle = workers.get(&Context::background(), "logs").unwrap();
        assert_eq!(handle.table_type(), TableType::Log);
        assert_eq!(handle.columns().len(), 1);
        let err = handle.append(&[]).unwrap_err();
        assert!(matches!(err, StrataError::LengthOfColumns { expected: 1, got: 0, .. }));
        handle.append(&[Value::String("hello".into())]).unwrap();
        let reports = workers.stop_all();
        assert_eq!(reports[0].success, 1);
    }

    #[test]
    fn test_log_time_goes_through_the_worker() {
        let (db, workers) = setup();
        let ctx = Context::background();
        let handle = workers.get(&ctx, "logs").unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        handle
            .append_log_time(ts, &[Value::String("late".into())])
            .unwrap();
        assert!(matches!(
            handle.append_log_time(ts, &[]),
            Err(StrataError::LengthOfColumns { expected: 1, got: 0, .. })
        ));
        let tag = workers.get(&ctx, "tag").unwrap();
        assert!(matches!(
            tag.append_log_time(ts, &tag_record(1)),
            Err(StrataError::NotAllowed(_))
        ));
        let reports = workers.flush(&["logs"]);
        assert_eq!(reports[0].success, 1);

        let conn = db
            .connect(&ctx, &[ConnectOption::trust("sys")])
            .unwrap();
        let row = conn
            .query_row(&ctx, "select _ARRIVAL_TIME, msg from logs", &[])
            .unwrap();
        assert_eq!(
            row.values(),
            &[
                Value::Datetime(datetime_to_nanos(ts)),
                Value::String("late".into())
            ]
        );
    }

    #[test]
    fn test_input_columns_are_per_handle() {
        let (db, workers) = setup();
        let ctx = Context::background();
        let named = workers
            .get(&ctx, "tag")
            .unwrap()
            .with_input_columns(&["value", "NAME", "time"]);
        let plain = workers.get(&ctx, "tag").unwrap();
        assert_eq!(workers.count(), 1);
        named
            .append(&[
                Value::Float64(1.5),
                Value::String("named".into()),
                Value::Datetime(1_700_000_000_000_000_000),
            ])
            .unwrap();
        assert!(matches!(
            named.append(&[Value::Float64(1.5)]),
            Err(StrataError::LengthOfColumns { expected: 3, got: 1, .. })
        ));
        plain.append(&tag_record(1)).unwrap();
        let reports = workers.flush(&["tag"]);
        assert_eq!(reports[0].success, 2);

        let conn = db
            .connect(&ctx, &[ConnectOption::trust("sys")])
            .unwrap();
        let row = conn
            .query_row(&ctx, "select value from tag where name = 'named'", &[])
            .unwrap();
        assert_eq!(row.values(), &[Value::Float64(1.5)]);
    }

    #[test]
    fn test_appends_racing_a_flush_are_all_counted() {
        let (_db, workers) = setup();
        let ctx = Context::background();
        let accepted = Arc::new(AtomicU64::new(0));
        let writers: Vec<_> = (0..4i64)
            .map(|w| {
                let handle = workers.get(&ctx, "tag").unwrap();
                let accepted = Arc::clone(&accepted);
                std::thread::spawn(move || {
                    for i in 0..2_000 {
                        if handle.append(&tag_record(w * 10_000 + i)).is_err() {
                            break;
                        }
                        accepted.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        std::thread::sleep(Duration::from_millis(5));
        let reports = workers.flush(&["tag"]);
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0].success + reports[0].fail,
            accepted.load(Ordering::Relaxed)
        );
    }

    #[test]
    fn test_stop_all_ignores_references() {
        let (_db, workers) = setup();
        let ctx = Context::background();
        let _tag = workers.get(&ctx, "tag").unwrap();
        let _logs = workers.get(&ctx, "logs").unwrap();
        let reports = workers.stop_all();
        assert_eq!(reports.len(), 2);
        assert_eq!(workers.count(), 0);
    }

    #[test]
    fn test_sweep_evicts_only_unreferenced() {
        let (_db, workers) = setup();
        let ctx = Context::background();
        let held = workers.get(&ctx, "tag").unwrap();
        let mut released = workers.get(&ctx, "logs").unwrap();
        released.close();
        assert_eq!(workers.sweep(Duration::ZERO), 1);
        let names: Vec<String> = workers.list().into_iter().map(|w| w.table).collect();
        assert_eq!(names, vec![held.table_name().to_string()]);
        drop(held);
        assert_eq!(workers.sweep(Duration::from_secs(3600)), 0);
        assert_eq!(workers.sweep(Duration::ZERO), 1);
    }

    #[test]
    fn test_unknown_table_fails_to_start() {
        let (db, workers) = setup();
        assert!(workers.get(&Context::background(), "nope").is_err());
        assert_eq!(workers.count(), 0);
        assert_eq!(db.append_worker_count(), 0);
    }
}
