//! Polling watcher that streams new rows of a tag or log table.
//!
//! Tag tables are watched per tag name through `V$<TABLE>_STAT`: a tag emits
//! its most recent row whenever its recent-row-time moves forward. Log
//! tables are watched through a monotonic `_ARRIVAL_TIME` cursor.
//!
//! Each [`Watcher::execute`] runs one polling round on background threads;
//! results arrive on the bounded channel from [`Watcher::receiver`], so a
//! slow consumer throttles the pollers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use strata_common::config::WatcherConfig;
use strata_common::timefmt::{format_datetime, TimeLocation};
use strata_common::{
    Column, Context, StrataError, StrataResult, TableName, TableType, Value,
};

use crate::conn::Conn;
use crate::describe::{describe_table, query_table_type};

const MAX_ROW_NUM_CAP: usize = 100;
const DEFAULT_MAX_ROW_NUM: usize = 20;
const DEFAULT_BUFFER_SIZE: usize = 100;

/// Opens a fresh connection for each poll.
pub type ConnFactory = Arc<dyn Fn() -> StrataResult<Conn> + Send + Sync>;

/// One channel element.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchData {
    /// Column name to value; datetimes rendered with the configured format.
    Record(BTreeMap<String, Value>),
    Error(StrataError),
}

pub struct WatchOptions {
    pub connect: ConnFactory,
    pub table: String,
    /// Tags to poll; required for tag tables, ignored for log tables.
    pub tags: Vec<String>,
    pub time_format: String,
    pub timezone: TimeLocation,
    /// Concurrent tag polls. 0 means one per tag.
    pub parallelism: usize,
    pub buffer_size: usize,
    /// Rows per log poll; 0 means the default of 20, capped at 100.
    pub max_row_num: usize,
}

impl WatchOptions {
    pub fn new(table: impl Into<String>, connect: ConnFactory) -> Self {
        Self {
            connect,
            table: table.into(),
            tags: Vec::new(),
            time_format: "ns".to_string(),
            timezone: TimeLocation::Utc,
            parallelism: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_row_num: DEFAULT_MAX_ROW_NUM,
        }
    }

    /// Take format, timezone, parallelism and sizes from `[watcher]`.
    pub fn with_config(mut self, cfg: &WatcherConfig) -> StrataResult<Self> {
        self.time_format = cfg.time_format.clone();
        self.timezone = TimeLocation::parse(&cfg.timezone)?;
        self.parallelism = cfg.parallelism;
        self.buffer_size = cfg.buffer_size;
        self.max_row_num = cfg.max_row_num;
        Ok(self)
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

enum Mode {
    Tag {
        name_column: String,
        time_column: String,
        /// Highest recent-row-time seen per tag.
        marks: Mutex<HashMap<String, i64>>,
    },
    Log {
        /// Highest arrival time emitted; `None` re-seeds from `max(_ARRIVAL_TIME)`.
        mark: Mutex<Option<i64>>,
    },
}

struct WatcherInner {
    ctx: Context,
    connect: ConnFactory,
    table: String,
    tags: Vec<String>,
    columns: Vec<Column>,
    time_format: String,
    timezone: TimeLocation,
    parallelism: usize,
    max_row_num: usize,
    mode: Mode,
    out: RwLock<Option<Sender<WatchData>>>,
    tokens_tx: Sender<()>,
    tokens_rx: Receiver<()>,
    /// Dropped on close; every blocked acquire or emit wakes up.
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    closed: AtomicBool,
}

/// Handle to one polling round. Joining waits for every poll it started.
#[derive(Debug, Default)]
pub struct WatchRound {
    polls: Vec<JoinHandle<()>>,
}

impl WatchRound {
    pub fn len(&self) -> usize {
        self.polls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polls.is_empty()
    }

    pub fn join(self) {
        for poll in self.polls {
            let _ = poll.join();
        }
    }
}

pub struct Watcher {
    inner: Arc<WatcherInner>,
    rx: Receiver<WatchData>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("table", &self.inner.table)
            .field("tags", &self.inner.tags)
            .field("parallelism", &self.inner.parallelism)
            .finish()
    }
}

impl Watcher {
    /// Validate the table and prepare the watcher. Canceling `ctx` closes it.
    pub fn new(ctx: &Context, opts: WatchOptions) -> StrataResult<Watcher> {
        let conn = (opts.connect)()?;
        let described = describe_watched(&conn, ctx, &opts);
        if let Err(e) = conn.close() {
            tracing::debug!(error = %e, "watcher setup connection close failed");
        }
        let (table_type, columns) = described?;
        let table = TableName::parse(&opts.table).table;

        let (mode, parallelism, max_row_num) = match table_type {
            TableType::Tag => {
                if opts.tags.is_empty() {
                    return Err(StrataError::InvalidArgument(format!(
                        "table '{}' is TAG table, no tag specified",
                        table
                    )));
                }
                let name_column = columns
                    .iter()
                    .find(|c| c.is_tag_name())
                    .map(|c| c.name.clone())
                    .ok_or_else(|| {
                        StrataError::InvalidArgument(format!("no tag name column in '{}'", table))
                    })?;
                let time_column = columns
                    .iter()
                    .find(|c| c.is_basetime())
                    .map(|c| c.name.clone())
                    .ok_or_else(|| {
                        StrataError::InvalidArgument(format!("no basetime column in '{}'", table))
                    })?;
                let parallelism = match opts.parallelism {
                    0 => opts.tags.len(),
                    n => n.min(opts.tags.len()),
                };
                let mode = Mode::Tag {
                    name_column,
                    time_column,
                    marks: Mutex::new(HashMap::new()),
                };
                (mode, parallelism, 0)
            }
            TableType::Log => {
                let max_row_num = match opts.max_row_num {
                    0 => DEFAULT_MAX_ROW_NUM,
                    n => n.min(MAX_ROW_NUM_CAP),
                };
                let mode = Mode::Log {
                    mark: Mutex::new(None),
                };
                (mode, 1, max_row_num)
            }
            other => {
                return Err(StrataError::not_allowed(format!(
                    "'{}' is {} table, only tag and log tables can be watched",
                    table,
                    other.as_str()
                )));
            }
        };

        let buffer = if opts.buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            opts.buffer_size
        };
        let (out_tx, out_rx) = crossbeam_channel::bounded(buffer);
        let (tokens_tx, tokens_rx) = crossbeam_channel::bounded(parallelism);
        for _ in 0..parallelism {
            let _ = tokens_tx.send(());
        }
        let (close_tx, close_rx) = crossbeam_channel::bounded::<()>(0);
        let inner = Arc::new(WatcherInner {
            ctx: ctx.child(),
            connect: opts.connect,
            table,
            tags: opts.tags,
            columns,
            time_format: opts.time_format,
            timezone: opts.timezone,
            parallelism,
            max_row_num,
            mode,
            out: RwLock::new(Some(out_tx)),
            tokens_tx,
            tokens_rx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            closed: AtomicBool::new(false),
        });
        inner.watch_context()?;
        tracing::debug!(
            table = %inner.table,
            tags = inner.tags.len(),
            parallelism,
            "watcher ready"
        );
        Ok(Watcher { inner, rx: out_rx })
    }

    /// Receiving end of the output channel. It disconnects after close.
    pub fn receiver(&self) -> &Receiver<WatchData> {
        &self.rx
    }

    pub fn parallelism(&self) -> usize {
        self.inner.parallelism
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Start one polling round.
    ///
    /// Tag tables poll every tag, at most `parallelism` at a time; this call
    /// blocks while all slots are busy. A log table round is skipped when the
    /// previous one has not finished.
    pub fn execute(&self) -> StrataResult<WatchRound> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(StrataError::Closed("watcher"));
        }
        let mut round = WatchRound::default();
        match &inner.mode {
            Mode::Tag { .. } => {
                for tag in &inner.tags {
                    if !inner.acquire_token() {
                        break;
                    }
                    let poller = Arc::clone(inner);
                    let tag = tag.clone();
                    round.polls.push(inner.spawn_poll(move || poller.poll_tag(&tag))?);
                }
            }
            Mode::Log { .. } => {
                if inner.tokens_rx.try_recv().is_ok() {
                    let poller = Arc::clone(inner);
                    round.polls.push(inner.spawn_poll(move || poller.poll_log())?);
                }
            }
        }
        Ok(round)
    }

    /// Wait for running polls, then disconnect the output channel. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.inner.close();
    }
}

fn describe_watched(
    conn: &Conn,
    ctx: &Context,
    opts: &WatchOptions,
) -> StrataResult<(TableType, Vec<Column>)> {
    let (table_type, _) = query_table_type(conn, ctx, &opts.table)?;
    let desc = describe_table(conn, ctx, &opts.table, false).map_err(|e| {
        StrataError::InvalidArgument(format!("fail to get table info '{}', {}", opts.table, e))
    })?;
    Ok((table_type, desc.columns))
}

impl WatcherInner {
    fn watch_context(self: &Arc<Self>) -> StrataResult<()> {
        let weak = Arc::downgrade(self);
        let ctx = self.ctx.clone();
        let close_rx = self.close_rx.clone();
        std::thread::Builder::new()
            .name("strata-watch-ctx".into())
            .spawn(move || {
                let deadline = ctx.deadline_channel();
                crossbeam_channel::select! {
                    recv(ctx.done()) -> _ => {}
                    recv(deadline) -> _ => {}
                    recv(close_rx) -> _ => return,
                }
                if let Some(inner) = weak.upgrade() {
                    tracing::debug!(table = %inner.table, "watcher context done");
                    inner.close();
                }
            })?;
        Ok(())
    }

    /// Take a parallelism token, or give up once the watcher closes.
    fn acquire_token(&self) -> bool {
        crossbeam_channel::select! {
            recv(self.tokens_rx) -> token => token.is_ok(),
            recv(self.close_rx) -> _ => false,
        }
    }

    fn spawn_poll<F>(&self, poll: F) -> StrataResult<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        let tokens = self.tokens_tx.clone();
        let spawned = std::thread::Builder::new()
            .name("strata-watch".into())
            .spawn(move || {
                poll();
                let _ = tokens.send(());
            });
        match spawned {
            Ok(handle) => Ok(handle),
            Err(e) => {
                let _ = self.tokens_tx.send(());
                Err(e.into())
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_tx.lock().take();
        // every token back means no poll is running
        for _ in 0..self.parallelism {
            let _ = self.tokens_rx.recv();
        }
        self.out.write().take();
        tracing::debug!(table = %self.table, "watcher closed");
    }

    /// Deliver one element; blocks while the channel is full.
    fn emit(&self, data: WatchData) {
        let Some(out) = self.out.read().clone() else {
            return;
        };
        crossbeam_channel::select! {
            send(out, data) -> _ => {}
            recv(self.close_rx) -> _ => {}
        }
    }

    fn emit_error(&self, err: StrataError) {
        tracing::debug!(table = %self.table, error = %err, "watch poll failed");
        self.emit(WatchData::Error(err));
    }

    fn record(&self, names: &[String], values: Vec<Value>) -> BTreeMap<String, Value> {
        names
            .iter()
            .cloned()
            .zip(values)
            .map(|(name, value)| match value {
                Value::Datetime(ns) => (name, format_datetime(ns, &self.time_format, &self.timezone)),
                other => (name, other),
            })
            .collect()
    }

    fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    fn connect(&self) -> Option<Conn> {
        match (self.connect)() {
            Ok(conn) => Some(conn),
            Err(e) => {
                self.emit_error(e);
                None
            }
        }
    }

    fn poll_tag(&self, tag: &str) {
        let Mode::Tag {
            name_column,
            time_column,
            marks,
        } = &self.mode
        else {
            return;
        };
        let Some(conn) = self.connect() else {
            return;
        };
        if let Err(e) = self.poll_tag_with(&conn, tag, name_column, time_column, marks) {
            self.emit_error(e);
        }
        if let Err(e) = conn.close() {
            tracing::debug!(error = %e, "watch connection close failed");
        }
    }

    fn poll_tag_with(
        &self,
        conn: &Conn,
        tag: &str,
        name_column: &str,
        time_column: &str,
        marks: &Mutex<HashMap<String, i64>>,
    ) -> StrataResult<()> {
        let stat = conn.query_row(
            &self.ctx,
            &format!("select RECENT_ROW_TIME from V${}_STAT where NAME = ?", self.table),
            &[Value::from(tag)],
        );
        let recent = match stat {
            Ok(row) => row.get::<i64>(0)?,
            // unknown tag
            Err(_) => return Ok(()),
        };
        {
            let mut marks = marks.lock();
            if matches!(marks.get(tag), Some(&last) if recent <= last) {
                return Ok(());
            }
            marks.insert(tag.to_string(), recent);
        }
        let names = self.column_names();
        let sql = format!(
            "select {} from {} where {} = ? and {} = ?",
            names.join(","),
            self.table,
            name_column,
            time_column
        );
        let row = match conn.query_row(&self.ctx, &sql, &[Value::from(tag), Value::Datetime(recent)]) {
            Ok(row) => row,
            Err(e) if e.is_no_rows() => return Ok(()),
            Err(e) => return Err(e),
        };
        let record = self.record(&names, row.into_values());
        self.emit(WatchData::Record(record));
        Ok(())
    }

    fn poll_log(&self) {
        let Mode::Log { mark } = &self.mode else {
            return;
        };
        let Some(conn) = self.connect() else {
            return;
        };
        if let Err(e) = self.poll_log_with(&conn, mark) {
            self.emit_error(e);
        }
        if let Err(e) = conn.close() {
            tracing::debug!(error = %e, "watch connection close failed");
        }
    }

    fn poll_log_with(&self, conn: &Conn, mark: &Mutex<Option<i64>>) -> StrataResult<()> {
        let since = match *mark.lock() {
            Some(since) => since,
            None => {
                let row = conn.query_row(
                    &self.ctx,
                    &format!("select max(_ARRIVAL_TIME) from {}", self.table),
                    &[],
                )?;
                let seeded = row.values().first().and_then(Value::as_i64).unwrap_or(0);
                *mark.lock() = Some(seeded);
                seeded
            }
        };
        let names = self.column_names();
        let sql = format!(
            "select _ARRIVAL_TIME,{} from {} where _ARRIVAL_TIME > ? order by _ARRIVAL_TIME limit {}",
            names.join(","),
            self.table,
            self.max_row_num + 1
        );
        let mut rows = conn.query(&self.ctx, &sql, &[Value::Datetime(since)])?;
        let mut count = 0usize;
        while rows.next() {
            count += 1;
            if count > self.max_row_num {
                *mark.lock() = None;
                rows.close()?;
                return Err(StrataError::Fetch("too many changes, omit the rest".into()));
            }
            let Some(values) = rows.values() else {
                break;
            };
            let mut values = values.to_vec();
            let arrival = values.remove(0).as_i64().unwrap_or(since);
            self.emit(WatchData::Record(self.record(&names, values)));
            *mark.lock() = Some(arrival);
        }
        if let Some(e) = rows.err() {
            let e = e.clone();
            rows.close()?;
            return Err(e);
        }
        rows.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ConnectOption;
    use crate::database::Database;
    use std::time::Duration;
    use strata_common::config::StrataConfig;
    use strata_engine::mem::MemEngine;

    const T1: i64 = 1_700_000_000_000_000_000;

    fn setup(ddl: &str) -> (Database, ConnFactory) {
        let db = Database::new(Arc::new(MemEngine::new()), StrataConfig::default()).unwrap();
        db.startup().unwrap();
        let conn = db
            .connect(&Context::background(), &[ConnectOption::trust("sys")])
            .unwrap();
        conn.exec(&Context::background(), ddl, &[]).unwrap();
        conn.close().unwrap();
        let factory_db = db.clone();
        let factory: ConnFactory = Arc::new(move || {
            factory_db.connect(&Context::background(), &[ConnectOption::trust("sys")])
        });
        (db, factory)
    }

    fn exec(db: &Database, sql: &str, params: &[Value]) {
        let conn = db
            .connect(&Context::background(), &[ConnectOption::trust("sys")])
            .unwrap();
        conn.exec(&Context::background(), sql, params).unwrap();
    }

    const TAG_DDL: &str =
        "create tag table tag (name varchar(20) primary key, time datetime basetime, value double)";

    #[test]
    fn test_tag_watch_emits_once_per_new_time() {
        let (db, factory) = setup(TAG_DDL);
        exec(
            &db,
            "insert into tag values (?, ?, ?)",
            &[Value::from("tag1"), Value::Datetime(T1), Value::Float64(1.5)],
        );
        let opts = WatchOptions::new("tag", factory).with_tags(["tag1", "tag2"]);
        let watcher = Watcher::new(&Context::background(), opts).unwrap();
        assert_eq!(watcher.parallelism(), 2);

        watcher.execute().unwrap().join();
        let got = watcher.receiver().try_recv().unwrap();
        let WatchData::Record(record) = got else {
            panic!("expected record, got {:?}", got);
        };
        assert_eq!(record.get("NAME"), Some(&Value::from("tag1")));
        assert_eq!(record.get("TIME"), Some(&Value::Int64(T1)));
        assert!(watcher.receiver().try_recv().is_err());

        watcher.execute().unwrap().join();
        assert!(watcher.receiver().try_recv().is_err());
        watcher.close();
    }

    #[test]
    fn test_tag_watch_requires_tags() {
        let (_db, factory) = setup(TAG_DDL);
        let err = Watcher::new(&Context::background(), WatchOptions::new("tag", factory)).unwrap_err();
        assert!(err.to_string().contains("no tag specified"));
    }

    #[test]
    fn test_parallelism_is_bounded_by_tags() {
        let (_db, factory) = setup(TAG_DDL);
        let mut opts = WatchOptions::new("tag", factory).with_tags(["a", "b", "c"]);
        opts.parallelism = 8;
        let watcher = Watcher::new(&Context::background(), opts).unwrap();
        assert_eq!(watcher.parallelism(), 3);
    }

    #[test]
    fn test_log_watch_streams_in_arrival_order() {
        let (db, factory) = setup("create table logs (msg varchar(40))");
        exec(&db, "insert into logs values ('before')", &[]);
        let watcher = Watcher::new(&Context::background(), WatchOptions::new("logs", factory)).unwrap();
        // the first round only seeds the cursor
        watcher.execute().unwrap().join();
        assert!(watcher.receiver().try_recv().is_err());

        exec(&db, "insert into logs values ('one')", &[]);
        exec(&db, "insert into logs values ('two')", &[]);
        watcher.execute().unwrap().join();
        let msgs: Vec<Value> = watcher
            .receiver()
            .try_iter()
            .map(|d| match d {
                WatchData::Record(r) => r["MSG"].clone(),
                WatchData::Error(e) => panic!("unexpected error {}", e),
            })
            .collect();
        assert_eq!(msgs, vec![Value::from("one"), Value::from("two")]);
    }

    #[test]
    fn test_log_watch_reports_too_many_changes() {
        let (db, factory) = setup("create table logs (msg varchar(40))");
        let mut opts = WatchOptions::new("logs", factory);
        opts.max_row_num = 2;
        let watcher = Watcher::new(&Context::background(), opts).unwrap();
        watcher.execute().unwrap().join();
        for i in 0..5 {
            exec(&db, "insert into logs values (?)", &[Value::from(format!("m{}", i))]);
        }
        watcher.execute().unwrap().join();
        let items: Vec<WatchData> = watcher.receiver().try_iter().collect();
        assert_eq!(items.len(), 3);
        assert!(matches!(&items[2], WatchData::Error(e) if e.to_string().contains("too many changes")));
        // the cursor re-seeds, so the next round is quiet
        watcher.execute().unwrap().join();
        assert!(watcher.receiver().try_recv().is_err());
    }

    #[test]
    fn test_volatile_table_is_rejected() {
        let (_db, factory) = setup("create volatile table vt (k integer)");
        let err = Watcher::new(&Context::background(), WatchOptions::new("vt", factory)).unwrap_err();
        assert!(matches!(err, StrataError::NotAllowed(_)));
    }

    #[test]
    fn test_close_disconnects_and_context_closes() {
        let (_db, factory) = setup(TAG_DDL);
        let watcher = Watcher::new(
            &Context::background(),
            WatchOptions::new("tag", Arc::clone(&factory)).with_tags(["t"]),
        )
        .unwrap();
        watcher.close();
        assert!(watcher.receiver().recv().is_err());
        assert!(matches!(watcher.execute(), Err(StrataError::Closed("watcher"))));

        let ctx = Context::background();
        let watcher = Watcher::new(&ctx, WatchOptions::new("tag", factory).with_tags(["t"])).unwrap();
        ctx.cancel();
        assert!(watcher
            .receiver()
            .recv_timeout(Duration::from_secs(5))
            .is_err());
        assert!(watcher.is_closed());
    }
}
