//! Access-layer metrics over rolling windows.
//!
//! Every observation lands in three windows (10 s in 1 s buckets, 1 min in
//! 5 s buckets, 15 min in 1 min buckets) and is also forwarded to the
//! `metrics` facade through `strata_observability`, so an installed
//! Prometheus exporter sees the same numbers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use strata_common::shutdown::ShutdownSignal;

pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Rolling window
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WindowStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl WindowStats {
    fn observe(&mut self, v: f64) {
        if self.count == 0 {
            self.min = v;
            self.max = v;
        } else {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.count += 1;
        self.sum += v;
    }

    fn merge(&mut self, other: &WindowStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

struct RollingWindow {
    bucket: Duration,
    slots: usize,
    buckets: VecDeque<(Instant, WindowStats)>,
}

impl RollingWindow {
    fn new(span: Duration, bucket: Duration) -> Self {
        let slots = (span.as_millis() / bucket.as_millis().max(1)).max(1) as usize;
        Self {
            bucket,
            slots,
            buckets: VecDeque::with_capacity(slots),
        }
    }

    fn expire(&mut self, now: Instant) {
        let span = self.bucket * self.slots as u32;
        while let Some((start, _)) = self.buckets.front() {
            if now.duration_since(*start) >= span {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn observe(&mut self, now: Instant, v: f64) {
        self.expire(now);
        match self.buckets.back_mut() {
            Some((start, stats)) if now.duration_since(*start) < self.bucket => stats.observe(v),
            _ => {
                let mut stats = WindowStats::default();
                stats.observe(v);
                self.buckets.push_back((now, stats));
            }
        }
    }

    fn snapshot(&mut self, now: Instant) -> WindowStats {
        self.expire(now);
        let mut out = WindowStats::default();
        for (_, stats) in &self.buckets {
            out.merge(stats);
        }
        out
    }
}

/// One measured quantity over the three windows.
struct Series {
    windows: [RollingWindow; 3],
}

impl Series {
    fn new() -> Self {
        Self {
            windows: [
                RollingWindow::new(Duration::from_secs(10), Duration::from_secs(1)),
                RollingWindow::new(Duration::from_secs(60), Duration::from_secs(5)),
                RollingWindow::new(Duration::from_secs(900), Duration::from_secs(60)),
            ],
        }
    }

    fn observe(&mut self, v: f64) {
        let now = Instant::now();
        for w in &mut self.windows {
            w.observe(now, v);
        }
    }

    fn snapshot(&mut self) -> SeriesSnapshot {
        let now = Instant::now();
        SeriesSnapshot {
            last_10s: self.windows[0].snapshot(now),
            last_1m: self.windows[1].snapshot(now),
            last_15m: self.windows[2].snapshot(now),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SeriesSnapshot {
    pub last_10s: WindowStats,
    pub last_1m: WindowStats,
    pub last_15m: WindowStats,
}

// ---------------------------------------------------------------------------
// Resources & phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Conn,
    Stmt,
    Appender,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Conn => "conn",
            Resource::Stmt => "stmt",
            Resource::Appender => "appender",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ConnectWait,
    ConnectHold,
    QueryExec,
    QueryWait,
    QueryFetch,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::ConnectWait => "connect_wait",
            Phase::ConnectHold => "connect_hold",
            Phase::QueryExec => "query_exec",
            Phase::QueryWait => "query_wait",
            Phase::QueryFetch => "query_fetch",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

struct ResourceCounter {
    opened: AtomicU64,
    closed: AtomicU64,
    in_use: AtomicI64,
    opens: Mutex<Series>,
}

impl ResourceCounter {
    fn new() -> Self {
        Self {
            opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            in_use: AtomicI64::new(0),
            opens: Mutex::new(Series::new()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub opened: u64,
    pub closed: u64,
    pub in_use: i64,
    /// Open events per window.
    pub opens: SeriesSnapshot,
}

/// The longest-running query seen since the last reset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HotQuery {
    pub sql: String,
    pub args: Vec<String>,
    pub total: Duration,
    pub wait: Duration,
    pub exec: Duration,
    pub fetch: Duration,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub conn: ResourceSnapshot,
    pub stmt: ResourceSnapshot,
    pub appender: ResourceSnapshot,
    /// Microseconds per phase, in `Phase` order.
    pub connect_wait: SeriesSnapshot,
    pub connect_hold: SeriesSnapshot,
    pub query_exec: SeriesSnapshot,
    pub query_wait: SeriesSnapshot,
    pub query_fetch: SeriesSnapshot,
    pub hot_query: Option<HotQuery>,
}

/// Runtime counters the sampler publishes: (sessions, busy workers, append workers).
pub type SampleSource = Box<dyn Fn() -> (usize, usize, usize) + Send + Sync>;

pub struct Metrics {
    resources: [ResourceCounter; 3],
    phases: [Mutex<Series>; 5],
    hot: Mutex<Option<HotQuery>>,
    sampler: Mutex<Option<(ShutdownSignal, JoinHandle<()>)>>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("conn_in_use", &self.in_use(Resource::Conn))
            .field("stmt_in_use", &self.in_use(Resource::Stmt))
            .field("appender_in_use", &self.in_use(Resource::Appender))
            .finish()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            resources: [
                ResourceCounter::new(),
                ResourceCounter::new(),
                ResourceCounter::new(),
            ],
            phases: [
                Mutex::new(Series::new()),
                Mutex::new(Series::new()),
                Mutex::new(Series::new()),
                Mutex::new(Series::new()),
                Mutex::new(Series::new()),
            ],
            hot: Mutex::new(None),
            sampler: Mutex::new(None),
        }
    }

    pub fn resource_opened(&self, r: Resource) {
        let c = &self.resources[r.index()];
        c.opened.fetch_add(1, Ordering::Relaxed);
        let now = c.in_use.fetch_add(1, Ordering::Relaxed) + 1;
        c.opens.lock().observe(1.0);
        strata_observability::record_resource_event(r.as_str(), "open");
        strata_observability::record_resource_in_use(r.as_str(), now);
    }

    pub fn resource_closed(&self, r: Resource) {
        let c = &self.resources[r.index()];
        c.closed.fetch_add(1, Ordering::Relaxed);
        let now = c.in_use.fetch_sub(1, Ordering::Relaxed) - 1;
        strata_observability::record_resource_event(r.as_str(), "close");
        strata_observability::record_resource_in_use(r.as_str(), now);
    }

    pub fn in_use(&self, r: Resource) -> i64 {
        self.resources[r.index()].in_use.load(Ordering::Relaxed)
    }

    pub fn observe(&self, phase: Phase, d: Duration) {
        let us = d.as_micros() as u64;
        self.phases[phase.index()].lock().observe(us as f64);
        strata_observability::record_phase_duration_us(phase.as_str(), us);
    }

    /// Record one finished query and raise the hot watermark if it is the slowest so far.
    pub fn observe_query(
        &self,
        sql: &str,
        args: &[String],
        wait: Duration,
        exec: Duration,
        fetch: Duration,
    ) {
        let total = wait + exec + fetch;
        let mut hot = self.hot.lock();
        if hot.as_ref().map_or(true, |h| total > h.total) {
            *hot = Some(HotQuery {
                sql: sql.to_string(),
                args: args.to_vec(),
                total,
                wait,
                exec,
                fetch,
                at: Utc::now(),
            });
        }
    }

    pub fn hot_query(&self) -> Option<HotQuery> {
        self.hot.lock().clone()
    }

    /// Clears the hot watermark; counters and windows are not resettable.
    pub fn reset_hot(&self) {
        self.hot.lock().take();
    }

    fn resource_snapshot(&self, r: Resource) -> ResourceSnapshot {
        let c = &self.resources[r.index()];
        ResourceSnapshot {
            opened: c.opened.load(Ordering::Relaxed),
            closed: c.closed.load(Ordering::Relaxed),
            in_use: c.in_use.load(Ordering::Relaxed),
            opens: c.opens.lock().snapshot(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let phase = |p: Phase| self.phases[p.index()].lock().snapshot();
        MetricsSnapshot {
            conn: self.resource_snapshot(Resource::Conn),
            stmt: self.resource_snapshot(Resource::Stmt),
            appender: self.resource_snapshot(Resource::Appender),
            connect_wait: phase(Phase::ConnectWait),
            connect_hold: phase(Phase::ConnectHold),
            query_exec: phase(Phase::QueryExec),
            query_wait: phase(Phase::QueryWait),
            query_fetch: phase(Phase::QueryFetch),
            hot_query: self.hot_query(),
        }
    }

    /// Start the 100 ms runtime sampler. A second call is a no-op.
    pub fn start_sampler(&self, source: SampleSource) {
        let mut slot = self.sampler.lock();
        if slot.is_some() {
            return;
        }
        let signal = ShutdownSignal::new();
        let stop = signal.clone();
        let spawned = std::thread::Builder::new()
            .name("strata-metrics-sampler".into())
            .spawn(move || loop {
                let (sessions, busy, appenders) = source();
                strata_observability::record_runtime_sample(sessions, busy, appenders);
                if stop.wait_timeout(SAMPLE_INTERVAL) {
                    break;
                }
            });
        match spawned {
            Ok(handle) => *slot = Some((signal, handle)),
            Err(e) => tracing::warn!(error = %e, "failed to start metrics sampler"),
        }
    }

    pub fn stop_sampler(&self) {
        let taken = self.sampler.lock().take();
        if let Some((signal, handle)) = taken {
            signal.shutdown();
            let _ = handle.join();
        }
    }

    pub fn sampler_running(&self) -> bool {
        self.sampler.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_window_merges_buckets() {
        let mut w = RollingWindow::new(Duration::from_secs(10), Duration::from_secs(1));
        let t0 = Instant::now();
        w.observe(t0, 5.0);
        w.observe(t0 + Duration::from_millis(1500), 1.0);
        w.observe(t0 + Duration::from_millis(2500), 9.0);
        let s = w.snapshot(t0 + Duration::from_secs(3));
        assert_eq!(s.count, 3);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 9.0);
        assert_eq!(s.avg(), 5.0);
    }

    #[test]
    fn test_window_expires_old_buckets() {
        let mut w = RollingWindow::new(Duration::from_secs(10), Duration::from_secs(1));
        let t0 = Instant::now();
        w.observe(t0, 5.0);
        w.observe(t0 + Duration::from_secs(9), 1.0);
        let s = w.snapshot(t0 + Duration::from_secs(11));
        assert_eq!(s.count, 1);
        assert_eq!(s.max, 1.0);
    }

    #[test]
    fn test_resource_counters() {
        let m = Metrics::new();
        m.resource_opened(Resource::Conn);
        m.resource_opened(Resource::Conn);
        m.resource_closed(Resource::Conn);
        let snap = m.snapshot();
        assert_eq!(snap.conn.opened, 2);
        assert_eq!(snap.conn.closed, 1);
        assert_eq!(snap.conn.in_use, 1);
        assert_eq!(snap.conn.opens.last_10s.count, 2);
        assert_eq!(snap.stmt.opened, 0);
    }

    #[test]
    fn test_hot_query_keeps_longest_and_resets() {
        let m = Metrics::new();
        let ms = Duration::from_millis;
        m.observe_query("select 1", &[], ms(1), ms(2), ms(3));
        m.observe_query("select 2", &["x".into()], ms(10), ms(0), ms(0));
        m.observe_query("select 3", &[], ms(1), ms(1), ms(1));
        let hot = m.hot_query().unwrap();
        assert_eq!(hot.sql, "select 2");
        assert_eq!(hot.args, vec!["x".to_string()]);
        assert_eq!(hot.total, ms(10));
        m.reset_hot();
        assert!(m.hot_query().is_none());
    }

    #[test]
    fn test_phase_observation() {
        let m = Metrics::new();
        m.observe(Phase::QueryExec, Duration::from_micros(250));
        let snap = m.snapshot();
        assert_eq!(snap.query_exec.last_1m.count, 1);
        assert_eq!(snap.query_exec.last_1m.sum, 250.0);
        assert_eq!(snap.query_fetch.last_1m.count, 0);
    }

    #[test]
    fn test_sampler_start_stop() {
        let m = Metrics::new();
        let calls = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&calls);
        m.start_sampler(Box::new(move || {
            c.fetch_add(1, Ordering::Relaxed);
            (0, 0, 0)
        }));
        assert!(m.sampler_running());
        std::thread::sleep(Duration::from_millis(250));
        m.stop_sampler();
        assert!(!m.sampler_running());
        assert!(calls.load(Ordering::Relaxed) >= 2);
    }
}
