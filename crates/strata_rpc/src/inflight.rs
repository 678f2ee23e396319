//! Cursors and appenders detained between RPC calls.
//!
//! Each detained object lives under an opaque id `"<address>#<serial>"`.
//! The address alone can repeat once an entry is freed, the serial cannot.
//! Releasing removes the entry and closes the object, once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use strata_access::{Appender, Rows};
use strata_common::{StrataError, StrataResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InflightKind {
    Rows,
    Appender,
}

impl std::fmt::Display for InflightKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InflightKind::Rows => write!(f, "ROWS"),
            InflightKind::Appender => write!(f, "APND"),
        }
    }
}

pub(crate) enum Detained {
    Rows(Rows),
    Appender(Appender),
}

/// Snapshot of one detained object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InflightInfo {
    pub id: String,
    pub kind: InflightKind,
    /// Session handle the object was opened on.
    pub session: String,
    /// SQL text for cursors, table name for appenders.
    pub label: String,
    pub created_time: DateTime<Utc>,
    pub idle_ms: u64,
}

pub(crate) struct InflightEntry {
    kind: InflightKind,
    session: String,
    label: String,
    created_time: DateTime<Utc>,
    last_access: Mutex<Instant>,
    slot: Mutex<Option<Detained>>,
}

impl InflightEntry {
    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    /// Run `f` on the detained cursor. Fails once the entry was released.
    pub(crate) fn with_rows<T>(&self, f: impl FnOnce(&mut Rows) -> StrataResult<T>) -> StrataResult<T> {
        self.touch();
        match self.slot.lock().as_mut() {
            Some(Detained::Rows(rows)) => f(rows),
            Some(Detained::Appender(_)) => Err(StrataError::Internal("not a cursor".into())),
            None => Err(StrataError::Closed("rows")),
        }
    }

    pub(crate) fn with_appender<T>(
        &self,
        f: impl FnOnce(&mut Appender) -> StrataResult<T>,
    ) -> StrataResult<T> {
        self.touch();
        match self.slot.lock().as_mut() {
            Some(Detained::Appender(app)) => f(app),
            Some(Detained::Rows(_)) => Err(StrataError::Internal("not an appender".into())),
            None => Err(StrataError::ClosedAppender),
        }
    }

    /// Close the detained object. Later calls return `Ok(None)`.
    fn close(&self, id: &str) -> StrataResult<Option<(u64, u64)>> {
        let Some(detained) = self.slot.lock().take() else {
            return Ok(None);
        };
        match detained {
            Detained::Rows(mut rows) => {
                rows.close()?;
                Ok(Some((0, 0)))
            }
            Detained::Appender(mut app) => {
                let (success, fail) = app.close()?;
                tracing::debug!(id, table = %self.label, success, fail, "close detained appender");
                Ok(Some((success, fail)))
            }
        }
    }
}

/// Concurrent map of detained objects.
#[derive(Default)]
pub struct InflightRegistry {
    entries: DashMap<String, Arc<InflightEntry>>,
    serial: AtomicU64,
    swept: AtomicU64,
}

impl std::fmt::Debug for InflightRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightRegistry")
            .field("count", &self.entries.len())
            .field("swept", &self.swept.load(Ordering::Relaxed))
            .finish()
    }
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn detain(&self, session: &str, kind: InflightKind, label: String, obj: Detained) -> String {
        let entry = Arc::new(InflightEntry {
            kind,
            session: session.to_string(),
            label,
            created_time: Utc::now(),
            last_access: Mutex::new(Instant::now()),
            slot: Mutex::new(Some(obj)),
        });
        let serial = self.serial.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{:p}#{}", Arc::as_ptr(&entry), serial);
        self.entries.insert(id.clone(), entry);
        id
    }

    pub(crate) fn detain_rows(&self, session: &str, rows: Rows) -> String {
        let sql = rows.sql().to_string();
        self.detain(session, InflightKind::Rows, sql, Detained::Rows(rows))
    }

    pub(crate) fn detain_appender(&self, session: &str, app: Appender) -> String {
        let table = app.table_name().to_string();
        self.detain(session, InflightKind::Appender, table, Detained::Appender(app))
    }

    fn lookup(&self, id: &str, kind: InflightKind) -> StrataResult<Arc<InflightEntry>> {
        let entry = self
            .entries
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| StrataError::HandleNotFound(id.to_string()))?;
        if entry.kind != kind {
            return Err(StrataError::HandleNotValid(id.to_string()));
        }
        Ok(entry)
    }

    pub(crate) fn rows(&self, id: &str) -> StrataResult<Arc<InflightEntry>> {
        self.lookup(id, InflightKind::Rows)
    }

    pub(crate) fn appender(&self, id: &str) -> StrataResult<Arc<InflightEntry>> {
        self.lookup(id, InflightKind::Appender)
    }

    pub fn kind_of(&self, id: &str) -> Option<InflightKind> {
        self.entries.get(id).map(|e| e.kind)
    }

    /// Remove and close one entry. `Ok(None)` when it was already gone;
    /// otherwise the appender counts (zeros for a cursor). A failed close
    /// still removes the entry.
    pub fn release(&self, id: &str) -> StrataResult<Option<(u64, u64)>> {
        let Some((_, entry)) = self.entries.remove(id) else {
            return Ok(None);
        };
        entry.close(id).map_err(|e| {
            tracing::warn!(id, label = %entry.label, error = %e, "close detained object failed");
            e
        })
    }

    /// Release for cleanup paths: a close failure is logged by `release`.
    /// Returns whether the entry existed.
    fn discard(&self, id: &str) -> bool {
        !matches!(self.release(id), Ok(None))
    }

    /// Release everything opened on `session`.
    pub fn release_session(&self, session: &str) -> usize {
        let ids = self.collect_ids(|e| e.session == session);
        ids.iter().filter(|id| self.discard(id)).count()
    }

    /// Release entries untouched for longer than `ttl`.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let ids = self.collect_ids(|e| e.idle() > ttl);
        let n = ids
            .iter()
            .filter(|id| {
                let closed = self.discard(id);
                if closed {
                    tracing::warn!(id = %id, "released idle inflight handle");
                }
                closed
            })
            .count();
        if n > 0 {
            self.swept.fetch_add(n as u64, Ordering::Relaxed);
            strata_observability::record_rpc_inflight_swept(n);
        }
        n
    }

    pub fn release_all(&self) -> usize {
        let ids = self.collect_ids(|_| true);
        ids.iter().filter(|id| self.discard(id)).count()
    }

    fn collect_ids(&self, pred: impl Fn(&InflightEntry) -> bool) -> Vec<String> {
        // collected first: closing an entry must not run under a shard lock
        self.entries
            .iter()
            .filter(|e| pred(e.value()))
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (rows, appenders)
    pub fn count_by_kind(&self) -> (usize, usize) {
        self.entries.iter().fold((0, 0), |(r, a), e| match e.kind {
            InflightKind::Rows => (r + 1, a),
            InflightKind::Appender => (r, a + 1),
        })
    }

    pub fn swept_total(&self) -> u64 {
        self.swept.load(Ordering::Relaxed)
    }

    /// Snapshots ordered by creation time.
    pub fn list(&self) -> Vec<InflightInfo> {
        let mut out: Vec<InflightInfo> = self
            .entries
            .iter()
            .map(|e| InflightInfo {
                id: e.key().clone(),
                kind: e.kind,
                session: e.session.clone(),
                label: e.label.clone(),
                created_time: e.created_time,
                idle_ms: e.idle().as_millis() as u64,
            })
            .collect();
        out.sort_by(|a, b| a.created_time.cmp(&b.created_time).then(a.id.cmp(&b.id)));
        out
    }
}
