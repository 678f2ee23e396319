//! Bounded admission gates for engine connections and detained queries.
//!
//! A gate is a fixed-capacity channel pre-filled with N tokens: acquiring
//! receives one, releasing sends one back. `resize` swaps in a new channel;
//! permits taken from the old channel still return into the new one, and
//! returns beyond the new capacity are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use strata_common::{Context, StrataError, StrataResult};

/// Resolve a configured limit: −1 = unlimited, 0 = NumCPU × `factor`.
pub fn resolve_limit(configured: i32, factor: f64) -> Option<usize> {
    match configured {
        n if n < 0 => None,
        0 => {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            Some(((cpus as f64 * factor).ceil() as usize).max(1))
        }
        n => Some(n as usize),
    }
}

/// Observable gate statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    /// Capacity, `None` when unlimited.
    pub limit: Option<usize>,
    /// Tokens currently available.
    pub available: usize,
    pub total_acquired: u64,
    pub total_released: u64,
    pub total_timeouts: u64,
    pub total_canceled: u64,
    /// Returned tokens dropped because the gate shrank.
    pub total_dropped: u64,
}

struct Channel {
    limit: Option<usize>,
    tx: Sender<()>,
    rx: Receiver<()>,
    /// Dropped on resize to wake waiters parked on this channel.
    retire_tx: parking_lot::Mutex<Option<Sender<()>>>,
    retire_rx: Receiver<()>,
}

impl Channel {
    fn new(limit: Option<usize>) -> Self {
        let (tx, rx) = match limit {
            Some(n) => crossbeam_channel::bounded(n),
            None => crossbeam_channel::bounded(0),
        };
        if let Some(n) = limit {
            for _ in 0..n {
                let _ = tx.try_send(());
            }
        }
        let (retire_tx, retire_rx) = crossbeam_channel::bounded(0);
        Self {
            limit,
            tx,
            rx,
            retire_tx: parking_lot::Mutex::new(Some(retire_tx)),
            retire_rx,
        }
    }
}

struct GateInner {
    name: &'static str,
    channel: RwLock<Arc<Channel>>,
    total_acquired: AtomicU64,
    total_released: AtomicU64,
    total_timeouts: AtomicU64,
    total_canceled: AtomicU64,
    total_dropped: AtomicU64,
}

/// Token gate shared by every acquirer.
#[derive(Clone)]
pub struct Admission {
    inner: Arc<GateInner>,
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Admission")
            .field("name", &self.inner.name)
            .field("limit", &stats.limit)
            .field("available", &stats.available)
            .finish()
    }
}

/// RAII token. Returned to the gate exactly once, on `release` or drop.
pub struct Permit {
    gate: Option<Arc<GateInner>>,
    /// Time spent waiting for the token.
    pub waited: Duration,
}

impl Permit {
    pub fn release(&mut self) {
        if let Some(gate) = self.gate.take() {
            Admission::give_back(&gate);
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("held", &self.gate.is_some())
            .field("waited", &self.waited)
            .finish()
    }
}

/// Which error family a failed acquire reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireKind {
    /// `ConnectTimeout` / `ConnectCanceled`.
    Connect,
    /// `Canceled` for both.
    Query,
}

impl Admission {
    pub fn new(name: &'static str, limit: Option<usize>) -> Self {
        Self {
            inner: Arc::new(GateInner {
                name,
                channel: RwLock::new(Arc::new(Channel::new(limit))),
                total_acquired: AtomicU64::new(0),
                total_released: AtomicU64::new(0),
                total_timeouts: AtomicU64::new(0),
                total_canceled: AtomicU64::new(0),
                total_dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.inner.channel.read().limit
    }

    /// Replace the channel with one of capacity `limit`, filled with the
    /// tokens not currently held.
    pub fn resize(&self, limit: Option<usize>) {
        let mut guard = self.inner.channel.write();
        let held = match guard.limit {
            Some(old) => old.saturating_sub(guard.rx.len()),
            None => 0,
        };
        let fresh = Channel::new(limit);
        if let Some(n) = limit {
            // tokens still out will come back through `give_back`
            for _ in 0..held.min(n) {
                let _ = fresh.rx.try_recv();
            }
        }
        tracing::debug!(
            gate = self.inner.name,
            old = ?guard.limit,
            new = ?limit,
            held,
            "admission gate resized"
        );
        let old = std::mem::replace(&mut *guard, Arc::new(fresh));
        old.retire_tx.lock().take();
    }

    /// Wait for a token until `timeout` elapses or `ctx` is done.
    pub fn acquire(
        &self,
        ctx: &Context,
        timeout: Option<Duration>,
        kind: AcquireKind,
    ) -> StrataResult<Permit> {
        let start = Instant::now();
        let channel = Arc::clone(&self.inner.channel.read());
        if channel.limit.is_none() {
            return Ok(Permit {
                gate: None,
                waited: Duration::ZERO,
            });
        }
        if ctx.is_done() {
            return Err(self.canceled(kind));
        }
        let timer = match timeout {
            Some(d) => crossbeam_channel::after(d),
            None => crossbeam_channel::never(),
        };
        let deadline = ctx.deadline_channel();
        crossbeam_channel::select! {
            recv(channel.rx) -> _ => {
                self.inner.total_acquired.fetch_add(1, Ordering::Relaxed);
                Ok(Permit { gate: Some(Arc::clone(&self.inner)), waited: start.elapsed() })
            },
            // resized while waiting: retry on the new channel
            recv(channel.retire_rx) -> _ => {
                self.acquire(ctx, timeout.map(|d| d.saturating_sub(start.elapsed())), kind)
            },
            recv(timer) -> _ => {
                self.inner.total_timeouts.fetch_add(1, Ordering::Relaxed);
                strata_observability::record_admission_timeout();
                Err(match kind {
                    AcquireKind::Connect => StrataError::ConnectTimeout,
                    AcquireKind::Query => StrataError::Canceled,
                })
            },
            recv(ctx.done()) -> _ => Err(self.canceled(kind)),
            recv(deadline) -> _ => Err(self.canceled(kind)),
        }
    }

    fn canceled(&self, kind: AcquireKind) -> StrataError {
        self.inner.total_canceled.fetch_add(1, Ordering::Relaxed);
        match kind {
            AcquireKind::Connect => StrataError::ConnectCanceled,
            AcquireKind::Query => StrataError::Canceled,
        }
    }

    fn give_back(inner: &GateInner) {
        inner.total_released.fetch_add(1, Ordering::Relaxed);
        let channel = Arc::clone(&inner.channel.read());
        if channel.limit.is_none() {
            return;
        }
        match channel.tx.try_send(()) {
            Ok(()) => {}
            Err(TrySendError::Full(())) | Err(TrySendError::Disconnected(())) => {
                inner.total_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(gate = inner.name, "surplus admission token dropped");
            }
        }
    }

    pub fn stats(&self) -> AdmissionStats {
        let channel = self.inner.channel.read();
        AdmissionStats {
            limit: channel.limit,
            available: channel.rx.len(),
            total_acquired: self.inner.total_acquired.load(Ordering::Relaxed),
            total_released: self.inner.total_released.load(Ordering::Relaxed),
            total_timeouts: self.inner.total_timeouts.load(Ordering::Relaxed),
            total_canceled: self.inner.total_canceled.load(Ordering::Relaxed),
            total_dropped: self.inner.total_dropped.load(Ordering::Relaxed),
        }
    }

    /// True when every token is back in the gate (always true when unlimited).
    pub fn is_full(&self) -> bool {
        let channel = self.inner.channel.read();
        match channel.limit {
            Some(n) => channel.rx.len() == n,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_limit() {
        assert_eq!(resolve_limit(-1, 1.5), None);
        assert_eq!(resolve_limit(7, 1.5), Some(7));
        assert!(resolve_limit(0, 1.5).unwrap() >= 2);
    }

    #[test]
    fn test_acquire_and_release_restores_tokens() {
        let gate = Admission::new("test", Some(3));
        let ctx = Context::background();
        let permits: Vec<_> = (0..3)
            .map(|_| gate.acquire(&ctx, None, AcquireKind::Connect).unwrap())
            .collect();
        assert_eq!(gate.stats().available, 0);
        drop(permits);
        assert!(gate.is_full());
        assert_eq!(gate.stats().total_released, 3);
    }

    #[test]
    fn test_timeout_when_exhausted() {
        let gate = Admission::new("test", Some(1));
        let ctx = Context::background();
        let _held = gate.acquire(&ctx, None, AcquireKind::Connect).unwrap();
        let start = Instant::now();
        let err = gate
            .acquire(&ctx, Some(Duration::from_millis(50)), AcquireKind::Connect)
            .unwrap_err();
        assert!(matches!(err, StrataError::ConnectTimeout));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(gate.stats().total_timeouts, 1);
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let gate = Admission::new("test", Some(1));
        let ctx = Context::background();
        let _held = gate.acquire(&ctx, None, AcquireKind::Connect).unwrap();
        let waiter_ctx = ctx.child();
        let canceler = waiter_ctx.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            canceler.cancel();
        });
        let err = gate
            .acquire(&waiter_ctx, None, AcquireKind::Connect)
            .unwrap_err();
        assert!(matches!(err, StrataError::ConnectCanceled));
        t.join().unwrap();
    }

    #[test]
    fn test_unlimited_never_blocks() {
        let gate = Admission::new("test", None);
        let ctx = Context::background();
        let held: Vec<_> = (0..100)
            .map(|_| gate.acquire(&ctx, None, AcquireKind::Query).unwrap())
            .collect();
        assert_eq!(held.len(), 100);
        assert!(gate.is_full());
    }

    #[test]
    fn test_shrink_drops_surplus_returns() {
        let gate = Admission::new("test", Some(4));
        let ctx = Context::background();
        let held: Vec<_> = (0..3)
            .map(|_| gate.acquire(&ctx, None, AcquireKind::Connect).unwrap())
            .collect();
        gate.resize(Some(2));
        // all 3 held, so the new gate starts empty
        assert_eq!(gate.stats().available, 0);
        drop(held);
        assert_eq!(gate.stats().available, 2);
        assert_eq!(gate.stats().total_dropped, 1);
    }

    #[test]
    fn test_grow_adds_tokens() {
        let gate = Admission::new("test", Some(1));
        let ctx = Context::background();
        let held = gate.acquire(&ctx, None, AcquireKind::Connect).unwrap();
        gate.resize(Some(3));
        assert_eq!(gate.stats().available, 2);
        drop(held);
        assert!(gate.is_full());
    }
}
