//! Interruptible stop signal for background sweepers and samplers.
//!
//! Condvar-based waits respond to `shutdown()` immediately instead of
//! waiting for the full tick interval to elapse.
//!
//! # Usage
//! ```ignore
//! let signal = ShutdownSignal::new();
//! let signal_clone = signal.clone();
//!
//! // In the sweeper thread:
//! while !signal_clone.wait_timeout(Duration::from_secs(15)) {
//!     sweep();
//! }
//!
//! // On stop:
//! signal.shutdown();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                flag: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Signal shutdown. Wakes all waiters immediately.
    pub fn shutdown(&self) {
        let _guard = self.inner.mutex.lock();
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`, waking early on `shutdown()`.
    /// Returns `true` if shutdown was requested (caller should exit).
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let mut guard = self.inner.mutex.lock();
        if self.is_shutdown() {
            return true;
        }
        let _ = self.inner.condvar.wait_for(&mut guard, duration);
        self.is_shutdown()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_signal_default_not_shutdown() {
        let sig = ShutdownSignal::new();
        assert!(!sig.is_shutdown());
        assert!(!sig.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_timeout_returns_immediately_when_shutdown() {
        let sig = ShutdownSignal::new();
        sig.shutdown();
        let start = std::time::Instant::now();
        assert!(sig.wait_timeout(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_wait_timeout_wakes_on_shutdown() {
        let sig = ShutdownSignal::new();
        let sig2 = sig.clone();
        let handle = std::thread::spawn(move || {
            let start = std::time::Instant::now();
            let result = sig2.wait_timeout(Duration::from_secs(10));
            (result, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        sig.shutdown();
        let (result, elapsed) = handle.join().unwrap();
        assert!(result);
        assert!(elapsed < Duration::from_secs(5));
    }
}
