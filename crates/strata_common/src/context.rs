//! Cancellation context passed to blocking operations.
//!
//! A `Context` is canceled explicitly, by its parent, or implicitly once its
//! deadline passes. Blocking code selects on [`Context::done`] (which
//! disconnects on cancel) together with [`Context::deadline_channel`].
//!
//! ```ignore
//! let ctx = Context::background().with_timeout(Duration::from_secs(1));
//! crossbeam_channel::select! {
//!     recv(work) -> msg => handle(msg),
//!     recv(ctx.done()) -> _ => return Err(StrataError::Canceled),
//!     recv(ctx.deadline_channel()) -> _ => return Err(StrataError::Canceled),
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::error::StrataError;

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    canceled: AtomicBool,
    deadline: Option<Instant>,
    /// Dropped on cancel so that every clone of `done_rx` wakes up.
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    children: Mutex<Vec<Weak<ContextInner>>>,
}

impl ContextInner {
    fn new(deadline: Option<Instant>) -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Arc::new(Self {
            canceled: AtomicBool::new(false),
            deadline,
            done_tx: Mutex::new(Some(tx)),
            done_rx: rx,
            children: Mutex::new(Vec::new()),
        })
    }

    fn cancel(&self) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.done_tx.lock().take();
        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

impl Context {
    /// A root context that is never canceled unless `cancel` is called.
    pub fn background() -> Self {
        Self {
            inner: ContextInner::new(None),
        }
    }

    /// Derive a child canceled together with `self`.
    pub fn child(&self) -> Context {
        self.derive(self.inner.deadline)
    }

    /// Derive a child whose deadline is the earlier of the parent's and `now + timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        let candidate = Instant::now() + timeout;
        let deadline = match self.inner.deadline {
            Some(d) if d < candidate => d,
            _ => candidate,
        };
        self.derive(Some(deadline))
    }

    fn derive(&self, deadline: Option<Instant>) -> Context {
        let inner = ContextInner::new(deadline);
        if self.inner.canceled.load(Ordering::SeqCst) {
            inner.cancel();
        } else {
            let mut children = self.inner.children.lock();
            children.retain(|w| w.strong_count() > 0);
            children.push(Arc::downgrade(&inner));
        }
        Context { inner }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// True once canceled or past the deadline.
    pub fn is_done(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
            || self.inner.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Remaining time before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Channel that becomes disconnected when the context is canceled.
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done_rx
    }

    /// Channel that fires at the deadline, or never.
    pub fn deadline_channel(&self) -> Receiver<Instant> {
        match self.inner.deadline {
            Some(d) => crossbeam_channel::at(d),
            None => crossbeam_channel::never(),
        }
    }

    pub fn err(&self) -> Option<StrataError> {
        if self.is_done() {
            Some(StrataError::Canceled)
        } else {
            None
        }
    }

    /// Sleep for `d` or until canceled. Returns `true` when canceled.
    pub fn sleep(&self, d: Duration) -> bool {
        let deadline = self.deadline_channel();
        crossbeam_channel::select! {
            recv(self.done()) -> _ => true,
            recv(deadline) -> _ => true,
            default(d) => self.is_done(),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("canceled", &self.is_canceled())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_is_not_done() {
        let ctx = Context::background();
        assert!(!ctx.is_done());
        assert!(ctx.err().is_none());
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn test_cancel_disconnects_done_channel() {
        let ctx = Context::background();
        let rx = ctx.done().clone();
        ctx.cancel();
        assert!(ctx.is_canceled());
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_parent_cancel_propagates_to_children() {
        let parent = Context::background();
        let child = parent.child();
        let grandchild = child.with_timeout(Duration::from_secs(60));
        parent.cancel();
        assert!(child.is_canceled());
        assert!(grandchild.is_canceled());
    }

    #[test]
    fn test_child_of_canceled_parent_starts_canceled() {
        let parent = Context::background();
        parent.cancel();
        assert!(parent.child().is_canceled());
    }

    #[test]
    fn test_deadline_marks_done() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        assert!(ctx.sleep(Duration::from_secs(5)));
        assert!(ctx.is_done());
        assert!(!ctx.is_canceled());
    }

    #[test]
    fn test_sleep_wakes_on_cancel() {
        let ctx = Context::background();
        let ctx2 = ctx.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let canceled = ctx2.sleep(Duration::from_secs(10));
            (canceled, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        ctx.cancel();
        let (canceled, elapsed) = handle.join().unwrap();
        assert!(canceled);
        assert!(elapsed < Duration::from_secs(5));
    }
}
