//! Panic isolation for server entry points.
//!
//! `catch_request` wraps a handler closure in `std::panic::catch_unwind`
//! and turns a panic into `StrataError::Internal`, so one misbehaving
//! request never takes the process down.
//!
//! ```ignore
//! let result = crash_domain::catch_request_result("Exec", &handle, || conn.exec(&ctx, sql, &params));
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{StrataError, StrataResult};

static PANIC_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of panics captured since process start.
pub fn panic_count() -> u64 {
    PANIC_COUNT.load(Ordering::Relaxed)
}

fn payload_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Run `f`, converting a panic into `StrataError::Internal`.
///
/// - `stage`: short label for the entry point (e.g. `"Query"`)
/// - `ctx`: context injected into the log line (e.g. the RPC handle)
pub fn catch_request<T, F>(stage: &str, ctx: &str, f: F) -> StrataResult<T>
where
    F: FnOnce() -> T,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Ok(result),
        Err(payload) => Err(on_panic(stage, ctx, payload_message(payload.as_ref()))),
    }
}

/// Same as `catch_request` for closures that already return `StrataResult<T>`.
pub fn catch_request_result<T, F>(stage: &str, ctx: &str, f: F) -> StrataResult<T>
where
    F: FnOnce() -> StrataResult<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(on_panic(stage, ctx, payload_message(payload.as_ref()))),
    }
}

fn on_panic(stage: &str, ctx: &str, message: String) -> StrataError {
    let count = PANIC_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    tracing::error!(
        stage = stage,
        context = ctx,
        panic_count = count,
        panic_message = %message,
        "panic recovered at request boundary"
    );
    StrataError::Internal(format!("panic in '{}': {}", stage, message))
}
