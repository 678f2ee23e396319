//! Process-wide database instance with one-shot init and finalize.
//!
//! ```ignore
//! global::init(Arc::new(MemEngine::new()), config)?;
//! let db = global::instance()?;
//! ...
//! global::finalize()?;
//! ```

use std::sync::Arc;

use parking_lot::RwLock;
use strata_common::config::StrataConfig;
use strata_common::{StrataError, StrataResult};
use strata_engine::Engine;

use crate::append_worker::{AppendWorkers, FlushReport};
use crate::database::Database;

struct Global {
    db: Database,
    append_workers: Option<AppendWorkers>,
}

static GLOBAL: RwLock<Option<Global>> = parking_lot::const_rwlock(None);

/// Create and start the process-wide database. Fails if one already exists.
pub fn init(engine: Arc<dyn Engine>, config: StrataConfig) -> StrataResult<Database> {
    let mut global = GLOBAL.write();
    if global.is_some() {
        return Err(StrataError::not_allowed("database is already initialized"));
    }
    let db = Database::new(engine, config)?;
    db.startup()?;
    *global = Some(Global {
        db: db.clone(),
        append_workers: None,
    });
    Ok(db)
}

pub fn is_initialized() -> bool {
    GLOBAL.read().is_some()
}

pub fn instance() -> StrataResult<Database> {
    GLOBAL
        .read()
        .as_ref()
        .map(|g| g.db.clone())
        .ok_or(StrataError::NotInitialized)
}

/// Start the append worker registry on the global database. Idempotent.
pub fn start_append_workers() -> StrataResult<AppendWorkers> {
    let mut global = GLOBAL.write();
    let g = global.as_mut().ok_or(StrataError::NotInitialized)?;
    if let Some(workers) = &g.append_workers {
        return Ok(workers.clone());
    }
    let workers = AppendWorkers::start(g.db.clone())?;
    g.append_workers = Some(workers.clone());
    Ok(workers)
}

pub fn append_workers() -> StrataResult<AppendWorkers> {
    GLOBAL
        .read()
        .as_ref()
        .and_then(|g| g.append_workers.clone())
        .ok_or(StrataError::NotInitialized)
}

/// Flush the named append workers. An empty list flushes **all** of them.
pub fn flush_append_workers(tables: &[&str]) -> StrataResult<Vec<FlushReport>> {
    Ok(append_workers()?.flush(tables))
}

/// Stop the sweeper and every append worker, referenced or not.
pub fn stop_append_workers() -> Vec<FlushReport> {
    let workers = GLOBAL.write().as_mut().and_then(|g| g.append_workers.take());
    workers.map(|w| w.stop_all()).unwrap_or_default()
}

/// Stop append workers, shut the engine down and release the instance.
/// Fails with `NotInitialized` if [`init`] never ran.
pub fn finalize() -> StrataResult<()> {
    let Some(global) = GLOBAL.write().take() else {
        return Err(StrataError::NotInitialized);
    };
    if let Some(workers) = global.append_workers {
        workers.stop_all();
    }
    global.db.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_engine::mem::MemEngine;

    // one test: the instance is process-wide
    #[test]
    fn test_global_lifecycle() {
        assert!(matches!(finalize(), Err(StrataError::NotInitialized)));
        assert!(matches!(instance(), Err(StrataError::NotInitialized)));
        assert!(stop_append_workers().is_empty());

        let db = init(Arc::new(MemEngine::new()), StrataConfig::default()).unwrap();
        assert!(is_initialized());
        assert!(db.is_started());
        assert!(init(Arc::new(MemEngine::new()), StrataConfig::default()).is_err());
        assert_eq!(instance().unwrap().env(), db.env());

        assert!(append_workers().is_err());
        start_append_workers().unwrap();
        assert_eq!(flush_append_workers(&[]).unwrap().len(), 0);

        finalize().unwrap();
        assert!(!is_initialized());
        assert!(!db.is_started());
        assert!(matches!(finalize(), Err(StrataError::NotInitialized)));
    }
}
