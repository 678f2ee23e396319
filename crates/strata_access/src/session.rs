//! Registry of live client connections, keyed by engine session id.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use strata_common::{StrataError, StrataResult};

use crate::conn::ConnInner;

/// Point-in-time copy of a live connection. Never the connection itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnState {
    pub id: u64,
    pub user: String,
    pub created_time: DateTime<Utc>,
    pub latest_time: DateTime<Utc>,
    pub latest_sql: String,
}

/// Thread-safe session registry. Holds weak references so a forgotten
/// connection is still dropped (and closed) by its owner.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, Weak<ConnInner>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("count", &self.count())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, conn: &Arc<ConnInner>) {
        self.sessions.insert(conn.id(), Arc::downgrade(conn));
    }

    pub(crate) fn remove(&self, id: u64) {
        self.sessions.remove(&id);
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshots of every live session, ordered by id.
    pub fn list(&self) -> Vec<ConnState> {
        // upgrade outside the shard locks: dropping the last strong ref
        // closes the connection, which removes it from this map
        let weak: Vec<Weak<ConnInner>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut out: Vec<ConnState> = weak
            .iter()
            .filter_map(Weak::upgrade)
            .map(|c| c.state())
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn get(&self, id: u64) -> Option<ConnState> {
        let weak = self.sessions.get(&id).map(|e| e.value().clone())?;
        weak.upgrade().map(|c| c.state())
    }

    fn lookup(&self, id: u64) -> StrataResult<Arc<ConnInner>> {
        let weak = self
            .sessions
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StrataError::ConnectionNotFound)?;
        match weak.upgrade() {
            Some(conn) => Ok(conn),
            None => {
                self.sessions.remove(&id);
                Err(StrataError::ConnectionInvalid)
            }
        }
    }

    /// Kill a session. `force` closes it outright; otherwise the running
    /// operation is canceled first.
    pub(crate) fn kill(&self, id: u64, force: bool) -> StrataResult<()> {
        let conn = self.lookup(id)?;
        tracing::info!(session = id, force, "killing session");
        if !force {
            conn.cancel_now()?;
        }
        let db = conn.database().clone();
        db.run(move || conn.close_now())
    }
}
