//! Client-facing access layer over a storage engine binding.
//!
//! [`Database`] owns the engine environment, the admission gates, the
//! session registry and the optional pinned worker pool. [`Conn`] runs
//! statements and hands out [`Rows`] cursors, single [`Row`]s and
//! [`Appender`]s. [`AppendWorkers`] keeps per-table appenders warm and
//! [`Watcher`] streams new rows of tag and log tables.

pub mod admission;
pub mod api;
pub mod append_worker;
pub mod appender;
pub mod conn;
pub mod database;
pub mod describe;
pub mod global;
pub mod message;
pub mod metrics;
pub mod row;
pub mod rows;
pub mod scan;
pub mod session;
mod stmt;
pub mod watcher;
pub mod worker_pool;

pub use admission::{AdmissionStats, Permit};
pub use api::{Connection, Connector};
pub use append_worker::{AppendWorkerHandle, AppendWorkerInfo, AppendWorkers, FlushReport};
pub use appender::Appender;
pub use conn::{Conn, ConnectOption, ExecResult};
pub use database::Database;
pub use describe::{
    describe_table, exists_table, list_indexes, list_tables, list_tags, query_table_type,
    IndexInfo, IndexListing, TableDescription, TableInfo,
};
pub use metrics::{Metrics, MetricsSnapshot, Phase, Resource};
pub use row::Row;
pub use rows::Rows;
pub use scan::{FromRow, FromValue};
pub use session::ConnState;
pub use watcher::{ConnFactory, WatchData, WatchOptions, WatchRound, Watcher};
pub use worker_pool::{WorkerPool, WorkerPoolStats};
