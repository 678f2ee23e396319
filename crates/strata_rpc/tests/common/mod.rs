#![allow(dead_code, unused_imports)]

pub use std::sync::Arc;
pub use std::time::Duration;

pub use strata_access::Database;
pub use strata_common::config::{RpcConfig, StrataConfig};
pub use strata_common::{StrataError, StrataResult, Value};
pub use strata_engine::mem::MemEngine;
pub use strata_rpc::*;
pub use tokio::sync::mpsc;

pub const TAG_DATA_DDL: &str =
    "create tag table tag_data (name varchar(100) primary key, time datetime basetime, value double)";

pub fn start_db() -> Database {
    let db = Database::new(Arc::new(MemEngine::new()), StrataConfig::default()).expect("database");
    db.startup().expect("startup");
    db
}

pub fn server() -> RpcServer {
    RpcServer::new(start_db(), RpcConfig::default())
}

pub async fn login(s: &RpcServer) -> String {
    let r = s.conn("sys", "manager").await;
    assert!(r.success, "{}", r.reason);
    r.body.expect("conn body").handle
}

pub async fn exec(s: &RpcServer, h: &str, sql: &str) {
    let r = s.exec(h, sql, vec![]).await;
    assert!(r.success, "{}: {}", sql, r.reason);
}

/// Open an appender on a fresh session and return (session, appender handle).
pub async fn open_appender(s: &RpcServer, table: &str) -> (String, String) {
    let h = login(s).await;
    let r = s.appender(&h, table).await;
    assert!(r.success, "{}", r.reason);
    (h, r.body.expect("appender body").handle)
}

pub async fn count(s: &RpcServer, table: &str) -> i64 {
    let h = login(s).await;
    let r = s
        .query_row(&h, &format!("select count(*) from {}", table), vec![])
        .await;
    assert!(r.success, "{}", r.reason);
    let n = match r.body.expect("row").values.first() {
        Some(Value::Int64(n)) => *n,
        other => panic!("unexpected count {:?}", other),
    };
    assert!(s.conn_close(&h).await.success);
    n
}
