#![allow(dead_code, unused_imports)]

pub use std::sync::Arc;
pub use std::time::{Duration, Instant};

pub use strata_access::{
    AppendWorkers, Conn, ConnectOption, Database, WatchData, WatchOptions, Watcher,
};
pub use strata_common::config::StrataConfig;
pub use strata_common::{Context, ErrorKind, StrataError, Value};
pub use strata_engine::mem::MemEngine;

pub const TAG_DATA_DDL: &str =
    "create tag table tag_data (name varchar(100) primary key, time datetime basetime, value double)";

pub fn start_db(config: StrataConfig) -> Database {
    let db = Database::new(Arc::new(MemEngine::new()), config).expect("database");
    db.startup().expect("startup");
    db
}

pub fn default_db() -> Database {
    start_db(StrataConfig::default())
}

pub fn connect(db: &Database) -> Conn {
    db.connect(
        &Context::background(),
        &[ConnectOption::password("sys", "manager")],
    )
    .expect("connect")
}

pub fn exec(conn: &Conn, sql: &str) {
    conn.exec(&Context::background(), sql, &[]).expect(sql);
}

/// A started database with the `tag_data` table created.
pub fn tag_data_db(config: StrataConfig) -> Database {
    let db = start_db(config);
    let conn = connect(&db);
    exec(&conn, TAG_DATA_DDL);
    conn.close().expect("close");
    db
}

pub fn count_rows(db: &Database, table: &str) -> i64 {
    let conn = connect(db);
    let row = conn
        .query_row(
            &Context::background(),
            &format!("select count(*) from {}", table),
            &[],
        )
        .expect("count");
    row.get::<i64>(0).expect("count value")
}
