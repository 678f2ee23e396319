//! Object-safe seams over the access layer, so hosts such as the shell and
//! the RPC server can be driven by any database implementation.

use std::time::Duration;

use strata_common::{Context, StrataResult, Value};

use crate::appender::Appender;
use crate::conn::{Conn, ConnectOption, ExecResult};
use crate::database::Database;
use crate::row::Row;
use crate::rows::Rows;

pub trait Connector: Send + Sync {
    fn connect(&self, ctx: &Context, opts: &[ConnectOption]) -> StrataResult<Box<dyn Connection>>;

    fn user_auth(&self, user: &str, password: &str) -> StrataResult<bool>;

    fn ping(&self) -> StrataResult<Duration>;
}

pub trait Connection: Send + Sync {
    fn id(&self) -> u64;

    fn close(&self) -> StrataResult<()>;

    fn exec(&self, ctx: &Context, sql: &str, params: &[Value]) -> StrataResult<ExecResult>;

    fn query(&self, ctx: &Context, sql: &str, params: &[Value]) -> StrataResult<Rows>;

    fn query_row(&self, ctx: &Context, sql: &str, params: &[Value]) -> StrataResult<Row>;

    fn appender(&self, ctx: &Context, table: &str) -> StrataResult<Appender>;

    fn explain(&self, ctx: &Context, sql: &str, full: bool) -> StrataResult<String>;

    /// The concrete connection, for helpers that need it (table description).
    fn as_conn(&self) -> &Conn;
}

impl Connector for Database {
    fn connect(&self, ctx: &Context, opts: &[ConnectOption]) -> StrataResult<Box<dyn Connection>> {
        Ok(Box::new(Database::connect(self, ctx, opts)?))
    }

    fn user_auth(&self, user: &str, password: &str) -> StrataResult<bool> {
        Database::user_auth(self, user, password)
    }

    fn ping(&self) -> StrataResult<Duration> {
        Database::ping(self)
    }
}

impl Connection for Conn {
    fn id(&self) -> u64 {
        Conn::id(self)
    }

    fn close(&self) -> StrataResult<()> {
        Conn::close(self)
    }

    fn exec(&self, ctx: &Context, sql: &str, params: &[Value]) -> StrataResult<ExecResult> {
        Conn::exec(self, ctx, sql, params)
    }

    fn query(&self, ctx: &Context, sql: &str, params: &[Value]) -> StrataResult<Rows> {
        Conn::query(self, ctx, sql, params)
    }

    fn query_row(&self, ctx: &Context, sql: &str, params: &[Value]) -> StrataResult<Row> {
        Conn::query_row(self, ctx, sql, params)
    }

    fn appender(&self, ctx: &Context, table: &str) -> StrataResult<Appender> {
        Conn::appender(self, ctx, table)
    }

    fn explain(&self, ctx: &Context, sql: &str, full: bool) -> StrataResult<String> {
        Conn::explain(self, ctx, sql, full)
    }

    fn as_conn(&self) -> &Conn {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strata_common::config::StrataConfig;
    use strata_engine::mem::MemEngine;

    #[test]
    fn test_database_behind_trait_object() {
        let db = Database::new(Arc::new(MemEngine::new()), StrataConfig::default()).unwrap();
        db.startup().unwrap();
        let connector: Arc<dyn Connector> = Arc::new(db.clone());
        assert!(connector.user_auth("sys", "manager").unwrap());
        let ctx = Context::background();
        let conn = connector
            .connect(&ctx, &[ConnectOption::password("sys", "manager")])
            .unwrap();
        let res = conn.exec(&ctx, "create table t (a integer)", &[]).unwrap();
        assert_eq!(res.message, "Created successfully.");
        assert_eq!(db.session_count(), 1);
        conn.close().unwrap();
        assert_eq!(db.session_count(), 0);
    }
}
