//! RAII guard over an engine statement handle.

use std::sync::Arc;

use strata_common::{Column, ColumnType, StrataError, StrataResult};
use strata_engine::{raw_type, raw_type_to_data_type, ConnHandle, Engine, StmtHandle};

use crate::metrics::{Metrics, Resource};

/// Owns one statement handle; frees it exactly once, on `free` or drop.
pub(crate) struct Stmt {
    engine: Arc<dyn Engine>,
    handle: StmtHandle,
    metrics: Arc<Metrics>,
    resource: Resource,
    freed: bool,
}

impl Stmt {
    pub fn alloc(
        engine: &Arc<dyn Engine>,
        conn: ConnHandle,
        metrics: &Arc<Metrics>,
        resource: Resource,
    ) -> StrataResult<Stmt> {
        let handle = engine.alloc_stmt(conn)?;
        metrics.resource_opened(resource);
        Ok(Stmt {
            engine: Arc::clone(engine),
            handle,
            metrics: Arc::clone(metrics),
            resource,
            freed: false,
        })
    }

    pub fn handle(&self) -> StmtHandle {
        self.handle
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    pub fn free(mut self) -> StrataResult<()> {
        self.release()
    }

    fn release(&mut self) -> StrataResult<()> {
        if self.freed {
            return Ok(());
        }
        self.freed = true;
        self.metrics.resource_closed(self.resource);
        self.engine.free_stmt(self.handle)
    }

    /// Result column metadata; names are uppercased.
    pub fn columns(&self) -> StrataResult<Vec<Column>> {
        stmt_columns(self.engine.as_ref(), self.handle)
    }
}

impl Drop for Stmt {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::debug!(stmt = self.handle.0, error = %e, "free statement failed");
        }
    }
}

/// Read `EngColumnCount` + `EngColumnInfo` into [`Column`]s.
pub(crate) fn stmt_columns(engine: &dyn Engine, stmt: StmtHandle) -> StrataResult<Vec<Column>> {
    let count = engine.column_count(stmt)?;
    let mut out = Vec::with_capacity(count);
    for idx in 0..count {
        let info = engine.column_info(stmt, idx)?;
        raw_type_to_data_type(info.raw_type)?;
        let column_type = column_type_of_raw(info.raw_type)?;
        out.push(Column::new(info.name.to_uppercase(), column_type).with_length(info.size));
    }
    Ok(out)
}

fn column_type_of_raw(code: i32) -> StrataResult<ColumnType> {
    let ret = match code {
        raw_type::INT16 => ColumnType::Short,
        raw_type::INT32 => ColumnType::Integer,
        raw_type::INT64 => ColumnType::Long,
        raw_type::DATETIME => ColumnType::Datetime,
        raw_type::FLOAT32 => ColumnType::Float,
        raw_type::FLOAT64 => ColumnType::Double,
        raw_type::IPV4 => ColumnType::Ipv4,
        raw_type::IPV6 => ColumnType::Ipv6,
        raw_type::STRING => ColumnType::Varchar,
        raw_type::BINARY => ColumnType::Binary,
        other => return Err(StrataError::UnsupportedColumnType(other)),
    };
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::DataType;
    use strata_engine::mem::MemEngine;

    fn engine_and_conn() -> (Arc<dyn Engine>, ConnHandle) {
        let mem = MemEngine::new();
        let env = mem.initialize("").unwrap();
        mem.create_database(env).unwrap();
        mem.startup(env).unwrap();
        let conn = mem.connect_trust(env, "sys").unwrap();
        (Arc::new(mem), conn)
    }

    #[test]
    fn test_drop_frees_exactly_once() {
        let (engine, conn) = engine_and_conn();
        let metrics = Arc::new(Metrics::new());
        {
            let _s = Stmt::alloc(&engine, conn, &metrics, Resource::Stmt).unwrap();
            assert_eq!(metrics.in_use(Resource::Stmt), 1);
        }
        assert_eq!(metrics.in_use(Resource::Stmt), 0);

        let s = Stmt::alloc(&engine, conn, &metrics, Resource::Stmt).unwrap();
        s.free().unwrap();
        assert_eq!(metrics.in_use(Resource::Stmt), 0);
        assert_eq!(metrics.snapshot().stmt.closed, 2);
    }

    #[test]
    fn test_columns_map_raw_types() {
        let (engine, conn) = engine_and_conn();
        let metrics = Arc::new(Metrics::new());
        let s = Stmt::alloc(&engine, conn, &metrics, Resource::Stmt).unwrap();
        engine
            .direct_execute(s.handle(), "create table t (a short, b double, c varchar(10))")
            .unwrap();
        s.free().unwrap();

        let s = Stmt::alloc(&engine, conn, &metrics, Resource::Stmt).unwrap();
        engine.prepare(s.handle(), "select a, b, c from t").unwrap();
        engine.execute(s.handle()).unwrap();
        let cols = s.columns().unwrap();
        let types: Vec<DataType> = cols.iter().map(|c| c.data_type).collect();
        assert_eq!(types, vec![DataType::Int16, DataType::Float64, DataType::String]);
        assert_eq!(cols[2].name, "C");
    }

    #[test]
    fn test_unknown_raw_type_is_rejected() {
        assert!(matches!(
            column_type_of_raw(42),
            Err(StrataError::UnsupportedColumnType(42))
        ));
    }
}
