//! Binding to the native storage engine.
//!
//! The engine exposes a handle-oriented ABI (allocate statement, prepare,
//! bind, execute, fetch, append). [`Engine`] mirrors that ABI one call per
//! method; every call returns `Ok` on success or the engine's error. The
//! layer is stateless: all state lives behind the handles.
//!
//! [`mem::MemEngine`] is an in-memory implementation used by tests and the
//! shell when no native engine is linked.

pub mod mem;

use std::net::{Ipv4Addr, Ipv6Addr};

use strata_common::{DataType, StrataError, StrataResult, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StmtHandle(pub u64);

// ---------------------------------------------------------------------------
// Raw column types
// ---------------------------------------------------------------------------

/// Engine raw column type codes, numbered 0..=9.
pub mod raw_type {
    pub const INT16: i32 = 0;
    pub const INT32: i32 = 1;
    pub const INT64: i32 = 2;
    pub const DATETIME: i32 = 3;
    pub const FLOAT32: i32 = 4;
    pub const FLOAT64: i32 = 5;
    pub const IPV4: i32 = 6;
    pub const IPV6: i32 = 7;
    pub const STRING: i32 = 8;
    pub const BINARY: i32 = 9;
}

pub fn raw_type_to_data_type(code: i32) -> StrataResult<DataType> {
    let ret = match code {
        raw_type::INT16 => DataType::Int16,
        raw_type::INT32 => DataType::Int32,
        raw_type::INT64 => DataType::Int64,
        raw_type::DATETIME => DataType::Datetime,
        raw_type::FLOAT32 => DataType::Float32,
        raw_type::FLOAT64 => DataType::Float64,
        raw_type::IPV4 => DataType::Ipv4,
        raw_type::IPV6 => DataType::Ipv6,
        raw_type::STRING => DataType::String,
        raw_type::BINARY => DataType::Binary,
        _ => return Err(StrataError::UnsupportedColumnType(code)),
    };
    Ok(ret)
}

pub fn data_type_to_raw_type(typ: DataType) -> i32 {
    match typ {
        DataType::Int16 => raw_type::INT16,
        DataType::Int32 => raw_type::INT32,
        DataType::Int64 => raw_type::INT64,
        DataType::Datetime => raw_type::DATETIME,
        DataType::Float32 => raw_type::FLOAT32,
        DataType::Float64 => raw_type::FLOAT64,
        DataType::Ipv4 => raw_type::IPV4,
        DataType::Ipv6 => raw_type::IPV6,
        DataType::String => raw_type::STRING,
        DataType::Binary => raw_type::BINARY,
    }
}

/// Column metadata as reported by `EngColumnInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub raw_type: i32,
    pub size: usize,
    pub length: usize,
}

// ---------------------------------------------------------------------------
// Statement types
// ---------------------------------------------------------------------------

/// Engine-reported statement classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StmtType(pub i32);

impl StmtType {
    pub const DDL_CREATE: StmtType = StmtType(1);
    pub const DDL_DROP: StmtType = StmtType(2);
    pub const DDL_TRUNCATE: StmtType = StmtType(3);
    pub const ALTER_SYSTEM: StmtType = StmtType(256);
    pub const SELECT: StmtType = StmtType(512);
    pub const INSERT: StmtType = StmtType(513);
    pub const DELETE: StmtType = StmtType(514);
    pub const INSERT_SELECT: StmtType = StmtType(519);
    pub const UPDATE: StmtType = StmtType(520);
    pub const EXEC_ROLLUP: StmtType = StmtType(522);

    pub fn is_ddl(&self) -> bool {
        (1..=255).contains(&self.0)
    }

    pub fn is_alter_system(&self) -> bool {
        (256..=511).contains(&self.0)
    }

    pub fn is_select(&self) -> bool {
        self.0 == 512
    }

    pub fn is_insert(&self) -> bool {
        self.0 == 513
    }

    pub fn is_delete(&self) -> bool {
        (514..=518).contains(&self.0)
    }

    pub fn is_insert_select(&self) -> bool {
        self.0 == 519
    }

    pub fn is_update(&self) -> bool {
        self.0 == 520
    }

    pub fn is_exec_rollup(&self) -> bool {
        (522..=524).contains(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Engine ABI
// ---------------------------------------------------------------------------

/// One method per native call. Column data getters return `(value, non_null)`.
pub trait Engine: Send + Sync {
    fn initialize(&self, home: &str) -> StrataResult<EnvHandle>;
    fn finalize(&self, env: EnvHandle) -> StrataResult<()>;
    fn create_database(&self, env: EnvHandle) -> StrataResult<()>;
    fn destroy_database(&self, env: EnvHandle) -> StrataResult<()>;
    fn exists_database(&self, env: EnvHandle) -> StrataResult<bool>;
    fn startup(&self, env: EnvHandle) -> StrataResult<()>;
    fn shutdown(&self, env: EnvHandle) -> StrataResult<()>;

    fn connect(&self, env: EnvHandle, user: &str, password: &str) -> StrataResult<ConnHandle>;
    fn connect_trust(&self, env: EnvHandle, user: &str) -> StrataResult<ConnHandle>;
    fn disconnect(&self, conn: ConnHandle) -> StrataResult<()>;
    fn cancel(&self, conn: ConnHandle) -> StrataResult<()>;
    fn session_id(&self, conn: ConnHandle) -> StrataResult<u64>;
    fn user_auth(&self, env: EnvHandle, user: &str, password: &str) -> StrataResult<bool>;
    fn ping(&self, conn: ConnHandle) -> StrataResult<()>;

    fn alloc_stmt(&self, conn: ConnHandle) -> StrataResult<StmtHandle>;
    fn free_stmt(&self, stmt: StmtHandle) -> StrataResult<()>;
    fn prepare(&self, stmt: StmtHandle, sql: &str) -> StrataResult<()>;
    fn direct_execute(&self, stmt: StmtHandle, sql: &str) -> StrataResult<()>;
    fn execute(&self, stmt: StmtHandle) -> StrataResult<()>;

    fn bind_null(&self, stmt: StmtHandle, idx: usize) -> StrataResult<()>;
    fn bind_int32(&self, stmt: StmtHandle, idx: usize, v: i32) -> StrataResult<()>;
    fn bind_int64(&self, stmt: StmtHandle, idx: usize, v: i64) -> StrataResult<()>;
    fn bind_float64(&self, stmt: StmtHandle, idx: usize, v: f64) -> StrataResult<()>;
    fn bind_string(&self, stmt: StmtHandle, idx: usize, v: &str) -> StrataResult<()>;
    fn bind_binary(&self, stmt: StmtHandle, idx: usize, v: &[u8]) -> StrataResult<()>;

    fn effect_rows(&self, stmt: StmtHandle) -> StrataResult<u64>;
    fn stmt_type(&self, stmt: StmtHandle) -> StrataResult<StmtType>;
    fn column_count(&self, stmt: StmtHandle) -> StrataResult<usize>;
    fn column_info(&self, stmt: StmtHandle, idx: usize) -> StrataResult<ColumnInfo>;

    /// Advance the cursor. `Ok(false)` at end of data.
    fn fetch(&self, stmt: StmtHandle) -> StrataResult<bool>;
    fn column_data_int16(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(i16, bool)>;
    fn column_data_int32(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(i32, bool)>;
    fn column_data_int64(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(i64, bool)>;
    fn column_data_datetime(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(i64, bool)>;
    fn column_data_float32(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(f32, bool)>;
    fn column_data_float64(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(f64, bool)>;
    fn column_data_ipv4(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(Ipv4Addr, bool)>;
    fn column_data_ipv6(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(Ipv6Addr, bool)>;
    fn column_data_string(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(String, bool)>;
    fn column_data_binary(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(Vec<u8>, bool)>;

    fn append_open(&self, stmt: StmtHandle, table: &str) -> StrataResult<()>;
    /// Build the append buffer for `types` from `values` and append one record.
    fn append_data(&self, stmt: StmtHandle, types: &[DataType], values: &[Value])
        -> StrataResult<()>;
    /// Returns `(success, failure)` counts.
    fn append_close(&self, stmt: StmtHandle) -> StrataResult<(u64, u64)>;

    fn explain(&self, stmt: StmtHandle, full: bool) -> StrataResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_type_codes_are_ordered() {
        let expected = [
            DataType::Int16,
            DataType::Int32,
            DataType::Int64,
            DataType::Datetime,
            DataType::Float32,
            DataType::Float64,
            DataType::Ipv4,
            DataType::Ipv6,
            DataType::String,
            DataType::Binary,
        ];
        for (code, typ) in expected.iter().enumerate() {
            assert_eq!(raw_type_to_data_type(code as i32).unwrap(), *typ);
            assert_eq!(data_type_to_raw_type(*typ), code as i32);
        }
    }

    #[test]
    fn test_unknown_raw_type_fails() {
        let err = raw_type_to_data_type(10).unwrap_err();
        assert_eq!(err.to_string(), "unsupported column type 10");
    }

    #[test]
    fn test_stmt_type_ranges() {
        assert!(StmtType(1).is_ddl() && StmtType(255).is_ddl());
        assert!(StmtType(300).is_alter_system());
        assert!(StmtType::SELECT.is_select());
        assert!(StmtType::INSERT.is_insert());
        assert!(StmtType(518).is_delete());
        assert!(!StmtType(519).is_delete());
        assert!(StmtType::INSERT_SELECT.is_insert_select());
        assert!(StmtType::UPDATE.is_update());
        assert!(StmtType(524).is_exec_rollup());
        assert!(!StmtType(521).is_exec_rollup());
    }
}
