//! Bulk write pipeline bound to one log or tag table.
//!
//! The engine refuses queries on a connection that holds an open appender,
//! so the table kind is read through a separate trusted connection before
//! `append_open` is issued on the caller's connection.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use strata_common::types::column_data_types;
use strata_common::value::datetime_to_nanos;
use strata_common::{
    Column, Context, DataType, StrataError, StrataResult, TableName, TableType, Value,
};

use crate::conn::ConnInner;
use crate::describe::query_table_type;
use crate::metrics::Resource;
use crate::stmt::Stmt;

/// Name-based permutation from a caller's value order to the table's
/// user-facing column order.
#[derive(Debug, Clone)]
pub(crate) struct InputColumns {
    /// Per column, the position of its value in the caller's input; `None`
    /// columns receive NULL.
    map: Vec<Option<usize>>,
    len: usize,
}

impl InputColumns {
    pub(crate) fn new(columns: &[Column], names: &[&str]) -> Self {
        let map = columns
            .iter()
            .map(|col| names.iter().position(|n| n.eq_ignore_ascii_case(&col.name)))
            .collect();
        Self {
            map,
            len: names.len(),
        }
    }

    /// Values a caller supplies per record.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// `None` when `values` does not have one value per named column.
    pub(crate) fn arrange(&self, values: &[Value]) -> Option<Vec<Value>> {
        if values.len() != self.len {
            return None;
        }
        Some(
            self.map
                .iter()
                .map(|i| i.and_then(|i| values.get(i).cloned()).unwrap_or(Value::Null))
                .collect(),
        )
    }
}

pub struct Appender {
    conn: Arc<ConnInner>,
    stmt: Option<Stmt>,
    table: String,
    table_type: TableType,
    /// Append columns as the engine reports them; log tables lead with the
    /// arrival-time column.
    columns: Vec<Column>,
    types: Arc<Vec<DataType>>,
    input: Option<InputColumns>,
    closed: Option<(u64, u64)>,
}

impl std::fmt::Debug for Appender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Appender")
            .field("table", &self.table)
            .field("table_type", &self.table_type)
            .field("columns", &self.columns.len())
            .field("closed", &self.closed.is_some())
            .finish()
    }
}

impl Appender {
    pub(crate) fn open(conn: Arc<ConnInner>, table: &str) -> StrataResult<Appender> {
        let db = conn.database().clone();
        let name = TableName::parse(table).to_string();

        let lookup = db.connect_internal(&db.config().database.trusted_user)?;
        let found = query_table_type(&lookup, &Context::background(), &name);
        lookup.close()?;
        let (table_type, _) = found?;
        if !table_type.accepts_append() {
            return Err(StrataError::not_allowed(format!(
                "'{}' is not appendable table, {} table",
                name,
                table_type.as_str()
            )));
        }

        let inner = Arc::clone(&conn);
        let target = name.clone();
        let (stmt, columns) = db.run(move || {
            inner.ensure_open()?;
            inner.set_latest_sql(&format!("APPEND {}", target));
            let db = inner.database();
            let stmt = Stmt::alloc(db.engine(), inner.handle(), db.metrics(), Resource::Appender)?;
            db.engine().append_open(stmt.handle(), &target)?;
            let columns = stmt.columns()?;
            Ok((stmt, columns))
        })?;
        if columns.is_empty() {
            return Err(StrataError::NoColumns);
        }
        tracing::debug!(table = %name, columns = columns.len(), "appender opened");
        Ok(Appender {
            conn,
            stmt: Some(stmt),
            table: name,
            table_type,
            types: Arc::new(column_data_types(&columns)),
            columns,
            input: None,
            closed: None,
        })
    }

    /// Fully-qualified table name.
    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn table_type(&self) -> TableType {
        self.table_type
    }

    /// Columns callers supply values for; excludes the arrival time of a log table.
    pub fn columns(&self) -> &[Column] {
        &self.columns[self.user_offset()..]
    }

    fn user_offset(&self) -> usize {
        match self.table_type {
            TableType::Log => 1,
            _ => 0,
        }
    }

    /// Reorder caller values by name: the i-th value of each later append
    /// belongs to `names[i]`. Columns not named receive NULL.
    pub fn with_input_columns(mut self, names: &[&str]) -> Self {
        self.input = Some(InputColumns::new(self.columns(), names));
        self
    }

    fn check_open(&self) -> StrataResult<()> {
        if self.closed.is_some() || self.stmt.is_none() {
            return Err(StrataError::ClosedAppender);
        }
        if self.conn.is_closed() {
            return Err(StrataError::NoConnection);
        }
        Ok(())
    }

    fn length_error(&self, expected: usize, got: usize) -> StrataError {
        StrataError::LengthOfColumns {
            table: self.table.clone(),
            expected,
            got,
        }
    }

    /// Apply the input-column permutation, checking the caller's count.
    fn arrange(&self, values: &[Value]) -> StrataResult<Vec<Value>> {
        match &self.input {
            None => Ok(values.to_vec()),
            Some(input) => input
                .arrange(values)
                .ok_or_else(|| self.length_error(input.len(), values.len())),
        }
    }

    /// Append one record.
    ///
    /// Tag tables need one value per column. Log tables take the user
    /// columns, optionally preceded by an explicit arrival time; without it
    /// the engine assigns one.
    pub fn append(&mut self, values: &[Value]) -> StrataResult<()> {
        self.check_open()?;
        let mut record = self.arrange(values)?;
        let total = self.columns.len();
        match self.table_type {
            TableType::Log if record.len() + 1 == total => {
                record.insert(0, Value::Datetime(0));
            }
            TableType::Log if record.len() == total && self.input.is_none() => {}
            TableType::Log => return Err(self.length_error(total - 1, record.len())),
            _ if record.len() != total => return Err(self.length_error(total, record.len())),
            _ => {}
        }
        self.append_record(record)
    }

    /// Append to a log table with an explicit arrival time.
    pub fn append_log_time(&mut self, ts: DateTime<Utc>, values: &[Value]) -> StrataResult<()> {
        self.check_open()?;
        if self.table_type != TableType::Log {
            return Err(StrataError::not_allowed(format!(
                "{} is not a log table, use append instead",
                self.table
            )));
        }
        let mut record = self.arrange(values)?;
        let expected = self.columns.len() - 1;
        if record.len() != expected {
            return Err(self.length_error(expected, record.len()));
        }
        record.insert(0, Value::Datetime(datetime_to_nanos(ts)));
        self.append_record(record)
    }

    fn append_record(&self, record: Vec<Value>) -> StrataResult<()> {
        let Some(stmt) = self.stmt.as_ref() else {
            return Err(StrataError::ClosedAppender);
        };
        let handle = stmt.handle();
        let engine = Arc::clone(self.conn.database().engine());
        let types = Arc::clone(&self.types);
        self.conn
            .database()
            .run(move || engine.append_data(handle, &types, &record))
    }

    /// Close the appender and free its statement. Returns `(success, fail)`
    /// as counted by the engine; later calls return the same pair.
    pub fn close(&mut self) -> StrataResult<(u64, u64)> {
        if let Some(counts) = self.closed {
            return Ok(counts);
        }
        let Some(stmt) = self.stmt.take() else {
            return Err(StrataError::ClosedAppender);
        };
        let counts = self.conn.database().run(move || {
            let counts = stmt.engine().append_close(stmt.handle());
            let freed = stmt.free();
            let counts = counts?;
            freed?;
            Ok(counts)
        })?;
        self.closed = Some(counts);
        tracing::debug!(
            table = %self.table,
            success = counts.0,
            fail = counts.1,
            "appender closed"
        );
        Ok(counts)
    }

    pub fn is_closed(&self) -> bool {
        self.stmt.is_none()
    }
}

impl Drop for Appender {
    fn drop(&mut self) {
        if self.stmt.is_some() {
            if let Err(e) = self.close() {
                tracing::debug!(table = %self.table, error = %e, "close appender on drop failed");
            }
        }
    }
}
