use strata_common::{Column, StrataResult, Value};
use strata_engine::StmtType;

use crate::scan::{scan_index, FromRow, FromValue};

/// Result of [`Conn::query_row`](crate::Conn::query_row): one fetched row,
/// or the affected count of a non-select statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    stmt_type: StmtType,
    columns: Vec<Column>,
    values: Vec<Value>,
    rows_affected: u64,
    message: String,
}

impl Row {
    pub(crate) fn affected(stmt_type: StmtType, rows_affected: u64, message: String) -> Self {
        Self {
            stmt_type,
            columns: Vec::new(),
            values: Vec::new(),
            rows_affected,
            message,
        }
    }

    pub(crate) fn selected(
        stmt_type: StmtType,
        columns: Vec<Column>,
        values: Vec<Value>,
        message: String,
    ) -> Self {
        Self {
            stmt_type,
            columns,
            values,
            rows_affected: 1,
            message,
        }
    }

    pub fn stmt_type(&self) -> StmtType {
        self.stmt_type
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn scan<T: FromRow>(&self) -> StrataResult<T> {
        T::from_row(&self.values)
    }

    pub fn get<T: FromValue>(&self, idx: usize) -> StrataResult<T> {
        scan_index(&self.values, idx)
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::{ColumnType, StrataError};

    #[test]
    fn test_selected_row_scans_positionally() {
        let row = Row::selected(
            StmtType::SELECT,
            vec![
                Column::new("NAME", ColumnType::Varchar),
                Column::new("VALUE", ColumnType::Double),
            ],
            vec![Value::String("x".into()), Value::Float64(1.5)],
            "a row selected.".into(),
        );
        let (name, value): (String, f64) = row.scan().unwrap();
        assert_eq!(name, "x");
        assert_eq!(value, 1.5);
        assert_eq!(row.rows_affected(), 1);
        assert!(matches!(
            row.get::<i32>(5),
            Err(StrataError::ScanIndex { idx: 5, count: 2 })
        ));
    }

    #[test]
    fn test_affected_row_has_no_values() {
        let row = Row::affected(StmtType::INSERT, 1, "a row inserted.".into());
        assert!(row.values().is_empty());
        assert_eq!(row.message(), "a row inserted.");
    }
}
