//! Table metadata read from the dictionary tables.

use serde::Serialize;
use strata_common::types::table_type_description;
use strata_common::{
    Column, ColumnFlag, ColumnType, Context, StrataError, StrataResult, TableFlag, TableName,
    TableType, Value,
};

use crate::conn::Conn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexInfo {
    pub id: i64,
    pub name: String,
    pub index_type: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableDescription {
    pub database: String,
    pub user: String,
    pub name: String,
    pub id: i64,
    pub table_type: Option<TableType>,
    pub flag: TableFlag,
    pub columns: Vec<Column>,
    pub indexes: Vec<IndexInfo>,
}

impl TableDescription {
    /// e.g. `"Tag Table (data)"`.
    pub fn type_description(&self) -> String {
        table_type_description(self.table_type, self.flag)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn tag_name_column(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.is_tag_name())
    }

    pub fn basetime_column(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.is_basetime())
    }
}

/// One row of `list_tables`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub id: i64,
    pub table_type: Option<TableType>,
    pub flag: TableFlag,
}

impl TableInfo {
    pub fn type_description(&self) -> String {
        table_type_description(self.table_type, self.flag)
    }
}

fn not_exist(name: &TableName) -> StrataError {
    StrataError::InvalidArgument(format!("table '{}' does not exist", name))
}

fn user_id(conn: &Conn, ctx: &Context, user: &str) -> StrataResult<i64> {
    match conn.query_row(
        ctx,
        "select USER_ID from M$SYS_USERS where NAME = ?",
        &[Value::from(user)],
    ) {
        Ok(row) => row.get::<i64>(0),
        Err(e) if e.is_no_rows() => Err(StrataError::InvalidArgument(format!(
            "user '{}' does not exist",
            user
        ))),
        Err(e) => Err(e),
    }
}

fn table_row(conn: &Conn, ctx: &Context, name: &TableName) -> StrataResult<Option<TableInfo>> {
    let (_, user, table) = name.split();
    let uid = user_id(conn, ctx, user)?;
    let found = conn.query_row(
        ctx,
        "select NAME, TYPE, FLAG, ID from M$SYS_TABLES where NAME = ? and USER_ID = ?",
        &[Value::from(table), Value::Int64(uid)],
    );
    let row = match found {
        Ok(row) => row,
        Err(e) if e.is_no_rows() => return Ok(None),
        Err(e) => return Err(e),
    };
    let (name, typ, flag, id): (String, i64, i64, i64) = row.scan()?;
    Ok(Some(TableInfo {
        name,
        id,
        table_type: TableType::from_code(typ),
        flag: TableFlag::from_code(flag),
    }))
}

/// Type and flag of `name`; fails when the table does not exist.
pub fn query_table_type(
    conn: &Conn,
    ctx: &Context,
    name: &str,
) -> StrataResult<(TableType, TableFlag)> {
    let tn = TableName::parse(name);
    let info = table_row(conn, ctx, &tn)?.ok_or_else(|| not_exist(&tn))?;
    let typ = info.table_type.ok_or_else(|| {
        StrataError::InvalidArgument(format!("table '{}' has an unknown type", tn))
    })?;
    Ok((typ, info.flag))
}

pub fn exists_table(conn: &Conn, ctx: &Context, name: &str) -> StrataResult<bool> {
    Ok(table_row(conn, ctx, &TableName::parse(name))?.is_some())
}

/// Full description of `name`. Hidden columns (leading `_`) only with `include_hidden`.
pub fn describe_table(
    conn: &Conn,
    ctx: &Context,
    name: &str,
    include_hidden: bool,
) -> StrataResult<TableDescription> {
    let tn = TableName::parse(name);
    let info = table_row(conn, ctx, &tn)?.ok_or_else(|| not_exist(&tn))?;

    let mut columns = Vec::new();
    let mut rows = conn.query(
        ctx,
        "select NAME, TYPE, LENGTH, ID, FLAG from M$SYS_COLUMNS where TABLE_ID = ? order by ID",
        &[Value::Int64(info.id)],
    )?;
    while rows.next() {
        let (col_name, typ, length, id, flag): (String, i32, i64, i64, i32) = rows.scan()?;
        let column_type = ColumnType::from_code(typ).ok_or(StrataError::UnsupportedColumnType(typ))?;
        let mut col = Column::new(col_name, column_type)
            .with_length(length.max(0) as usize)
            .with_flag(ColumnFlag(flag));
        col.id = id.max(0) as u64;
        if include_hidden || !col.is_hidden() {
            columns.push(col);
        }
    }
    if let Some(e) = rows.err() {
        return Err(e.clone());
    }
    rows.close()?;

    let mut indexes = Vec::new();
    let mut rows = conn.query(
        ctx,
        "select NAME, TYPE, ID from M$SYS_INDEXES where TABLE_ID = ?",
        &[Value::Int64(info.id)],
    )?;
    while rows.next() {
        let (idx_name, index_type, id): (String, i32, i64) = rows.scan()?;
        indexes.push(IndexInfo {
            id,
            name: idx_name,
            index_type,
        });
    }
    if let Some(e) = rows.err() {
        return Err(e.clone());
    }
    rows.close()?;

    let (database, user, _) = tn.split();
    Ok(TableDescription {
        database: database.to_string(),
        user: user.to_string(),
        name: info.name,
        id: info.id,
        table_type: info.table_type,
        flag: info.flag,
        columns,
        indexes,
    })
}

/// Every table, ordered by name. Without `all`, tables whose name starts
/// with `_` are skipped.
pub fn list_tables(conn: &Conn, ctx: &Context, all: bool) -> StrataResult<Vec<TableInfo>> {
    let mut out = Vec::new();
    let mut rows = conn.query(
        ctx,
        "select NAME, TYPE, FLAG, ID from M$SYS_TABLES order by NAME",
        &[],
    )?;
    while rows.next() {
        let (name, typ, flag, id): (String, i64, i64, i64) = rows.scan()?;
        if !all && name.starts_with('_') {
            continue;
        }
        out.push(TableInfo {
            name,
            id,
            table_type: TableType::from_code(typ),
            flag: TableFlag::from_code(flag),
        });
    }
    if let Some(e) = rows.err() {
        return Err(e.clone());
    }
    rows.close()?;
    Ok(out)
}

/// One row of `list_indexes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexListing {
    pub table: String,
    pub name: String,
    pub id: i64,
    pub index_type: i32,
}

/// Every index of every table, ordered by table then index name.
pub fn list_indexes(conn: &Conn, ctx: &Context) -> StrataResult<Vec<IndexListing>> {
    let tables = list_tables(conn, ctx, true)?;
    let mut rows = conn.query(
        ctx,
        "select NAME, TYPE, ID, TABLE_ID from M$SYS_INDEXES",
        &[],
    )?;
    let mut out = Vec::new();
    while rows.next() {
        let (name, index_type, id, table_id): (String, i32, i64, i64) = rows.scan()?;
        let table = tables
            .iter()
            .find(|t| t.id == table_id)
            .map(|t| t.name.clone())
            .unwrap_or_default();
        out.push(IndexListing {
            table,
            name,
            id,
            index_type,
        });
    }
    if let Some(e) = rows.err() {
        return Err(e.clone());
    }
    rows.close()?;
    out.sort_by(|a, b| a.table.cmp(&b.table).then_with(|| a.name.cmp(&b.name)));
    Ok(out)
}

/// Tag names of a tag table, from its `V$<TABLE>_STAT` view.
pub fn list_tags(conn: &Conn, ctx: &Context, table: &str) -> StrataResult<Vec<String>> {
    let tn = TableName::parse(table);
    let (_, _, name) = tn.split();
    let mut rows = conn.query(
        ctx,
        &format!("select NAME from V${}_STAT order by NAME", name),
        &[],
    )?;
    let mut out = Vec::new();
    while rows.next() {
        out.push(rows.get::<String>(0)?);
    }
    if let Some(e) = rows.err() {
        return Err(e.clone());
    }
    rows.close()?;
    Ok(out)
}
