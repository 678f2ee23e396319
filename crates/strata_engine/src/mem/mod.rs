//! In-memory reference engine.
//!
//! Implements the full [`Engine`] ABI over a single mutex-guarded state. It
//! understands a small SQL subset (see [`sql`]) plus the dictionary tables
//! `M$SYS_TABLES`, `M$SYS_COLUMNS`, `M$SYS_INDEXES`, `M$SYS_USERS` and the
//! per-tag-table `V$<TABLE>_STAT` view. Like the native engine it refuses to
//! prepare statements on a connection that holds an open appender.

mod catalog;
pub mod sql;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};

use parking_lot::Mutex;
use strata_common::{Column, DataType, StrataError, StrataResult, Value};

use crate::{
    data_type_to_raw_type, ColumnInfo, ConnHandle, Engine, EnvHandle, StmtHandle, StmtType,
};
use catalog::{Relation, Table};
use sql::{CmpOp, Cond, Expr, SelectItem, Statement};

pub use catalog::ARRIVAL_TIME;

const DEFAULT_USER: &str = "SYS";
const DEFAULT_PASSWORD: &str = "MANAGER";

fn err(code: i32, msg: impl Into<String>) -> StrataError {
    StrataError::engine(code, msg)
}

#[derive(Debug, Default)]
struct ConnEntry {
    user: String,
    session_id: u64,
    append_stmt: Option<u64>,
    canceled: bool,
}

#[derive(Debug, Default)]
struct AppendEntry {
    table: String,
    success: u64,
    fail: u64,
}

#[derive(Debug, Default)]
struct ResultSet {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Default)]
struct StmtEntry {
    conn: u64,
    sql: String,
    parsed: Option<Statement>,
    params: Vec<Option<Value>>,
    stmt_type: StmtType,
    effect_rows: u64,
    result: Option<ResultSet>,
    cursor: usize,
    current: Option<usize>,
    append: Option<AppendEntry>,
}

struct State {
    next_handle: u64,
    next_session_id: u64,
    next_table_id: i64,
    envs: HashSet<u64>,
    db_created: bool,
    started: bool,
    users: BTreeMap<String, String>,
    tables: BTreeMap<String, Table>,
    conns: HashMap<u64, ConnEntry>,
    stmts: HashMap<u64, StmtEntry>,
    fail_session_id: bool,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn conn(&mut self, conn: ConnHandle) -> StrataResult<&mut ConnEntry> {
        self.conns
            .get_mut(&conn.0)
            .ok_or_else(|| err(-3, "invalid connection handle"))
    }

    fn stmt(&mut self, stmt: StmtHandle) -> StrataResult<&mut StmtEntry> {
        self.stmts
            .get_mut(&stmt.0)
            .ok_or_else(|| err(-4, "invalid statement handle"))
    }

    fn check_env(&self, env: EnvHandle) -> StrataResult<()> {
        if self.envs.contains(&env.0) {
            Ok(())
        } else {
            Err(err(-5, "invalid environment handle"))
        }
    }
}

/// Thread-safe in-memory engine.
pub struct MemEngine {
    state: Mutex<State>,
}

impl MemEngine {
    pub fn new() -> Self {
        let mut users = BTreeMap::new();
        users.insert(DEFAULT_USER.to_string(), DEFAULT_PASSWORD.to_string());
        Self {
            state: Mutex::new(State {
                next_handle: 0,
                next_session_id: 0,
                next_table_id: 0,
                envs: HashSet::new(),
                db_created: false,
                started: false,
                users,
                tables: BTreeMap::new(),
                conns: HashMap::new(),
                stmts: HashMap::new(),
                fail_session_id: false,
            }),
        }
    }

    /// Register an additional user (the SQL subset has no `CREATE USER`).
    pub fn add_user(&self, name: &str, password: &str) {
        self.state
            .lock()
            .users
            .insert(name.to_uppercase(), password.to_string());
    }

    /// Number of statements currently allocated; used by leak checks in tests.
    pub fn open_statements(&self) -> usize {
        self.state.lock().stmts.len()
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().conns.len()
    }

    /// While set, `session_id` fails for every connection.
    pub fn fail_session_id(&self, fail: bool) {
        self.state.lock().fail_session_id = fail;
    }
}

impl Default for MemEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Statement execution
// ---------------------------------------------------------------------------

fn stmt_type_of(stmt: &Statement) -> StmtType {
    match stmt {
        Statement::CreateTable { .. } => StmtType::DDL_CREATE,
        Statement::DropTable { .. } => StmtType::DDL_DROP,
        Statement::TruncateTable { .. } => StmtType::DDL_TRUNCATE,
        Statement::AlterSystem => StmtType::ALTER_SYSTEM,
        Statement::Insert { .. } => StmtType::INSERT,
        Statement::Delete { .. } => StmtType::DELETE,
        Statement::Select { .. } => StmtType::SELECT,
    }
}

fn resolve(expr: &Expr, params: &[Option<Value>]) -> StrataResult<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Param(idx) => params
            .get(*idx)
            .cloned()
            .flatten()
            .ok_or_else(|| err(-30, format!("parameter {} is not bound", idx + 1))),
    }
}

enum Outcome {
    Effect(u64),
    Rows(ResultSet),
}

fn relation_for(state: &State, name: &str) -> StrataResult<Relation> {
    match name {
        "M$SYS_TABLES" => return Ok(catalog::sys_tables(&state.tables)),
        "M$SYS_COLUMNS" => return Ok(catalog::sys_columns(&state.tables)),
        "M$SYS_INDEXES" => return Ok(catalog::sys_indexes()),
        "M$SYS_USERS" => return Ok(catalog::sys_users(&state.users)),
        _ => {}
    }
    if let Some(base) = name
        .strip_prefix("V$")
        .and_then(|rest| rest.strip_suffix("_STAT"))
    {
        if let Some(t) = state.tables.get(base) {
            if t.table_type == strata_common::TableType::Tag {
                return Ok(catalog::tag_stat_view(t));
            }
        }
    }
    state
        .tables
        .get(name)
        .map(Relation::from_table)
        .ok_or_else(|| err(-40, format!("table '{}' does not exist", name)))
}

fn matches_filter(row: &[Value], filter: &[(usize, CmpOp, Value)]) -> bool {
    filter.iter().all(|(idx, op, operand)| {
        match catalog::compare(&row[*idx], operand) {
            Some(ord) => match op {
                CmpOp::Eq => ord.is_eq(),
                CmpOp::Ne => ord.is_ne(),
                CmpOp::Lt => ord.is_lt(),
                CmpOp::Le => ord.is_le(),
                CmpOp::Gt => ord.is_gt(),
                CmpOp::Ge => ord.is_ge(),
            },
            None => false,
        }
    })
}

fn bind_filter(
    columns: &[Column],
    filter: &[Cond],
    params: &[Option<Value>],
) -> StrataResult<Vec<(usize, CmpOp, Value)>> {
    filter
        .iter()
        .map(|c| {
            let idx = columns
                .iter()
                .position(|col| col.name.eq_ignore_ascii_case(&c.column))
                .ok_or_else(|| err(-41, format!("column '{}' does not exist", c.column)))?;
            Ok((idx, c.op, resolve(&c.value, params)?))
        })
        .collect()
}

fn exec_select(
    rel: Relation,
    items: &[SelectItem],
    filter: &[Cond],
    order_by: &Option<(String, bool)>,
    limit: Option<usize>,
    params: &[Option<Value>],
) -> StrataResult<ResultSet> {
    let bound = bind_filter(&rel.columns, filter, params)?;
    let mut rows: Vec<Vec<Value>> = rel
        .rows
        .into_iter()
        .filter(|r| matches_filter(r, &bound))
        .collect();

    let col_idx = |name: &str| -> StrataResult<usize> {
        rel.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| err(-41, format!("column '{}' does not exist", name)))
    };

    if let Some((name, desc)) = order_by {
        let idx = col_idx(name)?;
        rows.sort_by(|a, b| {
            let ord = catalog::compare(&a[idx], &b[idx]).unwrap_or(std::cmp::Ordering::Equal);
            if *desc {
                ord.reverse()
            } else {
                ord
            }
        });
    }

    let is_aggregate = |i: &SelectItem| {
        matches!(
            i,
            SelectItem::CountStar { .. } | SelectItem::Min { .. } | SelectItem::Max { .. }
        )
    };
    if items.iter().any(is_aggregate) {
        if !items.iter().all(is_aggregate) {
            return Err(err(-42, "cannot mix aggregates with plain columns"));
        }
        let mut columns = Vec::new();
        let mut record = Vec::new();
        for item in items {
            match item {
                SelectItem::CountStar { alias } => {
                    let name = alias.clone().unwrap_or_else(|| "COUNT(*)".to_string());
                    columns.push(Column::new(name, strata_common::ColumnType::Long));
                    record.push(Value::Int64(rows.len() as i64));
                }
                SelectItem::Min { column, alias } | SelectItem::Max { column, alias } => {
                    let is_max = matches!(item, SelectItem::Max { .. });
                    let idx = col_idx(column)?;
                    let fname = if is_max { "MAX" } else { "MIN" };
                    let mut c = rel.columns[idx].clone();
                    c.name = alias
                        .clone()
                        .unwrap_or_else(|| format!("{}({})", fname, column));
                    c.flag = strata_common::ColumnFlag::NONE;
                    columns.push(c);
                    let mut best: Option<&Value> = None;
                    for r in &rows {
                        let v = &r[idx];
                        if v.is_null() {
                            continue;
                        }
                        best = match best {
                            None => Some(v),
                            Some(b) => {
                                let ord = catalog::compare(v, b)
                                    .unwrap_or(std::cmp::Ordering::Equal);
                                if (is_max && ord.is_gt()) || (!is_max && ord.is_lt()) {
                                    Some(v)
                                } else {
                                    Some(b)
                                }
                            }
                        };
                    }
                    record.push(best.cloned().unwrap_or(Value::Null));
                }
                _ => {}
            }
        }
        return Ok(ResultSet {
            columns,
            rows: vec![record],
        });
    }

    let mut projection: Vec<(usize, String)> = Vec::new();
    for item in items {
        match item {
            SelectItem::Star => {
                for (i, c) in rel.columns.iter().enumerate() {
                    if !rel.hidden[i] {
                        projection.push((i, c.name.clone()));
                    }
                }
            }
            SelectItem::Column { name, alias } => {
                let idx = col_idx(name)?;
                projection.push((idx, alias.clone().unwrap_or_else(|| rel.columns[idx].name.clone())));
            }
            _ => {}
        }
    }
    if let Some(n) = limit {
        rows.truncate(n);
    }
    let columns = projection
        .iter()
        .map(|(idx, name)| {
            let mut c = rel.columns[*idx].clone();
            c.name = name.clone();
            c
        })
        .collect();
    let rows = rows
        .into_iter()
        .map(|r| projection.iter().map(|(idx, _)| r[*idx].clone()).collect())
        .collect();
    Ok(ResultSet { columns, rows })
}

fn execute_statement(
    state: &mut State,
    stmt: &Statement,
    params: &[Option<Value>],
) -> StrataResult<Outcome> {
    match stmt {
        Statement::CreateTable {
            name,
            table_type,
            columns,
        } => {
            if name.starts_with("M$") || name.starts_with("V$") {
                return Err(err(-50, format!("reserved table name '{}'", name)));
            }
            if state.tables.contains_key(name) {
                return Err(err(-51, format!("table '{}' already exists", name)));
            }
            state.next_table_id += 1;
            let cols = columns
                .iter()
                .map(|d| {
                    Column::new(d.name.clone(), d.column_type)
                        .with_length(d.length)
                        .with_flag(d.flag)
                })
                .collect();
            let table = Table::new(state.next_table_id, name.clone(), *table_type, cols);
            state.tables.insert(name.clone(), table);
            Ok(Outcome::Effect(0))
        }
        Statement::DropTable { name } => {
            state
                .tables
                .remove(name)
                .ok_or_else(|| err(-40, format!("table '{}' does not exist", name)))?;
            Ok(Outcome::Effect(0))
        }
        Statement::TruncateTable { name } => {
            let table = state
                .tables
                .get_mut(name)
                .ok_or_else(|| err(-40, format!("table '{}' does not exist", name)))?;
            table.rows.clear();
            table.tag_stats.clear();
            Ok(Outcome::Effect(0))
        }
        Statement::AlterSystem => Ok(Outcome::Effect(0)),
        Statement::Insert {
            table,
            columns,
            values,
        } => {
            let t = state
                .tables
                .get_mut(table)
                .ok_or_else(|| err(-40, format!("table '{}' does not exist", table)))?;
            let resolved: Vec<Value> = values
                .iter()
                .map(|e| resolve(e, params))
                .collect::<StrataResult<_>>()?;
            let mut record = vec![Value::Null; t.columns.len()];
            match columns {
                Some(names) => {
                    if names.len() != resolved.len() {
                        return Err(err(-52, "column count does not match value count"));
                    }
                    for (name, v) in names.iter().zip(resolved) {
                        let idx = t
                            .column_index(name)
                            .ok_or_else(|| err(-41, format!("column '{}' does not exist", name)))?;
                        record[idx] = v;
                    }
                }
                None => {
                    let visible = t.visible_columns();
                    if resolved.len() == visible.len() {
                        for (idx, v) in visible.into_iter().zip(resolved) {
                            record[idx] = v;
                        }
                    } else if resolved.len() == t.columns.len() {
                        record = resolved;
                    } else {
                        return Err(err(
                            -52,
                            format!(
                                "table '{}' has {} columns, {} values given",
                                table,
                                visible.len(),
                                resolved.len()
                            ),
                        ));
                    }
                }
            }
            t.insert_row(record)?;
            Ok(Outcome::Effect(1))
        }
        Statement::Delete { table, filter } => {
            let t = state
                .tables
                .get_mut(table)
                .ok_or_else(|| err(-40, format!("table '{}' does not exist", table)))?;
            let bound = bind_filter(&t.columns, filter, params)?;
            let before = t.rows.len();
            t.rows.retain(|r| !matches_filter(r, &bound));
            let removed = (before - t.rows.len()) as u64;
            if removed > 0 {
                t.rebuild_tag_stats();
            }
            Ok(Outcome::Effect(removed))
        }
        Statement::Select {
            table,
            items,
            filter,
            order_by,
            limit,
        } => {
            let rel = relation_for(state, table)?;
            Ok(Outcome::Rows(exec_select(
                rel, items, filter, order_by, *limit, params,
            )?))
        }
    }
}

fn explain_text(stmt: &Statement) -> String {
    match stmt {
        Statement::Select {
            table,
            filter,
            order_by,
            limit,
            ..
        } => {
            let mut out = String::from(" PROJECT\n");
            if let Some(n) = limit {
                out.push_str(&format!("  LIMIT ({})\n", n));
            }
            if let Some((col, desc)) = order_by {
                out.push_str(&format!(
                    "  SORT ({} {})\n",
                    col,
                    if *desc { "DESC" } else { "ASC" }
                ));
            }
            if filter.is_empty() {
                out.push_str(&format!("   FULL SCAN ({})", table));
            } else {
                let preds: Vec<String> = filter.iter().map(|c| c.column.clone()).collect();
                out.push_str(&format!(
                    "   FILTER SCAN ({}) [{}]",
                    table,
                    preds.join(", ")
                ));
            }
            out
        }
        Statement::Insert { table, .. } => format!(" INSERT ({})", table),
        Statement::Delete { table, .. } => format!(" DELETE ({})", table),
        Statement::CreateTable { name, .. } => format!(" CREATE TABLE ({})", name),
        Statement::DropTable { name } => format!(" DROP TABLE ({})", name),
        Statement::TruncateTable { name } => format!(" TRUNCATE TABLE ({})", name),
        Statement::AlterSystem => " ALTER SYSTEM".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Engine ABI
// ---------------------------------------------------------------------------

impl MemEngine {
    fn column_value(&self, stmt: StmtHandle, idx: usize) -> StrataResult<Value> {
        let mut st = self.state.lock();
        let entry = st.stmt(stmt)?;
        let rs = entry
            .result
            .as_ref()
            .ok_or_else(|| err(-60, "statement has no result set"))?;
        let row = entry
            .current
            .and_then(|r| rs.rows.get(r))
            .ok_or_else(|| err(-61, "no current row, call fetch first"))?;
        row.get(idx)
            .cloned()
            .ok_or_else(|| err(-62, format!("column index {} out of range", idx)))
    }

    fn prepare_locked(st: &mut State, stmt: StmtHandle, sql: &str) -> StrataResult<()> {
        let conn = st.stmt(stmt)?.conn;
        if let Some(app) = st.conns.get(&conn).and_then(|c| c.append_stmt) {
            tracing::debug!(conn, append_stmt = app, "prepare refused, appender holds the connection");
            return Err(err(-70, "lock already initialized"));
        }
        let parsed = sql::parse(sql)?;
        let entry = st.stmt(stmt)?;
        entry.sql = sql.to_string();
        entry.stmt_type = stmt_type_of(&parsed);
        entry.params = vec![None; parsed.param_count()];
        entry.parsed = Some(parsed);
        entry.result = None;
        entry.effect_rows = 0;
        entry.cursor = 0;
        entry.current = None;
        Ok(())
    }

    fn execute_locked(st: &mut State, stmt: StmtHandle) -> StrataResult<()> {
        let (conn, parsed, params) = {
            let entry = st.stmt(stmt)?;
            let parsed = entry
                .parsed
                .clone()
                .ok_or_else(|| err(-71, "statement is not prepared"))?;
            (entry.conn, parsed, entry.params.clone())
        };
        if let Some(c) = st.conns.get_mut(&conn) {
            if c.canceled {
                c.canceled = false;
                return Err(err(-80, "operation canceled"));
            }
        }
        let outcome = execute_statement(st, &parsed, &params)?;
        let entry = st.stmt(stmt)?;
        entry.cursor = 0;
        entry.current = None;
        match outcome {
            Outcome::Effect(n) => {
                entry.effect_rows = n;
                entry.result = None;
            }
            Outcome::Rows(rs) => {
                entry.effect_rows = 0;
                entry.result = Some(rs);
            }
        }
        Ok(())
    }

    fn bind(&self, stmt: StmtHandle, idx: usize, v: Value) -> StrataResult<()> {
        let mut st = self.state.lock();
        let entry = st.stmt(stmt)?;
        let count = entry.params.len();
        let slot = entry.params.get_mut(idx).ok_or_else(|| {
            err(
                -31,
                format!("bind index {} out of range, {} parameters", idx, count),
            )
        })?;
        *slot = Some(v);
        Ok(())
    }
}

impl Engine for MemEngine {
    fn initialize(&self, _home: &str) -> StrataResult<EnvHandle> {
        let mut st = self.state.lock();
        let h = st.handle();
        st.envs.insert(h);
        Ok(EnvHandle(h))
    }

    fn finalize(&self, env: EnvHandle) -> StrataResult<()> {
        let mut st = self.state.lock();
        if !st.envs.remove(&env.0) {
            return Err(err(-5, "invalid environment handle"));
        }
        Ok(())
    }

    fn create_database(&self, env: EnvHandle) -> StrataResult<()> {
        let mut st = self.state.lock();
        st.check_env(env)?;
        if st.db_created {
            return Err(err(-6, "database already exists"));
        }
        st.db_created = true;
        Ok(())
    }

    fn destroy_database(&self, env: EnvHandle) -> StrataResult<()> {
        let mut st = self.state.lock();
        st.check_env(env)?;
        if st.started {
            return Err(err(-7, "database is running"));
        }
        st.db_created = false;
        st.tables.clear();
        Ok(())
    }

    fn exists_database(&self, env: EnvHandle) -> StrataResult<bool> {
        let st = self.state.lock();
        st.check_env(env)?;
        Ok(st.db_created)
    }

    fn startup(&self, env: EnvHandle) -> StrataResult<()> {
        let mut st = self.state.lock();
        st.check_env(env)?;
        if !st.db_created {
            return Err(err(-8, "database does not exist"));
        }
        st.started = true;
        Ok(())
    }

    fn shutdown(&self, env: EnvHandle) -> StrataResult<()> {
        let mut st = self.state.lock();
        st.check_env(env)?;
        st.started = false;
        Ok(())
    }

    fn connect(&self, _env: EnvHandle, user: &str, password: &str) -> StrataResult<ConnHandle> {
        let mut st = self.state.lock();
        if !st.started {
            return Err(err(-9, "database is not started"));
        }
        let user = user.to_uppercase();
        match st.users.get(&user) {
            Some(pw) if pw.eq_ignore_ascii_case(password) => {}
            _ => return Err(err(-100, "invalid username/password")),
        }
        st.next_session_id += 1;
        let session_id = st.next_session_id;
        let h = st.handle();
        st.conns.insert(
            h,
            ConnEntry {
                user,
                session_id,
                ..Default::default()
            },
        );
        Ok(ConnHandle(h))
    }

    fn connect_trust(&self, _env: EnvHandle, user: &str) -> StrataResult<ConnHandle> {
        let mut st = self.state.lock();
        if !st.started {
            return Err(err(-9, "database is not started"));
        }
        let user = user.to_uppercase();
        if !st.users.contains_key(&user) {
            return Err(err(-101, format!("user '{}' does not exist", user)));
        }
        st.next_session_id += 1;
        let session_id = st.next_session_id;
        let h = st.handle();
        st.conns.insert(
            h,
            ConnEntry {
                user,
                session_id,
                ..Default::default()
            },
        );
        Ok(ConnHandle(h))
    }

    fn disconnect(&self, conn: ConnHandle) -> StrataResult<()> {
        let mut st = self.state.lock();
        if st.conns.remove(&conn.0).is_none() {
            return Err(err(-3, "invalid connection handle"));
        }
        let before = st.stmts.len();
        st.stmts.retain(|_, s| s.conn != conn.0);
        tracing::debug!(conn = conn.0, dropped_stmts = before - st.stmts.len(), "disconnected");
        Ok(())
    }

    fn cancel(&self, conn: ConnHandle) -> StrataResult<()> {
        let mut st = self.state.lock();
        st.conn(conn)?.canceled = true;
        Ok(())
    }

    fn session_id(&self, conn: ConnHandle) -> StrataResult<u64> {
        let mut st = self.state.lock();
        if st.fail_session_id {
            return Err(err(-6, "session id unavailable"));
        }
        Ok(st.conn(conn)?.session_id)
    }

    fn user_auth(&self, env: EnvHandle, user: &str, password: &str) -> StrataResult<bool> {
        let st = self.state.lock();
        st.check_env(env)?;
        Ok(matches!(st.users.get(&user.to_uppercase()), Some(pw) if pw.eq_ignore_ascii_case(password)))
    }

    fn ping(&self, conn: ConnHandle) -> StrataResult<()> {
        let mut st = self.state.lock();
        let _ = st.conn(conn)?;
        if !st.started {
            return Err(err(-9, "database is not started"));
        }
        Ok(())
    }

    fn alloc_stmt(&self, conn: ConnHandle) -> StrataResult<StmtHandle> {
        let mut st = self.state.lock();
        let _ = st.conn(conn)?;
        let h = st.handle();
        st.stmts.insert(
            h,
            StmtEntry {
                conn: conn.0,
                ..Default::default()
            },
        );
        Ok(StmtHandle(h))
    }

    fn free_stmt(&self, stmt: StmtHandle) -> StrataResult<()> {
        let mut st = self.state.lock();
        let entry = st
            .stmts
            .remove(&stmt.0)
            .ok_or_else(|| err(-4, "invalid statement handle"))?;
        if entry.append.is_some() {
            if let Some(c) = st.conns.get_mut(&entry.conn) {
                c.append_stmt = None;
            }
        }
        Ok(())
    }

    fn prepare(&self, stmt: StmtHandle, sql: &str) -> StrataResult<()> {
        let mut st = self.state.lock();
        Self::prepare_locked(&mut st, stmt, sql)
    }

    fn direct_execute(&self, stmt: StmtHandle, sql: &str) -> StrataResult<()> {
        let mut st = self.state.lock();
        Self::prepare_locked(&mut st, stmt, sql)?;
        Self::execute_locked(&mut st, stmt)
    }

    fn execute(&self, stmt: StmtHandle) -> StrataResult<()> {
        let mut st = self.state.lock();
        Self::execute_locked(&mut st, stmt)
    }

    fn bind_null(&self, stmt: StmtHandle, idx: usize) -> StrataResult<()> {
        self.bind(stmt, idx, Value::Null)
    }

    fn bind_int32(&self, stmt: StmtHandle, idx: usize, v: i32) -> StrataResult<()> {
        self.bind(stmt, idx, Value::Int32(v))
    }

    fn bind_int64(&self, stmt: StmtHandle, idx: usize, v: i64) -> StrataResult<()> {
        self.bind(stmt, idx, Value::Int64(v))
    }

    fn bind_float64(&self, stmt: StmtHandle, idx: usize, v: f64) -> StrataResult<()> {
        self.bind(stmt, idx, Value::Float64(v))
    }

    fn bind_string(&self, stmt: StmtHandle, idx: usize, v: &str) -> StrataResult<()> {
        self.bind(stmt, idx, Value::String(v.to_string()))
    }

    fn bind_binary(&self, stmt: StmtHandle, idx: usize, v: &[u8]) -> StrataResult<()> {
        self.bind(stmt, idx, Value::Binary(v.to_vec()))
    }

    fn effect_rows(&self, stmt: StmtHandle) -> StrataResult<u64> {
        let mut st = self.state.lock();
        Ok(st.stmt(stmt)?.effect_rows)
    }

    fn stmt_type(&self, stmt: StmtHandle) -> StrataResult<StmtType> {
        let mut st = self.state.lock();
        Ok(st.stmt(stmt)?.stmt_type)
    }

    fn column_count(&self, stmt: StmtHandle) -> StrataResult<usize> {
        let mut st = self.state.lock();
        Ok(st
            .stmt(stmt)?
            .result
            .as_ref()
            .map(|rs| rs.columns.len())
            .unwrap_or(0))
    }

    fn column_info(&self, stmt: StmtHandle, idx: usize) -> StrataResult<ColumnInfo> {
        let mut st = self.state.lock();
        let entry = st.stmt(stmt)?;
        let col = entry
            .result
            .as_ref()
            .and_then(|rs| rs.columns.get(idx))
            .ok_or_else(|| err(-62, format!("column index {} out of range", idx)))?;
        let size = match col.data_type {
            DataType::Int16 => 2,
            DataType::Int32 | DataType::Float32 | DataType::Ipv4 => 4,
            DataType::Int64 | DataType::Datetime | DataType::Float64 => 8,
            DataType::Ipv6 => 16,
            DataType::String | DataType::Binary => col.length,
        };
        Ok(ColumnInfo {
            name: col.name.clone(),
            raw_type: data_type_to_raw_type(col.data_type),
            size,
            length: col.length,
        })
    }

    fn fetch(&self, stmt: StmtHandle) -> StrataResult<bool> {
        let mut st = self.state.lock();
        let conn = st.stmt(stmt)?.conn;
        if let Some(c) = st.conns.get_mut(&conn) {
            if c.canceled {
                c.canceled = false;
                return Err(err(-80, "operation canceled"));
            }
        }
        let entry = st.stmt(stmt)?;
        let total = match &entry.result {
            Some(rs) => rs.rows.len(),
            None => return Ok(false),
        };
        if entry.cursor < total {
            entry.current = Some(entry.cursor);
            entry.cursor += 1;
            Ok(true)
        } else {
            entry.current = None;
            Ok(false)
        }
    }

    fn column_data_int16(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(i16, bool)> {
        match self.column_value(stmt, idx)? {
            Value::Null => Ok((0, false)),
            v => Ok((v.as_i64().unwrap_or_default() as i16, true)),
        }
    }

    fn column_data_int32(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(i32, bool)> {
        match self.column_value(stmt, idx)? {
            Value::Null => Ok((0, false)),
            v => Ok((v.as_i64().unwrap_or_default() as i32, true)),
        }
    }

    fn column_data_int64(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(i64, bool)> {
        match self.column_value(stmt, idx)? {
            Value::Null => Ok((0, false)),
            v => Ok((v.as_i64().unwrap_or_default(), true)),
        }
    }

    fn column_data_datetime(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(i64, bool)> {
        self.column_data_int64(stmt, idx)
    }

    fn column_data_float32(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(f32, bool)> {
        match self.column_value(stmt, idx)? {
            Value::Null => Ok((0.0, false)),
            v => Ok((v.as_f64().unwrap_or_default() as f32, true)),
        }
    }

    fn column_data_float64(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(f64, bool)> {
        match self.column_value(stmt, idx)? {
            Value::Null => Ok((0.0, false)),
            v => Ok((v.as_f64().unwrap_or_default(), true)),
        }
    }

    fn column_data_ipv4(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(Ipv4Addr, bool)> {
        match self.column_value(stmt, idx)? {
            Value::Ipv4(ip) => Ok((ip, true)),
            Value::Null => Ok((Ipv4Addr::UNSPECIFIED, false)),
            other => Err(err(-63, format!("column {} is {}, not ipv4", idx, other.type_name()))),
        }
    }

    fn column_data_ipv6(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(Ipv6Addr, bool)> {
        match self.column_value(stmt, idx)? {
            Value::Ipv6(ip) => Ok((ip, true)),
            Value::Ipv4(ip) => Ok((ip.to_ipv6_mapped(), true)),
            Value::Null => Ok((Ipv6Addr::UNSPECIFIED, false)),
            other => Err(err(-63, format!("column {} is {}, not ipv6", idx, other.type_name()))),
        }
    }

    fn column_data_string(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(String, bool)> {
        match self.column_value(stmt, idx)? {
            Value::Null => Ok((String::new(), false)),
            Value::String(s) => Ok((s, true)),
            other => Ok((other.to_string(), true)),
        }
    }

    fn column_data_binary(&self, stmt: StmtHandle, idx: usize) -> StrataResult<(Vec<u8>, bool)> {
        match self.column_value(stmt, idx)? {
            Value::Null => Ok((Vec::new(), false)),
            Value::Binary(b) => Ok((b, true)),
            Value::String(s) => Ok((s.into_bytes(), true)),
            other => Err(err(-63, format!("column {} is {}, not binary", idx, other.type_name()))),
        }
    }

    fn append_open(&self, stmt: StmtHandle, table: &str) -> StrataResult<()> {
        let mut st = self.state.lock();
        let name = strata_common::TableName::parse(table).table;
        let conn = st.stmt(stmt)?.conn;
        let columns = match st.tables.get(&name) {
            Some(t) if t.table_type.accepts_append() => t.columns.clone(),
            Some(_) => {
                return Err(err(-90, format!("table '{}' does not support append", name)));
            }
            None => return Err(err(-40, format!("table '{}' does not exist", name))),
        };
        let c = st.conn(ConnHandle(conn))?;
        if c.append_stmt.is_some() {
            return Err(err(-70, "lock already initialized"));
        }
        c.append_stmt = Some(stmt.0);
        tracing::debug!(conn, stmt = stmt.0, table = %name, "append opened");
        let entry = st.stmt(stmt)?;
        // append columns are reported through column_count/column_info
        entry.result = Some(ResultSet {
            columns,
            rows: Vec::new(),
        });
        entry.append = Some(AppendEntry {
            table: name,
            ..Default::default()
        });
        Ok(())
    }

    fn append_data(
        &self,
        stmt: StmtHandle,
        types: &[DataType],
        values: &[Value],
    ) -> StrataResult<()> {
        let mut st = self.state.lock();
        let table_name = match &st.stmt(stmt)?.append {
            Some(a) => a.table.clone(),
            None => return Err(err(-91, "appender is not opened")),
        };
        if types.len() != values.len() {
            return Err(err(
                -92,
                format!("{} types for {} values", types.len(), values.len()),
            ));
        }
        let result = match st.tables.get_mut(&table_name) {
            Some(t) => t.insert_row(values.to_vec()),
            None => Err(err(-40, format!("table '{}' does not exist", table_name))),
        };
        if let Some(a) = st.stmt(stmt)?.append.as_mut() {
            if result.is_ok() {
                a.success += 1;
            } else {
                a.fail += 1;
            }
        }
        result
    }

    fn append_close(&self, stmt: StmtHandle) -> StrataResult<(u64, u64)> {
        let mut st = self.state.lock();
        let entry = st.stmt(stmt)?;
        let append = entry
            .append
            .take()
            .ok_or_else(|| err(-91, "appender is not opened"))?;
        let conn = entry.conn;
        if let Some(c) = st.conns.get_mut(&conn) {
            c.append_stmt = None;
        }
        tracing::debug!(conn, stmt = stmt.0, success = append.success, fail = append.fail, "append closed");
        Ok((append.success, append.fail))
    }

    fn explain(&self, stmt: StmtHandle, full: bool) -> StrataResult<String> {
        let mut st = self.state.lock();
        let entry = st.stmt(stmt)?;
        let parsed = entry
            .parsed
            .as_ref()
            .ok_or_else(|| err(-71, "statement is not prepared"))?;
        let mut text = explain_text(parsed);
        if full {
            let rows = entry
                .result
                .as_ref()
                .map(|rs| rs.rows.len() as u64)
                .unwrap_or(entry.effect_rows);
            text.push_str(&format!("\n[EXECUTE] ROWS: {}", rows));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> (MemEngine, EnvHandle) {
        let eng = MemEngine::new();
        let env = eng.initialize("").unwrap();
        eng.create_database(env).unwrap();
        eng.startup(env).unwrap();
        (eng, env)
    }

    fn exec(eng: &MemEngine, conn: ConnHandle, sql: &str) -> StmtHandle {
        let stmt = eng.alloc_stmt(conn).unwrap();
        eng.direct_execute(stmt, sql).unwrap();
        stmt
    }

    #[test]
    fn test_connect_requires_startup_and_credentials() {
        let eng = MemEngine::new();
        let env = eng.initialize("").unwrap();
        assert!(eng.connect(env, "sys", "manager").is_err());
        eng.create_database(env).unwrap();
        eng.startup(env).unwrap();
        assert!(eng.connect(env, "sys", "wrong").is_err());
        let conn = eng.connect(env, "sys", "manager").unwrap();
        assert_eq!(eng.session_id(conn).unwrap(), 1);
        assert!(eng.user_auth(env, "SYS", "manager").unwrap());
        assert!(!eng.user_auth(env, "nobody", "x").unwrap());
    }

    #[test]
    fn test_prepare_bind_execute_fetch() {
        let (eng, env) = started();
        let conn = eng.connect_trust(env, "sys").unwrap();
        let s = exec(&eng, conn, "create tag table t (name varchar(20) primary key, time datetime basetime, value double)");
        assert!(eng.stmt_type(s).unwrap().is_ddl());
        eng.free_stmt(s).unwrap();

        let s = eng.alloc_stmt(conn).unwrap();
        eng.prepare(s, "insert into t values(?, ?, ?)").unwrap();
        eng.bind_string(s, 0, "a").unwrap();
        eng.bind_int64(s, 1, 1_000).unwrap();
        eng.bind_float64(s, 2, 1.5).unwrap();
        eng.execute(s).unwrap();
        assert_eq!(eng.effect_rows(s).unwrap(), 1);
        eng.free_stmt(s).unwrap();

        let s = eng.alloc_stmt(conn).unwrap();
        eng.prepare(s, "select name, time, value from t where name = ?").unwrap();
        eng.bind_string(s, 0, "a").unwrap();
        eng.execute(s).unwrap();
        assert!(eng.stmt_type(s).unwrap().is_select());
        assert_eq!(eng.column_count(s).unwrap(), 3);
        assert_eq!(eng.column_info(s, 1).unwrap().raw_type, crate::raw_type::DATETIME);
        assert!(eng.fetch(s).unwrap());
        assert_eq!(eng.column_data_string(s, 0).unwrap(), ("a".to_string(), true));
        assert_eq!(eng.column_data_datetime(s, 1).unwrap(), (1_000, true));
        assert_eq!(eng.column_data_float64(s, 2).unwrap(), (1.5, true));
        assert!(!eng.fetch(s).unwrap());
        eng.free_stmt(s).unwrap();
        assert_eq!(eng.open_statements(), 0);
    }

    #[test]
    fn test_unbound_parameter_fails_execute() {
        let (eng, env) = started();
        let conn = eng.connect_trust(env, "sys").unwrap();
        exec(&eng, conn, "create table logs (v integer)");
        let s = eng.alloc_stmt(conn).unwrap();
        eng.prepare(s, "insert into logs values(?)").unwrap();
        assert!(eng.execute(s).is_err());
        assert!(eng.bind_int32(s, 1, 5).is_err());
    }

    #[test]
    fn test_append_lock_blocks_prepare_on_same_connection() {
        let (eng, env) = started();
        let conn = eng.connect_trust(env, "sys").unwrap();
        exec(&eng, conn, "create table logs (v integer)");
        let app = eng.alloc_stmt(conn).unwrap();
        eng.append_open(app, "logs").unwrap();
        assert_eq!(eng.column_count(app).unwrap(), 2);
        assert_eq!(eng.column_info(app, 0).unwrap().name, ARRIVAL_TIME);
        let q = eng.alloc_stmt(conn).unwrap();
        let e = eng.prepare(q, "select * from logs").unwrap_err();
        assert!(e.to_string().contains("lock already initialized"));

        let types = [DataType::Datetime, DataType::Int32];
        eng.append_data(app, &types, &[Value::Datetime(0), Value::Int32(1)])
            .unwrap();
        assert!(eng
            .append_data(app, &types, &[Value::Datetime(0), Value::String("x".into())])
            .is_err());
        assert_eq!(eng.append_close(app).unwrap(), (1, 1));
        eng.prepare(q, "select * from logs").unwrap();
    }

    #[test]
    fn test_append_rejects_volatile_table() {
        let (eng, env) = started();
        let conn = eng.connect_trust(env, "sys").unwrap();
        exec(&eng, conn, "create volatile table vt (k integer)");
        let app = eng.alloc_stmt(conn).unwrap();
        assert!(eng.append_open(app, "vt").is_err());
    }

    #[test]
    fn test_dictionary_and_stat_views() {
        let (eng, env) = started();
        let conn = eng.connect_trust(env, "sys").unwrap();
        exec(&eng, conn, "create tag table tag (name varchar(20) primary key, time datetime basetime, value double)");
        exec(&eng, conn, "insert into tag values('t1', 100, 1.0)");
        exec(&eng, conn, "insert into tag values('t1', 50, 2.0)");

        let s = eng.alloc_stmt(conn).unwrap();
        eng.prepare(s, "select type from M$SYS_TABLES where name = ?").unwrap();
        eng.bind_string(s, 0, "TAG").unwrap();
        eng.execute(s).unwrap();
        assert!(eng.fetch(s).unwrap());
        assert_eq!(eng.column_data_int32(s, 0).unwrap(), (6, true));

        let s = exec(&eng, conn, "select recent_row_time, row_count from V$TAG_STAT where name = 't1'");
        assert!(eng.fetch(s).unwrap());
        assert_eq!(eng.column_data_datetime(s, 0).unwrap(), (50, true));
        assert_eq!(eng.column_data_int64(s, 1).unwrap(), (2, true));
    }

    #[test]
    fn test_aggregates_and_order() {
        let (eng, env) = started();
        let conn = eng.connect_trust(env, "sys").unwrap();
        exec(&eng, conn, "create table logs (v integer)");
        for i in [3, 1, 2] {
            exec(&eng, conn, &format!("insert into logs values({})", i));
        }
        let s = exec(&eng, conn, "select count(*), max(v), min(v) from logs");
        assert!(eng.fetch(s).unwrap());
        assert_eq!(eng.column_info(s, 0).unwrap().name, "COUNT(*)");
        assert_eq!(eng.column_data_int64(s, 0).unwrap(), (3, true));
        assert_eq!(eng.column_data_int32(s, 1).unwrap(), (3, true));
        assert_eq!(eng.column_data_int32(s, 2).unwrap(), (1, true));

        let s = exec(&eng, conn, "select v from logs order by v desc limit 2");
        let mut seen = Vec::new();
        while eng.fetch(s).unwrap() {
            seen.push(eng.column_data_int32(s, 0).unwrap().0);
        }
        assert_eq!(seen, vec![3, 2]);

        let s = exec(&eng, conn, "select max(_ARRIVAL_TIME) from logs where v > 100");
        assert!(eng.fetch(s).unwrap());
        assert!(!eng.column_data_datetime(s, 0).unwrap().1);
    }

    #[test]
    fn test_delete_reports_effect_rows() {
        let (eng, env) = started();
        let conn = eng.connect_trust(env, "sys").unwrap();
        exec(&eng, conn, "create table logs (v integer)");
        exec(&eng, conn, "insert into logs values(1)");
        let s = exec(&eng, conn, "delete from logs where v = 2");
        assert_eq!(eng.effect_rows(s).unwrap(), 0);
        assert!(eng.stmt_type(s).unwrap().is_delete());
        let s = exec(&eng, conn, "delete from logs");
        assert_eq!(eng.effect_rows(s).unwrap(), 1);
    }

    #[test]
    fn test_cancel_interrupts_next_fetch() {
        let (eng, env) = started();
        let conn = eng.connect_trust(env, "sys").unwrap();
        exec(&eng, conn, "create table logs (v integer)");
        exec(&eng, conn, "insert into logs values(1)");
        let s = exec(&eng, conn, "select * from logs");
        eng.cancel(conn).unwrap();
        assert!(eng.fetch(s).is_err());
    }

    #[test]
    fn test_disconnect_frees_statements() {
        let (eng, env) = started();
        let conn = eng.connect_trust(env, "sys").unwrap();
        let _ = eng.alloc_stmt(conn).unwrap();
        let _ = eng.alloc_stmt(conn).unwrap();
        eng.disconnect(conn).unwrap();
        assert_eq!(eng.open_statements(), 0);
        assert_eq!(eng.open_connections(), 0);
        assert!(eng.alloc_stmt(conn).is_err());
    }

    #[test]
    fn test_explain_full_reports_rows() {
        let (eng, env) = started();
        let conn = eng.connect_trust(env, "sys").unwrap();
        exec(&eng, conn, "create table logs (v integer)");
        let s = eng.alloc_stmt(conn).unwrap();
        eng.prepare(s, "select * from logs where v = 1").unwrap();
        let plan = eng.explain(s, false).unwrap();
        assert!(plan.contains("FILTER SCAN (LOGS)"));
        let s = exec(&eng, conn, "select * from logs");
        assert!(eng.explain(s, true).unwrap().contains("[EXECUTE] ROWS: 0"));
    }
}
