//! Tables, dictionary views and value coercion for the in-memory engine.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, NaiveDateTime, Utc};
use strata_common::value::{datetime_to_nanos, now_nanos};
use strata_common::{
    Column, ColumnType, DataType, StrataError, StrataResult, TableFlag, TableType,
    Value,
};

pub const ARRIVAL_TIME: &str = "_ARRIVAL_TIME";
pub const SYS_USER_ID: i64 = 1;

#[derive(Debug, Clone, Default)]
pub struct TagStat {
    pub row_count: i64,
    pub min_time: i64,
    pub max_time: i64,
    pub recent_row_time: i64,
}

#[derive(Debug, Clone)]
pub struct Table {
    pub id: i64,
    pub name: String,
    pub table_type: TableType,
    pub flag: TableFlag,
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
    pub tag_stats: BTreeMap<String, TagStat>,
    last_arrival: i64,
}

impl Table {
    pub fn new(id: i64, name: String, table_type: TableType, mut columns: Vec<Column>) -> Self {
        if table_type == TableType::Log {
            columns.insert(0, Column::new(ARRIVAL_TIME, ColumnType::Datetime));
        }
        for (i, col) in columns.iter_mut().enumerate() {
            col.id = i as u64;
        }
        let flag = if table_type == TableType::Tag {
            TableFlag::Data
        } else {
            TableFlag::None
        };
        Self {
            id,
            name,
            table_type,
            flag,
            columns,
            rows: Vec::new(),
            tag_stats: BTreeMap::new(),
            last_arrival: 0,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn visible_columns(&self) -> Vec<usize> {
        (0..self.columns.len())
            .filter(|i| !self.columns[*i].is_hidden())
            .collect()
    }

    fn next_arrival(&mut self) -> i64 {
        let now = now_nanos();
        let ts = if now > self.last_arrival {
            now
        } else {
            self.last_arrival + 1
        };
        self.last_arrival = ts;
        ts
    }

    /// Coerce and store one full-width record. A zero arrival time is assigned by the engine.
    pub fn insert_row(&mut self, mut record: Vec<Value>) -> StrataResult<()> {
        if record.len() != self.columns.len() {
            return Err(StrataError::engine(
                -10,
                format!(
                    "table {} expects {} values, got {}",
                    self.name,
                    self.columns.len(),
                    record.len()
                ),
            ));
        }
        for (i, v) in record.iter_mut().enumerate() {
            let taken = std::mem::replace(v, Value::Null);
            *v = coerce(taken, self.columns[i].data_type)?;
        }
        if self.table_type == TableType::Log {
            let arrival = match record[0] {
                Value::Datetime(ts) if ts != 0 => {
                    if ts > self.last_arrival {
                        self.last_arrival = ts;
                    }
                    ts
                }
                _ => self.next_arrival(),
            };
            record[0] = Value::Datetime(arrival);
        }
        if self.table_type == TableType::Tag {
            self.update_tag_stat(&record)?;
        }
        self.rows.push(record);
        Ok(())
    }

    fn update_tag_stat(&mut self, record: &[Value]) -> StrataResult<()> {
        let name_idx = self.columns.iter().position(|c| c.is_tag_name());
        let time_idx = self.columns.iter().position(|c| c.is_basetime());
        let (Some(name_idx), Some(time_idx)) = (name_idx, time_idx) else {
            return Ok(());
        };
        let name = match &record[name_idx] {
            Value::String(s) => s.clone(),
            Value::Null => {
                return Err(StrataError::engine(-11, "tag name must not be null"));
            }
            other => other.to_string(),
        };
        let ts = record[time_idx].as_i64().unwrap_or(0);
        let stat = self.tag_stats.entry(name).or_default();
        if stat.row_count == 0 || ts < stat.min_time {
            stat.min_time = ts;
        }
        if stat.row_count == 0 || ts > stat.max_time {
            stat.max_time = ts;
        }
        stat.recent_row_time = ts;
        stat.row_count += 1;
        Ok(())
    }

    pub fn rebuild_tag_stats(&mut self) {
        self.tag_stats.clear();
        let rows = std::mem::take(&mut self.rows);
        for row in &rows {
            let _ = self.update_tag_stat(row);
        }
        self.rows = rows;
    }
}

// ---------------------------------------------------------------------------
// Dictionary views
// ---------------------------------------------------------------------------

/// A materialized relation: the shape every SELECT is evaluated over.
#[derive(Debug, Clone, Default)]
pub struct Relation {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
    /// Columns hidden from `SELECT *`.
    pub hidden: Vec<bool>,
}

impl Relation {
    fn new(columns: Vec<Column>) -> Self {
        let hidden = vec![false; columns.len()];
        Self {
            columns,
            rows: Vec::new(),
            hidden,
        }
    }

    pub fn from_table(table: &Table) -> Self {
        Self {
            hidden: table.columns.iter().map(|c| c.is_hidden()).collect(),
            columns: table.columns.clone(),
            rows: table.rows.clone(),
        }
    }
}

fn col(name: &str, ct: ColumnType) -> Column {
    Column::new(name, ct)
}

pub fn sys_tables(tables: &BTreeMap<String, Table>) -> Relation {
    let mut rel = Relation::new(vec![
        col("NAME", ColumnType::Varchar).with_length(100),
        col("TYPE", ColumnType::Integer),
        col("FLAG", ColumnType::Integer),
        col("ID", ColumnType::Long),
        col("COLCOUNT", ColumnType::Integer),
        col("USER_ID", ColumnType::Integer),
        col("DATABASE_ID", ColumnType::Integer),
    ]);
    for t in tables.values() {
        rel.rows.push(vec![
            Value::String(t.name.clone()),
            Value::Int32(t.table_type.code()),
            Value::Int32(t.flag.code()),
            Value::Int64(t.id),
            Value::Int32(t.columns.len() as i32),
            Value::Int32(SYS_USER_ID as i32),
            Value::Int32(-1),
        ]);
    }
    rel
}

pub fn sys_columns(tables: &BTreeMap<String, Table>) -> Relation {
    let mut rel = Relation::new(vec![
        col("NAME", ColumnType::Varchar).with_length(100),
        col("TABLE_ID", ColumnType::Long),
        col("ID", ColumnType::Long),
        col("TYPE", ColumnType::Integer),
        col("LENGTH", ColumnType::Integer),
        col("FLAG", ColumnType::Integer),
        col("DATABASE_ID", ColumnType::Integer),
    ]);
    for t in tables.values() {
        for c in &t.columns {
            rel.rows.push(vec![
                Value::String(c.name.clone()),
                Value::Int64(t.id),
                Value::Int64(c.id as i64),
                Value::Int32(c.column_type.code()),
                Value::Int32(c.length as i32),
                Value::Int32(c.flag.0),
                Value::Int32(-1),
            ]);
        }
    }
    rel
}

pub fn sys_indexes() -> Relation {
    Relation::new(vec![
        col("NAME", ColumnType::Varchar).with_length(100),
        col("TYPE", ColumnType::Integer),
        col("ID", ColumnType::Long),
        col("TABLE_ID", ColumnType::Long),
        col("DATABASE_ID", ColumnType::Integer),
    ])
}

pub fn sys_users(users: &BTreeMap<String, String>) -> Relation {
    let mut rel = Relation::new(vec![
        col("NAME", ColumnType::Varchar).with_length(100),
        col("USER_ID", ColumnType::Integer),
    ]);
    for (i, name) in users.keys().enumerate() {
        let id = if name == "SYS" {
            SYS_USER_ID
        } else {
            SYS_USER_ID + 1 + i as i64
        };
        rel.rows
            .push(vec![Value::String(name.clone()), Value::Int32(id as i32)]);
    }
    rel
}

/// `V$<TAG>_STAT` for a tag table.
pub fn tag_stat_view(table: &Table) -> Relation {
    let mut rel = Relation::new(vec![
        col("NAME", ColumnType::Varchar).with_length(100),
        col("ROW_COUNT", ColumnType::Long),
        col("MIN_TIME", ColumnType::Datetime),
        col("MAX_TIME", ColumnType::Datetime),
        col("RECENT_ROW_TIME", ColumnType::Datetime),
    ]);
    for (name, stat) in &table.tag_stats {
        rel.rows.push(vec![
            Value::String(name.clone()),
            Value::Int64(stat.row_count),
            Value::Datetime(stat.min_time),
            Value::Datetime(stat.max_time),
            Value::Datetime(stat.recent_row_time),
        ]);
    }
    rel
}

// ---------------------------------------------------------------------------
// Coercion & comparison
// ---------------------------------------------------------------------------

fn type_error(v: &Value, to: DataType) -> StrataError {
    StrataError::engine(
        -20,
        format!("cannot convert {} '{}' to {}", v.type_name(), v, to),
    )
}

pub fn parse_datetime_text(s: &str) -> Option<i64> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(datetime_to_nanos(ts.with_timezone(&Utc)));
    }
    for layout in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, layout) {
            return Some(datetime_to_nanos(naive.and_utc()));
        }
    }
    None
}

/// Convert `v` to the storage representation of `to`.
pub fn coerce(v: Value, to: DataType) -> StrataResult<Value> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let out = match to {
        DataType::Int16 => match v.as_i64() {
            Some(n) => Value::Int16(n as i16),
            None => match &v {
                Value::Float32(_) | Value::Float64(_) => {
                    Value::Int16(v.as_f64().unwrap_or_default() as i16)
                }
                _ => return Err(type_error(&v, to)),
            },
        },
        DataType::Int32 => match v.as_i64() {
            Some(n) => Value::Int32(n as i32),
            None => match &v {
                Value::Float32(_) | Value::Float64(_) => {
                    Value::Int32(v.as_f64().unwrap_or_default() as i32)
                }
                _ => return Err(type_error(&v, to)),
            },
        },
        DataType::Int64 => match v.as_i64() {
            Some(n) => Value::Int64(n),
            None => match &v {
                Value::Float32(_) | Value::Float64(_) => {
                    Value::Int64(v.as_f64().unwrap_or_default() as i64)
                }
                _ => return Err(type_error(&v, to)),
            },
        },
        DataType::Datetime => match &v {
            Value::String(s) => match parse_datetime_text(s) {
                Some(ns) => Value::Datetime(ns),
                None => return Err(type_error(&v, to)),
            },
            other => match other.as_i64() {
                Some(ns) => Value::Datetime(ns),
                None => return Err(type_error(&v, to)),
            },
        },
        DataType::Float32 => match v.as_f64() {
            Some(f) => Value::Float32(f as f32),
            None => return Err(type_error(&v, to)),
        },
        DataType::Float64 => match v.as_f64() {
            Some(f) => Value::Float64(f),
            None => return Err(type_error(&v, to)),
        },
        DataType::Ipv4 => match v {
            Value::Ipv4(ip) => Value::Ipv4(ip),
            Value::String(ref s) => match s.parse::<Ipv4Addr>() {
                Ok(ip) => Value::Ipv4(ip),
                Err(_) => return Err(type_error(&v, to)),
            },
            other => return Err(type_error(&other, to)),
        },
        DataType::Ipv6 => match v {
            Value::Ipv6(ip) => Value::Ipv6(ip),
            Value::Ipv4(ip) => Value::Ipv6(ip.to_ipv6_mapped()),
            Value::String(ref s) => match s.parse::<Ipv6Addr>() {
                Ok(ip) => Value::Ipv6(ip),
                Err(_) => return Err(type_error(&v, to)),
            },
            other => return Err(type_error(&other, to)),
        },
        DataType::String => match v {
            Value::String(_) => v,
            Value::Binary(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
            other => Value::String(other.to_string()),
        },
        DataType::Binary => match v {
            Value::Binary(_) => v,
            Value::String(s) => Value::Binary(s.into_bytes()),
            _ => return Err(type_error(&v, to)),
        },
    };
    Ok(out)
}

/// Compare a stored value with a filter operand, coercing the operand to the stored type.
pub fn compare(stored: &Value, operand: &Value) -> Option<Ordering> {
    if stored.is_null() || operand.is_null() {
        return None;
    }
    let operand = match stored.data_type() {
        Some(dt) => coerce(operand.clone(), dt).ok()?,
        None => return None,
    };
    match (stored, &operand) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Binary(a), Value::Binary(b)) => Some(a.cmp(b)),
        (Value::Ipv4(a), Value::Ipv4(b)) => Some(a.cmp(b)),
        (Value::Ipv6(a), Value::Ipv6(b)) => Some(a.cmp(b)),
        (Value::Float32(_), _) | (Value::Float64(_), _) => {
            stored.as_f64()?.partial_cmp(&operand.as_f64()?)
        }
        _ => Some(stored.as_i64()?.cmp(&operand.as_i64()?)),
    }
}
