//! Copy-with-coercion between engine column data and Rust values.
//!
//! Reading goes engine → [`Value`] ([`read_row`]) → caller type
//! ([`FromValue`] / [`FromRow`]). Writing goes [`Value`] → engine bind call
//! ([`bind_params`]).
//!
//! Rules:
//! - `i16::MIN`, `i32::MIN` and `i64::MIN` coming from the engine are NULL.
//! - NULL scanned into a non-`Option` destination fails with `ScanNull`.
//! - Integer widening and narrowing always succeed (wrapping).
//! - Datetime scans to a string as RFC3339 UTC; IPs as their canonical form.
//! - Bytes and strings convert both ways.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use strata_common::value::{format_rfc3339, nanos_to_datetime};
use strata_common::{Column, DataType, StrataError, StrataResult, Value};
use strata_engine::{Engine, StmtHandle};

// ── engine → Value ──────────────────────────────────────────────────────────

/// Read the current row of `stmt` according to `columns`.
pub fn read_row(
    engine: &dyn Engine,
    stmt: StmtHandle,
    columns: &[Column],
) -> StrataResult<Vec<Value>> {
    let mut out = Vec::with_capacity(columns.len());
    for (idx, col) in columns.iter().enumerate() {
        let v = match col.data_type {
            DataType::Int16 => match engine.column_data_int16(stmt, idx)? {
                (v, true) if v != i16::MIN => Value::Int16(v),
                _ => Value::Null,
            },
            DataType::Int32 => match engine.column_data_int32(stmt, idx)? {
                (v, true) if v != i32::MIN => Value::Int32(v),
                _ => Value::Null,
            },
            DataType::Int64 => match engine.column_data_int64(stmt, idx)? {
                (v, true) if v != i64::MIN => Value::Int64(v),
                _ => Value::Null,
            },
            DataType::Datetime => match engine.column_data_datetime(stmt, idx)? {
                (v, true) => Value::Datetime(v),
                _ => Value::Null,
            },
            DataType::Float32 => match engine.column_data_float32(stmt, idx)? {
                (v, true) => Value::Float32(v),
                _ => Value::Null,
            },
            DataType::Float64 => match engine.column_data_float64(stmt, idx)? {
                (v, true) => Value::Float64(v),
                _ => Value::Null,
            },
            DataType::Ipv4 => match engine.column_data_ipv4(stmt, idx)? {
                (v, true) => Value::Ipv4(v),
                _ => Value::Null,
            },
            DataType::Ipv6 => match engine.column_data_ipv6(stmt, idx)? {
                (v, true) => Value::Ipv6(v),
                _ => Value::Null,
            },
            DataType::String => match engine.column_data_string(stmt, idx)? {
                (v, true) => Value::String(v),
                _ => Value::Null,
            },
            DataType::Binary => match engine.column_data_binary(stmt, idx)? {
                (v, true) => Value::Binary(v),
                _ => Value::Null,
            },
        };
        out.push(v);
    }
    Ok(out)
}

// ── Value → engine ──────────────────────────────────────────────────────────

/// Bind `params` in order, one engine call per parameter.
pub fn bind_params(engine: &dyn Engine, stmt: StmtHandle, params: &[Value]) -> StrataResult<()> {
    for (idx, p) in params.iter().enumerate() {
        let type_name = p.type_name();
        let wrap = |e: StrataError| StrataError::BindType {
            idx,
            type_name,
            cause: e.to_string(),
        };
        match p {
            Value::Null => engine
                .bind_null(stmt, idx)
                .map_err(|e| StrataError::BindNull {
                    idx,
                    cause: e.to_string(),
                })?,
            Value::Int16(v) => engine.bind_int32(stmt, idx, *v as i32).map_err(wrap)?,
            Value::Int32(v) => engine.bind_int32(stmt, idx, *v).map_err(wrap)?,
            Value::Int64(v) | Value::Datetime(v) => {
                engine.bind_int64(stmt, idx, *v).map_err(wrap)?
            }
            Value::Float32(v) => engine.bind_float64(stmt, idx, *v as f64).map_err(wrap)?,
            Value::Float64(v) => engine.bind_float64(stmt, idx, *v).map_err(wrap)?,
            Value::Ipv4(v) => engine.bind_string(stmt, idx, &v.to_string()).map_err(wrap)?,
            Value::Ipv6(v) => engine.bind_string(stmt, idx, &v.to_string()).map_err(wrap)?,
            Value::String(s) => {
                if s.contains('\0') {
                    return Err(StrataError::BindWrong {
                        idx,
                        reason: "string contains a NUL byte".to_string(),
                    });
                }
                engine.bind_string(stmt, idx, s).map_err(wrap)?
            }
            Value::Binary(b) => engine.bind_binary(stmt, idx, b).map_err(wrap)?,
        }
    }
    Ok(())
}

// ── Value → Rust ────────────────────────────────────────────────────────────

/// A destination a column value can be scanned into.
pub trait FromValue: Sized {
    /// Destination name used in `ScanType` errors.
    const TYPE_NAME: &'static str;

    fn from_value(v: &Value, idx: usize) -> StrataResult<Self>;
}

fn unsupported<T: FromValue>(v: &Value) -> StrataError {
    StrataError::ScanType {
        from: v.type_name().to_string(),
        to: T::TYPE_NAME.to_string(),
    }
}

macro_rules! impl_from_value_int {
    ($($t:ty),*) => {$(
        impl FromValue for $t {
            const TYPE_NAME: &'static str = stringify!($t);

            fn from_value(v: &Value, idx: usize) -> StrataResult<Self> {
                match v {
                    Value::Null => Err(StrataError::ScanNull { idx }),
                    Value::Int16(n) => Ok(*n as $t),
                    Value::Int32(n) => Ok(*n as $t),
                    Value::Int64(n) | Value::Datetime(n) => Ok(*n as $t),
                    other => Err(unsupported::<$t>(other)),
                }
            }
        }
    )*};
}

impl_from_value_int!(i8, i16, i32, i64, u8, u16, u32, u64, isize, usize);

macro_rules! impl_from_value_float {
    ($($t:ty),*) => {$(
        impl FromValue for $t {
            const TYPE_NAME: &'static str = stringify!($t);

            fn from_value(v: &Value, idx: usize) -> StrataResult<Self> {
                match v {
                    Value::Null => Err(StrataError::ScanNull { idx }),
                    Value::Float32(f) => Ok(*f as $t),
                    Value::Float64(f) => Ok(*f as $t),
                    Value::Int16(n) => Ok(*n as $t),
                    Value::Int32(n) => Ok(*n as $t),
                    Value::Int64(n) => Ok(*n as $t),
                    other => Err(unsupported::<$t>(other)),
                }
            }
        }
    )*};
}

impl_from_value_float!(f32, f64);

impl FromValue for String {
    const TYPE_NAME: &'static str = "string";

    fn from_value(v: &Value, idx: usize) -> StrataResult<Self> {
        match v {
            Value::Null => Err(StrataError::ScanNull { idx }),
            Value::String(s) => Ok(s.clone()),
            Value::Datetime(ns) => Ok(format_rfc3339(*ns)),
            Value::Binary(b) => Ok(String::from_utf8_lossy(b).into_owned()),
            other => Ok(other.to_string()),
        }
    }
}

impl FromValue for Vec<u8> {
    const TYPE_NAME: &'static str = "bytes";

    fn from_value(v: &Value, idx: usize) -> StrataResult<Self> {
        match v {
            Value::Null => Err(StrataError::ScanNull { idx }),
            Value::Binary(b) => Ok(b.clone()),
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            other => Err(unsupported::<Vec<u8>>(other)),
        }
    }
}

impl FromValue for DateTime<Utc> {
    const TYPE_NAME: &'static str = "datetime";

    fn from_value(v: &Value, idx: usize) -> StrataResult<Self> {
        match v {
            Value::Null => Err(StrataError::ScanNull { idx }),
            Value::Datetime(ns) | Value::Int64(ns) => Ok(nanos_to_datetime(*ns)),
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| unsupported::<DateTime<Utc>>(v)),
            other => Err(unsupported::<DateTime<Utc>>(other)),
        }
    }
}

impl FromValue for Ipv4Addr {
    const TYPE_NAME: &'static str = "ipv4";

    fn from_value(v: &Value, idx: usize) -> StrataResult<Self> {
        match v {
            Value::Null => Err(StrataError::ScanNull { idx }),
            Value::Ipv4(ip) => Ok(*ip),
            Value::String(s) => s.parse().map_err(|_| unsupported::<Ipv4Addr>(v)),
            other => Err(unsupported::<Ipv4Addr>(other)),
        }
    }
}

impl FromValue for Ipv6Addr {
    const TYPE_NAME: &'static str = "ipv6";

    fn from_value(v: &Value, idx: usize) -> StrataResult<Self> {
        match v {
            Value::Null => Err(StrataError::ScanNull { idx }),
            Value::Ipv6(ip) => Ok(*ip),
            Value::Ipv4(ip) => Ok(ip.to_ipv6_mapped()),
            Value::String(s) => s.parse().map_err(|_| unsupported::<Ipv6Addr>(v)),
            other => Err(unsupported::<Ipv6Addr>(other)),
        }
    }
}

impl FromValue for IpAddr {
    const TYPE_NAME: &'static str = "ip";

    fn from_value(v: &Value, idx: usize) -> StrataResult<Self> {
        match v {
            Value::Null => Err(StrataError::ScanNull { idx }),
            Value::Ipv4(ip) => Ok(IpAddr::V4(*ip)),
            Value::Ipv6(ip) => Ok(IpAddr::V6(*ip)),
            Value::String(s) => s.parse().map_err(|_| unsupported::<IpAddr>(v)),
            other => Err(unsupported::<IpAddr>(other)),
        }
    }
}

impl FromValue for Value {
    const TYPE_NAME: &'static str = "value";

    fn from_value(v: &Value, _idx: usize) -> StrataResult<Self> {
        Ok(v.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    const TYPE_NAME: &'static str = T::TYPE_NAME;

    fn from_value(v: &Value, idx: usize) -> StrataResult<Self> {
        match v {
            Value::Null => Ok(None),
            other => T::from_value(other, idx).map(Some),
        }
    }
}

/// Scan the value at `idx`, checking it is within the row.
pub fn scan_index<T: FromValue>(values: &[Value], idx: usize) -> StrataResult<T> {
    let v = values.get(idx).ok_or(StrataError::ScanIndex {
        idx,
        count: values.len(),
    })?;
    T::from_value(v, idx)
}

/// A whole row scanned positionally into a tuple.
pub trait FromRow: Sized {
    fn from_row(values: &[Value]) -> StrataResult<Self>;
}

macro_rules! impl_from_row {
    ($($idx:tt $t:ident),+) => {
        impl<$($t: FromValue),+> FromRow for ($($t,)+) {
            fn from_row(values: &[Value]) -> StrataResult<Self> {
                Ok(($(scan_index::<$t>(values, $idx)?,)+))
            }
        }
    };
}

impl_from_row!(0 A);
impl_from_row!(0 A, 1 B);
impl_from_row!(0 A, 1 B, 2 C);
impl_from_row!(0 A, 1 B, 2 C, 3 D);
impl_from_row!(0 A, 1 B, 2 C, 3 D, 4 E);
impl_from_row!(0 A, 1 B, 2 C, 3 D, 4 E, 5 F);
impl_from_row!(0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G);
impl_from_row!(0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G, 7 H);

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_null_scans_fail_with_scan_null() {
        let err = i64::from_value(&Value::Null, 2).unwrap_err();
        assert!(err.is_scan_null());
        assert_eq!(Option::<i64>::from_value(&Value::Null, 2).unwrap(), None);
    }

    #[test]
    fn test_integer_narrowing_wraps() {
        assert_eq!(i16::from_value(&Value::Int64(70_000), 0).unwrap(), 70_000i64 as i16);
        assert_eq!(i64::from_value(&Value::Int16(-3), 0).unwrap(), -3);
    }

    #[test]
    fn test_datetime_to_string_is_rfc3339_utc() {
        let ts = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let v = Value::datetime(ts);
        let s = String::from_value(&v, 0).unwrap();
        assert!(s.starts_with("2021-01-01T00:00:00"));
        assert_eq!(DateTime::<Utc>::from_value(&v, 0).unwrap(), ts);
    }

    #[test]
    fn test_ip_and_string_conversions() {
        let v = Value::Ipv4(Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(String::from_value(&v, 0).unwrap(), "192.168.0.1");
        let parsed = Ipv4Addr::from_value(&Value::String("10.0.0.1".into()), 0).unwrap();
        assert_eq!(parsed, Ipv4Addr::new(10, 0, 0, 1));
        let v6 = Ipv6Addr::from_value(&Value::String("::1".into()), 0).unwrap();
        assert_eq!(v6, Ipv6Addr::LOCALHOST);
    }

    #[test]
    fn test_bytes_and_string_are_lossless() {
        let b = Vec::<u8>::from_value(&Value::String("abc".into()), 0).unwrap();
        assert_eq!(b, b"abc".to_vec());
        let s = String::from_value(&Value::Binary(b), 0).unwrap();
        assert_eq!(s, "abc");
    }

    #[test]
    fn test_unsupported_conversion_names_both_sides() {
        let err = Ipv4Addr::from_value(&Value::Float64(1.0), 0).unwrap_err();
        assert_eq!(err.to_string(), "scan convert from double to ipv4 not supported");
    }

    #[test]
    fn test_from_row_checks_index() {
        let row = vec![Value::String("a".into()), Value::Int32(1)];
        let (name, n): (String, i32) = FromRow::from_row(&row).unwrap();
        assert_eq!((name.as_str(), n), ("a", 1));
        let err = <(String, i32, f64)>::from_row(&row).unwrap_err();
        assert!(matches!(err, StrataError::ScanIndex { idx: 2, count: 2 }));
    }
}
