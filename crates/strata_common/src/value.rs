//! Typed values exchanged with the engine: bind parameters, fetched cells
//! and append tuples all use [`Value`].

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::types::DataType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int16(i16),
    Int32(i32),
    Int64(i64),
    /// Nanoseconds since the Unix epoch, UTC.
    Datetime(i64),
    Float32(f32),
    Float64(f64),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    String(String),
    Binary(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int16(_) => "int16",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Datetime(_) => "datetime",
            Value::Float32(_) => "float",
            Value::Float64(_) => "double",
            Value::Ipv4(_) => "ipv4",
            Value::Ipv6(_) => "ipv6",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
        }
    }

    pub fn data_type(&self) -> Option<DataType> {
        let ret = match self {
            Value::Null => return None,
            Value::Int16(_) => DataType::Int16,
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::Datetime(_) => DataType::Datetime,
            Value::Float32(_) => DataType::Float32,
            Value::Float64(_) => DataType::Float64,
            Value::Ipv4(_) => DataType::Ipv4,
            Value::Ipv6(_) => DataType::Ipv6,
            Value::String(_) => DataType::String,
            Value::Binary(_) => DataType::Binary,
        };
        Some(ret)
    }

    pub fn datetime(ts: DateTime<Utc>) -> Value {
        Value::Datetime(datetime_to_nanos(ts))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int16(v) => Some(*v as i64),
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) | Value::Datetime(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float32(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Datetime(ns) => Some(nanos_to_datetime(*ns)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Datetime(ns) => f.write_str(&format_rfc3339(*ns)),
            Value::Float32(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Ipv4(ip) => write!(f, "{}", ip),
            Value::Ipv6(ip) => write!(f, "{}", ip),
            Value::String(s) => f.write_str(s),
            Value::Binary(b) => {
                for byte in b {
                    write!(f, "{:02X}", byte)?;
                }
                Ok(())
            }
        }
    }
}

macro_rules! impl_from {
    ($t:ty, $variant:ident) => {
        impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(v)
            }
        }
    };
}

impl_from!(i16, Int16);
impl_from!(i32, Int32);
impl_from!(i64, Int64);
impl_from!(f32, Float32);
impl_from!(f64, Float64);
impl_from!(Ipv4Addr, Ipv4);
impl_from!(Ipv6Addr, Ipv6);
impl_from!(String, String);
impl_from!(Vec<u8>, Binary);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Binary(v.to_vec())
    }
}

impl From<IpAddr> for Value {
    fn from(v: IpAddr) -> Self {
        match v {
            IpAddr::V4(ip) => Value::Ipv4(ip),
            IpAddr::V6(ip) => Value::Ipv6(ip),
        }
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::datetime(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

// ── datetime helpers ─────────────────────────────────────────────────────────

pub fn datetime_to_nanos(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt()
        .unwrap_or_else(|| ts.timestamp().saturating_mul(1_000_000_000))
}

pub fn nanos_to_datetime(ns: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(ns)
}

pub fn now_nanos() -> i64 {
    datetime_to_nanos(Utc::now())
}

/// RFC3339 rendering in UTC with nanosecond precision when needed.
pub fn format_rfc3339(ns: i64) -> String {
    nanos_to_datetime(ns).to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_conversions() {
        assert_eq!(Value::from(7i32), Value::Int32(7));
        assert_eq!(Value::from("x"), Value::String("x".into()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(Value::from(ip), Value::Ipv4(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_datetime_nanos_round_trip() {
        let ts = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let v = Value::from(ts);
        assert_eq!(v, Value::Datetime(1_609_459_200_000_000_000));
        assert_eq!(v.as_datetime(), Some(ts));
        assert_eq!(v.to_string(), "2021-01-01T00:00:00Z");
    }

    #[test]
    fn test_numeric_accessors() {
        assert_eq!(Value::Int16(-3).as_i64(), Some(-3));
        assert_eq!(Value::Float32(1.5).as_f64(), Some(1.5));
        assert_eq!(Value::String("a".into()).as_i64(), None);
        assert_eq!(Value::Binary(vec![0xAB, 0x01]).to_string(), "AB01");
    }
}
