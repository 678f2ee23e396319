//! Datetime rendering shared by the watcher and the shell sinks.

use chrono::{DateTime, FixedOffset, Local, SecondsFormat, Utc};

use crate::error::{StrataError, StrataResult};
use crate::value::{nanos_to_datetime, Value};

/// Where datetimes are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeLocation {
    Utc,
    Local,
    Fixed(FixedOffset),
}

impl TimeLocation {
    /// `UTC`, `Local` or an offset like `+09:00` / `-0500`.
    pub fn parse(name: &str) -> StrataResult<TimeLocation> {
        let trimmed = name.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" | "utc" | "gmt" | "z" => return Ok(TimeLocation::Utc),
            "local" => return Ok(TimeLocation::Local),
            _ => {}
        }
        parse_offset(trimmed)
            .map(TimeLocation::Fixed)
            .ok_or_else(|| StrataError::InvalidArgument(format!("unknown time zone '{}'", name)))
    }

    pub fn name(&self) -> String {
        match self {
            TimeLocation::Utc => "UTC".to_string(),
            TimeLocation::Local => "Local".to_string(),
            TimeLocation::Fixed(off) => off.to_string(),
        }
    }
}

impl Default for TimeLocation {
    fn default() -> Self {
        TimeLocation::Utc
    }
}

fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Render nanoseconds-since-epoch per `format`.
///
/// Epoch formats (`ns`, `us`, `ms`, `s`) produce integers, everything else a
/// string: `rfc3339`, `default` (`%Y-%m-%d %H:%M:%S%.3f`) or a strftime pattern.
pub fn format_datetime(ns: i64, format: &str, tz: &TimeLocation) -> Value {
    match format {
        "" | "ns" => Value::Int64(ns),
        "us" => Value::Int64(ns / 1_000),
        "ms" => Value::Int64(ns / 1_000_000),
        "s" => Value::Int64(ns / 1_000_000_000),
        _ => Value::String(format_with_layout(nanos_to_datetime(ns), format, tz)),
    }
}

fn format_with_layout(ts: DateTime<Utc>, format: &str, tz: &TimeLocation) -> String {
    let layout = match format {
        "default" => "%Y-%m-%d %H:%M:%S%.3f",
        "rfc3339" | "RFC3339" => {
            return match tz {
                TimeLocation::Utc => ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                TimeLocation::Local => ts
                    .with_timezone(&Local)
                    .to_rfc3339_opts(SecondsFormat::AutoSi, false),
                TimeLocation::Fixed(off) => ts
                    .with_timezone(off)
                    .to_rfc3339_opts(SecondsFormat::AutoSi, false),
            }
        }
        other => other,
    };
    match tz {
        TimeLocation::Utc => ts.format(layout).to_string(),
        TimeLocation::Local => ts.with_timezone(&Local).format(layout).to_string(),
        TimeLocation::Fixed(off) => ts.with_timezone(off).format(layout).to_string(),
    }
}
