//! Request and response shapes of the RPC surface.
//!
//! Every response is a [`Reply`]: success flag, reason text, the time the
//! server spent on the call, and a method specific body on success.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_common::{Column, StrataError, TableType, Value};

#[derive(Debug, Clone, Serialize)]
pub struct Reply<T> {
    pub success: bool,
    pub reason: String,
    pub elapse: Duration,
    pub body: Option<T>,
}

impl<T> Reply<T> {
    pub fn ok(body: T, reason: impl Into<String>, elapse: Duration) -> Self {
        Self {
            success: true,
            reason: reason.into(),
            elapse,
            body: Some(body),
        }
    }

    pub fn fail(err: &StrataError, elapse: Duration) -> Self {
        Self {
            success: false,
            reason: err.to_string(),
            elapse,
            body: None,
        }
    }

    /// Elapse rendered for humans, e.g. `"1.204ms"`.
    pub fn elapse_text(&self) -> String {
        format!("{:?}", self.elapse)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PingBody {
    pub token: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnBody {
    pub handle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecBody {
    pub rows_affected: u64,
}

/// `rows_handle` is set for fetchable statements; otherwise the affected
/// count is reported inline and no cursor is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryBody {
    pub rows_handle: Option<String>,
    pub rows_affected: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRowBody {
    pub columns: Vec<Column>,
    pub values: Vec<Value>,
    pub rows_affected: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnsBody {
    pub columns: Vec<Column>,
}

/// One row per fetch. End of data is `has_no_rows`, not a failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchBody {
    pub values: Vec<Value>,
    pub has_no_rows: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppenderBody {
    pub handle: String,
    pub table_name: String,
    pub table_type: TableType,
    pub columns: Vec<Column>,
}

/// Inbound message of the append stream. The first one names the appender;
/// later ones must repeat the same handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendMessage {
    pub handle: String,
    #[serde(default)]
    pub records: Vec<Vec<Value>>,
}

impl AppendMessage {
    pub fn new(handle: impl Into<String>, records: Vec<Vec<Value>>) -> Self {
        Self {
            handle: handle.into(),
            records,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AppendDone {
    pub success_count: u64,
    pub fail_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExplainBody {
    pub plan: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_fail_carries_reason() {
        let r: Reply<ExecBody> = Reply::fail(&StrataError::InvalidHandle, Duration::from_millis(3));
        assert!(!r.success);
        assert_eq!(r.reason, "invalid connection handle");
        assert!(r.body.is_none());
        assert_eq!(r.elapse_text(), "3ms");
    }

    #[test]
    fn test_reply_serializes() {
        let r = Reply::ok(ExecBody { rows_affected: 2 }, "success", Duration::ZERO);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["body"]["rows_affected"], 2);
    }
}
