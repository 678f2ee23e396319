use thiserror::Error;

/// Convenience alias for `Result<T, StrataError>`.
pub type StrataResult<T> = Result<T, StrataError>;

/// Error classification for callers deciding whether to surface, retry or ignore.
///
/// - `UserError`: bad input, bad SQL, auth failure, post-close misuse
/// - `Transient`: admission timeout, cancellation; caller MAY retry
/// - `Sentinel`: expected "empty result" signal (`NoRows`), never a true error
/// - `Engine`: failure reported by the native engine
/// - `Internal`: should never happen; captured panics land here
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Transient,
    Sentinel,
    Engine,
    Internal,
}

/// Top-level error type of the access layer.
///
/// `Clone` so a cursor or row can keep its terminal error and hand it out
/// more than once; IO failures are carried as text for the same reason.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StrataError {
    #[error("database is not initialized")]
    NotInitialized,

    #[error("unauthorized, {0}")]
    Unauthorized(String),

    #[error("connection not found")]
    ConnectionNotFound,

    #[error("connection is invalid")]
    ConnectionInvalid,

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("connect canceled")]
    ConnectCanceled,

    #[error("canceled")]
    Canceled,

    #[error("bind null error at {idx}, {cause}")]
    BindNull { idx: usize, cause: String },

    #[error("bind error at {idx}, type {type_name}, {cause}")]
    BindType {
        idx: usize,
        type_name: &'static str,
        cause: String,
    },

    #[error("bind unknown type at {idx}, type {type_name}")]
    BindUnknown { idx: usize, type_name: String },

    #[error("bind wrong at {idx}, {reason}")]
    BindWrong { idx: usize, reason: String },

    #[error("scan null at column {idx}")]
    ScanNull { idx: usize },

    #[error("scan convert from {from} to {to} not supported")]
    ScanType { from: String, to: String },

    #[error("scan index {idx} out of range, {count} columns")]
    ScanIndex { idx: usize, count: usize },

    #[error("scan unsupported column type {0}")]
    ScanUnsupportedType(String),

    #[error("unsupported column type {0}")]
    UnsupportedColumnType(i32),

    #[error("fetch error, {0}")]
    Fetch(String),

    #[error("no columns")]
    NoColumns,

    #[error("value count {got}, table '{table}' requires {expected} columns to append")]
    LengthOfColumns {
        table: String,
        expected: usize,
        got: usize,
    },

    #[error("closed appender")]
    ClosedAppender,

    #[error("no connection")]
    NoConnection,

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("sql: no rows in result set")]
    NoRows,

    #[error("invalid connection handle")]
    InvalidHandle,

    #[error("handle '{0}' not found")]
    HandleNotFound(String),

    #[error("handle '{0}' is not valid")]
    HandleNotValid(String),

    #[error("{0}")]
    NotAllowed(String),

    #[error("command not found")]
    CommandNotFound,

    #[error("invalid argument, {0}")]
    InvalidArgument(String),

    #[error("engine error ({code}): {message}")]
    Engine { code: i32, message: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for StrataError {
    fn from(e: std::io::Error) -> Self {
        StrataError::Io(e.to_string())
    }
}

// ── classification & helpers ─────────────────────────────────────────────────

impl StrataError {
    /// Shorthand for an engine-reported failure.
    pub fn engine(code: i32, message: impl Into<String>) -> Self {
        StrataError::Engine {
            code,
            message: message.into(),
        }
    }

    pub fn not_allowed(message: impl Into<String>) -> Self {
        StrataError::NotAllowed(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StrataError::NoRows => ErrorKind::Sentinel,
            StrataError::ConnectTimeout
            | StrataError::ConnectCanceled
            | StrataError::Canceled
            | StrataError::Io(_) => ErrorKind::Transient,
            StrataError::Engine { .. } | StrataError::Fetch(_) => ErrorKind::Engine,
            StrataError::Internal(_) => ErrorKind::Internal,
            _ => ErrorKind::UserError,
        }
    }

    /// True for the "empty result" sentinel of `QueryRow`.
    pub fn is_no_rows(&self) -> bool {
        matches!(self, StrataError::NoRows)
    }

    /// True when a scanned value was NULL; callers may substitute a zero value.
    pub fn is_scan_null(&self) -> bool {
        matches!(self, StrataError::ScanNull { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_rows_is_sentinel() {
        let e = StrataError::NoRows;
        assert_eq!(e.kind(), ErrorKind::Sentinel);
        assert!(e.is_no_rows());
        assert!(!e.is_transient());
    }

    #[test]
    fn test_admission_errors_are_transient() {
        assert!(StrataError::ConnectTimeout.is_transient());
        assert!(StrataError::ConnectCanceled.is_transient());
        assert_eq!(StrataError::ConnectTimeout.to_string(), "connect timeout");
        assert_eq!(StrataError::ConnectCanceled.to_string(), "connect canceled");
    }

    #[test]
    fn test_lifecycle_messages() {
        assert_eq!(StrataError::ClosedAppender.to_string(), "closed appender");
        assert_eq!(StrataError::NoConnection.to_string(), "no connection");
        assert_eq!(StrataError::CommandNotFound.to_string(), "command not found");
        assert_eq!(
            StrataError::ConnectionNotFound.to_string(),
            "connection not found"
        );
    }

    #[test]
    fn test_scan_type_message_names_both_sides() {
        let e = StrataError::ScanType {
            from: "int64".into(),
            to: "bool".into(),
        };
        assert_eq!(e.to_string(), "scan convert from int64 to bool not supported");
        assert_eq!(e.kind(), ErrorKind::UserError);
    }

    #[test]
    fn test_engine_error_kind() {
        let e = StrataError::engine(-1, "lock already initialized");
        assert_eq!(e.kind(), ErrorKind::Engine);
        assert!(e.to_string().contains("lock already initialized"));
    }
}
