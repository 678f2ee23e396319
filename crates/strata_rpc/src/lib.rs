//! Remote access surface: sessions keyed by opaque handles, detained
//! cursors and appenders, and a streaming append.

pub mod auth;
pub mod inflight;
pub mod message;
pub mod server;

pub use auth::{AuthProvider, DefaultAuthProvider, OTP_PREFIX};
pub use inflight::{InflightInfo, InflightKind, InflightRegistry};
pub use message::{
    AppendDone, AppendMessage, AppenderBody, ColumnsBody, ConnBody, ExecBody, ExplainBody,
    FetchBody, PingBody, QueryBody, QueryRowBody, Reply,
};
pub use server::RpcServer;
