//! Shared building blocks of the strata access layer: errors, configuration,
//! logical types and values, table names, cancellation and panic isolation.

pub mod config;
pub mod context;
pub mod crash_domain;
pub mod error;
pub mod shutdown;
pub mod table_name;
pub mod timefmt;
pub mod types;
pub mod value;

pub use context::Context;
pub use error::{ErrorKind, StrataError, StrataResult};
pub use table_name::TableName;
pub use types::{Column, ColumnFlag, ColumnType, Columns, DataType, TableFlag, TableType};
pub use value::Value;
