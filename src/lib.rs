//! # sqlx-named-rows
//!
//! Named-parameter statements, typed row projection and bounded-parallel row
//! processing for blocking, cursor-based database access, with a SQLx MySQL driver.
//!
//! ## Features
//!
//! - **Named Placeholders**: Write `:param_name` instead of `?`; a name may appear several times
//! - **Typed Binding**: A closed [`Value`] enum maps to driver parameters in a fixed, tested order
//! - **Column Tokens**: `amount:long`, `born:date:%d/%m/%Y` and friends describe how to pull and coerce a field
//! - **Guaranteed Cleanup**: Cursors, statements and connections close exactly once, in reverse order
//! - **Parallel Rows**: One reader thread feeds a bounded worker pool; failures are collected per row
//! - **Cooperative Cancellation**: A [`CancellationToken`](tokio_util::sync::CancellationToken) stops reading and submission
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! sqlx-named-rows = "0.2"
//! ```
//!
//! ## Examples
//!
//! ### Scalar and List Queries
//!
//! ```rust
//! use sqlx_named_rows::memory::MemoryProvider;
//! use sqlx_named_rows::{Database, Params, Value};
//!
//! let provider = MemoryProvider::new();
//! provider.on_query(
//!     "select name from users where team = ? or lead = ?",
//!     &["name"],
//!     vec![vec![Value::from("ann")], vec![Value::from("bob")]],
//! );
//!
//! let db = Database::new(provider.clone());
//! let names = db.values(
//!     "select name from users where team = :team or lead = :team",
//!     Params::new().bind("team", "core"),
//! )?;
//! assert_eq!(names, vec![Value::from("ann"), Value::from("bob")]);
//! # Ok::<(), sqlx_named_rows::Error>(())
//! ```
//!
//! ### Typed Projection
//!
//! ```rust
//! use sqlx_named_rows::memory::MemoryProvider;
//! use sqlx_named_rows::{ColumnConfig, Database, Params, Projection, Value};
//!
//! let provider = MemoryProvider::new();
//! provider.on_query(
//!     "select amount, note from orders where id = ?",
//!     &["amount", "note"],
//!     vec![vec![Value::from("42"), Value::Null]],
//! );
//!
//! let projection = Projection::from_configs(vec![
//!     ColumnConfig::new("amount:long")?,
//!     ColumnConfig::new("note")?.with_fallback("amount")?.with_field("remark"),
//! ]);
//! let db = Database::new(provider);
//! let rows = db.rows(
//!     "select amount, note from orders where id = :id",
//!     Params::new().bind("id", 7),
//!     projection,
//! )?;
//! assert_eq!(rows[0].get("amount"), Some(&Value::Long(42)));
//! assert_eq!(rows[0].get("remark"), Some(&Value::from("42")));
//! # Ok::<(), sqlx_named_rows::Error>(())
//! ```
//!
//! ### Parallel Processing
//!
//! ```rust
//! use sqlx_named_rows::memory::MemoryProvider;
//! use sqlx_named_rows::{Database, Params, Projection, Value};
//! use tokio_util::sync::CancellationToken;
//!
//! let provider = MemoryProvider::new();
//! provider.on_query(
//!     "select id from jobs where state = ?",
//!     &["id"],
//!     (1..=20).map(|id| vec![Value::Int(id)]).collect(),
//! );
//!
//! let db = Database::new(provider);
//! let result = db.for_each_parallel(
//!     "select id from jobs where state = :state",
//!     Params::new().bind("state", "new"),
//!     Projection::Raw,
//!     4,
//!     &CancellationToken::new(),
//!     |_ctx, row| match row.get("id") {
//!         Some(Value::Int(id)) if id % 5 == 0 => Err(format!("job {id} failed").into()),
//!         _ => Ok(()),
//!     },
//! )?;
//! assert_eq!(result.completed, 16);
//! assert_eq!(result.failed, 4);
//! # Ok::<(), sqlx_named_rows::Error>(())
//! ```
//!
//! ## How It Works
//!
//! 1. **Translate**: `:name` placeholders become `?`; quoted literals are copied untouched
//! 2. **Bind**: each named value is bound to every position its name occupies
//! 3. **Iterate**: a [`RowIter`] pulls rows, projects them through [`ColumnConfig`]s and runs cleanup once
//! 4. **Dispatch**: optionally, rows are handed to a [`WorkerPool`] and the outcome is a [`WorkResult`]
//!
//! ## Limitations
//!
//! - The bundled network driver supports MySQL only; other databases plug in through [`driver`]
//! - Placeholder names must match `[A-Za-z_][A-Za-z0-9_]*`
//! - Unterminated quotes are not rejected; the rest of the query is copied literally
//!
//! ## License
//!
//! Licensed under either of Apache License, Version 2.0 or MIT license at your option.

pub mod bind;
pub mod builder;
pub mod column;
pub mod database;
pub mod driver;
pub mod error;
pub mod iter;
pub mod memory;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod parallel;
pub mod provider;
pub mod query;
pub mod value;

pub use builder::NamedQuery;
pub use column::{ColumnConfig, ColumnToken, Projection, RenderRegistry, ReportColumn, TypeHint};
pub use database::{Database, QueryOptions};
pub use driver::Row;
pub use error::{BoxError, Error, Result};
pub use iter::{IterState, RowIter};
pub use parallel::{FailureRecord, PoolConfig, TaskContext, WorkResult, WorkerPool};
pub use provider::{ConnectOptions, ConnectionProvider};
pub use query::{NamedStatement, Params};
pub use value::{EntityRef, Value};

/// Convenience re-exports for common use cases
pub mod prelude {
    pub use crate::error::{BoxError, Error, Result};
    pub use crate::{
        ColumnConfig, ConnectOptions, ConnectionProvider, Database, Params, PoolConfig,
        Projection, QueryOptions, Row, Value, WorkResult, WorkerPool,
    };
    #[cfg(feature = "mysql")]
    pub use crate::mysql::MySqlProvider;
}
