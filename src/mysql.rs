//! MySQL connections through SQLx.
//!
//! SQLx is asynchronous while the row engine pulls rows synchronously, so the
//! provider owns a private tokio runtime. Statements run through `block_on`, and a
//! query streams its rows from a task on that runtime into a bounded channel that
//! the cursor drains with a blocking receive. Connection-provider calls must not be
//! made from inside another tokio runtime.
//!
//! ```rust,no_run
//! use sqlx_named_rows::mysql::MySqlProvider;
//! use sqlx_named_rows::provider::ConnectOptions;
//! use sqlx_named_rows::{Database, Params};
//!
//! let options = ConnectOptions::builder()
//!     .url("mysql://localhost/test")
//!     .username("app")
//!     .password("ENC(c2VjcmV0)")
//!     .build()?;
//! let db = Database::new(MySqlProvider::connect(&options)?);
//! let count = db.first_value("SELECT COUNT(*) FROM users WHERE age >= :age", Params::new().bind("age", 18))?;
//! println!("{count}");
//! # Ok::<(), sqlx_named_rows::Error>(())
//! ```

use crate::driver::{Connection, Cursor, Row, Statement};
use crate::error::Error;
use crate::provider::{ConnectOptions, ConnectionProvider};
use crate::value::{SqlParam, SqlType, Value};
use chrono::{NaiveDate, NaiveDateTime};
use futures_util::StreamExt;
use sqlx::mysql::types::MySqlTime;
use sqlx::mysql::{MySql, MySqlArguments, MySqlConnectOptions, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Column as _, Either, Executor as _, MySqlPool, Row as _, Statement as _, TypeInfo as _, ValueRef as _};
use std::str::FromStr;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Rows buffered between the streaming task and the cursor.
const ROW_BUFFER: usize = 64;

type SharedConnection = Arc<Mutex<Option<PoolConnection<MySql>>>>;

/// Hands out pooled MySQL connections.
pub struct MySqlProvider {
    runtime: Arc<Runtime>,
    pool: MySqlPool,
}

impl MySqlProvider {
    /// Builds the runtime and connects a pool of at most
    /// [`ConnectOptions::max_connections`] connections.
    ///
    /// The `database` attribute, when present, selects the default schema.
    pub fn connect(options: &ConnectOptions) -> crate::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("sqlx-named-rows")
            .enable_all()
            .build()
            .map_err(|e| Error::Connection(format!("cannot start runtime: {e}")))?;

        let mut connect = MySqlConnectOptions::from_str(options.url())?;
        if let Some(username) = options.username() {
            connect = connect.username(username);
        }
        if let Some(password) = options.password() {
            connect = connect.password(password);
        }
        if let Some(database) = options.attribute("database") {
            connect = connect.database(database);
        }

        let pool = runtime.block_on(
            MySqlPoolOptions::new()
                .max_connections(options.max_connections())
                .connect_with(connect),
        )?;
        tracing::debug!(max_connections = options.max_connections(), "mysql pool connected");
        Ok(Self {
            runtime: Arc::new(runtime),
            pool,
        })
    }

    /// The underlying SQLx pool, for work the row engine does not cover.
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

impl ConnectionProvider for MySqlProvider {
    type Connection = MySqlConnection;

    fn open(&self) -> crate::Result<MySqlConnection> {
        let conn = self
            .runtime
            .block_on(self.pool.acquire())
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(MySqlConnection {
            runtime: Arc::clone(&self.runtime),
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }
}

/// A pooled connection, handed back to the pool on close or drop.
pub struct MySqlConnection {
    runtime: Arc<Runtime>,
    conn: SharedConnection,
}

fn closed() -> Error {
    Error::Connection("connection is closed".into())
}

impl Connection for MySqlConnection {
    type Statement = MySqlStatement;

    fn prepare(&mut self, sql: &str) -> crate::Result<MySqlStatement> {
        let count = self.runtime.block_on(async {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or_else(closed)?;
            let prepared = (&mut **conn).prepare(sql).await?;
            let count = match prepared.parameters() {
                Some(Either::Left(types)) => types.len(),
                Some(Either::Right(count)) => count,
                None => 0,
            };
            Ok::<_, Error>(count)
        })?;
        Ok(MySqlStatement {
            runtime: Arc::clone(&self.runtime),
            conn: Arc::clone(&self.conn),
            sql: sql.to_owned(),
            params: vec![None; count],
        })
    }

    /// Returns the connection to the pool.
    fn close(&mut self) -> crate::Result<()> {
        // the pooled connection hands itself back by spawning onto the runtime
        self.runtime.block_on(async {
            drop(self.conn.lock().await.take());
        });
        Ok(())
    }
}

impl Drop for MySqlConnection {
    fn drop(&mut self) {
        let _guard = self.runtime.enter();
        if let Ok(mut conn) = self.conn.try_lock() {
            drop(conn.take());
        }
    }
}

pub struct MySqlStatement {
    runtime: Arc<Runtime>,
    conn: SharedConnection,
    sql: String,
    params: Vec<Option<SqlParam>>,
}

impl MySqlStatement {
    fn bound_params(&self) -> crate::Result<Vec<SqlParam>> {
        self.params
            .iter()
            .enumerate()
            .map(|(i, param)| {
                param.clone().ok_or_else(|| Error::Bind {
                    position: i + 1,
                    message: "no value bound".into(),
                })
            })
            .collect()
    }
}

impl Statement for MySqlStatement {
    type Cursor = MySqlCursor;

    fn parameter_count(&self) -> usize {
        self.params.len()
    }

    fn set_param(&mut self, position: usize, param: SqlParam) -> crate::Result<()> {
        let count = self.params.len();
        match position.checked_sub(1).and_then(|i| self.params.get_mut(i)) {
            Some(slot) => {
                *slot = Some(param);
                Ok(())
            }
            None => Err(Error::Bind {
                position,
                message: format!("statement has {count} parameters"),
            }),
        }
    }

    fn clear_params(&mut self) {
        self.params.iter_mut().for_each(|p| *p = None);
    }

    fn query(&mut self) -> crate::Result<MySqlCursor> {
        let params = self.bound_params()?;
        let conn = Arc::clone(&self.conn);
        let sql = self.sql.clone();
        let (tx, rx) = mpsc::channel(ROW_BUFFER);
        let task = self.runtime.spawn(async move {
            let mut guard = conn.lock().await;
            let Some(conn) = guard.as_mut() else {
                let _ = tx.send(Err(closed())).await;
                return;
            };
            let query = params.into_iter().fold(sqlx::query(&sql), bind_param);
            let mut stream = query.fetch(&mut **conn);
            let mut names = None;
            while let Some(next) = stream.next().await {
                let item = next
                    .map_err(Error::from)
                    .and_then(|row| decode_row(&row, &mut names));
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });
        Ok(MySqlCursor {
            runtime: Arc::clone(&self.runtime),
            rows: rx,
            task: Some(task),
        })
    }

    fn update(&mut self) -> crate::Result<u64> {
        let params = self.bound_params()?;
        let done = self.runtime.block_on(async {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or_else(closed)?;
            let query = params.into_iter().fold(sqlx::query(&self.sql), bind_param);
            Ok::<_, Error>(query.execute(&mut **conn).await?)
        })?;
        Ok(done.rows_affected())
    }

    /// SQLx caches prepared statements per connection; nothing to release.
    fn close(&mut self) -> crate::Result<()> {
        self.params.clear();
        Ok(())
    }
}

/// Rows streamed from a task on the provider's runtime.
pub struct MySqlCursor {
    runtime: Arc<Runtime>,
    rows: mpsc::Receiver<crate::Result<Row>>,
    task: Option<JoinHandle<()>>,
}

impl Cursor for MySqlCursor {
    fn next_row(&mut self) -> crate::Result<Option<Row>> {
        match self.rows.blocking_recv() {
            Some(row) => row.map(Some),
            None => Ok(None),
        }
    }

    /// Stops the streaming task and waits for it to release the connection.
    fn close(&mut self) -> crate::Result<()> {
        self.rows.close();
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        task.abort();
        match self.runtime.block_on(task) {
            Ok(()) => Ok(()),
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(Error::Driver(Box::new(err))),
        }
    }
}

fn bind_param<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    param: SqlParam,
) -> Query<'q, MySql, MySqlArguments> {
    match param {
        SqlParam::Null(ty) => match ty {
            SqlType::Integer => query.bind(None::<i32>),
            SqlType::BigInt => query.bind(None::<i64>),
            SqlType::Double => query.bind(None::<f64>),
            SqlType::Boolean => query.bind(None::<bool>),
            SqlType::Date => query.bind(None::<NaiveDate>),
            SqlType::Timestamp => query.bind(None::<NaiveDateTime>),
            SqlType::Blob => query.bind(None::<Vec<u8>>),
            SqlType::Varchar | SqlType::Clob => query.bind(None::<String>),
        },
        SqlParam::String(s) | SqlParam::Text(s) => query.bind(s),
        SqlParam::Int(v) => query.bind(v),
        SqlParam::Long(v) => query.bind(v),
        SqlParam::Double(v) => query.bind(v),
        SqlParam::Bool(v) => query.bind(v),
        SqlParam::Date(v) => query.bind(v),
        SqlParam::Timestamp(v) => query.bind(v),
        SqlParam::Bytes(v) => query.bind(v),
    }
}

/// Converts a MySQL row, sharing one column-name list across the result set.
fn decode_row(row: &MySqlRow, names: &mut Option<Arc<[String]>>) -> crate::Result<Row> {
    let names = names
        .get_or_insert_with(|| row.columns().iter().map(|c| c.name().to_owned()).collect())
        .clone();
    let mut values = Vec::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        if row.try_get_raw(i)?.is_null() {
            values.push(Value::Null);
            continue;
        }
        let value = match column.type_info().name() {
            "BOOLEAN" => Value::Bool(row.try_get(i)?),
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" => Value::Int(row.try_get(i)?),
            "BIGINT" => Value::Long(row.try_get(i)?),
            "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED" => {
                Value::Long(i64::from(row.try_get::<u32, _>(i)?))
            }
            "BIGINT UNSIGNED" => {
                let v: u64 = row.try_get(i)?;
                i64::try_from(v).map_or_else(|_| Value::String(v.to_string()), Value::Long)
            }
            "FLOAT" => Value::Double(f64::from(row.try_get::<f32, _>(i)?)),
            "DOUBLE" => Value::Double(row.try_get(i)?),
            "DATE" => Value::Date(row.try_get(i)?),
            "DATETIME" | "TIMESTAMP" => Value::Timestamp(row.try_get(i)?),
            "TINYTEXT" | "TEXT" | "MEDIUMTEXT" | "LONGTEXT" => Value::Clob(row.try_get(i)?),
            "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => {
                Value::Blob(row.try_get(i)?)
            }
            "CHAR" | "VARCHAR" => Value::String(row.try_get(i)?),
            // binary protocol sends YEAR as a two-byte integer, TIME as a packed duration
            "YEAR" => Value::Int(i32::from(row.try_get_unchecked::<u16, _>(i)?)),
            "TIME" => Value::String(row.try_get::<MySqlTime, _>(i)?.to_string()),
            // DECIMAL, JSON, ENUM and SET arrive as text
            _ => Value::String(row.try_get_unchecked(i)?),
        };
        values.push(value);
    }
    Ok(Row::new(names, values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_rejects_malformed_url() {
        let options = ConnectOptions::builder().url("not a url").build().unwrap();
        assert!(matches!(
            MySqlProvider::connect(&options),
            Err(Error::Database(_))
        ));
    }

    #[test]
    fn test_unbound_parameters_are_reported() {
        let runtime = Arc::new(Runtime::new().unwrap());
        let stmt = MySqlStatement {
            runtime,
            conn: Arc::new(Mutex::new(None)),
            sql: "select ? + ?".into(),
            params: vec![Some(SqlParam::Int(1)), None],
        };
        assert!(matches!(
            stmt.bound_params(),
            Err(Error::Bind { position: 2, .. })
        ));
    }

    #[test]
    fn test_closed_connection_rejects_statements() {
        let runtime = Arc::new(Runtime::new().unwrap());
        let mut conn = MySqlConnection {
            runtime,
            conn: Arc::new(Mutex::new(None)),
        };
        assert!(matches!(conn.prepare("select 1"), Err(Error::Connection(_))));
        conn.close().unwrap();
    }

    #[test]
    #[ignore = "needs DATABASE_URL pointing at a MySQL server"]
    fn test_facade_round_trip_on_plain_threads() {
        use crate::{Database, Params, Projection};
        use tokio_util::sync::CancellationToken;

        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let options = ConnectOptions::builder().url(url).max_connections(4).build().unwrap();
        let db = Database::new(MySqlProvider::connect(&options).unwrap());

        db.execute_update("DROP TABLE IF EXISTS sqlx_named_rows_clock", Params::new()).unwrap();
        db.execute_update(
            "CREATE TABLE sqlx_named_rows_clock (id INT PRIMARY KEY, at TIME NULL, yr YEAR NULL)",
            Params::new(),
        )
        .unwrap();
        for id in 1..=8 {
            db.execute_update(
                "INSERT INTO sqlx_named_rows_clock (id, at, yr) VALUES (:id, :at, :yr)",
                Params::new().bind("id", id).bind("at", "-12:30:05").bind("yr", 2024),
            )
            .unwrap();
        }

        let ids = db
            .values("SELECT id FROM sqlx_named_rows_clock WHERE id > :after", Params::new().bind("after", 0))
            .unwrap();
        assert_eq!(ids.len(), 8);

        let rows = db
            .rows(
                "SELECT at, yr FROM sqlx_named_rows_clock WHERE id = :id",
                Params::new().bind("id", 1),
                Projection::Raw,
            )
            .unwrap();
        assert_eq!(rows[0].get("at"), Some(&Value::from("-12:30:05")));
        assert_eq!(rows[0].get("yr"), Some(&Value::Int(2024)));

        let result = db
            .for_each_parallel(
                "SELECT id FROM sqlx_named_rows_clock",
                Params::new(),
                Projection::Raw,
                2,
                &CancellationToken::new(),
                |ctx, row| {
                    ctx.database().execute_update(
                        "UPDATE sqlx_named_rows_clock SET at = NULL WHERE id = :id",
                        Params::new().bind("id", row.get("id").cloned().unwrap_or(Value::Null)),
                    )?;
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(result.completed, 8);

        let cleared = db
            .first_value("SELECT COUNT(*) FROM sqlx_named_rows_clock WHERE at IS NULL", Params::new())
            .unwrap();
        assert_eq!(cleared, Value::Long(8));

        db.execute_update("DROP TABLE sqlx_named_rows_clock", Params::new()).unwrap();
    }
}
