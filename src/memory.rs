//! An in-memory, scripted implementation of the driver traits.
//!
//! Results are registered per translated SQL string. Every bind, execution and
//! close is recorded so callers can assert on what reached the "database".
//!
//! ```
//! use sqlx_named_rows::memory::MemoryProvider;
//! use sqlx_named_rows::{Database, Params, Value};
//!
//! let provider = MemoryProvider::new();
//! provider.on_query("select name from users where id = ?", &["name"], vec![vec![Value::from("ann")]]);
//!
//! let db = Database::new(provider);
//! let name = db.first_value("select name from users where id = :id", Params::new().bind("id", 1))?;
//! assert_eq!(name, Value::from("ann"));
//! # Ok::<(), sqlx_named_rows::Error>(())
//! ```

use crate::driver::{Connection, Cursor, Row, Statement};
use crate::error::Error;
use crate::provider::ConnectionProvider;
use crate::value::{SqlParam, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
enum Script {
    Rows {
        names: Arc<[String]>,
        rows: Vec<Vec<Value>>,
        fail_at: Option<usize>,
    },
    Update(u64),
    Failure(String),
}

/// Kind of resource a [`Event::Closed`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Cursor,
    Statement,
    Connection,
}

/// Something that happened against the in-memory database.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Opened(usize),
    Prepared { connection: usize, sql: String },
    Executed { sql: String, params: Vec<Option<SqlParam>> },
    Closed { resource: Resource, connection: usize },
}

#[derive(Debug, Default)]
struct State {
    scripts: Mutex<HashMap<String, Script>>,
    events: Mutex<Vec<Event>>,
    next_connection: AtomicUsize,
    rows_read: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl State {
    fn record(&self, event: Event) {
        lock(&self.events).push(event);
    }
}

/// Connection provider backed by scripted in-memory results.
///
/// Cloning shares the scripts and the event log.
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    state: Arc<State>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the rows returned when `sql` is queried.
    pub fn on_query(&self, sql: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> &Self {
        self.script(sql, Script::Rows {
            names: columns.iter().map(|c| (*c).to_owned()).collect(),
            rows,
            fail_at: None,
        })
    }

    /// Like [`on_query`](Self::on_query), but reading row `index` (0-based) fails.
    pub fn on_query_failing_at(
        &self,
        sql: &str,
        columns: &[&str],
        rows: Vec<Vec<Value>>,
        index: usize,
    ) -> &Self {
        self.script(sql, Script::Rows {
            names: columns.iter().map(|c| (*c).to_owned()).collect(),
            rows,
            fail_at: Some(index),
        })
    }

    /// Registers the affected-row count returned when `sql` is executed as an update.
    pub fn on_update(&self, sql: &str, affected: u64) -> &Self {
        self.script(sql, Script::Update(affected))
    }

    /// Makes every execution of `sql` fail with `message`.
    pub fn on_failure(&self, sql: &str, message: &str) -> &Self {
        self.script(sql, Script::Failure(message.to_owned()))
    }

    fn script(&self, sql: &str, script: Script) -> &Self {
        lock(&self.state.scripts).insert(sql.to_owned(), script);
        self
    }

    pub fn events(&self) -> Vec<Event> {
        lock(&self.state.events).clone()
    }

    /// Parameter lists of every execution of `sql`, in execution order.
    pub fn executions(&self, sql: &str) -> Vec<Vec<Option<SqlParam>>> {
        lock(&self.state.events)
            .iter()
            .filter_map(|event| match event {
                Event::Executed { sql: s, params } if s == sql => Some(params.clone()),
                _ => None,
            })
            .collect()
    }

    /// Close events, in the order they happened.
    pub fn closes(&self) -> Vec<Resource> {
        lock(&self.state.events)
            .iter()
            .filter_map(|event| match event {
                Event::Closed { resource, .. } => Some(*resource),
                _ => None,
            })
            .collect()
    }

    pub fn connections_opened(&self) -> usize {
        self.state.next_connection.load(Ordering::SeqCst)
    }

    /// Total rows handed out by all cursors.
    pub fn rows_read(&self) -> usize {
        self.state.rows_read.load(Ordering::SeqCst)
    }
}

impl ConnectionProvider for MemoryProvider {
    type Connection = MemoryConnection;

    fn open(&self) -> crate::Result<MemoryConnection> {
        let id = self.state.next_connection.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.record(Event::Opened(id));
        Ok(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
            closed: false,
        })
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    id: usize,
    state: Arc<State>,
    closed: bool,
}

impl MemoryConnection {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Connection for MemoryConnection {
    type Statement = MemoryStatement;

    fn prepare(&mut self, sql: &str) -> crate::Result<MemoryStatement> {
        if self.closed {
            return Err(Error::Connection(format!("connection {} is closed", self.id)));
        }
        self.state.record(Event::Prepared {
            connection: self.id,
            sql: sql.to_owned(),
        });
        let count = sql.matches('?').count();
        Ok(MemoryStatement {
            connection: self.id,
            sql: sql.to_owned(),
            params: vec![None; count],
            state: Arc::clone(&self.state),
        })
    }

    fn close(&mut self) -> crate::Result<()> {
        if !self.closed {
            self.closed = true;
            self.state.record(Event::Closed {
                resource: Resource::Connection,
                connection: self.id,
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryStatement {
    connection: usize,
    sql: String,
    params: Vec<Option<SqlParam>>,
    state: Arc<State>,
}

impl MemoryStatement {
    fn run(&self) -> crate::Result<Script> {
        self.state.record(Event::Executed {
            sql: self.sql.clone(),
            params: self.params.clone(),
        });
        let script = lock(&self.state.scripts).get(&self.sql).cloned();
        match script {
            Some(Script::Failure(message)) => Err(Error::Driver(message.into())),
            Some(script) => Ok(script),
            None => Err(Error::Driver(format!("no result scripted for `{}`", self.sql).into())),
        }
    }
}

impl Statement for MemoryStatement {
    type Cursor = MemoryCursor;

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

    fn query(&mut self) -> crate::Result<MemoryCursor> {
        match self.run()? {
            Script::Rows {
                names,
                rows,
                fail_at,
            } => Ok(MemoryCursor {
                connection: self.connection,
                names,
                rows: rows.into_iter(),
                position: 0,
                fail_at,
                state: Arc::clone(&self.state),
                closed: false,
            }),
            _ => Err(Error::Driver(format!("`{}` does not return rows", self.sql).into())),
        }
    }

    fn update(&mut self) -> crate::Result<u64> {
        match self.run()? {
            Script::Update(affected) => Ok(affected),
            Script::Rows { rows, .. } => Ok(rows.len() as u64),
            Script::Failure(message) => Err(Error::Driver(message.into())),
        }
    }

    fn close(&mut self) -> crate::Result<()> {
        self.state.record(Event::Closed {
            resource: Resource::Statement,
            connection: self.connection,
        });
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryCursor {
    connection: usize,
    names: Arc<[String]>,
    rows: std::vec::IntoIter<Vec<Value>>,
    position: usize,
    fail_at: Option<usize>,
    state: Arc<State>,
    closed: bool,
}

impl Cursor for MemoryCursor {
    fn next_row(&mut self) -> crate::Result<Option<Row>> {
        if self.closed {
            return Err(Error::Usage("cursor is closed".into()));
        }
        if self.fail_at == Some(self.position) {
            return Err(Error::Driver(format!("row {} is unreadable", self.position).into()));
        }
        let Some(values) = self.rows.next() else {
            return Ok(None);
        };
        self.position += 1;
        self.state.rows_read.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Row::new(Arc::clone(&self.names), values)))
    }

    fn close(&mut self) -> crate::Result<()> {
        if !self.closed {
            self.closed = true;
            self.state.record(Event::Closed {
                resource: Resource::Cursor,
                connection: self.connection,
            });
        }
        Ok(())
    }
}
