//! Convenience entry points that compose translation, binding, iteration and
//! parallel dispatch.

use crate::column::Projection;
use crate::driver::{Connection, Row, Statement};
use crate::error::{BoxError, Error};
use crate::iter::RowIter;
use crate::parallel::{self, PoolConfig, TaskContext, WorkResult, WorkerPool};
use crate::provider::ConnectionProvider;
use crate::query::{NamedStatement, Params};
use crate::value::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type StatementOf<P> = <<P as ConnectionProvider>::Connection as Connection>::Statement;

/// The cursor type produced by a provider's statements.
pub type CursorOf<P> = <StatementOf<P> as Statement>::Cursor;

/// Behaviour shared by every query a [`Database`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    ignore_unused_params: bool,
    strict_unique: bool,
    skip_nulls: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            ignore_unused_params: false,
            strict_unique: true,
            skip_nulls: false,
        }
    }
}

impl QueryOptions {
    pub fn builder() -> QueryOptionsBuilder {
        QueryOptionsBuilder::default()
    }

    /// Binding a name the query does not contain is a no-op instead of an error.
    pub fn ignore_unused_params(&self) -> bool {
        self.ignore_unused_params
    }

    /// [`Database::unique_value`] fails when more than one row matches.
    pub fn strict_unique(&self) -> bool {
        self.strict_unique
    }

    /// Rows whose projection is entirely null are not returned.
    pub fn skip_nulls(&self) -> bool {
        self.skip_nulls
    }
}

#[derive(Debug, Default, Clone)]
pub struct QueryOptionsBuilder {
    options: QueryOptions,
}

impl QueryOptionsBuilder {
    pub fn ignore_unused_params(mut self, ignore: bool) -> Self {
        self.options.ignore_unused_params = ignore;
        self
    }

    pub fn strict_unique(mut self, strict: bool) -> Self {
        self.options.strict_unique = strict;
        self
    }

    pub fn skip_nulls(mut self, skip: bool) -> Self {
        self.options.skip_nulls = skip;
        self
    }

    pub fn build(self) -> QueryOptions {
        self.options
    }
}

/// Runs named-parameter queries against connections from a [`ConnectionProvider`].
///
/// Every call opens its own connection and closes the cursor, statement and
/// connection exactly once, in that order.
///
/// # Examples
///
/// ```
/// use sqlx_named_rows::memory::MemoryProvider;
/// use sqlx_named_rows::{Database, Params, Projection, Value};
///
/// let provider = MemoryProvider::new();
/// provider.on_query(
///     "select id from users where age >= ?",
///     &["id"],
///     vec![vec![Value::Int(1)], vec![Value::Int(2)]],
/// );
///
/// let db = Database::new(provider);
/// let ids = db.values("select id from users where age >= :min_age", Params::new().bind("min_age", 18))?;
/// assert_eq!(ids, vec![Value::Int(1), Value::Int(2)]);
/// # Ok::<(), sqlx_named_rows::Error>(())
/// ```
pub struct Database<P> {
    provider: Arc<P>,
    options: QueryOptions,
}

impl<P> Clone for Database<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            options: self.options,
        }
    }
}

impl<P> std::fmt::Debug for Database<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<P> Database<P>
where
    P: ConnectionProvider,
{
    pub fn new(provider: P) -> Self {
        Self::from_shared(Arc::new(provider))
    }

    pub fn from_shared(provider: Arc<P>) -> Self {
        Self {
            provider,
            options: QueryOptions::default(),
        }
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    fn open_statement(
        &self,
        sql: &str,
        params: &Params,
    ) -> crate::Result<(P::Connection, NamedStatement<StatementOf<P>>)> {
        let mut conn = self.provider.open()?;
        let mut stmt =
            match NamedStatement::prepare(&mut conn, sql, self.options.ignore_unused_params) {
                Ok(stmt) => stmt,
                Err(err) => return finish(Err(err), [("connection", conn.close())]),
            };
        if let Err(err) = stmt.bind_all(params) {
            return finish(
                Err(err),
                [("statement", stmt.close()), ("connection", conn.close())],
            );
        }
        Ok((conn, stmt))
    }

    /// Executes a query and returns an iterator over its projected rows.
    ///
    /// The statement and connection are closed by the iterator, after its cursor.
    pub fn iter(
        &self,
        sql: &str,
        params: Params,
        projection: Projection,
    ) -> crate::Result<RowIter<'static, CursorOf<P>>> {
        let (mut conn, mut stmt) = self.open_statement(sql, &params)?;
        let cursor = match stmt.execute_query() {
            Ok(cursor) => cursor,
            Err(err) => {
                return finish(
                    Err(err),
                    [("statement", stmt.close()), ("connection", conn.close())],
                )
            }
        };
        let mut rows = RowIter::new(cursor, projection);
        rows.set_finalizer(move || {
            let statement = stmt.close();
            let connection = conn.close();
            statement.and(connection)
        })?;
        rows.set_skip_nulls(self.options.skip_nulls)?;
        Ok(rows)
    }

    /// The first row, if any. Remaining rows are not read.
    pub fn first_row(&self, sql: &str, params: Params) -> crate::Result<Option<Row>> {
        let mut rows = self.iter(sql, params, Projection::Raw)?;
        let first = rows.next_row();
        let closed = rows.close();
        finish(first, [("rows", closed)])
    }

    /// The first column of the first row.
    ///
    /// # Errors
    ///
    /// [`Error::NoRows`] if the query matched nothing.
    pub fn first_value(&self, sql: &str, params: Params) -> crate::Result<Value> {
        self.first_row(sql, params)?
            .map(first_column)
            .ok_or(Error::NoRows)
    }

    /// The first column of the only row.
    ///
    /// With [`QueryOptions::strict_unique`] set (the default), every row is read
    /// and more than one yields [`Error::NonUniqueResult`].
    pub fn unique_value(&self, sql: &str, params: Params) -> crate::Result<Value> {
        let mut rows = self.iter(sql, params, Projection::Raw)?;
        let Some(first) = rows.next_row()? else {
            return Err(Error::NoRows);
        };
        if self.options.strict_unique {
            let mut count = 1;
            while rows.next_row()?.is_some() {
                count += 1;
            }
            if count > 1 {
                return Err(Error::NonUniqueResult(count));
            }
        } else {
            rows.close()?;
        }
        Ok(first_column(first))
    }

    /// Every projected row.
    pub fn rows(&self, sql: &str, params: Params, projection: Projection) -> crate::Result<Vec<Row>> {
        self.iter(sql, params, projection)?.collect()
    }

    /// The first column of every row.
    pub fn values(&self, sql: &str, params: Params) -> crate::Result<Vec<Value>> {
        Ok(self
            .rows(sql, params, Projection::Raw)?
            .into_iter()
            .map(first_column)
            .collect())
    }

    /// Runs a data-modifying statement and returns the affected-row count.
    pub fn execute_update(&self, sql: &str, params: Params) -> crate::Result<u64> {
        let (mut conn, mut stmt) = self.open_statement(sql, &params)?;
        let affected = stmt.execute_update();
        let statement = stmt.close();
        let connection = conn.close();
        finish(affected, [("statement", statement), ("connection", connection)])
    }

    /// Calls `handler` for each row in cursor order and returns how many rows it
    /// handled. The first handler error stops iteration and is returned as
    /// [`Error::Handler`].
    pub fn for_each<F>(
        &self,
        sql: &str,
        params: Params,
        projection: Projection,
        mut handler: F,
    ) -> crate::Result<usize>
    where
        F: FnMut(Row) -> Result<(), BoxError>,
    {
        let mut rows = self.iter(sql, params, projection)?;
        let mut handled = 0;
        while let Some(row) = rows.next_row()? {
            if let Err(err) = handler(row) {
                return finish(Err(Error::Handler(err)), [("rows", rows.close())]);
            }
            handled += 1;
        }
        Ok(handled)
    }

    /// Like [`for_each_parallel_in`](Self::for_each_parallel_in) on a pool of
    /// `workers` threads that lives for this call only.
    pub fn for_each_parallel<H>(
        &self,
        sql: &str,
        params: Params,
        projection: Projection,
        workers: usize,
        cancel: &CancellationToken,
        handler: H,
    ) -> crate::Result<WorkResult>
    where
        H: Fn(&TaskContext<'_, Database<P>>, &Row) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let config = PoolConfig::builder().workers(workers).build()?;
        let mut pool = WorkerPool::new(config)?;
        let result = self.for_each_parallel_in(&pool, sql, params, projection, cancel, handler);
        match &result {
            Ok(outcome) if outcome.interrupted || outcome.timed_out => pool.shutdown_now(),
            _ => pool.shutdown(),
        }
        result
    }

    /// Reads rows on this thread and hands each one to `handler` on `pool`.
    ///
    /// Handlers receive a clone of this `Database` through
    /// [`TaskContext::database`] so they can run their own statements. Handler
    /// errors are collected in the returned [`WorkResult`]; errors while reading
    /// rows are returned directly.
    pub fn for_each_parallel_in<H>(
        &self,
        pool: &WorkerPool,
        sql: &str,
        params: Params,
        projection: Projection,
        cancel: &CancellationToken,
        handler: H,
    ) -> crate::Result<WorkResult>
    where
        H: Fn(&TaskContext<'_, Database<P>>, &Row) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let mut rows = self.iter(sql, params, projection)?;
        rows.set_cancel_token(cancel.clone())?;
        let outcome = parallel::dispatch(
            pool,
            &mut rows,
            Arc::new(self.clone()),
            Arc::new(handler),
            cancel,
        );
        let closed = rows.close();
        finish(outcome, [("rows", closed)])
    }
}

impl<P> TaskContext<'_, Database<P>>
where
    P: ConnectionProvider,
{
    pub fn database(&self) -> &Database<P> {
        self.context()
    }
}

fn first_column(row: Row) -> Value {
    row.into_values().into_iter().next().unwrap_or(Value::Null)
}

/// Returns `primary`, then the first cleanup error. Cleanup errors that follow a
/// primary failure are logged and dropped.
fn finish<T, const N: usize>(
    primary: crate::Result<T>,
    cleanup: [(&'static str, crate::Result<()>); N],
) -> crate::Result<T> {
    match primary {
        Ok(value) => {
            for (_, closed) in cleanup {
                closed?;
            }
            Ok(value)
        }
        Err(err) => {
            for (resource, closed) in cleanup {
                if let Err(close_err) = closed {
                    tracing::warn!(resource, error = %close_err, "close failed during cleanup");
                }
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{ColumnConfig, RenderRegistry};
    use crate::memory::{MemoryProvider, Resource};
    use crate::value::SqlParam;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const USERS: &str = "select id, name from users where age >= ?";
    const TEMPLATE: &str = "select id, name from users where age >= :age";

    fn users() -> MemoryProvider {
        let provider = MemoryProvider::new();
        provider.on_query(
            USERS,
            &["id", "name"],
            vec![
                vec![Value::Int(1), Value::from("ann")],
                vec![Value::Int(2), Value::from("bob")],
                vec![Value::Int(3), Value::from("cy")],
            ],
        );
        provider
    }

    fn age() -> Params {
        Params::new().bind("age", 18)
    }

    const IN_ORDER: [Resource; 3] = [Resource::Cursor, Resource::Statement, Resource::Connection];

    #[test]
    fn test_values_binds_and_closes_in_order() {
        let provider = users();
        let db = Database::new(provider.clone());
        let ids = db.values(TEMPLATE, age()).unwrap();
        assert_eq!(ids, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(provider.executions(USERS), vec![vec![Some(SqlParam::Int(18))]]);
        assert_eq!(provider.closes(), IN_ORDER);
    }

    #[test]
    fn test_first_value() {
        let provider = users();
        let db = Database::new(provider.clone());
        assert_eq!(db.first_value(TEMPLATE, age()).unwrap(), Value::Int(1));
        assert_eq!(provider.rows_read(), 1);
        assert_eq!(provider.closes(), IN_ORDER);
    }

    #[test]
    fn test_first_value_without_rows() {
        let provider = MemoryProvider::new();
        provider.on_query("select 1 from dual where 1 = ?", &["one"], vec![]);
        let db = Database::new(provider);
        let err = db
            .first_value("select 1 from dual where 1 = :x", Params::new().bind("x", 0))
            .unwrap_err();
        assert!(matches!(err, Error::NoRows));
    }

    #[test]
    fn test_unique_value_strictness() {
        let db = Database::new(users());
        let err = db.unique_value(TEMPLATE, age()).unwrap_err();
        assert!(matches!(err, Error::NonUniqueResult(3)));

        let lenient = db
            .clone()
            .with_options(QueryOptions::builder().strict_unique(false).build());
        assert_eq!(lenient.unique_value(TEMPLATE, age()).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_rows_with_projection() {
        let provider = MemoryProvider::new();
        provider.on_query(
            "select amount from orders where id = ?",
            &["amount"],
            vec![vec![Value::from("42")]],
        );
        let db = Database::new(provider);
        let projection = Projection::from_configs(vec![ColumnConfig::new("amount:long").unwrap()]);
        let rows = db
            .rows(
                "select amount from orders where id = :id",
                Params::new().bind("id", 7),
                projection.clone(),
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("amount"), Some(&Value::Long(42)));
        assert_eq!(projection.headers(), Some(vec!["amount"]));
    }

    #[test]
    fn test_projection_from_mixed_specs() {
        let db = Database::new(users());
        let projection =
            Projection::columns(["id:string", "name"], &RenderRegistry::new()).unwrap();
        let rows = db.rows(TEMPLATE, age(), projection).unwrap();
        assert_eq!(rows[2].get("id"), Some(&Value::from("3")));
    }

    #[test]
    fn test_execute_update() {
        let provider = MemoryProvider::new();
        provider.on_update("update users set name = ? where id = ?", 1);
        let db = Database::new(provider.clone());
        let affected = db
            .execute_update(
                "update users set name = :name where id = :id",
                Params::new().bind("id", 1).bind("name", "dee"),
            )
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(provider.closes(), vec![Resource::Statement, Resource::Connection]);
    }

    #[test]
    fn test_unknown_parameter_closes_connection() {
        let provider = users();
        let db = Database::new(provider.clone());
        let err = db
            .values(TEMPLATE, age().bind("nope", 1))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownParameter(_)));
        assert_eq!(provider.closes(), vec![Resource::Statement, Resource::Connection]);

        let tolerant = db.with_options(QueryOptions::builder().ignore_unused_params(true).build());
        assert_eq!(tolerant.values(TEMPLATE, age().bind("nope", 1)).unwrap().len(), 3);
    }

    #[test]
    fn test_driver_failure_closes_statement_and_connection() {
        let provider = MemoryProvider::new();
        provider.on_failure("select * from broken where id = ?", "table is gone");
        let db = Database::new(provider.clone());
        let err = db
            .values("select * from broken where id = :id", Params::new().bind("id", 1))
            .unwrap_err();
        assert!(matches!(err, Error::Driver(_)));
        assert_eq!(provider.closes(), vec![Resource::Statement, Resource::Connection]);
    }

    #[test]
    fn test_iter_dropped_early_still_closes() {
        let provider = users();
        let db = Database::new(provider.clone());
        {
            let mut rows = db.iter(TEMPLATE, age(), Projection::Raw).unwrap();
            assert!(rows.next_row().unwrap().is_some());
        }
        assert_eq!(provider.closes(), IN_ORDER);
    }

    #[test]
    fn test_skip_nulls_option() {
        let provider = MemoryProvider::new();
        provider.on_query(
            "select v from t where k = ?",
            &["v"],
            vec![vec![Value::Null], vec![Value::Int(1)], vec![Value::Null]],
        );
        let db = Database::new(provider)
            .with_options(QueryOptions::builder().skip_nulls(true).build());
        let values = db
            .values("select v from t where k = :k", Params::new().bind("k", "a"))
            .unwrap();
        assert_eq!(values, vec![Value::Int(1)]);
    }

    #[test]
    fn test_for_each_handler_error() {
        let provider = users();
        let db = Database::new(provider.clone());
        let mut seen = Vec::new();
        let err = db
            .for_each(TEMPLATE, age(), Projection::Raw, |row| {
                let id = row.get("id").and_then(Value::as_i64).unwrap_or_default();
                if id == 2 {
                    return Err("cannot handle 2".into());
                }
                seen.push(id);
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, Error::Handler(_)));
        assert_eq!(seen, vec![1]);
        assert_eq!(provider.closes(), IN_ORDER);
    }

    #[test]
    fn test_for_each_counts_rows() {
        let db = Database::new(users());
        let handled = db.for_each(TEMPLATE, age(), Projection::Raw, |_| Ok(())).unwrap();
        assert_eq!(handled, 3);
    }

    #[test]
    fn test_for_each_parallel_uses_own_connections() {
        let provider = users();
        provider.on_update("update users set seen = 1 where id = ?", 1);
        let db = Database::new(provider.clone());
        let result = db
            .for_each_parallel(
                TEMPLATE,
                age(),
                Projection::Raw,
                2,
                &CancellationToken::new(),
                |ctx, row| {
                    let id = row.get("id").cloned().unwrap_or(Value::Null);
                    if id == Value::Int(2) {
                        return Err("row 2 is locked".into());
                    }
                    ctx.database().execute_update(
                        "update users set seen = 1 where id = :id",
                        Params::new().bind("id", id),
                    )?;
                    Ok(())
                },
            )
            .unwrap();

        assert_eq!(result.submitted, 3);
        assert_eq!(result.completed, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.failures[0].row.get("name"), Some(&Value::from("bob")));
        assert_eq!(
            provider.executions("update users set seen = 1 where id = ?").len(),
            2
        );
        // one reader connection plus one per successful row
        assert_eq!(provider.connections_opened(), 3);
    }

    #[test]
    fn test_for_each_parallel_cancelled_before_start() {
        let provider = users();
        let db = Database::new(provider.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result = db
            .for_each_parallel(TEMPLATE, age(), Projection::Raw, 2, &cancel, move |_ctx, _row| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert!(result.interrupted);
        assert_eq!(result.submitted, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(provider.rows_read(), 0);
        assert_eq!(provider.closes(), IN_ORDER);
    }

    #[test]
    fn test_for_each_parallel_in_shared_pool() {
        let provider = users();
        let db = Database::new(provider);
        let pool = WorkerPool::new(PoolConfig::builder().workers(3).build().unwrap()).unwrap();
        let total = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let sum = Arc::clone(&total);
            let result = db
                .for_each_parallel_in(
                    &pool,
                    TEMPLATE,
                    age(),
                    Projection::Raw,
                    &CancellationToken::new(),
                    move |_ctx, row| {
                        let id = row.get("id").and_then(Value::as_i64).unwrap_or_default();
                        sum.fetch_add(id as usize, Ordering::SeqCst);
                        Ok(())
                    },
                )
                .unwrap();
            assert!(result.is_success());
        }
        assert_eq!(total.load(Ordering::SeqCst), 12);
    }
}
