use crate::bind::{bind_positions, bind_value};
use crate::builder::NamedQuery;
use crate::driver::{Connection, Statement};
use crate::error::Error;
use crate::value::Value;

/// How a bind argument addresses its placeholder(s).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKey {
    /// A `:name` placeholder; every occurrence is bound.
    Name(String),
    /// A 1-based positional placeholder.
    Index(usize),
}

/// An ordered set of bind arguments.
///
/// # Examples
///
/// ```
/// use sqlx_named_rows::Params;
///
/// let params = Params::new().bind("id", 42).bind("name", "John Doe");
/// assert_eq!(params.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    entries: Vec<(ParamKey, Value)>,
}

impl Params {
    /// An empty argument set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named argument. A leading `:` in `name` is ignored.
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        let name = name.strip_prefix(':').map(str::to_owned).unwrap_or(name);
        self.entries.push((ParamKey::Name(name), value.into()));
        self
    }

    /// Adds a positional argument.
    pub fn bind_index(mut self, index: usize, value: impl Into<Value>) -> Self {
        self.entries.push((ParamKey::Index(index), value.into()));
        self
    }

    /// Number of arguments added, counting repeats of the same name.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates arguments in the order they were added. Later entries win.
    ///
    /// # Examples
    ///
    /// ```
    /// use sqlx_named_rows::query::ParamKey;
    /// use sqlx_named_rows::{Params, Value};
    ///
    /// let params = Params::new().bind(":id", 1).bind_index(2, "x");
    /// let keys: Vec<_> = params.iter().map(|(key, _)| key.clone()).collect();
    /// assert_eq!(keys, vec![ParamKey::Name("id".into()), ParamKey::Index(2)]);
    /// assert_eq!(params.iter().next().map(|(_, v)| v), Some(&Value::Int(1)));
    /// ```
    pub fn iter(&self) -> impl Iterator<Item = &(ParamKey, Value)> {
        self.entries.iter()
    }
}

impl<K, V> FromIterator<(K, V)> for Params
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Params::new(), |params, (k, v)| params.bind(k, v))
    }
}

/// A prepared statement addressed by named placeholders.
///
/// `NamedStatement` translates the `:name` template once, prepares the positional
/// SQL on a connection, and routes each named bind to every position the name
/// occupies. Binding a name that does not occur in the query is an error unless
/// the statement was created with `ignore_unused` set.
///
/// # Examples
///
/// ```
/// use sqlx_named_rows::memory::MemoryProvider;
/// use sqlx_named_rows::provider::ConnectionProvider;
/// use sqlx_named_rows::NamedStatement;
///
/// let provider = MemoryProvider::new();
/// provider.on_update("update users set name = ? where id = ?", 1);
///
/// let mut conn = provider.open()?;
/// let mut stmt = NamedStatement::prepare(
///     &mut conn,
///     "update users set name = :name where id = :id",
///     false,
/// )?;
/// stmt.bind("id", 42)?;
/// stmt.bind("name", "Jane Doe")?;
/// assert_eq!(stmt.execute_update()?, 1);
/// # Ok::<(), sqlx_named_rows::Error>(())
/// ```
pub struct NamedStatement<S> {
    query: NamedQuery,
    statement: S,
    ignore_unused: bool,
    bound: Vec<bool>,
}

impl<S> NamedStatement<S>
where
    S: Statement,
{
    /// Translates `template` and prepares the result on `connection`.
    ///
    /// # Errors
    ///
    /// Returns an error if the template cannot be translated or the driver
    /// refuses to prepare the SQL.
    pub fn prepare<C>(connection: &mut C, template: &str, ignore_unused: bool) -> crate::Result<Self>
    where
        C: Connection<Statement = S>,
    {
        let query = NamedQuery::parse(template)?;
        tracing::debug!(sql = query.sql(), "prepare");
        let statement = connection.prepare(query.sql())?;
        Ok(Self::new(query, statement, ignore_unused))
    }

    /// Wraps an already prepared driver statement.
    pub fn new(query: NamedQuery, statement: S, ignore_unused: bool) -> Self {
        let bound = vec![false; query.placeholder_count()];
        Self {
            query,
            statement,
            ignore_unused,
            bound,
        }
    }

    pub fn query(&self) -> &NamedQuery {
        &self.query
    }

    pub fn ignores_unused(&self) -> bool {
        self.ignore_unused
    }

    /// Binds `value` to every occurrence of `:name`.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownParameter`] if `name` is not in the query and unused
    /// parameters are not tolerated; otherwise whatever the driver reports.
    pub fn bind(&mut self, name: &str, value: impl Into<Value>) -> crate::Result<()> {
        let name = name.strip_prefix(':').unwrap_or(name);
        let Some(positions) = self.query.positions(name) else {
            if self.ignore_unused {
                tracing::trace!(name, "ignoring unused parameter");
                return Ok(());
            }
            return Err(Error::UnknownParameter(name.to_owned()));
        };
        bind_positions(&mut self.statement, positions, &value.into())?;
        for &position in positions {
            self.bound[position - 1] = true;
        }
        Ok(())
    }

    /// Binds `value` to one 1-based position.
    pub fn bind_index(&mut self, index: usize, value: impl Into<Value>) -> crate::Result<()> {
        let count = self.bound.len();
        if index == 0 || index > count {
            return Err(Error::ParameterIndex { index, count });
        }
        bind_value(&mut self.statement, index, &value.into())?;
        self.bound[index - 1] = true;
        Ok(())
    }

    pub fn bind_all(&mut self, params: &Params) -> crate::Result<()> {
        for (key, value) in params.iter() {
            match key {
                ParamKey::Name(name) => self.bind(name, value.clone())?,
                ParamKey::Index(index) => self.bind_index(*index, value.clone())?,
            }
        }
        Ok(())
    }

    /// Forgets every bound value.
    pub fn clear(&mut self) {
        self.statement.clear_params();
        self.bound.iter_mut().for_each(|b| *b = false);
    }

    fn check_bound(&self) -> crate::Result<()> {
        match self.bound.iter().position(|b| !b) {
            Some(i) => Err(Error::UnboundPlaceholder(
                self.query.name_at(i + 1).unwrap_or_default().to_owned(),
            )),
            None => Ok(()),
        }
    }

    /// Executes the query and returns its cursor.
    pub fn execute_query(&mut self) -> crate::Result<S::Cursor> {
        self.check_bound()?;
        tracing::debug!(sql = self.query.sql(), "query");
        self.statement.query()
    }

    /// Executes a data-modifying statement and returns the affected-row count.
    pub fn execute_update(&mut self) -> crate::Result<u64> {
        self.check_bound()?;
        tracing::debug!(sql = self.query.sql(), "update");
        self.statement.update()
    }

    pub fn close(mut self) -> crate::Result<()> {
        self.statement.close()
    }

    pub fn into_inner(self) -> S {
        self.statement
    }
}
