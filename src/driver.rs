//! The blocking, cursor-based driver boundary the engine runs on.
//!
//! Implementations exist for SQLx/MySQL (`mysql` feature) and for an in-memory
//! scripted database ([`crate::memory`]).

use crate::value::{SqlParam, Value};
use std::sync::Arc;

/// One result row: field names paired with values, in column order.
///
/// Rows produced by the same cursor share their name list.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    names: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a row. Missing trailing values are padded with [`Value::Null`].
    pub fn new(names: Arc<[String]>, mut values: Vec<Value>) -> Self {
        values.resize(names.len(), Value::Null);
        Self { names, values }
    }

    /// Builds a row from `(name, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let (names, values): (Vec<String>, Vec<Value>) = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .unzip();
        Self {
            names: names.into(),
            values,
        }
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `true` when every field is null, including the zero-field row.
    pub fn is_null(&self) -> bool {
        self.values.iter().all(Value::is_null)
    }

    /// Field names in column order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Field values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Looks a field up by its exact name.
    ///
    /// Returns `None` for an unknown field; a field holding SQL `NULL` gives
    /// `Some(&Value::Null)`.
    ///
    /// # Examples
    ///
    /// ```
    /// use sqlx_named_rows::{Row, Value};
    ///
    /// let row = Row::from_pairs([("id", Value::Int(7)), ("note", Value::Null)]);
    /// assert_eq!(row.get("id"), Some(&Value::Int(7)));
    /// assert_eq!(row.get("note"), Some(&Value::Null));
    /// assert_eq!(row.get("ID"), None);
    /// ```
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.index_of(name).map(|i| &self.values[i])
    }

    /// Looks a field up by name, ignoring ASCII case.
    pub fn get_ignore_case(&self, name: &str) -> Option<&Value> {
        self.get(name).or_else(|| {
            self.names
                .iter()
                .position(|n| n.eq_ignore_ascii_case(name))
                .map(|i| &self.values[i])
        })
    }

    /// Looks a field up by its 0-based column index.
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Iterates `(name, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// A forward-only result cursor. Only ever read from one thread.
pub trait Cursor: 'static {
    /// Advances to the next row; `Ok(None)` once the result is exhausted.
    fn next_row(&mut self) -> crate::Result<Option<Row>>;

    /// Releases the cursor. Called at most once by the engine.
    fn close(&mut self) -> crate::Result<()>;
}

/// A prepared statement with positional (1-based) parameters.
pub trait Statement: 'static {
    type Cursor: Cursor;

    fn parameter_count(&self) -> usize;

    fn set_param(&mut self, position: usize, param: SqlParam) -> crate::Result<()>;

    fn clear_params(&mut self);

    fn query(&mut self) -> crate::Result<Self::Cursor>;

    /// Executes a data-modifying statement and returns the affected-row count.
    fn update(&mut self) -> crate::Result<u64>;

    fn close(&mut self) -> crate::Result<()>;
}

/// An open database connection. Used by one thread at a time.
pub trait Connection: 'static {
    type Statement: Statement;

    /// Prepares positional SQL (already translated from named placeholders).
    fn prepare(&mut self, sql: &str) -> crate::Result<Self::Statement>;

    fn close(&mut self) -> crate::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_lookup() {
        let row = Row::from_pairs([("ID", Value::Int(1)), ("name", Value::from("a"))]);
        assert_eq!(row.len(), 2);
        assert_eq!(row.get("name"), Some(&Value::from("a")));
        assert_eq!(row.get("id"), None);
        assert_eq!(row.get_ignore_case("id"), Some(&Value::Int(1)));
        assert_eq!(row.get_index(0), Some(&Value::Int(1)));
        assert_eq!(row.index_of("name"), Some(1));
        let pairs: Vec<_> = row.iter().map(|(n, _)| n.to_owned()).collect();
        assert_eq!(pairs, vec!["ID", "name"]);
    }

    #[test]
    fn test_row_null_detection() {
        let names: Arc<[String]> = vec!["a".to_owned(), "b".to_owned()].into();
        let padded = Row::new(names.clone(), vec![]);
        assert!(padded.is_null());
        assert_eq!(padded.len(), 2);
        let row = Row::new(names, vec![Value::Null, Value::Int(0)]);
        assert!(!row.is_null());
    }
}
