//! Semantic values moved in and out of statements and rows.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use std::fmt;

/// Reference to a domain object, bound by its identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    /// Entity type, e.g. `"customer"`.
    pub kind: String,
    /// Identifier bound in place of the entity.
    pub id: String,
}

impl EntityRef {
    /// Creates a reference to entity `id` of type `kind`.
    ///
    /// # Examples
    ///
    /// ```
    /// use sqlx_named_rows::{EntityRef, Value};
    ///
    /// let owner = EntityRef::new("customer", "C-17");
    /// assert_eq!(Value::from(owner).to_string(), "C-17");
    /// ```
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

/// A value as seen by callers: bind arguments, row fields, render hook input.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Int(i32),
    Long(i64),
    Double(f64),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    /// A timestamp carrying its own offset; bound as wall-clock time in that offset.
    TimestampTz(DateTime<FixedOffset>),
    Blob(Vec<u8>),
    Clob(String),
    Ref(EntityRef),
}

impl Value {
    /// `true` for [`Value::Null`] only; an empty string is not null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::String(_) => "string",
            Value::Int(_) => "integer",
            Value::Long(_) => "long",
            Value::Double(_) => "double",
            Value::Bool(_) => "boolean",
            Value::Date(_) => "date",
            Value::Timestamp(_) => "timestamp",
            Value::TimestampTz(_) => "timestamp with time zone",
            Value::Blob(_) => "blob",
            Value::Clob(_) => "clob",
            Value::Ref(_) => "reference",
        }
    }

    /// Borrows the text of a string or clob value.
    ///
    /// # Examples
    ///
    /// ```
    /// use sqlx_named_rows::Value;
    ///
    /// assert_eq!(Value::from("abc").as_str(), Some("abc"));
    /// assert_eq!(Value::Int(1).as_str(), None);
    /// ```
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Clob(s) => Some(s),
            _ => None,
        }
    }

    /// Widens an integer or long value. No parsing or float truncation.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::String(s) | Value::Clob(s) => f.write_str(s),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Date(v) => write!(f, "{v}"),
            Value::Timestamp(v) => write!(f, "{v}"),
            Value::TimestampTz(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Blob(v) => write!(f, "<{} bytes>", v.len()),
            Value::Ref(r) => f.write_str(&r.id),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

impl_from! {
    String => String,
    &str => String,
    i32 => Int,
    i64 => Long,
    f64 => Double,
    bool => Bool,
    NaiveDate => Date,
    NaiveDateTime => Timestamp,
    DateTime<FixedOffset> => TimestampTz,
    Vec<u8> => Blob,
    EntityRef => Ref,
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Declared SQL type of a bind slot. Used for typed nulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Varchar,
    Integer,
    BigInt,
    Double,
    Boolean,
    Date,
    Timestamp,
    Blob,
    Clob,
}

/// A driver-level parameter, the result of one bind call.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null(SqlType),
    String(String),
    Int(i32),
    Long(i64),
    Double(f64),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    Bytes(Vec<u8>),
    Text(String),
}

impl SqlParam {
    pub fn sql_type(&self) -> SqlType {
        match self {
            SqlParam::Null(ty) => *ty,
            SqlParam::String(_) => SqlType::Varchar,
            SqlParam::Int(_) => SqlType::Integer,
            SqlParam::Long(_) => SqlType::BigInt,
            SqlParam::Double(_) => SqlType::Double,
            SqlParam::Bool(_) => SqlType::Boolean,
            SqlParam::Date(_) => SqlType::Date,
            SqlParam::Timestamp(_) => SqlType::Timestamp,
            SqlParam::Bytes(_) => SqlType::Blob,
            SqlParam::Text(_) => SqlType::Clob,
        }
    }
}

pub const DEFAULT_DATE_PATTERN: &str = "%Y-%m-%d";
pub const DEFAULT_TIMESTAMP_PATTERN: &str = "%Y-%m-%d %H:%M:%S";

/// Target type for [`crate::bind::extract`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueType {
    String,
    Integer,
    Long,
    Double,
    Boolean,
    /// Strings are parsed with the given `chrono` format.
    Date(String),
    Timestamp(String),
    Bytes,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::String => f.write_str("string"),
            ValueType::Integer => f.write_str("integer"),
            ValueType::Long => f.write_str("long"),
            ValueType::Double => f.write_str("double"),
            ValueType::Boolean => f.write_str("boolean"),
            ValueType::Date(p) => write!(f, "date({p})"),
            ValueType::Timestamp(p) => write!(f, "timestamp({p})"),
            ValueType::Bytes => f.write_str("bytes"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_conversions() {
        assert_eq!(Value::from("a"), Value::String("a".into()));
        assert_eq!(Value::from(5), Value::Int(5));
        assert_eq!(Value::from(5i64), Value::Long(5));
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(Some(true)), Value::Bool(true));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::Blob(vec![1, 2, 3]).to_string(), "<3 bytes>");
        assert_eq!(Value::Ref(EntityRef::new("user", "u-1")).to_string(), "u-1");
    }

    #[test]
    fn test_sql_type_of_params() {
        assert_eq!(SqlParam::Null(SqlType::Date).sql_type(), SqlType::Date);
        assert_eq!(SqlParam::Text("x".into()).sql_type(), SqlType::Clob);
    }
}
