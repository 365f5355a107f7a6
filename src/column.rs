//! Column descriptors: which row field to read, how to coerce it, and what to
//! call it in the projected row.
//!
//! A descriptor token has the form `base[:type[:format]]`:
//!
//! | token                         | reads    | produces                       |
//! |-------------------------------|----------|--------------------------------|
//! | `name`                        | `name`   | value as returned by the driver |
//! | `amount:long`                 | `amount` | [`Value::Long`]                |
//! | `active:boolean`              | `active` | [`Value::Bool`]                |
//! | `born:date:%d/%m/%Y`          | `born`   | [`Value::Date`]                |
//! | `seen:timestamp`              | `seen`   | [`Value::Timestamp`]           |
//!
//! The format is everything after the second colon, so time patterns such as
//! `%H:%M` can be used as-is.

use crate::bind::extract;
use crate::driver::Row;
use crate::error::Error;
use crate::value::{Value, ValueType, DEFAULT_DATE_PATTERN, DEFAULT_TIMESTAMP_PATTERN};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Coercion applied to a column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeHint {
    /// Leave the driver value untouched.
    Native,
    String,
    Integer,
    Long,
    Double,
    Boolean,
    Date(String),
    Timestamp(String),
    Clob,
    Bytes,
}

impl TypeHint {
    fn parse(token: &str, name: &str, format: Option<&str>) -> crate::Result<Self> {
        let takes_format = matches!(name, "date" | "timestamp");
        if format.is_some() && !takes_format {
            return Err(Error::token(token, format!("type '{name}' does not take a format")));
        }
        let hint = match name {
            "string" | "str" => TypeHint::String,
            "int" | "integer" => TypeHint::Integer,
            "long" => TypeHint::Long,
            "double" | "float" => TypeHint::Double,
            "boolean" | "bool" => TypeHint::Boolean,
            "date" => TypeHint::Date(format.unwrap_or(DEFAULT_DATE_PATTERN).to_owned()),
            "timestamp" => {
                TypeHint::Timestamp(format.unwrap_or(DEFAULT_TIMESTAMP_PATTERN).to_owned())
            }
            "clob" => TypeHint::Clob,
            "blob" | "bytes" => TypeHint::Bytes,
            _ => return Err(Error::token(token, format!("unknown type '{name}'"))),
        };
        Ok(hint)
    }

    /// Target type for extraction, or `None` for [`TypeHint::Native`].
    pub fn value_type(&self) -> Option<ValueType> {
        let target = match self {
            TypeHint::Native => return None,
            TypeHint::String | TypeHint::Clob => ValueType::String,
            TypeHint::Integer => ValueType::Integer,
            TypeHint::Long => ValueType::Long,
            TypeHint::Double => ValueType::Double,
            TypeHint::Boolean => ValueType::Boolean,
            TypeHint::Date(p) => ValueType::Date(p.clone()),
            TypeHint::Timestamp(p) => ValueType::Timestamp(p.clone()),
            TypeHint::Bytes => ValueType::Bytes,
        };
        Some(target)
    }
}

/// A parsed column descriptor token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnToken {
    source: String,
    base: String,
    hint: TypeHint,
    target: Option<ValueType>,
}

impl ColumnToken {
    /// Parses `base[:type[:format]]`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidColumnToken`] for an empty base, an unknown type, or a
    /// format without a type.
    pub fn parse(token: &str) -> crate::Result<Self> {
        let mut parts = token.splitn(3, ':');
        let base = parts.next().unwrap_or_default().trim();
        if base.is_empty() {
            return Err(Error::token(token, "column name is empty"));
        }
        let hint = match parts.next().map(str::trim) {
            None => TypeHint::Native,
            Some("") => match parts.next().map(str::trim) {
                None | Some("") => TypeHint::Native,
                Some(_) => return Err(Error::token(token, "format given without a type")),
            },
            Some(name) => TypeHint::parse(token, &name.to_ascii_lowercase(), parts.next())?,
        };
        let target = hint.value_type();
        Ok(Self {
            source: token.to_owned(),
            base: base.to_owned(),
            hint,
            target,
        })
    }

    /// The token text this was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The row field this token reads.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn hint(&self) -> &TypeHint {
        &self.hint
    }

    /// Reads the base field from `row` and applies the type hint.
    ///
    /// An absent field resolves to [`Value::Null`]. Field lookup falls back to a
    /// case-insensitive match.
    pub fn resolve(&self, row: &Row) -> crate::Result<Value> {
        let raw = row.get_ignore_case(&self.base).unwrap_or(&Value::Null);
        match &self.target {
            Some(target) => extract(raw, target),
            None => Ok(raw.clone()),
        }
    }
}

impl FromStr for ColumnToken {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ColumnToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Post-extraction transform applied to a resolved column value.
pub type RenderHook = Arc<dyn Fn(Value) -> crate::Result<Value> + Send + Sync>;

/// Named render hooks, referenced by the `renderScript` key of a map descriptor.
#[derive(Clone, Default)]
pub struct RenderRegistry {
    hooks: HashMap<String, RenderHook>,
}

impl RenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, hook: F) -> &mut Self
    where
        F: Fn(Value) -> crate::Result<Value> + Send + Sync + 'static,
    {
        self.hooks.insert(name.into(), Arc::new(hook));
        self
    }

    pub fn get(&self, name: &str) -> Option<RenderHook> {
        self.hooks.get(name).cloned()
    }
}

impl fmt::Debug for RenderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.hooks.keys().collect();
        names.sort();
        f.debug_struct("RenderRegistry").field("hooks", &names).finish()
    }
}

/// A column description owned by a surrounding report definition.
///
/// Configs built from one keep a reference to it; its field and header take
/// precedence over the token's base name, but not over explicitly set values.
pub trait ReportColumn: Send + Sync {
    /// The descriptor token, `base[:type[:format]]`.
    fn column(&self) -> &str;

    fn field(&self) -> Option<&str> {
        None
    }

    fn header(&self) -> Option<&str> {
        None
    }
}

/// One output field of a projected row.
///
/// Configs are immutable: every `with_*` method returns a new config, so a list
/// of configs can be shared by all rows and all worker threads of a query.
#[derive(Clone)]
pub struct ColumnConfig {
    token: ColumnToken,
    fallback: Option<ColumnToken>,
    field: Option<String>,
    header: Option<String>,
    render: Option<RenderHook>,
    report: Option<Arc<dyn ReportColumn>>,
}

impl fmt::Debug for ColumnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnConfig")
            .field("token", &self.token.source)
            .field("fallback", &self.fallback.as_ref().map(ColumnToken::source))
            .field("field", &self.field_name())
            .field("header", &self.header())
            .field("render", &self.render.is_some())
            .finish()
    }
}

impl ColumnConfig {
    /// Builds a config from a descriptor token.
    ///
    /// ```
    /// use sqlx_named_rows::{ColumnConfig, Row, Value};
    ///
    /// let config = ColumnConfig::new("amount:long")?;
    /// let row = Row::from_pairs([("amount", "42")]);
    /// assert_eq!(config.resolve(&row)?, Value::Long(42));
    /// assert_eq!(config.field_name(), "amount");
    /// assert_eq!(config.header(), "amount");
    /// # Ok::<(), sqlx_named_rows::Error>(())
    /// ```
    pub fn new(token: &str) -> crate::Result<Self> {
        Ok(Self::from_token(ColumnToken::parse(token)?))
    }

    pub fn from_token(token: ColumnToken) -> Self {
        Self {
            token,
            fallback: None,
            field: None,
            header: None,
            render: None,
            report: None,
        }
    }

    /// Wraps a report column. The report object is shared, not copied.
    pub fn from_report(report: Arc<dyn ReportColumn>) -> crate::Result<Self> {
        let token = ColumnToken::parse(report.column())?;
        Ok(Self {
            report: Some(report),
            ..Self::from_token(token)
        })
    }

    /// Builds a config from a key/value descriptor with the keys `column`
    /// (required), `ifEmpty`, `field`, `header` and `renderScript`.
    pub fn from_map(
        map: &BTreeMap<String, String>,
        registry: &RenderRegistry,
    ) -> crate::Result<Self> {
        let mut config = match map.get("column") {
            Some(column) => Self::new(column)?,
            None => return Err(Error::Config("column descriptor has no 'column' key".into())),
        };
        for (key, value) in map {
            match key.as_str() {
                "column" => {}
                "ifEmpty" => config.fallback = Some(ColumnToken::parse(value)?),
                "field" => config.field = Some(value.clone()),
                "header" => config.header = Some(value.clone()),
                "renderScript" => {
                    let hook = registry.get(value).ok_or_else(|| {
                        Error::Config(format!("no render hook registered as '{value}'"))
                    })?;
                    config.render = Some(hook);
                }
                other => {
                    return Err(Error::Config(format!(
                        "unknown column descriptor key '{other}'"
                    )))
                }
            }
        }
        Ok(config)
    }

    pub fn token(&self) -> &ColumnToken {
        &self.token
    }

    pub fn fallback(&self) -> Option<&ColumnToken> {
        self.fallback.as_ref()
    }

    /// Key of this column in the projected row: an explicitly set field, then the
    /// report column's field, then the token's base name.
    pub fn field_name(&self) -> &str {
        self.field
            .as_deref()
            .or_else(|| self.report.as_deref().and_then(|r| r.field()))
            .unwrap_or(self.token.base())
    }

    /// Display header: an explicitly set header, then the report column's header,
    /// then [`field_name`](Self::field_name).
    pub fn header(&self) -> &str {
        self.header
            .as_deref()
            .or_else(|| self.report.as_deref().and_then(|r| r.header()))
            .unwrap_or_else(|| self.field_name())
    }

    pub fn with_field(&self, field: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            ..self.clone()
        }
    }

    pub fn with_header(&self, header: impl Into<String>) -> Self {
        Self {
            header: Some(header.into()),
            ..self.clone()
        }
    }

    pub fn with_fallback(&self, token: &str) -> crate::Result<Self> {
        Ok(Self {
            fallback: Some(ColumnToken::parse(token)?),
            ..self.clone()
        })
    }

    pub fn with_render<F>(&self, hook: F) -> Self
    where
        F: Fn(Value) -> crate::Result<Value> + Send + Sync + 'static,
    {
        Self {
            render: Some(Arc::new(hook)),
            ..self.clone()
        }
    }

    /// Resolves this column against `row`: primary token, then the fallback if
    /// the primary is null, then the render hook.
    pub fn resolve(&self, row: &Row) -> crate::Result<Value> {
        let mut value = self.token.resolve(row)?;
        if value.is_null() {
            if let Some(fallback) = &self.fallback {
                value = fallback.resolve(row)?;
            }
        }
        match &self.render {
            Some(render) => render(value),
            None => Ok(value),
        }
    }
}

/// Any of the accepted ways to describe a column.
#[derive(Clone)]
pub enum ColumnSpec {
    Token(String),
    Map(BTreeMap<String, String>),
    Config(ColumnConfig),
    Report(Arc<dyn ReportColumn>),
}

impl ColumnSpec {
    pub fn into_config(self, registry: &RenderRegistry) -> crate::Result<ColumnConfig> {
        match self {
            ColumnSpec::Token(token) => ColumnConfig::new(&token),
            ColumnSpec::Map(map) => ColumnConfig::from_map(&map, registry),
            ColumnSpec::Config(config) => Ok(config),
            ColumnSpec::Report(report) => ColumnConfig::from_report(report),
        }
    }
}

impl From<&str> for ColumnSpec {
    fn from(token: &str) -> Self {
        ColumnSpec::Token(token.to_owned())
    }
}

impl From<String> for ColumnSpec {
    fn from(token: String) -> Self {
        ColumnSpec::Token(token)
    }
}

impl From<BTreeMap<String, String>> for ColumnSpec {
    fn from(map: BTreeMap<String, String>) -> Self {
        ColumnSpec::Map(map)
    }
}

impl From<ColumnConfig> for ColumnSpec {
    fn from(config: ColumnConfig) -> Self {
        ColumnSpec::Config(config)
    }
}

impl From<&ColumnConfig> for ColumnSpec {
    fn from(config: &ColumnConfig) -> Self {
        ColumnSpec::Config(config.clone())
    }
}

impl From<Arc<dyn ReportColumn>> for ColumnSpec {
    fn from(report: Arc<dyn ReportColumn>) -> Self {
        ColumnSpec::Report(report)
    }
}

/// How a raw cursor row becomes the row handed to callers.
#[derive(Debug, Clone, Default)]
pub enum Projection {
    /// Pass the cursor row through unchanged.
    #[default]
    Raw,
    Columns {
        configs: Arc<[ColumnConfig]>,
        names: Arc<[String]>,
    },
}

impl Projection {
    pub fn from_configs(configs: Vec<ColumnConfig>) -> Self {
        let names = configs
            .iter()
            .map(|c| c.field_name().to_owned())
            .collect();
        Projection::Columns {
            configs: configs.into(),
            names,
        }
    }

    /// Builds a column projection from any mix of descriptor formats.
    pub fn columns<I, S>(specs: I, registry: &RenderRegistry) -> crate::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<ColumnSpec>,
    {
        let configs = specs
            .into_iter()
            .map(|spec| spec.into().into_config(registry))
            .collect::<crate::Result<Vec<_>>>()?;
        Ok(Self::from_configs(configs))
    }

    pub fn apply(&self, row: Row) -> crate::Result<Row> {
        match self {
            Projection::Raw => Ok(row),
            Projection::Columns { configs, names } => {
                let values = configs
                    .iter()
                    .map(|config| config.resolve(&row))
                    .collect::<crate::Result<Vec<_>>>()?;
                Ok(Row::new(Arc::clone(names), values))
            }
        }
    }

    /// Display headers, or `None` for a raw projection.
    pub fn headers(&self) -> Option<Vec<&str>> {
        match self {
            Projection::Raw => None,
            Projection::Columns { configs, .. } => {
                Some(configs.iter().map(ColumnConfig::header).collect())
            }
        }
    }
}
