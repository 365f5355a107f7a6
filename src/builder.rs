use regex::{Captures, Regex};
use std::collections::HashMap;

/// Quoted literals are matched first so that a colon inside `'...'` or `"..."` is
/// copied through untouched. An unterminated quote runs to the end of the input.
const PLACEHOLDER_PATTERN: &str = r#"'[^']*'?|"[^"]*"?|:([A-Za-z_][A-Za-z0-9_]*)"#;

/// Converts named placeholders (`:name`) to positional placeholders (`?`).
///
/// Colons inside quoted literals and colons that are not followed by an identifier
/// character are left as they are.
///
/// # Examples
///
/// ```
/// use sqlx_named_rows::builder::build_query;
///
/// let sql = build_query("SELECT * FROM users WHERE id = :id AND tag <> 'a:b'")?;
/// assert_eq!(sql, "SELECT * FROM users WHERE id = ? AND tag <> 'a:b'");
/// # Ok::<(), sqlx_named_rows::Error>(())
/// ```
pub fn build_query(template: &str) -> crate::Result<String> {
    let mut positions = HashMap::new();
    translate(template, &mut positions)
}

/// Translates `template` and records the 1-based position of every placeholder
/// under its name, in the order the placeholders appear.
///
/// A name used more than once collects one position per occurrence.
pub fn translate(
    template: &str,
    positions: &mut HashMap<String, Vec<usize>>,
) -> crate::Result<String> {
    let regex = Regex::new(PLACEHOLDER_PATTERN)?;
    let mut position = 0;
    let sql = regex.replace_all(template, |caps: &Captures<'_>| match caps.get(1) {
        Some(name) => {
            position += 1;
            positions
                .entry(name.as_str().to_owned())
                .or_default()
                .push(position);
            "?".to_owned()
        }
        None => caps[0].to_owned(),
    });
    Ok(sql.into_owned())
}

/// A query template translated to positional SQL.
///
/// Built once when a statement is prepared and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedQuery {
    template: String,
    sql: String,
    positions: HashMap<String, Vec<usize>>,
    order: Vec<String>,
}

impl NamedQuery {
    /// Parses a template containing `:name` placeholders.
    ///
    /// # Examples
    ///
    /// ```
    /// use sqlx_named_rows::NamedQuery;
    ///
    /// let query = NamedQuery::parse("select * from t where a = :x and b = :x")?;
    /// assert_eq!(query.sql(), "select * from t where a = ? and b = ?");
    /// assert_eq!(query.positions("x"), Some(&[1, 2][..]));
    /// # Ok::<(), sqlx_named_rows::Error>(())
    /// ```
    pub fn parse<T>(template: T) -> crate::Result<Self>
    where
        T: Into<String>,
    {
        let template = template.into();
        let mut positions = HashMap::new();
        let sql = translate(&template, &mut positions)?;

        let count = positions.values().map(Vec::len).sum();
        let mut order = vec![String::new(); count];
        for (name, slots) in &positions {
            for &slot in slots {
                order[slot - 1].clone_from(name);
            }
        }

        Ok(Self {
            template,
            sql,
            positions,
            order,
        })
    }

    /// The template as it was written.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// The translated SQL with `?` placeholders.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Positions bound by `name`, or `None` if the name does not occur.
    pub fn positions(&self, name: &str) -> Option<&[usize]> {
        self.positions.get(name).map(Vec::as_slice)
    }

    /// Total number of positional placeholders.
    pub fn placeholder_count(&self) -> usize {
        self.order.len()
    }

    /// Name of the placeholder at a 1-based position.
    pub fn name_at(&self, position: usize) -> Option<&str> {
        position
            .checked_sub(1)
            .and_then(|i| self.order.get(i))
            .map(String::as_str)
    }

    /// Distinct parameter names in order of first appearance.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::with_capacity(self.positions.len());
        for name in &self.order {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
        names
    }
}
