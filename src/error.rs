/// Boxed error type returned by row handlers and driver implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error types for sqlx-named-rows
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error while compiling the placeholder pattern
    #[error("Failed to parse SQL template: {0}")]
    Parse(#[from] regex::Error),

    /// A value was bound to a name that does not occur in the query
    #[error("Parameter ':{0}' does not occur in the query")]
    UnknownParameter(String),

    /// Placeholder was referenced but never received a value
    #[error("Placeholder ':{0}' was not bound before execution")]
    UnboundPlaceholder(String),

    /// A positional bind was outside `1..=count`
    #[error("Parameter index {index} is out of range (query has {count} placeholders)")]
    ParameterIndex { index: usize, count: usize },

    /// The driver rejected a bind call
    #[error("Failed to bind parameter {position}: {message}")]
    Bind { position: usize, message: String },

    /// A column value could not be coerced to its declared type
    #[error("Cannot convert {value} to {target}")]
    Extract { value: String, target: String },

    /// A column descriptor could not be parsed
    #[error("Invalid column token '{token}': {reason}")]
    InvalidColumnToken { token: String, reason: String },

    /// An API was used in a state that does not allow it
    #[error("Usage error: {0}")]
    Usage(String),

    /// A single-row query matched nothing
    #[error("Query returned no rows")]
    NoRows,

    /// A unique-row query matched more than one row
    #[error("Query returned {0} rows where exactly one was expected")]
    NonUniqueResult(usize),

    /// A connection could not be obtained
    #[error("Connection error: {0}")]
    Connection(String),

    /// Configuration was incomplete or inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error raised by a driver implementation
    #[error("Driver error: {0}")]
    Driver(#[source] BoxError),

    /// Error from SQLx database operations
    #[cfg(feature = "mysql")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A row callback failed in serial iteration
    #[error("Row handler failed: {0}")]
    Handler(#[source] BoxError),

    /// The operation observed a cancellation request
    #[error("Operation was cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn extract(value: impl std::fmt::Display, target: impl std::fmt::Display) -> Self {
        Error::Extract {
            value: value.to_string(),
            target: target.to_string(),
        }
    }

    pub(crate) fn token(token: &str, reason: impl Into<String>) -> Self {
        Error::InvalidColumnToken {
            token: token.to_owned(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for [`Error::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Result type alias for sqlx-named-rows operations
pub type Result<T> = std::result::Result<T, Error>;
