//! Where connections come from.

use crate::driver::Connection;
use crate::error::Error;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Opens connections for the query façade and for parallel row handlers.
///
/// Providers are shared across worker threads, so they must be `Send + Sync`.
pub trait ConnectionProvider: Send + Sync + 'static {
    type Connection: Connection;

    fn open(&self) -> crate::Result<Self::Connection>;
}

impl<P> ConnectionProvider for Arc<P>
where
    P: ConnectionProvider,
{
    type Connection = P::Connection;

    fn open(&self) -> crate::Result<Self::Connection> {
        (**self).open()
    }
}

/// A provider backed by a caller-supplied callback.
///
/// ```
/// use sqlx_named_rows::memory::MemoryProvider;
/// use sqlx_named_rows::provider::{ConnectionProvider, FnProvider};
///
/// let memory = MemoryProvider::new();
/// let provider = FnProvider::new(move || memory.open());
/// assert!(provider.open().is_ok());
/// ```
pub struct FnProvider<F> {
    open: F,
}

impl<F> FnProvider<F> {
    pub fn new(open: F) -> Self {
        Self { open }
    }
}

impl<F, C> ConnectionProvider for FnProvider<F>
where
    F: Fn() -> crate::Result<C> + Send + Sync + 'static,
    C: Connection,
{
    type Connection = C;

    fn open(&self) -> crate::Result<C> {
        (self.open)()
    }
}

/// Passwords of the form `ENC(<payload>)` are decrypted before use.
pub const ENCRYPTED_PREFIX: &str = "ENC(";
const ENCRYPTED_SUFFIX: &str = ")";

/// Turns the payload of an `ENC(...)` password into the clear-text password.
pub trait PasswordDecryptor: Send + Sync {
    fn decrypt(&self, payload: &str) -> crate::Result<String>;
}

/// Treats the payload as standard base64. This is the default decryptor.
#[derive(Debug, Default, Clone, Copy)]
pub struct Base64Decryptor;

impl PasswordDecryptor for Base64Decryptor {
    fn decrypt(&self, payload: &str) -> crate::Result<String> {
        let bytes = STANDARD
            .decode(payload.trim())
            .map_err(|e| Error::Config(format!("encrypted password is not valid base64: {e}")))?;
        String::from_utf8(bytes)
            .map_err(|_| Error::Config("encrypted password is not valid UTF-8".into()))
    }
}

/// Connection settings, built with [`ConnectOptions::builder`] or read from the
/// environment with [`ConnectOptions::from_env`].
#[derive(Clone)]
pub struct ConnectOptions {
    url: String,
    username: Option<String>,
    password: Option<SecretString>,
    attributes: BTreeMap<String, String>,
    max_connections: u32,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("attributes", &self.attributes)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl ConnectOptions {
    pub fn builder() -> ConnectOptionsBuilder {
        ConnectOptionsBuilder::default()
    }

    /// Reads `DATABASE_URL` (required), `DATABASE_USER`, `DATABASE_PASSWORD` and
    /// `DATABASE_MAX_CONNECTIONS`.
    pub fn from_env() -> crate::Result<Self> {
        let mut builder = Self::builder();
        if let Ok(url) = std::env::var("DATABASE_URL") {
            builder = builder.url(url);
        }
        if let Ok(user) = std::env::var("DATABASE_USER") {
            builder = builder.username(user);
        }
        if let Ok(password) = std::env::var("DATABASE_PASSWORD") {
            builder = builder.password(password);
        }
        if let Ok(max) = std::env::var("DATABASE_MAX_CONNECTIONS") {
            let max = max.parse().map_err(|_| {
                Error::Config(format!("DATABASE_MAX_CONNECTIONS is not a number: {max}"))
            })?;
            builder = builder.max_connections(max);
        }
        builder.build()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// The clear-text password, already decrypted.
    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.expose_secret())
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }
}

/// Fluent builder for [`ConnectOptions`]. Nothing is validated until [`build`](Self::build).
#[derive(Default)]
pub struct ConnectOptionsBuilder {
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    attributes: BTreeMap<String, String>,
    max_connections: Option<u32>,
    decryptor: Option<Arc<dyn PasswordDecryptor>>,
}

impl ConnectOptionsBuilder {
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the password, optionally in `ENC(...)` form.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn decryptor(mut self, decryptor: Arc<dyn PasswordDecryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    pub fn build(self) -> crate::Result<ConnectOptions> {
        let url = self
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| Error::Config("a database url is required".into()))?;
        let max_connections = self.max_connections.unwrap_or(10);
        if max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }

        let password = match self.password {
            Some(raw) => {
                let clear = match encrypted_payload(&raw) {
                    Some(payload) => {
                        let decryptor = self
                            .decryptor
                            .unwrap_or_else(|| Arc::new(Base64Decryptor));
                        decryptor.decrypt(payload)?
                    }
                    None => raw,
                };
                Some(SecretString::from(clear))
            }
            None => None,
        };

        Ok(ConnectOptions {
            url,
            username: self.username,
            password,
            attributes: self.attributes,
            max_connections,
        })
    }
}

fn encrypted_payload(password: &str) -> Option<&str> {
    password
        .strip_prefix(ENCRYPTED_PREFIX)
        .and_then(|rest| rest.strip_suffix(ENCRYPTED_SUFFIX))
}
