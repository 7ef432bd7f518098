//! HTTP client and configuration.

use crate::database::Database;
use crate::error::InvalidHeaderError;
use crate::retry::RetryConfig;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_USER_AGENT: &str = concat!("couch-changes/", env!("CARGO_PKG_VERSION"));

/// Keep-alive probes for idle continuous feeds between heartbeats.
const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_secs(60);

type HeaderProvider = Arc<dyn Fn() -> HeaderMap + Send + Sync>;

/// A client for a CouchDB-compatible server.
///
/// The client is cheap to clone and can be shared across threads; clones
/// share one connection pool.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: reqwest::Client,
    base_url: Option<String>,
    headers: HeaderMap,
    header_provider: Option<HeaderProvider>,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) retry: RetryConfig,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url)
            .field("headers", &self.headers)
            .field("has_header_provider", &self.header_provider.is_some())
            .field("request_timeout", &self.request_timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a new client with default settings.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client fails to build. Use `Client::builder().build()`
    /// for fallible construction.
    pub fn new() -> Self {
        ClientBuilder::new()
            .build()
            .expect("Failed to build default HTTP client")
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Get a handle to a database. No request is made.
    ///
    /// `db` is either a full URL (`http://localhost:5984/inventory`) or,
    /// when a base URL is configured, a database name (`inventory`).
    pub fn database(&self, db: &str) -> Database {
        Database {
            url: self.resolve(db),
            client: self.clone(),
        }
    }

    fn resolve(&self, db: &str) -> String {
        if db.starts_with("http://") || db.starts_with("https://") {
            return db.trim_end_matches('/').to_string();
        }
        match &self.base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), db.trim_matches('/')),
            None => db.to_string(),
        }
    }

    /// Headers for one request: the configured ones, overridden by whatever
    /// the header provider returns right now.
    pub(crate) fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        if let Some(provider) = &self.header_provider {
            headers.extend(provider());
        }
        headers
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_header(key: &str, value: &str) -> Result<(HeaderName, HeaderValue), InvalidHeaderError> {
    let name = HeaderName::from_bytes(key.as_bytes())
        .map_err(|_| InvalidHeaderError::InvalidName(key.to_string()))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| InvalidHeaderError::InvalidValue(value.to_string()))?;
    Ok((name, value))
}

/// Builder for configuring a [`Client`].
#[must_use = "builders do nothing unless you call .build()"]
pub struct ClientBuilder {
    base_url: Option<String>,
    headers: HeaderMap,
    header_provider: Option<HeaderProvider>,
    user_agent: String,
    request_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    tcp_keepalive: Option<Duration>,
    retry: RetryConfig,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            base_url: None,
            headers: HeaderMap::new(),
            header_provider: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout: None,
            connect_timeout: None,
            tcp_keepalive: Some(DEFAULT_TCP_KEEPALIVE),
            retry: RetryConfig::default(),
        }
    }

    /// Set the server URL that database names are resolved against.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Add a header sent with every request.
    ///
    /// Invalid header names or values are silently ignored. Use
    /// [`try_default_header`](Self::try_default_header) if you need error handling.
    pub fn default_header(mut self, key: &str, value: &str) -> Self {
        if let Ok((name, value)) = parse_header(key, value) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Add a header sent with every request, rejecting invalid ones.
    pub fn try_default_header(mut self, key: &str, value: &str) -> Result<Self, InvalidHeaderError> {
        let (name, value) = parse_header(key, value)?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Replace all headers sent with every request.
    pub fn default_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Compute extra headers per request, e.g. a short-lived token.
    /// They take precedence over the default headers.
    pub fn header_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> HeaderMap + Send + Sync + 'static,
    {
        self.header_provider = Some(Arc::new(provider));
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set the timeout for one-shot requests.
    ///
    /// Continuous and long-poll feeds stay open until the server has
    /// something to send and are not subject to it; bound them with
    /// [`ChangeOptions::timeout`](crate::ChangeOptions::timeout) instead.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the TCP connect timeout, which applies to every request.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the TCP keep-alive interval, or `None` to disable it.
    pub fn tcp_keepalive(mut self, interval: Option<Duration>) -> Self {
        self.tcp_keepalive = interval;
        self
    }

    /// Set the retry policy for opening changes requests.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Build the client.
    ///
    /// Returns an error if the underlying HTTP client fails to build
    /// (e.g., due to TLS configuration issues).
    pub fn build(self) -> Result<Client, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .user_agent(self.user_agent)
            .tcp_keepalive(self.tcp_keepalive)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }

        Ok(Client {
            inner: builder.build()?,
            base_url: self.base_url,
            headers: self.headers,
            header_provider: self.header_provider,
            request_timeout: self.request_timeout,
            retry: self.retry,
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
