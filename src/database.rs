//! Database handle and changes requests.

use crate::change::{ChangeEvent, Changes};
use crate::client::Client;
use crate::error::CouchError;
use crate::session::FeedSession;
use crate::stream::{ChangeStream, DEFAULT_CHANNEL_CAPACITY};
use crate::types::{FeedMode, Sequence};
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use std::time::Duration;

/// Query parameter names
const PARAM_FEED: &str = "feed";
const PARAM_SINCE: &str = "since";
const PARAM_FILTER: &str = "filter";
const PARAM_HEARTBEAT: &str = "heartbeat";
const PARAM_TIMEOUT: &str = "timeout";
const PARAM_INCLUDE_DOCS: &str = "include_docs";
const PARAM_LIMIT: &str = "limit";
const PARAM_STYLE: &str = "style";

/// A handle to a database.
///
/// This is a lightweight, cloneable object - not a persistent connection.
/// Operations make HTTP requests on demand.
#[derive(Clone, Debug)]
pub struct Database {
    pub(crate) url: String,
    pub(crate) client: Client,
}

impl Database {
    /// Get the database URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get the database name (the last path segment of its URL).
    pub fn name(&self) -> &str {
        self.url.rsplit('/').next().unwrap_or(&self.url)
    }

    /// Fetch the changes since `options.since` in one response.
    ///
    /// Uses `feed=normal`, or `feed=longpoll` when
    /// [`ChangeOptions::long_poll`] is set, in which case the server holds
    /// the response until at least one change is available.
    pub async fn changes(&self, options: &ChangeOptions) -> Result<Changes, CouchError> {
        let mode = if options.long_poll {
            FeedMode::LongPoll
        } else {
            FeedMode::Normal
        };

        let resp = self.request_changes(mode, options).await?;
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Open a continuous feed, calling `on_event` once per change.
    ///
    /// Returns once the server has accepted the request; changes are then
    /// delivered from a background task until the session is closed or the
    /// server ends the response. See [`FeedSession`] for the delivery and
    /// shutdown guarantees.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let session = db
    ///     .continuous_changes(&ChangeOptions::new().since(Sequence::new(10)).heartbeat(Duration::from_secs(30)), |change| {
    ///         println!("{} changed at {}", change.id, change.seq);
    ///     })
    ///     .await?;
    /// // ...
    /// session.shutdown().await;
    /// ```
    pub async fn continuous_changes<F>(
        &self,
        options: &ChangeOptions,
        on_event: F,
    ) -> Result<FeedSession, CouchError>
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let resp = self.request_changes(FeedMode::Continuous, options).await?;
        tracing::debug!(url = %self.url, since = ?options.since, "continuous changes feed accepted");
        Ok(FeedSession::open(resp.bytes_stream(), on_event)?)
    }

    /// Open a continuous feed consumed as a [`ChangeStream`].
    pub async fn change_stream(&self, options: &ChangeOptions) -> Result<ChangeStream, CouchError> {
        self.change_stream_with_capacity(options, DEFAULT_CHANNEL_CAPACITY)
            .await
    }

    /// Open a continuous feed consumed as a [`ChangeStream`] buffering up
    /// to `capacity` events ahead of the consumer.
    pub async fn change_stream_with_capacity(
        &self,
        options: &ChangeOptions,
        capacity: usize,
    ) -> Result<ChangeStream, CouchError> {
        let resp = self.request_changes(FeedMode::Continuous, options).await?;
        tracing::debug!(url = %self.url, since = ?options.since, "continuous changes stream accepted");
        Ok(ChangeStream::open(resp.bytes_stream(), capacity)?)
    }

    pub(crate) fn changes_url(&self) -> String {
        format!("{}/_changes", self.url)
    }

    /// Issue a changes request, retrying transient failures.
    async fn request_changes(
        &self,
        mode: FeedMode,
        options: &ChangeOptions,
    ) -> Result<reqwest::Response, CouchError> {
        let retry = &self.client.retry;
        let mut attempt = 0;

        loop {
            match self.send_changes_request(mode, options).await {
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_retryable() && retry.should_retry(attempt) => {
                    let delay = retry.delay_for(attempt, err.retry_after());
                    tracing::debug!(attempt, ?delay, error = %err, "retrying changes request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_changes_request(
        &self,
        mode: FeedMode,
        options: &ChangeOptions,
    ) -> Result<reqwest::Response, CouchError> {
        let url = self.changes_url();

        let mut req = self
            .client
            .inner
            .get(&url)
            .query(&options.query_pairs(mode))
            .header(ACCEPT, "application/json")
            .headers(self.client.request_headers());

        for (key, value) in &options.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        // Responses that wait for changes must not be cut off by the
        // one-shot request timeout.
        if !mode.waits_for_changes() {
            if let Some(timeout) = self.client.request_timeout {
                req = req.timeout(timeout);
            }
        }

        let resp = req.send().await?;
        let status = resp.status();

        if status.is_success() {
            return Ok(resp);
        }

        let retry_after = retry_after(resp.headers());
        let body = resp.text().await.unwrap_or_default();
        Err(CouchError::from_response(status.as_u16(), &url, &body).with_retry_after(retry_after))
    }
}

/// `Retry-After` given in seconds. The HTTP-date form is ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Options for a changes request.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct ChangeOptions {
    /// Only changes after this sequence are returned.
    pub since: Option<Sequence>,
    /// Server-side filter function, as `"designdoc/filtername"`.
    pub filter: Option<String>,
    /// Interval at which the server sends a blank keep-alive line.
    pub heartbeat: Option<Duration>,
    /// Idle time after which the server ends the response.
    pub timeout: Option<Duration>,
    /// Attach the document to every change.
    pub include_docs: bool,
    /// Maximum number of changes to return.
    pub limit: Option<u64>,
    /// List every leaf revision, not only the winning one.
    pub conflicts: bool,
    /// Use `feed=longpoll` for [`Database::changes`].
    pub long_poll: bool,
    /// Extra headers sent with this request only.
    pub headers: Vec<(String, String)>,
}

impl ChangeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn since(mut self, since: Sequence) -> Self {
        self.since = Some(since);
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = Some(interval);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn include_docs(mut self, include: bool) -> Self {
        self.include_docs = include;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn conflicts(mut self, conflicts: bool) -> Self {
        self.conflicts = conflicts;
        self
    }

    pub fn long_poll(mut self, long_poll: bool) -> Self {
        self.long_poll = long_poll;
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Query parameters for a request in the given feed mode.
    pub(crate) fn query_pairs(&self, mode: FeedMode) -> Vec<(&'static str, String)> {
        let mut params = vec![(PARAM_FEED, mode.to_query_value().to_string())];

        if let Some(since) = self.since {
            params.push((PARAM_SINCE, since.to_query_value()));
        }
        if let Some(filter) = self.filter.as_deref().filter(|f| !f.is_empty()) {
            params.push((PARAM_FILTER, filter.to_string()));
        }
        if let Some(heartbeat) = self.heartbeat {
            params.push((PARAM_HEARTBEAT, heartbeat.as_millis().to_string()));
        }
        if let Some(timeout) = self.timeout {
            params.push((PARAM_TIMEOUT, timeout.as_millis().to_string()));
        }
        if self.include_docs {
            params.push((PARAM_INCLUDE_DOCS, "true".to_string()));
        }
        if let Some(limit) = self.limit {
            params.push((PARAM_LIMIT, limit.to_string()));
        }
        if self.conflicts {
            params.push((PARAM_STYLE, "all_docs".to_string()));
        }

        params
    }
}
