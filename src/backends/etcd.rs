//! etcd backend over the v2 keys API.

use super::{ChangeFeed, Fetched, WatchedBackend};
use crate::error::{ConfigError, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

const INDEX_HEADER: &str = "X-Etcd-Index";

/// The requested watch index was compacted away.
const EVENT_INDEX_CLEARED: u32 = 401;

/// A backend over etcd's v2 keys API.
pub type EtcdBackend = WatchedBackend<EtcdFeed>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Node {
    value: Option<String>,
    modified_index: u64,
}

#[derive(Debug, Deserialize)]
struct KeyResponse {
    action: String,
    node: Node,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error_code: u32,
    message: String,
    #[serde(default)]
    index: u64,
}

impl KeyResponse {
    fn value(self) -> Option<Vec<u8>> {
        match self.action.as_str() {
            "delete" | "expire" | "compareAndDelete" => None,
            _ => self.node.value.map(String::into_bytes),
        }
    }
}

/// Reads and watches keys through etcd's v2 keys API.
///
/// The cursor is the next modification index to wait for. It starts right
/// after the cluster index observed by the initial read, and moves to one
/// past each event's `modifiedIndex`, so no event is delivered twice.
///
/// # Examples
///
/// ```rust,no_run
/// use distconfig::backends::EtcdFeed;
///
/// # fn example() -> distconfig::error::Result<()> {
/// let feed = EtcdFeed::builder()
///     .with_address("http://etcd.internal:2379")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct EtcdFeed {
    address: String,
    client: Client,
    watch_timeout: Duration,
}

impl EtcdFeed {
    /// Create a new builder for constructing an etcd feed.
    pub fn builder() -> EtcdFeedBuilder {
        EtcdFeedBuilder::new()
    }

    fn key_url(&self, key: &str) -> String {
        format!(
            "{}/v2/keys/{}",
            self.address.trim_end_matches('/'),
            key.trim_start_matches('/')
        )
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        request
            .send()
            .await
            .map_err(|e| ConfigError::Backend(format!("etcd request failed: {}", e)))
    }

    async fn error_body(response: Response) -> Result<ErrorResponse> {
        let status = response.status();
        response.json().await.map_err(|_| {
            ConfigError::Backend(format!(
                "etcd request failed with status {}: {}",
                status,
                status.canonical_reason().unwrap_or("Unknown")
            ))
        })
    }

    async fn key_body(response: Response) -> Result<KeyResponse> {
        response
            .json()
            .await
            .map_err(|e| ConfigError::Backend(format!("Invalid etcd response: {}", e)))
    }
}

fn parse_index(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(INDEX_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

#[async_trait]
impl ChangeFeed for EtcdFeed {
    type Cursor = u64;

    fn name(&self) -> &'static str {
        "etcd"
    }

    async fn fetch(&self, key: &str) -> Result<Fetched<u64>> {
        let response = self.send(self.client.get(self.key_url(key))).await?;
        let header_index = parse_index(&response);

        if response.status().is_success() {
            let body = Self::key_body(response).await?;
            let index = header_index.unwrap_or(body.node.modified_index);
            return Ok(Fetched {
                value: body.value(),
                cursor: index + 1,
            });
        }

        let error = Self::error_body(response).await?;
        if error.error_code == 100 {
            // Key not found.
            let index = header_index.unwrap_or(error.index);
            return Ok(Fetched {
                value: None,
                cursor: index + 1,
            });
        }
        Err(ConfigError::Backend(format!(
            "etcd error {}: {}",
            error.error_code, error.message
        )))
    }

    async fn wait_for_change(&self, key: &str, cursor: &mut u64) -> Result<Option<Vec<u8>>> {
        let request = self
            .client
            .get(self.key_url(key))
            .query(&[("wait", "true".to_string()), ("waitIndex", cursor.to_string())])
            .timeout(self.watch_timeout);
        let response = self
            .send(request)
            .await
            .map_err(|e| ConfigError::WatchError(e.to_string()))?;

        if response.status() == StatusCode::OK {
            let body = Self::key_body(response)
                .await
                .map_err(|e| ConfigError::WatchError(e.to_string()))?;
            *cursor = body.node.modified_index + 1;
            return Ok(body.value());
        }

        let error = Self::error_body(response)
            .await
            .map_err(|e| ConfigError::WatchError(e.to_string()))?;
        if error.error_code == EVENT_INDEX_CLEARED {
            // History is gone: re-read and resume from the current index.
            tracing::warn!(key, index = *cursor, "etcd watch index cleared, re-reading key");
            let fetched = self
                .fetch(key)
                .await
                .map_err(|e| ConfigError::WatchError(e.to_string()))?;
            *cursor = fetched.cursor;
            return Ok(fetched.value);
        }
        Err(ConfigError::WatchError(format!(
            "etcd error {}: {}",
            error.error_code, error.message
        )))
    }
}

/// Builder for constructing an `EtcdFeed`.
pub struct EtcdFeedBuilder {
    address: String,
    timeout: Duration,
    watch_timeout: Duration,
}

impl EtcdFeedBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            address: "http://127.0.0.1:2379".to_string(),
            timeout: Duration::from_secs(10),
            watch_timeout: Duration::from_secs(300),
        }
    }

    /// Set the member address. Default is `http://127.0.0.1:2379`.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Set the timeout of plain reads. Default is 10 seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set how long a watch request may stay open. Default is 5 minutes.
    ///
    /// An expired watch is retried from the same index.
    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }

    /// Build the etcd feed.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn build(self) -> Result<EtcdFeed> {
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| ConfigError::Backend(format!("Failed to create HTTP client: {}", e)))?;

        Ok(EtcdFeed {
            address: self.address,
            client,
            watch_timeout: self.watch_timeout,
        })
    }
}

impl Default for EtcdFeedBuilder {
    fn default() -> Self {
        Self::new()
    }
}
