//! Consul KV backend.

use super::{ChangeFeed, Fetched, WatchedBackend};
use crate::error::{ConfigError, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::time::Duration;

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// A backend over Consul's KV store.
pub type ConsulBackend = WatchedBackend<ConsulFeed>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    value: Option<String>,
}

/// Reads and watches keys through Consul's KV HTTP API.
///
/// Changes are detected with blocking queries: the cursor is the
/// `X-Consul-Index` of the last response and each wait asks Consul to hold
/// the request until the index moves past it.
///
/// # Examples
///
/// ```rust,no_run
/// use distconfig::backends::ConsulFeed;
/// use std::time::Duration;
///
/// # fn example() -> distconfig::error::Result<()> {
/// let feed = ConsulFeed::builder()
///     .with_address("http://consul.internal:8500")
///     .with_token("secret-token")
///     .with_wait(Duration::from_secs(60))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ConsulFeed {
    address: String,
    client: Client,
    token: Option<String>,
    datacenter: Option<String>,
    wait: Duration,
}

impl ConsulFeed {
    /// Create a new builder for constructing a Consul feed.
    pub fn builder() -> ConsulFeedBuilder {
        ConsulFeedBuilder::new()
    }

    fn kv_url(&self, key: &str) -> String {
        format!(
            "{}/v1/kv/{}",
            self.address.trim_end_matches('/'),
            key.trim_start_matches('/')
        )
    }

    fn request(&self, key: &str, index: Option<u64>) -> RequestBuilder {
        let mut query = Vec::new();
        if let Some(dc) = &self.datacenter {
            query.push(("dc", dc.clone()));
        }

        let mut request = self.client.get(self.kv_url(key));
        if let Some(index) = index {
            query.push(("index", index.to_string()));
            query.push(("wait", format!("{}s", self.wait.as_secs())));
            // Consul adds up to wait/16 of jitter before answering.
            request = request.timeout(self.wait + self.wait / 16 + Duration::from_secs(5));
        }
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        request.query(&query)
    }

    /// Run a (possibly blocking) KV read and return the value and index.
    async fn query(&self, key: &str, index: Option<u64>) -> Result<(Option<Vec<u8>>, u64)> {
        let response = self
            .request(key, index)
            .send()
            .await
            .map_err(|e| ConfigError::Backend(format!("Consul request failed: {}", e)))?;

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => Ok((None, parse_index(response.headers())?)),
            status if status.is_success() => {
                let index = parse_index(response.headers())?;
                let entries: Vec<KvEntry> = response.json().await.map_err(|e| {
                    ConfigError::Backend(format!("Invalid Consul KV response: {}", e))
                })?;
                Ok((decode_entries(entries)?, index))
            }
            status => Err(ConfigError::Backend(format!(
                "Consul request failed with status {}: {}",
                status,
                status.canonical_reason().unwrap_or("Unknown")
            ))),
        }
    }
}

#[async_trait]
impl ChangeFeed for ConsulFeed {
    type Cursor = u64;

    fn name(&self) -> &'static str {
        "consul"
    }

    async fn fetch(&self, key: &str) -> Result<Fetched<u64>> {
        let (value, index) = self.query(key, None).await?;
        Ok(Fetched {
            value,
            cursor: index,
        })
    }

    async fn wait_for_change(&self, key: &str, cursor: &mut u64) -> Result<Option<Vec<u8>>> {
        loop {
            let (value, index) = self
                .query(key, Some(*cursor))
                .await
                .map_err(|e| ConfigError::WatchError(e.to_string()))?;

            if index < *cursor {
                // Index went backwards (e.g. snapshot restore): start over.
                tracing::warn!(key, index, previous = *cursor, "Consul index went backwards");
                *cursor = 0;
                continue;
            }
            if index == *cursor {
                // Wait elapsed without a change.
                continue;
            }

            *cursor = index;
            return Ok(value);
        }
    }
}

/// Read the index of a KV response. Without it a blocking query cannot
/// block, so its absence is an error.
fn parse_index(headers: &HeaderMap) -> Result<u64> {
    headers
        .get(INDEX_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| {
            ConfigError::Backend(format!("Consul response lacks a valid {} header", INDEX_HEADER))
        })
}

/// Decode the value of a KV read. A null value counts as absent.
fn decode_entries(entries: Vec<KvEntry>) -> Result<Option<Vec<u8>>> {
    let Some(encoded) = entries.into_iter().next().and_then(|entry| entry.value) else {
        return Ok(None);
    };
    STANDARD
        .decode(encoded)
        .map(Some)
        .map_err(|e| ConfigError::Backend(format!("Invalid base64 value from Consul: {}", e)))
}

/// Builder for constructing a `ConsulFeed`.
pub struct ConsulFeedBuilder {
    address: String,
    token: Option<String>,
    datacenter: Option<String>,
    wait: Duration,
    timeout: Duration,
}

impl ConsulFeedBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
            datacenter: None,
            wait: Duration::from_secs(300),
            timeout: Duration::from_secs(10),
        }
    }

    /// Set the agent address. Default is `http://127.0.0.1:8500`.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Set the ACL token sent with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Query a specific datacenter.
    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    /// Set how long Consul may hold a blocking query. Default is 5 minutes.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Set the timeout of plain reads. Default is 10 seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the Consul feed.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn build(self) -> Result<ConsulFeed> {
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| ConfigError::Backend(format!("Failed to create HTTP client: {}", e)))?;

        Ok(ConsulFeed {
            address: self.address,
            client,
            token: self.token,
            datacenter: self.datacenter,
            wait: self.wait,
        })
    }
}

impl Default for ConsulFeedBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn feed(server: &MockServer) -> ConsulFeed {
        ConsulFeed::builder()
            .with_address(server.base_url())
            .with_wait(Duration::from_secs(1))
            .build()
            .unwrap()
    }

    fn entry(value: &str) -> serde_json::Value {
        json!([{
            "Key": "app",
            "Flags": 0,
            "Value": STANDARD.encode(value),
            "CreateIndex": 3,
            "ModifyIndex": 7
        }])
    }

    #[test]
    fn test_builder_defaults() {
        let feed = ConsulFeed::builder().build().unwrap();
        assert_eq!(feed.kv_url("/app/config"), "http://127.0.0.1:8500/v1/kv/app/config");
        assert_eq!(feed.wait, Duration::from_secs(300));
    }

    #[test]
    fn test_decode_null_value() {
        let entries = vec![KvEntry { value: None }];
        assert_eq!(decode_entries(entries).unwrap(), None);
        assert_eq!(decode_entries(Vec::new()).unwrap(), None);
    }

    #[test]
    fn test_decode_invalid_base64() {
        let entries = vec![KvEntry {
            value: Some("%%%".to_string()),
        }];
        assert!(decode_entries(entries).is_err());
    }

    #[tokio::test]
    async fn test_fetch_existing_key() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/kv/app");
                then.status(200)
                    .header(INDEX_HEADER, "7")
                    .json_body(entry(r#"{"foo": "bar"}"#));
            })
            .await;

        let fetched = feed(&server).fetch("app").await.unwrap();
        assert_eq!(fetched.value.as_deref(), Some(&br#"{"foo": "bar"}"#[..]));
        assert_eq!(fetched.cursor, 7);
    }

    #[tokio::test]
    async fn test_fetch_missing_key() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/kv/missing");
                then.status(404).header(INDEX_HEADER, "12");
            })
            .await;

        let fetched = feed(&server).fetch("missing").await.unwrap();
        assert!(fetched.value.is_none());
        assert_eq!(fetched.cursor, 12);
    }

    #[tokio::test]
    async fn test_fetch_server_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/kv/app");
                then.status(500);
            })
            .await;

        assert!(matches!(
            feed(&server).fetch("app").await,
            Err(ConfigError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn test_blocking_query_advances_cursor() {
        let server = MockServer::start_async().await;
        let watch = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/kv/app")
                    .query_param("index", "7")
                    .query_param("wait", "1s");
                then.status(200)
                    .header(INDEX_HEADER, "9")
                    .json_body(entry(r#"{"foo": "baz"}"#));
            })
            .await;

        let mut cursor = 7;
        let value = feed(&server).wait_for_change("app", &mut cursor).await.unwrap();
        assert_eq!(value.as_deref(), Some(&br#"{"foo": "baz"}"#[..]));
        assert_eq!(cursor, 9);
        watch.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_index_is_a_watch_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/kv/app").query_param("index", "7");
                then.status(200).json_body(entry(r#"{"foo": "baz"}"#));
            })
            .await;

        let mut cursor = 7;
        let result = feed(&server).wait_for_change("app", &mut cursor).await;
        assert!(matches!(result, Err(ConfigError::WatchError(_))));
        assert_eq!(cursor, 7);
    }

    #[tokio::test]
    async fn test_fetch_without_index_fails() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/kv/app");
                then.status(404);
            })
            .await;

        assert!(matches!(
            feed(&server).fetch("app").await,
            Err(ConfigError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn test_token_is_sent() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/kv/app")
                    .header(TOKEN_HEADER, "secret");
                then.status(404).header(INDEX_HEADER, "1");
            })
            .await;

        let feed = ConsulFeed::builder()
            .with_address(server.base_url())
            .with_token("secret")
            .build()
            .unwrap();
        feed.fetch("app").await.unwrap();
        mock.assert_async().await;
    }
}
