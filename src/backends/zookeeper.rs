//! ZooKeeper backend.
//!
//! ZooKeeper watches are one-shot and edge-triggered: a watch fires once and
//! must be re-armed by the next read. The feed re-arms on every event,
//! choosing a data watch when the node exists and an existence watch when it
//! does not.
//!
//! No ZooKeeper client is bundled. Implement [`ZooKeeperClient`] over the
//! client of your choice.

use super::{ChangeFeed, Fetched, WatchedBackend};
use crate::error::Result;
use async_trait::async_trait;

/// A backend over a ZooKeeper client.
pub type ZooKeeperBackend<C> = WatchedBackend<ZooKeeperFeed<C>>;

/// Event delivered by a fired watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// The node was created.
    Created,
    /// The node was deleted.
    Deleted,
    /// The node's data changed.
    DataChanged,
    /// Any other event, e.g. a session state change.
    Other,
}

/// Kind of watch currently armed on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZnodeWatch {
    /// Data watch on an existing node.
    Data,
    /// Existence watch on a missing node.
    Existence,
    /// No watch: the last one fired and re-arming it failed.
    Unarmed,
}

/// The ZooKeeper operations the feed needs.
///
/// Retries of connection loss are the client's business; any error returned
/// here is treated as transient by the watch loop.
#[async_trait]
pub trait ZooKeeperClient: Send + Sync + 'static {
    /// Read the data of `path` and leave a data watch on it.
    /// Returns `None` without a watch if the node does not exist.
    async fn get_and_watch(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Check whether `path` exists and leave an existence watch on it.
    async fn exists_and_watch(&self, path: &str) -> Result<bool>;

    /// Wait for the next watch on `path` to fire.
    async fn next_event(&self, path: &str) -> Result<NodeEvent>;
}

/// Reads znodes and follows them through one-shot watches.
///
/// Between an event firing and the watch being re-armed the node may change
/// again; such a change is folded into the value read while re-arming.
pub struct ZooKeeperFeed<C> {
    client: C,
}

impl<C: ZooKeeperClient> ZooKeeperFeed<C> {
    /// Wrap a started client.
    pub fn new(client: C) -> Self {
        Self { client }
    }

    /// The wrapped client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Read `path` and arm the watch matching its state.
    async fn arm(&self, path: &str) -> Result<(Option<Vec<u8>>, ZnodeWatch)> {
        loop {
            if let Some(data) = self.client.get_and_watch(path).await? {
                return Ok((Some(data), ZnodeWatch::Data));
            }
            if !self.client.exists_and_watch(path).await? {
                return Ok((None, ZnodeWatch::Existence));
            }
            // Created between the two calls.
        }
    }
}

#[async_trait]
impl<C: ZooKeeperClient> ChangeFeed for ZooKeeperFeed<C> {
    type Cursor = ZnodeWatch;

    fn name(&self) -> &'static str {
        "zookeeper"
    }

    async fn fetch(&self, key: &str) -> Result<Fetched<ZnodeWatch>> {
        let (value, cursor) = self.arm(key).await?;
        Ok(Fetched { value, cursor })
    }

    async fn wait_for_change(
        &self,
        key: &str,
        cursor: &mut ZnodeWatch,
    ) -> Result<Option<Vec<u8>>> {
        if *cursor == ZnodeWatch::Unarmed {
            // Any change since the watch fired is only visible by reading.
            let (value, watch) = self.arm(key).await?;
            *cursor = watch;
            return Ok(value);
        }

        // A fired watch is consumed; until re-armed nothing else will fire.
        let event = self.client.next_event(key).await;
        let armed = std::mem::replace(cursor, ZnodeWatch::Unarmed);
        let event = event?;
        tracing::debug!(key, ?event, watch = ?armed, "ZooKeeper watch fired");

        let (value, watch) = match event {
            NodeEvent::Deleted => {
                if self.client.exists_and_watch(key).await? {
                    self.arm(key).await?
                } else {
                    (None, ZnodeWatch::Existence)
                }
            }
            _ => self.arm(key).await?,
        };
        *cursor = watch;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Calls {
        gets: usize,
        exists: usize,
    }

    struct FakeClient {
        data: Mutex<Option<Vec<u8>>>,
        calls: Mutex<Calls>,
        armed: Mutex<bool>,
        failing_gets: Mutex<usize>,
        sender: mpsc::UnboundedSender<NodeEvent>,
        events: tokio::sync::Mutex<mpsc::UnboundedReceiver<NodeEvent>>,
    }

    impl FakeClient {
        fn new(data: Option<&str>) -> (Self, mpsc::UnboundedSender<NodeEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let client = Self {
                data: Mutex::new(data.map(|d| d.as_bytes().to_vec())),
                calls: Mutex::new(Calls::default()),
                armed: Mutex::new(false),
                failing_gets: Mutex::new(0),
                sender: tx.clone(),
                events: tokio::sync::Mutex::new(rx),
            };
            (client, tx)
        }

        fn set(&self, data: Option<&str>) {
            *self.data.lock() = data.map(|d| d.as_bytes().to_vec());
        }

        /// Write like a server would: only an armed watch fires, once.
        fn write(&self, data: &str) {
            self.set(Some(data));
            if std::mem::replace(&mut *self.armed.lock(), false) {
                self.sender.send(NodeEvent::DataChanged).unwrap();
            }
        }
    }

    #[async_trait]
    impl ZooKeeperClient for FakeClient {
        async fn get_and_watch(&self, _path: &str) -> Result<Option<Vec<u8>>> {
            self.calls.lock().gets += 1;
            {
                let mut failing = self.failing_gets.lock();
                if *failing > 0 {
                    *failing -= 1;
                    return Err(ConfigError::WatchError("connection loss".to_string()));
                }
            }
            let data = self.data.lock().clone();
            if data.is_some() {
                *self.armed.lock() = true;
            }
            Ok(data)
        }

        async fn exists_and_watch(&self, _path: &str) -> Result<bool> {
            self.calls.lock().exists += 1;
            *self.armed.lock() = true;
            Ok(self.data.lock().is_some())
        }

        async fn next_event(&self, _path: &str) -> Result<NodeEvent> {
            self.events
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| ConfigError::WatchError("session closed".to_string()))
        }
    }

    #[tokio::test]
    async fn test_fetch_existing_node_arms_data_watch() {
        let (client, _events) = FakeClient::new(Some("{}"));
        let feed = ZooKeeperFeed::new(client);

        let fetched = feed.fetch("/app").await.unwrap();
        assert_eq!(fetched.value.as_deref(), Some(&b"{}"[..]));
        assert_eq!(fetched.cursor, ZnodeWatch::Data);
        assert_eq!(feed.client().calls.lock().exists, 0);
    }

    #[tokio::test]
    async fn test_fetch_missing_node_arms_existence_watch() {
        let (client, _events) = FakeClient::new(None);
        let feed = ZooKeeperFeed::new(client);

        let fetched = feed.fetch("/app").await.unwrap();
        assert!(fetched.value.is_none());
        assert_eq!(fetched.cursor, ZnodeWatch::Existence);
    }

    #[tokio::test]
    async fn test_deleted_event_goes_straight_to_existence_watch() {
        let (client, events) = FakeClient::new(Some("{}"));
        let feed = ZooKeeperFeed::new(client);
        let Fetched { mut cursor, .. } = feed.fetch("/app").await.unwrap();

        feed.client().set(None);
        events.send(NodeEvent::Deleted).unwrap();

        let value = feed.wait_for_change("/app", &mut cursor).await.unwrap();
        assert!(value.is_none());
        assert_eq!(cursor, ZnodeWatch::Existence);
        // Only the initial fetch read data.
        assert_eq!(feed.client().calls.lock().gets, 1);
    }

    #[tokio::test]
    async fn test_created_event_rearms_data_watch() {
        let (client, events) = FakeClient::new(None);
        let feed = ZooKeeperFeed::new(client);
        let Fetched { mut cursor, .. } = feed.fetch("/app").await.unwrap();

        feed.client().set(Some(r#"{"a": 1}"#));
        events.send(NodeEvent::Created).unwrap();

        let value = feed.wait_for_change("/app", &mut cursor).await.unwrap();
        assert_eq!(value.as_deref(), Some(&br#"{"a": 1}"#[..]));
        assert_eq!(cursor, ZnodeWatch::Data);
    }

    #[tokio::test]
    async fn test_recreated_before_rearm_reads_new_data() {
        let (client, events) = FakeClient::new(Some("old"));
        let feed = ZooKeeperFeed::new(client);
        let Fetched { mut cursor, .. } = feed.fetch("/app").await.unwrap();

        // Deleted, then recreated before the watch is re-armed.
        feed.client().set(Some("new"));
        events.send(NodeEvent::Deleted).unwrap();

        let value = feed.wait_for_change("/app", &mut cursor).await.unwrap();
        assert_eq!(value.as_deref(), Some(&b"new"[..]));
        assert_eq!(cursor, ZnodeWatch::Data);
    }

    #[tokio::test]
    async fn test_closed_session_is_an_error() {
        let (client, events) = FakeClient::new(Some("{}"));
        let feed = ZooKeeperFeed::new(client);
        drop(events);

        let mut cursor = ZnodeWatch::Data;
        assert!(feed.wait_for_change("/app", &mut cursor).await.is_err());
        assert_eq!(cursor, ZnodeWatch::Unarmed);
    }

    #[tokio::test]
    async fn test_failed_rearm_is_retried_before_waiting() {
        let (client, _events) = FakeClient::new(Some("v1"));
        let feed = ZooKeeperFeed::new(client);
        let Fetched { mut cursor, .. } = feed.fetch("/app").await.unwrap();

        // The watch fires, then the re-arming read hits a connection loss.
        *feed.client().failing_gets.lock() = 1;
        feed.client().write("v2");
        assert!(feed.wait_for_change("/app", &mut cursor).await.is_err());
        assert_eq!(cursor, ZnodeWatch::Unarmed);

        // No watch is armed, so the next wait must read instead of blocking.
        let wait = feed.wait_for_change("/app", &mut cursor);
        let value = tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .expect("wait blocked without an armed watch")
            .unwrap();
        assert_eq!(value.as_deref(), Some(&b"v2"[..]));
        assert_eq!(cursor, ZnodeWatch::Data);

        feed.client().write("v3");
        let wait = feed.wait_for_change("/app", &mut cursor);
        let value = tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .expect("change after recovery was not delivered")
            .unwrap();
        assert_eq!(value.as_deref(), Some(&b"v3"[..]));
    }
}
