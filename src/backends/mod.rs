//! Configuration backends.
//!
//! A [`Backend`] serves raw values for keys and owns the
//! [`ListenerRegistry`] that changes are broadcast through. Every concrete
//! backend is a [`WatchedBackend`] over a service-specific [`ChangeFeed`]:
//!
//! - [`MemoryStore`]: in-process store
//! - `ConsulFeed`: Consul KV blocking queries (feature `remote`)
//! - `EtcdFeed`: etcd v2 keys API long polls (feature `remote`)
//! - [`ZooKeeperFeed`]: ZooKeeper data and existence watches over a client you provide
//! - `FileFeed`: one file per key, watched with `notify` (feature `file-watch`)

mod feed;
mod memory;
mod zookeeper;

#[cfg(feature = "remote")]
mod consul;
#[cfg(feature = "remote")]
mod etcd;

#[cfg(feature = "file-watch")]
mod file;

pub use feed::{ChangeFeed, Fetched};
pub use memory::{MemoryBackend, MemoryStore};
pub use zookeeper::{NodeEvent, ZnodeWatch, ZooKeeperBackend, ZooKeeperClient, ZooKeeperFeed};

#[cfg(feature = "remote")]
pub use consul::{ConsulBackend, ConsulFeed, ConsulFeedBuilder};
#[cfg(feature = "remote")]
pub use etcd::{EtcdBackend, EtcdFeed, EtcdFeedBuilder};

#[cfg(feature = "file-watch")]
pub use file::{FileBackend, FileCursor, FileFeed};

use crate::core::{Mapping, Parser, parser};
use crate::error::Result;
use crate::notify::{Executor, Listener, ListenerRegistry, WatchOptions, WatchSupervisor};
use async_trait::async_trait;
use std::sync::Arc;

/// A source of configuration values that reports changes to listeners.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Read the raw value of `key`, `None` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be read.
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// The registry changes are broadcast through.
    fn listeners(&self) -> &ListenerRegistry;

    /// Read and parse `key`. A missing key yields an empty mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be read or parsed.
    async fn get(&self, key: &str) -> Result<Mapping> {
        let raw = self.get_raw(key).await?;
        self.listeners().parse(raw.as_deref())
    }

    /// Register a change listener. See [`ListenerRegistry::add`].
    fn add_listener(&self, listener: Listener) {
        self.listeners().add(listener);
    }

    /// Remove a change listener. See [`ListenerRegistry::remove`].
    ///
    /// # Errors
    ///
    /// Returns an error if the listener is not registered.
    fn remove_listener(&self, listener: &Listener) -> Result<()> {
        self.listeners().remove(listener)
    }

    /// Broadcast a new raw value of `key`. See [`ListenerRegistry::notify`].
    ///
    /// # Errors
    ///
    /// Returns an error if parsing fails or a listener fails.
    fn notify_listeners(&self, key: &str, raw: Option<&[u8]>) -> Result<()> {
        self.listeners().notify(key, raw)
    }
}

/// A backend over a [`ChangeFeed`], watching every key it has served.
///
/// The first read of a key starts a background watch loop for it through the
/// supervisor; later reads reuse that loop and go through
/// [`ChangeFeed::read`].
///
/// # Examples
///
/// ```rust,no_run
/// use distconfig::backends::{Backend, MemoryStore, WatchedBackend};
/// use distconfig::notify::TokioExecutor;
/// use std::sync::Arc;
///
/// # async fn example() -> distconfig::error::Result<()> {
/// let store = MemoryStore::new();
/// store.set("app", r#"{"port": 8080}"#);
///
/// let backend = WatchedBackend::new(store.clone(), Arc::new(TokioExecutor::current()?));
/// let data = backend.get("app").await?;
/// assert_eq!(data.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct WatchedBackend<F: ChangeFeed> {
    feed: Arc<F>,
    listeners: ListenerRegistry,
    supervisor: WatchSupervisor,
}

impl<F: ChangeFeed> WatchedBackend<F> {
    /// Create a backend parsing JSON with default watch options.
    pub fn new(feed: F, executor: Arc<dyn Executor>) -> Self {
        Self::with_options(feed, executor, parser::json(), WatchOptions::default())
    }

    /// Create a backend with an explicit parser and watch options.
    pub fn with_options(
        feed: F,
        executor: Arc<dyn Executor>,
        parser: Parser,
        options: WatchOptions,
    ) -> Self {
        Self {
            feed: Arc::new(feed),
            listeners: ListenerRegistry::with_parser(parser),
            supervisor: WatchSupervisor::new(executor, options),
        }
    }

    /// The underlying feed.
    pub fn feed(&self) -> &F {
        &self.feed
    }

    /// The supervisor running this backend's watch loops.
    pub fn supervisor(&self) -> &WatchSupervisor {
        &self.supervisor
    }
}

#[async_trait]
impl<F: ChangeFeed> Backend for WatchedBackend<F> {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if self.supervisor.is_watching(key) {
            return self.feed.read(key).await;
        }
        let Fetched { value, cursor } = self.feed.fetch(key).await?;
        self.supervisor
            .ensure_watching(&self.feed, key, cursor, &self.listeners)?;
        Ok(value)
    }

    fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }
}
