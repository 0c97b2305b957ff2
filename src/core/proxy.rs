//! Entry point handing out live configuration trees.

use crate::backends::Backend;
use crate::core::{ConfigTree, Mapping, ProxyBuilder};
use crate::error::Result;
use crate::notify::Listener;
use parking_lot::Mutex;
use std::sync::Arc;

/// Hands out [`ConfigTree`]s that follow their key in a backend.
///
/// Every tree returned by [`get_config`](Self::get_config) is registered
/// with the backend and replaced in place whenever the backend reports a
/// change of its key, together with every nested view taken from it.
///
/// # Examples
///
/// ```rust,no_run
/// use distconfig::prelude::*;
/// use distconfig::backends::{MemoryBackend, MemoryStore};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<()> {
/// let store = MemoryStore::new();
/// store.set("service", r#"{"db": {"pool": 4}}"#);
///
/// let proxy = ConfigProxy::new(MemoryBackend::new(
///     store.clone(),
///     Arc::new(TokioExecutor::current()?),
/// ));
/// let config = proxy.get_config("service").await?;
/// let db = config.get_config("db", None)?;
/// assert_eq!(db.get_int("pool", None)?, 4);
///
/// // Later writes show up in both views.
/// store.set("service", r#"{"db": {"pool": 8}}"#);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConfigProxy {
    backend: Arc<dyn Backend>,
}

impl ConfigProxy {
    /// Wrap a backend.
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    /// Wrap a shared backend.
    pub fn from_arc(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Create a builder that assembles a proxy from settings.
    pub fn builder() -> ProxyBuilder {
        ProxyBuilder::new()
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Read `key` and return a tree that stays current with it.
    ///
    /// A missing key yields an empty tree that fills in once the key is
    /// created. Each call returns a new tree with its own registration.
    ///
    /// The tree is registered before the key is read, so a change reported
    /// while the read is in flight is never lost. When such a change arrives
    /// first, the older value read here is discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be read or parsed, or if its watch
    /// loop cannot be started.
    pub async fn get_config(&self, key: &str) -> Result<ConfigTree> {
        let tree = ConfigTree::new(Mapping::new());
        let notified = Arc::new(Mutex::new(false));

        let listener = {
            let target = tree.clone();
            let notified = Arc::clone(&notified);
            let watched = key.to_string();
            Listener::new(move |changed: &str, data: &Arc<Mapping>| {
                if changed == watched {
                    let mut notified = notified.lock();
                    *notified = true;
                    target.invalidate(Arc::clone(data));
                }
                Ok(())
            })
        };
        self.backend.add_listener(listener.clone());

        let data = match self.backend.get(key).await {
            Ok(data) => data,
            Err(err) => {
                let _ = self.backend.remove_listener(&listener);
                return Err(err);
            }
        };

        {
            let notified = notified.lock();
            if *notified {
                tracing::debug!(key, "Change arrived during initial read");
            } else {
                tree.invalidate(data);
            }
        }

        tracing::debug!(key, "Registered config tree");
        Ok(tree)
    }
}

impl std::fmt::Debug for ConfigProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigProxy")
            .field("listeners", &self.backend.listeners().len())
            .finish()
    }
}
