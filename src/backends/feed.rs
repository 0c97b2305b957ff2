//! The fetch/watch primitives a coordination service must provide.

use crate::error::Result;
use async_trait::async_trait;

/// Result of reading a key: its raw value and where to resume watching.
#[derive(Debug)]
pub struct Fetched<C> {
    /// Raw payload, `None` if the key does not exist.
    pub value: Option<Vec<u8>>,
    /// Position right after this read, used to seed the watch loop.
    pub cursor: C,
}

/// Fetch and change-detection primitives of a coordination service.
///
/// Implement this trait to plug a new service into
/// [`WatchedBackend`](super::WatchedBackend), which supplies the listener
/// registry and the per-key watch loop.
///
/// The cursor carries whatever the service needs to resume watching without
/// missing or replaying a change: a modification index for long-poll APIs,
/// the kind of watch currently armed for edge-triggered ones, a
/// subscription for in-process stores.
#[async_trait]
pub trait ChangeFeed: Send + Sync + 'static {
    /// Watch position carried from one wait to the next.
    type Cursor: Send + 'static;

    /// Short name used in logs, e.g. `"consul"`.
    fn name(&self) -> &'static str;

    /// Read the current value of `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the service cannot be reached or answers with an
    /// unexpected response. A missing key is not an error.
    async fn fetch(&self, key: &str) -> Result<Fetched<Self::Cursor>>;

    /// Read the current value of `key` without preparing a watch.
    ///
    /// Used for keys whose watch loop is already running. The default
    /// fetches and drops the cursor; override it when setting up a cursor
    /// is costly.
    ///
    /// # Errors
    ///
    /// Same as [`fetch`](Self::fetch).
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.fetch(key).await.map(|fetched| fetched.value)
    }

    /// Block until `key` changes, then return its new raw value, `None` if
    /// the key was deleted.
    ///
    /// On success `cursor` must have been advanced past the returned change.
    ///
    /// # Errors
    ///
    /// Any error is treated as transient: the watch loop logs it and calls
    /// this method again with the same cursor.
    async fn wait_for_change(&self, key: &str, cursor: &mut Self::Cursor)
    -> Result<Option<Vec<u8>>>;
}
