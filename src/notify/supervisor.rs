//! Per-key watch loops that survive transient failures.

use crate::backends::ChangeFeed;
use crate::error::Result;
use crate::notify::{Executor, ListenerRegistry};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{Instrument, Span};

#[cfg(feature = "metrics")]
use crate::metrics::WatchMetrics;

/// Counters for a single watch loop.
#[derive(Debug, Default)]
pub struct WatchStats {
    notifications: AtomicU64,
    transient_errors: AtomicU64,
    broadcast_failures: AtomicU64,
}

impl WatchStats {
    /// Changes observed and broadcast.
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::SeqCst)
    }

    /// Failed waits. Each one was logged and the watch was re-entered.
    pub fn transient_errors(&self) -> u64 {
        self.transient_errors.load(Ordering::SeqCst)
    }

    /// Broadcasts that failed to parse or had a failing listener.
    pub fn broadcast_failures(&self) -> u64 {
        self.broadcast_failures.load(Ordering::SeqCst)
    }
}

/// Options shared by every watch loop of a supervisor.
#[derive(Clone)]
pub struct WatchOptions {
    retry_delay: Duration,
    span: Span,
    #[cfg(feature = "metrics")]
    metrics: Option<WatchMetrics>,
}

impl WatchOptions {
    /// Default options: immediate retry, events recorded in a `distconfig` span.
    pub fn new() -> Self {
        Self {
            retry_delay: Duration::ZERO,
            span: tracing::info_span!("distconfig"),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Pause between a failed wait and the next one.
    ///
    /// Default is zero: the loop re-enters the wait right away.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Span that watch loop events are recorded in.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Record watch metrics.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: WatchMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The configured retry delay.
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::new()
    }
}

struct SupervisorInner {
    executor: Arc<dyn Executor>,
    options: WatchOptions,
    watched: Mutex<HashMap<String, Arc<WatchStats>>>,
}

/// Starts and tracks one background watch loop per key.
///
/// A loop blocks in [`ChangeFeed::wait_for_change`], broadcasts every change
/// through the backend's [`ListenerRegistry`], and on failure logs the error
/// and waits again. Loops are never cancelled.
#[derive(Clone)]
pub struct WatchSupervisor {
    inner: Arc<SupervisorInner>,
}

impl WatchSupervisor {
    /// Create a supervisor spawning its loops through `executor`.
    pub fn new(executor: Arc<dyn Executor>, options: WatchOptions) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                executor,
                options,
                watched: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start watching `key` unless a loop already runs for it.
    ///
    /// `cursor` comes from the fetch that triggered this call and seeds the
    /// loop. Returns `true` if a loop was started.
    ///
    /// # Errors
    ///
    /// Returns the executor's error if the loop could not be spawned. The
    /// key is then left unwatched so that a later call can retry.
    pub fn ensure_watching<F: ChangeFeed>(
        &self,
        feed: &Arc<F>,
        key: &str,
        cursor: F::Cursor,
        listeners: &ListenerRegistry,
    ) -> Result<bool> {
        let stats = match self.inner.watched.lock().entry(key.to_string()) {
            Entry::Occupied(_) => return Ok(false),
            Entry::Vacant(entry) => Arc::clone(entry.insert(Arc::default())),
        };

        let watch = WatchLoop {
            key: key.to_string(),
            listeners: listeners.clone(),
            stats,
            retry_delay: self.inner.options.retry_delay,
            #[cfg(feature = "metrics")]
            metrics: self.inner.options.metrics.clone(),
        };
        let task = watch
            .run(Arc::clone(feed), cursor)
            .instrument(self.inner.options.span.clone());

        if let Err(err) = self.inner.executor.spawn(key, Box::pin(task)) {
            self.inner.watched.lock().remove(key);
            tracing::error!(key, error = %err, "Failed to start watcher");
            return Err(err);
        }

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.inner.options.metrics {
            metrics.record_watch_started(key);
        }

        tracing::debug!(key, backend = feed.name(), "Started watching key");
        Ok(true)
    }

    /// Whether a loop runs for `key`.
    pub fn is_watching(&self, key: &str) -> bool {
        self.inner.watched.lock().contains_key(key)
    }

    /// Keys with a running loop, sorted.
    pub fn watched_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.inner.watched.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Counters of the loop watching `key`.
    pub fn stats(&self, key: &str) -> Option<Arc<WatchStats>> {
        self.inner.watched.lock().get(key).cloned()
    }

    /// The options loops are started with.
    pub fn options(&self) -> &WatchOptions {
        &self.inner.options
    }
}

struct WatchLoop {
    key: String,
    listeners: ListenerRegistry,
    stats: Arc<WatchStats>,
    retry_delay: Duration,
    #[cfg(feature = "metrics")]
    metrics: Option<WatchMetrics>,
}

impl WatchLoop {
    async fn run<F: ChangeFeed>(self, feed: Arc<F>, mut cursor: F::Cursor) {
        let key = self.key.as_str();
        tracing::debug!(key, backend = feed.name(), "Watch loop running");

        loop {
            match feed.wait_for_change(key, &mut cursor).await {
                Ok(raw) => {
                    self.stats.notifications.fetch_add(1, Ordering::SeqCst);
                    #[cfg(feature = "metrics")]
                    if let Some(metrics) = &self.metrics {
                        metrics.record_notification(key);
                    }

                    if let Err(err) = self.listeners.notify(key, raw.as_deref()) {
                        self.stats.broadcast_failures.fetch_add(1, Ordering::SeqCst);
                        #[cfg(feature = "metrics")]
                        if let Some(metrics) = &self.metrics {
                            metrics.record_broadcast_failure(key);
                        }
                        tracing::warn!(key, error = %err, "Broadcasting change failed");
                    }
                }
                Err(err) => {
                    self.stats.transient_errors.fetch_add(1, Ordering::SeqCst);
                    #[cfg(feature = "metrics")]
                    if let Some(metrics) = &self.metrics {
                        metrics.record_transient_error(key);
                    }
                    tracing::error!(
                        key,
                        backend = feed.name(),
                        error = %err,
                        "Exception raised while listening on changes (re-launching watcher)"
                    );

                    if self.retry_delay.is_zero() {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Fetched;
    use crate::error::ConfigError;
    use crate::notify::{Listener, TokioExecutor};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Replays scripted wait outcomes, then blocks forever.
    struct ScriptedFeed {
        script: Mutex<VecDeque<Result<Option<Vec<u8>>>>>,
        cursors: Mutex<Vec<u64>>,
    }

    impl ScriptedFeed {
        fn new(script: Vec<Result<Option<Vec<u8>>>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                cursors: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChangeFeed for ScriptedFeed {
        type Cursor = u64;

        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn fetch(&self, _key: &str) -> Result<Fetched<u64>> {
            Ok(Fetched {
                value: None,
                cursor: 10,
            })
        }

        async fn wait_for_change(&self, _key: &str, cursor: &mut u64) -> Result<Option<Vec<u8>>> {
            self.cursors.lock().push(*cursor);
            let next = self.script.lock().pop_front();
            match next {
                Some(outcome) => {
                    *cursor += 1;
                    outcome
                }
                None => std::future::pending().await,
            }
        }
    }

    fn supervisor() -> WatchSupervisor {
        WatchSupervisor::new(
            Arc::new(TokioExecutor::current().unwrap()),
            WatchOptions::default(),
        )
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_survives_transient_errors() {
        let feed = Arc::new(ScriptedFeed::new(vec![
            Err(ConfigError::WatchError("connection refused".into())),
            Err(ConfigError::WatchError("timed out".into())),
            Ok(Some(br#"{"a": 1}"#.to_vec())),
        ]));
        let listeners = ListenerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        listeners.add(Listener::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let supervisor = supervisor();
        assert!(supervisor.ensure_watching(&feed, "app", 0, &listeners).unwrap());

        wait_until(|| calls.load(Ordering::SeqCst) == 1).await;
        // The loop is now parked in a fresh wait.
        wait_until(|| feed.cursors.lock().len() == 4).await;

        let stats = supervisor.stats("app").unwrap();
        assert_eq!(stats.notifications(), 1);
        assert_eq!(stats.transient_errors(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cursor_is_carried_between_waits() {
        let feed = Arc::new(ScriptedFeed::new(vec![Ok(None), Ok(None)]));
        let supervisor = supervisor();
        supervisor
            .ensure_watching(&feed, "app", 7, &ListenerRegistry::new())
            .unwrap();

        wait_until(|| feed.cursors.lock().len() == 3).await;
        assert_eq!(*feed.cursors.lock(), vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn test_one_loop_per_key() {
        let feed = Arc::new(ScriptedFeed::new(Vec::new()));
        let listeners = ListenerRegistry::new();
        let supervisor = supervisor();

        assert!(supervisor.ensure_watching(&feed, "a", 0, &listeners).unwrap());
        assert!(!supervisor.ensure_watching(&feed, "a", 0, &listeners).unwrap());
        assert!(supervisor.ensure_watching(&feed, "b", 0, &listeners).unwrap());

        assert_eq!(supervisor.watched_keys(), vec!["a", "b"]);
        wait_until(|| feed.cursors.lock().len() == 2).await;
    }

    #[tokio::test]
    async fn test_broadcast_failure_keeps_loop_alive() {
        let feed = Arc::new(ScriptedFeed::new(vec![
            Ok(Some(b"not json".to_vec())),
            Ok(Some(br#"{"ok": true}"#.to_vec())),
        ]));
        let listeners = ListenerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        listeners.add(Listener::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let supervisor = supervisor();
        supervisor.ensure_watching(&feed, "app", 0, &listeners).unwrap();

        wait_until(|| calls.load(Ordering::SeqCst) == 1).await;
        let stats = supervisor.stats("app").unwrap();
        assert_eq!(stats.notifications(), 2);
        assert_eq!(stats.broadcast_failures(), 1);
        assert_eq!(stats.transient_errors(), 0);
    }

    struct FailingExecutor;

    impl Executor for FailingExecutor {
        fn spawn(&self, _name: &str, _task: crate::notify::Task) -> Result<()> {
            Err(ConfigError::Other("no threads left".into()))
        }
    }

    #[test]
    fn test_spawn_failure_unmarks_key() {
        let supervisor = WatchSupervisor::new(Arc::new(FailingExecutor), WatchOptions::default());
        let feed = Arc::new(ScriptedFeed::new(Vec::new()));

        assert!(supervisor
            .ensure_watching(&feed, "app", 0, &ListenerRegistry::new())
            .is_err());
        assert!(!supervisor.is_watching("app"));
    }
}
