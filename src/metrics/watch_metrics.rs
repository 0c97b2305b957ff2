//! Watch loop metrics using OpenTelemetry.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Meter, UpDownCounter};

/// Metrics collector for watch loops.
///
/// Tracks observed changes, transient watch failures, failed broadcasts and
/// the number of running watch loops, each tagged with the watched key.
///
/// # Examples
///
/// ```rust,no_run
/// use distconfig::metrics::WatchMetrics;
/// use distconfig::notify::WatchOptions;
/// use opentelemetry::global;
///
/// let metrics = WatchMetrics::new(global::meter("distconfig"));
/// let options = WatchOptions::default().with_metrics(metrics);
/// ```
#[derive(Clone)]
pub struct WatchMetrics {
    notifications: Counter<u64>,
    transient_errors: Counter<u64>,
    broadcast_failures: Counter<u64>,
    active_watches: UpDownCounter<i64>,
}

impl WatchMetrics {
    /// Create a new metrics collector with the provided meter.
    pub fn new(meter: Meter) -> Self {
        let notifications = meter
            .u64_counter("distconfig.watch.notifications")
            .with_description("Number of remote changes observed and broadcast")
            .build();

        let transient_errors = meter
            .u64_counter("distconfig.watch.transient_errors")
            .with_description("Number of failed waits that re-launched the watcher")
            .build();

        let broadcast_failures = meter
            .u64_counter("distconfig.watch.broadcast_failures")
            .with_description("Number of broadcasts with a parse error or a failing listener")
            .build();

        let active_watches = meter
            .i64_up_down_counter("distconfig.watch.active")
            .with_description("Number of running watch loops")
            .build();

        Self {
            notifications,
            transient_errors,
            broadcast_failures,
            active_watches,
        }
    }

    /// Record a change broadcast for `key`.
    pub fn record_notification(&self, key: &str) {
        self.notifications.add(1, &[key_attribute(key)]);
    }

    /// Record a failed wait on `key`.
    pub fn record_transient_error(&self, key: &str) {
        self.transient_errors.add(1, &[key_attribute(key)]);
    }

    /// Record a failed broadcast for `key`.
    pub fn record_broadcast_failure(&self, key: &str) {
        self.broadcast_failures.add(1, &[key_attribute(key)]);
    }

    /// Record a new watch loop for `key`.
    pub fn record_watch_started(&self, key: &str) {
        self.active_watches.add(1, &[key_attribute(key)]);
    }
}

fn key_attribute(key: &str) -> KeyValue {
    KeyValue::new("key", key.to_string())
}
