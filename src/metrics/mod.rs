//! Built-in metrics for watch loops.
//!
//! Provides OpenTelemetry metrics tracking:
//! - Changes observed per key
//! - Transient watch failures
//! - Failed broadcasts
//! - Running watch loops
//!
//! # Examples
//!
//! ```rust,no_run
//! use distconfig::prelude::*;
//! use opentelemetry::global;
//!
//! # async fn example() -> Result<()> {
//! let proxy = ConfigProxy::builder()
//!     .with_file("distconfig.yaml")
//!     .with_metrics(global::meter("my-app"))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

mod watch_metrics;

pub use watch_metrics::WatchMetrics;
