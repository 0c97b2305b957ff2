//! # distconfig
//!
//! Live configuration trees backed by distributed coordination services.
//!
//! ## Overview
//!
//! `distconfig` reads configuration documents stored under keys in Consul,
//! etcd, ZooKeeper or plain files, and keeps them current:
//! - Path-addressed, typed reads over an immutable snapshot
//! - Lock-free snapshot swaps using `arc-swap`
//! - Nested views that follow every change of their root
//! - One resilient background watch loop per key
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use distconfig::prelude::*;
//!
//! # async fn example() -> distconfig::error::Result<()> {
//! let proxy = ConfigProxy::builder()
//!     .with_file("config/distconfig.yaml")
//!     .with_env_overrides("DISTCONFIG", "__")
//!     .build()?;
//!
//! let config = proxy.get_config("services/api").await?;
//! let db = config.get_config("database", None)?;
//!
//! // Always reads the latest value stored in the backend.
//! let pool = db.get_int("pool_size", Some(10))?;
//! let host = config.get_string("listen/host", Some("0.0.0.0"))?;
//! println!("{host}: pool {pool}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Paths
//!
//! Keys inside a document are addressed with `/`-separated paths. A key that
//! itself contains a slash is written with `\/`:
//!
//! ```rust
//! use distconfig::core::split_path;
//!
//! assert_eq!(split_path(r"a/b\/c"), vec!["a", "b/c"]);
//! ```
//!
//! ## Feature Flags
//!
//! - `remote` (default): Consul and etcd backends
//! - `file-watch` (default): file backend
//! - `yaml`, `toml`, `all-formats`: payload formats besides JSON
//! - `metrics`: OpenTelemetry metrics for watch loops

#![warn(missing_docs, rust_2024_compatibility)]
#![deny(unsafe_code)]

pub mod backends;
pub mod core;
pub mod error;
pub mod notify;

#[cfg(feature = "metrics")]
pub mod metrics;

/// Convenient re-exports for common usage patterns.
pub mod prelude {
    pub use crate::backends::{Backend, ChangeFeed, MemoryBackend, MemoryStore};
    pub use crate::core::{ConfigProxy, ConfigTree, Format, Mapping, ProxyBuilder, Value};
    pub use crate::error::{ConfigError, Result};
    pub use crate::notify::{Listener, ThreadExecutor, TokioExecutor};
}
