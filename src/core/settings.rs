//! Proxy settings loaded from files and environment variables.

use crate::core::Format;
use crate::error::{ConfigError, Result};
use crate::notify::{Executor, ThreadExecutor, TokioExecutor, WatchOptions};
use config::{Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Which coordination service to read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Consul KV.
    Consul,
    /// etcd v2 keys API.
    Etcd,
    /// A directory of files.
    File,
}

/// Where watch loops run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Tasks on the tokio runtime that builds the proxy.
    #[default]
    Tokio,
    /// One OS thread per watched key.
    Thread,
}

/// Connection settings of the backend.
///
/// Options that do not apply to the chosen kind are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BackendSettings {
    /// Backend kind.
    pub kind: BackendKind,
    /// Service address, e.g. `http://127.0.0.1:8500`. Consul and etcd.
    #[serde(default)]
    pub address: Option<String>,
    /// ACL token. Consul only.
    #[serde(default)]
    pub token: Option<String>,
    /// Datacenter to query. Consul only.
    #[serde(default)]
    pub datacenter: Option<String>,
    /// Directory holding one file per key. File only, required there.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Longest a single watch request may block, in seconds. Consul and etcd.
    #[serde(default)]
    pub wait_secs: Option<u64>,
}

/// Watch loop settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WatchSettings {
    /// Pause after a failed watch before retrying, in milliseconds.
    #[serde(default)]
    pub retry_delay_ms: u64,
}

/// Everything needed to assemble a [`ConfigProxy`](crate::core::ConfigProxy).
///
/// # Examples
///
/// ```yaml
/// backend:
///   kind: consul
///   address: http://consul.internal:8500
///   token: secret
///   wait_secs: 60
/// format: yaml
/// executor: tokio
/// watch:
///   retry_delay_ms: 500
/// ```
///
/// With the `DISTCONFIG` prefix and `__` separator, `DISTCONFIG_BACKEND__KIND=etcd`
/// overrides `backend.kind`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProxySettings {
    /// Backend selection and connection.
    pub backend: BackendSettings,
    /// Payload format. Default is JSON.
    #[serde(default)]
    pub format: Format,
    /// Where watch loops run. Default is tokio.
    #[serde(default)]
    pub executor: ExecutorKind,
    /// Watch loop behaviour.
    #[serde(default)]
    pub watch: WatchSettings,
}

impl ProxySettings {
    /// Load settings from `files`, in order, then environment overrides.
    ///
    /// File formats are detected from the extension (YAML, TOML, JSON).
    /// Later files override earlier ones; the environment overrides all files.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No source is given
    /// - A file cannot be read or parsed
    /// - The merged settings do not describe a proxy
    pub fn load(files: &[PathBuf], env: Option<(&str, &str)>) -> Result<Self> {
        let environment = env.map(|(prefix, separator)| {
            Environment::with_prefix(prefix)
                .prefix_separator("_")
                .separator(separator)
                .try_parsing(true)
        });
        Self::load_from(files, environment)
    }

    fn load_from(files: &[PathBuf], environment: Option<Environment>) -> Result<Self> {
        if files.is_empty() && environment.is_none() {
            return Err(ConfigError::LoadError(
                "No configuration sources specified".to_string(),
            ));
        }

        let mut builder = config::Config::builder();
        for path in files {
            builder = builder.add_source(File::from(path.as_path()));
        }
        if let Some(environment) = environment {
            builder = builder.add_source(environment);
        }

        let merged = builder
            .build()
            .map_err(|e| ConfigError::LoadError(format!("Failed to load settings: {}", e)))?;

        merged.try_deserialize().map_err(|e| {
            ConfigError::DeserializationError(format!("Failed to deserialize settings: {}", e))
        })
    }

    /// The executor watch loops should run on.
    ///
    /// # Errors
    ///
    /// Returns an error if the tokio executor is chosen outside a runtime.
    pub fn executor(&self) -> Result<Arc<dyn Executor>> {
        Ok(match self.executor {
            ExecutorKind::Tokio => Arc::new(TokioExecutor::current()?),
            ExecutorKind::Thread => Arc::new(ThreadExecutor),
        })
    }

    /// Watch options described by these settings.
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions::new().with_retry_delay(Duration::from_millis(self.watch.retry_delay_ms))
    }
}
