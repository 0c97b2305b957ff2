//! Builder for constructing ConfigProxy instances from settings.

use crate::backends::Backend;
use crate::core::settings::{BackendKind, BackendSettings};
use crate::core::{ConfigProxy, Parser, ProxySettings};
use crate::error::{ConfigError, Result};
use crate::notify::{Executor, WatchOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Span;

#[cfg(feature = "metrics")]
use crate::metrics::WatchMetrics;

/// Builder for constructing a [`ConfigProxy`] from [`ProxySettings`].
///
/// Settings come from files and environment variables, or are given
/// directly. Everything the settings cannot express (a custom executor or
/// parser, the tracing span, metrics) is set on the builder.
///
/// # Examples
///
/// ```rust,no_run
/// use distconfig::prelude::*;
///
/// # async fn example() -> Result<()> {
/// let proxy = ConfigProxy::builder()
///     .with_file("config/distconfig.yaml")
///     .with_env_overrides("DISTCONFIG", "__")
///     .build()?;
///
/// let config = proxy.get_config("service/api").await?;
/// # Ok(())
/// # }
/// ```
pub struct ProxyBuilder {
    file_paths: Vec<PathBuf>,
    env_prefix: Option<String>,
    env_separator: Option<String>,
    settings: Option<ProxySettings>,
    executor: Option<Arc<dyn Executor>>,
    parser: Option<Parser>,
    span: Option<Span>,
    #[cfg(feature = "metrics")]
    metrics: Option<WatchMetrics>,
}

impl ProxyBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            file_paths: Vec::new(),
            env_prefix: None,
            env_separator: None,
            settings: None,
            executor: None,
            parser: None,
            span: None,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Add a settings file with format detection by extension.
    ///
    /// Supported formats: YAML (.yaml, .yml), TOML (.toml), JSON (.json).
    /// Later files override earlier ones.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_paths.push(path.into());
        self
    }

    /// Read overrides from environment variables.
    ///
    /// # Arguments
    ///
    /// * `prefix` - Prefix for environment variables (e.g., "DISTCONFIG")
    /// * `separator` - Separator for nested keys (e.g., "__" for DISTCONFIG_BACKEND__KIND)
    pub fn with_env_overrides(mut self, prefix: &str, separator: &str) -> Self {
        self.env_prefix = Some(prefix.to_string());
        self.env_separator = Some(separator.to_string());
        self
    }

    /// Use these settings instead of loading files and environment.
    pub fn with_settings(mut self, settings: ProxySettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Run watch loops on this executor, ignoring the `executor` setting.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Parse payloads with this parser, ignoring the `format` setting.
    pub fn with_parser(mut self, parser: Parser) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Record watch loop events in this span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Record watch metrics.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, meter: opentelemetry::metrics::Meter) -> Self {
        self.metrics = Some(WatchMetrics::new(meter));
        self
    }

    /// Build the proxy.
    ///
    /// With the default tokio executor this must be called inside a tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Settings cannot be loaded
    /// - The chosen backend or format is not compiled in
    /// - The backend client cannot be created
    pub fn build(self) -> Result<ConfigProxy> {
        let settings = match self.settings {
            Some(settings) => settings,
            None => {
                let env = self.env_prefix.as_deref().zip(self.env_separator.as_deref());
                ProxySettings::load(&self.file_paths, env)?
            }
        };

        let executor = match self.executor {
            Some(executor) => executor,
            None => settings.executor()?,
        };
        let parser = match self.parser {
            Some(parser) => parser,
            None => settings.format.parser()?,
        };

        let mut options = settings.watch_options();
        if let Some(span) = self.span {
            options = options.with_span(span);
        }
        #[cfg(feature = "metrics")]
        if let Some(metrics) = self.metrics {
            options = options.with_metrics(metrics);
        }

        let parts = Parts {
            executor,
            parser,
            options,
        };
        let backend = match settings.backend.kind {
            BackendKind::Consul => consul(&settings.backend, parts)?,
            BackendKind::Etcd => etcd(&settings.backend, parts)?,
            BackendKind::File => file(&settings.backend, parts)?,
        };

        tracing::info!(backend = ?settings.backend.kind, "Built configuration proxy");
        Ok(ConfigProxy::from_arc(backend))
    }
}

impl Default for ProxyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// What every backend is assembled from.
struct Parts {
    executor: Arc<dyn Executor>,
    parser: Parser,
    options: WatchOptions,
}

#[cfg(feature = "remote")]
fn consul(settings: &BackendSettings, parts: Parts) -> Result<Arc<dyn Backend>> {
    use crate::backends::{ConsulBackend, ConsulFeed};
    use std::time::Duration;

    let mut feed = ConsulFeed::builder();
    if let Some(address) = &settings.address {
        feed = feed.with_address(address);
    }
    if let Some(token) = &settings.token {
        feed = feed.with_token(token);
    }
    if let Some(datacenter) = &settings.datacenter {
        feed = feed.with_datacenter(datacenter);
    }
    if let Some(wait) = settings.wait_secs {
        feed = feed.with_wait(Duration::from_secs(wait));
    }

    Ok(Arc::new(ConsulBackend::with_options(
        feed.build()?,
        parts.executor,
        parts.parser,
        parts.options,
    )))
}

#[cfg(not(feature = "remote"))]
fn consul(_settings: &BackendSettings, _parts: Parts) -> Result<Arc<dyn Backend>> {
    Err(ConfigError::FeatureNotEnabled("remote"))
}

#[cfg(feature = "remote")]
fn etcd(settings: &BackendSettings, parts: Parts) -> Result<Arc<dyn Backend>> {
    use crate::backends::{EtcdBackend, EtcdFeed};
    use std::time::Duration;

    let mut feed = EtcdFeed::builder();
    if let Some(address) = &settings.address {
        feed = feed.with_address(address);
    }
    if let Some(wait) = settings.wait_secs {
        feed = feed.with_watch_timeout(Duration::from_secs(wait));
    }

    Ok(Arc::new(EtcdBackend::with_options(
        feed.build()?,
        parts.executor,
        parts.parser,
        parts.options,
    )))
}

#[cfg(not(feature = "remote"))]
fn etcd(_settings: &BackendSettings, _parts: Parts) -> Result<Arc<dyn Backend>> {
    Err(ConfigError::FeatureNotEnabled("remote"))
}

#[cfg(feature = "file-watch")]
fn file(settings: &BackendSettings, parts: Parts) -> Result<Arc<dyn Backend>> {
    use crate::backends::{FileBackend, FileFeed};

    let root = settings.root.clone().ok_or_else(|| {
        ConfigError::LoadError("backend.root is required for the file backend".to_string())
    })?;
    Ok(Arc::new(FileBackend::with_options(
        FileFeed::new(root),
        parts.executor,
        parts.parser,
        parts.options,
    )))
}

#[cfg(not(feature = "file-watch"))]
fn file(_settings: &BackendSettings, _parts: Parts) -> Result<Arc<dyn Backend>> {
    Err(ConfigError::FeatureNotEnabled("file-watch"))
}
