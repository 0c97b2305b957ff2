//! Parsers turning raw backend payloads into mappings.

use crate::core::value::{Mapping, Value};
use crate::error::{ConfigError, Result};
use serde::Deserialize;
use std::sync::Arc;

/// A payload parser: raw bytes in, top-level mapping out.
pub type Parser = Arc<dyn Fn(&[u8]) -> Result<Mapping> + Send + Sync>;

/// Payload format of the values stored in a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// JSON documents (default).
    #[default]
    Json,
    /// YAML documents (requires the `yaml` feature).
    Yaml,
    /// TOML documents (requires the `toml` feature).
    Toml,
}

impl Format {
    /// Get the parser for this format.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FeatureNotEnabled`] if the format's feature is
    /// not compiled in.
    pub fn parser(self) -> Result<Parser> {
        match self {
            Self::Json => Ok(json()),
            #[cfg(feature = "yaml")]
            Self::Yaml => Ok(yaml()),
            #[cfg(not(feature = "yaml"))]
            Self::Yaml => Err(ConfigError::FeatureNotEnabled("yaml")),
            #[cfg(feature = "toml")]
            Self::Toml => Ok(toml()),
            #[cfg(not(feature = "toml"))]
            Self::Toml => Err(ConfigError::FeatureNotEnabled("toml")),
        }
    }
}

/// JSON parser, the default for every backend.
pub fn json() -> Parser {
    Arc::new(|raw| {
        let value: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| ConfigError::ParseError(format!("invalid JSON: {}", e)))?;
        into_mapping(value)
    })
}

/// YAML parser.
#[cfg(feature = "yaml")]
pub fn yaml() -> Parser {
    Arc::new(|raw| {
        let value: serde_json::Value = serde_yaml::from_slice(raw)
            .map_err(|e| ConfigError::ParseError(format!("invalid YAML: {}", e)))?;
        into_mapping(value)
    })
}

/// TOML parser.
#[cfg(feature = "toml")]
pub fn toml() -> Parser {
    Arc::new(|raw| {
        let text = std::str::from_utf8(raw)
            .map_err(|e| ConfigError::ParseError(format!("TOML is not UTF-8: {}", e)))?;
        let value: serde_json::Value = ::toml::from_str(text)
            .map_err(|e| ConfigError::ParseError(format!("invalid TOML: {}", e)))?;
        into_mapping(value)
    })
}

fn into_mapping(value: serde_json::Value) -> Result<Mapping> {
    match Value::from(value) {
        Value::Mapping(map) => Ok(map),
        other => Err(ConfigError::ParseError(format!(
            "expected a mapping at the top level, got {}",
            other.kind()
        ))),
    }
}
