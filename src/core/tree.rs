//! Path-addressed configuration tree with live nested views.

use crate::core::path::split_path;
use crate::core::value::{Mapping, Value, ValueKind};
use crate::error::{ConfigError, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// A read-only, path-addressed view over a configuration snapshot.
///
/// The snapshot is held in an `ArcSwap`, so readers always see a complete
/// mapping while [`invalidate`](Self::invalidate) replaces it. Nested views
/// obtained through [`get_config`](Self::get_config) are cached weakly and
/// follow every invalidation of their parent for as long as someone holds
/// them.
///
/// Typed getters assert the type of the stored value rather than coerce it:
/// calling [`get_int`](Self::get_int) on the string `"2"` fails with
/// [`ConfigError::TypeMismatch`].
///
/// Cloning a `ConfigTree` clones the handle, not the data; both handles are
/// the same tree (see [`ptr_eq`](Self::ptr_eq)).
///
/// # Examples
///
/// ```rust
/// use distconfig::core::ConfigTree;
/// use serde_json::json;
///
/// # fn main() -> distconfig::error::Result<()> {
/// let tree = ConfigTree::try_from(json!({"a": {"b": 1}}))?;
/// let inner = tree.get_config("a", None)?;
/// assert_eq!(inner.get_int("b", None)?, 1);
///
/// tree.invalidate(ConfigTree::try_from(json!({"a": {"b": 2}}))?.snapshot());
/// assert_eq!(inner.get_int("b", None)?, 2);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConfigTree {
    inner: Arc<TreeNode>,
}

struct TreeNode {
    snapshot: ArcSwap<Mapping>,
    path: Option<String>,
    /// Nested views keyed by their path relative to this node.
    ///
    /// The lock also serializes invalidations of this node with the creation
    /// of new nested views.
    children: Mutex<HashMap<String, Weak<TreeNode>>>,
}

impl ConfigTree {
    /// Create a root tree over a mapping.
    pub fn new(data: impl Into<Arc<Mapping>>) -> Self {
        Self::with_path(None, data.into())
    }

    /// Create a root tree from an arbitrary value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidInput`] if the value is not a mapping.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Mapping(map) => Ok(Self::new(map)),
            other => Err(ConfigError::InvalidInput(other.kind())),
        }
    }

    fn with_path(path: Option<String>, data: Arc<Mapping>) -> Self {
        Self {
            inner: Arc::new(TreeNode {
                snapshot: ArcSwap::new(data),
                path,
                children: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The path of this view from its root, `None` for a root tree.
    pub fn path(&self) -> Option<&str> {
        self.inner.path.as_deref()
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Mapping> {
        self.inner.snapshot.load_full()
    }

    /// Number of top-level keys.
    pub fn len(&self) -> usize {
        self.inner.snapshot.load().len()
    }

    /// Whether the snapshot has no keys.
    pub fn is_empty(&self) -> bool {
        self.inner.snapshot.load().is_empty()
    }

    /// Top-level keys, in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.snapshot.load().keys().cloned().collect()
    }

    /// Whether `path` resolves to a value.
    pub fn contains(&self, path: &str) -> bool {
        resolve(&self.inner.snapshot.load(), path).is_ok()
    }

    /// Whether two handles refer to the same tree.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Resolve `path`, failing if any key along it is missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::KeyNotFound`] naming the missing key and the
    /// path traversed before it, e.g. `No key 'd' under path 'a.c'`. An
    /// intermediate value that is not a mapping counts as missing.
    pub fn item(&self, path: &str) -> Result<Value> {
        resolve(&self.inner.snapshot.load(), path).cloned()
    }

    /// Resolve `path`, returning `None` when it is absent.
    pub fn get(&self, path: &str) -> Option<Value> {
        self.item(path).ok()
    }

    /// Resolve `path` with a default and an optional type assertion.
    ///
    /// With `default = None` a missing path is an error, exactly like
    /// [`item`](Self::item). Otherwise the default is returned unchanged for
    /// a missing path. `expected` is checked against whichever value is
    /// returned, so a default of the wrong type is rejected as well.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::KeyNotFound`] if the path is absent and no default was given
    /// - [`ConfigError::TypeMismatch`] if the returned value is not of type `expected`
    pub fn get_with(
        &self,
        path: &str,
        default: Option<Value>,
        expected: Option<ValueKind>,
    ) -> Result<Value> {
        let value = match (self.item(path), default) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default,
            (Err(err), None) => return Err(err),
        };

        match expected {
            Some(kind) if value.kind() != kind => Err(ConfigError::TypeMismatch {
                path: path.to_string(),
                expected: kind,
                found: value.kind(),
            }),
            _ => Ok(value),
        }
    }

    /// Get a live nested view of the mapping at `path`.
    ///
    /// As long as a previously returned view for the same `path` is still
    /// held somewhere, that same view is returned. Otherwise a new view is
    /// built from the current snapshot (or from `default` if the path is
    /// absent) and cached weakly.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::KeyNotFound`] if the path is absent and no default was given
    /// - [`ConfigError::TypeMismatch`] if the value at `path` is not a mapping
    pub fn get_config(&self, path: &str, default: Option<Mapping>) -> Result<ConfigTree> {
        let mut children = self.inner.children.lock();

        if let Some(node) = children.get(path).and_then(Weak::upgrade) {
            return Ok(ConfigTree { inner: node });
        }

        let data = match self.get_with(path, default.map(Value::Mapping), Some(ValueKind::Mapping))? {
            Value::Mapping(map) => map,
            other => return Err(self.mismatch(path, ValueKind::Mapping, &other)),
        };

        let child_path = match &self.inner.path {
            Some(parent) => format!("{parent}/{path}"),
            None => path.to_string(),
        };
        let child = Self::with_path(Some(child_path), Arc::new(data));
        children.insert(path.to_string(), Arc::downgrade(&child.inner));
        Ok(child)
    }

    /// Get an integer.
    ///
    /// # Errors
    ///
    /// Same as [`get_with`](Self::get_with) with [`ValueKind::Int`].
    pub fn get_int(&self, path: &str, default: Option<i64>) -> Result<i64> {
        match self.get_with(path, default.map(Value::Int), Some(ValueKind::Int))? {
            Value::Int(i) => Ok(i),
            other => Err(self.mismatch(path, ValueKind::Int, &other)),
        }
    }

    /// Get a float. Integers are not accepted.
    ///
    /// # Errors
    ///
    /// Same as [`get_with`](Self::get_with) with [`ValueKind::Float`].
    pub fn get_float(&self, path: &str, default: Option<f64>) -> Result<f64> {
        match self.get_with(path, default.map(Value::Float), Some(ValueKind::Float))? {
            Value::Float(f) => Ok(f),
            other => Err(self.mismatch(path, ValueKind::Float, &other)),
        }
    }

    /// Get a boolean.
    ///
    /// # Errors
    ///
    /// Same as [`get_with`](Self::get_with) with [`ValueKind::Bool`].
    pub fn get_bool(&self, path: &str, default: Option<bool>) -> Result<bool> {
        match self.get_with(path, default.map(Value::Bool), Some(ValueKind::Bool))? {
            Value::Bool(b) => Ok(b),
            other => Err(self.mismatch(path, ValueKind::Bool, &other)),
        }
    }

    /// Get a string.
    ///
    /// # Errors
    ///
    /// Same as [`get_with`](Self::get_with) with [`ValueKind::String`].
    pub fn get_string(&self, path: &str, default: Option<&str>) -> Result<String> {
        let default = default.map(Value::from);
        match self.get_with(path, default, Some(ValueKind::String))? {
            Value::String(s) => Ok(s),
            other => Err(self.mismatch(path, ValueKind::String, &other)),
        }
    }

    /// Get raw bytes.
    ///
    /// # Errors
    ///
    /// Same as [`get_with`](Self::get_with) with [`ValueKind::Bytes`].
    pub fn get_bytes(&self, path: &str, default: Option<Vec<u8>>) -> Result<Vec<u8>> {
        match self.get_with(path, default.map(Value::Bytes), Some(ValueKind::Bytes))? {
            Value::Bytes(bytes) => Ok(bytes),
            other => Err(self.mismatch(path, ValueKind::Bytes, &other)),
        }
    }

    /// Get a sequence.
    ///
    /// # Errors
    ///
    /// Same as [`get_with`](Self::get_with) with [`ValueKind::Sequence`].
    pub fn get_sequence(&self, path: &str, default: Option<Vec<Value>>) -> Result<Vec<Value>> {
        match self.get_with(path, default.map(Value::Sequence), Some(ValueKind::Sequence))? {
            Value::Sequence(items) => Ok(items),
            other => Err(self.mismatch(path, ValueKind::Sequence, &other)),
        }
    }

    /// Deserialize the current snapshot into a typed configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DeserializationError`] if the snapshot does not
    /// match `T`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use distconfig::core::ConfigTree;
    /// use serde::Deserialize;
    /// use serde_json::json;
    ///
    /// #[derive(Deserialize)]
    /// struct Server {
    ///     port: u16,
    /// }
    ///
    /// # fn main() -> distconfig::error::Result<()> {
    /// let tree = ConfigTree::try_from(json!({"port": 8080}))?;
    /// let server: Server = tree.try_deserialize()?;
    /// assert_eq!(server.port, 8080);
    /// # Ok(())
    /// # }
    /// ```
    pub fn try_deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        let json = serde_json::Value::from(Value::Mapping((*self.snapshot()).clone()));
        serde_json::from_value(json).map_err(|e| {
            ConfigError::DeserializationError(format!("Failed to deserialize snapshot: {}", e))
        })
    }

    /// Replace the snapshot and cascade the change into live nested views.
    ///
    /// The new data replaces the old one wholesale. Every nested view that is
    /// still held is then invalidated with its own sub-mapping looked up in
    /// the new snapshot, or an empty mapping if that path is gone or no
    /// longer a mapping. Dropped views are pruned from the cache.
    pub fn invalidate(&self, data: impl Into<Arc<Mapping>>) {
        let data = data.into();
        let mut children = self.inner.children.lock();

        self.inner.snapshot.store(Arc::clone(&data));

        children.retain(|_, child| child.strong_count() > 0);
        for (path, child) in children.iter() {
            let Some(node) = child.upgrade() else {
                continue;
            };
            let inner = match resolve(&data, path) {
                Ok(Value::Mapping(map)) => map.clone(),
                _ => Mapping::new(),
            };
            ConfigTree { inner: node }.invalidate(inner);
        }
    }

    fn mismatch(&self, path: &str, expected: ValueKind, found: &Value) -> ConfigError {
        ConfigError::TypeMismatch {
            path: path.to_string(),
            expected,
            found: found.kind(),
        }
    }
}

/// Walk `path` through `data`.
fn resolve<'a>(data: &'a Mapping, path: &str) -> Result<&'a Value> {
    let keys = split_path(path);
    let not_found = |i: usize| ConfigError::KeyNotFound {
        key: keys[i].clone(),
        path: keys[..i].join("."),
    };

    let mut current = data;
    let mut found: Option<&Value> = None;
    for (i, key) in keys.iter().enumerate() {
        if let Some(previous) = found {
            current = match previous {
                Value::Mapping(map) => map,
                _ => return Err(not_found(i)),
            };
        }
        found = Some(current.get(key).ok_or_else(|| not_found(i))?);
    }

    // split_path always yields at least one key
    found.ok_or_else(|| not_found(0))
}

impl PartialEq for ConfigTree {
    fn eq(&self, other: &Self) -> bool {
        *self.inner.snapshot.load() == *other.inner.snapshot.load()
    }
}

impl From<Mapping> for ConfigTree {
    fn from(data: Mapping) -> Self {
        Self::new(data)
    }
}

impl TryFrom<Value> for ConfigTree {
    type Error = ConfigError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}

impl TryFrom<serde_json::Value> for ConfigTree {
    type Error = ConfigError;

    fn try_from(json: serde_json::Value) -> Result<Self> {
        Self::from_value(Value::from(json))
    }
}

impl fmt::Debug for ConfigTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigTree")
            .field("path", &self.inner.path)
            .field("snapshot", &**self.inner.snapshot.load())
            .finish()
    }
}

impl fmt::Display for ConfigTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfigTree({:?})", **self.inner.snapshot.load())
    }
}
