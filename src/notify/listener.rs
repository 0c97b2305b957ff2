//! Listener registry broadcasting parsed changes.

use crate::core::{Mapping, Parser, parser};
use crate::error::{ConfigError, ListenerError, Result};
use parking_lot::RwLock;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

type Callback = dyn Fn(&str, &Arc<Mapping>) -> std::result::Result<(), ListenerError> + Send + Sync;

/// A change callback.
///
/// The callback receives the changed key and its newly parsed mapping.
/// Clones of a `Listener` are the same listener for
/// [`ListenerRegistry::remove`].
#[derive(Clone)]
pub struct Listener {
    callback: Arc<Callback>,
}

impl Listener {
    /// Wrap a callback.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&str, &Arc<Mapping>) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Whether both handles wrap the same callback.
    pub fn same(&self, other: &Listener) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.callback), Arc::as_ptr(&other.callback))
    }

    fn call(&self, key: &str, data: &Arc<Mapping>) -> std::result::Result<(), ListenerError> {
        (self.callback)(key, data)
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("callback", &Arc::as_ptr(&self.callback))
            .finish()
    }
}

struct RegistryInner {
    listeners: RwLock<Vec<Listener>>,
    parser: Parser,
}

/// Ordered collection of change listeners owned by a backend.
///
/// Listeners are called in registration order. The same listener may be
/// registered several times and is then called once per registration.
///
/// # Examples
///
/// ```rust
/// use distconfig::notify::{Listener, ListenerRegistry};
///
/// # fn main() -> distconfig::error::Result<()> {
/// let registry = ListenerRegistry::new();
///
/// let listener = Listener::new(|key, data| {
///     println!("{} changed: {} keys", key, data.len());
///     Ok(())
/// });
/// registry.add(listener.clone());
///
/// registry.notify("app", Some(br#"{"port": 8080}"#))?;
///
/// registry.remove(&listener)?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ListenerRegistry {
    inner: Arc<RegistryInner>,
}

impl ListenerRegistry {
    /// Create a registry parsing payloads as JSON.
    pub fn new() -> Self {
        Self::with_parser(parser::json())
    }

    /// Create a registry with a custom payload parser.
    pub fn with_parser(parser: Parser) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                listeners: RwLock::new(Vec::new()),
                parser,
            }),
        }
    }

    /// Parse a raw payload. An absent value parses to an empty mapping.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] if the payload cannot be decoded.
    pub fn parse(&self, raw: Option<&[u8]>) -> Result<Mapping> {
        match raw {
            None => Ok(Mapping::new()),
            Some(raw) => (self.inner.parser)(raw),
        }
    }

    /// Append a listener. No uniqueness check is made.
    pub fn add(&self, listener: Listener) {
        self.inner.listeners.write().push(listener);
    }

    /// Remove the first registration of `listener`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ListenerNotFound`] if the listener is not
    /// registered.
    pub fn remove(&self, listener: &Listener) -> Result<()> {
        let mut listeners = self.inner.listeners.write();
        let position = listeners
            .iter()
            .position(|registered| registered.same(listener))
            .ok_or(ConfigError::ListenerNotFound)?;
        listeners.remove(position);
        Ok(())
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.listeners.read().is_empty()
    }

    /// Parse `raw` and call every listener with the result.
    ///
    /// A failing listener, whether it returns an error or panics, does not
    /// stop the others. Once all listeners have run, the last failure is
    /// logged and returned.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::ParseError`] if the payload cannot be decoded; no listener runs
    /// - [`ConfigError::ListenerFailed`] if at least one listener failed
    pub fn notify(&self, key: &str, raw: Option<&[u8]>) -> Result<()> {
        tracing::debug!(
            key,
            bytes = raw.map(<[u8]>::len),
            "Notify listeners of new value"
        );
        let data = Arc::new(self.parse(raw)?);

        // Listeners may register more listeners; don't hold the lock while calling out.
        let listeners = self.inner.listeners.read().clone();

        let mut failures = 0;
        let mut last_error = None;
        for listener in &listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.call(key, &data)))
                .unwrap_or_else(|panic| Err(panic_message(panic).into()));
            if let Err(err) = outcome {
                failures += 1;
                last_error = Some(err);
            }
        }

        match last_error {
            None => Ok(()),
            Some(source) => {
                tracing::error!(
                    key,
                    failures,
                    listeners = listeners.len(),
                    error = %source,
                    "Notify listeners raised an error"
                );
                Err(ConfigError::ListenerFailed {
                    key: key.to_string(),
                    failures,
                    source,
                })
            }
        }
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => format!("listener panicked: {}", message),
        Err(panic) => match panic.downcast_ref::<&str>() {
            Some(message) => format!("listener panicked: {}", message),
            None => "listener panicked".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const RAW: &[u8] = br#"{"foo": "bar"}"#;

    fn counting(counter: &Arc<AtomicUsize>) -> Listener {
        let counter = Arc::clone(counter);
        Listener::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_parse_absent_is_empty() {
        let registry = ListenerRegistry::new();
        assert!(registry.parse(None).unwrap().is_empty());
    }

    #[test]
    fn test_listener_receives_parsed_value() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(parking_lot::Mutex::new(None));

        let seen_clone = Arc::clone(&seen);
        registry.add(Listener::new(move |key, data| {
            *seen_clone.lock() = Some((key.to_string(), data.get("foo").cloned()));
            Ok(())
        }));

        registry.notify("/some/path", Some(RAW)).unwrap();
        assert_eq!(
            *seen.lock(),
            Some(("/some/path".to_string(), Some(Value::from("bar"))))
        );
    }

    #[test]
    fn test_multiple_listeners() {
        let registry = ListenerRegistry::new();
        let counter1 = Arc::new(AtomicUsize::new(0));
        let counter2 = Arc::new(AtomicUsize::new(0));
        registry.add(counting(&counter1));
        registry.add(counting(&counter2));

        registry.notify("key", Some(RAW)).unwrap();
        assert_eq!(counter1.load(Ordering::SeqCst), 1);
        assert_eq!(counter2.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_same_listener_added_three_times() {
        let registry = ListenerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let listener = counting(&counter);
        for _ in 0..3 {
            registry.add(listener.clone());
        }

        registry.notify("key", Some(RAW)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_remove_one_of_three() {
        let registry = ListenerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let listener = counting(&counter);
        for _ in 0..3 {
            registry.add(listener.clone());
        }

        registry.remove(&listener).unwrap();
        registry.notify("key", Some(RAW)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_remove_all_occurrences() {
        let registry = ListenerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let listener = counting(&counter);
        for _ in 0..3 {
            registry.add(listener.clone());
        }
        for _ in 0..3 {
            registry.remove(&listener).unwrap();
        }

        registry.notify("key", Some(RAW)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_more_than_registered() {
        let registry = ListenerRegistry::new();
        let listener = Listener::new(|_, _| Ok(()));
        registry.add(listener.clone());

        registry.remove(&listener).unwrap();
        assert!(matches!(
            registry.remove(&listener),
            Err(ConfigError::ListenerNotFound)
        ));
    }

    #[test]
    fn test_remove_distinguishes_listeners() {
        let registry = ListenerRegistry::new();
        let kept = Listener::new(|_, _| Ok(()));
        let other = Listener::new(|_, _| Ok(()));
        registry.add(kept.clone());

        assert!(registry.remove(&other).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_all_listeners_run_and_last_error_wins() {
        let registry = ListenerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        registry.add(counting(&counter));
        let c = Arc::clone(&counter);
        registry.add(Listener::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
            Err("first failure".into())
        }));
        registry.add(counting(&counter));
        let c = Arc::clone(&counter);
        registry.add(Listener::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
            Err("second failure".into())
        }));
        registry.add(counting(&counter));

        match registry.notify("key", Some(RAW)) {
            Err(ConfigError::ListenerFailed { failures, source, .. }) => {
                assert_eq!(failures, 2);
                assert_eq!(source.to_string(), "second failure");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let registry = ListenerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        registry.add(Listener::new(|_, _| panic!("bad listener")));
        registry.add(counting(&counter));

        let err = registry.notify("key", Some(RAW)).unwrap_err();
        assert!(err.source_message().contains("bad listener"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_parse_error_skips_listeners() {
        let registry = ListenerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.add(counting(&counter));

        assert!(matches!(
            registry.notify("key", Some(b"not json")),
            Err(ConfigError::ParseError(_))
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clone_shares_listeners() {
        let registry = ListenerRegistry::new();
        let registry2 = registry.clone();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.add(counting(&counter));

        registry2.notify("key", None).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    trait SourceMessage {
        fn source_message(&self) -> String;
    }

    impl SourceMessage for ConfigError {
        fn source_message(&self) -> String {
            use std::error::Error;
            self.source().map(|s| s.to_string()).unwrap_or_default()
        }
    }
}
