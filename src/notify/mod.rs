//! Change notification pipeline.
//!
//! Provides the listener registry that broadcasts parsed changes, the
//! execution contexts watch loops run on, and the supervisor that keeps one
//! resilient watch loop per key.

pub mod executor;
pub mod listener;
pub mod supervisor;

pub use executor::{Executor, Task, ThreadExecutor, TokioExecutor};
pub use listener::{Listener, ListenerRegistry};
pub use supervisor::{WatchOptions, WatchStats, WatchSupervisor};
