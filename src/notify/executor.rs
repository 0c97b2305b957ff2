//! Execution contexts for background watch loops.

use crate::error::{ConfigError, Result};
use std::future::Future;
use std::pin::Pin;
use tokio::runtime::{Builder, Handle};

/// A boxed background task.
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Strategy for running a watch loop independently of its caller.
pub trait Executor: Send + Sync {
    /// Start `task` in the background. `name` identifies it in logs and
    /// thread names.
    ///
    /// # Errors
    ///
    /// Returns an error if the task could not be started.
    fn spawn(&self, name: &str, task: Task) -> Result<()>;
}

/// Runs tasks on a tokio runtime.
#[derive(Clone, Debug)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    /// Use the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running in.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| ConfigError::Other(format!("No tokio runtime available: {}", e)))
    }
}

impl Executor for TokioExecutor {
    fn spawn(&self, name: &str, task: Task) -> Result<()> {
        tracing::debug!(task = name, "Spawning watch task on tokio runtime");
        // Detached: watch loops live as long as the runtime.
        drop(self.handle.spawn(task));
        Ok(())
    }
}

/// Runs each task on its own OS thread with a private current-thread runtime.
///
/// Useful when the application has no long-lived runtime, or when watch
/// loops must not compete with application tasks.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn spawn(&self, name: &str, task: Task) -> Result<()> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ConfigError::Other(format!("Failed to create runtime: {}", e)))?;

        std::thread::Builder::new()
            .name(format!("distconfig:{}", name))
            .spawn(move || runtime.block_on(task))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_tokio_executor_runs_task() {
        let executor = TokioExecutor::current().unwrap();
        let (tx, rx) = oneshot::channel();

        executor
            .spawn("test", Box::pin(async move {
                let _ = tx.send(42);
            }))
            .unwrap();

        let value = tokio::time::timeout(Duration::from_secs(2), rx).await;
        assert_eq!(value.unwrap().unwrap(), 42);
    }

    #[test]
    fn test_tokio_executor_outside_runtime() {
        assert!(TokioExecutor::current().is_err());
    }

    #[test]
    fn test_thread_executor_runs_task() {
        let (tx, rx) = std::sync::mpsc::channel();

        ThreadExecutor
            .spawn("test", Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let _ = tx.send(std::thread::current().name().map(str::to_string));
            }))
            .unwrap();

        let name = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(name.as_deref(), Some("distconfig:test"));
    }
}
