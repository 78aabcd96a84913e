use async_trait::async_trait;
use eyre::Result;

/// Trait for auxiliary long-running tasks launched next to the listeners.
///
/// A worker's `run` is spawned as its own supervised task: a panic inside
/// it becomes that task's error without touching sibling tasks. `close`
/// is invoked while the server drains; it is the worker's responsibility
/// to make `run` return once closed.
#[async_trait]
pub trait Worker: Send + Sync {
    /// A short name used in task labels and close reports.
    fn name(&self) -> &str;

    /// Run until finished or closed.
    async fn run(&self) -> Result<()>;

    /// Signal the worker to stop. The default does nothing.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}
