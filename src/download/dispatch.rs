use anyhow::{Context, Result};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{self, ThreadId};
use tokio::sync::mpsc;
use tracing::warn;

/// A unit of callback work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Execution context on which progress and completion callbacks are delivered.
///
/// Every registration passes one explicitly; the transport's own threads never
/// invoke user callbacks directly.
pub trait CallbackContext: Send + Sync {
    /// Schedule `job` on this context.
    fn run(&self, job: Job);

    /// Whether the caller is already executing on this context.
    fn is_current(&self) -> bool;
}

/// Runs every job immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineContext;

impl CallbackContext for InlineContext {
    fn run(&self, job: Job) {
        job();
    }

    fn is_current(&self) -> bool {
        true
    }
}

/// A dedicated thread that executes jobs one at a time, in submission order.
///
/// This is the stand-in for a UI/main thread: callbacks never run concurrently
/// with each other and always on the same thread.
pub struct DispatchQueue {
    name: String,
    sender: mpsc::UnboundedSender<Job>,
    thread_id: ThreadId,
}

impl DispatchQueue {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let thread_name = name.clone();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        warn!(queue = %thread_name, "callback panicked");
                    }
                }
            })
            .with_context(|| format!("Failed to spawn dispatch thread {}", name))?;

        Ok(Self {
            name,
            sender,
            thread_id: handle.thread().id(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl CallbackContext for DispatchQueue {
    fn run(&self, job: Job) {
        if self.sender.send(job).is_err() {
            warn!(queue = %self.name, "dispatch thread has stopped, dropping callback");
        }
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}
