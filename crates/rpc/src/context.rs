//! Dedicated executor threads for objects that must always run on one thread.
//!
//! Hosted objects registered with an [`ExecutionContext`] are never invoked from
//! tokio workers. Every call is queued to the context's thread and the caller awaits
//! completion.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default depth of the job queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

type Job = Box<dyn FnOnce() + Send>;

/// Handle to a single-threaded executor. Cloning shares the thread.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    thread_id: ThreadId,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionContext {
    /// Start an executor thread named `name`.
    ///
    /// # Errors
    ///
    /// Fails if the OS refuses to spawn the thread.
    pub fn spawn(name: impl Into<String>, capacity: usize) -> Result<Self> {
        let name = name.into();
        let (sender, mut receiver) = mpsc::channel::<Job>(capacity.max(1));

        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            debug!("Execution context {} started", thread_name);
            while let Some(job) = receiver.blocking_recv() {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    warn!("Job panicked on execution context {}", thread_name);
                }
            }
            debug!("Execution context {} stopped", thread_name);
        })?;

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                thread_id: handle.thread().id(),
                sender: Mutex::new(Some(sender)),
                thread: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Context name, also the thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the calling thread is this context's thread.
    #[must_use]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Run `job` on the context thread and wait for its result.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Disposed`] after [`Self::shutdown`], or if `job` panics.
    pub async fn run<R, F>(&self, job: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_current() {
            return Ok(job());
        }

        let sender = self
            .inner
            .sender
            .lock()
            .clone()
            .ok_or(Error::Disposed("execution context"))?;

        let (done_tx, done_rx) = oneshot::channel();
        sender
            .send(Box::new(move || {
                let _ = done_tx.send(job());
            }))
            .await
            .map_err(|_| Error::Disposed("execution context"))?;

        done_rx
            .await
            .map_err(|_| Error::Connection(format!("job on {} panicked", self.inner.name)))
    }

    /// Stop accepting work and let the thread drain its queue and exit.
    ///
    /// Does not wait for the thread; dropping the last handle joins it.
    pub fn shutdown(&self) {
        self.inner.sender.lock().take();
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.sender.get_mut().take();
        if let Some(handle) = self.thread.get_mut().take() {
            // The last handle may be dropped by a job on the context thread itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
