//! Deferred call queue.
//!
//! A FIFO of boxed closures drained by one dedicated consumer thread.
//! Producers on any thread enqueue with [`DeferredQueue::post`] or through a
//! cloned [`DeferredSender`]; the only blocking is the brief queue lock.
//!
//! Shutdown is terminal. Once [`DeferredQueue::shutdown`] sets the exit flag
//! no further posts are accepted, entries still queued are dropped without
//! running, and the consumer thread is joined.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, ScriptingError};

/// One unit of deferred work.
pub type DeferredCall = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct QueueState {
    entries: VecDeque<DeferredCall>,
    exiting: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl Shared {
    fn post(&self, call: DeferredCall) -> bool {
        let mut state = self.state.lock();
        if state.exiting {
            return false;
        }
        state.entries.push_back(call);
        drop(state);
        self.ready.notify_one();
        true
    }

    fn is_exiting(&self) -> bool {
        self.state.lock().exiting
    }

    fn pending(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn run(&self) {
        loop {
            let call = {
                let mut state = self.state.lock();
                loop {
                    if state.exiting {
                        return;
                    }
                    if let Some(call) = state.entries.pop_front() {
                        break call;
                    }
                    self.ready.wait(&mut state);
                }
            };

            if catch_unwind(AssertUnwindSafe(call)).is_err() {
                tracing::error!("Deferred call panicked");
            }
        }
    }
}

/// Owner of the queue and its consumer thread.
pub struct DeferredQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl DeferredQueue {
    /// Create the queue and spawn its consumer thread.
    pub fn start(thread_name: &str) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let consumer = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || consumer.run())
            .map_err(ScriptingError::Thread)?;

        tracing::debug!(thread = thread_name, "Deferred call thread started");
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Enqueue `call`. Returns false, dropping `call`, once shutdown began.
    pub fn post<F>(&self, call: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.post(Box::new(call))
    }

    /// A producer handle usable from any thread.
    pub fn sender(&self) -> DeferredSender {
        DeferredSender {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_exiting(&self) -> bool {
        self.shared.is_exiting()
    }

    /// Number of entries accepted but not yet taken by the consumer.
    pub fn pending(&self) -> usize {
        self.shared.pending()
    }

    /// Stop accepting work, discard what is still queued and join the
    /// consumer. Idempotent.
    pub fn shutdown(&mut self) {
        let discarded = {
            let mut state = self.shared.state.lock();
            state.exiting = true;
            std::mem::take(&mut state.entries)
        };
        self.shared.ready.notify_all();

        if !discarded.is_empty() {
            tracing::debug!(count = discarded.len(), "Discarding queued deferred calls");
        }
        drop(discarded);

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Deferred call thread terminated abnormally");
            }
        }
    }
}

impl Drop for DeferredQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DeferredQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredQueue")
            .field("pending", &self.pending())
            .field("exiting", &self.is_exiting())
            .finish()
    }
}

/// Cloneable producer handle for a [`DeferredQueue`].
///
/// A sender outliving its queue keeps returning false from `post`.
#[derive(Clone)]
pub struct DeferredSender {
    shared: Arc<Shared>,
}

impl DeferredSender {
    pub fn post<F>(&self, call: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.post(Box::new(call))
    }

    pub fn is_exiting(&self) -> bool {
        self.shared.is_exiting()
    }
}

impl std::fmt::Debug for DeferredSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredSender").finish_non_exhaustive()
    }
}
