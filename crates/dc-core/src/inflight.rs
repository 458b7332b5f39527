//! The cache thread and the futures its callers wait on.
//!
//! Jobs are closures over the [`Backend`], run one at a time in submission
//! order. Between jobs the thread runs work the backend posted for itself
//! and fires the stats timer. Dropping the [`Dispatcher`] closes the queue;
//! the thread finishes what was already queued, shuts the backend down and
//! exits.

use crate::backend::Backend;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use dc_error::{DcError, Result};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

type Job = Box<dyn FnOnce(&mut Backend) + Send>;

/// Completion of a queued operation.
///
/// Await it from async code, or call [`Pending::wait`] from a plain
/// thread. `wait` must not be called from inside an async runtime.
#[must_use = "the operation's result is only observable through the Pending"]
pub struct Pending<T> {
    state: PendingState<T>,
}

enum PendingState<T> {
    Queued(oneshot::Receiver<Result<T>>),
    Failed(Option<DcError>),
}

impl<T> Pending<T> {
    fn queued(receiver: oneshot::Receiver<Result<T>>) -> Self {
        Self {
            state: PendingState::Queued(receiver),
        }
    }

    pub(crate) fn failed(err: DcError) -> Self {
        Self {
            state: PendingState::Failed(Some(err)),
        }
    }

    /// Block the calling thread until the operation completes.
    pub fn wait(self) -> Result<T> {
        match self.state {
            PendingState::Queued(receiver) => receiver.blocking_recv().unwrap_or(Err(DcError::Shutdown)),
            PendingState::Failed(err) => Err(err.unwrap_or(DcError::Shutdown)),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            PendingState::Queued(receiver) => Pin::new(receiver)
                .poll(cx)
                .map(|done| done.unwrap_or(Err(DcError::Shutdown))),
            PendingState::Failed(err) => Poll::Ready(Err(err.take().unwrap_or(DcError::Shutdown))),
        }
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            PendingState::Queued(_) => "queued",
            PendingState::Failed(_) => "failed",
        };
        f.debug_struct("Pending").field("state", &state).finish()
    }
}

pub(crate) struct Dispatcher {
    sender: Option<Sender<Job>>,
    pending: Arc<AtomicUsize>,
    thread: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Start the cache thread that owns `backend`. `pending` is the count
    /// the backend reads to judge its load.
    pub fn spawn(backend: Backend, pending: Arc<AtomicUsize>, stats_interval: Duration) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let thread = thread::Builder::new()
            .name("dc-cache".to_owned())
            .spawn(move || run(backend, &receiver, stats_interval))?;
        Ok(Self {
            sender: Some(sender),
            pending,
            thread: Some(thread),
        })
    }

    /// Queue `op` and return its completion.
    pub fn submit<T, F>(&self, op: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Backend) -> Result<T> + Send + 'static,
    {
        let (done, receiver) = oneshot::channel();
        let pending = Arc::clone(&self.pending);
        let job: Job = Box::new(move |backend| {
            let result = op(backend);
            pending.fetch_sub(1, Ordering::Relaxed);
            // The caller may have stopped waiting.
            let _ = done.send(result);
        });
        if self.enqueue(job) {
            Pending::queued(receiver)
        } else {
            Pending::failed(DcError::Shutdown)
        }
    }

    /// Queue `op` without a completion.
    pub fn post<F>(&self, op: F)
    where
        F: FnOnce(&mut Backend) + Send + 'static,
    {
        let pending = Arc::clone(&self.pending);
        let job: Job = Box::new(move |backend| {
            op(backend);
            pending.fetch_sub(1, Ordering::Relaxed);
        });
        if !self.enqueue(job) {
            debug!(target: "dc::backend", "job_dropped_after_shutdown");
        }
    }

    fn enqueue(&self, job: Job) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        self.pending.fetch_add(1, Ordering::Relaxed);
        if sender.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.sender = None;
        let Some(thread) = self.thread.take() else {
            return;
        };
        // The last handle can go away on the cache thread itself, from a
        // result nobody waited for.
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            error!(target: "dc::backend", "cache_thread_panicked");
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .field("open", &self.sender.is_some())
            .finish_non_exhaustive()
    }
}

fn run(mut backend: Backend, receiver: &Receiver<Job>, stats_interval: Duration) {
    info!(target: "dc::backend", "cache_thread_started");
    let mut next_tick = Instant::now() + stats_interval;
    loop {
        let deadline = backend
            .next_task_deadline()
            .map_or(next_tick, |task| task.min(next_tick));
        match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(job) => job(&mut backend),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        let now = Instant::now();
        backend.run_due_tasks(now);
        if now >= next_tick {
            backend.on_stats_timer();
            next_tick = now + stats_interval;
        }
    }
    backend.shutdown();
    info!(target: "dc::backend", "cache_thread_stopped");
}
