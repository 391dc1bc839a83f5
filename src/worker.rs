//! Blocking work off the event loop
//!
//! Jobs run on a bounded tokio blocking pool. Each finished job sends its
//! type-erased result over a channel and wakes the poller through a mio
//! [`Waker`]; the loop then drains results and runs the continuation that
//! was registered with the job, on the loop thread.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use mio::Waker;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::error::ChatError;

/// Identifies a submitted job
pub type JobId = u64;

/// Type-erased job result
pub type Payload = Box<dyn Any + Send>;

/// The job panicked instead of producing a result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPanicked {
    pub label: String,
}

/// A finished job with the continuation registered for it
pub struct Completed<K> {
    pub id: JobId,
    pub label: String,
    pub then: K,
    pub result: Result<Payload, JobPanicked>,
}

struct PendingJob<K> {
    label: String,
    then: K,
}

/// Bounded blocking pool plus the continuations waiting on it
///
/// `K` is whatever the loop needs to resume after a job; the worker only
/// stores it.
pub struct Worker<K> {
    runtime: Option<Runtime>,
    tx: UnboundedSender<(JobId, Result<Payload, JobPanicked>)>,
    rx: UnboundedReceiver<(JobId, Result<Payload, JobPanicked>)>,
    waker: Arc<Waker>,
    pending: HashMap<JobId, PendingJob<K>>,
    next_id: JobId,
}

impl<K> Worker<K> {
    /// Start a pool of at most `threads` blocking threads
    pub fn new(threads: usize, waker: Waker) -> Result<Self, ChatError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name("chatango-worker")
            .build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        info!(threads, "Worker pool started");
        Ok(Self {
            runtime: Some(runtime),
            tx,
            rx,
            waker: Arc::new(waker),
            pending: HashMap::new(),
            next_id: 0,
        })
    }

    /// Run `work` on the pool; `then` comes back with its result
    pub fn submit<T, F>(&mut self, label: &str, work: F, then: K) -> JobId
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;

        let tx = self.tx.clone();
        let waker = Arc::clone(&self.waker);
        let job_label = label.to_string();
        let job = move || {
            let start = Instant::now();
            let result = panic::catch_unwind(AssertUnwindSafe(work))
                .map(|value| Box::new(value) as Payload)
                .map_err(|_| JobPanicked {
                    label: job_label.clone(),
                });
            debug!(job = id, label = %job_label, elapsed_ms = start.elapsed().as_millis() as u64, "Job finished");
            if tx.send((id, result)).is_err() {
                debug!(job = id, "Worker gone before job finished");
                return;
            }
            if let Err(e) = waker.wake() {
                warn!(job = id, error = %e, "Failed to wake event loop");
            }
        };

        match &self.runtime {
            Some(runtime) => {
                runtime.spawn_blocking(job);
            }
            None => warn!(job = id, label, "Worker pool is shut down"),
        }

        self.pending.insert(
            id,
            PendingJob {
                label: label.to_string(),
                then,
            },
        );
        debug!(job = id, label, "Job submitted");
        id
    }

    /// Results that arrived since the last drain, in arrival order
    pub fn drain(&mut self) -> Vec<Completed<K>> {
        let mut done = Vec::new();
        while let Ok((id, result)) = self.rx.try_recv() {
            match self.pending.remove(&id) {
                Some(job) => {
                    if let Err(ref e) = result {
                        warn!(job = id, label = %e.label, "Job panicked");
                    }
                    done.push(Completed {
                        id,
                        label: job.label,
                        then: job.then,
                        result,
                    });
                }
                None => debug!(job = id, "Result for unknown job"),
            }
        }
        done
    }

    /// Jobs submitted but not drained yet
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl<K> Drop for Worker<K> {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl<K> std::fmt::Debug for Worker<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("pending", &self.pending.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}
