//! Bounded worker pools
//!
//! A fixed number of worker tasks drain one bounded job queue. Submission
//! never waits: if the queue is full the job is rejected and the caller
//! decides what to log.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

type Job = BoxFuture<'static, ()>;

/// Why a job was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The queue is at capacity
    Saturated,
    /// The pool has been shut down
    Closed,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Saturated => write!(f, "worker queue is full"),
            PoolError::Closed => write!(f, "worker pool is shut down"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Fixed-size pool of tokio worker tasks
pub struct WorkerPool {
    name: &'static str,
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks sharing a queue of `capacity` jobs.
    /// Must be called from within a tokio runtime.
    pub fn new(name: &'static str, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|index| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                    trace!("{} worker {} exiting", name, index);
                })
            })
            .collect();

        Self {
            name,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queue a job without waiting
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let tx = self.tx.lock().clone().ok_or(PoolError::Closed)?;
        tx.try_send(Box::pin(job)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PoolError::Saturated,
            mpsc::error::TrySendError::Closed(_) => PoolError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Stop accepting jobs and abort the workers. Queued jobs are discarded.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
