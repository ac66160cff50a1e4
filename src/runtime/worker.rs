//! Dedicated threads for blocking native work
//!
//! Native calls block for seconds and must never run on an async
//! executor thread. A [`NativeWorker`] owns one OS thread that drains a
//! job queue in order; results come back over oneshot channels.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::{panic_message, LifecycleError};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error(transparent)]
    Unavailable(#[from] LifecycleError),

    #[error("native job aborted before producing a result")]
    Aborted,

    #[error("native job did not finish within {0:?}")]
    TimedOut(Duration),
}

pub struct NativeWorker {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

impl NativeWorker {
    /// Start the worker thread
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let thread_name = name.clone();
        thread::Builder::new().name(name.clone()).spawn(move || {
            while let Some(job) = rx.blocking_recv() {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                    error!(
                        "Job on worker {} panicked: {}",
                        thread_name,
                        panic_message(payload)
                    );
                }
            }
            debug!("Worker {} exiting", thread_name);
        })?;

        Ok(Self {
            name,
            sender: Mutex::new(Some(tx)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.sender
            .lock()
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    fn enqueue(&self, job: Job) -> Result<(), LifecycleError> {
        let guard = self.sender.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| LifecycleError::WorkerUnavailable(self.name.clone()))?;
        tx.send(job)
            .map_err(|_| LifecycleError::WorkerUnavailable(self.name.clone()))
    }

    /// Queue a job without waiting for it
    pub fn execute<F>(&self, f: F) -> Result<(), LifecycleError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Box::new(f))
    }

    /// Queue a job and get a receiver for its result
    pub fn submit<F, R>(&self, f: F) -> Result<oneshot::Receiver<R>, LifecycleError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Box::new(move || {
            let _ = tx.send(f());
        }))?;
        Ok(rx)
    }

    /// Run a job and wait for its result
    pub async fn run<F, R>(&self, f: F) -> Result<R, WorkerError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let rx = self.submit(f)?;
        rx.await.map_err(|_| WorkerError::Aborted)
    }

    /// Run a job, giving up after `limit`.
    ///
    /// A job that overruns keeps running on the worker; only the wait is
    /// abandoned, and its eventual result is dropped.
    pub async fn run_bounded<F, R>(&self, f: F, limit: Duration) -> Result<R, WorkerError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let rx = self.submit(f)?;
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(WorkerError::Aborted),
            Err(_) => Err(WorkerError::TimedOut(limit)),
        }
    }

    /// Stop accepting jobs. Queued jobs still run before the thread exits.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            debug!("Worker {} shutting down", self.name);
        }
    }
}

impl Drop for NativeWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
