//! Worker-pool abstraction used to run dispatch off the I/O thread.

use std::sync::Arc;

use thiserror::Error;
use tokio::runtime::{Builder, Runtime};

/// Sink for dispatch work. Implementations guarantee eventual execution but
/// no ordering between submitted tasks; ordering per message type comes from
/// the pipeline run lock, not from the pool.
pub trait WorkerPool: Send + Sync {
    fn submit(&self, task: Box<dyn FnOnce() + Send + 'static>);
}

/// Errors raised while building the runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to build tokio runtime: {0}")]
    Build(std::io::Error),
}

/// Production pool backed by a multi-thread tokio runtime.
///
/// Handler chains are synchronous; tasks go through `spawn_blocking` so they
/// never occupy the runtime's core threads.
#[derive(Debug, Clone)]
pub struct TokioWorkerPool {
    runtime: Arc<Runtime>,
}

impl TokioWorkerPool {
    pub fn multi_thread(worker_threads: usize) -> Result<Self, RuntimeError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("weft-worker")
            .enable_all()
            .build()
            .map_err(RuntimeError::Build)?;
        Ok(Self {
            runtime: Arc::new(runtime),
        })
    }
}

impl WorkerPool for TokioWorkerPool {
    fn submit(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        self.runtime.spawn_blocking(task);
    }
}

/// Pool that runs tasks inline on the submitting thread.
///
/// Used by tests that need deterministic delivery and by embeddings that
/// drive the endpoint from a single thread of their own.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallerThreadPool;

impl WorkerPool for CallerThreadPool {
    fn submit(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        task();
    }
}
