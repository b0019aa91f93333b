//! A small owned set of background tasks.
//!
//! Failures are logged rather than propagated; dropping the last handle
//! aborts everything still running, so tasks never outlive their owner.

use crate::error::Error;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

#[derive(Clone)]
pub struct TaskSet {
    inner: Arc<Inner>,
}

struct Inner {
    label: &'static str,
    join: Mutex<JoinSet<()>>,
}

impl TaskSet {
    pub fn new(label: &'static str) -> Self {
        Self {
            inner: Arc::new(Inner {
                label,
                join: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Adds a task. Must be called from within a tokio runtime.
    pub fn add<F>(&self, task: F)
    where
        F: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let label = self.inner.label;
        let mut join = self.inner.join.lock().unwrap();
        // Reap whatever has already finished so the set stays small.
        while join.try_join_next().is_some() {}
        join.spawn(async move {
            if let Err(error) = task.await {
                tracing::error!(%error, "{label} task failed");
            }
        });
    }
}
