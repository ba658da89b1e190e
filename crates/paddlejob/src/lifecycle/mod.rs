//! Per-job lifecycle management
//!
//! Each managed job gets one [`LifecycleManager`] task. The dispatcher talks to
//! it only through the [`ManagerHandle`] returned by [`LifecycleManager::spawn`].

mod manager;

pub use manager::LifecycleManager;

use crate::crds::PaddleJob;
use crate::error::{Error, Result};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tracing::warn;

/// Timing and capacity knobs of a lifecycle manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleSettings {
    pub max_retries: u32,
    pub poll_interval: Duration,
    pub status_interval: Duration,
    pub event_capacity: usize,
    pub event_send_timeout: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            poll_interval: Duration::from_secs(5),
            status_interval: Duration::from_secs(10),
            event_capacity: 1000,
            event_send_timeout: Duration::from_secs(5),
        }
    }
}

/// Notification delivered to a running manager
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// The job object changed; only the held reference is replaced
    Modify(Box<PaddleJob>),
    /// The job was deleted; release everything and stop
    Delete,
}

/// Teardown failures collected while releasing a job's workloads
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to release resources of job {job}: {}", .failures.join("; "))]
pub struct ReleaseError {
    pub job: String,
    pub failures: Vec<String>,
}

/// Sending side of a manager task
#[derive(Debug)]
pub struct ManagerHandle {
    job: String,
    tx: mpsc::Sender<ManagerEvent>,
    task: JoinHandle<()>,
    send_timeout: Duration,
}

impl ManagerHandle {
    /// Deliver an event, waiting at most the configured send timeout for room.
    pub async fn notify(&self, event: ManagerEvent) -> Result<()> {
        self.tx
            .send_timeout(event, self.send_timeout)
            .await
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => Error::SendTimeout {
                    job: self.job.clone(),
                },
                SendTimeoutError::Closed(_) => Error::ChannelClosed {
                    job: self.job.clone(),
                },
            })?;

        let max = self.tx.max_capacity();
        let queued = max - self.tx.capacity();
        if queued * 5 > max * 4 {
            warn!(job = %self.job, queued, max, "Lifecycle event channel is more than 80% full");
        }
        Ok(())
    }

    pub async fn modify(&self, job: PaddleJob) -> Result<()> {
        self.notify(ManagerEvent::Modify(Box::new(job))).await
    }

    pub async fn delete(&self) -> Result<()> {
        self.notify(ManagerEvent::Delete).await
    }

    #[must_use]
    pub fn job(&self) -> &str {
        &self.job
    }

    /// Stop the manager task without releasing anything.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Whether the manager task has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
impl ManagerHandle {
    /// Handle around an arbitrary task, with the receiving side left to the caller
    pub(crate) fn detached(
        job: &str,
        capacity: usize,
        send_timeout: Duration,
        task: JoinHandle<()>,
    ) -> (Self, mpsc::Receiver<ManagerEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            job: job.to_string(),
            tx,
            task,
            send_timeout,
        };
        (handle, rx)
    }
}
