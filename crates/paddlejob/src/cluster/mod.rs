//! Cluster adapter
//!
//! Every side effect the controller has on the cluster goes through
//! [`ClusterClient`]. Production code uses [`KubeCluster`]; tests use mocks or
//! the in-memory fake.

#[cfg(test)]
pub mod fake;
mod kube_cluster;

pub use kube_cluster::KubeCluster;

use crate::crds::PaddleJob;
use crate::translator::trainer_selector;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

/// Classified failure of a cluster call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Timeouts and rate limiting; the caller may retry
    #[error("transient cluster error: {0}")]
    Transient(String),

    #[error("cluster error: {0}")]
    Other(String),
}

impl ClusterError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Transient(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(response) if response.code == 404 => {
                ClusterError::NotFound(response.message.clone())
            }
            kube::Error::Api(response) if response.code == 409 => {
                ClusterError::AlreadyExists(response.message.clone())
            }
            kube::Error::Api(response)
                if matches!(response.code, 429 | 504)
                    || matches!(
                        response.reason.as_str(),
                        "ServerTimeout" | "Timeout" | "TooManyRequests"
                    ) =>
            {
                ClusterError::Transient(err.to_string())
            }
            kube::Error::HyperError(_) | kube::Error::Service(_) => {
                ClusterError::Transient(err.to_string())
            }
            _ => ClusterError::Other(err.to_string()),
        }
    }
}

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Narrow view of the cluster API used by the dispatcher and lifecycle managers.
///
/// `get_*` calls return `Ok(None)` when the object does not exist. Deletes
/// report `ClusterError::NotFound` for missing objects; callers treat that as
/// success.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn create_replica_group(&self, replica_set: &ReplicaSet) -> ClusterResult<ReplicaSet>;

    async fn get_replica_group(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<ReplicaSet>>;

    async fn delete_replica_group(&self, namespace: &str, name: &str) -> ClusterResult<()>;

    /// Set `spec.replicas` of an existing replica group
    async fn update_replica_group_replicas(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> ClusterResult<()>;

    async fn create_batch_job(&self, job: &Job) -> ClusterResult<Job>;

    async fn get_batch_job(&self, namespace: &str, name: &str) -> ClusterResult<Option<Job>>;

    async fn delete_batch_job(&self, namespace: &str, name: &str) -> ClusterResult<()>;

    async fn list_pods(&self, namespace: &str, selector: &str) -> ClusterResult<Vec<Pod>>;

    /// Delete every pod matching the label selector
    async fn delete_pods(&self, namespace: &str, selector: &str) -> ClusterResult<()>;

    /// Persist the `status` subresource of the job
    async fn update_job_status(&self, job: &PaddleJob) -> ClusterResult<PaddleJob>;
}

/// Pod phase tally for one selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PodCounts {
    pub total: usize,
    pub running: usize,
    pub succeeded: usize,
    pub pending: usize,
}

impl PodCounts {
    /// Running and pending only count pods that are not being deleted.
    #[must_use]
    pub fn from_pods(pods: &[Pod]) -> Self {
        let mut counts = PodCounts {
            total: pods.len(),
            ..Default::default()
        };

        for pod in pods {
            let terminating = pod.metadata.deletion_timestamp.is_some();
            match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
                Some("Running") if !terminating => counts.running += 1,
                Some("Pending") if !terminating => counts.pending += 1,
                Some("Succeeded") => counts.succeeded += 1,
                _ => {}
            }
        }
        counts
    }

    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.total > 0 && self.total == self.succeeded
    }
}

/// Count the trainer pods of a job.
pub async fn job_pods(
    cluster: &dyn ClusterClient,
    namespace: &str,
    job_name: &str,
) -> ClusterResult<PodCounts> {
    let pods = cluster
        .list_pods(namespace, &trainer_selector(job_name))
        .await?;
    Ok(PodCounts::from_pods(&pods))
}
