//! In-memory cluster used by scenario tests

use super::{ClusterClient, ClusterError, ClusterResult};
use crate::crds::{PaddleJob, PaddleJobStatus};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetStatus};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
pub struct FakeState {
    pub replica_sets: BTreeMap<String, ReplicaSet>,
    pub jobs: BTreeMap<String, Job>,
    pub pods: Vec<Pod>,
    /// Every call as `<method> <namespace>/<name or selector>`
    pub calls: Vec<String>,
    pub status_updates: Vec<PaddleJobStatus>,
    /// Job object of the most recent status write
    pub last_published: Option<PaddleJob>,
    /// Report created replica sets as fully ready
    pub ready_on_create: bool,
    pub fail_create_replica_group: Option<ClusterError>,
    pub fail_create_batch_job: Option<ClusterError>,
    pub fail_get_batch_job: Option<ClusterError>,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready_on_create() -> Self {
        let fake = Self::default();
        fake.state().ready_on_create = true;
        fake
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.split(' ').next() == Some(method))
            .count()
    }

    pub fn insert_batch_job(&self, namespace: &str, name: &str, parallelism: i32) {
        let job = Job {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(k8s_openapi::api::batch::v1::JobSpec {
                parallelism: Some(parallelism),
                ..Default::default()
            }),
            status: None,
        };
        self.state().jobs.insert(key(namespace, name), job);
    }

    pub fn set_batch_job_status(
        &self,
        namespace: &str,
        name: &str,
        active: i32,
        succeeded: i32,
        failed: i32,
    ) {
        if let Some(job) = self.state().jobs.get_mut(&key(namespace, name)) {
            job.status = Some(JobStatus {
                active: Some(active),
                succeeded: Some(succeeded),
                failed: Some(failed),
                ..Default::default()
            });
        }
    }

    pub fn add_pod(&self, namespace: &str, name: &str, label: (&str, &str), phase: &str) {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(label.0.to_string(), label.1.to_string())])),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        };
        self.state().pods.push(pod);
    }
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn matches(pod: &Pod, namespace: &str, selector: &str) -> bool {
    let Some((label, value)) = selector.split_once('=') else {
        return false;
    };
    pod.namespace().as_deref() == Some(namespace) && pod.labels().get(label).map(String::as_str) == Some(value)
}

impl FakeState {
    fn record(&mut self, method: &str, namespace: &str, target: &str) {
        self.calls.push(format!("{method} {}", key(namespace, target)));
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn create_replica_group(&self, replica_set: &ReplicaSet) -> ClusterResult<ReplicaSet> {
        let mut state = self.state();
        let namespace = replica_set.namespace().unwrap_or_default();
        let name = replica_set.name_any();
        state.record("create_replica_group", &namespace, &name);
        if let Some(err) = state.fail_create_replica_group.clone() {
            return Err(err);
        }
        if state.replica_sets.contains_key(&key(&namespace, &name)) {
            return Err(ClusterError::AlreadyExists(name));
        }

        let mut created = replica_set.clone();
        if state.ready_on_create {
            let replicas = created.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            created.status = Some(ReplicaSetStatus {
                replicas,
                ready_replicas: Some(replicas),
                ..Default::default()
            });
        }
        state
            .replica_sets
            .insert(key(&namespace, &name), created.clone());
        Ok(created)
    }

    async fn get_replica_group(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<ReplicaSet>> {
        let mut state = self.state();
        state.record("get_replica_group", namespace, name);
        Ok(state.replica_sets.get(&key(namespace, name)).cloned())
    }

    async fn delete_replica_group(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let mut state = self.state();
        state.record("delete_replica_group", namespace, name);
        state
            .replica_sets
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }

    async fn update_replica_group_replicas(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> ClusterResult<()> {
        let mut state = self.state();
        state.record("update_replica_group_replicas", namespace, name);
        let replica_set = state
            .replica_sets
            .get_mut(&key(namespace, name))
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))?;
        let selector = replica_set
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.match_labels.as_ref())
            .and_then(|labels| labels.iter().next())
            .map(|(label, value)| format!("{label}={value}"));
        if let Some(spec) = replica_set.spec.as_mut() {
            spec.replicas = Some(replicas);
        }
        if replicas == 0 {
            if let Some(selector) = selector {
                state.pods.retain(|pod| !matches(pod, namespace, &selector));
            }
        }
        Ok(())
    }

    async fn create_batch_job(&self, job: &Job) -> ClusterResult<Job> {
        let mut state = self.state();
        let namespace = job.namespace().unwrap_or_default();
        let name = job.name_any();
        state.record("create_batch_job", &namespace, &name);
        if let Some(err) = state.fail_create_batch_job.clone() {
            return Err(err);
        }
        if state.jobs.contains_key(&key(&namespace, &name)) {
            return Err(ClusterError::AlreadyExists(name));
        }
        state.jobs.insert(key(&namespace, &name), job.clone());
        Ok(job.clone())
    }

    async fn get_batch_job(&self, namespace: &str, name: &str) -> ClusterResult<Option<Job>> {
        let mut state = self.state();
        state.record("get_batch_job", namespace, name);
        if let Some(err) = state.fail_get_batch_job.clone() {
            return Err(err);
        }
        Ok(state.jobs.get(&key(namespace, name)).cloned())
    }

    async fn delete_batch_job(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let mut state = self.state();
        state.record("delete_batch_job", namespace, name);
        state
            .jobs
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> ClusterResult<Vec<Pod>> {
        let mut state = self.state();
        state.record("list_pods", namespace, selector);
        Ok(state
            .pods
            .iter()
            .filter(|pod| matches(pod, namespace, selector))
            .cloned()
            .collect())
    }

    async fn delete_pods(&self, namespace: &str, selector: &str) -> ClusterResult<()> {
        let mut state = self.state();
        state.record("delete_pods", namespace, selector);
        state.pods.retain(|pod| !matches(pod, namespace, selector));
        Ok(())
    }

    async fn update_job_status(&self, job: &PaddleJob) -> ClusterResult<PaddleJob> {
        let mut state = self.state();
        state.record(
            "update_job_status",
            &job.namespace().unwrap_or_default(),
            &job.name_any(),
        );
        state
            .status_updates
            .push(job.status.clone().unwrap_or_default());
        state.last_published = Some(job.clone());
        Ok(job.clone())
    }
}
