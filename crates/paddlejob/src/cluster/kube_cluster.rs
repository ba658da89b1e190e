use super::{ClusterClient, ClusterError, ClusterResult};
use crate::crds::PaddleJob;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::debug;

/// [`ClusterClient`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of(meta: &ObjectMeta, kind: &str) -> ClusterResult<String> {
    meta.namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .ok_or_else(|| {
            ClusterError::Other(format!(
                "{kind} {} has no namespace",
                meta.name.as_deref().unwrap_or_default()
            ))
        })
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn create_replica_group(&self, replica_set: &ReplicaSet) -> ClusterResult<ReplicaSet> {
        let namespace = namespace_of(&replica_set.metadata, "replica set")?;
        let created = self
            .namespaced::<ReplicaSet>(&namespace)
            .create(&PostParams::default(), replica_set)
            .await?;
        debug!(namespace = %namespace, name = %created.name_any(), "Created replica set");
        Ok(created)
    }

    async fn get_replica_group(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<ReplicaSet>> {
        Ok(self.namespaced::<ReplicaSet>(namespace).get_opt(name).await?)
    }

    async fn delete_replica_group(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        self.namespaced::<ReplicaSet>(namespace)
            .delete(name, &DeleteParams::background())
            .await?;
        debug!(namespace = %namespace, name = %name, "Deleted replica set");
        Ok(())
    }

    async fn update_replica_group_replicas(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> ClusterResult<()> {
        let patch = json!({ "spec": { "replicas": replicas } });
        self.namespaced::<ReplicaSet>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(namespace = %namespace, name = %name, replicas, "Scaled replica set");
        Ok(())
    }

    async fn create_batch_job(&self, job: &Job) -> ClusterResult<Job> {
        let namespace = namespace_of(&job.metadata, "batch job")?;
        let created = self
            .namespaced::<Job>(&namespace)
            .create(&PostParams::default(), job)
            .await?;
        debug!(namespace = %namespace, name = %created.name_any(), "Created batch job");
        Ok(created)
    }

    async fn get_batch_job(&self, namespace: &str, name: &str) -> ClusterResult<Option<Job>> {
        Ok(self.namespaced::<Job>(namespace).get_opt(name).await?)
    }

    async fn delete_batch_job(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        self.namespaced::<Job>(namespace)
            .delete(name, &DeleteParams::background())
            .await?;
        debug!(namespace = %namespace, name = %name, "Deleted batch job");
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> ClusterResult<Vec<Pod>> {
        let pods = self
            .namespaced::<Pod>(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(pods.items)
    }

    async fn delete_pods(&self, namespace: &str, selector: &str) -> ClusterResult<()> {
        self.namespaced::<Pod>(namespace)
            .delete_collection(
                &DeleteParams::background(),
                &ListParams::default().labels(selector),
            )
            .await?;
        debug!(namespace = %namespace, selector = %selector, "Deleted pods");
        Ok(())
    }

    async fn update_job_status(&self, job: &PaddleJob) -> ClusterResult<PaddleJob> {
        let namespace = namespace_of(&job.metadata, "paddle job")?;
        let patch = json!({ "status": job.status });
        let updated = self
            .namespaced::<PaddleJob>(&namespace)
            .patch_status(&job.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(updated)
    }
}
