//! `PaddleJob` Custom Resource Definition for distributed training jobs

use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ResourceRequirements, Volume, VolumeMount};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Extended resource name used for GPU requests and limits
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// `PaddleJob` CRD describing a trainer tier and a parameter-server tier
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "paddlepaddle.org", version = "v1", kind = "PaddleJob")]
#[kube(plural = "paddlejobs", shortname = "tj")]
#[kube(namespaced)]
#[kube(status = "PaddleJobStatus")]
#[kube(derive = "PartialEq")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct PaddleJobSpec {
    /// Container image shared by trainers and pservers
    #[serde(default)]
    pub image: String,

    /// Run pods in the host network namespace instead of the container network
    #[serde(default)]
    pub host_network: bool,

    /// First port of the contiguous port range
    #[serde(default)]
    pub port: i32,

    /// Number of dense-parameter ports
    #[serde(default)]
    pub ports_num: i32,

    /// Number of sparse-parameter ports
    #[serde(default)]
    pub ports_num_for_sparse: i32,

    /// Number of training passes
    #[serde(default)]
    pub passes: i32,

    #[serde(default)]
    pub volumes: Vec<Volume>,

    #[serde(default, rename = "VolumeMounts")]
    pub volume_mounts: Vec<VolumeMount>,

    #[serde(default, rename = "NodeSelector")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default)]
    pub pserver: PserverSpec,

    #[serde(default)]
    pub trainer: TrainerSpec,
}

/// Parameter-server tier
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PserverSpec {
    #[serde(default, rename = "min-instance")]
    pub min_instance: i32,

    #[serde(default, rename = "max-instance")]
    pub max_instance: i32,

    #[serde(default)]
    pub resources: ResourceRequirements,

    /// Materialized `ReplicaSet` descriptor, filled in by the translator
    #[serde(default, rename = "replicaSpec", skip_serializing_if = "Option::is_none")]
    #[schemars(skip)]
    pub replica_spec: Option<ReplicaSet>,
}

/// Trainer tier
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct TrainerSpec {
    /// Training entrypoint command
    #[serde(default)]
    pub entrypoint: String,

    /// Path of the trainer package inside the container
    #[serde(default)]
    pub workspace: String,

    #[serde(default, rename = "min-instance")]
    pub min_instance: i32,

    #[serde(default, rename = "max-instance")]
    pub max_instance: i32,

    #[serde(default)]
    pub resources: ResourceRequirements,

    /// Materialized batch `Job` descriptor, filled in by the translator
    #[serde(default, rename = "replicaSpec", skip_serializing_if = "Option::is_none")]
    #[schemars(skip)]
    pub replica_spec: Option<Job>,
}

/// Coarse lifecycle stage of a `PaddleJob`
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum JobPhase {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "creating")]
    Creating,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

impl JobPhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }

    /// Whether the lifecycle state machine allows moving from `self` to `next`.
    ///
    /// Only forward edges exist: None → Creating → Running → Succeeded, and any
    /// non-terminal phase may fail. Terminal phases have no outgoing edges.
    #[must_use]
    pub fn can_transition_to(self, next: JobPhase) -> bool {
        matches!(
            (self, next),
            (JobPhase::None, JobPhase::Creating | JobPhase::Failed)
                | (JobPhase::Creating, JobPhase::Running | JobPhase::Failed)
                | (JobPhase::Running, JobPhase::Succeeded | JobPhase::Failed)
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::None => "",
            JobPhase::Creating => "creating",
            JobPhase::Running => "running",
            JobPhase::Succeeded => "succeeded",
            JobPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPhase::None => f.write_str("none"),
            phase => f.write_str(phase.as_str()),
        }
    }
}

/// Kind of workload tracked in `replica_statuses`
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum TrainingResourceType {
    #[serde(rename = "PSERVER")]
    Pserver,
    #[serde(rename = "TRAINER")]
    Trainer,
}

/// State of one resource tier
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema,
)]
pub enum ResourceState {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "starting")]
    Starting,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "succeeded")]
    Succeeded,
}

/// Status of one resource tier with per-state instance counts
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct TrainingResourceStatus {
    #[serde(rename = "training_resource_type")]
    pub resource_type: TrainingResourceType,

    #[serde(default)]
    pub state: ResourceState,

    #[serde(default)]
    pub resource_states: BTreeMap<ResourceState, i32>,
}

impl TrainingResourceStatus {
    /// Status entry with no detail yet; the trainer tier is reported this way
    /// until per-pod accounting exists.
    #[must_use]
    pub fn placeholder(resource_type: TrainingResourceType) -> Self {
        Self {
            resource_type,
            state: ResourceState::None,
            resource_states: BTreeMap::new(),
        }
    }
}

/// Status of the `PaddleJob`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PaddleJobStatus {
    #[serde(default)]
    pub phase: JobPhase,

    /// Human-readable reason for the current phase, set on failure
    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub replica_statuses: Vec<TrainingResourceStatus>,
}

impl PaddleJob {
    /// GPU count from the trainer resource limits; unreadable values count as zero.
    #[must_use]
    pub fn gpu(&self) -> i64 {
        self.spec
            .trainer
            .resources
            .limits
            .as_ref()
            .and_then(|limits| limits.get(GPU_RESOURCE))
            .and_then(crate::translator::quantity_as_int)
            .unwrap_or(0)
    }

    #[must_use]
    pub fn need_gpu(&self) -> bool {
        self.gpu() > 0
    }

    #[must_use]
    pub fn phase(&self) -> JobPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Registry key, `<namespace>/<name>`
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    #[must_use]
    pub fn pserver_name(&self) -> String {
        format!("{}-pserver", self.name_any())
    }

    #[must_use]
    pub fn trainer_name(&self) -> String {
        format!("{}-trainer", self.name_any())
    }
}
