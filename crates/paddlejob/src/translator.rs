//! Translation of a `PaddleJob` into the workloads that run it
//!
//! Every function here is pure: the same job always yields the same
//! descriptors. The parameter servers become an `apps/v1` `ReplicaSet`
//! (`<job>-pserver`) and the trainers a `batch/v1` `Job` (`<job>-trainer`).

use crate::crds::{PaddleJob, PaddleJobSpec, GPU_RESOURCE};
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use std::collections::BTreeMap;
use thiserror::Error;

pub const DEFAULT_PORT: i32 = 7164;
pub const DEFAULT_PORTS_NUM: i32 = 1;
pub const DEFAULT_PORTS_NUM_FOR_SPARSE: i32 = 1;
pub const DEFAULT_IMAGE: &str = "paddlepaddle/paddlecloud-job";
pub const DEFAULT_PASSES: i32 = 1;
/// Highest valid container port
pub const MAX_PORT: i32 = 65535;

/// Pod label carried by parameter-server pods, valued with the job name
pub const PSERVER_LABEL: &str = "paddle-job-pserver";
/// Pod label carried by trainer pods, valued with the job name
pub const TRAINER_LABEL: &str = "paddle-job";

const IMAGE_PULL_POLICY: &str = "Always";
const CUDA_LIBRARY_PATH: &str = "/usr/local/cuda/lib64";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    #[error("job is missing metadata.name")]
    MissingName,

    #[error("job {0} is missing metadata.namespace")]
    MissingNamespace(String),

    #[error("port range from {port} with {dense} dense and {sparse} sparse ports is outside 1-65535")]
    InvalidPorts { port: i32, dense: i32, sparse: i32 },
}

/// Apply admission defaults to a job spec.
///
/// Never fails and is idempotent: already-set fields are left alone.
#[must_use]
pub fn validate(mut spec: PaddleJobSpec) -> PaddleJobSpec {
    if spec.port == 0 {
        spec.port = DEFAULT_PORT;
    }
    if spec.ports_num == 0 {
        spec.ports_num = DEFAULT_PORTS_NUM;
    }
    if spec.ports_num_for_sparse == 0 {
        spec.ports_num_for_sparse = DEFAULT_PORTS_NUM_FOR_SPARSE;
    }
    if spec.image.is_empty() {
        spec.image = DEFAULT_IMAGE.to_string();
    }
    if spec.passes == 0 {
        spec.passes = DEFAULT_PASSES;
    }
    spec
}

/// Normalize the spec and materialize both workload descriptors on a copy of the job.
pub fn parse(job: &PaddleJob) -> Result<PaddleJob, TranslateError> {
    let name = job
        .metadata
        .name
        .as_deref()
        .filter(|name| !name.is_empty())
        .ok_or(TranslateError::MissingName)?;
    if job.metadata.namespace.as_deref().is_none_or(str::is_empty) {
        return Err(TranslateError::MissingNamespace(name.to_string()));
    }

    let mut parsed = job.clone();
    parsed.spec = validate(parsed.spec);
    check_ports(&parsed.spec)?;
    parsed.spec.pserver.replica_spec = Some(to_pserver(&parsed));
    parsed.spec.trainer.replica_spec = Some(to_trainer(&parsed));
    Ok(parsed)
}

/// Every port of the range must be a valid container port.
fn check_ports(spec: &PaddleJobSpec) -> Result<(), TranslateError> {
    let invalid = || TranslateError::InvalidPorts {
        port: spec.port,
        dense: spec.ports_num,
        sparse: spec.ports_num_for_sparse,
    };
    if spec.ports_num < 0 || spec.ports_num_for_sparse < 0 {
        return Err(invalid());
    }
    let total = spec
        .ports_num
        .checked_add(spec.ports_num_for_sparse)
        .filter(|total| *total > 0)
        .ok_or_else(invalid)?;
    let last = spec.port.checked_add(total - 1).ok_or_else(invalid)?;
    if spec.port < 1 || last > MAX_PORT {
        return Err(invalid());
    }
    Ok(())
}

/// Label selector matching the job's parameter-server pods
#[must_use]
pub fn pserver_selector(job_name: &str) -> String {
    format!("{PSERVER_LABEL}={job_name}")
}

/// Label selector matching the job's trainer pods
#[must_use]
pub fn trainer_selector(job_name: &str) -> String {
    format!("{TRAINER_LABEL}={job_name}")
}

/// Build the parameter-server `ReplicaSet` descriptor.
#[must_use]
pub fn to_pserver(job: &PaddleJob) -> ReplicaSet {
    let labels = BTreeMap::from([(PSERVER_LABEL.to_string(), job.name_any())]);

    let container = Container {
        name: "pserver".to_string(),
        image: Some(job.spec.image.clone()),
        command: Some(vec!["paddle_k8s".to_string(), "start_pserver".to_string()]),
        ports: Some(pod_ports(&job.spec)),
        env: Some(pod_env(job)),
        resources: Some(job.spec.pserver.resources.clone()),
        ..Default::default()
    };

    ReplicaSet {
        metadata: ObjectMeta {
            name: Some(job.pserver_name()),
            namespace: job.namespace(),
            ..Default::default()
        },
        spec: Some(ReplicaSetSpec {
            replicas: Some(job.spec.pserver.min_instance),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: Some(PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    volumes: Some(job.spec.volumes.clone()),
                    containers: vec![container],
                    node_selector: Some(job.spec.node_selector.clone()),
                    host_network: Some(job.spec.host_network),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the trainer batch `Job` descriptor.
#[must_use]
pub fn to_trainer(job: &PaddleJob) -> Job {
    let labels = BTreeMap::from([(TRAINER_LABEL.to_string(), job.name_any())]);

    let container = Container {
        name: "trainer".to_string(),
        image: Some(job.spec.image.clone()),
        image_pull_policy: Some(IMAGE_PULL_POLICY.to_string()),
        command: Some(vec![
            "paddle_k8s".to_string(),
            "start_trainer".to_string(),
            "v2".to_string(),
        ]),
        volume_mounts: Some(job.spec.volume_mounts.clone()),
        ports: Some(pod_ports(&job.spec)),
        env: Some(pod_env(job)),
        resources: Some(job.spec.trainer.resources.clone()),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(job.trainer_name()),
            namespace: job.namespace(),
            ..Default::default()
        },
        spec: Some(JobSpec {
            parallelism: Some(job.spec.trainer.min_instance),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    volumes: Some(job.spec.volumes.clone()),
                    containers: vec![container],
                    restart_policy: Some("Never".to_string()),
                    node_selector: Some(job.spec.node_selector.clone()),
                    host_network: Some(job.spec.host_network),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Contiguous container ports shared by trainers and pservers, one per dense
/// and sparse parameter port, each named `jobport-<port>`.
///
/// The range stops at the first port outside `1..=MAX_PORT`; [`parse`] rejects
/// such specs up front.
#[must_use]
pub fn pod_ports(spec: &PaddleJobSpec) -> Vec<ContainerPort> {
    let total = spec.ports_num.saturating_add(spec.ports_num_for_sparse);
    (0..total.max(0))
        .map_while(|offset| {
            spec.port
                .checked_add(offset)
                .filter(|port| (1..=MAX_PORT).contains(port))
        })
        .map(|port| ContainerPort {
            name: Some(format!("jobport-{port}")),
            container_port: port,
            ..Default::default()
        })
        .collect()
}

/// Environment shared by trainers and pservers.
///
/// `TRAINERS`, `PSERVERS` and `PADDLE_INIT_NUM_GRADIENT_SERVERS` always use the
/// minimum instance counts. `NAMESPACE` and `POD_IP` are resolved by the kubelet.
#[must_use]
pub fn pod_env(job: &PaddleJob) -> Vec<EnvVar> {
    let spec = &job.spec;
    let need_gpu = job.need_gpu();
    // GPU count when GPUs are requested, otherwise whole CPU cores (sub-core requests become 0)
    let trainer_count = if need_gpu {
        trainer_request(job, GPU_RESOURCE)
    } else {
        trainer_request(job, "cpu")
    };

    vec![
        env("PADDLE_JOB_NAME", job.name_any()),
        env("TRAINERS", spec.trainer.min_instance.to_string()),
        env("PSERVERS", spec.pserver.min_instance.to_string()),
        env("ENTRY", spec.trainer.entrypoint.clone()),
        env("TOPOLOGY", spec.trainer.entrypoint.clone()),
        env("TRAINER_PACKAGE", spec.trainer.workspace.clone()),
        env("PADDLE_INIT_PORT", spec.port.to_string()),
        env("PADDLE_INIT_TRAINER_COUNT", trainer_count.to_string()),
        env("PADDLE_INIT_PORTS_NUM", spec.ports_num.to_string()),
        env(
            "PADDLE_INIT_PORTS_NUM_FOR_SPARSE",
            spec.ports_num_for_sparse.to_string(),
        ),
        env(
            "PADDLE_INIT_NUM_GRADIENT_SERVERS",
            spec.trainer.min_instance.to_string(),
        ),
        env("PADDLE_INIT_NUM_PASSES", spec.passes.to_string()),
        env("PADDLE_INIT_USE_GPU", if need_gpu { "1" } else { "0" }),
        env("LD_LIBRARY_PATH", CUDA_LIBRARY_PATH),
        field_env("NAMESPACE", "metadata.namespace"),
        field_env("POD_IP", "status.podIP"),
    ]
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                api_version: None,
            }),
            ..Default::default()
        }),
    }
}

fn trainer_request(job: &PaddleJob, resource: &str) -> i64 {
    job.spec
        .trainer
        .resources
        .requests
        .as_ref()
        .and_then(|requests| requests.get(resource))
        .map_or(0, quantity_truncated)
}

/// Exact integer value of a quantity, `None` when it is fractional or malformed.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn quantity_as_int(quantity: &Quantity) -> Option<i64> {
    let value = parse_quantity(&quantity.0)?;
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}

/// Integer part of a quantity, zero when malformed.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn quantity_truncated(quantity: &Quantity) -> i64 {
    parse_quantity(&quantity.0).map_or(0, |value| value.trunc() as i64)
}

fn parse_quantity(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(value) = raw.parse::<f64>() {
        return Some(value);
    }

    let split = raw.find(|c: char| c.is_ascii_alphabetic())?;
    let (number, suffix) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;

    let scaled = match suffix {
        "n" => value / 1e9,
        "u" => value / 1e6,
        "m" => value / 1e3,
        "k" => value * 1e3,
        "M" => value * 1e6,
        "G" => value * 1e9,
        "T" => value * 1e12,
        "P" => value * 1e15,
        "E" => value * 1e18,
        "Ki" => value * 1024.0,
        "Mi" => value * 1024.0_f64.powi(2),
        "Gi" => value * 1024.0_f64.powi(3),
        "Ti" => value * 1024.0_f64.powi(4),
        "Pi" => value * 1024.0_f64.powi(5),
        "Ei" => value * 1024.0_f64.powi(6),
        _ => return None,
    };
    Some(scaled)
}
