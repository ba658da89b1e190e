/*
 * 5D Labs PaddleJob Controller - Kubernetes Orchestrator for Distributed Training
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! PaddleJob controller core library
//!
//! Turns `PaddleJob` custom resources into a parameter-server `ReplicaSet` and a
//! trainer batch `Job`, then drives every job through its lifecycle:
//!
//! - [`watch`] turns the Kubernetes watch stream into add/update/delete events
//! - [`dispatcher`] owns the job registry and decides when to spawn managers
//! - [`lifecycle`] runs one state machine per job (create, poll, publish, release)
//! - [`translator`] maps a job spec to workload descriptors
//! - [`cluster`] is the only path through which the controller touches the cluster

pub mod cluster;
pub mod config;
pub mod crds;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod translator;
pub mod watch;

// Re-export commonly used types
pub use cluster::{ClusterClient, ClusterError, KubeCluster, PodCounts};
pub use config::ControllerConfig;
pub use crds::{JobPhase, PaddleJob, PaddleJobSpec, PaddleJobStatus};
pub use dispatcher::{Dispatcher, DispatcherMessage, JobEvent};
pub use error::{Error, Result};
pub use lifecycle::{LifecycleManager, LifecycleSettings, ManagerEvent, ManagerHandle};
