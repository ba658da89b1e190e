use super::{LifecycleSettings, ManagerEvent, ManagerHandle, ReleaseError};
use crate::cluster::{ClusterClient, ClusterError, ClusterResult};
use crate::crds::{
    JobPhase, PaddleJob, PaddleJobStatus, TrainingResourceStatus, TrainingResourceType,
};
use crate::translator::{self, pserver_selector, trainer_selector};
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, instrument, warn};

const CREATE_RESOURCE_ERROR: &str = "Internal error; create resource error:";
const CREATE_TRAINER_ERROR: &str = "Internal error; create trainer error:";
const TRAINERS_FAILED: &str = "at least one trainer failed!";
const TRAINERS_SUCCEEDED: &str = "all trainer have succeeded!";

/// Workload descriptors materialized once per manager
struct JobResources {
    pserver: ReplicaSet,
    trainer: Job,
}

impl JobResources {
    fn from_parsed(parsed: PaddleJob) -> Option<Self> {
        Some(Self {
            pserver: parsed.spec.pserver.replica_spec?,
            trainer: parsed.spec.trainer.replica_spec?,
        })
    }
}

/// Next unit of work. Each step runs to completion between event checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Translate,
    EnsurePserver { attempt: u32 },
    AwaitPserver { attempt: u32 },
    EnsureTrainer { attempt: u32 },
    Monitor,
    Finished,
}

/// State machine driving one `PaddleJob` from creation to teardown.
///
/// The manager owns the authoritative status of its job. The starting point is
/// taken from the persisted phase, so a restarted controller resumes where
/// the previous one stopped: jobs still creating re-run the idempotent
/// ensure steps, running jobs go straight to monitoring and terminal jobs only
/// wait for deletion.
pub struct LifecycleManager {
    job: PaddleJob,
    cluster: Arc<dyn ClusterClient>,
    settings: LifecycleSettings,
    status: PaddleJobStatus,
    persisted: Option<PaddleJobStatus>,
    resources: Option<JobResources>,
    stage: Stage,
    released: bool,
}

impl LifecycleManager {
    #[must_use]
    pub fn new(
        job: PaddleJob,
        cluster: Arc<dyn ClusterClient>,
        settings: LifecycleSettings,
    ) -> Self {
        let persisted = job.status.clone();
        let status = persisted.clone().unwrap_or_default();
        let stage = match status.phase {
            JobPhase::None | JobPhase::Creating => Stage::Translate,
            JobPhase::Running => Stage::Monitor,
            JobPhase::Succeeded | JobPhase::Failed => Stage::Finished,
        };

        Self {
            job,
            cluster,
            settings,
            status,
            persisted,
            resources: None,
            stage,
            released: false,
        }
    }

    /// Start a manager task for `job` and return the handle used to reach it.
    pub fn spawn(
        job: PaddleJob,
        cluster: Arc<dyn ClusterClient>,
        settings: LifecycleSettings,
    ) -> ManagerHandle {
        let (tx, rx) = mpsc::channel(settings.event_capacity.max(1));
        let send_timeout = settings.event_send_timeout;
        let key = job.key();
        let manager = Self::new(job, cluster, settings);
        let task = tokio::spawn(manager.run(rx));

        ManagerHandle {
            job: key,
            tx,
            task,
            send_timeout,
        }
    }

    /// Drive the job until it is deleted or the event channel closes.
    #[instrument(skip_all, fields(job = %self.job.key()))]
    pub async fn run(mut self, mut rx: mpsc::Receiver<ManagerEvent>) {
        info!(phase = %self.status.phase, "Lifecycle manager started");
        let mut deadline = (self.stage != Stage::Finished).then(Instant::now);

        loop {
            let timer = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                event = rx.recv() => match event {
                    Some(ManagerEvent::Delete) => {
                        info!(phase = %self.status.phase, "Job deleted, releasing resources");
                        self.release().await;
                        return;
                    }
                    Some(ManagerEvent::Modify(job)) => {
                        debug!("Job modified");
                        self.job = *job;
                    }
                    None => {
                        debug!("Event channel closed, stopping lifecycle manager");
                        return;
                    }
                },
                () = timer => {
                    deadline = self.step().await.map(|delay| Instant::now() + delay);
                }
            }
        }
    }

    /// Run the current stage and return the delay before the next one, if any.
    async fn step(&mut self) -> Option<Duration> {
        match self.stage {
            Stage::Translate => self.translate().await,
            Stage::EnsurePserver { attempt } => self.ensure_pserver(attempt).await,
            Stage::AwaitPserver { attempt } => self.await_pserver(attempt).await,
            Stage::EnsureTrainer { attempt } => self.ensure_trainer(attempt).await,
            Stage::Monitor => self.monitor().await,
            Stage::Finished => None,
        }
    }

    async fn translate(&mut self) -> Option<Duration> {
        let resources = match translator::parse(&self.job) {
            Ok(parsed) => JobResources::from_parsed(parsed),
            Err(err) => {
                error!(error = %err, "Failed to translate job");
                return self.finish(JobPhase::Failed, err.to_string()).await;
            }
        };
        let Some(resources) = resources else {
            return self
                .finish(JobPhase::Failed, "translation produced no workload descriptors")
                .await;
        };
        self.resources = Some(resources);

        if self.status.phase == JobPhase::None {
            self.transition(JobPhase::Creating, String::new());
            self.publish_status().await;
        }
        self.stage = Stage::EnsurePserver { attempt: 0 };
        Some(Duration::ZERO)
    }

    async fn ensure_pserver(&mut self, attempt: u32) -> Option<Duration> {
        let Some(pserver) = self.resources.as_ref().map(|r| r.pserver.clone()) else {
            self.stage = Stage::Translate;
            return Some(Duration::ZERO);
        };
        let namespace = self.namespace();
        let name = self.job.pserver_name();

        let result = match self.cluster.get_replica_group(&namespace, &name).await {
            Ok(Some(_)) => {
                debug!(replica_set = %name, "Parameter server replica set already exists");
                Ok(())
            }
            Ok(None) => match self.cluster.create_replica_group(&pserver).await {
                Ok(_) => {
                    info!(replica_set = %name, "Created parameter server replica set");
                    Ok(())
                }
                Err(ClusterError::AlreadyExists(_)) => Ok(()),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                self.stage = Stage::AwaitPserver { attempt: 0 };
                Some(self.settings.poll_interval)
            }
            Err(err) => {
                let retry = Stage::EnsurePserver {
                    attempt: attempt + 1,
                };
                self.retry_or_fail(err, attempt, retry, CREATE_RESOURCE_ERROR)
                    .await
            }
        }
    }

    async fn await_pserver(&mut self, attempt: u32) -> Option<Duration> {
        let namespace = self.namespace();
        let name = self.job.pserver_name();
        let retry = Stage::AwaitPserver {
            attempt: attempt + 1,
        };

        let replica_set = match self.cluster.get_replica_group(&namespace, &name).await {
            Ok(Some(replica_set)) => replica_set,
            Ok(None) => {
                let reason = format!("{CREATE_RESOURCE_ERROR}replica set {name} disappeared");
                return self.finish(JobPhase::Failed, reason).await;
            }
            Err(err) => {
                return self
                    .retry_or_fail(err, attempt, retry, CREATE_RESOURCE_ERROR)
                    .await
            }
        };

        let desired = replica_set
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(1);
        let ready = replica_set
            .status
            .as_ref()
            .and_then(|status| status.ready_replicas)
            .unwrap_or(0);

        // Scaled to zero under us: someone is tearing the job down
        if desired == 0 {
            let reason = format!("{CREATE_RESOURCE_ERROR}replica set {name} was scaled to zero");
            return self.finish(JobPhase::Failed, reason).await;
        }

        if ready == desired {
            info!(replica_set = %name, ready, "Parameter servers are ready");
            self.stage = Stage::EnsureTrainer { attempt: 0 };
            return Some(Duration::ZERO);
        }

        if attempt + 1 >= self.settings.max_retries {
            let reason = format!(
                "{CREATE_RESOURCE_ERROR}replica set {name} not ready after {} polls ({ready}/{desired} ready)",
                self.settings.max_retries
            );
            return self.finish(JobPhase::Failed, reason).await;
        }

        debug!(replica_set = %name, ready, desired, attempt, "Waiting for parameter servers");
        self.stage = retry;
        Some(self.settings.poll_interval)
    }

    async fn ensure_trainer(&mut self, attempt: u32) -> Option<Duration> {
        let Some(trainer) = self.resources.as_ref().map(|r| r.trainer.clone()) else {
            self.stage = Stage::Translate;
            return Some(Duration::ZERO);
        };
        let namespace = self.namespace();
        let name = self.job.trainer_name();

        let result = match self.cluster.get_batch_job(&namespace, &name).await {
            Ok(Some(_)) => {
                debug!(trainer_job = %name, "Trainer job already exists");
                Ok(())
            }
            Ok(None) => match self.cluster.create_batch_job(&trainer).await {
                Ok(_) => {
                    info!(trainer_job = %name, "Created trainer job");
                    Ok(())
                }
                Err(ClusterError::AlreadyExists(_)) => Ok(()),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                self.transition(JobPhase::Running, String::new());
                self.publish_status().await;
                self.stage = Stage::Monitor;
                Some(self.settings.status_interval)
            }
            Err(err) => {
                let retry = Stage::EnsureTrainer {
                    attempt: attempt + 1,
                };
                self.retry_or_fail(err, attempt, retry, CREATE_TRAINER_ERROR)
                    .await
            }
        }
    }

    /// Evaluate trainer progress while the job is running. A failed lookup
    /// leaves the status untouched until the next poll.
    async fn monitor(&mut self) -> Option<Duration> {
        let namespace = self.namespace();
        let name = self.job.trainer_name();

        let trainer = match self.cluster.get_batch_job(&namespace, &name).await {
            Ok(Some(trainer)) => trainer,
            Ok(None) => {
                warn!(trainer_job = %name, "Trainer job not found");
                return Some(self.settings.status_interval);
            }
            Err(err) => {
                warn!(trainer_job = %name, error = %err, "Failed to fetch trainer job");
                return Some(self.settings.status_interval);
            }
        };

        self.status.replica_statuses = vec![TrainingResourceStatus::placeholder(
            TrainingResourceType::Trainer,
        )];

        let status = trainer.status.unwrap_or_default();
        let failed = status.failed.unwrap_or(0);
        let succeeded = status.succeeded.unwrap_or(0);
        let active = status.active.unwrap_or(0);
        let parallelism = trainer
            .spec
            .as_ref()
            .and_then(|spec| spec.parallelism)
            .unwrap_or(1);

        if failed > 0 {
            warn!(trainer_job = %name, failed, "Trainer pods failed");
            return self.finish(JobPhase::Failed, TRAINERS_FAILED).await;
        }
        if succeeded == parallelism && active == 0 {
            return self.finish(JobPhase::Succeeded, TRAINERS_SUCCEEDED).await;
        }

        debug!(trainer_job = %name, active, succeeded, parallelism, "Trainers still running");
        self.publish_status().await;
        Some(self.settings.status_interval)
    }

    async fn retry_or_fail(
        &mut self,
        err: ClusterError,
        attempt: u32,
        retry: Stage,
        reason_prefix: &str,
    ) -> Option<Duration> {
        if err.is_transient() && attempt + 1 < self.settings.max_retries {
            warn!(error = %err, attempt, "Transient cluster error, retrying");
            self.stage = retry;
            return Some(self.settings.poll_interval);
        }

        error!(error = %err, "Failed to create job resources");
        self.finish(JobPhase::Failed, format!("{reason_prefix}{err}"))
            .await
    }

    /// Enter a terminal phase: publish it, release everything, stop the timer.
    async fn finish(&mut self, phase: JobPhase, reason: impl Into<String>) -> Option<Duration> {
        if self.transition(phase, reason.into()) {
            self.publish_status().await;
        }
        self.release().await;
        self.stage = Stage::Finished;
        None
    }

    fn transition(&mut self, next: JobPhase, reason: String) -> bool {
        let current = self.status.phase;
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "Ignoring invalid phase transition");
            return false;
        }

        info!(from = %current, to = %next, reason = %reason, "Job phase changed");
        self.status.phase = next;
        self.status.reason = reason;
        true
    }

    /// Write the status subresource if it differs from the last confirmed write.
    async fn publish_status(&mut self) {
        if self.persisted.as_ref() == Some(&self.status) {
            return;
        }

        let mut job = self.job.clone();
        job.status = Some(self.status.clone());
        match self.cluster.update_job_status(&job).await {
            Ok(_) => {
                debug!(phase = %self.status.phase, "Published job status");
                self.persisted = Some(self.status.clone());
            }
            Err(err) => {
                warn!(phase = %self.status.phase, error = %err, "Failed to publish job status");
            }
        }
    }

    async fn release(&mut self) {
        if self.released {
            debug!("Job resources already released");
            return;
        }
        self.released = true;

        match self.release_resources().await {
            Ok(()) => info!("Released job resources"),
            Err(err) => error!(error = %err, "Failed to release job resources"),
        }
    }

    /// Scale the parameter servers down, wait for their pods, then delete
    /// every workload and pod the job owns. Missing objects count as released.
    async fn release_resources(&self) -> Result<(), ReleaseError> {
        let namespace = self.namespace();
        let job_name = self.job.name_any();
        if namespace.is_empty() || job_name.is_empty() {
            warn!("Job has no name or namespace, nothing to release");
            return Ok(());
        }

        let pserver = self.job.pserver_name();
        let trainer = self.job.trainer_name();
        let pserver_pods = pserver_selector(&job_name);
        let mut failures = Vec::new();

        match self
            .cluster
            .update_replica_group_replicas(&namespace, &pserver, 0)
            .await
        {
            Ok(()) => self.wait_for_pods_gone(&namespace, &pserver_pods).await,
            Err(err) => record("scale parameter servers to zero", Err(err), &mut failures),
        }

        record(
            "delete parameter server pods",
            self.cluster.delete_pods(&namespace, &pserver_pods).await,
            &mut failures,
        );
        record(
            "delete parameter server replica set",
            self.cluster.delete_replica_group(&namespace, &pserver).await,
            &mut failures,
        );
        record(
            "delete trainer job",
            self.cluster.delete_batch_job(&namespace, &trainer).await,
            &mut failures,
        );
        record(
            "delete trainer pods",
            self.cluster
                .delete_pods(&namespace, &trainer_selector(&job_name))
                .await,
            &mut failures,
        );

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ReleaseError {
                job: self.job.key(),
                failures,
            })
        }
    }

    async fn wait_for_pods_gone(&self, namespace: &str, selector: &str) {
        for attempt in 0..self.settings.max_retries {
            match self.cluster.list_pods(namespace, selector).await {
                Ok(pods) if pods.is_empty() => return,
                Ok(pods) => {
                    debug!(selector = %selector, remaining = pods.len(), attempt, "Waiting for pods to terminate");
                }
                Err(err) => warn!(selector = %selector, error = %err, "Failed to list pods"),
            }
            sleep(self.settings.poll_interval).await;
        }
        warn!(selector = %selector, "Pods still present, deleting them");
    }

    fn namespace(&self) -> String {
        self.job.namespace().unwrap_or_default()
    }
}

fn record(action: &str, result: ClusterResult<()>, failures: &mut Vec<String>) {
    match result {
        Ok(()) => {}
        Err(err) if err.is_not_found() => debug!(action, "Already gone"),
        Err(err) => {
            warn!(action, error = %err, "Release step failed");
            failures.push(format!("{action}: {err}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::cluster::MockClusterClient;
    use crate::crds::PaddleJobSpec;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn settings() -> LifecycleSettings {
        LifecycleSettings {
            max_retries: 3,
            poll_interval: Duration::from_millis(5),
            status_interval: Duration::from_millis(5),
            event_capacity: 16,
            event_send_timeout: Duration::from_millis(100),
        }
    }

    fn job_in(phase: Option<JobPhase>) -> PaddleJob {
        let mut spec = PaddleJobSpec::default();
        spec.pserver.min_instance = 2;
        spec.trainer.min_instance = 2;

        let mut job = PaddleJob::new("job-1", spec);
        job.metadata.namespace = Some("default".to_string());
        job.status = phase.map(|phase| PaddleJobStatus {
            phase,
            ..Default::default()
        });
        job
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn release_mock() -> MockClusterClient {
        let mut mock = MockClusterClient::new();
        mock.expect_update_replica_group_replicas()
            .withf(|namespace, name, replicas| {
                namespace == "default" && name == "job-1-pserver" && *replicas == 0
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        mock.expect_list_pods().returning(|_, _| Ok(Vec::new()));
        mock.expect_delete_pods()
            .withf(|_, selector| selector == "paddle-job-pserver=job-1")
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_delete_pods()
            .withf(|_, selector| selector == "paddle-job=job-1")
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_delete_replica_group()
            .withf(|_, name| name == "job-1-pserver")
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_delete_batch_job()
            .withf(|_, name| name == "job-1-trainer")
            .times(1)
            .returning(|_, _| Ok(()));
        mock
    }

    #[tokio::test]
    async fn delete_releases_each_resource_exactly_once() {
        for phase in [None, Some(JobPhase::Creating), Some(JobPhase::Running)] {
            let manager = LifecycleManager::new(job_in(phase), Arc::new(release_mock()), settings());
            let (tx, rx) = mpsc::channel(4);
            tx.send(ManagerEvent::Delete).await.unwrap();

            // Expectations are verified when the mock is dropped with the manager
            manager.run(rx).await;
        }
    }

    #[tokio::test]
    async fn modify_on_finished_job_touches_nothing() {
        let manager = LifecycleManager::new(
            job_in(Some(JobPhase::Succeeded)),
            Arc::new(MockClusterClient::new()),
            settings(),
        );
        let (tx, rx) = mpsc::channel(4);
        tx.send(ManagerEvent::Modify(Box::new(job_in(Some(JobPhase::Succeeded)))))
            .await
            .unwrap();
        drop(tx);

        manager.run(rx).await;
    }

    #[test]
    fn starting_stage_follows_persisted_phase() {
        let cluster: Arc<dyn ClusterClient> = Arc::new(FakeCluster::new());
        let stage = |phase| LifecycleManager::new(job_in(phase), cluster.clone(), settings()).stage;

        assert_eq!(stage(None), Stage::Translate);
        assert_eq!(stage(Some(JobPhase::Creating)), Stage::Translate);
        assert_eq!(stage(Some(JobPhase::Running)), Stage::Monitor);
        assert_eq!(stage(Some(JobPhase::Succeeded)), Stage::Finished);
        assert_eq!(stage(Some(JobPhase::Failed)), Stage::Finished);
    }

    #[tokio::test]
    async fn running_job_succeeds_with_one_status_update() {
        let fake = Arc::new(FakeCluster::new());
        fake.insert_batch_job("default", "job-1-trainer", 2);
        fake.set_batch_job_status("default", "job-1-trainer", 0, 2, 0);

        let _handle =
            LifecycleManager::spawn(job_in(Some(JobPhase::Running)), fake.clone(), settings());
        wait_until(|| fake.calls_to("delete_batch_job") == 1).await;

        let updates = fake.state().status_updates.clone();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].phase, JobPhase::Succeeded);
        assert_eq!(updates[0].reason, "all trainer have succeeded!");
        assert_eq!(
            updates[0].replica_statuses,
            [TrainingResourceStatus::placeholder(TrainingResourceType::Trainer)]
        );
        assert!(fake.state().jobs.is_empty());
    }

    #[tokio::test]
    async fn failed_trainer_fails_the_job() {
        let fake = Arc::new(FakeCluster::new());
        fake.insert_batch_job("default", "job-1-trainer", 2);
        fake.set_batch_job_status("default", "job-1-trainer", 1, 0, 1);

        let _handle =
            LifecycleManager::spawn(job_in(Some(JobPhase::Running)), fake.clone(), settings());
        wait_until(|| fake.calls_to("delete_pods") == 2).await;

        let updates = fake.state().status_updates.clone();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].phase, JobPhase::Failed);
        assert_eq!(updates[0].reason, "at least one trainer failed!");
        assert_eq!(updates[0].replica_statuses.len(), 1);
    }

    #[tokio::test]
    async fn new_job_creates_pservers_then_trainers() {
        let fake = Arc::new(FakeCluster::ready_on_create());

        let _handle = LifecycleManager::spawn(job_in(None), fake.clone(), settings());
        wait_until(|| {
            fake.state()
                .status_updates
                .iter()
                .any(|status| !status.replica_statuses.is_empty())
        })
        .await;

        let state = fake.state();
        assert!(state.replica_sets.contains_key("default/job-1-pserver"));
        assert!(state.jobs.contains_key("default/job-1-trainer"));
        assert_eq!(state.status_updates[0].phase, JobPhase::Creating);
        assert_eq!(state.status_updates[1].phase, JobPhase::Running);
        assert_eq!(state.status_updates[2].phase, JobPhase::Running);

        let create_rs = state
            .calls
            .iter()
            .position(|call| call.starts_with("create_replica_group"))
            .unwrap();
        let create_job = state
            .calls
            .iter()
            .position(|call| call.starts_with("create_batch_job"))
            .unwrap();
        assert!(create_rs < create_job);
    }

    #[tokio::test]
    async fn replica_set_create_error_fails_the_job() {
        let fake = Arc::new(FakeCluster::new());
        fake.state().fail_create_replica_group =
            Some(ClusterError::Other("quota exceeded".to_string()));

        let _handle = LifecycleManager::spawn(job_in(None), fake.clone(), settings());
        wait_until(|| fake.calls_to("delete_pods") == 2).await;

        let state = fake.state();
        let last = state.status_updates.last().unwrap();
        assert_eq!(last.phase, JobPhase::Failed);
        assert_eq!(
            last.reason,
            "Internal error; create resource error:cluster error: quota exceeded"
        );
        assert!(!state.calls.iter().any(|call| call.starts_with("create_batch_job")));
    }

    #[tokio::test]
    async fn trainer_create_error_fails_the_job() {
        let fake = Arc::new(FakeCluster::ready_on_create());
        fake.state().fail_create_batch_job = Some(ClusterError::Other("denied".to_string()));

        let _handle = LifecycleManager::spawn(job_in(None), fake.clone(), settings());
        wait_until(|| fake.calls_to("delete_replica_group") == 1).await;

        let state = fake.state();
        let last = state.status_updates.last().unwrap();
        assert_eq!(last.phase, JobPhase::Failed);
        assert_eq!(
            last.reason,
            "Internal error; create trainer error:cluster error: denied"
        );
        assert!(state.replica_sets.is_empty());
    }

    #[tokio::test]
    async fn pservers_that_never_become_ready_fail_the_job() {
        let fake = Arc::new(FakeCluster::new());

        let _handle = LifecycleManager::spawn(job_in(None), fake.clone(), settings());
        wait_until(|| fake.calls_to("delete_replica_group") == 1).await;

        let state = fake.state();
        let last = state.status_updates.last().unwrap();
        assert_eq!(last.phase, JobPhase::Failed);
        assert!(last.reason.starts_with("Internal error; create resource error:"));
        assert!(last.reason.contains("not ready after 3 polls"));
        assert_eq!(
            state
                .calls
                .iter()
                .filter(|call| call.starts_with("get_replica_group"))
                .count(),
            4
        );
    }

    #[tokio::test]
    async fn monitor_errors_leave_the_status_alone() {
        let fake = Arc::new(FakeCluster::new());
        fake.state().fail_get_batch_job =
            Some(ClusterError::Transient("rate limited".to_string()));

        let handle =
            LifecycleManager::spawn(job_in(Some(JobPhase::Running)), fake.clone(), settings());
        wait_until(|| fake.calls_to("get_batch_job") >= 3).await;

        {
            let state = fake.state();
            assert!(state.status_updates.is_empty());
            assert!(!state.calls.iter().any(|call| call.starts_with("delete")));
        }
        assert!(!handle.is_finished());
    }

    #[tokio::test]
    async fn missing_trainer_job_leaves_the_status_alone() {
        let fake = Arc::new(FakeCluster::new());

        let _handle =
            LifecycleManager::spawn(job_in(Some(JobPhase::Running)), fake.clone(), settings());
        wait_until(|| fake.calls_to("get_batch_job") >= 2).await;

        assert_eq!(fake.calls_to("update_job_status"), 0);
    }

    #[tokio::test]
    async fn invalid_port_range_fails_the_job() {
        let fake = Arc::new(FakeCluster::new());
        let mut job = job_in(None);
        job.spec.port = i32::MAX;
        job.spec.ports_num = 2;

        let handle = LifecycleManager::spawn(job, fake.clone(), settings());
        wait_until(|| fake.calls_to("delete_batch_job") == 1).await;

        let state = fake.state();
        assert_eq!(state.status_updates.len(), 1);
        assert_eq!(state.status_updates[0].phase, JobPhase::Failed);
        assert!(state.status_updates[0].reason.contains("outside 1-65535"));
        assert!(!state.calls.iter().any(|call| call.starts_with("create")));
        assert!(!handle.is_finished());
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_retries_run_out() {
        let gets = Arc::new(AtomicUsize::new(0));
        let published = Arc::new(Mutex::new(Vec::new()));
        let released = Arc::new(AtomicBool::new(false));
        let mut mock = MockClusterClient::new();

        let counter = gets.clone();
        mock.expect_get_replica_group().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ClusterError::Transient("too many requests".to_string()))
        });
        let sink = published.clone();
        mock.expect_update_job_status().returning(move |job| {
            sink.lock().unwrap().push(job.status.clone().unwrap_or_default());
            Ok(job.clone())
        });
        mock.expect_update_replica_group_replicas()
            .returning(|_, name, _| Err(ClusterError::NotFound(name.to_string())));
        mock.expect_delete_pods().returning(|_, _| Ok(()));
        mock.expect_delete_replica_group()
            .returning(|_, name| Err(ClusterError::NotFound(name.to_string())));
        let done = released.clone();
        mock.expect_delete_batch_job().returning(move |_, name| {
            done.store(true, Ordering::SeqCst);
            Err(ClusterError::NotFound(name.to_string()))
        });

        let _handle = LifecycleManager::spawn(job_in(None), Arc::new(mock), settings());
        wait_until(|| released.load(Ordering::SeqCst)).await;

        assert_eq!(gets.load(Ordering::SeqCst), 3);
        let published = published.lock().unwrap();
        let phases: Vec<JobPhase> = published.iter().map(|status| status.phase).collect();
        assert_eq!(phases, [JobPhase::Creating, JobPhase::Failed]);
        assert_eq!(
            published[1].reason,
            "Internal error; create resource error:transient cluster error: too many requests"
        );
    }

    #[tokio::test]
    async fn modify_replaces_the_job_used_for_later_writes() {
        let fake = Arc::new(FakeCluster::new());
        fake.insert_batch_job("default", "job-1-trainer", 2);
        fake.set_batch_job_status("default", "job-1-trainer", 2, 0, 0);

        let handle =
            LifecycleManager::spawn(job_in(Some(JobPhase::Running)), fake.clone(), settings());
        wait_until(|| fake.state().status_updates.len() == 1).await;

        let mut modified = job_in(Some(JobPhase::Running));
        modified
            .labels_mut()
            .insert("revision".to_string(), "2".to_string());
        handle.modify(modified).await.unwrap();
        fake.set_batch_job_status("default", "job-1-trainer", 0, 2, 0);
        wait_until(|| fake.calls_to("delete_batch_job") == 1).await;

        let state = fake.state();
        assert_eq!(state.status_updates.len(), 2);
        assert_eq!(state.status_updates[1].phase, JobPhase::Succeeded);
        let written = state.last_published.as_ref().unwrap();
        assert_eq!(
            written.labels().get("revision").map(String::as_str),
            Some("2")
        );
    }
}
