//! Job registry and dispatch loop
//!
//! A single task owns the registry. Watch events and periodic ticks arrive on
//! one channel, so registry state never needs a lock.

use crate::cluster::{job_pods, ClusterClient};
use crate::crds::PaddleJob;
use crate::lifecycle::{LifecycleManager, LifecycleSettings, ManagerHandle};
use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

/// Change notification for one `PaddleJob`
#[derive(Debug, Clone)]
pub enum JobEvent {
    Add(PaddleJob),
    Update(PaddleJob),
    Delete(PaddleJob),
}

#[derive(Debug, Clone)]
pub enum DispatcherMessage {
    Event(JobEvent),
    Tick,
}

struct RegistryEntry {
    job: PaddleJob,
    /// Trainer batch job, once it has been seen in the cluster
    trainer: Option<Job>,
    manager: Option<ManagerHandle>,
}

pub struct Dispatcher {
    cluster: Arc<dyn ClusterClient>,
    settings: LifecycleSettings,
    jobs: HashMap<String, RegistryEntry>,
    spawned: u64,
}

impl Dispatcher {
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterClient>, settings: LifecycleSettings) -> Self {
        Self {
            cluster,
            settings,
            jobs: HashMap::new(),
            spawned: 0,
        }
    }

    /// Consume messages until every sender is gone, scanning after each one.
    #[instrument(skip_all)]
    pub async fn run(mut self, mut rx: mpsc::Receiver<DispatcherMessage>) {
        info!("Dispatcher started");
        while let Some(message) = rx.recv().await {
            match message {
                DispatcherMessage::Event(event) => self.handle_event(event).await,
                DispatcherMessage::Tick => debug!(jobs = self.len(), "Tick"),
            }
            self.scan().await;
        }
        info!("Dispatcher channel closed, stopping");
    }

    pub async fn handle_event(&mut self, event: JobEvent) {
        match event {
            JobEvent::Add(job) => self.upsert(job, false).await,
            JobEvent::Update(job) => self.upsert(job, true).await,
            JobEvent::Delete(job) => {
                let key = job.key();
                let Some(entry) = self.jobs.remove(&key) else {
                    debug!(job = %key, "Delete for unknown job");
                    return;
                };
                info!(job = %key, "Job removed from registry");
                if let Some(manager) = entry.manager {
                    if let Err(err) = manager.delete().await {
                        warn!(job = %manager.job(), error = %err, "Failed to forward delete, aborting lifecycle manager");
                        manager.abort();
                    }
                }
            }
        }
    }

    async fn upsert(&mut self, job: PaddleJob, forward: bool) {
        let key = job.key();
        let entry = self.jobs.entry(key.clone()).or_insert_with(|| {
            info!(job = %key, phase = %job.phase(), "Job added to registry");
            RegistryEntry {
                job: job.clone(),
                trainer: None,
                manager: None,
            }
        });
        entry.job = job.clone();

        if entry.trainer.is_none() {
            attach_trainer(self.cluster.as_ref(), entry).await;
        }

        if forward {
            if let Some(manager) = &entry.manager {
                if let Err(err) = manager.modify(job).await {
                    warn!(job = %manager.job(), error = %err, "Failed to forward update to lifecycle manager");
                }
            }
        }
    }

    /// Spawn a lifecycle manager for every job whose trainer pods have all
    /// succeeded. A job that already has a manager is left alone.
    pub async fn scan(&mut self) {
        for (key, entry) in &mut self.jobs {
            if entry.manager.is_some() {
                continue;
            }
            if entry.trainer.is_none() {
                attach_trainer(self.cluster.as_ref(), entry).await;
                if entry.trainer.is_none() {
                    continue;
                }
            }

            let namespace = entry.job.namespace().unwrap_or_default();
            let counts = match job_pods(self.cluster.as_ref(), &namespace, &entry.job.name_any()).await {
                Ok(counts) => counts,
                Err(err) => {
                    warn!(job = %key, error = %err, "Failed to count trainer pods");
                    continue;
                }
            };

            if counts.all_succeeded() {
                self.spawned += 1;
                info!(job = %key, pods = counts.total, spawned = self.spawned, "Trainer pods finished, starting lifecycle manager");
                entry.manager = Some(LifecycleManager::spawn(
                    entry.job.clone(),
                    self.cluster.clone(),
                    self.settings.clone(),
                ));
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.jobs.contains_key(key)
    }

    #[must_use]
    pub fn is_managed(&self, key: &str) -> bool {
        self.jobs
            .get(key)
            .is_some_and(|entry| entry.manager.is_some())
    }

    /// Number of lifecycle managers started so far
    #[must_use]
    pub fn spawned(&self) -> u64 {
        self.spawned
    }
}

/// Best-effort lookup of the trainer batch job; absence is retried on the next scan.
async fn attach_trainer(cluster: &dyn ClusterClient, entry: &mut RegistryEntry) {
    let namespace = entry.job.namespace().unwrap_or_default();
    let name = entry.job.trainer_name();
    match cluster.get_batch_job(&namespace, &name).await {
        Ok(Some(trainer)) => {
            debug!(job = %entry.job.key(), trainer_job = %name, "Attached trainer job");
            entry.trainer = Some(trainer);
        }
        Ok(None) => debug!(job = %entry.job.key(), "Trainer job not created yet"),
        Err(err) => warn!(job = %entry.job.key(), error = %err, "Failed to look up trainer job"),
    }
}

/// Send a `Tick` every `period` until the dispatcher goes away.
pub fn spawn_ticker(tx: mpsc::Sender<DispatcherMessage>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if tx.send(DispatcherMessage::Tick).await.is_err() {
                debug!("Dispatcher gone, stopping ticker");
                return;
            }
        }
    })
}
