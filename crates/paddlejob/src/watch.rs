//! Watch source feeding the dispatcher
//!
//! The watcher re-lists after reconnecting. Jobs missing from a re-list were
//! deleted while the stream was down, so they are reported as deletes.

use crate::crds::PaddleJob;
use crate::dispatcher::{DispatcherMessage, JobEvent};
use futures::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Turns raw watcher events into registry events
#[derive(Default)]
pub struct EventTranslator {
    known: HashMap<String, PaddleJob>,
    relist: Option<HashSet<String>>,
}

impl EventTranslator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, event: watcher::Event<PaddleJob>) -> Vec<JobEvent> {
        match event {
            watcher::Event::Apply(job) => vec![self.apply(job)],
            watcher::Event::Delete(job) => {
                self.known.remove(&job.key());
                vec![JobEvent::Delete(job)]
            }
            watcher::Event::Init => {
                self.relist = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(job) => {
                if let Some(seen) = self.relist.as_mut() {
                    seen.insert(job.key());
                }
                vec![self.apply(job)]
            }
            watcher::Event::InitDone => {
                let Some(seen) = self.relist.take() else {
                    return Vec::new();
                };
                let gone: Vec<String> = self
                    .known
                    .keys()
                    .filter(|key| !seen.contains(*key))
                    .cloned()
                    .collect();
                gone.into_iter()
                    .filter_map(|key| self.known.remove(&key))
                    .map(JobEvent::Delete)
                    .collect()
            }
        }
    }

    fn apply(&mut self, job: PaddleJob) -> JobEvent {
        if self.known.insert(job.key(), job.clone()).is_some() {
            JobEvent::Update(job)
        } else {
            JobEvent::Add(job)
        }
    }
}

/// Stream `PaddleJob` changes into the dispatcher until it goes away.
#[instrument(skip_all)]
pub async fn watch_jobs(api: Api<PaddleJob>, tx: mpsc::Sender<DispatcherMessage>) {
    info!("Watching PaddleJob resources");
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    let mut translator = EventTranslator::new();

    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "PaddleJob watch error");
                continue;
            }
        };

        for job_event in translator.translate(event) {
            if tx.send(DispatcherMessage::Event(job_event)).await.is_err() {
                debug!("Dispatcher gone, stopping watch");
                return;
            }
        }
    }
    warn!("PaddleJob watch stream ended");
}
