//! Per-instance cluster watcher.
//!
//! One watcher task runs for each running instance. It subscribes to the
//! job and pod streams filtered by the instance's `{pipeline, id}` labels
//! and translates job events into `PipelineStatus` state-machine events.
//! Pod events are observed for logging only. When either upstream stream
//! closes, both are re-opened after a fixed delay.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use super::executor::Event;
use crate::cluster::client::{ClusterClient, WatchEventType};
use crate::cluster::manifest::LabelSelector;
use crate::WATCH_RECONNECT_SECS;

/// Consumer-side handle to a running watcher. Shutdown sends one sentinel
/// on a capacity-1 channel, so repeated calls are idempotent.
#[derive(Debug, Clone)]
pub struct WatcherHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl WatcherHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.try_send(());
    }
}

pub struct Watcher {
    pipeline: String,
    instance: u64,
    namespace: String,
    selector: LabelSelector,
    cluster: Arc<dyn ClusterClient>,
    events: mpsc::Sender<Event>,
}

impl Watcher {
    /// Spawn a watcher task for one instance. Only immutable identifiers
    /// are captured; the watcher never touches pipeline state.
    pub fn spawn(
        cluster: Arc<dyn ClusterClient>,
        pipeline: &str,
        instance: u64,
        namespace: &str,
        events: mpsc::Sender<Event>,
    ) -> WatcherHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let watcher = Watcher {
            pipeline: pipeline.to_string(),
            instance,
            namespace: namespace.to_string(),
            selector: LabelSelector::for_instance(pipeline, instance),
            cluster,
            events,
        };
        tokio::spawn(watcher.run(shutdown_rx));
        WatcherHandle { shutdown_tx }
    }

    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            "watcher started for {}:{} ({})",
            self.pipeline, self.instance, self.selector
        );
        loop {
            let streams = tokio::join!(
                self.cluster.watch_pods(&self.namespace, &self.selector),
                self.cluster.watch_jobs(&self.namespace, &self.selector),
            );
            let (mut pods, mut jobs) = match streams {
                (Ok(pods), Ok(jobs)) => (pods, jobs),
                (pods, jobs) => {
                    if let Err(e) = pods.and(jobs) {
                        warn!("{}:{} watch open: {e}", self.pipeline, self.instance);
                    }
                    if self.sleep_or_shutdown(&mut shutdown_rx).await {
                        return;
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("watcher stopped for {}:{}", self.pipeline, self.instance);
                        return;
                    }
                    event = pods.recv() => {
                        match event {
                            Some(event) => {
                                debug!(
                                    "pod {:?} {}",
                                    event.event_type, event.object.metadata.name
                                );
                            }
                            None => break,
                        }
                    }
                    event = jobs.recv() => {
                        match event {
                            Some(event) => self.handle_job_event(event.event_type, event.object).await,
                            None => break,
                        }
                    }
                }
            }

            if self.sleep_or_shutdown(&mut shutdown_rx).await {
                return;
            }
        }
    }

    async fn handle_job_event(
        &self,
        event_type: WatchEventType,
        job: crate::cluster::manifest::JobManifest,
    ) {
        match event_type {
            WatchEventType::Added | WatchEventType::Modified => {
                debug!("job {:?} {}", event_type, job.metadata.name);
                let Some(uid) = job.metadata.uid else {
                    warn!("job {} event without uid", job.metadata.name);
                    return;
                };
                let status = Event::PipelineStatus {
                    pipeline: self.pipeline.clone(),
                    instance: self.instance,
                    job_uid: uid,
                    status: job.status,
                };
                if self.events.send(status).await.is_err() {
                    return;
                }
            }
            WatchEventType::Deleted => {}
        }
    }

    /// Returns true when shutdown arrived during the reconnect delay.
    async fn sleep_or_shutdown(&self, shutdown_rx: &mut mpsc::Receiver<()>) -> bool {
        tokio::select! {
            _ = shutdown_rx.recv() => true,
            _ = tokio::time::sleep(Duration::from_secs(WATCH_RECONNECT_SECS)) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::cluster::manifest::{JobManifest, JobStatus, ObjectMeta};
    use std::collections::BTreeMap;

    fn labeled_job(name: &str, pipeline: &str, id: u64) -> JobManifest {
        let mut labels = BTreeMap::new();
        labels.insert(crate::LABEL_PIPELINE.to_string(), pipeline.to_string());
        labels.insert(crate::LABEL_INSTANCE_ID.to_string(), id.to_string());
        JobManifest {
            metadata: ObjectMeta {
                name: name.to_string(),
                labels,
                ..ObjectMeta::default()
            },
            ..JobManifest::default()
        }
    }

    #[tokio::test]
    async fn job_events_become_status_events() {
        let cluster = Arc::new(FakeCluster::new());
        let (tx, mut rx) = mpsc::channel(16);
        let handle = Watcher::spawn(cluster.clone(), "p", 1, "ns", tx);

        // give the watcher a beat to open its streams
        tokio::time::sleep(Duration::from_millis(20)).await;
        let created = cluster
            .create_job("ns", &labeled_job("p-step1-1", "p", 1))
            .await
            .unwrap();
        cluster
            .set_job_status(
                "ns",
                "p-step1-1",
                JobStatus {
                    failed: 1,
                    ..JobStatus::default()
                },
            )
            .unwrap();

        let added = rx.recv().await.unwrap();
        let Event::PipelineStatus { pipeline, instance, job_uid, .. } = added else {
            panic!("unexpected event kind");
        };
        assert_eq!(pipeline, "p");
        assert_eq!(instance, 1);
        assert_eq!(Some(job_uid), created.metadata.uid);

        let modified = rx.recv().await.unwrap();
        let Event::PipelineStatus { status, .. } = modified else {
            panic!("unexpected event kind");
        };
        assert_eq!(status.failed, 1);

        handle.shutdown();
        handle.shutdown(); // idempotent
    }

    #[tokio::test]
    async fn events_for_other_instances_are_filtered() {
        let cluster = Arc::new(FakeCluster::new());
        let (tx, mut rx) = mpsc::channel(16);
        let _handle = Watcher::spawn(cluster.clone(), "p", 1, "ns", tx);
        tokio::time::sleep(Duration::from_millis(20)).await;

        cluster
            .create_job("ns", &labeled_job("p-other-2", "p", 2))
            .await
            .unwrap();
        cluster
            .create_job("ns", &labeled_job("p-step1-1", "p", 1))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        let Event::PipelineStatus { job_uid, .. } = &event else {
            panic!("unexpected event: {event}");
        };
        let mine = cluster.jobs("ns").into_iter().find(|j| j.metadata.name == "p-step1-1");
        assert_eq!(Some(job_uid.clone()), mine.unwrap().metadata.uid);
    }
}
