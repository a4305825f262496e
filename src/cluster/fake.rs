//! In-memory workload manager used by the test suite. Mirrors the real
//! manager's observable behavior: uid assignment on create, label-selector
//! list/delete, and watch streams fed by mutations.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::client::{ClusterClient, WatchEvent, WatchEventType, WatchStream};
use super::manifest::{JobManifest, LabelSelector, PodManifest, ServiceManifest};

const WATCH_CHANNEL_CAPACITY: usize = 64;

struct WatchSub<T> {
    namespace: String,
    selector: LabelSelector,
    tx: mpsc::Sender<WatchEvent<T>>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<String, BTreeMap<String, JobManifest>>,
    services: HashMap<String, BTreeMap<String, ServiceManifest>>,
    job_watchers: Vec<WatchSub<JobManifest>>,
    pod_watchers: Vec<WatchSub<PodManifest>>,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> FakeCluster {
        FakeCluster::default()
    }

    /// All jobs in a namespace, ordered by name.
    pub fn jobs(&self, namespace: &str) -> Vec<JobManifest> {
        let state = self.state.lock().unwrap();
        state
            .jobs
            .get(namespace)
            .map(|jobs| jobs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn services(&self, namespace: &str) -> Vec<ServiceManifest> {
        let state = self.state.lock().unwrap();
        state
            .services
            .get(namespace)
            .map(|svcs| svcs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Overwrite a job's status and emit a `Modified` watch event, the way
    /// the real manager reports job progress.
    pub fn set_job_status(
        &self,
        namespace: &str,
        name: &str,
        status: super::manifest::JobStatus,
    ) -> Result<JobManifest> {
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .get_mut(namespace)
            .and_then(|jobs| jobs.get_mut(name))
            .ok_or_else(|| anyhow!("job {namespace}/{name} not found"))?;
        job.status = status;
        let updated = job.clone();
        notify(&mut state.job_watchers, namespace, WatchEventType::Modified, &updated);
        Ok(updated)
    }

    /// Emit a pod watch event without tracking the pod; pod events are
    /// observed by watchers for logging only.
    pub fn push_pod_event(&self, namespace: &str, event_type: WatchEventType, pod: PodManifest) {
        let mut state = self.state.lock().unwrap();
        notify(&mut state.pod_watchers, namespace, event_type, &pod);
    }
}

fn labels_of<T: Watchable>(object: &T) -> &BTreeMap<String, String> {
    object.labels()
}

trait Watchable: Clone {
    fn labels(&self) -> &BTreeMap<String, String>;
}

impl Watchable for JobManifest {
    fn labels(&self) -> &BTreeMap<String, String> {
        &self.metadata.labels
    }
}

impl Watchable for PodManifest {
    fn labels(&self) -> &BTreeMap<String, String> {
        &self.metadata.labels
    }
}

fn notify<T: Watchable>(
    watchers: &mut Vec<WatchSub<T>>,
    namespace: &str,
    event_type: WatchEventType,
    object: &T,
) {
    watchers.retain(|sub| {
        if sub.namespace != namespace || !sub.selector.matches(labels_of(object)) {
            return !sub.tx.is_closed();
        }
        sub.tx
            .try_send(WatchEvent {
                event_type,
                object: object.clone(),
            })
            .is_ok()
    });
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn create_job(&self, namespace: &str, job: &JobManifest) -> Result<JobManifest> {
        let mut state = self.state.lock().unwrap();
        let jobs = state.jobs.entry(namespace.to_string()).or_default();
        if jobs.contains_key(&job.metadata.name) {
            return Err(anyhow!("job {} already exists", job.metadata.name));
        }
        let mut created = job.clone();
        created.metadata.namespace = namespace.to_string();
        created.metadata.uid = Some(Uuid::new_v4().to_string());
        jobs.insert(created.metadata.name.clone(), created.clone());
        notify(&mut state.job_watchers, namespace, WatchEventType::Added, &created);
        Ok(created)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<JobManifest> {
        let state = self.state.lock().unwrap();
        state
            .jobs
            .get(namespace)
            .and_then(|jobs| jobs.get(name))
            .cloned()
            .ok_or_else(|| anyhow!("job {namespace}/{name} not found"))
    }

    async fn update_job(&self, namespace: &str, job: &JobManifest) -> Result<JobManifest> {
        let mut state = self.state.lock().unwrap();
        let jobs = state
            .jobs
            .get_mut(namespace)
            .ok_or_else(|| anyhow!("job {namespace}/{} not found", job.metadata.name))?;
        let existing = jobs
            .get_mut(&job.metadata.name)
            .ok_or_else(|| anyhow!("job {namespace}/{} not found", job.metadata.name))?;
        let mut updated = job.clone();
        updated.metadata.uid = existing.metadata.uid.clone();
        *existing = updated.clone();
        notify(&mut state.job_watchers, namespace, WatchEventType::Modified, &updated);
        Ok(updated)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let removed = state
            .jobs
            .get_mut(namespace)
            .and_then(|jobs| jobs.remove(name));
        match removed {
            Some(job) => {
                notify(&mut state.job_watchers, namespace, WatchEventType::Deleted, &job);
                Ok(())
            }
            None => Err(anyhow!("job {namespace}/{name} not found")),
        }
    }

    async fn list_jobs(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<JobManifest>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .jobs
            .get(namespace)
            .map(|jobs| {
                jobs.values()
                    .filter(|job| selector.matches(&job.metadata.labels))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_jobs(&self, namespace: &str, selector: &LabelSelector) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let removed: Vec<JobManifest> = match state.jobs.get_mut(namespace) {
            Some(jobs) => {
                let names: Vec<String> = jobs
                    .values()
                    .filter(|job| selector.matches(&job.metadata.labels))
                    .map(|job| job.metadata.name.clone())
                    .collect();
                names.iter().filter_map(|name| jobs.remove(name)).collect()
            }
            None => Vec::new(),
        };
        for job in &removed {
            notify(&mut state.job_watchers, namespace, WatchEventType::Deleted, job);
        }
        Ok(())
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &ServiceManifest,
    ) -> Result<ServiceManifest> {
        let mut state = self.state.lock().unwrap();
        let services = state.services.entry(namespace.to_string()).or_default();
        if services.contains_key(&service.metadata.name) {
            return Err(anyhow!("service {} already exists", service.metadata.name));
        }
        let mut created = service.clone();
        created.metadata.namespace = namespace.to_string();
        created.metadata.uid = Some(Uuid::new_v4().to_string());
        services.insert(created.metadata.name.clone(), created.clone());
        Ok(created)
    }

    async fn delete_services(&self, namespace: &str, selector: &LabelSelector) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(services) = state.services.get_mut(namespace) {
            services.retain(|_, svc| !selector.matches(&svc.metadata.labels));
        }
        Ok(())
    }

    async fn watch_jobs(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<WatchStream<JobManifest>> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let mut state = self.state.lock().unwrap();
        state.job_watchers.push(WatchSub {
            namespace: namespace.to_string(),
            selector: selector.clone(),
            tx,
        });
        Ok(rx)
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<WatchStream<PodManifest>> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let mut state = self.state.lock().unwrap();
        state.pod_watchers.push(WatchSub {
            namespace: namespace.to_string(),
            selector: selector.clone(),
            tx,
        });
        Ok(rx)
    }
}
