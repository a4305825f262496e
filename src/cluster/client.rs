use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::manifest::{JobManifest, LabelSelector, PodManifest, ServiceManifest};

// Deletions fail fast; object-bearing calls get the longer budget.
const DELETE_TIMEOUT_SECS: u64 = 5;
const REQUEST_TIMEOUT_SECS: u64 = 60;

const WATCH_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// One event on a watch stream. The stream may close at any time; the
/// consumer owns reconnection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent<T> {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    pub object: T,
}

pub type WatchStream<T> = mpsc::Receiver<WatchEvent<T>>;

/// Thin abstraction over the workload manager. No transactional semantics
/// are assumed across calls; tests supply [`super::fake::FakeCluster`].
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn create_job(&self, namespace: &str, job: &JobManifest) -> Result<JobManifest>;
    async fn get_job(&self, namespace: &str, name: &str) -> Result<JobManifest>;
    async fn update_job(&self, namespace: &str, job: &JobManifest) -> Result<JobManifest>;
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;
    async fn list_jobs(&self, namespace: &str, selector: &LabelSelector)
        -> Result<Vec<JobManifest>>;
    async fn delete_jobs(&self, namespace: &str, selector: &LabelSelector) -> Result<()>;

    async fn create_service(
        &self,
        namespace: &str,
        service: &ServiceManifest,
    ) -> Result<ServiceManifest>;
    async fn delete_services(&self, namespace: &str, selector: &LabelSelector) -> Result<()>;

    async fn watch_jobs(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<WatchStream<JobManifest>>;
    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<WatchStream<PodManifest>>;
}

/// REST client for the workload manager's API server.
pub struct HttpClusterClient {
    base_url: String,
    http: reqwest::Client,
    delete_http: reqwest::Client,
}

impl HttpClusterClient {
    pub fn new(base_url: &str) -> Result<HttpClusterClient> {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(anyhow!("invalid cluster endpoint: {base_url}"));
        }
        Ok(HttpClusterClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()?,
            delete_http: reqwest::Client::builder()
                .timeout(Duration::from_secs(DELETE_TIMEOUT_SECS))
                .build()?,
        })
    }

    fn jobs_url(&self, namespace: &str) -> String {
        format!("{}/apis/batch/v1/namespaces/{namespace}/jobs", self.base_url)
    }

    fn services_url(&self, namespace: &str) -> String {
        format!("{}/api/v1/namespaces/{namespace}/services", self.base_url)
    }

    fn pods_url(&self, namespace: &str) -> String {
        format!("{}/api/v1/namespaces/{namespace}/pods", self.base_url)
    }

    async fn expect_ok(resp: reqwest::Response) -> Result<reqwest::Response> {
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("cluster request failed: {status}: {body}"));
        }
        Ok(resp)
    }

    /// Open a watch and pump its line-delimited JSON events into a channel.
    /// The channel closes when the upstream response ends or an event fails
    /// to decode; callers reconnect.
    async fn watch<T>(&self, url: String, selector: &LabelSelector) -> Result<WatchStream<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let selector = selector.to_query();
        let resp = self
            .http
            .get(url.as_str())
            .query(&[("watch", "true"), ("labelSelector", selector.as_str())])
            .timeout(Duration::from_secs(3600))
            .send()
            .await?;
        let resp = Self::expect_ok(resp).await?;

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buf = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        debug!("watch stream ended: {e}");
                        return;
                    }
                };
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    if line.len() <= 1 {
                        continue;
                    }
                    match serde_json::from_slice::<WatchEvent<T>>(&line) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("dropping undecodable watch event: {e}");
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

#[async_trait]
impl ClusterClient for HttpClusterClient {
    async fn create_job(&self, namespace: &str, job: &JobManifest) -> Result<JobManifest> {
        let resp = self.http.post(self.jobs_url(namespace)).json(job).send().await?;
        Ok(Self::expect_ok(resp).await?.json().await?)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<JobManifest> {
        let url = format!("{}/{name}", self.jobs_url(namespace));
        let resp = self.http.get(url).send().await?;
        Ok(Self::expect_ok(resp).await?.json().await?)
    }

    async fn update_job(&self, namespace: &str, job: &JobManifest) -> Result<JobManifest> {
        let url = format!("{}/{}", self.jobs_url(namespace), job.metadata.name);
        let resp = self.http.put(url).json(job).send().await?;
        Ok(Self::expect_ok(resp).await?.json().await?)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let url = format!("{}/{name}", self.jobs_url(namespace));
        let resp = self.delete_http.delete(url).send().await?;
        Self::expect_ok(resp).await?;
        Ok(())
    }

    async fn list_jobs(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<JobManifest>> {
        #[derive(Deserialize)]
        struct JobList {
            #[serde(default)]
            items: Vec<JobManifest>,
        }
        let resp = self
            .http
            .get(self.jobs_url(namespace))
            .query(&[("labelSelector", selector.to_query())])
            .send()
            .await?;
        let list: JobList = Self::expect_ok(resp).await?.json().await?;
        Ok(list.items)
    }

    async fn delete_jobs(&self, namespace: &str, selector: &LabelSelector) -> Result<()> {
        let resp = self
            .delete_http
            .delete(self.jobs_url(namespace))
            .query(&[("labelSelector", selector.to_query())])
            .send()
            .await?;
        Self::expect_ok(resp).await?;
        Ok(())
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &ServiceManifest,
    ) -> Result<ServiceManifest> {
        let resp = self
            .http
            .post(self.services_url(namespace))
            .json(service)
            .send()
            .await?;
        Ok(Self::expect_ok(resp).await?.json().await?)
    }

    async fn delete_services(&self, namespace: &str, selector: &LabelSelector) -> Result<()> {
        let resp = self
            .delete_http
            .delete(self.services_url(namespace))
            .query(&[("labelSelector", selector.to_query())])
            .send()
            .await?;
        Self::expect_ok(resp).await?;
        Ok(())
    }

    async fn watch_jobs(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<WatchStream<JobManifest>> {
        self.watch(self.jobs_url(namespace), selector).await
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<WatchStream<PodManifest>> {
        self.watch(self.pods_url(namespace), selector).await
    }
}
