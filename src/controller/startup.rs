//! Wiring for a runnable controller instance.

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use log::{error, info};

use super::api;
use super::cron::CronService;
use super::executor::Executor;
use crate::cluster::client::ClusterClient;
use crate::storage::Storage;

/// Builder assembling the executor, cron service, storage registry and
/// cluster client into a served controller.
pub struct ControllerBuilder {
    cluster: Arc<dyn ClusterClient>,
    storage: Storage,
    data_dir: String,
    checkpoint_uri: Option<String>,
}

impl ControllerBuilder {
    pub fn new(cluster: Arc<dyn ClusterClient>, storage: Storage, data_dir: &str) -> Self {
        ControllerBuilder {
            cluster,
            storage,
            data_dir: data_dir.to_string(),
            checkpoint_uri: None,
        }
    }

    /// URI the state checkpoint is loaded from at startup and written to
    /// on the minute tick.
    pub fn with_checkpoint(mut self, uri: &str) -> Self {
        self.checkpoint_uri = Some(uri.to_string());
        self
    }

    /// Restore state, start the event loop and return the instance. A
    /// missing or unreadable checkpoint is logged, not fatal.
    pub async fn build(self) -> Result<ControllerInstance> {
        let exec = Executor::new(
            self.cluster,
            self.storage,
            CronService::new(),
            &self.data_dir,
        );
        if let Some(uri) = &self.checkpoint_uri {
            if let Err(e) = exec.configure(uri).await {
                error!("restore checkpoint {uri}: {e}");
            }
            exec.set_checkpoint_uri(uri);
        }
        exec.start();
        let router = api::router(exec.clone());
        Ok(ControllerInstance { exec, router })
    }
}

/// A fully initialized controller ready to serve requests.
pub struct ControllerInstance {
    pub exec: Executor,
    pub router: Router,
}

impl ControllerInstance {
    /// Serve the REST API until the shutdown future resolves. The
    /// executor loop and watchers keep running for process lifetime.
    pub async fn serve_with_shutdown<F>(self, addr: &str, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("pipeline controller listening on {addr}");
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
