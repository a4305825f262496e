//! Pipeline, instance and materialized-task state. All of it is owned by
//! the executor and mutated only from its event loop; API readers see
//! cloned snapshots taken under the pipelines lock.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::config::Config;
use super::watcher::WatcherHandle;
use crate::cluster::manifest::{JobManifest, JobStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecState {
    #[default]
    Stopped,
    Running,
}

impl std::fmt::Display for ExecState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecState::Stopped => f.write_str("Stopped"),
            ExecState::Running => f.write_str("Running"),
        }
    }
}

/// A named pipeline: its source URI, parsed configuration, and execution
/// instances. A pipeline is `Running` iff at least one instance is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub uri: String,
    pub state: ExecState,
    pub config: Config,
    #[serde(default)]
    pub instances: Vec<Instance>,
}

impl Pipeline {
    pub fn instance(&self, id: u64) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn instance_mut(&mut self, id: u64) -> Option<&mut Instance> {
        self.instances.iter_mut().find(|i| i.id == id)
    }

    /// Instance ids never collide or decrease; deletion does not free them.
    pub fn next_instance_id(&self) -> u64 {
        self.instances.iter().map(|i| i.id).max().unwrap_or(0) + 1
    }

    pub fn running_instances(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| i.state == ExecState::Running)
            .count()
    }
}

/// One execution of a pipeline over a specific dataset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Instance {
    pub id: u64,
    /// Stage the instance was most recently (re)started at.
    pub start_stage: usize,
    pub stage: usize,
    pub state: ExecState,
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Job counters of the active stage, for API consumers.
    #[serde(default)]
    pub current: TaskCounters,
    /// Live watcher handle; owned at runtime only, never checkpointed.
    #[serde(skip)]
    pub watcher: Option<WatcherHandle>,
}

impl Instance {
    pub fn new(id: u64, tasks: Vec<Task>) -> Instance {
        Instance {
            id,
            tasks,
            ..Instance::default()
        }
    }
}

/// A stage materialized from its task spec: the concrete job manifests,
/// the cluster-assigned uid per job once created, and completion tracking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Task {
    pub jobs: Vec<JobManifest>,
    #[serde(default)]
    pub job_uids: HashMap<String, String>,
    #[serde(default)]
    pub statuses: HashMap<String, JobStatus>,
    #[serde(default)]
    pub completed: usize,
}

impl Task {
    pub fn new(jobs: Vec<JobManifest>) -> Task {
        Task {
            jobs,
            ..Task::default()
        }
    }

    pub fn job_name_by_uid(&self, uid: &str) -> Option<&str> {
        self.job_uids
            .iter()
            .find(|(_, job_uid)| job_uid.as_str() == uid)
            .map(|(name, _)| name.as_str())
    }

    pub fn job_by_name(&self, name: &str) -> Option<&JobManifest> {
        self.jobs.iter().find(|j| j.metadata.name == name)
    }

    /// Forget a previous run of this stage before re-creating its jobs.
    pub fn reset(&mut self) {
        self.job_uids.clear();
        self.statuses.clear();
        self.completed = 0;
    }

    pub fn counters(&self) -> TaskCounters {
        let mut counters = TaskCounters::default();
        for status in self.statuses.values() {
            counters.running += status.active;
            counters.succeeded += status.succeeded;
            counters.failed += status.failed;
        }
        counters
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskCounters {
    pub running: i32,
    pub succeeded: i32,
    pub failed: i32,
}
