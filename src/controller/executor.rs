//! The pipeline state machine.
//!
//! The executor owns the `pipelines` map and a bounded event channel.
//! Exactly one loop task dequeues events and dispatches them; every
//! mutation of pipeline or instance state happens inside a handler under
//! the pipelines write lock, while API readers take snapshots under the
//! read lock. Handlers never panic: cluster errors are logged and the
//! handler returns, leaving the next event or tick to recover. An event
//! that references an unknown pipeline, instance or job is stale; it is
//! logged and dropped without mutation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

use super::config::parse_spec;
use super::cron::{CronCallback, CronSchedule, CronService};
use super::pipeline::{ExecState, Instance, Pipeline};
use super::template::{materialize_task, render_service};
use super::watcher::Watcher;
use crate::cluster::client::ClusterClient;
use crate::cluster::manifest::{JobStatus, LabelSelector};
use crate::storage::Storage;
use crate::{EVENT_CHANNEL_CAPACITY, FAILURE_THRESHOLD_MIN, LABEL_TASK};

/// State-machine events. Events carry pipeline names and instance ids, not
/// references; handlers re-resolve them and drop the event when the target
/// no longer exists.
#[derive(Debug)]
pub enum Event {
    PipelineAdd {
        pipeline: String,
    },
    PipelineRun {
        pipeline: String,
        instance: u64,
        stage: usize,
    },
    PipelineStop {
        pipeline: String,
    },
    PipelineStatus {
        pipeline: String,
        instance: u64,
        job_uid: String,
        status: JobStatus,
    },
    TaskCreate {
        pipeline: String,
        instance: u64,
        stage: usize,
    },
    TaskAbort {
        pipeline: String,
        instance: u64,
        stage: usize,
        reason: String,
        at: DateTime<Utc>,
    },
    TaskComplete {
        pipeline: String,
        instance: u64,
        stage: usize,
        at: DateTime<Utc>,
    },
    InstanceDelete {
        pipeline: String,
        instance: u64,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::PipelineAdd { pipeline } => write!(f, "ADD {pipeline}"),
            Event::PipelineRun { pipeline, instance, stage } => {
                write!(f, "RUN {pipeline}:{instance} stage {stage}")
            }
            Event::PipelineStop { pipeline } => write!(f, "STOP {pipeline}"),
            Event::PipelineStatus { pipeline, instance, job_uid, .. } => {
                write!(f, "STATUS {pipeline}:{instance} job {job_uid}")
            }
            Event::TaskCreate { pipeline, instance, stage } => {
                write!(f, "TASK CREATE {pipeline}:{instance} stage {stage}")
            }
            Event::TaskAbort { pipeline, instance, stage, reason, .. } => {
                write!(f, "TASK ABORT {pipeline}:{instance} stage {stage}: {reason}")
            }
            Event::TaskComplete { pipeline, instance, stage, .. } => {
                write!(f, "TASK COMPLETE {pipeline}:{instance} stage {stage}")
            }
            Event::InstanceDelete { pipeline, instance } => {
                write!(f, "DELETE {pipeline}:{instance}")
            }
        }
    }
}

/// Action of a state-change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateAction {
    Start,
    Stop,
}

struct ExecutorInner {
    pipelines: RwLock<HashMap<String, Pipeline>>,
    events_tx: mpsc::Sender<Event>,
    events_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    cron: CronService,
    storage: Storage,
    cluster: Arc<dyn ClusterClient>,
    data_dir: String,
    checkpoint_uri: Mutex<Option<String>>,
}

#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        storage: Storage,
        cron: CronService,
        data_dir: &str,
    ) -> Executor {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Executor {
            inner: Arc::new(ExecutorInner {
                pipelines: RwLock::new(HashMap::new()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                cron,
                storage,
                cluster,
                data_dir: data_dir.to_string(),
                checkpoint_uri: Mutex::new(None),
            }),
        }
    }

    /// Spawn the event loop with its minute tick. The loop runs for
    /// process lifetime.
    pub fn start(&self) {
        let Some(mut events_rx) = self.take_event_receiver() else {
            warn!("executor already started");
            return;
        };
        let exec = self.clone();
        tokio::spawn(async move {
            let mut tick =
                interval_at(Instant::now() + Duration::from_secs(60), Duration::from_secs(60));
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    event = events_rx.recv() => match event {
                        Some(event) => exec.handle_event(event).await,
                        None => break,
                    },
                    _ = tick.tick() => exec.checkpoint_now().await,
                }
            }
        });
    }

    /// Detach the event receiver so a test can drive the loop manually.
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<Event>> {
        self.inner.events_rx.lock().unwrap().take()
    }

    async fn send(&self, event: Event) {
        if self.inner.events_tx.send(event).await.is_err() {
            error!("event channel closed");
        }
    }

    /// Dispatch one event. Follow-up events produced by the handler are
    /// enqueued after the lock is released, preserving FIFO order behind
    /// anything already queued.
    pub async fn handle_event(&self, event: Event) {
        info!("{event}");
        let follow_ups = match event {
            Event::PipelineAdd { pipeline } => self.handle_pipeline_add(&pipeline).await,
            Event::PipelineRun { pipeline, instance, stage } => {
                self.handle_pipeline_run(&pipeline, instance, stage).await
            }
            Event::PipelineStop { pipeline } => self.handle_pipeline_stop(&pipeline).await,
            Event::PipelineStatus { pipeline, instance, job_uid, status } => {
                self.handle_pipeline_status(&pipeline, instance, &job_uid, status)
                    .await
            }
            Event::TaskCreate { pipeline, instance, stage } => {
                self.handle_task_create(&pipeline, instance, stage).await
            }
            Event::TaskAbort { pipeline, instance, stage, reason, .. } => {
                self.handle_task_abort(&pipeline, instance, stage, &reason).await
            }
            Event::TaskComplete { pipeline, instance, stage, .. } => {
                self.handle_task_complete(&pipeline, instance, stage).await
            }
            Event::InstanceDelete { pipeline, instance } => {
                self.handle_instance_delete(&pipeline, instance).await
            }
        };
        for follow_up in follow_ups {
            self.send(follow_up).await;
        }
    }

    // ------------------------------------------------------------------
    // Event handlers. All of them run on the loop task.
    // ------------------------------------------------------------------

    /// A pipeline was registered, possibly restored from a checkpoint. A
    /// restored pipeline that was running gets its watchers re-attached.
    async fn handle_pipeline_add(&self, name: &str) -> Vec<Event> {
        let mut pipelines = self.inner.pipelines.write().await;
        let Some(pipeline) = pipelines.get_mut(name) else {
            warn!("{name}: unknown pipeline");
            return Vec::new();
        };
        if pipeline.running_instances() == 0 {
            pipeline.state = ExecState::Stopped;
            return Vec::new();
        }
        pipeline.state = ExecState::Running;
        let namespace = pipeline.config.spec.namespace.clone();
        let pipeline_name = pipeline.name.clone();
        for instance in &mut pipeline.instances {
            if instance.state == ExecState::Running && instance.watcher.is_none() {
                instance.watcher = Some(Watcher::spawn(
                    self.inner.cluster.clone(),
                    &pipeline_name,
                    instance.id,
                    &namespace,
                    self.inner.events_tx.clone(),
                ));
            }
        }
        Vec::new()
    }

    /// (Re)start an instance at `stage`: tear down cluster resources for
    /// every stage at or above it, mark everything running, attach a fresh
    /// watcher and kick off the stage.
    async fn handle_pipeline_run(&self, name: &str, id: u64, stage: usize) -> Vec<Event> {
        let mut pipelines = self.inner.pipelines.write().await;
        let Some(pipeline) = pipelines.get_mut(name) else {
            warn!("{name}: unknown pipeline");
            return Vec::new();
        };
        if pipeline.instance(id).is_none() {
            warn!("{name}: unknown instance: {id}");
            return Vec::new();
        }
        let namespace = pipeline.config.spec.namespace.clone();

        let mut task_names = Vec::new();
        for task in pipeline.config.spec.tasks.iter().skip(stage) {
            for tmpl in task.job_specs() {
                let task_name = if tmpl.job.is_empty() { &task.name } else { &tmpl.job };
                task_names.push(task_name.clone());
            }
        }
        for task_name in task_names {
            let selector = LabelSelector::for_instance(name, id).with(LABEL_TASK, task_name);
            if let Err(e) = self.inner.cluster.delete_jobs(&namespace, &selector).await {
                warn!("{name}:{id} delete jobs {selector}: {e}");
            }
            if let Err(e) = self.inner.cluster.delete_services(&namespace, &selector).await {
                warn!("{name}:{id} delete services {selector}: {e}");
            }
        }

        pipeline.state = ExecState::Running;
        let instance = pipeline.instance_mut(id).expect("instance checked above");
        instance.stage = stage;
        instance.start_stage = stage;
        instance.state = ExecState::Running;
        if let Some(watcher) = instance.watcher.take() {
            watcher.shutdown();
        }
        instance.watcher = Some(Watcher::spawn(
            self.inner.cluster.clone(),
            name,
            id,
            &namespace,
            self.inner.events_tx.clone(),
        ));

        vec![Event::TaskCreate {
            pipeline: name.to_string(),
            instance: id,
            stage,
        }]
    }

    async fn handle_pipeline_stop(&self, name: &str) -> Vec<Event> {
        let mut pipelines = self.inner.pipelines.write().await;
        if let Some(pipeline) = pipelines.get_mut(name) {
            pipeline.state = ExecState::Stopped;
        }
        Vec::new()
    }

    /// Create the services and jobs of stage `stage` from the instance's
    /// materialized task, remembering the cluster-assigned job uids.
    async fn handle_task_create(&self, name: &str, id: u64, stage: usize) -> Vec<Event> {
        let mut pipelines = self.inner.pipelines.write().await;
        let Some(pipeline) = pipelines.get_mut(name) else {
            warn!("{name}: unknown pipeline");
            return Vec::new();
        };
        let spec = pipeline.config.spec.clone();
        let Some(task_spec) = spec.tasks.get(stage) else {
            warn!("{name}:{id} invalid stage {stage}");
            return Vec::new();
        };

        for svc in &task_spec.services {
            match render_service(&self.inner.storage, &spec, id, task_spec, svc).await {
                Ok(manifest) => {
                    if let Err(e) =
                        self.inner.cluster.create_service(&spec.namespace, &manifest).await
                    {
                        error!("{name}:{id} create service {}: {e}", svc.name);
                    }
                }
                Err(e) => error!("{name}:{id} render service {}: {e}", svc.name),
            }
        }

        let Some(task) = pipeline
            .instance_mut(id)
            .and_then(|instance| instance.tasks.get_mut(stage))
        else {
            warn!("{name}:{id} no materialized task for stage {stage}");
            return Vec::new();
        };
        task.reset();
        for i in 0..task.jobs.len() {
            let manifest = task.jobs[i].clone();
            match self.inner.cluster.create_job(&spec.namespace, &manifest).await {
                Ok(created) => {
                    if let Some(uid) = created.metadata.uid {
                        task.job_uids.insert(created.metadata.name, uid);
                    }
                }
                Err(e) => error!("{name}:{id} create job {}: {e}", manifest.metadata.name),
            }
        }
        Vec::new()
    }

    /// Status update for one job of the instance's current stage. The job
    /// is identified by uid; events for unknown jobs are stale and dropped.
    /// A `Complete` condition is counted once per job; when every job of
    /// the stage has completed the stage is done. Past the failure
    /// threshold the instance is aborted.
    async fn handle_pipeline_status(
        &self,
        name: &str,
        id: u64,
        job_uid: &str,
        status: JobStatus,
    ) -> Vec<Event> {
        let mut pipelines = self.inner.pipelines.write().await;
        let Some(pipeline) = pipelines.get_mut(name) else {
            warn!("{name}: unknown pipeline");
            return Vec::new();
        };
        let pipeline_name = pipeline.name.clone();
        let Some(instance) = pipeline.instance_mut(id) else {
            warn!("{name}: unknown instance: {id}");
            return Vec::new();
        };
        if instance.state != ExecState::Running {
            debug!("{name}:{id} status for stopped instance");
            return Vec::new();
        }
        let stage = instance.stage;
        let Some(task) = instance.tasks.get_mut(stage) else {
            warn!("{name}:{id} no task at stage {stage}");
            return Vec::new();
        };
        let Some(job_name) = task.job_name_by_uid(job_uid).map(str::to_string) else {
            warn!("unexpected event for job {job_uid}");
            return Vec::new();
        };

        let was_complete = task
            .statuses
            .get(job_uid)
            .is_some_and(|s| s.is_complete());
        let failed = status.failed;
        let now_complete = status.is_complete();
        task.statuses.insert(job_uid.to_string(), status);
        if now_complete && !was_complete {
            info!("job {job_name} complete");
            task.completed += 1;
        }

        let stage_done = task.completed == task.jobs.len();
        let threshold = task
            .job_by_name(&job_name)
            .and_then(|job| job.spec.completions)
            .unwrap_or(0)
            .max(FAILURE_THRESHOLD_MIN);
        let counters = task.counters();
        instance.current = counters;

        if stage_done {
            return vec![Event::TaskComplete {
                pipeline: pipeline_name,
                instance: id,
                stage,
                at: Utc::now(),
            }];
        }
        if failed > threshold {
            return vec![Event::TaskAbort {
                pipeline: pipeline_name,
                instance: id,
                stage,
                reason: "Too many failures".to_string(),
                at: Utc::now(),
            }];
        }
        Vec::new()
    }

    /// Stage `stage` finished: advance to the next stage or stop the
    /// instance when it was the last one.
    async fn handle_task_complete(&self, name: &str, id: u64, stage: usize) -> Vec<Event> {
        let mut pipelines = self.inner.pipelines.write().await;
        let Some(pipeline) = pipelines.get_mut(name) else {
            warn!("{name}: unknown pipeline");
            return Vec::new();
        };
        if pipeline.instance(id).is_none() {
            warn!("{name}: invalid instance id {id}");
            return Vec::new();
        }
        if stage + 1 < pipeline.config.spec.tasks.len() {
            let instance = pipeline.instance_mut(id).expect("instance checked above");
            instance.stage = stage + 1;
            return vec![Event::TaskCreate {
                pipeline: name.to_string(),
                instance: id,
                stage: stage + 1,
            }];
        }
        Self::instance_stop(pipeline, id)
    }

    /// Terminal failure: gracefully drain still-active jobs, then stop the
    /// instance.
    async fn handle_task_abort(
        &self,
        name: &str,
        id: u64,
        _stage: usize,
        reason: &str,
    ) -> Vec<Event> {
        let mut pipelines = self.inner.pipelines.write().await;
        let Some(pipeline) = pipelines.get_mut(name) else {
            warn!("{name}: unknown pipeline");
            return Vec::new();
        };
        let Some(instance) = pipeline.instance(id) else {
            warn!("{name}: unknown instance: {id}");
            return Vec::new();
        };
        if instance.state != ExecState::Running {
            debug!("{name}:{id} abort for stopped instance ({reason})");
            return Vec::new();
        }
        let namespace = pipeline.config.spec.namespace.clone();
        self.cancel_instance(&namespace, name, id).await;
        Self::instance_stop(pipeline, id)
    }

    /// Set `completions := 0` on every not-yet-complete job of the
    /// instance so running pods drain without being killed mid-write.
    async fn cancel_instance(&self, namespace: &str, name: &str, id: u64) {
        let selector = LabelSelector::for_instance(name, id);
        let jobs = match self.inner.cluster.list_jobs(namespace, &selector).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("{name}:{id} list jobs for cancel: {e}");
                return;
            }
        };
        for mut job in jobs {
            if job.status.is_complete() {
                continue;
            }
            job.spec.completions = Some(0);
            if let Err(e) = self.inner.cluster.update_job(namespace, &job).await {
                error!("{name}:{id} cancel job {}: {e}", job.metadata.name);
            }
        }
    }

    /// Stop one instance; when it was the last running instance of its
    /// pipeline, follow up with `PipelineStop`.
    fn instance_stop(pipeline: &mut Pipeline, id: u64) -> Vec<Event> {
        if let Some(instance) = pipeline.instance_mut(id) {
            instance.state = ExecState::Stopped;
            if let Some(watcher) = instance.watcher.take() {
                watcher.shutdown();
            }
        }
        if pipeline.running_instances() == 0 {
            return vec![Event::PipelineStop {
                pipeline: pipeline.name.clone(),
            }];
        }
        Vec::new()
    }

    /// Remove an instance and every cluster resource it created.
    async fn handle_instance_delete(&self, name: &str, id: u64) -> Vec<Event> {
        let mut pipelines = self.inner.pipelines.write().await;
        let Some(pipeline) = pipelines.get_mut(name) else {
            warn!("{name}: unknown pipeline");
            return Vec::new();
        };
        if pipeline.instance(id).is_none() {
            return Vec::new();
        }
        let namespace = pipeline.config.spec.namespace.clone();
        let selector = LabelSelector::for_instance(name, id);
        if let Err(e) = self.inner.cluster.delete_jobs(&namespace, &selector).await {
            warn!("{name}:{id} delete jobs: {e}");
        }
        if let Err(e) = self.inner.cluster.delete_services(&namespace, &selector).await {
            warn!("{name}:{id} delete services: {e}");
        }
        if let Some(instance) = pipeline.instance_mut(id) {
            if let Some(watcher) = instance.watcher.take() {
                watcher.shutdown();
            }
        }
        pipeline.instances.retain(|i| i.id != id);
        Vec::new()
    }

    // ------------------------------------------------------------------
    // Operations invoked by the API surface and the cron trigger.
    // ------------------------------------------------------------------

    /// Fetch and parse a pipeline configuration, then register it. The
    /// pipeline starts `Stopped`; a schedule registers a cron trigger.
    pub async fn pipeline_add(&self, name: &str, uri: &str) -> Result<()> {
        let data = self.inner.storage.read(uri).await?;
        let config = parse_spec(&data, &self.inner.data_dir)?;
        let schedule = config.spec.schedule.clone();
        let pipeline = Pipeline {
            name: name.to_string(),
            uri: uri.to_string(),
            state: ExecState::Stopped,
            config,
            instances: Vec::new(),
        };
        {
            let mut pipelines = self.inner.pipelines.write().await;
            pipelines.insert(name.to_string(), pipeline);
        }
        if let Some(schedule) = schedule {
            self.register_schedule(name, &schedule)?;
        }
        self.send(Event::PipelineAdd {
            pipeline: name.to_string(),
        })
        .await;
        Ok(())
    }

    /// Re-parse the pipeline's configuration from its stored URI and
    /// atomically replace it. Instances are rewound to stage zero and the
    /// cron entry is re-registered. Callers must ensure the pipeline is
    /// stopped.
    pub async fn pipeline_reload(&self, name: &str) -> Result<()> {
        let uri = {
            let pipelines = self.inner.pipelines.read().await;
            let pipeline = pipelines
                .get(name)
                .ok_or_else(|| anyhow!("pipeline {name} not found"))?;
            pipeline.uri.clone()
        };
        let data = self.inner.storage.read(&uri).await?;
        let config = parse_spec(&data, &self.inner.data_dir)?;
        let schedule = config.spec.schedule.clone();

        {
            let mut pipelines = self.inner.pipelines.write().await;
            let pipeline = pipelines
                .get_mut(name)
                .ok_or_else(|| anyhow!("pipeline {name} not found"))?;
            if pipeline.config.spec.schedule.is_some() {
                let _ = self.inner.cron.delete(name);
            }
            pipeline.config = config;
            for instance in &mut pipeline.instances {
                instance.stage = 0;
            }
        }
        if let Some(schedule) = schedule {
            self.register_schedule(name, &schedule)?;
        }
        Ok(())
    }

    /// Unregister a pipeline. Callers must ensure no instances remain.
    pub async fn pipeline_delete(&self, name: &str) -> Result<()> {
        let mut pipelines = self.inner.pipelines.write().await;
        let pipeline = pipelines
            .remove(name)
            .ok_or_else(|| anyhow!("pipeline {name} not found"))?;
        if pipeline.config.spec.schedule.is_some() {
            let _ = self.inner.cron.delete(name);
        }
        Ok(())
    }

    pub async fn delete_instance(&self, name: &str, id: u64) {
        self.send(Event::InstanceDelete {
            pipeline: name.to_string(),
            instance: id,
        })
        .await;
    }

    /// Start or stop an instance. `id == 0` on start means "new
    /// instance"; on stop it means "all instances", which is accepted as a
    /// no-op pending clarification of its semantics.
    pub async fn set_state(
        &self,
        name: &str,
        action: StateAction,
        id: u64,
        stage: usize,
    ) -> Result<()> {
        match action {
            StateAction::Start => {
                if id == 0 {
                    let new_id = self.create_instance(name).await?;
                    self.send(Event::PipelineRun {
                        pipeline: name.to_string(),
                        instance: new_id,
                        stage: 0,
                    })
                    .await;
                } else {
                    {
                        let pipelines = self.inner.pipelines.read().await;
                        let pipeline = pipelines
                            .get(name)
                            .ok_or_else(|| anyhow!("pipeline {name} not found"))?;
                        pipeline
                            .instance(id)
                            .ok_or_else(|| anyhow!("Instance id {id} not found"))?;
                    }
                    self.send(Event::PipelineRun {
                        pipeline: name.to_string(),
                        instance: id,
                        stage,
                    })
                    .await;
                }
            }
            StateAction::Stop => {
                if id == 0 {
                    return Ok(());
                }
                let stage = {
                    let pipelines = self.inner.pipelines.read().await;
                    let pipeline = pipelines
                        .get(name)
                        .ok_or_else(|| anyhow!("pipeline {name} not found"))?;
                    pipeline
                        .instance(id)
                        .map(|instance| instance.stage)
                        .ok_or_else(|| anyhow!("Invalid instance ID {id}"))?
                };
                self.send(Event::TaskAbort {
                    pipeline: name.to_string(),
                    instance: id,
                    stage,
                    reason: "User request".to_string(),
                    at: Utc::now(),
                })
                .await;
            }
        }
        Ok(())
    }

    /// Create a new instance whose workdir is seeded by copying the
    /// previous instance's objects, filtered by the two patterns. The new
    /// instance is not started.
    pub async fn clone_instance(
        &self,
        name: &str,
        prev_id: u64,
        include: &str,
        exclude: &str,
    ) -> Result<u64> {
        let include = if include.is_empty() {
            None
        } else {
            Some(Regex::new(include)?)
        };
        let exclude = if exclude.is_empty() {
            None
        } else {
            Some(Regex::new(exclude)?)
        };

        let storage_uri = {
            let pipelines = self.inner.pipelines.read().await;
            let pipeline = pipelines
                .get(name)
                .ok_or_else(|| anyhow!("pipeline {name} not found"))?;
            pipeline.config.spec.storage.clone()
        };
        if storage_uri.is_empty() {
            bail!("pipeline {name} has no storage configured");
        }

        let new_id = self.create_instance(name).await?;
        let prev_dir = format!("{storage_uri}/{prev_id}");
        let new_dir = format!("{storage_uri}/{new_id}");
        self.inner
            .storage
            .copy_dir(&prev_dir, &new_dir, include.as_ref(), exclude.as_ref())
            .await?;
        Ok(new_id)
    }

    /// Allocate the next instance id and materialize one task per stage.
    /// Runs under the write lock so id assignment stays serialized.
    pub async fn create_instance(&self, name: &str) -> Result<u64> {
        let mut pipelines = self.inner.pipelines.write().await;
        let pipeline = pipelines
            .get_mut(name)
            .ok_or_else(|| anyhow!("pipeline {name} not found"))?;
        let id = pipeline.next_instance_id();
        let spec = pipeline.config.spec.clone();
        let mut tasks = Vec::with_capacity(spec.tasks.len());
        for task_spec in &spec.tasks {
            tasks.push(materialize_task(&self.inner.storage, &spec, id, task_spec).await?);
        }
        pipeline.instances.push(Instance::new(id, tasks));
        Ok(id)
    }

    /// Register the cron trigger for a scheduled pipeline: each fire
    /// creates a fresh instance and starts it at stage zero.
    pub fn register_schedule(&self, name: &str, schedule: &CronSchedule) -> Result<()> {
        let exec = self.clone();
        let pipeline_name = name.to_string();
        let callback: CronCallback = Arc::new(move || {
            let exec = exec.clone();
            let pipeline_name = pipeline_name.clone();
            tokio::spawn(async move {
                match exec.create_instance(&pipeline_name).await {
                    Ok(id) => {
                        exec.send(Event::PipelineRun {
                            pipeline: pipeline_name,
                            instance: id,
                            stage: 0,
                        })
                        .await;
                    }
                    Err(e) => error!("scheduled start of {pipeline_name}: {e}"),
                }
            });
        });
        self.inner.cron.add(name, schedule, callback)
    }

    // ------------------------------------------------------------------
    // Locked reads used by the API surface.
    // ------------------------------------------------------------------

    pub async fn lookup(&self, name: &str) -> Option<Pipeline> {
        let pipelines = self.inner.pipelines.read().await;
        pipelines.get(name).cloned()
    }

    pub async fn pipeline_map_keys(&self, pattern: Option<&Regex>) -> Vec<String> {
        let pipelines = self.inner.pipelines.read().await;
        pipelines
            .keys()
            .filter(|name| pattern.map_or(true, |re| re.is_match(name)))
            .cloned()
            .collect()
    }

    pub async fn pipeline_count(&self) -> usize {
        self.inner.pipelines.read().await.len()
    }

    // ------------------------------------------------------------------
    // Checkpointing.
    // ------------------------------------------------------------------

    pub fn set_checkpoint_uri(&self, uri: &str) {
        *self.inner.checkpoint_uri.lock().unwrap() = Some(uri.to_string());
    }

    /// Load the JSON checkpoint, replacing the pipelines map, and
    /// re-register every scheduled pipeline with the cron service.
    pub async fn configure(&self, uri: &str) -> Result<()> {
        let data = self.inner.storage.read(uri).await?;
        let restored: HashMap<String, Pipeline> = serde_json::from_slice(&data)?;
        let names: Vec<String> = restored.keys().cloned().collect();
        let scheduled: Vec<(String, CronSchedule)> = restored
            .iter()
            .filter_map(|(name, p)| {
                p.config.spec.schedule.clone().map(|s| (name.clone(), s))
            })
            .collect();
        {
            let mut pipelines = self.inner.pipelines.write().await;
            *pipelines = restored;
        }
        for (name, schedule) in scheduled {
            if let Err(e) = self.register_schedule(&name, &schedule) {
                error!("schedule for {name}: {e}");
            }
        }
        for name in names {
            self.send(Event::PipelineAdd { pipeline: name }).await;
        }
        Ok(())
    }

    /// Write the whole-state JSON snapshot when a checkpoint URI is
    /// configured. Runs on the minute tick; failures are logged only.
    pub async fn checkpoint_now(&self) {
        let uri = self.inner.checkpoint_uri.lock().unwrap().clone();
        let Some(uri) = uri else {
            return;
        };
        let data = {
            let pipelines = self.inner.pipelines.read().await;
            serde_json::to_vec(&*pipelines)
        };
        match data {
            Ok(data) => {
                if let Err(e) = self.inner.storage.write(&uri, &data).await {
                    error!("checkpoint write {uri}: {e}");
                }
            }
            Err(e) => error!("checkpoint marshal: {e}"),
        }
    }

    /// Test-and-bootstrap helper: install an already-parsed pipeline.
    pub async fn insert_pipeline(&self, pipeline: Pipeline) {
        let mut pipelines = self.inner.pipelines.write().await;
        pipelines.insert(pipeline.name.clone(), pipeline);
    }
}
