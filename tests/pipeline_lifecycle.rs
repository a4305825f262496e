//! End-to-end lifecycle tests running the real executor loop against the
//! in-memory cluster and object store.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::Json;

use conductor::cluster::fake::FakeCluster;
use conductor::cluster::manifest::{JobCondition, JobStatus};
use conductor::controller::api::{post_pipelines, put_state, PipelinesPostRequest, StateRequest};
use conductor::controller::pipeline::ExecState;
use conductor::controller::startup::ControllerBuilder;
use conductor::controller::Executor;
use conductor::storage::{MemStore, Storage};

const SPEC_DOC: &str = r#"
name: ingest
namespace: prod
tasks:
  - name: step1
    image: ingest:latest
  - name: step2
    jobs:
      - job: 2a
        image: shard:latest
        instances: 2
      - job: 2b
        image: merge:latest
        instances: 2
        parallelism: 1
"#;

struct Env {
    exec: Executor,
    cluster: Arc<FakeCluster>,
}

async fn env_with_checkpoint(checkpoint: Option<&str>, storage: Option<Storage>) -> Env {
    let cluster = Arc::new(FakeCluster::new());
    let storage = storage.unwrap_or_else(|| {
        Storage::new()
            .with_store("mem", Arc::new(MemStore::new()))
            .with_store("gs", Arc::new(MemStore::new()))
    });
    storage
        .write("mem://specs/ingest.yaml", SPEC_DOC.as_bytes())
        .await
        .unwrap();

    let mut builder = ControllerBuilder::new(cluster.clone(), storage.clone(), "data");
    if let Some(uri) = checkpoint {
        builder = builder.with_checkpoint(uri);
    }
    let controller = builder.build().await.unwrap();
    Env {
        exec: controller.exec,
        cluster,
    }
}

async fn env() -> Env {
    env_with_checkpoint(None, None).await
}

/// Poll until `predicate` holds on the pipeline snapshot.
async fn wait_for<F>(exec: &Executor, name: &str, what: &str, predicate: F)
where
    F: Fn(&conductor::controller::Pipeline) -> bool,
{
    for _ in 0..200 {
        if let Some(pipeline) = exec.lookup(name).await {
            if predicate(&pipeline) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn complete(cluster: &FakeCluster, namespace: &str, job: &str) {
    cluster
        .set_job_status(
            namespace,
            job,
            JobStatus {
                succeeded: 1,
                conditions: vec![JobCondition::complete()],
                ..JobStatus::default()
            },
        )
        .unwrap();
}

#[tokio::test]
async fn full_run_advances_stages_and_stops() {
    let env = env().await;

    post_pipelines(
        State(env.exec.clone()),
        Json(PipelinesPostRequest {
            name: "ingest".to_string(),
            uri: "mem://specs/ingest.yaml".to_string(),
        }),
    )
    .await
    .unwrap();

    put_state(
        State(env.exec.clone()),
        Path("ingest".to_string()),
        Json(StateRequest {
            action: "start".to_string(),
            id: 0,
            stage: 0,
        }),
    )
    .await
    .unwrap();

    wait_for(&env.exec, "ingest", "stage 1 job", |p| {
        p.state == ExecState::Running && env.cluster.jobs("prod").len() == 1
    })
    .await;

    complete(&env.cluster, "prod", "ingest-step1-1");
    wait_for(&env.exec, "ingest", "stage 2 jobs", |p| {
        p.instances[0].stage == 1 && env.cluster.jobs("prod").len() == 3
    })
    .await;

    complete(&env.cluster, "prod", "ingest-2a-1");
    complete(&env.cluster, "prod", "ingest-2b-1");
    wait_for(&env.exec, "ingest", "pipeline stop", |p| {
        p.state == ExecState::Stopped
    })
    .await;

    let pipeline = env.exec.lookup("ingest").await.unwrap();
    assert_eq!(pipeline.instances.len(), 1);
    assert_eq!(pipeline.instances[0].state, ExecState::Stopped);
    // every created resource carries the reconciliation labels
    for job in env.cluster.jobs("prod") {
        assert_eq!(job.metadata.labels["pipeline"], "ingest");
        assert_eq!(job.metadata.labels["id"], "1");
        assert!(job.metadata.labels.contains_key("task"));
    }
}

#[tokio::test]
async fn checkpoint_survives_a_restart() {
    let storage = Storage::new()
        .with_store("mem", Arc::new(MemStore::new()))
        .with_store("gs", Arc::new(MemStore::new()));
    let env = env_with_checkpoint(Some("mem://state/config.json"), Some(storage.clone())).await;

    post_pipelines(
        State(env.exec.clone()),
        Json(PipelinesPostRequest {
            name: "ingest".to_string(),
            uri: "mem://specs/ingest.yaml".to_string(),
        }),
    )
    .await
    .unwrap();
    put_state(
        State(env.exec.clone()),
        Path("ingest".to_string()),
        Json(StateRequest {
            action: "start".to_string(),
            id: 0,
            stage: 0,
        }),
    )
    .await
    .unwrap();
    wait_for(&env.exec, "ingest", "running", |p| {
        p.state == ExecState::Running
    })
    .await;

    env.exec.checkpoint_now().await;

    // a fresh controller over the same checkpoint picks up the state
    let restarted =
        env_with_checkpoint(Some("mem://state/config.json"), Some(storage.clone())).await;
    wait_for(&restarted.exec, "ingest", "restored pipeline", |p| {
        p.state == ExecState::Running && p.instances.len() == 1
    })
    .await;
    let pipeline = restarted.exec.lookup("ingest").await.unwrap();
    assert_eq!(pipeline.instances[0].id, 1);
    assert_eq!(pipeline.config.spec.tasks.len(), 2);
}

#[tokio::test]
async fn user_stop_halts_a_running_instance() {
    let env = env().await;
    post_pipelines(
        State(env.exec.clone()),
        Json(PipelinesPostRequest {
            name: "ingest".to_string(),
            uri: "mem://specs/ingest.yaml".to_string(),
        }),
    )
    .await
    .unwrap();
    put_state(
        State(env.exec.clone()),
        Path("ingest".to_string()),
        Json(StateRequest {
            action: "start".to_string(),
            id: 0,
            stage: 0,
        }),
    )
    .await
    .unwrap();
    wait_for(&env.exec, "ingest", "running", |p| {
        p.state == ExecState::Running && env.cluster.jobs("prod").len() == 1
    })
    .await;

    put_state(
        State(env.exec.clone()),
        Path("ingest".to_string()),
        Json(StateRequest {
            action: "stop".to_string(),
            id: 1,
            stage: 0,
        }),
    )
    .await
    .unwrap();
    wait_for(&env.exec, "ingest", "stopped", |p| {
        p.state == ExecState::Stopped
    })
    .await;

    let jobs = env.cluster.jobs("prod");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].spec.completions, Some(0));
}
