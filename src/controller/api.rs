//! REST surface for pipeline CRUD and state actions.
//!
//! Every handler is an adapter: reads take a locked snapshot from the
//! executor, mutations turn the request into a state-machine event. API
//! failures are plain-text bodies carrying the specific message;
//! successful mutations return empty 200s.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use regex::Regex;
use serde::Deserialize;

use super::executor::{Executor, StateAction};
use super::pipeline::ExecState;

/// URL prefix of the REST API.
pub const API_PREFIX: &str = "/pipeline/api";

/// Default page size of the pipelines listing.
const DEFAULT_PAGE_SIZE: usize = 128;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    BadGateway(String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg)
            | ApiError::BadGateway(msg)
            | ApiError::Internal(msg) => msg,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), self.message().to_string()).into_response()
    }
}

pub type ApiResult = Result<Response, ApiError>;

pub fn router(exec: Executor) -> Router {
    Router::new()
        .route(
            &format!("{API_PREFIX}/pipelines"),
            get(get_pipelines).post(post_pipelines),
        )
        .route(
            &format!("{API_PREFIX}/pipeline/{{name}}"),
            get(get_pipeline)
                .put(put_pipeline)
                .delete(delete_pipeline),
        )
        .route(&format!("{API_PREFIX}/state/{{name}}"), put(put_state))
        .route(&format!("{API_PREFIX}/clone"), put(put_clone))
        .with_state(exec)
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub pattern: Option<String>,
    pub count: Option<String>,
    pub start: Option<String>,
    pub limit: Option<String>,
}

/// List pipelines: optional regex filter, count-only mode, and a
/// start/limit cursor over the sorted name list.
pub async fn get_pipelines(
    State(exec): State<Executor>,
    Query(params): Query<ListParams>,
) -> ApiResult {
    let pattern = match params.pattern.as_deref() {
        Some(p) if !p.is_empty() => {
            Some(Regex::new(p).map_err(|e| ApiError::BadRequest(e.to_string()))?)
        }
        _ => None,
    };

    let mut keys = match &pattern {
        Some(re) => exec.pipeline_map_keys(Some(re)).await,
        None => Vec::new(),
    };

    if params.count.as_deref().is_some_and(|c| !c.is_empty()) {
        let length = if pattern.is_some() {
            keys.len()
        } else {
            exec.pipeline_count().await
        };
        return Ok(Json(length).into_response());
    }

    if pattern.is_none() {
        keys = exec.pipeline_map_keys(None).await;
    }
    keys.sort();

    let mut start = 0usize;
    let mut count = DEFAULT_PAGE_SIZE;
    if let Some(start_str) = params.start.as_deref().filter(|s| !s.is_empty()) {
        start = start_str.parse().map_err(|_| {
            ApiError::BadRequest("Invalid value for query parameter \"start\"".to_string())
        })?;
        if start >= keys.len() {
            return Err(ApiError::BadGateway(
                "\"start\" index must be smaller than the number of objects".to_string(),
            ));
        }
        if let Some(limit) = params.limit.as_deref().and_then(|l| l.parse().ok()) {
            count = limit;
        }
    }
    count = count.min(keys.len() - start);

    let mut result = Vec::with_capacity(count);
    for key in &keys[start..start + count] {
        if let Some(pipeline) = exec.lookup(key).await {
            result.push(pipeline);
        }
    }
    Ok(Json(result).into_response())
}

#[derive(Debug, Deserialize)]
pub struct PipelinesPostRequest {
    pub name: String,
    pub uri: String,
}

/// Create a pipeline by parsing its configuration from `uri`.
pub async fn post_pipelines(
    State(exec): State<Executor>,
    Json(request): Json<PipelinesPostRequest>,
) -> ApiResult {
    if exec.lookup(&request.name).await.is_some() {
        return Err(ApiError::Conflict(format!(
            "pipeline {} already present",
            request.name
        )));
    }
    exec.pipeline_add(&request.name, &request.uri)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(StatusCode::OK.into_response())
}

pub async fn get_pipeline(State(exec): State<Executor>, Path(name): Path<String>) -> ApiResult {
    match exec.lookup(&name).await {
        Some(pipeline) => Ok(Json(pipeline).into_response()),
        None => Err(ApiError::NotFound(name)),
    }
}

/// Reload the pipeline configuration; rejected unless it is stopped.
pub async fn put_pipeline(State(exec): State<Executor>, Path(name): Path<String>) -> ApiResult {
    let pipeline = exec
        .lookup(&name)
        .await
        .ok_or_else(|| ApiError::NotFound(name.clone()))?;
    if pipeline.state != ExecState::Stopped {
        return Err(ApiError::BadRequest(format!(
            "Pipeline reload in invalid state: {}",
            pipeline.state
        )));
    }
    exec.pipeline_reload(&name)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(StatusCode::OK.into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeleteRequest {
    pub instance: u64,
}

/// With `instance == 0` delete the pipeline itself (only when it has no
/// instances); otherwise delete the given instance and its resources.
pub async fn delete_pipeline(
    State(exec): State<Executor>,
    Path(name): Path<String>,
    Json(request): Json<DeleteRequest>,
) -> ApiResult {
    let pipeline = exec
        .lookup(&name)
        .await
        .ok_or_else(|| ApiError::NotFound(name.clone()))?;
    if request.instance != 0 {
        if pipeline.instance(request.instance).is_none() {
            return Err(ApiError::NotFound(format!(
                "invalid instance {}",
                request.instance
            )));
        }
        exec.delete_instance(&name, request.instance).await;
    } else {
        if !pipeline.instances.is_empty() {
            return Err(ApiError::BadRequest("Pipeline has instances".to_string()));
        }
        exec.pipeline_delete(&name)
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    }
    Ok(StatusCode::OK.into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StateRequest {
    pub action: String,
    pub id: u64,
    pub stage: usize,
}

/// Change the execution state of an instance: `start` (id 0 = new
/// instance) or `stop` (id 0 = all, currently a no-op).
pub async fn put_state(
    State(exec): State<Executor>,
    Path(name): Path<String>,
    Json(request): Json<StateRequest>,
) -> ApiResult {
    let pipeline = exec
        .lookup(&name)
        .await
        .ok_or_else(|| ApiError::NotFound(name.clone()))?;

    let action = match request.action.as_str() {
        "start" => StateAction::Start,
        "stop" => StateAction::Stop,
        other => return Err(ApiError::BadRequest(other.to_string())),
    };

    if action == StateAction::Start && request.id > 0 {
        let instance = pipeline.instance(request.id).ok_or_else(|| {
            ApiError::BadRequest(format!("invalid instance id: {}", request.id))
        })?;
        if instance.state == ExecState::Running {
            return Err(ApiError::BadRequest(format!(
                "Invalid state for start operation: {}",
                instance.state
            )));
        }
    }

    if request.stage >= pipeline.config.spec.tasks.len() {
        return Err(ApiError::BadRequest(format!(
            "invalid stage id {}",
            request.stage
        )));
    }

    exec.set_state(&name, action, request.id, request.stage)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(StatusCode::OK.into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CloneRequest {
    pub pipeline: String,
    pub instance: u64,
    pub include: String,
    pub exclude: String,
}

/// Create a new instance seeded from another instance's workdir.
pub async fn put_clone(
    State(exec): State<Executor>,
    Json(request): Json<CloneRequest>,
) -> ApiResult {
    if exec.lookup(&request.pipeline).await.is_none() {
        return Err(ApiError::NotFound(request.pipeline));
    }
    exec.clone_instance(
        &request.pipeline,
        request.instance,
        &request.include,
        &request.exclude,
    )
    .await
    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(StatusCode::OK.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::controller::config::parse_spec;
    use crate::controller::cron::CronService;
    use crate::controller::pipeline::{Instance, Pipeline};
    use crate::storage::{MemStore, Storage};
    use std::sync::Arc;

    async fn test_executor() -> Executor {
        let cluster = Arc::new(FakeCluster::new());
        let storage = Storage::new().with_store("mem", Arc::new(MemStore::new()));
        let exec = Executor::new(cluster, storage, CronService::new(), "data");
        // keep the channel open without running the loop; these tests only
        // exercise the adapter's validation and locked reads
        std::mem::forget(exec.take_event_receiver());
        exec
    }

    async fn named_pipeline(exec: &Executor, name: &str) {
        let doc = format!("name: {name}\ntasks:\n  - name: t\n    image: i\n");
        let config = parse_spec(doc.as_bytes(), "data").unwrap();
        exec.insert_pipeline(Pipeline {
            name: name.to_string(),
            uri: String::new(),
            config,
            ..Pipeline::default()
        })
        .await;
    }

    async fn body_json<T: serde::de::DeserializeOwned>(resp: Response) -> T {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn pagination_returns_the_requested_window() {
        let exec = test_executor().await;
        for i in 1..=300 {
            named_pipeline(&exec, &format!("p{i:03}")).await;
        }

        let params = ListParams {
            start: Some("100".to_string()),
            limit: Some("50".to_string()),
            ..ListParams::default()
        };
        let resp = get_pipelines(State(exec.clone()), Query(params)).await.unwrap();
        let page: Vec<Pipeline> = body_json(resp).await;
        assert_eq!(page.len(), 50);
        assert_eq!(page.first().unwrap().name, "p101");
        assert_eq!(page.last().unwrap().name, "p150");

        let params = ListParams {
            count: Some("1".to_string()),
            ..ListParams::default()
        };
        let resp = get_pipelines(State(exec.clone()), Query(params)).await.unwrap();
        let count: usize = body_json(resp).await;
        assert_eq!(count, 300);
    }

    #[tokio::test]
    async fn pattern_filters_and_counts() {
        let exec = test_executor().await;
        named_pipeline(&exec, "alpha").await;
        named_pipeline(&exec, "beta").await;
        named_pipeline(&exec, "alpine").await;

        let params = ListParams {
            pattern: Some("^al".to_string()),
            ..ListParams::default()
        };
        let resp = get_pipelines(State(exec.clone()), Query(params)).await.unwrap();
        let page: Vec<Pipeline> = body_json(resp).await;
        let names: Vec<&str> = page.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "alpine"]);

        let params = ListParams {
            pattern: Some("^al".to_string()),
            count: Some("1".to_string()),
            ..ListParams::default()
        };
        let resp = get_pipelines(State(exec.clone()), Query(params)).await.unwrap();
        let count: usize = body_json(resp).await;
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn list_rejects_bad_cursor_and_pattern() {
        let exec = test_executor().await;
        named_pipeline(&exec, "only").await;

        let params = ListParams {
            pattern: Some("(unclosed".to_string()),
            ..ListParams::default()
        };
        let err = get_pipelines(State(exec.clone()), Query(params)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let params = ListParams {
            start: Some("nine".to_string()),
            ..ListParams::default()
        };
        let err = get_pipelines(State(exec.clone()), Query(params)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.message(), "Invalid value for query parameter \"start\"");

        let params = ListParams {
            start: Some("5".to_string()),
            ..ListParams::default()
        };
        let err = get_pipelines(State(exec.clone()), Query(params)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn create_conflicts_on_existing_name() {
        let exec = test_executor().await;
        named_pipeline(&exec, "dup").await;
        let err = post_pipelines(
            State(exec.clone()),
            Json(PipelinesPostRequest {
                name: "dup".to_string(),
                uri: "mem://spec.yaml".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn get_unknown_pipeline_is_404() {
        let exec = test_executor().await;
        let err = get_pipeline(State(exec), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.message(), "nope");
    }

    #[tokio::test]
    async fn reload_rejected_while_running() {
        let exec = test_executor().await;
        named_pipeline(&exec, "busy").await;
        let mut pipeline = exec.lookup("busy").await.unwrap();
        pipeline.state = ExecState::Running;
        exec.insert_pipeline(pipeline).await;

        let err = put_pipeline(State(exec), Path("busy".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.message(), "Pipeline reload in invalid state: Running");
    }

    #[tokio::test]
    async fn delete_pipeline_with_instances_is_rejected() {
        let exec = test_executor().await;
        named_pipeline(&exec, "busy").await;
        let mut pipeline = exec.lookup("busy").await.unwrap();
        pipeline.instances.push(Instance::new(1, Vec::new()));
        exec.insert_pipeline(pipeline).await;

        let err = delete_pipeline(
            State(exec.clone()),
            Path("busy".to_string()),
            Json(DeleteRequest::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.message(), "Pipeline has instances");

        // deleting a bogus instance id is 404
        let err = delete_pipeline(
            State(exec),
            Path("busy".to_string()),
            Json(DeleteRequest { instance: 9 }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn state_request_validation() {
        let exec = test_executor().await;
        named_pipeline(&exec, "p").await;

        let err = put_state(
            State(exec.clone()),
            Path("p".to_string()),
            Json(StateRequest {
                action: "pause".to_string(),
                ..StateRequest::default()
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.message(), "pause");

        let err = put_state(
            State(exec.clone()),
            Path("p".to_string()),
            Json(StateRequest {
                action: "start".to_string(),
                id: 7,
                stage: 0,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.message(), "invalid instance id: 7");

        let err = put_state(
            State(exec.clone()),
            Path("p".to_string()),
            Json(StateRequest {
                action: "start".to_string(),
                id: 0,
                stage: 5,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.message(), "invalid stage id 5");

        let mut pipeline = exec.lookup("p").await.unwrap();
        let mut instance = Instance::new(1, Vec::new());
        instance.state = ExecState::Running;
        pipeline.instances.push(instance);
        exec.insert_pipeline(pipeline).await;
        let err = put_state(
            State(exec),
            Path("p".to_string()),
            Json(StateRequest {
                action: "start".to_string(),
                id: 1,
                stage: 0,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.message(), "Invalid state for start operation: Running");
    }

    #[tokio::test]
    async fn clone_of_unknown_pipeline_is_404() {
        let exec = test_executor().await;
        let err = put_clone(
            State(exec),
            Json(CloneRequest {
                pipeline: "ghost".to_string(),
                instance: 1,
                ..CloneRequest::default()
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
