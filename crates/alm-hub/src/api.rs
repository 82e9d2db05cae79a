use crate::{
    broadcast::SubscribeRequest,
    process::{resolve_cwd, RunnerError, SpawnOptions},
    Config, HubState,
};
use alm_core::{
    event_ipc::{encode_frame, ProcessState, DEFAULT_MAX_FRAME_BYTES},
    parse_topic_list,
};
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::{
    collections::HashMap,
    convert::Infallible,
    path::{Component, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProjectError {
    #[error("project must be a relative identifier")]
    Absolute,
    #[error("project may not leave the projects root")]
    Escapes,
    #[error("project directory not found: {0}")]
    NotADirectory(PathBuf),
}

/// Maps the `project` query value onto a directory. Empty means the configured default.
pub fn resolve_project(config: &Config, raw: Option<&str>) -> Result<PathBuf, ProjectError> {
    let raw = raw.map(str::trim).unwrap_or_default();
    let dir = if raw.is_empty() {
        config.project_dir.clone()
    } else {
        let requested = std::path::Path::new(raw);
        if requested.is_absolute() {
            return Err(ProjectError::Absolute);
        }
        let escapes = requested
            .components()
            .any(|part| !matches!(part, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(ProjectError::Escapes);
        }
        config.projects_root.join(requested)
    };
    if !dir.is_dir() {
        return Err(ProjectError::NotADirectory(dir));
    }
    Ok(dir)
}

fn error_response(status: StatusCode, message: impl ToString) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    project: Option<String>,
    topics: Option<String>,
}

pub async fn events(State(hub): State<Arc<HubState>>, Query(query): Query<EventsQuery>) -> Response {
    let project_dir = match resolve_project(&hub.config, query.project.as_deref()) {
        Ok(dir) => dir,
        Err(err) => {
            warn!(event = "events_rejected", error = %err);
            return error_response(StatusCode::BAD_REQUEST, err);
        }
    };
    let topics = parse_topic_list(query.topics.as_deref().unwrap_or_default());
    let rx = hub.broadcaster.open(
        SubscribeRequest {
            project_dir,
            topics,
        },
        hub.config.queue_capacity,
    );

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            let message = rx.recv().await?;
            match encode_frame(&message, DEFAULT_MAX_FRAME_BYTES) {
                Ok(frame) => return Some((Ok::<_, Infallible>(Bytes::from(frame)), rx)),
                Err(err) => {
                    warn!(event = "frame_dropped", topic = %message.topic, error = %err);
                }
            }
        }
    });

    (
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    command: String,
    #[serde(default)]
    working_directory: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

pub async fn spawn_process(
    State(hub): State<Arc<HubState>>,
    Json(request): Json<SpawnRequest>,
) -> Response {
    let cwd = resolve_cwd(&hub.config.project_dir, request.working_directory.as_deref());
    let options = SpawnOptions {
        cwd: Some(cwd),
        env: request.env.into_iter().collect(),
    };
    match hub.runner.spawn(&request.command, options) {
        Ok(id) => (StatusCode::CREATED, Json(json!({ "id": id }))).into_response(),
        Err(err @ (RunnerError::EmptyCommand | RunnerError::InvalidCwd(_))) => {
            error_response(StatusCode::BAD_REQUEST, err)
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

pub async fn list_processes(State(hub): State<Arc<HubState>>) -> Response {
    Json(hub.runner.list()).into_response()
}

pub async fn process_status(State(hub): State<Arc<HubState>>, Path(id): Path<String>) -> Response {
    let status = hub.runner.get_status(&id);
    let code = if status.state == ProcessState::NotFound {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    };
    (code, Json(status)).into_response()
}

pub async fn process_output(State(hub): State<Arc<HubState>>, Path(id): Path<String>) -> Response {
    match hub.runner.get_output(&id) {
        Ok(lines) => Json(lines).into_response(),
        Err(err) => error_response(StatusCode::NOT_FOUND, err),
    }
}

pub async fn kill_process(State(hub): State<Arc<HubState>>, Path(id): Path<String>) -> Response {
    match hub.runner.kill(&id) {
        Ok(()) => {
            info!(event = "process_kill", id = %id);
            StatusCode::ACCEPTED.into_response()
        }
        Err(err @ RunnerError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, err),
        Err(err) => error_response(StatusCode::CONFLICT, err),
    }
}
