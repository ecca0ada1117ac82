//! HTTP API for the controller.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use std::sync::Arc;

use parallax_proto::controller::{
    ArtefactChunk, ArtefactDiffRequest, ArtefactDiffResponse, CreateDeploymentRequest,
    CreateDeploymentResponse, ReplaceDeployRequest, SchemaChange, StatusResponse,
    UploadArtefactResponse,
};
use parallax_proto::runner::{headers, CallMetadata, CallRequest, CallResponse, RunnerHeartbeat};
use parallax_proto::{DeploymentKey, PingResponse, WireError};
use parallax_store::Deployment;

use crate::error::{ControllerError, ControllerResult};
use crate::fanout::SchemaFanout;
use crate::service::Controller;

/// Shared application state.
#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<Controller>,
    pub fanout: Arc<SchemaFanout>,
}

/// Creates the API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/v1/status", get(status))
        .route("/v1/schema", get(schema))
        .route("/v1/artefacts/diff", post(artefact_diff))
        .route("/v1/artefacts", post(upload_artefact))
        .route("/v1/deployments", post(create_deployment))
        .route("/v1/deployments/{key}", get(get_deployment))
        .route("/v1/deployments/{key}/replace", post(replace_deploy))
        .route("/v1/deployments/{key}/artefacts", get(deployment_artefacts))
        .route("/v1/runners/heartbeat", post(runner_heartbeat))
        .route("/v1/call", post(call))
        .with_state(state)
}

/// Error wrapper translating service errors to HTTP responses.
pub struct ApiError(ControllerError);

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status =
            StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(WireError::new(kind, self.0.to_string()))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_key(key: &str) -> ControllerResult<DeploymentKey> {
    key.parse()
        .map_err(|err| ControllerError::InvalidArgument(format!("bad deployment key: {err}")))
}

async fn ping(State(state): State<ApiState>) -> Json<PingResponse> {
    Json(state.controller.ping().await)
}

async fn status(State(state): State<ApiState>) -> ApiResult<Json<StatusResponse>> {
    Ok(Json(state.controller.status().await?))
}

async fn schema(State(state): State<ApiState>) -> Json<Vec<SchemaChange>> {
    Json(state.fanout.snapshot())
}

async fn artefact_diff(
    State(state): State<ApiState>,
    Json(request): Json<ArtefactDiffRequest>,
) -> ApiResult<Json<ArtefactDiffResponse>> {
    let missing = state.controller.get_artefact_diffs(request.digests).await?;
    Ok(Json(ArtefactDiffResponse { missing }))
}

async fn upload_artefact(
    State(state): State<ApiState>,
    body: Bytes,
) -> ApiResult<Json<UploadArtefactResponse>> {
    let digest = state.controller.upload_artefact(body).await?;
    Ok(Json(UploadArtefactResponse { digest }))
}

async fn create_deployment(
    State(state): State<ApiState>,
    Json(request): Json<CreateDeploymentRequest>,
) -> ApiResult<Json<CreateDeploymentResponse>> {
    let key = state.controller.create_deployment(request).await?;
    Ok(Json(CreateDeploymentResponse { key }))
}

async fn get_deployment(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> ApiResult<Json<Deployment>> {
    let key = parse_key(&key)?;
    Ok(Json(state.controller.get_deployment(&key).await?))
}

async fn replace_deploy(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Json(request): Json<ReplaceDeployRequest>,
) -> ApiResult<StatusCode> {
    let key = parse_key(&key)?;
    state
        .controller
        .replace_deploy(&key, request.min_replicas)
        .await?;
    Ok(StatusCode::OK)
}

async fn deployment_artefacts(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> ApiResult<Json<Vec<ArtefactChunk>>> {
    let key = parse_key(&key)?;
    let mut rx = state.controller.get_deployment_artefacts(&key).await?;
    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(chunk?);
    }
    Ok(Json(chunks))
}

async fn runner_heartbeat(
    State(state): State<ApiState>,
    Json(heartbeat): Json<RunnerHeartbeat>,
) -> ApiResult<StatusCode> {
    state.controller.register_runner(heartbeat).await?;
    Ok(StatusCode::OK)
}

async fn call(
    State(state): State<ApiState>,
    headers_map: HeaderMap,
    Json(request): Json<CallRequest>,
) -> ApiResult<Json<CallResponse>> {
    let header = |name: &str| {
        headers_map
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };
    let metadata = CallMetadata {
        request_id: header(headers::REQUEST_ID),
        direct_routing: header(headers::DIRECT_ROUTING),
    };
    let body = state
        .controller
        .call(&request.verb, request.body, &metadata)
        .await?;
    Ok(Json(CallResponse { body }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_deployment_keys_are_invalid_arguments() {
        let err = parse_key("not-a-key").unwrap_err();
        assert_eq!(err.kind(), parallax_proto::ErrorKind::InvalidArgument);
    }
}
