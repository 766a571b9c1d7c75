//! HTTP request handlers for the REST API.
//!
//! Handlers translate between the wire types and the orchestrator, and map
//! error classes onto HTTP statuses. Internal error detail goes to tracing;
//! clients receive the client-safe message only.

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::{
    config::{DEFAULT_MAX_INSTANCE_LENGTH_HOURS, DEFAULT_SESSION_TTL},
    orchestration::CreateRequest,
    ErrorClass, SandplaneError,
};

use super::{
    state::ServerState,
    types::{
        CreateSandboxRequest, CreateSandboxResponse, ErrorResponse, ListSandboxesQuery,
        ListedSandbox, RefreshRequest,
    },
};

//-------------------------------------------------------------------------------------------------
// Functions: Handlers
//-------------------------------------------------------------------------------------------------

/// Handler for the POST /sandboxes endpoint
///
/// Creates a sandbox from a template and returns its handle ids.
pub async fn create_handler(
    State(state): State<ServerState>,
    Json(req): Json<CreateSandboxRequest>,
) -> impl IntoResponse {
    let create = CreateRequest::builder()
        .template_id(req.template_id)
        .team_id(req.team_id)
        .alias(req.alias)
        .metadata(req.metadata)
        .ttl(req
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SESSION_TTL))
        .max_instance_length(Duration::from_secs(
            req.max_instance_length_hours
                .unwrap_or(DEFAULT_MAX_INSTANCE_LENGTH_HOURS)
                * 3600,
        ))
        .build();

    match state.orchestrator().create(create).await {
        Ok(created) => (
            StatusCode::CREATED,
            Json(CreateSandboxResponse {
                sandbox_id: created.sandbox_id,
                client_id: created.client_id,
                template_id: created.template_id,
                alias: created.alias,
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for the GET /sandboxes endpoint
///
/// Lists live sandboxes, optionally filtered by team.
pub async fn list_handler(
    State(state): State<ServerState>,
    Query(query): Query<ListSandboxesQuery>,
) -> impl IntoResponse {
    let sandboxes: Vec<ListedSandbox> = state
        .orchestrator()
        .list(query.team_id.as_deref())
        .into_iter()
        .map(|record| ListedSandbox {
            sandbox_id: record.get_sandbox_id().clone(),
            client_id: record.get_client_id().clone(),
            template_id: record.get_template_id().clone(),
            team_id: record.get_team_id().clone(),
            alias: record.get_alias().clone(),
            metadata: record.get_metadata().clone(),
            started_at: *record.get_started_at(),
        })
        .collect();

    (StatusCode::OK, Json(sandboxes)).into_response()
}

/// Handler for the GET /sandboxes/{id} endpoint
///
/// Returns one live sandbox.
pub async fn get_handler(
    State(state): State<ServerState>,
    Path(sandbox_id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator().get(&sandbox_id) {
        Some(record) => (
            StatusCode::OK,
            Json(ListedSandbox {
                sandbox_id: record.get_sandbox_id().clone(),
                client_id: record.get_client_id().clone(),
                template_id: record.get_template_id().clone(),
                team_id: record.get_team_id().clone(),
                alias: record.get_alias().clone(),
                metadata: record.get_metadata().clone(),
                started_at: *record.get_started_at(),
            }),
        )
            .into_response(),
        None => error_response(SandplaneError::SandboxNotFound(sandbox_id)),
    }
}

/// Handler for the DELETE /sandboxes/{id} endpoint
///
/// Removes a sandbox, firing its teardown.
pub async fn delete_handler(
    State(state): State<ServerState>,
    Path(sandbox_id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator().remove(&sandbox_id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for the POST /sandboxes/{id}/refresh endpoint
///
/// Extends a sandbox's deadline.
pub async fn refresh_handler(
    State(state): State<ServerState>,
    Path(sandbox_id): Path<String>,
    Json(req): Json<RefreshRequest>,
) -> impl IntoResponse {
    match state
        .orchestrator()
        .refresh(&sandbox_id, Duration::from_secs(req.timeout))
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

//-------------------------------------------------------------------------------------------------
// Functions: Helpers
//-------------------------------------------------------------------------------------------------

/// Maps an error to its HTTP response, logging the internal detail.
fn error_response(error: SandplaneError) -> axum::response::Response {
    let class = error.class();
    let status = status_for(class);

    tracing::error!(class = ?class, status = %status, error = %error, "request failed");

    (
        status,
        Json(ErrorResponse {
            error: error.client_message(),
            code: format!("{:?}", class),
        }),
    )
        .into_response()
}

fn status_for(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::NotFound => StatusCode::NOT_FOUND,
        ErrorClass::AlreadyExists => StatusCode::CONFLICT,
        ErrorClass::Exhausted => StatusCode::FORBIDDEN,
        ErrorClass::Invalid => StatusCode::BAD_REQUEST,
        ErrorClass::ReachedMaxLength => StatusCode::GONE,
        ErrorClass::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorClass::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorClass::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorClass::Exhausted), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorClass::Invalid), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(ErrorClass::Fatal),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(status_for(ErrorClass::ReachedMaxLength), StatusCode::GONE);
    }
}
