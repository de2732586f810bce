use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        FromRequestParts, Json, Path, State,
    },
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use fleet_common::{
    ConsoleRequest, ConsoleResponse, CreateLobbyRequest, CreateLobbyResponse, ErrorBody, LeaseView, LobbyView,
    USER_HEADER,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::allocator::AllocationError;
use crate::lobby::{LobbyError, LobbyService};

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            status,
            body: ErrorBody {
                code: code.to_string(),
                message: message.into(),
                retryable,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<LobbyError> for ApiError {
    fn from(err: LobbyError) -> Self {
        match err {
            LobbyError::Validation(msg) => ApiError::new(StatusCode::BAD_REQUEST, "invalid_input", msg, false),
            LobbyError::Conflict => ApiError::new(
                StatusCode::BAD_REQUEST,
                "conflict",
                "you already have an active lobby",
                false,
            ),
            LobbyError::Allocation(AllocationError::CapacityExhausted) => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "capacity_exhausted",
                "no game server available, try again shortly",
                true,
            ),
            LobbyError::Allocation(AllocationError::CredentialExhausted) => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "credential_exhausted",
                "no game server available, try again shortly",
                true,
            ),
            LobbyError::Provision => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "provision_failed",
                "the game server could not be started",
                false,
            ),
            LobbyError::NotFound => ApiError::new(StatusCode::NOT_FOUND, "not_found", "lobby not found", false),
            LobbyError::Forbidden => ApiError::new(StatusCode::FORBIDDEN, "forbidden", "not allowed", false),
            LobbyError::ConsoleUnavailable => ApiError::new(
                StatusCode::BAD_REQUEST,
                "console_unavailable",
                "remote console is not available for this lobby",
                false,
            ),
            LobbyError::Console(e) => ApiError::new(StatusCode::BAD_GATEWAY, "console_failed", e.to_string(), true),
            e @ (LobbyError::Store(_) | LobbyError::Internal(_)) => {
                error!(error = %e, "Request failed");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal error", false)
            }
        }
    }
}

fn bad_body(rejection: JsonRejection) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "invalid_input", rejection.body_text(), false)
}

fn bad_path(rejection: PathRejection) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "invalid_input", rejection.body_text(), false)
}

/// Identity of the caller, taken from the `x-user-id` header.
#[derive(Debug, Clone)]
pub struct Requester(pub String);

impl<S> FromRequestParts<S> for Requester
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Requester(v.to_string()))
            .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "unauthenticated", "missing x-user-id", false))
    }
}

pub fn router(service: LobbyService) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/lobbies", post(create_lobby).get(list_lobbies))
        .route("/lobbies/{id}", delete(delete_lobby))
        .route("/lobbies/{id}/console", post(console))
        .route("/leases", get(list_leases))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn create_lobby(
    State(service): State<LobbyService>,
    Requester(creator): Requester,
    payload: Result<Json<CreateLobbyRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateLobbyResponse>), ApiError> {
    let Json(payload) = payload.map_err(bad_body)?;
    let created = service.create(&creator, payload).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_lobbies(State(service): State<LobbyService>) -> Result<Json<Vec<LobbyView>>, ApiError> {
    Ok(Json(service.list().await?))
}

async fn delete_lobby(
    State(service): State<LobbyService>,
    Requester(requester): Requester,
    id: Result<Path<i64>, PathRejection>,
) -> Result<StatusCode, ApiError> {
    let Path(id) = id.map_err(bad_path)?;
    service.delete(id, &requester)?;
    Ok(StatusCode::OK)
}

async fn console(
    State(service): State<LobbyService>,
    Requester(requester): Requester,
    id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<ConsoleRequest>, JsonRejection>,
) -> Result<Json<ConsoleResponse>, ApiError> {
    let Path(id) = id.map_err(bad_path)?;
    let Json(payload) = payload.map_err(bad_body)?;
    let lines = service.console(id, &requester, &payload.command).await?;
    Ok(Json(ConsoleResponse { lines }))
}

async fn list_leases(
    State(service): State<LobbyService>,
    Requester(requester): Requester,
) -> Result<Json<Vec<LeaseView>>, ApiError> {
    Ok(Json(service.active_leases(&requester)?))
}
