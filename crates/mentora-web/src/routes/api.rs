use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use mentora_core::model::{Session, SessionSummary};
use mentora_core::coaching::QuotaStatus;
use mentora_core::{RecommendationOutcome, SendOutcome, SessionView};
use serde::Deserialize;

use crate::error::ApiError;
use crate::AppState;

const MAX_USER_ID_LEN: usize = 128;
const DEFAULT_SESSION_LIST: usize = 20;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/v1/users/{user}/session",
            get(load_session).post(start_session),
        )
        .route("/api/v1/users/{user}/sessions", get(list_sessions))
        .route("/api/v1/users/{user}/messages", post(send_message))
        .route("/api/v1/users/{user}/recommendation", post(recommendation))
        .route("/api/v1/users/{user}/quota", get(quota))
}

fn check_user(user: &str) -> Result<(), ApiError> {
    let valid = !user.is_empty()
        && user != "."
        && user != ".."
        && user.len() <= MAX_USER_ID_LEN
        && user
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if valid {
        Ok(())
    } else {
        Err(ApiError::bad_request(format!("invalid user id: {user:?}")))
    }
}

async fn load_session(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    check_user(&user)?;
    Ok(Json(state.coaching.load_session(&user).await))
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    check_user(&user)?;
    let session = state.coaching.start_session(&user).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

#[derive(Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    check_user(&user)?;
    let limit = params.limit.unwrap_or(DEFAULT_SESSION_LIST).clamp(1, 200);
    Ok(Json(state.coaching.list_sessions(&user, limit).await?))
}

#[derive(Deserialize)]
struct SendMessageRequest {
    text: String,
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<SendOutcome>), ApiError> {
    check_user(&user)?;
    let outcome = state.coaching.send_message(&user, &req.text).await?;
    let status = match outcome {
        SendOutcome::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

async fn recommendation(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> Result<(StatusCode, Json<RecommendationOutcome>), ApiError> {
    check_user(&user)?;
    let outcome = state.coaching.get_recommendation(&user).await?;
    let status = match outcome {
        RecommendationOutcome::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

async fn quota(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> Result<Json<QuotaStatus>, ApiError> {
    check_user(&user)?;
    Ok(Json(state.coaching.quota_status(&user).await?))
}
