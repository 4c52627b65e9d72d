//! Browser-facing HTTP signaling endpoint.

use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use visage_common::protocol::{IceCandidatePayload, SessionDescriptionPayload};
use visage_common::Error;

use crate::config::CorsOrigins;
use crate::registry::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
}

pub fn build_router(registry: SessionRegistry, cors: &CorsOrigins) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/offer", post(offer))
        .route("/ice_candidate", post(ice_candidate))
        .layer(build_cors_layer(cors))
        .with_state(AppState { registry })
}

/// Wildcard origins cannot carry credentials; an explicit allow-list can.
fn build_cors_layer(cors: &CorsOrigins) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);
    match cors {
        CorsOrigins::Any => layer.allow_origin(Any),
        CorsOrigins::List(origins) => {
            let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            layer.allow_origin(origins).allow_credentials(true)
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Protocol(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn index() -> impl IntoResponse {
    Json(json!({ "service": "visage-relay" }))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "active_sessions": state.registry.active_sessions().await,
    }))
}

async fn offer(
    State(state): State<AppState>,
    Json(payload): Json<SessionDescriptionPayload>,
) -> Response {
    match state.registry.handle_offer(payload).await {
        Ok(answer) => (StatusCode::OK, Json(answer)).into_response(),
        Err(err) => {
            warn!("offer rejected: {err}");
            error_response(status_for(&err), err.to_string())
        }
    }
}

async fn ice_candidate(
    State(state): State<AppState>,
    Json(payload): Json<IceCandidatePayload>,
) -> Response {
    match state.registry.handle_candidate(payload).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            warn!("candidate rejected: {err}");
            error_response(status_for(&err), err.to_string())
        }
    }
}
