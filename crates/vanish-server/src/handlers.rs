use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{store::token, AppState, SecretError};

/// Expired and missing tokens share one response so callers cannot tell
/// whether a token ever existed.
const NOT_FOUND_MESSAGE: &str = "secret not found or expired";

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub secret: String,
    pub expire_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub token: String,
}

pub async fn create_secret(
    State(state): State<AppState>,
    payload: Result<Json<CreateRequest>, JsonRejection>,
) -> Response {
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    let ttl = body.expire_seconds.unwrap_or(state.ttl.default_seconds);
    if !state.ttl.allows(ttl) {
        info!(ttl_seconds = ttl, "rejected secret: expiry not offered");
        let offered = state
            .ttl
            .allowed
            .iter()
            .flatten()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        return bad_request(format!("expire_seconds must be one of: {offered}"));
    }

    let secret = body.secret.trim().to_owned();
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.submit(&secret, ttl)).await {
        Ok(Ok(token)) => {
            info!(token = %token::hint(&token), ttl_seconds = ttl, "secret created");
            Json(CreateResponse { token }).into_response()
        }
        Ok(Err(e)) => error_response(e),
        Err(e) => internal_error(e),
    }
}

// ── View ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ViewResponse {
    pub secret: String,
}

pub async fn view_secret(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    let store = state.store.clone();
    let lookup = token.clone();
    match tokio::task::spawn_blocking(move || store.consume(&lookup)).await {
        Ok(Ok(secret)) => {
            info!(token = %token::hint(&token), "secret viewed");
            (
                [(header::CACHE_CONTROL, "no-store")],
                Json(ViewResponse { secret }),
            )
                .into_response()
        }
        Ok(Err(SecretError::Expired)) => {
            info!(token = %token::hint(&token), "expired secret accessed");
            not_found()
        }
        Ok(Err(SecretError::NotFound)) => {
            info!(token = %token::hint(&token), "attempted to view missing secret");
            not_found()
        }
        Ok(Err(e)) => error_response(e),
        Err(e) => internal_error(e),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn error_response(e: SecretError) -> Response {
    match e {
        SecretError::Validation(msg) => {
            info!(reason = %msg, "rejected secret");
            bad_request(msg)
        }
        SecretError::NotFound | SecretError::Expired => not_found(),
        e @ (SecretError::Storage(_)
        | SecretError::Encryption(_)
        | SecretError::Decryption(_)) => internal_error(e),
    }
}

fn bad_request(msg: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": msg.into()})),
    )
        .into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": NOT_FOUND_MESSAGE})),
    )
        .into_response()
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}
