// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! `/kbs/v0` HTTP binding of the attestation-session protocol.
//!
//! Session correlation between `auth` and `attest` uses the `kbs-session-id`
//! cookie; resource requests authenticate with `Authorization: Bearer`.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::application::broker_service::{Attestation, AuthRequest, KeyBrokerService};
use crate::domain::error::{ErrorKind, KbsError};
use crate::domain::resource::ResourceDescriptor;
use crate::domain::session::SessionId;

pub const SESSION_COOKIE: &str = "kbs-session-id";
const ERROR_TYPE_PREFIX: &str = "https://github.com/confidential-containers/kbs/errors";

pub fn router(service: Arc<KeyBrokerService>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/kbs/v0/auth", post(auth_handler))
        .route("/kbs/v0/attest", post(attest_handler))
        .route("/kbs/v0/resource/{repository}/{type}/{tag}", get(resource_handler))
        .route("/kbs/v0/token-certificate-chain", get(token_certificate_handler))
        .route("/kbs/v0/attestation-policy", get(attestation_policy_handler))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Error body: `{"type": ".../<Kind>", "detail": "<redacted>"}`.
#[derive(Debug)]
pub enum ApiError {
    Kbs(KbsError),
    BadRequest(String),
}

impl From<KbsError> for ApiError {
    fn from(e: KbsError) -> Self {
        ApiError::Kbs(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::SessionNotFound
        | ErrorKind::SessionExpired
        | ErrorKind::TokenInvalid
        | ErrorKind::NotAttested
        | ErrorKind::EvidenceVerificationFailed => StatusCode::UNAUTHORIZED,
        ErrorKind::PolicyDenied => StatusCode::FORBIDDEN,
        ErrorKind::ResourceNotFound => StatusCode::NOT_FOUND,
        ErrorKind::WrongProtocolState => StatusCode::CONFLICT,
        ErrorKind::EncryptionFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, detail) = match self {
            ApiError::Kbs(e) => (status_for(e.kind()), e.kind().as_str(), e.to_redacted_string()),
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, "BadRequest", detail),
        };
        let body = json!({
            "type": format!("{}/{}", ERROR_TYPE_PREFIX, kind),
            "detail": detail,
        });
        (status, Json(body)).into_response()
    }
}

async fn health_handler(State(service): State<Arc<KeyBrokerService>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "active_sessions": service.active_sessions(),
    }))
}

async fn auth_handler(
    State(service): State<Arc<KeyBrokerService>>,
    payload: Result<Json<AuthRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let started = service.start_session(&request);
    let cookie = format!("{}={}; Path=/kbs/v0; HttpOnly", SESSION_COOKIE, started.session_id);
    let cookie = HeaderValue::from_str(&cookie).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(([(header::SET_COOKIE, cookie)], Json(started.challenge)).into_response())
}

async fn attest_handler(
    State(service): State<Arc<KeyBrokerService>>,
    headers: HeaderMap,
    payload: Result<Json<Attestation>, JsonRejection>,
) -> Result<Response, ApiError> {
    let session_id = session_cookie(&headers)?;
    let Json(attestation) = payload?;
    let token = service.attest(session_id, attestation).await?;
    Ok(Json(token).into_response())
}

async fn resource_handler(
    State(service): State<Arc<KeyBrokerService>>,
    headers: HeaderMap,
    Path((repository, kind, tag)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let credential = bearer_credential(&headers)?;
    let descriptor = ResourceDescriptor::new(&repository, &kind, &tag)
        .map_err(|e| KbsError::ResourceNotFound(e.to_string()))?;
    let envelope = service.fetch_resource(credential, &descriptor).await?;
    Ok(Json(envelope).into_response())
}

async fn token_certificate_handler(
    State(service): State<Arc<KeyBrokerService>>,
) -> Result<Response, ApiError> {
    Ok(Json(service.token_certificate()?).into_response())
}

async fn attestation_policy_handler(State(service): State<Arc<KeyBrokerService>>) -> Response {
    Json(service.attestation_policy().clone()).into_response()
}

fn session_cookie(headers: &HeaderMap) -> Result<SessionId, KbsError> {
    let value = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
        .ok_or_else(|| KbsError::SessionNotFound("missing session cookie".to_string()))?;
    debug!(cookie = %value, "Session cookie presented");
    SessionId::parse(value)
}

fn bearer_credential(headers: &HeaderMap) -> Result<&str, KbsError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| KbsError::TokenInvalid("missing bearer credential".to_string()))
}
