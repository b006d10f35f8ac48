use std::net::SocketAddr;

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::ServiceError,
    service::{NewSecret, SecretView},
    AppState,
};

// ── IP extraction ────────────────────────────────────────────────────────────

/// First `X-Forwarded-For` entry, then `X-Real-IP`, then the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_owned();
        }
    }
    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>, what: &str) -> Result<T, ServiceError> {
    body.map(|Json(v)| v).map_err(|rejection| {
        debug!(error = %rejection.body_text(), "rejected request body");
        ServiceError::invalid(what)
    })
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Secrets ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedSecret {
    pub id: Uuid,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadSecretRequest {
    #[serde(default)]
    pub captcha_token: Option<String>,
}

pub async fn create_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Result<Json<NewSecret>, JsonRejection>,
) -> Result<Json<CreatedSecret>, ServiceError> {
    let req = json_body(body, "Invalid request format")?;
    let ip = client_ip(&headers, Some(addr));
    let id = state.service.create(req, &ip).await?;
    Ok(Json(CreatedSecret { id }))
}

pub async fn read_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    body: Result<Json<ReadSecretRequest>, JsonRejection>,
) -> Result<Json<SecretView>, ServiceError> {
    let req = json_body(body, "Invalid request")?;
    let ip = client_ip(&headers, Some(addr));
    let view = state
        .service
        .read_by_id(&id, req.captcha_token.as_deref(), &ip)
        .await?;
    Ok(Json(view))
}

pub async fn read_secret_by_name(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(name): Path<String>,
    body: Result<Json<ReadSecretRequest>, JsonRejection>,
) -> Result<Json<SecretView>, ServiceError> {
    let req = json_body(body, "Invalid request")?;
    let ip = client_ip(&headers, Some(addr));
    let view = state
        .service
        .read_by_name(&name, req.captcha_token.as_deref(), &ip)
        .await?;
    Ok(Json(view))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> Option<SocketAddr> {
        Some("192.0.2.1:4000".parse().unwrap())
    }

    #[test]
    fn forwarded_for_wins() {
        let mut h = HeaderMap::new();
        h.insert("x-forwarded-for", HeaderValue::from_static(" 203.0.113.9 , 10.0.0.1"));
        h.insert("x-real-ip", HeaderValue::from_static("198.51.100.3"));
        assert_eq!(client_ip(&h, peer()), "203.0.113.9");
    }

    #[test]
    fn real_ip_then_peer() {
        let mut h = HeaderMap::new();
        h.insert("x-real-ip", HeaderValue::from_static("198.51.100.3"));
        assert_eq!(client_ip(&h, peer()), "198.51.100.3");

        let mut empty = HeaderMap::new();
        empty.insert("x-forwarded-for", HeaderValue::from_static(""));
        assert_eq!(client_ip(&empty, peer()), "192.0.2.1");
        assert_eq!(client_ip(&HeaderMap::new(), None), "");
    }
}
