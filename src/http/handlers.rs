//! Route handlers

use std::fmt;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::{Method, Request, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::response::{self, decode_valid, HttpResponse, Problems, Validator};
use super::AppState;
use crate::identity;

/// Body of `POST /publish`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PublishRequest {
    pub subject: String,
    pub message: String,
}

impl Validator for PublishRequest {
    fn valid(&self) -> Problems {
        let mut problems = Problems::new();
        if self.subject.trim().is_empty() {
            problems.insert("subject".to_string(), "required".to_string());
        }
        if self.message.trim().is_empty() {
            problems.insert("message".to_string(), "required".to_string());
        }
        problems
    }
}

/// Pick the handler for a path
pub async fn route<B>(state: AppState, req: Request<B>) -> HttpResponse
where
    B: Body<Data = Bytes>,
    B::Error: fmt::Display,
{
    match req.uri().path() {
        "/healthz" => healthz(),
        "/publish" => publish(&state, req).await,
        _ => response::error(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Liveness probe; never looks at the pool
pub fn healthz() -> HttpResponse {
    response::encode(StatusCode::OK, &serde_json::json!({ "status": "ok" }))
}

/// Publish a message as the caller's identity
pub async fn publish<B>(state: &AppState, req: Request<B>) -> HttpResponse
where
    B: Body<Data = Bytes>,
    B::Error: fmt::Display,
{
    if req.method() != Method::POST {
        return response::error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return response::error(StatusCode::BAD_REQUEST, &format!("decode json: {}", e))
        }
    };
    let request: PublishRequest = match decode_valid(&body) {
        Ok(request) => request,
        Err(problems) => return response::encode(StatusCode::BAD_REQUEST, &problems),
    };

    let identity = identity::extract(&parts.headers);
    debug!(
        "Publishing {} bytes to '{}' as '{}'",
        request.message.len(),
        request.subject,
        identity.username()
    );

    let conn = match state.pool.get_or_create(&identity).await {
        Ok(conn) => conn,
        Err(e) if e.is_authorization() => {
            debug!("Broker refused '{}': {}", identity.username(), e);
            return response::error(StatusCode::UNAUTHORIZED, "unauthorized");
        }
        Err(e) => {
            return response::error(
                StatusCode::BAD_GATEWAY,
                &format!("could not establish broker connection: {}", e),
            )
        }
    };

    let payload = Bytes::from(request.message.into_bytes());
    if let Err(e) = conn.publish(&request.subject, payload).await {
        warn!(
            "Publish to '{}' as '{}' failed: {}",
            request.subject,
            identity.username(),
            e
        );
        // The next request for this identity gets a fresh session
        if state.pool.remove_connection(&conn) {
            tokio::spawn(async move { conn.close().await });
        }
        return response::error(StatusCode::BAD_GATEWAY, &e.to_string());
    }

    response::empty(StatusCode::OK)
}
