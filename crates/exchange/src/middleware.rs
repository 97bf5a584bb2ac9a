//! Request-id and idempotency layers.
//!
//! Every response carries `X-Request-Id` (echoed from the request or
//! generated). Mutating requests carrying `Idempotency-Key` are replayed
//! from the stored response when the body matches, and rejected with 409
//! when it does not.

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::models::IdempotencyRecord;
use crate::AppState;

/// Request id, exposed to handlers through extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub async fn request_id(req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req_{}", &Uuid::new_v4().simple().to_string()[..12]));

    let mut req = req;
    req.extensions_mut().insert(RequestId(id.clone()));

    let response = next.run(req).await;
    let mut response = patch_error_request_id(response, &id).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("X-Request-Id", value);
    }
    response
}

/// Fill `error.request_id` into JSON error envelopes so clients can quote it.
async fn patch_error_request_id(response: Response, request_id: &str) -> Response {
    if response.status().is_success() || response.status().is_redirection() {
        return response;
    }
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if !is_json {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return Response::from_parts(parts, Body::empty()),
    };

    let patched = serde_json::from_slice::<serde_json::Value>(&bytes)
        .ok()
        .and_then(|mut value| {
            let error = value.get_mut("error")?.as_object_mut()?;
            let empty = error
                .get("request_id")
                .and_then(|v| v.as_str())
                .map_or(true, |v| v.is_empty());
            if empty {
                error.insert(
                    "request_id".to_string(),
                    serde_json::Value::String(request_id.to_string()),
                );
            }
            serde_json::to_vec(&value).ok()
        });

    let body = match patched {
        Some(patched) => Bytes::from(patched),
        None => bytes,
    };
    let mut response = Response::from_parts(parts, Body::from(body.clone()));
    // length changed when we rewrote the body
    response.headers_mut().remove("content-length");
    response
}

/// Idempotency layer for POST requests carrying `Idempotency-Key`.
pub async fn idempotency(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if req.method() != Method::POST {
        return next.run(req).await;
    }
    let Some(key) = req
        .headers()
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
    else {
        return next.run(req).await;
    };

    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return ExchangeError::Validation(format!("failed to read request body: {e}"))
                .into_response()
        }
    };
    let body_hash = hex::encode(Sha256::digest(&bytes));

    let now = Utc::now();
    // opportunistic cleanup of expired records
    if let Err(e) = sqlx::query("DELETE FROM idempotency_records WHERE expires_at < ?")
        .bind(now)
        .execute(state.store.pool())
        .await
    {
        warn!("idempotency cleanup failed: {e}");
    }

    let record = sqlx::query_as::<_, IdempotencyRecord>(
        "SELECT * FROM idempotency_records WHERE key = ?",
    )
    .bind(&key)
    .fetch_optional(state.store.pool())
    .await;

    match record {
        Ok(Some(record)) => {
            if record.request_hash != body_hash {
                return ExchangeError::IdempotencyConflict.into_response();
            }
            return replay(record);
        }
        Ok(None) => {}
        Err(e) => return ExchangeError::Database(e).into_response(),
    }

    let req = Request::from_parts(parts, Body::from(bytes));
    let response = next.run(req).await;

    if !response.status().is_success() {
        return response;
    }

    // buffer the response so we can both persist and return it byte-identically
    let (parts, body) = response.into_parts();
    let response_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return Response::from_parts(parts, Body::empty()),
    };

    let stored = String::from_utf8_lossy(&response_bytes).into_owned();
    if let Err(e) = sqlx::query(
        "INSERT OR REPLACE INTO idempotency_records \
         (key, request_hash, response_body, status_code, created_at, expires_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&key)
    .bind(&body_hash)
    .bind(&stored)
    .bind(parts.status.as_u16() as i64)
    .bind(now)
    .bind(now + Duration::hours(24))
    .execute(state.store.pool())
    .await
    {
        warn!("failed to persist idempotency record: {e}");
    }

    Response::from_parts(parts, Body::from(response_bytes))
}

fn replay(record: IdempotencyRecord) -> Response {
    let status =
        StatusCode::from_u16(record.status_code as u16).unwrap_or(StatusCode::OK);
    let mut response = Response::new(Body::from(record.response_body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
