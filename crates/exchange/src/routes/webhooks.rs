//! Webhook sink configuration.

use axum::extract::State;
use axum::{Extension, Json};
use chrono::Utc;

use crate::auth::{generate_webhook_secret, CurrentAccount};
use crate::error::ExchangeError;
use crate::models::WebhookConfig;
use crate::schemas::{WebhookDeleteResponse, WebhookResponse, WebhookSetRequest};
use crate::webhooks::ALL_EVENTS;
use crate::{AppState, Result};

pub async fn set_webhook(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentAccount>,
    Json(body): Json<WebhookSetRequest>,
) -> Result<Json<WebhookResponse>> {
    let events = body
        .events
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| ALL_EVENTS.iter().map(|e| e.to_string()).collect());
    let events_json =
        serde_json::to_string(&events).map_err(|e| ExchangeError::Internal(e.to_string()))?;
    let now = Utc::now();

    let existing = sqlx::query_as::<_, WebhookConfig>(
        "SELECT * FROM webhook_configs WHERE account_id = ?",
    )
    .bind(&current.id)
    .fetch_optional(state.store.pool())
    .await?;

    if existing.is_some() {
        sqlx::query(
            "UPDATE webhook_configs SET url = ?, events = ?, active = 1, updated_at = ? \
             WHERE account_id = ?",
        )
        .bind(&body.url)
        .bind(&events_json)
        .bind(now)
        .bind(&current.id)
        .execute(state.store.pool())
        .await?;

        return Ok(Json(WebhookResponse {
            webhook_url: body.url,
            secret: None,
            events,
            active: true,
        }));
    }

    let secret = generate_webhook_secret();
    sqlx::query(
        "INSERT INTO webhook_configs (account_id, url, secret, events, active, created_at, \
         updated_at) VALUES (?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(&current.id)
    .bind(&body.url)
    .bind(&secret)
    .bind(&events_json)
    .bind(now)
    .bind(now)
    .execute(state.store.pool())
    .await?;

    Ok(Json(WebhookResponse {
        webhook_url: body.url,
        secret: Some(secret),
        events,
        active: true,
    }))
}

pub async fn delete_webhook(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentAccount>,
) -> Result<Json<WebhookDeleteResponse>> {
    let deleted = sqlx::query("DELETE FROM webhook_configs WHERE account_id = ?")
        .bind(&current.id)
        .execute(state.store.pool())
        .await?;
    if deleted.rows_affected() == 0 {
        return Err(ExchangeError::NotFound("No webhook configured".to_string()));
    }
    Ok(Json(WebhookDeleteResponse {
        status: "removed".to_string(),
    }))
}
