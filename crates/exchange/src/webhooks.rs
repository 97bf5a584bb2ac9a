//! At-least-once webhook delivery pipeline.
//!
//! Deliveries run on spawned tasks after the triggering transaction has
//! committed, so a slow sink can never hold row locks. Each delivery is
//! signed with the sink's secret and retried on a fixed backoff; receivers
//! deduplicate by the `X-A2ASE-Delivery` id.

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::config::Settings;
use crate::models::{Escrow, WebhookConfig};
use crate::store::Store;

/// Every event the exchange emits. An empty subscription list means all of
/// these.
pub const ALL_EVENTS: &[&str] = &[
    "escrow.created",
    "escrow.released",
    "escrow.refunded",
    "escrow.expired",
    "escrow.expiring_soon",
    "escrow.disputed",
    "escrow.dispute_pending_mediation",
    "escrow.resolved",
    "account.spending_limit_breached",
];

const RETRY_BACKOFF_SECS: &[u64] = &[5, 25, 125];

type HmacSha256 = Hmac<Sha256>;

pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts keys of any length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    store: Store,
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
}

impl WebhookDispatcher {
    pub fn new(store: Store, settings: &Settings) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(settings.webhook_timeout_seconds),
            max_retries: settings.webhook_max_retries,
        }
    }

    /// Fan an escrow event out to both parties' active sinks. Returns
    /// immediately; lookups and deliveries happen on a spawned task.
    pub fn fire_escrow_event(&self, escrow: &Escrow, event: &str) {
        let payload = json!({
            "event": event,
            "timestamp": Utc::now().to_rfc3339(),
            "data": {
                "escrow_id": escrow.id,
                "requester_id": escrow.requester_id,
                "provider_id": escrow.provider_id,
                "amount": escrow.amount,
                "fee_amount": escrow.fee_amount,
                "status": escrow.status.as_str(),
            },
        });
        self.fan_out(
            vec![escrow.requester_id.clone(), escrow.provider_id.clone()],
            event.to_string(),
            payload,
        );
    }

    /// Fire a non-escrow event at a single account's sink.
    pub fn fire_account_event(&self, account_id: &str, event: &str, data: serde_json::Value) {
        let payload = json!({
            "event": event,
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        });
        self.fan_out(vec![account_id.to_string()], event.to_string(), payload);
    }

    fn fan_out(&self, account_ids: Vec<String>, event: String, payload: serde_json::Value) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let configs = match dispatcher.configs_for(&account_ids).await {
                Ok(configs) => configs,
                Err(e) => {
                    warn!("webhook config lookup failed: {e}");
                    return;
                }
            };

            let body = payload.to_string().into_bytes();
            for cfg in configs {
                if !cfg.events.is_empty() && !cfg.events.iter().any(|e| e == &event) {
                    continue;
                }
                let dispatcher = dispatcher.clone();
                let event = event.clone();
                let body = body.clone();
                // sinks are independent: one failing delivery never blocks another
                tokio::spawn(async move {
                    dispatcher.deliver(&cfg.url, &cfg.secret, &event, &body).await;
                });
            }
        });
    }

    async fn configs_for(
        &self,
        account_ids: &[String],
    ) -> std::result::Result<Vec<WebhookConfig>, sqlx::Error> {
        let mut configs = Vec::new();
        for account_id in account_ids {
            let cfg = sqlx::query_as::<_, WebhookConfig>(
                "SELECT * FROM webhook_configs WHERE account_id = ? AND active = 1",
            )
            .bind(account_id)
            .fetch_optional(self.store.pool())
            .await?;
            if let Some(cfg) = cfg {
                configs.push(cfg);
            }
        }
        Ok(configs)
    }

    async fn deliver(&self, url: &str, secret: &str, event: &str, body: &[u8]) {
        let signature = sign_payload(secret, body);
        let delivery_id = format!("evt_{}", &Uuid::new_v4().simple().to_string()[..12]);

        for attempt in 0..=self.max_retries {
            let result = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .header("X-A2ASE-Signature", &signature)
                .header("X-A2ASE-Event", event)
                .header("X-A2ASE-Delivery", &delivery_id)
                .body(body.to_vec())
                .timeout(self.timeout)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => warn!(
                    "webhook delivery to {url} returned {} (attempt {})",
                    resp.status(),
                    attempt + 1
                ),
                Err(e) => warn!("webhook delivery to {url} failed (attempt {}): {e}", attempt + 1),
            }

            if attempt < self.max_retries {
                let idx = (attempt as usize).min(RETRY_BACKOFF_SECS.len() - 1);
                tokio::time::sleep(Duration::from_secs(RETRY_BACKOFF_SECS[idx])).await;
            }
        }
    }
}
