//! Bearer-key authentication and key rotation.
//!
//! Keys are opaque `ate_`-prefixed strings; only bcrypt hashes are stored.
//! After a rotation the previous hash keeps authenticating for a grace
//! window. Optional request signing binds timestamp, method, path, and body
//! under HMAC-SHA256 with the api key.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::ExchangeError;
use crate::models::{Account, AccountStatus};
use crate::AppState;
use crate::Result;

type HmacSha256 = Hmac<Sha256>;

/// The authenticated caller, inserted into request extensions.
#[derive(Debug, Clone)]
pub struct CurrentAccount {
    pub id: String,
    pub bot_name: String,
    pub developer_id: String,
    pub status: AccountStatus,
}

impl From<&Account> for CurrentAccount {
    fn from(acct: &Account) -> Self {
        Self {
            id: acct.id.clone(),
            bot_name: acct.bot_name.clone(),
            developer_id: acct.developer_id.clone(),
            status: acct.status,
        }
    }
}

/// Generate a fresh api key: `ate_` + 16 random bytes, hex.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("ate_{}", hex::encode(bytes))
}

/// Generate a webhook secret: `whsec_` + 24 random bytes, hex.
pub fn generate_webhook_secret() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("whsec_{}", hex::encode(bytes))
}

pub fn hash_api_key(key: &str, cost: u32) -> Result<String> {
    bcrypt::hash(key, cost).map_err(|e| ExchangeError::Internal(e.to_string()))
}

fn check_api_key(key: &str, hash: &str) -> bool {
    bcrypt::verify(key, hash).unwrap_or(false)
}

/// Verify `HMAC-SHA256(api_key, timestamp || method || path || body)`.
fn verify_signature(
    api_key: &str,
    method: &str,
    path: &str,
    body: &[u8],
    signature: &str,
    timestamp: &str,
    max_age_seconds: i64,
) -> bool {
    let Ok(ts) = timestamp.parse::<i64>() else {
        return false;
    };
    let now_ts = Utc::now().timestamp();
    if (now_ts - ts).abs() > max_age_seconds {
        return false;
    }

    let Ok(mut mac) = HmacSha256::new_from_slice(api_key.as_bytes()) else {
        return false;
    };
    mac.update(timestamp.as_bytes());
    mac.update(method.as_bytes());
    mac.update(path.as_bytes());
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());

    // constant-time comparison
    expected.len() == signature.len()
        && expected
            .bytes()
            .zip(signature.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Middleware guarding authenticated routes. Buffers the body (it may be
/// signed), resolves the caller, and stashes a [`CurrentAccount`] extension.
pub async fn authenticate(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    match authenticate_inner(state, req).await {
        Ok(req) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}

async fn authenticate_inner(state: AppState, req: Request) -> Result<Request> {
    let (parts, body) = req.into_parts();

    let authorization = parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let Some(api_key) = authorization.strip_prefix("Bearer ").map(str::trim) else {
        return Err(ExchangeError::AuthRequired(
            "Missing or invalid Authorization header. Use: Bearer ate_<your_api_key>".to_string(),
        ));
    };
    if !api_key.starts_with("ate_") {
        return Err(ExchangeError::AuthInvalid("Invalid API key format".to_string()));
    }

    let signature = parts
        .headers
        .get("x-a2a-signature")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let timestamp = parts
        .headers
        .get("x-a2a-timestamp")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let has_signature = signature.is_some() && timestamp.is_some();

    if state.settings.require_signatures && !has_signature {
        return Err(ExchangeError::AuthRequired(
            "Request signature required. Provide X-A2A-Signature and X-A2A-Timestamp headers."
                .to_string(),
        ));
    }

    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ExchangeError::Validation(format!("failed to read request body: {e}")))?;

    if has_signature {
        let ok = verify_signature(
            api_key,
            parts.method.as_str(),
            parts.uri.path(),
            &bytes,
            signature.as_deref().unwrap_or_default(),
            timestamp.as_deref().unwrap_or_default(),
            state.settings.signature_max_age_seconds,
        );
        if !ok {
            return Err(ExchangeError::AuthInvalid("Invalid request signature".to_string()));
        }
    }

    let account = resolve_account(&state, api_key).await?;

    let mut req = Request::from_parts(parts, axum::body::Body::from(bytes));
    req.extensions_mut().insert(CurrentAccount::from(&account));
    Ok(req)
}

/// bcrypt-compare the presented key against every non-suspended account's
/// current hash, then (inside the grace window) its previous hash.
async fn resolve_account(state: &AppState, api_key: &str) -> Result<Account> {
    let accounts = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE status != 'suspended'")
        .fetch_all(state.store.pool())
        .await?;

    let now = Utc::now();
    let grace = Duration::minutes(state.settings.key_rotation_grace_minutes);

    for acct in accounts {
        if check_api_key(api_key, &acct.api_key_hash) {
            return Ok(acct);
        }
        if let (Some(previous), Some(rotated_at)) =
            (&acct.previous_api_key_hash, acct.key_rotated_at)
        {
            if now - rotated_at < grace && check_api_key(api_key, previous) {
                return Ok(acct);
            }
        }
    }

    Err(ExchangeError::AuthInvalid("Invalid API key".to_string()))
}
