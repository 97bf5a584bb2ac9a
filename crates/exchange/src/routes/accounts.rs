//! Account registration, directory, skills, key rotation, suspension.

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::{self, CurrentAccount};
use crate::error::{is_unique_violation, ExchangeError};
use crate::ledger::record_mint;
use crate::models::{Account, AccountStatus};
use crate::ratelimit::client_ip;
use crate::schemas::{
    AccountResponse, DirectoryResponse, RegisterAccountInfo, RegisterRequest, RegisterResponse,
    RotateKeyResponse, SuspendRequest, SuspendResponse, UpdateSkillsRequest, UpdateSkillsResponse,
};
use crate::{AppState, Result};

fn valid_email(email: &str) -> bool {
    let mut parts = email.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
        }
        _ => false,
    }
}

pub async fn register(
    State(state): State<AppState>,
    req: Request,
) -> Result<(StatusCode, Json<RegisterResponse>)> {
    let ip = client_ip(&req);
    state.limiter.check_register(&ip)?;

    let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| ExchangeError::Validation(format!("failed to read request body: {e}")))?;
    let body: RegisterRequest = serde_json::from_slice(&bytes)
        .map_err(|e| ExchangeError::Validation(format!("invalid request body: {e}")))?;

    if body.bot_name.trim().is_empty() || body.developer_id.trim().is_empty() {
        return Err(ExchangeError::Validation(
            "bot_name and developer_id are required".to_string(),
        ));
    }
    if !valid_email(&body.contact_email) {
        return Err(ExchangeError::Validation(
            "contact_email is not a valid email address".to_string(),
        ));
    }
    if let Some(expected) = &state.settings.invite_code {
        if body.invite_code.as_deref() != Some(expected.as_str()) {
            return Err(ExchangeError::Forbidden("Invalid invite code".to_string()));
        }
    }

    let api_key = auth::generate_api_key();
    let api_key_hash = auth::hash_api_key(&api_key, state.settings.api_key_cost)?;
    let skills = body.skills.clone().unwrap_or_default();
    let now = Utc::now();
    let account_id = Uuid::new_v4().to_string();

    let mut tx = state.store.pool().begin().await?;

    let insert = sqlx::query(
        "INSERT INTO accounts (id, bot_name, developer_id, developer_name, contact_email, \
         api_key_hash, description, skills, status, reputation, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'active', 0.5, ?, ?)",
    )
    .bind(&account_id)
    .bind(&body.bot_name)
    .bind(&body.developer_id)
    .bind(&body.developer_name)
    .bind(&body.contact_email)
    .bind(&api_key_hash)
    .bind(&body.description)
    .bind(serde_json::to_string(&skills).map_err(|e| ExchangeError::Internal(e.to_string()))?)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await;

    if let Err(e) = insert {
        if is_unique_violation(&e) {
            return Err(ExchangeError::TaskConflict(
                "A bot with this name already exists".to_string(),
            ));
        }
        return Err(e.into());
    }

    sqlx::query(
        "INSERT INTO balances (account_id, available, held_in_escrow, total_earned, \
         total_spent, updated_at) VALUES (?, ?, 0, 0, 0, ?)",
    )
    .bind(&account_id)
    .bind(state.settings.starter_tokens)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    record_mint(
        &mut tx,
        &account_id,
        state.settings.starter_tokens,
        "Starter token allocation on registration",
        now,
    )
    .await?;

    tx.commit().await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: "Bot registered successfully. Save your API key - it will not be shown again."
                .to_string(),
            account: RegisterAccountInfo {
                id: account_id,
                bot_name: body.bot_name,
                developer_id: body.developer_id,
                developer_name: body.developer_name,
                contact_email: body.contact_email,
                description: body.description,
                skills,
                status: "active".to_string(),
                reputation: 0.5,
                created_at: now,
            },
            api_key,
            starter_tokens: state.settings.starter_tokens,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct DirectoryQuery {
    #[serde(default)]
    pub skill: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn directory(
    State(state): State<AppState>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Json<DirectoryResponse>> {
    let accounts = sqlx::query_as::<_, Account>(
        "SELECT * FROM accounts WHERE status = 'active' \
         ORDER BY reputation DESC LIMIT ? OFFSET ?",
    )
    .bind(query.limit)
    .bind(query.offset)
    .fetch_all(state.store.pool())
    .await?;

    let bots: Vec<AccountResponse> = accounts
        .iter()
        .filter(|acct| match &query.skill {
            Some(skill) => acct.skills.iter().any(|s| s == skill),
            None => true,
        })
        .map(AccountResponse::from)
        .collect();

    let count = bots.len();
    Ok(Json(DirectoryResponse { bots, count }))
}

pub async fn get_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<AccountResponse>> {
    let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
        .bind(&account_id)
        .fetch_optional(state.store.pool())
        .await?
        .ok_or_else(|| ExchangeError::NotFound("Account not found".to_string()))?;
    Ok(Json(AccountResponse::from(&account)))
}

pub async fn update_skills(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentAccount>,
    Json(body): Json<UpdateSkillsRequest>,
) -> Result<Json<UpdateSkillsResponse>> {
    let skills_json =
        serde_json::to_string(&body.skills).map_err(|e| ExchangeError::Internal(e.to_string()))?;
    let updated = sqlx::query("UPDATE accounts SET skills = ?, updated_at = ? WHERE id = ?")
        .bind(&skills_json)
        .bind(Utc::now())
        .bind(&current.id)
        .execute(state.store.pool())
        .await?;
    if updated.rows_affected() == 0 {
        return Err(ExchangeError::NotFound("Account not found".to_string()));
    }
    Ok(Json(UpdateSkillsResponse {
        account_id: current.id,
        skills: body.skills,
    }))
}

pub async fn rotate_key(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentAccount>,
) -> Result<Json<RotateKeyResponse>> {
    let new_key = auth::generate_api_key();
    let new_hash = auth::hash_api_key(&new_key, state.settings.api_key_cost)?;
    let now = Utc::now();

    let updated = sqlx::query(
        "UPDATE accounts SET previous_api_key_hash = api_key_hash, key_rotated_at = ?, \
         api_key_hash = ?, updated_at = ? WHERE id = ?",
    )
    .bind(now)
    .bind(&new_hash)
    .bind(now)
    .bind(&current.id)
    .execute(state.store.pool())
    .await?;
    if updated.rows_affected() == 0 {
        return Err(ExchangeError::NotFound("Account not found".to_string()));
    }

    Ok(Json(RotateKeyResponse {
        api_key: new_key,
        grace_period_minutes: state.settings.key_rotation_grace_minutes,
    }))
}

pub async fn suspend(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentAccount>,
    Json(body): Json<SuspendRequest>,
) -> Result<Json<SuspendResponse>> {
    if current.status != AccountStatus::Operator {
        return Err(ExchangeError::Forbidden(
            "Only the exchange operator can suspend accounts".to_string(),
        ));
    }

    let target = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
        .bind(&body.account_id)
        .fetch_optional(state.store.pool())
        .await?
        .ok_or_else(|| ExchangeError::NotFound("Account not found".to_string()))?;
    if target.status == AccountStatus::Operator {
        return Err(ExchangeError::Forbidden(
            "Operator accounts cannot be suspended".to_string(),
        ));
    }

    sqlx::query("UPDATE accounts SET status = 'suspended', updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(&body.account_id)
        .execute(state.store.pool())
        .await?;

    Ok(Json(SuspendResponse {
        account_id: body.account_id,
        status: "suspended".to_string(),
        reason: body.reason,
    }))
}
