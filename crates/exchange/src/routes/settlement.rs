//! Settlement operations: deposits, escrow lifecycle, balances, history.
//!
//! Handlers delegate to the ledger and fire webhooks/attestations only
//! after the ledger transaction has committed.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;

use crate::auth::CurrentAccount;
use crate::error::ExchangeError;
use crate::ledger::{EscrowFilter, EscrowSpec, Resolution, SweptEscrows};
use crate::models::{Account, EscrowStatus};
use crate::schemas::{
    BalanceResponse, BatchEscrowRequest, DepositRequest, DepositResponse, DisputeRequest,
    DisputeResponse, EscrowDetailResponse, EscrowListResponse, EscrowRequest, EscrowResponse,
    RefundRequest, RefundResponse, ReleaseRequest, ReleaseResponse, ResolveRefundResponse,
    ResolveReleaseResponse, ResolveRequest, TransactionItem, TransactionsResponse,
};
use crate::{AppState, Result};

/// Emit events and attestations for escrows a mini-sweep expired inside the
/// operation's transaction. They left the `held` set there, so the
/// background sweep will never report them; this is their one emission path.
fn fire_swept(state: &AppState, swept: &SweptEscrows) {
    for escrow in &swept.expired {
        state.webhooks.fire_escrow_event(escrow, "escrow.expired");
        state.compliance.record_terminal(escrow, None);
    }
    for escrow in &swept.cascaded {
        state.webhooks.fire_escrow_event(escrow, "escrow.refunded");
        state.compliance.record_terminal(escrow, None);
    }
}

pub async fn deposit(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentAccount>,
    Json(body): Json<DepositRequest>,
) -> Result<(StatusCode, Json<DepositResponse>)> {
    let outcome = state
        .ledger
        .deposit(&current.id, body.amount, body.reference.as_deref())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(DepositResponse {
            deposit_id: outcome.deposit_id,
            account_id: current.id,
            amount: body.amount,
            currency: body.currency,
            new_balance: outcome.new_balance,
            reference: body.reference,
        }),
    ))
}

pub async fn create_escrow(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentAccount>,
    Json(body): Json<EscrowRequest>,
) -> Result<(StatusCode, Json<EscrowResponse>)> {
    let spec = EscrowSpec {
        provider_id: body.provider_id,
        amount: body.amount,
        task_id: body.task_id,
        task_type: body.task_type,
        ttl_minutes: body.ttl_minutes,
        group_id: body.group_id,
        depends_on: body.depends_on,
        deliverables: body.deliverables,
    };
    let outcome = state.ledger.create_escrow(&current.id, spec).await?;

    fire_swept(&state, &outcome.swept);
    state
        .webhooks
        .fire_escrow_event(&outcome.escrow, "escrow.created");

    Ok((
        StatusCode::CREATED,
        Json(EscrowResponse::from(&outcome.escrow)),
    ))
}

pub async fn batch_create_escrow(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentAccount>,
    Json(body): Json<BatchEscrowRequest>,
) -> Result<(StatusCode, Json<crate::schemas::BatchEscrowResponse>)> {
    let items: Vec<EscrowSpec> = body
        .escrows
        .into_iter()
        .map(|item| EscrowSpec {
            provider_id: item.provider_id,
            amount: item.amount,
            task_id: item.task_id,
            task_type: item.task_type,
            ttl_minutes: item.ttl_minutes,
            group_id: None,
            depends_on: item.depends_on,
            deliverables: item.deliverables,
        })
        .collect();

    let outcome = state
        .ledger
        .create_batch(&current.id, body.group_id, &items)
        .await?;

    fire_swept(&state, &outcome.swept);
    for escrow in &outcome.escrows {
        state.webhooks.fire_escrow_event(escrow, "escrow.created");
    }

    Ok((
        StatusCode::CREATED,
        Json(crate::schemas::BatchEscrowResponse {
            group_id: outcome.group_id,
            escrows: outcome.escrows.iter().map(EscrowResponse::from).collect(),
        }),
    ))
}

pub async fn release(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentAccount>,
    Json(body): Json<ReleaseRequest>,
) -> Result<Json<ReleaseResponse>> {
    let outcome = state.ledger.release(&body.escrow_id, &current.id).await?;

    fire_swept(&state, &outcome.swept);
    state
        .webhooks
        .fire_escrow_event(&outcome.escrow, "escrow.released");
    state.compliance.record_terminal(&outcome.escrow, None);

    Ok(Json(ReleaseResponse {
        escrow_id: outcome.escrow.id.clone(),
        status: "released".to_string(),
        amount_paid: outcome.escrow.amount,
        fee_collected: outcome.escrow.fee_amount,
        provider_id: outcome.escrow.provider_id.clone(),
    }))
}

pub async fn refund(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentAccount>,
    Json(body): Json<RefundRequest>,
) -> Result<Json<RefundResponse>> {
    let outcome = state
        .ledger
        .refund(&body.escrow_id, &current.id, body.reason.as_deref())
        .await?;

    fire_swept(&state, &outcome.swept);
    state
        .webhooks
        .fire_escrow_event(&outcome.escrow, "escrow.refunded");
    state.compliance.record_terminal(&outcome.escrow, None);
    for cascaded in &outcome.cascaded {
        state.webhooks.fire_escrow_event(cascaded, "escrow.refunded");
        state.compliance.record_terminal(cascaded, None);
    }

    Ok(Json(RefundResponse {
        escrow_id: outcome.escrow.id.clone(),
        status: "refunded".to_string(),
        amount_returned: outcome.escrow.total_held(),
        requester_id: outcome.escrow.requester_id.clone(),
    }))
}

pub async fn dispute(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentAccount>,
    Json(body): Json<DisputeRequest>,
) -> Result<Json<DisputeResponse>> {
    let escrow = state
        .ledger
        .dispute(&body.escrow_id, &current.id, &body.reason)
        .await?;

    state.webhooks.fire_escrow_event(&escrow, "escrow.disputed");
    state
        .webhooks
        .fire_escrow_event(&escrow, "escrow.dispute_pending_mediation");

    Ok(Json(DisputeResponse {
        escrow_id: escrow.id,
        status: "disputed".to_string(),
        reason: body.reason,
    }))
}

pub async fn resolve(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentAccount>,
    Json(body): Json<ResolveRequest>,
) -> Result<Response> {
    let resolution = Resolution::parse(&body.resolution).ok_or_else(|| {
        ExchangeError::Validation("resolution must be 'release' or 'refund'".to_string())
    })?;

    // resolve needs the full account row for the operator check
    let caller = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
        .bind(&current.id)
        .fetch_optional(state.store.pool())
        .await?
        .ok_or_else(|| ExchangeError::NotFound("Account not found".to_string()))?;

    let escrow = state
        .ledger
        .resolve(&body.escrow_id, &caller, resolution, body.strategy.as_deref())
        .await?;

    state.webhooks.fire_escrow_event(&escrow, "escrow.resolved");
    state.compliance.record_terminal(&escrow, Some(&caller.id));

    let response = match resolution {
        Resolution::Release => Json(ResolveReleaseResponse {
            escrow_id: escrow.id.clone(),
            resolution: "release".to_string(),
            status: "released".to_string(),
            amount_paid: escrow.amount,
            fee_collected: escrow.fee_amount,
            provider_id: escrow.provider_id.clone(),
        })
        .into_response(),
        Resolution::Refund => Json(ResolveRefundResponse {
            escrow_id: escrow.id.clone(),
            resolution: "refund".to_string(),
            status: "refunded".to_string(),
            amount_returned: escrow.total_held(),
            requester_id: escrow.requester_id.clone(),
        })
        .into_response(),
    };
    Ok(response)
}

pub async fn balance(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentAccount>,
) -> Result<Json<BalanceResponse>> {
    let (account, balance) = state.ledger.balance_of(&current.id).await?;
    Ok(Json(BalanceResponse {
        account_id: account.id,
        bot_name: account.bot_name,
        reputation: account.reputation,
        account_status: account.status.as_str().to_string(),
        available: balance.available,
        held_in_escrow: balance.held_in_escrow,
        total_earned: balance.total_earned,
        total_spent: balance.total_spent,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn transactions(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentAccount>,
    Query(page): Query<PageQuery>,
) -> Result<Json<TransactionsResponse>> {
    let rows = state
        .ledger
        .transactions_for(&current.id, page.limit, page.offset)
        .await?;
    Ok(Json(TransactionsResponse {
        transactions: rows.iter().map(TransactionItem::from).collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct EscrowListQuery {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

pub async fn list_escrows(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentAccount>,
    Query(query): Query<EscrowListQuery>,
) -> Result<Json<EscrowListResponse>> {
    let status = match &query.status {
        None => None,
        Some(raw) => Some(EscrowStatus::parse(raw).ok_or_else(|| {
            ExchangeError::Validation(format!("unknown escrow status: {raw}"))
        })?),
    };

    let filter = EscrowFilter {
        task_id: query.task_id,
        group_id: query.group_id,
        status,
        limit: query.limit,
        offset: query.offset,
    };
    let (escrows, total) = state.ledger.list_escrows(&current.id, &filter).await?;

    Ok(Json(EscrowListResponse {
        escrows: escrows.iter().map(EscrowDetailResponse::from).collect(),
        total,
    }))
}

pub async fn get_escrow(
    State(state): State<AppState>,
    Extension(_current): Extension<CurrentAccount>,
    Path(escrow_id): Path<String>,
) -> Result<Json<EscrowDetailResponse>> {
    let escrow = state.ledger.get_escrow(&escrow_id).await?;
    Ok(Json(EscrowDetailResponse::from(&escrow)))
}
