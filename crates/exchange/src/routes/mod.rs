//! HTTP surface: routers assembled under `/v1` and the `/api/v1`
//! compatibility prefix.

pub mod accounts;
pub mod settlement;
pub mod stats;
pub mod webhooks;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use crate::schemas::HealthResponse;
use crate::{auth, middleware as mw, ratelimit, AppState};

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

fn api_router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/health", get(health))
        .route("/accounts/register", post(accounts::register))
        .route("/accounts/directory", get(accounts::directory))
        .route("/accounts/{account_id}", get(accounts::get_account))
        .route("/stats", get(stats::stats));

    let authed = Router::new()
        .route("/accounts/skills", put(accounts::update_skills))
        .route("/accounts/rotate-key", post(accounts::rotate_key))
        .route("/accounts/admin/suspend", post(accounts::suspend))
        .route("/accounts/webhook", put(webhooks::set_webhook))
        .route("/accounts/webhook", delete(webhooks::delete_webhook))
        .route("/exchange/deposit", post(settlement::deposit))
        .route("/exchange/escrow", post(settlement::create_escrow))
        .route("/exchange/escrow/batch", post(settlement::batch_create_escrow))
        .route("/exchange/release", post(settlement::release))
        .route("/exchange/refund", post(settlement::refund))
        .route("/exchange/dispute", post(settlement::dispute))
        .route("/exchange/resolve", post(settlement::resolve))
        .route("/exchange/balance", get(settlement::balance))
        .route("/exchange/transactions", get(settlement::transactions))
        .route("/exchange/escrows", get(settlement::list_escrows))
        .route("/exchange/escrows/{escrow_id}", get(settlement::get_escrow))
        .route_layer(from_fn_with_state(state, auth::authenticate));

    public.merge(authed)
}

/// Build the full application router with middleware stack applied.
pub fn router(state: AppState) -> Router {
    let api = api_router(state.clone());

    Router::new()
        .route("/health", get(health))
        .nest("/v1", api.clone())
        .nest("/api/v1", api)
        .layer(from_fn_with_state(state.clone(), mw::idempotency))
        .layer(from_fn_with_state(state.clone(), ratelimit::rate_limit))
        .layer(from_fn(mw::request_id))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
