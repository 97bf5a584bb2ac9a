//! Network statistics projection.

use axum::extract::State;
use axum::Json;
use chrono::{Duration, Utc};

use crate::schemas::{
    StatsActivity, StatsNetworkInfo, StatsResponse, StatsTokenSupply, StatsTreasury,
};
use crate::{AppState, Result};

pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>> {
    let pool = state.store.pool();

    let total_bots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM accounts")
        .fetch_one(pool)
        .await?;
    let active_bots: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM accounts WHERE status = 'active'")
            .fetch_one(pool)
            .await?;

    let circulating: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(available), 0) FROM balances")
        .fetch_one(pool)
        .await?;
    let in_escrow: i64 =
        sqlx::query_scalar("SELECT COALESCE(SUM(held_in_escrow), 0) FROM balances")
            .fetch_one(pool)
            .await?;
    let total_supply = circulating + in_escrow;

    let since = Utc::now() - Duration::hours(24);
    let tx_count_24h: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM transactions WHERE created_at > ?")
            .bind(since)
            .fetch_one(pool)
            .await?;
    let tx_volume_24h: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0) FROM transactions WHERE created_at > ?",
    )
    .bind(since)
    .fetch_one(pool)
    .await?;

    let fees_collected: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0) FROM transactions WHERE tx_type = 'fee'",
    )
    .fetch_one(pool)
    .await?;

    let active_escrows: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM escrows WHERE status = 'held'")
            .fetch_one(pool)
            .await?;

    let denom = if total_supply > 0 { total_supply } else { 1 };
    let velocity = (tx_volume_24h as f64 / denom as f64 * 10_000.0).round() / 10_000.0;

    Ok(Json(StatsResponse {
        network: StatsNetworkInfo {
            total_bots,
            active_bots,
        },
        token_supply: StatsTokenSupply {
            circulating,
            in_escrow,
            total: total_supply,
        },
        activity_24h: StatsActivity {
            transaction_count: tx_count_24h,
            token_volume: tx_volume_24h,
            velocity,
        },
        treasury: StatsTreasury { fees_collected },
        active_escrows,
    }))
}
