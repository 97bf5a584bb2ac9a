//! Shared fixtures: a temp-file exchange with direct ledger access.
#![allow(dead_code)] // each integration binary uses a different subset

use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;
use uuid::Uuid;

use a2a_exchange::attest::ComplianceBridge;
use a2a_exchange::models::Balance;
use a2a_exchange::{AppState, Settings, Store};

pub struct TestExchange {
    // held for the lifetime of the database files
    pub dir: TempDir,
    pub state: AppState,
}

pub async fn setup() -> TestExchange {
    setup_with(Settings::default()).await
}

pub async fn setup_with(mut settings: Settings) -> TestExchange {
    let dir = TempDir::new().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("exchange.db").display());
    settings.database_url = url.clone();
    // cheap hashes keep auth-path tests fast
    settings.api_key_cost = 4;

    let store = Store::open(&url).await.expect("open store");
    let state = AppState::new(settings, store, ComplianceBridge::disabled());
    TestExchange { dir, state }
}

/// Insert an account + starter balance directly, skipping the HTTP layer.
pub async fn create_account(state: &AppState, bot_name: &str, starter: i64) -> String {
    create_account_with_status(state, bot_name, starter, "active").await
}

pub async fn create_account_with_status(
    state: &AppState,
    bot_name: &str,
    starter: i64,
    status: &str,
) -> String {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();

    sqlx::query(
        "INSERT INTO accounts (id, bot_name, developer_id, developer_name, contact_email, \
         api_key_hash, skills, status, reputation, created_at, updated_at) \
         VALUES (?, ?, 'dev', 'Test Dev', 'test@test.dev', 'unused-hash', '[]', ?, 0.5, ?, ?)",
    )
    .bind(&id)
    .bind(bot_name)
    .bind(status)
    .bind(now)
    .bind(now)
    .execute(state.store.pool())
    .await
    .expect("insert account");

    sqlx::query(
        "INSERT INTO balances (account_id, available, held_in_escrow, total_earned, \
         total_spent, updated_at) VALUES (?, ?, 0, 0, 0, ?)",
    )
    .bind(&id)
    .bind(starter)
    .bind(now)
    .execute(state.store.pool())
    .await
    .expect("insert balance");

    sqlx::query(
        "INSERT INTO transactions (id, to_account, amount, tx_type, description, created_at) \
         VALUES (?, ?, ?, 'mint', 'Starter token allocation on registration', ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&id)
    .bind(starter)
    .bind(now)
    .execute(state.store.pool())
    .await
    .expect("insert mint");

    id
}

pub async fn balance_of(state: &AppState, account_id: &str) -> Balance {
    sqlx::query_as::<_, Balance>("SELECT * FROM balances WHERE account_id = ?")
        .bind(account_id)
        .fetch_one(state.store.pool())
        .await
        .expect("balance row")
}

pub async fn reputation_of(state: &AppState, account_id: &str) -> f64 {
    sqlx::query_scalar("SELECT reputation FROM accounts WHERE id = ?")
        .bind(account_id)
        .fetch_one(state.store.pool())
        .await
        .expect("reputation")
}

pub async fn set_daily_spend_limit(state: &AppState, account_id: &str, limit: i64) {
    sqlx::query("UPDATE accounts SET daily_spend_limit = ? WHERE id = ?")
        .bind(limit)
        .bind(account_id)
        .execute(state.store.pool())
        .await
        .expect("set limit");
}

pub async fn frozen_until(state: &AppState, account_id: &str) -> Option<DateTime<Utc>> {
    sqlx::query_scalar("SELECT frozen_until FROM accounts WHERE id = ?")
        .bind(account_id)
        .fetch_one(state.store.pool())
        .await
        .expect("frozen_until")
}

/// Push an escrow's deadline into the past, as if the clock had advanced.
pub async fn backdate_expiry(state: &AppState, escrow_id: &str, minutes_ago: i64) {
    sqlx::query("UPDATE escrows SET expires_at = ? WHERE id = ?")
        .bind(Utc::now() - Duration::minutes(minutes_ago))
        .bind(escrow_id)
        .execute(state.store.pool())
        .await
        .expect("backdate expiry");
}

pub async fn escrow_status(state: &AppState, escrow_id: &str) -> String {
    sqlx::query_scalar("SELECT status FROM escrows WHERE id = ?")
        .bind(escrow_id)
        .fetch_one(state.store.pool())
        .await
        .expect("escrow status")
}

/// Conservation check: available + held across all balances must equal
/// mint + deposit minus fees collected to the treasury.
pub async fn assert_conservation(state: &AppState) {
    let pool = state.store.pool();
    let available: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(available), 0) FROM balances")
        .fetch_one(pool)
        .await
        .expect("sum available");
    let held: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(held_in_escrow), 0) FROM balances")
        .fetch_one(pool)
        .await
        .expect("sum held");
    let minted: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0) FROM transactions WHERE tx_type IN ('mint', 'deposit')",
    )
    .fetch_one(pool)
    .await
    .expect("sum mint+deposit");
    let fees: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0) FROM transactions WHERE tx_type = 'fee'",
    )
    .fetch_one(pool)
    .await
    .expect("sum fees");

    assert_eq!(
        available + held + fees,
        minted,
        "conservation violated: available={available} held={held} fees={fees} minted={minted}"
    );

    let held_escrows: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount + fee_amount), 0) FROM escrows \
         WHERE status IN ('held', 'disputed')",
    )
    .fetch_one(pool)
    .await
    .expect("sum open escrows");
    assert_eq!(
        held, held_escrows,
        "held-in-escrow does not match open escrow totals"
    );
}
