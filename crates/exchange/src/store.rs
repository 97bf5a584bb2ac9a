//! SQLite-backed store: pool management and schema.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::Result;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id                    TEXT PRIMARY KEY,
    bot_name              TEXT NOT NULL UNIQUE,
    developer_id          TEXT NOT NULL,
    developer_name        TEXT NOT NULL DEFAULT '',
    contact_email         TEXT NOT NULL DEFAULT '',
    api_key_hash          TEXT NOT NULL,
    previous_api_key_hash TEXT,
    key_rotated_at        TEXT,
    description           TEXT,
    skills                TEXT NOT NULL DEFAULT '[]',
    status                TEXT NOT NULL DEFAULT 'active',
    reputation            REAL NOT NULL DEFAULT 0.5,
    daily_spend_limit     INTEGER,
    frozen_until          TEXT,
    created_at            TEXT NOT NULL,
    updated_at            TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_accounts_developer ON accounts(developer_id);
CREATE INDEX IF NOT EXISTS ix_accounts_status ON accounts(status);

CREATE TABLE IF NOT EXISTS balances (
    account_id      TEXT PRIMARY KEY REFERENCES accounts(id),
    available       INTEGER NOT NULL DEFAULT 0 CHECK (available >= 0),
    held_in_escrow  INTEGER NOT NULL DEFAULT 0 CHECK (held_in_escrow >= 0),
    total_earned    INTEGER NOT NULL DEFAULT 0,
    total_spent     INTEGER NOT NULL DEFAULT 0,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS escrows (
    id                  TEXT PRIMARY KEY,
    requester_id        TEXT NOT NULL REFERENCES accounts(id),
    provider_id         TEXT NOT NULL REFERENCES accounts(id),
    amount              INTEGER NOT NULL,
    fee_amount          INTEGER NOT NULL DEFAULT 0,
    task_id             TEXT,
    task_type           TEXT,
    group_id            TEXT,
    depends_on          TEXT,
    deliverables        TEXT,
    status              TEXT NOT NULL DEFAULT 'held',
    dispute_reason      TEXT,
    resolution_strategy TEXT,
    expires_at          TEXT NOT NULL,
    dispute_expires_at  TEXT,
    warning_sent_at     TEXT,
    created_at          TEXT NOT NULL,
    resolved_at         TEXT
);
CREATE INDEX IF NOT EXISTS ix_escrows_requester ON escrows(requester_id);
CREATE INDEX IF NOT EXISTS ix_escrows_provider ON escrows(provider_id);
CREATE INDEX IF NOT EXISTS ix_escrows_status ON escrows(status);
CREATE INDEX IF NOT EXISTS ix_escrows_expires ON escrows(expires_at);
CREATE INDEX IF NOT EXISTS ix_escrows_group ON escrows(group_id);
CREATE UNIQUE INDEX IF NOT EXISTS uq_active_task_escrow
    ON escrows(requester_id, provider_id, task_id)
    WHERE task_id IS NOT NULL AND status = 'held';

CREATE TABLE IF NOT EXISTS transactions (
    id           TEXT PRIMARY KEY,
    escrow_id    TEXT REFERENCES escrows(id),
    from_account TEXT REFERENCES accounts(id),
    to_account   TEXT REFERENCES accounts(id),
    amount       INTEGER NOT NULL,
    tx_type      TEXT NOT NULL,
    description  TEXT,
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_transactions_from ON transactions(from_account);
CREATE INDEX IF NOT EXISTS ix_transactions_to ON transactions(to_account);
CREATE INDEX IF NOT EXISTS ix_transactions_type ON transactions(tx_type);
CREATE INDEX IF NOT EXISTS ix_transactions_created ON transactions(created_at);

CREATE TABLE IF NOT EXISTS webhook_configs (
    account_id TEXT PRIMARY KEY REFERENCES accounts(id),
    url        TEXT NOT NULL,
    secret     TEXT NOT NULL,
    events     TEXT NOT NULL DEFAULT '[]',
    active     INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS idempotency_records (
    key           TEXT PRIMARY KEY,
    request_hash  TEXT NOT NULL,
    response_body TEXT NOT NULL,
    status_code   INTEGER NOT NULL,
    created_at    TEXT NOT NULL,
    expires_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_idempotency_expires ON idempotency_records(expires_at);
";

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open the database, creating it and the schema when missing.
    pub async fn open(database_url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(database_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        sqlx::raw_sql(SCHEMA_SQL).execute(&pool).await?;
        info!("opened store at {database_url}");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
