//! Domain rows: accounts, balances, escrows, transactions, webhook configs,
//! idempotency records.
//!
//! List-valued columns (skills, events, depends_on, deliverables) are stored
//! as JSON text; the `FromRow` impls decode them so the rest of the crate
//! only ever sees typed values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

fn decode_json<T: serde::de::DeserializeOwned>(
    column: &'static str,
    raw: Option<String>,
) -> std::result::Result<Option<T>, sqlx::Error> {
    match raw {
        None => Ok(None),
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: column.to_string(),
                source: Box::new(e),
            }),
    }
}

fn bad_column(column: &'static str, value: &str) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: format!("unknown value: {value}").into(),
    }
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Suspended,
    Operator,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Operator => "operator",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "suspended" => Some(Self::Suspended),
            "operator" => Some(Self::Operator),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub bot_name: String,
    pub developer_id: String,
    pub developer_name: String,
    pub contact_email: String,
    pub api_key_hash: String,
    pub previous_api_key_hash: Option<String>,
    pub key_rotated_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub skills: Vec<String>,
    pub status: AccountStatus,
    pub reputation: f64,
    pub daily_spend_limit: Option<i64>,
    pub frozen_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for Account {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let status_raw: String = row.try_get("status")?;
        let status =
            AccountStatus::parse(&status_raw).ok_or_else(|| bad_column("status", &status_raw))?;
        let skills = decode_json("skills", row.try_get("skills")?)?.unwrap_or_default();
        Ok(Self {
            id: row.try_get("id")?,
            bot_name: row.try_get("bot_name")?,
            developer_id: row.try_get("developer_id")?,
            developer_name: row.try_get("developer_name")?,
            contact_email: row.try_get("contact_email")?,
            api_key_hash: row.try_get("api_key_hash")?,
            previous_api_key_hash: row.try_get("previous_api_key_hash")?,
            key_rotated_at: row.try_get("key_rotated_at")?,
            description: row.try_get("description")?,
            skills,
            status,
            reputation: row.try_get("reputation")?,
            daily_spend_limit: row.try_get("daily_spend_limit")?,
            frozen_until: row.try_get("frozen_until")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Balances
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct Balance {
    pub account_id: String,
    pub available: i64,
    pub held_in_escrow: i64,
    pub total_earned: i64,
    pub total_spent: i64,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Escrows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscrowStatus {
    Held,
    Released,
    Refunded,
    Expired,
    Disputed,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::Released => "released",
            Self::Refunded => "refunded",
            Self::Expired => "expired",
            Self::Disputed => "disputed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "held" => Some(Self::Held),
            "released" => Some(Self::Released),
            "refunded" => Some(Self::Refunded),
            "expired" => Some(Self::Expired),
            "disputed" => Some(Self::Disputed),
            _ => None,
        }
    }

    /// Only `held` and `disputed` escrows may still transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Refunded | Self::Expired)
    }
}

/// A deliverable the provider owes under an escrow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deliverable {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_criteria: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Escrow {
    pub id: String,
    pub requester_id: String,
    pub provider_id: String,
    pub amount: i64,
    pub fee_amount: i64,
    pub task_id: Option<String>,
    pub task_type: Option<String>,
    pub group_id: Option<String>,
    pub depends_on: Option<Vec<String>>,
    pub deliverables: Option<Vec<Deliverable>>,
    pub status: EscrowStatus,
    pub dispute_reason: Option<String>,
    pub resolution_strategy: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub dispute_expires_at: Option<DateTime<Utc>>,
    pub warning_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Escrow {
    /// Principal plus fee: what the requester has locked up.
    pub fn total_held(&self) -> i64 {
        self.amount + self.fee_amount
    }
}

impl FromRow<'_, SqliteRow> for Escrow {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let status_raw: String = row.try_get("status")?;
        let status =
            EscrowStatus::parse(&status_raw).ok_or_else(|| bad_column("status", &status_raw))?;
        Ok(Self {
            id: row.try_get("id")?,
            requester_id: row.try_get("requester_id")?,
            provider_id: row.try_get("provider_id")?,
            amount: row.try_get("amount")?,
            fee_amount: row.try_get("fee_amount")?,
            task_id: row.try_get("task_id")?,
            task_type: row.try_get("task_type")?,
            group_id: row.try_get("group_id")?,
            depends_on: decode_json("depends_on", row.try_get("depends_on")?)?,
            deliverables: decode_json("deliverables", row.try_get("deliverables")?)?,
            status,
            dispute_reason: row.try_get("dispute_reason")?,
            resolution_strategy: row.try_get("resolution_strategy")?,
            expires_at: row.try_get("expires_at")?,
            dispute_expires_at: row.try_get("dispute_expires_at")?,
            warning_sent_at: row.try_get("warning_sent_at")?,
            created_at: row.try_get("created_at")?,
            resolved_at: row.try_get("resolved_at")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Transactions (append-only audit log)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Mint,
    Deposit,
    EscrowHold,
    EscrowRelease,
    EscrowRefund,
    Fee,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mint => "mint",
            Self::Deposit => "deposit",
            Self::EscrowHold => "escrow_hold",
            Self::EscrowRelease => "escrow_release",
            Self::EscrowRefund => "escrow_refund",
            Self::Fee => "fee",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mint" => Some(Self::Mint),
            "deposit" => Some(Self::Deposit),
            "escrow_hold" => Some(Self::EscrowHold),
            "escrow_release" => Some(Self::EscrowRelease),
            "escrow_refund" => Some(Self::EscrowRefund),
            "fee" => Some(Self::Fee),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: String,
    pub escrow_id: Option<String>,
    pub from_account: Option<String>,
    pub to_account: Option<String>,
    pub amount: i64,
    pub tx_type: TxType,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for Transaction {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let type_raw: String = row.try_get("tx_type")?;
        let tx_type = TxType::parse(&type_raw).ok_or_else(|| bad_column("tx_type", &type_raw))?;
        Ok(Self {
            id: row.try_get("id")?,
            escrow_id: row.try_get("escrow_id")?,
            from_account: row.try_get("from_account")?,
            to_account: row.try_get("to_account")?,
            amount: row.try_get("amount")?,
            tx_type,
            description: row.try_get("description")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Webhook configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub account_id: String,
    pub url: String,
    pub secret: String,
    /// Empty list means "all events".
    pub events: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for WebhookConfig {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let events = decode_json("events", row.try_get("events")?)?.unwrap_or_default();
        Ok(Self {
            account_id: row.try_get("account_id")?,
            url: row.try_get("url")?,
            secret: row.try_get("secret")?,
            events,
            active: row.try_get("active")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Idempotency records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct IdempotencyRecord {
    pub key: String,
    pub request_hash: String,
    pub response_body: String,
    pub status_code: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
