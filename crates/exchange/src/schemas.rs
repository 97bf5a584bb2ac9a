//! Wire DTOs for the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::effective_fee_percent;
use crate::models::{Account, Deliverable, Escrow, Transaction};

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub bot_name: String,
    pub developer_id: String,
    pub developer_name: String,
    pub contact_email: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub skills: Option<Vec<String>>,
    #[serde(default)]
    pub invite_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterAccountInfo {
    pub id: String,
    pub bot_name: String,
    pub developer_id: String,
    pub developer_name: String,
    pub contact_email: String,
    pub description: Option<String>,
    pub skills: Vec<String>,
    pub status: String,
    pub reputation: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterResponse {
    pub message: String,
    pub account: RegisterAccountInfo,
    pub api_key: String,
    pub starter_tokens: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountResponse {
    pub id: String,
    pub bot_name: String,
    pub developer_id: String,
    pub developer_name: String,
    pub contact_email: String,
    pub description: Option<String>,
    pub skills: Vec<String>,
    pub status: String,
    pub reputation: f64,
    pub created_at: DateTime<Utc>,
}

impl From<&Account> for AccountResponse {
    fn from(acct: &Account) -> Self {
        Self {
            id: acct.id.clone(),
            bot_name: acct.bot_name.clone(),
            developer_id: acct.developer_id.clone(),
            developer_name: acct.developer_name.clone(),
            contact_email: acct.contact_email.clone(),
            description: acct.description.clone(),
            skills: acct.skills.clone(),
            status: acct.status.as_str().to_string(),
            reputation: acct.reputation,
            created_at: acct.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectoryResponse {
    pub bots: Vec<AccountResponse>,
    pub count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateSkillsRequest {
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateSkillsResponse {
    pub account_id: String,
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RotateKeyResponse {
    pub api_key: String,
    pub grace_period_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuspendRequest {
    pub account_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuspendResponse {
    pub account_id: String,
    pub status: String,
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Deposit
// ---------------------------------------------------------------------------

fn default_currency() -> String {
    "ATE".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepositRequest {
    pub amount: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DepositResponse {
    pub deposit_id: String,
    pub account_id: String,
    pub amount: i64,
    pub currency: String,
    pub new_balance: i64,
    pub reference: Option<String>,
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct EscrowRequest {
    pub provider_id: String,
    pub amount: i64,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub ttl_minutes: Option<i64>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub depends_on: Option<Vec<String>>,
    #[serde(default)]
    pub deliverables: Option<Vec<Deliverable>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EscrowResponse {
    pub escrow_id: String,
    pub requester_id: String,
    pub provider_id: String,
    pub amount: i64,
    pub fee_amount: i64,
    pub effective_fee_percent: f64,
    pub total_held: i64,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub group_id: Option<String>,
}

impl From<&Escrow> for EscrowResponse {
    fn from(escrow: &Escrow) -> Self {
        Self {
            escrow_id: escrow.id.clone(),
            requester_id: escrow.requester_id.clone(),
            provider_id: escrow.provider_id.clone(),
            amount: escrow.amount,
            fee_amount: escrow.fee_amount,
            effective_fee_percent: effective_fee_percent(escrow.amount, escrow.fee_amount),
            total_held: escrow.total_held(),
            status: escrow.status.as_str().to_string(),
            expires_at: escrow.expires_at,
            group_id: escrow.group_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseRequest {
    pub escrow_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseResponse {
    pub escrow_id: String,
    pub status: String,
    pub amount_paid: i64,
    pub fee_collected: i64,
    pub provider_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundRequest {
    pub escrow_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundResponse {
    pub escrow_id: String,
    pub status: String,
    pub amount_returned: i64,
    pub requester_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisputeRequest {
    pub escrow_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DisputeResponse {
    pub escrow_id: String,
    pub status: String,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolveRequest {
    pub escrow_id: String,
    pub resolution: String,
    #[serde(default)]
    pub strategy: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveReleaseResponse {
    pub escrow_id: String,
    pub resolution: String,
    pub status: String,
    pub amount_paid: i64,
    pub fee_collected: i64,
    pub provider_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveRefundResponse {
    pub escrow_id: String,
    pub resolution: String,
    pub status: String,
    pub amount_returned: i64,
    pub requester_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceResponse {
    pub account_id: String,
    pub bot_name: String,
    pub reputation: f64,
    pub account_status: String,
    pub available: i64,
    pub held_in_escrow: i64,
    pub total_earned: i64,
    pub total_spent: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionItem {
    pub id: String,
    pub escrow_id: Option<String>,
    pub from_account: Option<String>,
    pub to_account: Option<String>,
    pub amount: i64,
    #[serde(rename = "type")]
    pub tx_type: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Transaction> for TransactionItem {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: tx.id.clone(),
            escrow_id: tx.escrow_id.clone(),
            from_account: tx.from_account.clone(),
            to_account: tx.to_account.clone(),
            amount: tx.amount,
            tx_type: tx.tx_type.as_str().to_string(),
            description: tx.description.clone(),
            created_at: tx.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionsResponse {
    pub transactions: Vec<TransactionItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EscrowDetailResponse {
    pub id: String,
    pub requester_id: String,
    pub provider_id: String,
    pub amount: i64,
    pub fee_amount: i64,
    pub effective_fee_percent: f64,
    pub status: String,
    pub dispute_reason: Option<String>,
    pub resolution_strategy: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub task_id: Option<String>,
    pub task_type: Option<String>,
    pub group_id: Option<String>,
    pub depends_on: Option<Vec<String>>,
    pub deliverables: Option<Vec<Deliverable>>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl From<&Escrow> for EscrowDetailResponse {
    fn from(escrow: &Escrow) -> Self {
        Self {
            id: escrow.id.clone(),
            requester_id: escrow.requester_id.clone(),
            provider_id: escrow.provider_id.clone(),
            amount: escrow.amount,
            fee_amount: escrow.fee_amount,
            effective_fee_percent: effective_fee_percent(escrow.amount, escrow.fee_amount),
            status: escrow.status.as_str().to_string(),
            dispute_reason: escrow.dispute_reason.clone(),
            resolution_strategy: escrow.resolution_strategy.clone(),
            expires_at: escrow.expires_at,
            task_id: escrow.task_id.clone(),
            task_type: escrow.task_type.clone(),
            group_id: escrow.group_id.clone(),
            depends_on: escrow.depends_on.clone(),
            deliverables: escrow.deliverables.clone(),
            created_at: escrow.created_at,
            resolved_at: escrow.resolved_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EscrowListResponse {
    pub escrows: Vec<EscrowDetailResponse>,
    pub total: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchEscrowItem {
    pub provider_id: String,
    pub amount: i64,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub ttl_minutes: Option<i64>,
    #[serde(default)]
    pub depends_on: Option<Vec<String>>,
    #[serde(default)]
    pub deliverables: Option<Vec<Deliverable>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchEscrowRequest {
    #[serde(default)]
    pub group_id: Option<String>,
    pub escrows: Vec<BatchEscrowItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchEscrowResponse {
    pub group_id: String,
    pub escrows: Vec<EscrowResponse>,
}

// ---------------------------------------------------------------------------
// Webhooks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSetRequest {
    pub url: String,
    #[serde(default)]
    pub events: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookResponse {
    pub webhook_url: String,
    /// Returned only on first configuration; rotations keep the old secret.
    pub secret: Option<String>,
    pub events: Vec<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookDeleteResponse {
    pub status: String,
}

// ---------------------------------------------------------------------------
// Stats / health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatsNetworkInfo {
    pub total_bots: i64,
    pub active_bots: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsTokenSupply {
    pub circulating: i64,
    pub in_escrow: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsActivity {
    pub transaction_count: i64,
    pub token_volume: i64,
    pub velocity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsTreasury {
    pub fees_collected: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub network: StatsNetworkInfo,
    pub token_supply: StatsTokenSupply,
    pub activity_24h: StatsActivity,
    pub treasury: StatsTreasury,
    pub active_escrows: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            service: "a2a-settlement-exchange".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
