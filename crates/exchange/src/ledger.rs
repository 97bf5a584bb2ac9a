//! The settlement ledger and escrow state machine.
//!
//! Sole owner of account, balance, escrow, and transaction mutations. Every
//! operation runs in a single database transaction: re-read state, validate
//! preconditions, mutate, append matching transaction rows, commit. Any
//! failed precondition rolls the whole transaction back.
//!
//! Balance rows for a two-party operation are read in ascending account-id
//! order so concurrent settlements never deadlock on each other.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{Sqlite, Transaction as DbTx};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{is_transient, is_unique_violation, ExchangeError};
use crate::models::{
    Account, AccountStatus, Balance, Deliverable, Escrow, EscrowStatus, Transaction, TxType,
};
use crate::spending_guard::SpendingLimitGuard;
use crate::store::Store;
use crate::Result;

/// Parameters for one escrow creation.
#[derive(Debug, Clone, Default)]
pub struct EscrowSpec {
    pub provider_id: String,
    pub amount: i64,
    pub task_id: Option<String>,
    pub task_type: Option<String>,
    pub ttl_minutes: Option<i64>,
    pub group_id: Option<String>,
    pub depends_on: Option<Vec<String>>,
    pub deliverables: Option<Vec<Deliverable>>,
}

/// Escrows a synchronous mini-sweep expired (and cascade-refunded) before
/// the operation itself ran. Surfaced so the caller can emit
/// `escrow.expired` / `escrow.refunded` events and attestations for them
/// after the shared transaction commits.
#[derive(Debug, Default)]
pub struct SweptEscrows {
    pub expired: Vec<Escrow>,
    pub cascaded: Vec<Escrow>,
}

/// A settled escrow plus whatever the mini-sweep expired first.
#[derive(Debug)]
pub struct EscrowOutcome {
    pub escrow: Escrow,
    pub swept: SweptEscrows,
}

/// Outcome of a batch creation: the group and its escrows, plus the
/// mini-sweep results.
#[derive(Debug)]
pub struct BatchOutcome {
    pub group_id: String,
    pub escrows: Vec<Escrow>,
    pub swept: SweptEscrows,
}

/// Outcome of a refund: the refunded escrow, every dependent escrow that
/// was cascade-refunded with it, and the mini-sweep results.
#[derive(Debug)]
pub struct RefundOutcome {
    pub escrow: Escrow,
    pub cascaded: Vec<Escrow>,
    pub swept: SweptEscrows,
}

#[derive(Debug)]
pub struct DepositOutcome {
    pub deposit_id: String,
    pub new_balance: i64,
}

/// Filters for the escrow listing projection.
#[derive(Debug, Clone, Default)]
pub struct EscrowFilter {
    pub task_id: Option<String>,
    pub group_id: Option<String>,
    pub status: Option<EscrowStatus>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Clone)]
pub struct Ledger {
    store: Store,
    settings: Arc<Settings>,
    guard: SpendingLimitGuard,
}

impl Ledger {
    pub fn new(store: Store, settings: Arc<Settings>, guard: SpendingLimitGuard) -> Self {
        Self {
            store,
            settings,
            guard,
        }
    }

    fn pool(&self) -> &sqlx::SqlitePool {
        self.store.pool()
    }

    /// fee = max(ceil(amount * fee% / 100), min_fee), in exact decimal.
    pub fn fee_amount(&self, amount: i64) -> i64 {
        fee_amount(&self.settings, amount)
    }

    // -----------------------------------------------------------------------
    // Deposits
    // -----------------------------------------------------------------------

    pub async fn deposit(
        &self,
        account_id: &str,
        amount: i64,
        reference: Option<&str>,
    ) -> Result<DepositOutcome> {
        if amount <= 0 {
            return Err(ExchangeError::Validation(
                "Deposit amount must be positive".to_string(),
            ));
        }

        let mut tx = self.pool().begin().await?;
        let now = Utc::now();

        let bal = fetch_balance(&mut tx, account_id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound("Account not found".to_string()))?;
        let new_available = bal.available + amount;

        sqlx::query("UPDATE balances SET available = ?, updated_at = ? WHERE account_id = ?")
            .bind(new_available)
            .bind(now)
            .bind(account_id)
            .execute(&mut *tx)
            .await?;

        record_tx(
            &mut tx,
            None,
            None,
            Some(account_id),
            amount,
            TxType::Deposit,
            &format!("Deposit: {}", reference.unwrap_or("direct")),
            now,
        )
        .await?;

        tx.commit().await?;

        Ok(DepositOutcome {
            deposit_id: Uuid::new_v4().to_string(),
            new_balance: new_available,
        })
    }

    // -----------------------------------------------------------------------
    // Escrow creation
    // -----------------------------------------------------------------------

    pub async fn create_escrow(
        &self,
        requester_id: &str,
        spec: EscrowSpec,
    ) -> Result<EscrowOutcome> {
        self.validate_spec(requester_id, &spec)?;

        let fee = self.fee_amount(spec.amount);
        let total_hold = spec.amount + fee;

        // the guard runs before the money transaction opens, so its freeze
        // write lives in its own transaction and survives our rollback
        self.guard.check(requester_id, total_hold).await?;

        self.with_retry(|| self.create_escrow_tx(requester_id, &spec, fee))
            .await
    }

    async fn create_escrow_tx(
        &self,
        requester_id: &str,
        spec: &EscrowSpec,
        fee: i64,
    ) -> Result<EscrowOutcome> {
        let now = Utc::now();
        let total_hold = spec.amount + fee;
        let ttl = spec.ttl_minutes.unwrap_or(self.settings.default_ttl_minutes);

        let mut tx = self.pool().begin().await?;

        let swept = self.expire_for_account(&mut tx, requester_id, now).await?;

        let bal = fetch_balance(&mut tx, requester_id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound("Requester account not found".to_string()))?;
        if bal.available < total_hold {
            return Err(ExchangeError::InsufficientFunds(format!(
                "Insufficient balance. Need {} ({} + {} fee), have {}",
                total_hold, spec.amount, fee, bal.available
            )));
        }

        let provider = fetch_account(&mut tx, &spec.provider_id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound("Provider account not found".to_string()))?;
        if provider.status != AccountStatus::Active && provider.status != AccountStatus::Operator {
            return Err(ExchangeError::InactiveProvider(
                "Provider account is not active".to_string(),
            ));
        }

        if let Some(deps) = &spec.depends_on {
            self.check_dependency_ownership(&mut tx, requester_id, deps)
                .await?;
        }

        sqlx::query(
            "UPDATE balances SET available = ?, held_in_escrow = ?, updated_at = ? \
             WHERE account_id = ?",
        )
        .bind(bal.available - total_hold)
        .bind(bal.held_in_escrow + total_hold)
        .bind(now)
        .bind(requester_id)
        .execute(&mut *tx)
        .await?;

        let escrow = Escrow {
            id: Uuid::new_v4().to_string(),
            requester_id: requester_id.to_string(),
            provider_id: spec.provider_id.clone(),
            amount: spec.amount,
            fee_amount: fee,
            task_id: spec.task_id.clone(),
            task_type: spec.task_type.clone(),
            group_id: spec.group_id.clone(),
            depends_on: spec.depends_on.clone(),
            deliverables: spec.deliverables.clone(),
            status: EscrowStatus::Held,
            dispute_reason: None,
            resolution_strategy: None,
            expires_at: now + Duration::minutes(ttl),
            dispute_expires_at: None,
            warning_sent_at: None,
            created_at: now,
            resolved_at: None,
        };

        if let Err(e) = insert_escrow(&mut tx, &escrow).await {
            if is_unique_violation(&e) {
                drop(tx); // roll back before probing for the conflicting row
                return Err(self
                    .task_conflict(requester_id, &spec.provider_id, spec.task_id.as_deref())
                    .await);
            }
            return Err(e.into());
        }

        record_tx(
            &mut tx,
            Some(&escrow.id),
            Some(requester_id),
            None,
            total_hold,
            TxType::EscrowHold,
            &format!(
                "Escrow for task: {}",
                spec.task_type
                    .as_deref()
                    .or(spec.task_id.as_deref())
                    .unwrap_or("unspecified")
            ),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(EscrowOutcome { escrow, swept })
    }

    /// Create a group of escrows atomically. Items may reference earlier
    /// batch items in `depends_on` as `"$<index>"`.
    pub async fn create_batch(
        &self,
        requester_id: &str,
        group_id: Option<String>,
        items: &[EscrowSpec],
    ) -> Result<BatchOutcome> {
        if items.is_empty() {
            return Err(ExchangeError::Validation(
                "Batch must contain at least one escrow".to_string(),
            ));
        }

        let mut total_needed = 0i64;
        for item in items {
            self.validate_spec(requester_id, item)?;
            total_needed += item.amount + self.fee_amount(item.amount);
        }

        self.guard.check(requester_id, total_needed).await?;

        let group_id = group_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.with_retry(|| self.create_batch_tx(requester_id, &group_id, items, total_needed))
            .await
            .map(|(escrows, swept)| BatchOutcome {
                group_id: group_id.clone(),
                escrows,
                swept,
            })
    }

    async fn create_batch_tx(
        &self,
        requester_id: &str,
        group_id: &str,
        items: &[EscrowSpec],
        total_needed: i64,
    ) -> Result<(Vec<Escrow>, SweptEscrows)> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let swept = self.expire_for_account(&mut tx, requester_id, now).await?;

        let bal = fetch_balance(&mut tx, requester_id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound("Requester account not found".to_string()))?;
        if bal.available < total_needed {
            return Err(ExchangeError::InsufficientFunds(format!(
                "Insufficient balance for batch. Need {}, have {}",
                total_needed, bal.available
            )));
        }

        let mut available = bal.available;
        let mut held = bal.held_in_escrow;
        let mut created: Vec<Escrow> = Vec::with_capacity(items.len());

        for (idx, item) in items.iter().enumerate() {
            let fee = self.fee_amount(item.amount);
            let total_hold = item.amount + fee;
            let ttl = item.ttl_minutes.unwrap_or(self.settings.default_ttl_minutes);

            let provider = fetch_account(&mut tx, &item.provider_id)
                .await?
                .ok_or_else(|| {
                    ExchangeError::NotFound(format!(
                        "Provider account not found: {}",
                        item.provider_id
                    ))
                })?;
            if provider.status != AccountStatus::Active
                && provider.status != AccountStatus::Operator
            {
                return Err(ExchangeError::InactiveProvider(format!(
                    "Provider account is not active: {}",
                    item.provider_id
                )));
            }

            let resolved_deps = match &item.depends_on {
                None => None,
                Some(refs) => {
                    let mut out = Vec::with_capacity(refs.len());
                    let mut literal = Vec::new();
                    for dep_ref in refs {
                        if let Some(idx_str) = dep_ref.strip_prefix('$') {
                            let dep_idx: usize = idx_str.parse().map_err(|_| {
                                ExchangeError::Validation(format!(
                                    "Invalid batch reference: {dep_ref}"
                                ))
                            })?;
                            if dep_idx >= idx {
                                return Err(ExchangeError::Validation(format!(
                                    "depends_on '${dep_idx}' must reference an earlier batch item"
                                )));
                            }
                            out.push(created[dep_idx].id.clone());
                        } else {
                            literal.push(dep_ref.clone());
                            out.push(dep_ref.clone());
                        }
                    }
                    if !literal.is_empty() {
                        self.check_dependency_ownership(&mut tx, requester_id, &literal)
                            .await?;
                    }
                    Some(out)
                }
            };

            available -= total_hold;
            held += total_hold;

            let escrow = Escrow {
                id: Uuid::new_v4().to_string(),
                requester_id: requester_id.to_string(),
                provider_id: item.provider_id.clone(),
                amount: item.amount,
                fee_amount: fee,
                task_id: item.task_id.clone(),
                task_type: item.task_type.clone(),
                group_id: Some(group_id.to_string()),
                depends_on: resolved_deps,
                deliverables: item.deliverables.clone(),
                status: EscrowStatus::Held,
                dispute_reason: None,
                resolution_strategy: None,
                expires_at: now + Duration::minutes(ttl),
                dispute_expires_at: None,
                warning_sent_at: None,
                created_at: now,
                resolved_at: None,
            };

            if let Err(e) = insert_escrow(&mut tx, &escrow).await {
                if is_unique_violation(&e) {
                    drop(tx);
                    return Err(self
                        .task_conflict(requester_id, &item.provider_id, item.task_id.as_deref())
                        .await);
                }
                return Err(e.into());
            }

            record_tx(
                &mut tx,
                Some(&escrow.id),
                Some(requester_id),
                None,
                total_hold,
                TxType::EscrowHold,
                &format!(
                    "Batch escrow for task: {}",
                    item.task_type
                        .as_deref()
                        .or(item.task_id.as_deref())
                        .unwrap_or("unspecified")
                ),
                now,
            )
            .await?;

            created.push(escrow);
        }

        sqlx::query(
            "UPDATE balances SET available = ?, held_in_escrow = ?, updated_at = ? \
             WHERE account_id = ?",
        )
        .bind(available)
        .bind(held)
        .bind(now)
        .bind(requester_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((created, swept))
    }

    // -----------------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------------

    pub async fn release(&self, escrow_id: &str, caller_id: &str) -> Result<EscrowOutcome> {
        self.with_retry(|| self.release_tx(escrow_id, caller_id))
            .await
    }

    async fn release_tx(&self, escrow_id: &str, caller_id: &str) -> Result<EscrowOutcome> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let swept = self.expire_for_account(&mut tx, caller_id, now).await?;

        let escrow = fetch_escrow(&mut tx, escrow_id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound("Escrow not found".to_string()))?;
        if escrow.requester_id != caller_id {
            return Err(ExchangeError::Forbidden(
                "Only the requester can release an escrow".to_string(),
            ));
        }
        if escrow.status != EscrowStatus::Held {
            return Err(ExchangeError::Validation(format!(
                "Escrow is already {}",
                escrow.status.as_str()
            )));
        }

        if let Some(deps) = &escrow.depends_on {
            let unresolved = unresolved_dependencies(&mut tx, deps).await?;
            if !unresolved.is_empty() {
                return Err(ExchangeError::DependencyUnresolved(format!(
                    "Cannot release: upstream escrows not yet released: {unresolved:?}"
                )));
            }
        }

        let escrow = settle_release(&mut tx, escrow, now, "Task completed - payment released")
            .await?;
        bump_reputation(&mut tx, &escrow.provider_id, true, now).await?;

        tx.commit().await?;
        Ok(EscrowOutcome { escrow, swept })
    }

    // -----------------------------------------------------------------------
    // Refund
    // -----------------------------------------------------------------------

    pub async fn refund(
        &self,
        escrow_id: &str,
        caller_id: &str,
        reason: Option<&str>,
    ) -> Result<RefundOutcome> {
        self.with_retry(|| self.refund_tx(escrow_id, caller_id, reason))
            .await
    }

    async fn refund_tx(
        &self,
        escrow_id: &str,
        caller_id: &str,
        reason: Option<&str>,
    ) -> Result<RefundOutcome> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let swept = self.expire_for_account(&mut tx, caller_id, now).await?;

        let escrow = fetch_escrow(&mut tx, escrow_id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound("Escrow not found".to_string()))?;
        if escrow.requester_id != caller_id {
            return Err(ExchangeError::Forbidden(
                "Only the requester can refund an escrow".to_string(),
            ));
        }
        if escrow.status != EscrowStatus::Held {
            return Err(ExchangeError::Validation(format!(
                "Escrow is already {}",
                escrow.status.as_str()
            )));
        }

        let escrow = settle_refund(
            &mut tx,
            escrow,
            now,
            EscrowStatus::Refunded,
            reason.unwrap_or("Task failed or cancelled"),
        )
        .await?;
        bump_reputation(&mut tx, &escrow.provider_id, false, now).await?;

        let cascaded = cascade_refund_dependents(&mut tx, &escrow.id, now).await?;

        tx.commit().await?;
        Ok(RefundOutcome {
            escrow,
            cascaded,
            swept,
        })
    }

    // -----------------------------------------------------------------------
    // Dispute / resolve
    // -----------------------------------------------------------------------

    pub async fn dispute(&self, escrow_id: &str, caller_id: &str, reason: &str) -> Result<Escrow> {
        self.with_retry(|| self.dispute_tx(escrow_id, caller_id, reason))
            .await
    }

    async fn dispute_tx(&self, escrow_id: &str, caller_id: &str, reason: &str) -> Result<Escrow> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let mut escrow = fetch_escrow(&mut tx, escrow_id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound("Escrow not found".to_string()))?;
        if caller_id != escrow.requester_id && caller_id != escrow.provider_id {
            return Err(ExchangeError::Forbidden(
                "Only the requester or provider can dispute an escrow".to_string(),
            ));
        }
        if escrow.status != EscrowStatus::Held {
            return Err(ExchangeError::Validation(format!(
                "Escrow cannot be disputed (status: {})",
                escrow.status.as_str()
            )));
        }

        let dispute_expires = now + Duration::minutes(self.settings.dispute_ttl_minutes);
        sqlx::query(
            "UPDATE escrows SET status = 'disputed', dispute_reason = ?, dispute_expires_at = ? \
             WHERE id = ?",
        )
        .bind(reason)
        .bind(dispute_expires)
        .bind(escrow_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        escrow.status = EscrowStatus::Disputed;
        escrow.dispute_reason = Some(reason.to_string());
        escrow.dispute_expires_at = Some(dispute_expires);
        Ok(escrow)
    }

    /// Operator-only resolution of a disputed escrow.
    pub async fn resolve(
        &self,
        escrow_id: &str,
        caller: &Account,
        resolution: Resolution,
        strategy: Option<&str>,
    ) -> Result<Escrow> {
        if caller.status != AccountStatus::Operator {
            return Err(ExchangeError::Forbidden(
                "Only the exchange operator can resolve disputes".to_string(),
            ));
        }
        self.with_retry(|| self.resolve_tx(escrow_id, resolution, strategy))
            .await
    }

    async fn resolve_tx(
        &self,
        escrow_id: &str,
        resolution: Resolution,
        strategy: Option<&str>,
    ) -> Result<Escrow> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let escrow = fetch_escrow(&mut tx, escrow_id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound("Escrow not found".to_string()))?;
        if escrow.status != EscrowStatus::Disputed {
            return Err(ExchangeError::Validation(format!(
                "Escrow is not disputed (status: {})",
                escrow.status.as_str()
            )));
        }

        sqlx::query("UPDATE escrows SET resolution_strategy = ? WHERE id = ?")
            .bind(strategy)
            .bind(escrow_id)
            .execute(&mut *tx)
            .await?;

        let mut escrow = match resolution {
            Resolution::Release => {
                let released = settle_release(
                    &mut tx,
                    escrow,
                    now,
                    "Dispute resolved - payment released",
                )
                .await?;
                bump_reputation(&mut tx, &released.provider_id, true, now).await?;
                released
            }
            Resolution::Refund => {
                let refunded = settle_refund(
                    &mut tx,
                    escrow,
                    now,
                    EscrowStatus::Refunded,
                    "Dispute resolved - tokens refunded",
                )
                .await?;
                bump_reputation(&mut tx, &refunded.provider_id, false, now).await?;
                refunded
            }
        };
        escrow.resolution_strategy = strategy.map(str::to_string);

        tx.commit().await?;
        Ok(escrow)
    }

    // -----------------------------------------------------------------------
    // Read projections
    // -----------------------------------------------------------------------

    pub async fn balance_of(&self, account_id: &str) -> Result<(Account, Balance)> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(account_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| ExchangeError::NotFound("Account not found".to_string()))?;
        let balance = sqlx::query_as::<_, Balance>("SELECT * FROM balances WHERE account_id = ?")
            .bind(account_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| ExchangeError::NotFound("Account not found".to_string()))?;
        Ok((account, balance))
    }

    pub async fn transactions_for(
        &self,
        account_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, Transaction>(
            "SELECT * FROM transactions WHERE from_account = ? OR to_account = ? \
             ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(account_id)
        .bind(account_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn get_escrow(&self, escrow_id: &str) -> Result<Escrow> {
        sqlx::query_as::<_, Escrow>("SELECT * FROM escrows WHERE id = ?")
            .bind(escrow_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| ExchangeError::NotFound("Escrow not found".to_string()))
    }

    pub async fn list_escrows(
        &self,
        account_id: &str,
        filter: &EscrowFilter,
    ) -> Result<(Vec<Escrow>, i64)> {
        let mut where_sql = String::from("(requester_id = ? OR provider_id = ?)");
        if filter.task_id.is_some() {
            where_sql.push_str(" AND task_id = ?");
        }
        if filter.group_id.is_some() {
            where_sql.push_str(" AND group_id = ?");
        }
        if filter.status.is_some() {
            where_sql.push_str(" AND status = ?");
        }

        let count_sql = format!("SELECT COUNT(*) FROM escrows WHERE {where_sql}");
        let list_sql = format!(
            "SELECT * FROM escrows WHERE {where_sql} \
             ORDER BY created_at DESC LIMIT ? OFFSET ?"
        );

        let mut count_q = sqlx::query_scalar::<_, i64>(&count_sql)
            .bind(account_id)
            .bind(account_id);
        let mut list_q = sqlx::query_as::<_, Escrow>(&list_sql)
            .bind(account_id)
            .bind(account_id);
        if let Some(task_id) = &filter.task_id {
            count_q = count_q.bind(task_id);
            list_q = list_q.bind(task_id);
        }
        if let Some(group_id) = &filter.group_id {
            count_q = count_q.bind(group_id);
            list_q = list_q.bind(group_id);
        }
        if let Some(status) = &filter.status {
            count_q = count_q.bind(status.as_str());
            list_q = list_q.bind(status.as_str());
        }

        let total = count_q.fetch_one(self.pool()).await?;
        let rows = list_q
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(self.pool())
            .await?;
        Ok((rows, total))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn validate_spec(&self, requester_id: &str, spec: &EscrowSpec) -> Result<()> {
        if spec.amount < self.settings.min_escrow || spec.amount > self.settings.max_escrow {
            return Err(ExchangeError::Validation(format!(
                "Amount must be between {} and {}",
                self.settings.min_escrow, self.settings.max_escrow
            )));
        }
        if requester_id == spec.provider_id {
            return Err(ExchangeError::Validation(
                "Cannot escrow to yourself".to_string(),
            ));
        }
        Ok(())
    }

    async fn check_dependency_ownership(
        &self,
        tx: &mut DbTx<'_, Sqlite>,
        requester_id: &str,
        deps: &[String],
    ) -> Result<()> {
        let mut owned = 0usize;
        for dep in deps {
            let found: Option<String> =
                sqlx::query_scalar("SELECT id FROM escrows WHERE id = ? AND requester_id = ?")
                    .bind(dep)
                    .bind(requester_id)
                    .fetch_optional(&mut **tx)
                    .await?;
            if found.is_some() {
                owned += 1;
            }
        }
        if owned != deps.len() {
            return Err(ExchangeError::Validation(
                "One or more depends_on escrow IDs not found or not owned by requester".to_string(),
            ));
        }
        Ok(())
    }

    async fn task_conflict(
        &self,
        requester_id: &str,
        provider_id: &str,
        task_id: Option<&str>,
    ) -> ExchangeError {
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM escrows \
             WHERE requester_id = ? AND provider_id = ? AND task_id = ? AND status = 'held'",
        )
        .bind(requester_id)
        .bind(provider_id)
        .bind(task_id)
        .fetch_optional(self.pool())
        .await
        .ok()
        .flatten();
        ExchangeError::TaskConflict(format!(
            "An active escrow already exists for this task_id (escrow_id={})",
            existing.as_deref().unwrap_or("unknown")
        ))
    }

    /// Synchronous mini-sweep: expire the caller's own past-TTL escrows so a
    /// mutating operation never sees an escrow that should already be gone.
    /// The touched escrows leave the `held` set here, so the background sweep
    /// will never pick them up again; the caller must fire their events once
    /// the shared transaction commits.
    async fn expire_for_account(
        &self,
        tx: &mut DbTx<'_, Sqlite>,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SweptEscrows> {
        let stale = sqlx::query_as::<_, Escrow>(
            "SELECT * FROM escrows \
             WHERE status = 'held' AND expires_at < ? \
               AND (requester_id = ? OR provider_id = ?) \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(now)
        .bind(account_id)
        .bind(account_id)
        .fetch_all(&mut **tx)
        .await?;

        let mut swept = SweptEscrows::default();
        for escrow in stale {
            let id = escrow.id.clone();
            let expired = settle_refund(
                tx,
                escrow,
                now,
                EscrowStatus::Expired,
                "Auto-expired: TTL exceeded",
            )
            .await?;
            let mut cascaded = cascade_refund_dependents(tx, &id, now).await?;
            swept.expired.push(expired);
            swept.cascaded.append(&mut cascaded);
        }
        Ok(swept)
    }

    /// Retry an operation once when the storage layer reports lock
    /// contention; a second failure surfaces as `TransientConflict`.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match op().await {
            Err(e) if is_transient(&e) => {
                warn!("transient storage conflict, retrying once: {e}");
                op().await.map_err(|e| {
                    if is_transient(&e) {
                        ExchangeError::TransientConflict(e.to_string())
                    } else {
                        e
                    }
                })
            }
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Release,
    Refund,
}

impl Resolution {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "release" => Some(Self::Release),
            "refund" => Some(Self::Refund),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared settlement primitives
// ---------------------------------------------------------------------------

pub(crate) fn fee_amount(settings: &Settings, amount: i64) -> i64 {
    let fee = (Decimal::from(amount) * settings.fee_percent / Decimal::from(100)).ceil();
    fee.to_i64().unwrap_or(i64::MAX).max(settings.min_fee)
}

pub(crate) fn effective_fee_percent(amount: i64, fee: i64) -> f64 {
    if amount <= 0 {
        return 0.0;
    }
    (Decimal::from(fee) / Decimal::from(amount) * Decimal::from(100))
        .round_dp(4)
        .to_f64()
        .unwrap_or(0.0)
}

async fn fetch_account(
    tx: &mut DbTx<'_, Sqlite>,
    account_id: &str,
) -> std::result::Result<Option<Account>, sqlx::Error> {
    sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
        .bind(account_id)
        .fetch_optional(&mut **tx)
        .await
}

async fn fetch_balance(
    tx: &mut DbTx<'_, Sqlite>,
    account_id: &str,
) -> std::result::Result<Option<Balance>, sqlx::Error> {
    sqlx::query_as::<_, Balance>("SELECT * FROM balances WHERE account_id = ?")
        .bind(account_id)
        .fetch_optional(&mut **tx)
        .await
}

async fn fetch_escrow(
    tx: &mut DbTx<'_, Sqlite>,
    escrow_id: &str,
) -> std::result::Result<Option<Escrow>, sqlx::Error> {
    sqlx::query_as::<_, Escrow>("SELECT * FROM escrows WHERE id = ?")
        .bind(escrow_id)
        .fetch_optional(&mut **tx)
        .await
}

async fn insert_escrow(
    tx: &mut DbTx<'_, Sqlite>,
    escrow: &Escrow,
) -> std::result::Result<(), sqlx::Error> {
    let depends_on = escrow
        .depends_on
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    let deliverables = escrow
        .deliverables
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(
        "INSERT INTO escrows (id, requester_id, provider_id, amount, fee_amount, task_id, \
         task_type, group_id, depends_on, deliverables, status, expires_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&escrow.id)
    .bind(&escrow.requester_id)
    .bind(&escrow.provider_id)
    .bind(escrow.amount)
    .bind(escrow.fee_amount)
    .bind(&escrow.task_id)
    .bind(&escrow.task_type)
    .bind(&escrow.group_id)
    .bind(depends_on)
    .bind(deliverables)
    .bind(escrow.status.as_str())
    .bind(escrow.expires_at)
    .bind(escrow.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn record_tx(
    tx: &mut DbTx<'_, Sqlite>,
    escrow_id: Option<&str>,
    from_account: Option<&str>,
    to_account: Option<&str>,
    amount: i64,
    tx_type: TxType,
    description: &str,
    now: DateTime<Utc>,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO transactions (id, escrow_id, from_account, to_account, amount, tx_type, \
         description, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(escrow_id)
    .bind(from_account)
    .bind(to_account)
    .bind(amount)
    .bind(tx_type.as_str())
    .bind(description)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Reputation update on settlement: r <- clamp(0.9*r + 0.1*v, 0, 1).
async fn bump_reputation(
    tx: &mut DbTx<'_, Sqlite>,
    account_id: &str,
    success: bool,
    now: DateTime<Utc>,
) -> std::result::Result<(), sqlx::Error> {
    let current: Option<f64> = sqlx::query_scalar("SELECT reputation FROM accounts WHERE id = ?")
        .bind(account_id)
        .fetch_optional(&mut **tx)
        .await?;
    let Some(current) = current else {
        return Ok(());
    };
    let v = if success { 1.0 } else { 0.0 };
    let updated = (0.9 * current + 0.1 * v).clamp(0.0, 1.0);
    sqlx::query("UPDATE accounts SET reputation = ?, updated_at = ? WHERE id = ?")
        .bind(updated)
        .bind(now)
        .bind(account_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Pay out a held or disputed escrow: provider gains the principal, the fee
/// goes to the treasury, the requester's hold is consumed.
async fn settle_release(
    tx: &mut DbTx<'_, Sqlite>,
    mut escrow: Escrow,
    now: DateTime<Utc>,
    description: &str,
) -> Result<Escrow> {
    let total_held = escrow.total_held();

    // ascending account-id order for the two balance rows
    let ids = order_pair(&escrow.requester_id, &escrow.provider_id);
    let mut balances = Vec::with_capacity(2);
    for id in ids {
        let bal = fetch_balance(tx, id)
            .await?
            .ok_or_else(|| ExchangeError::NotFound("Balance not found".to_string()))?;
        balances.push(bal);
    }
    let (requester_bal, provider_bal) = split_pair(balances, &escrow.requester_id)?;

    sqlx::query(
        "UPDATE balances SET held_in_escrow = ?, total_spent = ?, updated_at = ? \
         WHERE account_id = ?",
    )
    .bind(requester_bal.held_in_escrow - total_held)
    .bind(requester_bal.total_spent + total_held)
    .bind(now)
    .bind(&escrow.requester_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        "UPDATE balances SET available = ?, total_earned = ?, updated_at = ? \
         WHERE account_id = ?",
    )
    .bind(provider_bal.available + escrow.amount)
    .bind(provider_bal.total_earned + escrow.amount)
    .bind(now)
    .bind(&escrow.provider_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query("UPDATE escrows SET status = 'released', resolved_at = ? WHERE id = ?")
        .bind(now)
        .bind(&escrow.id)
        .execute(&mut **tx)
        .await?;

    record_tx(
        tx,
        Some(&escrow.id),
        Some(&escrow.requester_id),
        Some(&escrow.provider_id),
        escrow.amount,
        TxType::EscrowRelease,
        description,
        now,
    )
    .await?;
    if escrow.fee_amount > 0 {
        record_tx(
            tx,
            Some(&escrow.id),
            Some(&escrow.requester_id),
            None,
            escrow.fee_amount,
            TxType::Fee,
            "Platform transaction fee",
            now,
        )
        .await?;
    }

    escrow.status = EscrowStatus::Released;
    escrow.resolved_at = Some(now);
    Ok(escrow)
}

/// Return a held or disputed escrow's total to the requester. `new_status`
/// distinguishes an explicit refund from an observer expiry.
pub(crate) async fn settle_refund(
    tx: &mut DbTx<'_, Sqlite>,
    mut escrow: Escrow,
    now: DateTime<Utc>,
    new_status: EscrowStatus,
    description: &str,
) -> Result<Escrow> {
    let total_held = escrow.total_held();

    let bal = fetch_balance(tx, &escrow.requester_id)
        .await?
        .ok_or_else(|| ExchangeError::NotFound("Requester balance not found".to_string()))?;

    sqlx::query(
        "UPDATE balances SET available = ?, held_in_escrow = ?, updated_at = ? \
         WHERE account_id = ?",
    )
    .bind(bal.available + total_held)
    .bind(bal.held_in_escrow - total_held)
    .bind(now)
    .bind(&escrow.requester_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query("UPDATE escrows SET status = ?, resolved_at = ? WHERE id = ?")
        .bind(new_status.as_str())
        .bind(now)
        .bind(&escrow.id)
        .execute(&mut **tx)
        .await?;

    record_tx(
        tx,
        Some(&escrow.id),
        None,
        Some(&escrow.requester_id),
        total_held,
        TxType::EscrowRefund,
        description,
        now,
    )
    .await?;

    escrow.status = new_status;
    escrow.resolved_at = Some(now);
    Ok(escrow)
}

/// Depth-first cascade: refund every held escrow whose `depends_on` contains
/// an escrow that just left the `held` set. Dependencies always belong to
/// the same requester, so the traversal cannot leave the caller's accounts.
/// A DAG by construction; the visited set is a defensive guard only.
pub(crate) async fn cascade_refund_dependents(
    tx: &mut DbTx<'_, Sqlite>,
    upstream_escrow_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Escrow>> {
    let mut refunded = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut stack = vec![upstream_escrow_id.to_string()];

    while let Some(upstream) = stack.pop() {
        if !visited.insert(upstream.clone()) {
            continue;
        }
        let held = sqlx::query_as::<_, Escrow>(
            "SELECT * FROM escrows WHERE status = 'held' AND depends_on IS NOT NULL \
             ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&mut **tx)
        .await?;

        for dep in held {
            let depends = dep.depends_on.as_deref().unwrap_or(&[]);
            if !depends.iter().any(|d| d == &upstream) {
                continue;
            }
            let dep_id = dep.id.clone();
            let refunded_dep = settle_refund(
                tx,
                dep,
                now,
                EscrowStatus::Refunded,
                &format!("Auto-refunded: upstream escrow {upstream} was refunded"),
            )
            .await?;
            refunded.push(refunded_dep);
            stack.push(dep_id);
        }
    }

    Ok(refunded)
}

async fn unresolved_dependencies(
    tx: &mut DbTx<'_, Sqlite>,
    deps: &[String],
) -> std::result::Result<Vec<String>, sqlx::Error> {
    let mut unresolved = Vec::new();
    for dep in deps {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM escrows WHERE id = ?")
            .bind(dep)
            .fetch_optional(&mut **tx)
            .await?;
        if status.as_deref() != Some("released") {
            unresolved.push(dep.clone());
        }
    }
    Ok(unresolved)
}

fn order_pair<'a>(a: &'a str, b: &'a str) -> [&'a str; 2] {
    if a <= b {
        [a, b]
    } else {
        [b, a]
    }
}

fn split_pair(balances: Vec<Balance>, requester_id: &str) -> Result<(Balance, Balance)> {
    let mut requester = None;
    let mut provider = None;
    for bal in balances {
        if bal.account_id == requester_id {
            requester = Some(bal);
        } else {
            provider = Some(bal);
        }
    }
    match (requester, provider) {
        (Some(r), Some(p)) => Ok((r, p)),
        _ => Err(ExchangeError::NotFound("Balance not found".to_string())),
    }
}

/// Starter allocations and seed grants are the only mint paths.
pub(crate) async fn record_mint(
    tx: &mut DbTx<'_, Sqlite>,
    account_id: &str,
    amount: i64,
    description: &str,
    now: DateTime<Utc>,
) -> std::result::Result<(), sqlx::Error> {
    record_tx(
        tx,
        None,
        None,
        Some(account_id),
        amount,
        TxType::Mint,
        description,
        now,
    )
    .await
}
