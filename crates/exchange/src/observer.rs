//! Background expiry observer.
//!
//! Advances escrows past their deadlines: held escrows past `expires_at`
//! expire (tokens returned, dependents cascade-refunded), disputed escrows
//! past `dispute_expires_at` expire the same way, and held escrows inside
//! the warning horizon get `warning_sent_at` stamped. Webhooks fire after
//! the sweep commits.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::attest::ComplianceBridge;
use crate::config::Settings;
use crate::ledger::{cascade_refund_dependents, settle_refund};
use crate::models::{Escrow, EscrowStatus};
use crate::store::Store;
use crate::webhooks::WebhookDispatcher;
use crate::Result;

/// What one sweep did, for logging and post-commit webhook fan-out.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub expired_held: Vec<Escrow>,
    pub expired_disputes: Vec<Escrow>,
    pub cascaded: Vec<Escrow>,
    pub warned: Vec<Escrow>,
}

#[derive(Clone)]
pub struct PaymentTimeoutObserver {
    store: Store,
    expiry_warning_minutes: i64,
}

impl PaymentTimeoutObserver {
    pub fn new(store: Store, settings: &Settings) -> Self {
        Self {
            store,
            expiry_warning_minutes: settings.expiry_warning_minutes,
        }
    }

    pub async fn sweep(&self) -> Result<SweepOutcome> {
        self.sweep_at(Utc::now()).await
    }

    /// Run all timeout checks in one transaction at the given instant.
    /// A failure on one escrow is logged and skipped; the rest commit.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepOutcome> {
        let mut outcome = SweepOutcome::default();
        let mut tx = self.store.pool().begin().await?;

        let stale_held = sqlx::query_as::<_, Escrow>(
            "SELECT * FROM escrows WHERE status = 'held' AND expires_at < ? \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        for escrow in stale_held {
            let id = escrow.id.clone();
            match settle_refund(
                &mut tx,
                escrow,
                now,
                EscrowStatus::Expired,
                "Auto-expired: TTL exceeded",
            )
            .await
            {
                Ok(expired) => {
                    outcome.expired_held.push(expired);
                    match cascade_refund_dependents(&mut tx, &id, now).await {
                        Ok(mut cascaded) => outcome.cascaded.append(&mut cascaded),
                        Err(e) => warn!("cascade after expiry of {id} failed: {e}"),
                    }
                }
                Err(e) => warn!("failed to expire escrow {id}: {e}"),
            }
        }

        let stale_disputes = sqlx::query_as::<_, Escrow>(
            "SELECT * FROM escrows WHERE status = 'disputed' \
               AND dispute_expires_at IS NOT NULL AND dispute_expires_at < ? \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        for escrow in stale_disputes {
            let id = escrow.id.clone();
            match settle_refund(
                &mut tx,
                escrow,
                now,
                EscrowStatus::Expired,
                "Auto-expired: dispute TTL exceeded",
            )
            .await
            {
                Ok(expired) => outcome.expired_disputes.push(expired),
                Err(e) => warn!("failed to expire disputed escrow {id}: {e}"),
            }
        }

        if self.expiry_warning_minutes > 0 {
            let horizon = now + Duration::minutes(self.expiry_warning_minutes);
            let approaching = sqlx::query_as::<_, Escrow>(
                "SELECT * FROM escrows WHERE status = 'held' \
                   AND expires_at > ? AND expires_at <= ? AND warning_sent_at IS NULL",
            )
            .bind(now)
            .bind(horizon)
            .fetch_all(&mut *tx)
            .await?;

            for mut escrow in approaching {
                sqlx::query("UPDATE escrows SET warning_sent_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(&escrow.id)
                    .execute(&mut *tx)
                    .await?;
                escrow.warning_sent_at = Some(now);
                outcome.warned.push(escrow);
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }
}

/// Periodic sweep loop; fires webhooks and attestations for whatever each
/// sweep produced.
pub async fn run_expiry_loop(
    observer: PaymentTimeoutObserver,
    webhooks: WebhookDispatcher,
    compliance: ComplianceBridge,
    settings: Arc<Settings>,
) {
    let interval = std::time::Duration::from_secs(settings.expiry_interval_seconds);
    info!("background expiry loop started (interval={}s)", settings.expiry_interval_seconds);

    loop {
        tokio::time::sleep(interval).await;
        match observer.sweep().await {
            Ok(outcome) => {
                let expired = outcome.expired_held.len() + outcome.expired_disputes.len();
                if expired > 0 || !outcome.warned.is_empty() {
                    info!(
                        "sweep expired {} escrow(s), cascaded {}, warned {}",
                        expired,
                        outcome.cascaded.len(),
                        outcome.warned.len()
                    );
                }
                for escrow in outcome
                    .expired_held
                    .iter()
                    .chain(outcome.expired_disputes.iter())
                {
                    webhooks.fire_escrow_event(escrow, "escrow.expired");
                    compliance.record_terminal(escrow, None);
                }
                for escrow in &outcome.cascaded {
                    webhooks.fire_escrow_event(escrow, "escrow.refunded");
                    compliance.record_terminal(escrow, None);
                }
                for escrow in &outcome.warned {
                    webhooks.fire_escrow_event(escrow, "escrow.expiring_soon");
                }
            }
            Err(e) => error!("background expiry sweep failed: {e}"),
        }
    }
}
