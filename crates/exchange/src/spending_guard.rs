//! Spending-limit circuit breaker.
//!
//! Enforces a rolling-window spend ceiling and an hourly velocity ceiling
//! per account, freezing the account on breach. The freeze is written in an
//! independent transaction before the caller's money transaction opens, so
//! the sanction survives the caller's rollback.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::warn;

use crate::config::Settings;
use crate::error::ExchangeError;
use crate::store::Store;
use crate::webhooks::WebhookDispatcher;
use crate::Result;

#[derive(Clone)]
pub struct SpendingLimitGuard {
    store: Store,
    webhooks: WebhookDispatcher,
    spending_window_hours: i64,
    hourly_velocity_limit: i64,
    spending_freeze_minutes: i64,
}

impl SpendingLimitGuard {
    pub fn new(store: Store, settings: &Settings, webhooks: WebhookDispatcher) -> Self {
        Self {
            store,
            webhooks,
            spending_window_hours: settings.spending_window_hours,
            hourly_velocity_limit: settings.hourly_velocity_limit,
            spending_freeze_minutes: settings.spending_freeze_minutes,
        }
    }

    pub async fn check(&self, account_id: &str, new_hold: i64) -> Result<()> {
        self.check_at(account_id, new_hold, Utc::now()).await
    }

    /// Validate spending limits at the given instant.
    pub async fn check_at(
        &self,
        account_id: &str,
        new_hold: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let row: Option<(Option<DateTime<Utc>>, Option<i64>)> = sqlx::query_as(
            "SELECT frozen_until, daily_spend_limit FROM accounts WHERE id = ?",
        )
        .bind(account_id)
        .fetch_optional(self.store.pool())
        .await?;
        let Some((frozen_until, daily_spend_limit)) = row else {
            return Ok(());
        };

        if let Some(frozen_until) = frozen_until {
            if frozen_until > now {
                return Err(ExchangeError::AccountFrozen(format!(
                    "Account is temporarily frozen until {}. Spending limit was exceeded.",
                    frozen_until.to_rfc3339()
                )));
            }
            // lapsed freeze: clear the marker
            sqlx::query("UPDATE accounts SET frozen_until = NULL, updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(account_id)
                .execute(self.store.pool())
                .await?;
        }

        if let Some(limit) = daily_spend_limit.filter(|l| *l > 0) {
            let window_start = now - Duration::hours(self.spending_window_hours);
            let spent = self.spent_since(account_id, window_start).await?;
            if spent + new_hold > limit {
                let frozen_until = now + Duration::minutes(self.spending_freeze_minutes);
                self.freeze(
                    account_id,
                    frozen_until,
                    &format!(
                        "Rolling {}h spend limit breached (limit={}, spent={}, requested={})",
                        self.spending_window_hours, limit, spent, new_hold
                    ),
                )
                .await?;
                return Err(ExchangeError::SpendLimitBreached(format!(
                    "Daily spend limit exceeded. Limit: {}, spent in last {}h: {}, requested: {}. \
                     Account frozen for {} minutes.",
                    limit, self.spending_window_hours, spent, new_hold, self.spending_freeze_minutes
                )));
            }
        }

        if self.hourly_velocity_limit > 0 {
            let hour_start = now - Duration::hours(1);
            let spent_hour = self.spent_since(account_id, hour_start).await?;
            if spent_hour + new_hold > self.hourly_velocity_limit {
                let frozen_until = now + Duration::minutes(self.spending_freeze_minutes);
                self.freeze(
                    account_id,
                    frozen_until,
                    &format!(
                        "Hourly velocity limit breached (limit={}, spent={}, requested={})",
                        self.hourly_velocity_limit, spent_hour, new_hold
                    ),
                )
                .await?;
                return Err(ExchangeError::SpendLimitBreached(format!(
                    "Hourly spending velocity exceeded. Limit: {}, spent in last hour: {}, \
                     requested: {}. Account frozen for {} minutes.",
                    self.hourly_velocity_limit,
                    spent_hour,
                    new_hold,
                    self.spending_freeze_minutes
                )));
            }
        }

        Ok(())
    }

    async fn spent_since(&self, account_id: &str, since: DateTime<Utc>) -> Result<i64> {
        let spent: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM transactions \
             WHERE from_account = ? AND tx_type = 'escrow_hold' AND created_at >= ?",
        )
        .bind(account_id)
        .bind(since)
        .fetch_one(self.store.pool())
        .await?;
        Ok(spent)
    }

    /// Persist the freeze in its own transaction so it survives whatever the
    /// caller does next.
    async fn freeze(
        &self,
        account_id: &str,
        frozen_until: DateTime<Utc>,
        reason: &str,
    ) -> Result<()> {
        let mut tx = self.store.pool().begin().await?;
        sqlx::query("UPDATE accounts SET frozen_until = ?, updated_at = ? WHERE id = ?")
            .bind(frozen_until)
            .bind(Utc::now())
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        warn!(
            "account {} frozen until {}: {}",
            account_id,
            frozen_until.to_rfc3339(),
            reason
        );
        self.webhooks.fire_account_event(
            account_id,
            "account.spending_limit_breached",
            json!({
                "account_id": account_id,
                "frozen_until": frozen_until.to_rfc3339(),
                "reason": reason,
            }),
        );
        Ok(())
    }
}
