//! Settings loaded from `A2A_EXCHANGE_*` environment variables.

use rust_decimal::Decimal;
use std::str::FromStr;

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env_str(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_str(name) {
        Some(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        None => default,
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,

    // fee + escrow bounds
    pub fee_percent: Decimal,
    pub min_fee: i64,
    pub starter_tokens: i64,
    pub min_escrow: i64,
    pub max_escrow: i64,

    // lifecycle timers
    pub default_ttl_minutes: i64,
    pub dispute_ttl_minutes: i64,
    pub expiry_warning_minutes: i64,
    pub expiry_interval_seconds: u64,

    // authentication
    pub api_key_cost: u32,
    pub key_rotation_grace_minutes: i64,
    pub require_signatures: bool,
    pub signature_max_age_seconds: i64,
    pub invite_code: Option<String>,

    // rate limiting
    pub register_rate_limit_per_hour: u32,
    pub register_rate_limit_per_day: u32,
    pub rate_limit_authenticated_per_minute: u32,
    pub rate_limit_public_per_minute: u32,

    // spending guard
    pub spending_window_hours: i64,
    pub hourly_velocity_limit: i64,
    pub spending_freeze_minutes: i64,

    // webhooks
    pub webhook_timeout_seconds: u64,
    pub webhook_max_retries: u32,

    // compliance
    pub compliance_db: Option<String>,
    pub tsa_url: Option<String>,

    pub host: String,
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://a2a_exchange.db".to_string(),
            fee_percent: Decimal::from(3),
            min_fee: 1,
            starter_tokens: 100,
            min_escrow: 1,
            max_escrow: 10_000,
            default_ttl_minutes: 30,
            dispute_ttl_minutes: 60,
            expiry_warning_minutes: 5,
            expiry_interval_seconds: 60,
            api_key_cost: 10,
            key_rotation_grace_minutes: 5,
            require_signatures: false,
            signature_max_age_seconds: 300,
            invite_code: None,
            register_rate_limit_per_hour: 10,
            register_rate_limit_per_day: 30,
            rate_limit_authenticated_per_minute: 60,
            rate_limit_public_per_minute: 120,
            spending_window_hours: 24,
            hourly_velocity_limit: 0,
            spending_freeze_minutes: 30,
            webhook_timeout_seconds: 10,
            webhook_max_retries: 3,
            compliance_db: None,
            tsa_url: None,
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            database_url: env_str("DATABASE_URL")
                .or_else(|| env_str("A2A_EXCHANGE_DATABASE_URL"))
                .unwrap_or(d.database_url),
            fee_percent: env_str("A2A_EXCHANGE_FEE_PERCENT")
                .and_then(|v| Decimal::from_str(&v).ok())
                .unwrap_or(d.fee_percent),
            min_fee: env_parse("A2A_EXCHANGE_MIN_FEE", d.min_fee),
            starter_tokens: env_parse("A2A_EXCHANGE_STARTER_TOKENS", d.starter_tokens),
            min_escrow: env_parse("A2A_EXCHANGE_MIN_ESCROW", d.min_escrow),
            max_escrow: env_parse("A2A_EXCHANGE_MAX_ESCROW", d.max_escrow),
            default_ttl_minutes: env_parse("A2A_EXCHANGE_DEFAULT_TTL_MINUTES", d.default_ttl_minutes),
            dispute_ttl_minutes: env_parse("A2A_EXCHANGE_DISPUTE_TTL_MINUTES", d.dispute_ttl_minutes),
            expiry_warning_minutes: env_parse(
                "A2A_EXCHANGE_EXPIRY_WARNING_MINUTES",
                d.expiry_warning_minutes,
            ),
            expiry_interval_seconds: env_parse(
                "A2A_EXCHANGE_EXPIRY_INTERVAL_SECONDS",
                d.expiry_interval_seconds,
            ),
            api_key_cost: env_parse("A2A_EXCHANGE_API_KEY_COST", d.api_key_cost),
            key_rotation_grace_minutes: env_parse(
                "A2A_EXCHANGE_KEY_ROTATION_GRACE_MINUTES",
                d.key_rotation_grace_minutes,
            ),
            require_signatures: env_bool("A2A_EXCHANGE_REQUIRE_SIGNATURES", d.require_signatures),
            signature_max_age_seconds: env_parse(
                "A2A_EXCHANGE_SIGNATURE_MAX_AGE_SECONDS",
                d.signature_max_age_seconds,
            ),
            invite_code: env_str("A2A_EXCHANGE_INVITE_CODE"),
            register_rate_limit_per_hour: env_parse(
                "A2A_EXCHANGE_REGISTER_RATE_LIMIT_PER_HOUR",
                d.register_rate_limit_per_hour,
            ),
            register_rate_limit_per_day: env_parse(
                "A2A_EXCHANGE_REGISTER_RATE_LIMIT_PER_DAY",
                d.register_rate_limit_per_day,
            ),
            rate_limit_authenticated_per_minute: env_parse(
                "A2A_EXCHANGE_RATE_LIMIT",
                d.rate_limit_authenticated_per_minute,
            ),
            rate_limit_public_per_minute: env_parse(
                "A2A_EXCHANGE_RATE_LIMIT_PUBLIC",
                d.rate_limit_public_per_minute,
            ),
            spending_window_hours: env_parse(
                "A2A_EXCHANGE_SPENDING_WINDOW_HOURS",
                d.spending_window_hours,
            ),
            hourly_velocity_limit: env_parse(
                "A2A_EXCHANGE_HOURLY_VELOCITY_LIMIT",
                d.hourly_velocity_limit,
            ),
            spending_freeze_minutes: env_parse(
                "A2A_EXCHANGE_SPENDING_FREEZE_MINUTES",
                d.spending_freeze_minutes,
            ),
            webhook_timeout_seconds: env_parse(
                "A2A_EXCHANGE_WEBHOOK_TIMEOUT",
                d.webhook_timeout_seconds,
            ),
            webhook_max_retries: env_parse(
                "A2A_EXCHANGE_WEBHOOK_MAX_RETRIES",
                d.webhook_max_retries,
            ),
            compliance_db: env_str("A2A_EXCHANGE_COMPLIANCE_DB"),
            tsa_url: env_str("A2A_EXCHANGE_TSA_URL"),
            host: env_str("A2A_EXCHANGE_HOST").unwrap_or(d.host),
            port: env_parse("A2A_EXCHANGE_PORT", d.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.fee_percent, Decimal::from(3));
        assert!(s.min_escrow <= s.max_escrow);
        assert!(s.min_fee >= 0);
        assert!(s.invite_code.is_none());
    }
}
