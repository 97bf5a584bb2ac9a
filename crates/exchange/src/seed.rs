//! Demo-account seeding for local development.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::auth;
use crate::config::Settings;
use crate::ledger::record_mint;
use crate::store::Store;
use crate::Result;

struct DemoBot {
    bot_name: &'static str,
    developer_id: &'static str,
    description: &'static str,
    skills: &'static [&'static str],
}

const DEMO_BOTS: &[DemoBot] = &[
    DemoBot {
        bot_name: "SentimentBot",
        developer_id: "dev-demo-1",
        description: "Analyzes text sentiment.",
        skills: &["sentiment-analysis", "text-classification"],
    },
    DemoBot {
        bot_name: "SummarizerBot",
        developer_id: "dev-demo-2",
        description: "Summarizes long-form content.",
        skills: &["summarization", "text-extraction"],
    },
];

/// Create the demo accounts with starter allocations, printing each api key
/// once.
pub async fn seed(store: &Store, settings: &Settings) -> Result<()> {
    info!("seeding demo accounts");

    for bot in DEMO_BOTS {
        let api_key = auth::generate_api_key();
        let api_key_hash = auth::hash_api_key(&api_key, settings.api_key_cost)?;
        let account_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let skills: Vec<&str> = bot.skills.to_vec();

        let mut tx = store.pool().begin().await?;

        sqlx::query(
            "INSERT INTO accounts (id, bot_name, developer_id, developer_name, contact_email, \
             api_key_hash, description, skills, status, reputation, created_at, updated_at) \
             VALUES (?, ?, ?, '', '', ?, ?, ?, 'active', 0.5, ?, ?)",
        )
        .bind(&account_id)
        .bind(bot.bot_name)
        .bind(bot.developer_id)
        .bind(&api_key_hash)
        .bind(bot.description)
        .bind(serde_json::to_string(&skills).unwrap_or_else(|_| "[]".to_string()))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO balances (account_id, available, held_in_escrow, total_earned, \
             total_spent, updated_at) VALUES (?, ?, 0, 0, 0, ?)",
        )
        .bind(&account_id)
        .bind(settings.starter_tokens)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        record_mint(
            &mut tx,
            &account_id,
            settings.starter_tokens,
            "Starter token allocation (seed)",
            now,
        )
        .await?;

        tx.commit().await?;

        println!("- {}  id={}  api_key={}", bot.bot_name, account_id, api_key);
    }

    Ok(())
}
