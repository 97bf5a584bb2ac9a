//! A2A settlement exchange: accounts, balances, and the escrow state machine
//! behind an HTTP surface.
//!
//! The ledger is the only component that touches money-carrying rows, always
//! inside a single transaction. The timeout observer, spending guard,
//! webhook dispatcher, and compliance bridge sit around it.

pub mod attest;
pub mod auth;
pub mod config;
pub mod error;
pub mod ledger;
pub mod middleware;
pub mod models;
pub mod observer;
pub mod ratelimit;
pub mod routes;
pub mod schemas;
pub mod seed;
pub mod spending_guard;
pub mod store;
pub mod webhooks;

pub use config::Settings;
pub use error::{ExchangeError, Result};
pub use ledger::Ledger;
pub use store::Store;

use std::sync::Arc;

/// Shared state handed to every route and middleware layer.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Store,
    pub ledger: Ledger,
    pub webhooks: webhooks::WebhookDispatcher,
    pub guard: spending_guard::SpendingLimitGuard,
    pub limiter: Arc<ratelimit::RateLimiter>,
    pub compliance: attest::ComplianceBridge,
}

impl AppState {
    pub fn new(settings: Settings, store: Store, compliance: attest::ComplianceBridge) -> Self {
        let settings = Arc::new(settings);
        let webhooks = webhooks::WebhookDispatcher::new(store.clone(), &settings);
        let guard = spending_guard::SpendingLimitGuard::new(
            store.clone(),
            &settings,
            webhooks.clone(),
        );
        let ledger = Ledger::new(store.clone(), settings.clone(), guard.clone());
        let limiter = Arc::new(ratelimit::RateLimiter::new(&settings));
        Self {
            settings,
            store,
            ledger,
            webhooks,
            guard,
            limiter,
            compliance,
        }
    }
}
