//! Process-local per-IP rate limiting.
//!
//! Counters live in memory and do not survive restarts or horizontal
//! scaling; a production deployment fronts this with a shared counter
//! service.

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;

use crate::config::Settings;
use crate::error::ExchangeError;
use crate::AppState;
use crate::Result;

const CLEANUP_INTERVAL_SECS: u64 = 300;
const DAY_SECS: u64 = 86_400;

pub struct RateLimiter {
    register_per_hour: u32,
    register_per_day: u32,
    authenticated_per_minute: u32,
    public_per_minute: u32,
    inner: Mutex<Inner>,
}

struct Inner {
    register_hits: HashMap<String, Vec<Instant>>,
    request_hits: HashMap<String, Vec<Instant>>,
    last_cleanup: Instant,
}

fn count_since(timestamps: &[Instant], window_secs: u64, now: Instant) -> usize {
    timestamps
        .iter()
        .filter(|t| now.duration_since(**t).as_secs() < window_secs)
        .count()
}

impl RateLimiter {
    pub fn new(settings: &Settings) -> Self {
        Self {
            register_per_hour: settings.register_rate_limit_per_hour,
            register_per_day: settings.register_rate_limit_per_day,
            authenticated_per_minute: settings.rate_limit_authenticated_per_minute,
            public_per_minute: settings.rate_limit_public_per_minute,
            inner: Mutex::new(Inner {
                register_hits: HashMap::new(),
                request_hits: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Per-IP registration limits (hourly and daily).
    pub fn check_register(&self, ip: &str) -> Result<()> {
        if self.register_per_hour == 0 && self.register_per_day == 0 {
            return Ok(());
        }
        let now = Instant::now();
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ExchangeError::Internal("rate limiter poisoned".to_string()))?;
        inner.cleanup(now);

        let hits = inner.register_hits.entry(ip.to_string()).or_default();
        if self.register_per_hour > 0
            && count_since(hits, 3600, now) >= self.register_per_hour as usize
        {
            return Err(ExchangeError::RateLimited {
                message: "Registration rate limit exceeded. Try again later.".to_string(),
                retry_after: 3600,
            });
        }
        if self.register_per_day > 0
            && count_since(hits, DAY_SECS, now) >= self.register_per_day as usize
        {
            return Err(ExchangeError::RateLimited {
                message: "Daily registration limit exceeded. Try again tomorrow.".to_string(),
                retry_after: DAY_SECS,
            });
        }
        hits.push(now);
        Ok(())
    }

    /// Per-IP per-minute request cap; authenticated callers get the higher
    /// limit.
    pub fn check_request(&self, ip: &str, authenticated: bool) -> Result<()> {
        let limit = if authenticated {
            self.authenticated_per_minute
        } else {
            self.public_per_minute
        };
        if limit == 0 {
            return Ok(());
        }
        let now = Instant::now();
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ExchangeError::Internal("rate limiter poisoned".to_string()))?;
        inner.cleanup(now);

        let hits = inner.request_hits.entry(ip.to_string()).or_default();
        if count_since(hits, 60, now) >= limit as usize {
            return Err(ExchangeError::RateLimited {
                message: "Rate limit exceeded. Try again later.".to_string(),
                retry_after: 60,
            });
        }
        hits.push(now);
        Ok(())
    }
}

impl Inner {
    fn cleanup(&mut self, now: Instant) {
        if now.duration_since(self.last_cleanup).as_secs() < CLEANUP_INTERVAL_SECS {
            return;
        }
        self.last_cleanup = now;
        let stale = |hits: &Vec<Instant>| {
            hits.last()
                .map_or(true, |t| now.duration_since(*t).as_secs() > DAY_SECS)
        };
        self.register_hits.retain(|_, hits| !stale(hits));
        self.request_hits.retain(|_, hits| !stale(hits));
    }
}

pub fn client_ip(req: &Request) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Global per-minute limiter; the health probe is exempt.
pub async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if req.uri().path() == "/health" {
        return next.run(req).await;
    }
    let ip = client_ip(&req);
    let authenticated = req.headers().contains_key("authorization");
    if let Err(e) = state.limiter.check_request(&ip, authenticated) {
        return e.into_response();
    }
    next.run(req).await
}
