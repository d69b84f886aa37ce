use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

pub type IpLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-client token bucket for operator actions (one instance per route).
pub struct RateLimiter {
    // Last-seen timestamp lets cleanup drop idle clients without consuming tokens.
    limiters: DashMap<IpAddr, (Arc<IpLimiter>, std::time::Instant)>,
    quota: Quota,
    label: &'static str,
}

impl RateLimiter {
    /// `per_minute` requests per client per minute, all available as a burst.
    #[must_use]
    pub fn per_minute(label: &'static str, per_minute: u32) -> Self {
        // Zero would panic inside governor; fall back to 1.
        let per_minute = NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            limiters: DashMap::new(),
            quota: Quota::per_minute(per_minute),
            label,
        }
    }

    /// `true` if the client may proceed.
    #[must_use]
    pub fn check(&self, ip: IpAddr) -> bool {
        let mut entry = self
            .limiters
            .entry(ip)
            .or_insert_with(|| (Arc::new(GovernorRateLimiter::direct(self.quota)), std::time::Instant::now()));
        entry.1 = std::time::Instant::now();
        entry.0.check().is_ok()
    }

    /// Drops clients idle for more than 10 minutes.
    pub fn cleanup(&self) {
        let idle_threshold = std::time::Duration::from_secs(600);
        self.limiters
            .retain(|_, (_, last_seen)| last_seen.elapsed() < idle_threshold);
    }

    #[must_use]
    pub fn tracked_ips(&self) -> usize {
        self.limiters.len()
    }
}

/// Rejects with 429 and the standard error envelope when the route's limit is hit.
pub async fn rate_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    if !limiter.check(addr.ip()) {
        tracing::warn!(ip = %addr.ip(), route = limiter.label, "Rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "status": "error",
                "error": {
                    "type": "RateLimited",
                    "message": format!("Too many {} requests; try again in a minute", limiter.label),
                }
            })),
        )
            .into_response();
    }
    next.run(request).await
}
