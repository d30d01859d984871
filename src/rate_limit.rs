// Request throttling for the API surface. Each client gets a fixed
// admission window; once the configured ceiling is reached, further
// requests are rejected until the window rolls over. Window state is
// evicted for idle clients by a periodic purge (spawned in main).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::AppError;

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<IpAddr, Window>>>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            max_requests: config.max_requests.max(1),
            window: Duration::from_secs(config.window_secs.max(1)),
        }
    }

    /// Admit or reject one request for `client`.
    pub async fn admit(&self, client: IpAddr) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let entry = windows.entry(client).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count >= self.max_requests {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Evict window state for clients idle longer than `max_idle`. The
    /// map otherwise holds one entry per client ever seen.
    pub async fn purge_idle(&self, max_idle: Duration) {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, w| now.duration_since(w.started) < max_idle);
        let evicted = before - windows.len();
        if evicted > 0 {
            debug!(evicted, "Evicted idle rate-limit windows");
        }
    }

    pub async fn tracked_clients(&self) -> usize {
        self.windows.lock().await.len()
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(client) = client_addr(&req) else {
        return Ok(next.run(req).await);
    };

    if !limiter.admit(client).await {
        warn!(client = %client, "Request rejected by rate limiter");
        return Err(AppError::TooManyRequests(
            "Too many requests, slow down".to_string(),
        ));
    }

    Ok(next.run(req).await)
}

/// Peer address from ConnectInfo, or the first X-Forwarded-For hop when
/// running behind a proxy.
fn client_addr(req: &Request) -> Option<IpAddr> {
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return Some(addr.ip());
    }
    let forwarded = req.headers().get("x-forwarded-for")?.to_str().ok()?;
    forwarded.split(',').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            max_requests,
            window_secs,
            purge_idle_secs: 600,
        })
    }

    #[tokio::test]
    async fn test_ceiling_applies_within_window() {
        let rl = limiter(3, 60);
        let client: IpAddr = "198.51.100.1".parse().unwrap();

        for _ in 0..3 {
            assert!(rl.admit(client).await);
        }
        assert!(!rl.admit(client).await);
        assert!(!rl.admit(client).await);
    }

    #[tokio::test]
    async fn test_clients_are_throttled_independently() {
        let rl = limiter(1, 60);
        let first: IpAddr = "198.51.100.1".parse().unwrap();
        let second: IpAddr = "198.51.100.2".parse().unwrap();

        assert!(rl.admit(first).await);
        assert!(!rl.admit(first).await);
        assert!(rl.admit(second).await);
    }

    #[tokio::test]
    async fn test_purge_idle_evicts_window_state() {
        let rl = limiter(1, 60);
        let client: IpAddr = "198.51.100.3".parse().unwrap();

        assert!(rl.admit(client).await);
        assert!(!rl.admit(client).await);
        assert_eq!(rl.tracked_clients().await, 1);

        // Everything is "idle" against a zero threshold.
        rl.purge_idle(Duration::ZERO).await;
        assert_eq!(rl.tracked_clients().await, 0);

        // The client starts a fresh window after eviction.
        assert!(rl.admit(client).await);
    }

    #[tokio::test]
    async fn test_state_per_client_is_reclaimed() {
        let rl = limiter(10, 60);
        for i in 0..50u8 {
            let client = IpAddr::from([10, 0, 0, i]);
            assert!(rl.admit(client).await);
        }
        assert_eq!(rl.tracked_clients().await, 50);

        rl.purge_idle(Duration::ZERO).await;
        assert_eq!(rl.tracked_clients().await, 0);
    }

    #[tokio::test]
    async fn test_purge_idle_keeps_active_clients() {
        let rl = limiter(5, 60);
        let client: IpAddr = "198.51.100.4".parse().unwrap();

        assert!(rl.admit(client).await);
        rl.purge_idle(Duration::from_secs(600)).await;
        assert_eq!(rl.tracked_clients().await, 1);
    }
}
