//! Fixed-window admission control keyed by (client ip, route).
//!
//! Each key carries two counters, one per hour and one per minute. A request
//! is admitted only while both are under their ceilings; admitted requests bump
//! both, rejected ones bump neither. Counters expire on their own at the end of
//! their window, so bursts straddling a boundary can reach twice the nominal
//! limit.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, MatchedPath, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::{RateLimitConfig, RouteLimit};
use crate::error::ServiceError;
use crate::handlers::client_ip;

const KEY_PREFIX: &str = "rate_limit:";
pub const HOUR: Duration = Duration::from_secs(3600);
pub const MINUTE: Duration = Duration::from_secs(60);
/// Upper bound on one admission decision, backend round trips included.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Atomic counter storage with per-key expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current value, `0` when absent or expired.
    async fn get(&self, key: &str) -> Result<u64>;
    /// Increment by one. A counter that did not exist starts a new window and
    /// expires `window` later. Returns the new value.
    async fn incr(&self, key: &str, window: Duration) -> Result<u64>;
}

/// In-process counters. Only meaningful for a single server instance.
#[derive(Default)]
pub struct MemoryCounters {
    counters: Mutex<HashMap<String, (u64, Instant)>>,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop windows that have already ended.
    pub async fn purge_expired(&self) {
        let now = Instant::now();
        self.counters.lock().await.retain(|_, (_, deadline)| *deadline > now);
    }
}

#[async_trait]
impl CounterStore for MemoryCounters {
    async fn get(&self, key: &str) -> Result<u64> {
        let now = Instant::now();
        let counters = self.counters.lock().await;
        Ok(match counters.get(key) {
            Some((count, deadline)) if *deadline > now => *count,
            _ => 0,
        })
    }

    async fn incr(&self, key: &str, window: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        let entry = counters.entry(key.to_owned()).or_insert((0, now + window));
        if entry.1 <= now {
            *entry = (0, now + window);
        }
        entry.0 += 1;
        Ok(entry.0)
    }
}

/// Counters kept in Redis, shared by every server instance pointing at it.
#[derive(Clone)]
pub struct RedisCounters {
    conn: redis::aio::ConnectionManager,
}

impl RedisCounters {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("parse redis url")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("connect to redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CounterStore for RedisCounters {
    async fn get(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("redis GET")?;
        Ok(value.unwrap_or(0))
    }

    async fn incr(&self, key: &str, window: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        // SET NX attaches the expiry only when this increment opens the window.
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(key)
            .arg(0)
            .arg("EX")
            .arg(window.as_secs())
            .arg("NX")
            .ignore()
            .cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("redis INCR")?;
        Ok(count)
    }
}

/// Dual-window limiter over a [`CounterStore`].
#[derive(Clone)]
pub struct RateLimiter {
    backend: Arc<dyn CounterStore>,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn CounterStore>) -> Self {
        Self {
            backend,
            timeout: CHECK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Decide whether `(ip, route)` may proceed under `limits`. A backend that
    /// does not answer within the timeout is reported as an error.
    pub async fn allow(&self, ip: &str, route: &str, limits: RouteLimit) -> Result<bool> {
        tokio::time::timeout(self.timeout, self.check(ip, route, limits))
            .await
            .with_context(|| format!("rate limit backend did not answer within {:?}", self.timeout))?
    }

    async fn check(&self, ip: &str, route: &str, limits: RouteLimit) -> Result<bool> {
        let hour_key = format!("{KEY_PREFIX}{ip}:{route}:hour");
        let minute_key = format!("{KEY_PREFIX}{ip}:{route}:minute");

        let hour_count = self.backend.get(&hour_key).await?;
        if hour_count >= u64::from(limits.requests_per_hour) {
            return Ok(false);
        }
        let minute_count = self.backend.get(&minute_key).await?;
        if minute_count >= u64::from(limits.requests_per_minute) {
            return Ok(false);
        }

        self.backend.incr(&hour_key, HOUR).await?;
        self.backend.incr(&minute_key, MINUTE).await?;
        Ok(true)
    }
}

/// State for [`rate_limit`]: the limiter plus the per-route ceilings.
#[derive(Clone)]
pub struct RateLimitLayerState {
    pub limiter: RateLimiter,
    pub config: Arc<RateLimitConfig>,
}

/// Config key for a matched route template.
pub fn route_key(template: &str) -> Option<&'static str> {
    match template {
        "/api/secrets" => Some("create_secret"),
        "/api/secrets/{id}" => Some("view_secret"),
        "/api/secrets/name/{name}" => Some("view_secret_by_name"),
        _ => None,
    }
}

/// Axum middleware. Rejects with 429 over the limit; if the counting backend
/// fails the request is let through.
pub async fn rate_limit(
    State(state): State<RateLimitLayerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());
    let ip = client_ip(request.headers(), Some(peer));
    let limits = state.config.limits_for(route_key(&route));

    debug!(%route, %ip, hour = limits.requests_per_hour, minute = limits.requests_per_minute, "rate limit check");
    match state.limiter.allow(&ip, &route, limits).await {
        Ok(true) => next.run(request).await,
        Ok(false) => {
            warn!(%route, %ip, "rate limit exceeded");
            ServiceError::RateLimited.into_response()
        }
        Err(e) => {
            error!(error = %e, %route, "rate limit check failed; admitting request");
            next.run(request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryCounters::new()))
    }

    const LIMITS: RouteLimit = RouteLimit {
        requests_per_hour: 10,
        requests_per_minute: 5,
    };

    #[tokio::test(start_paused = true)]
    async fn sixth_request_in_a_minute_is_rejected() {
        let rl = limiter();
        for _ in 0..5 {
            assert!(rl.allow("1.2.3.4", "/api/secrets", LIMITS).await.unwrap());
        }
        assert!(!rl.allow("1.2.3.4", "/api/secrets", LIMITS).await.unwrap());

        // Another route and another ip are counted separately.
        assert!(rl.allow("1.2.3.4", "/api/secrets/{id}", LIMITS).await.unwrap());
        assert!(rl.allow("5.6.7.8", "/api/secrets", LIMITS).await.unwrap());

        tokio::time::advance(MINUTE + Duration::from_secs(1)).await;
        assert!(rl.allow("1.2.3.4", "/api/secrets", LIMITS).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn hour_window_caps_across_minutes() {
        let rl = limiter();
        for _ in 0..2 {
            for _ in 0..5 {
                assert!(rl.allow("ip", "r", LIMITS).await.unwrap());
            }
            tokio::time::advance(MINUTE + Duration::from_secs(1)).await;
        }
        // Ten admitted this hour.
        assert!(!rl.allow("ip", "r", LIMITS).await.unwrap());

        tokio::time::advance(HOUR).await;
        assert!(rl.allow("ip", "r", LIMITS).await.unwrap());
    }

    #[tokio::test]
    async fn rejected_requests_do_not_count() {
        let counters = Arc::new(MemoryCounters::new());
        let rl = RateLimiter::new(counters.clone());
        let limits = RouteLimit {
            requests_per_hour: 100,
            requests_per_minute: 1,
        };
        assert!(rl.allow("ip", "r", limits).await.unwrap());
        for _ in 0..3 {
            assert!(!rl.allow("ip", "r", limits).await.unwrap());
        }
        assert_eq!(counters.get("rate_limit:ip:r:minute").await.unwrap(), 1);
        assert_eq!(counters.get("rate_limit:ip:r:hour").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_counters_expire_and_purge() {
        let counters = MemoryCounters::new();
        assert_eq!(counters.incr("k", MINUTE).await.unwrap(), 1);
        assert_eq!(counters.incr("k", MINUTE).await.unwrap(), 2);

        tokio::time::advance(MINUTE).await;
        assert_eq!(counters.get("k").await.unwrap(), 0);
        counters.purge_expired().await;
        assert!(counters.counters.lock().await.is_empty());
        assert_eq!(counters.incr("k", MINUTE).await.unwrap(), 1);
    }

    struct Unreachable;

    #[async_trait]
    impl CounterStore for Unreachable {
        async fn get(&self, _key: &str) -> Result<u64> {
            anyhow::bail!("connection refused")
        }
        async fn incr(&self, _key: &str, _window: Duration) -> Result<u64> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn backend_errors_surface_to_caller() {
        let rl = RateLimiter::new(Arc::new(Unreachable));
        assert!(rl.allow("ip", "r", LIMITS).await.is_err());
    }

    struct Stalled;

    #[async_trait]
    impl CounterStore for Stalled {
        async fn get(&self, _key: &str) -> Result<u64> {
            std::future::pending().await
        }
        async fn incr(&self, _key: &str, _window: Duration) -> Result<u64> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_backend_times_out() {
        let rl = RateLimiter::new(Arc::new(Stalled)).with_timeout(Duration::from_millis(250));
        let started = Instant::now();
        let err = rl.allow("ip", "r", LIMITS).await.unwrap_err();
        assert!(err.to_string().contains("did not answer"));
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    /// Set `BURNBOX_TEST_REDIS_URL` to run these against a live server.
    async fn redis_counters() -> Option<RedisCounters> {
        let url = std::env::var("BURNBOX_TEST_REDIS_URL").ok()?;
        Some(RedisCounters::connect(&url).await.unwrap())
    }

    #[tokio::test]
    async fn redis_counter_expiry_set_once() {
        let Some(counters) = redis_counters().await else {
            return;
        };
        let key = format!("burnbox-test:{}", uuid::Uuid::new_v4());
        let mut conn = counters.conn.clone();

        assert_eq!(counters.get(&key).await.unwrap(), 0);
        assert_eq!(counters.incr(&key, MINUTE).await.unwrap(), 1);
        let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(&mut conn).await.unwrap();
        assert!(ttl > 0 && ttl <= 60, "ttl {ttl}");

        // A later increment must not restart the window.
        let _: bool = redis::cmd("EXPIRE").arg(&key).arg(500).query_async(&mut conn).await.unwrap();
        assert_eq!(counters.incr(&key, MINUTE).await.unwrap(), 2);
        let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(&mut conn).await.unwrap();
        assert!(ttl > 60, "ttl {ttl}");
        assert_eq!(counters.get(&key).await.unwrap(), 2);

        let _: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await.unwrap();
    }

    #[tokio::test]
    async fn redis_limiter_rejects_sixth_request() {
        let Some(counters) = redis_counters().await else {
            return;
        };
        let ip = format!("test-{}", uuid::Uuid::new_v4());
        let rl = RateLimiter::new(Arc::new(counters.clone()));
        for _ in 0..5 {
            assert!(rl.allow(&ip, "/api/secrets", LIMITS).await.unwrap());
        }
        assert!(!rl.allow(&ip, "/api/secrets", LIMITS).await.unwrap());

        let mut conn = counters.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(format!("{KEY_PREFIX}{ip}:/api/secrets:hour"))
            .arg(format!("{KEY_PREFIX}{ip}:/api/secrets:minute"))
            .query_async(&mut conn)
            .await
            .unwrap();
    }

    #[test]
    fn route_keys() {
        assert_eq!(route_key("/api/secrets"), Some("create_secret"));
        assert_eq!(route_key("/api/secrets/{id}"), Some("view_secret"));
        assert_eq!(route_key("/api/secrets/name/{name}"), Some("view_secret_by_name"));
        assert_eq!(route_key("/health"), None);
    }
}
