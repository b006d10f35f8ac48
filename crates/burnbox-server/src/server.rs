use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    captcha::TurnstileVerifier,
    config::{RateLimitConfig, ValidatedConfig},
    handlers::{create_secret, health, read_secret, read_secret_by_name},
    ratelimit::{
        rate_limit, CounterStore, MemoryCounters, RateLimitLayerState, RateLimiter, RedisCounters,
        MINUTE,
    },
    service::{SecretPolicy, SecretService},
    store::{Envelope, FileStore, SweepStats},
    AppState,
};

/// Room for the JSON framing around the ciphertext parts.
const BODY_OVERHEAD: usize = 64 * 1024;

/// Largest request body the API accepts under `policy`.
pub fn body_limit(policy: &SecretPolicy) -> usize {
    policy.max_secret_size_bytes.saturating_add(BODY_OVERHEAD)
}

/// Assemble the HTTP surface. `rate_limit` guards the `/api` routes only.
pub fn build_router(
    state: AppState,
    rate_limit_state: Option<RateLimitLayerState>,
    cors_origins: &[String],
) -> Router {
    let mut api = Router::new()
        .route("/api/secrets", post(create_secret))
        .route("/api/secrets/{id}", post(read_secret))
        .route("/api/secrets/name/{name}", post(read_secret_by_name))
        .layer(DefaultBodyLimit::max(body_limit(state.service.policy())));
    if let Some(rl) = rate_limit_state {
        api = api.route_layer(middleware::from_fn_with_state(rl, rate_limit));
    }

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .with_state(state)
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

fn build_cors(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(_) if o == "*" => {
                warn!("ignoring wildcard CORS origin; list origins explicitly");
                None
            }
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring unparsable CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(86_400))
        .allow_origin(origins)
}

/// Build the secret service described by `cfg` over `store`.
pub fn build_service(cfg: &ValidatedConfig, store: FileStore) -> Result<SecretService> {
    let mut service = SecretService::new(store, cfg.policy.clone());
    if let Some(key) = &cfg.server_key {
        service = service.with_envelope(Envelope::new(key.as_bytes()), cfg.server_side_encryption);
    }
    if let Some(captcha) = &cfg.captcha {
        let verifier = TurnstileVerifier::new(
            captcha.secret.clone(),
            captcha.verify_url.clone(),
            captcha.timeout,
        )
        .context("build captcha client")?;
        service = service.with_captcha(Arc::new(verifier));
    }
    Ok(service)
}

/// Pick the counting backend. An unreachable Redis disables rate limiting.
async fn connect_limiter(
    cfg: RateLimitConfig,
    shutdown: watch::Receiver<bool>,
) -> Option<RateLimitLayerState> {
    let backend: Arc<dyn CounterStore> = match &cfg.redis_url {
        Some(url) => match RedisCounters::connect(url).await {
            Ok(counters) => {
                info!("rate limiting with redis counters");
                Arc::new(counters)
            }
            Err(e) => {
                warn!(error = %e, "redis unavailable; rate limiting disabled");
                return None;
            }
        },
        None => {
            info!("rate limiting with in-process counters");
            let counters = Arc::new(MemoryCounters::new());
            spawn_counter_purge(counters.clone(), shutdown);
            counters
        }
    };
    Some(RateLimitLayerState {
        limiter: RateLimiter::new(backend),
        config: Arc::new(cfg),
    })
}

fn spawn_counter_purge(counters: Arc<MemoryCounters>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MINUTE);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => counters.purge_expired().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

/// Run one sweep over the configured storage directory and return its stats.
pub fn sweep_once(cfg: &ValidatedConfig) -> Result<SweepStats> {
    let store = FileStore::open(&cfg.storage_path).context("open secret store")?;
    store.sweep_expired().context("sweep expired secrets")
}

/// Sweep once before serving. Failure is logged, not fatal.
fn startup_sweep(store: &FileStore) -> Option<SweepStats> {
    match store.sweep_expired() {
        Ok(stats) => {
            info!(deleted = stats.deleted, errors = stats.errors, "startup sweep complete");
            Some(stats)
        }
        Err(e) => {
            warn!(error = %e, "startup sweep failed; serving anyway");
            None
        }
    }
}

/// Serve until SIGINT or SIGTERM.
pub async fn run(cfg: ValidatedConfig) -> Result<()> {
    run_with_shutdown(cfg, shutdown_signal()).await
}

/// Serve until `shutdown` resolves, then stop the sweep task after its final pass.
pub async fn run_with_shutdown(
    cfg: ValidatedConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let store = FileStore::open(&cfg.storage_path).context("open secret store")?;
    info!(storage = %store.dir().display(), "using secret storage directory");

    startup_sweep(&store);

    let service = build_service(&cfg, store.clone())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let rate_limit_state = match cfg.rate_limit.clone() {
        Some(rl) => connect_limiter(rl, shutdown_rx.clone()).await,
        None => None,
    };
    let sweep = store.spawn_sweep(cfg.cleanup_interval, shutdown_rx);

    let state = AppState {
        service: Arc::new(service),
    };
    info!(
        server_side_encryption = cfg.server_side_encryption,
        captcha = cfg.captcha.is_some(),
        rate_limit = rate_limit_state.is_some(),
        "secret service ready"
    );
    let app = build_router(state, rate_limit_state, &cfg.cors_origins);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;
    info!(%addr, "burnbox server listening");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server error");

    info!("stopped accepting requests; waiting for final sweep");
    let _ = shutdown_tx.send(true);
    if let Err(e) = sweep.await {
        warn!(error = %e, "sweep task ended abnormally");
    }
    info!("burnbox server shut down");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn startup_sweep_failure_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("secrets");
        let store = FileStore::open(&root).unwrap();
        assert!(startup_sweep(&store).is_some());

        std::fs::remove_dir_all(&root).unwrap();
        assert!(startup_sweep(&store).is_none());
    }

    #[test]
    fn body_limit_tracks_policy() {
        let policy = SecretPolicy {
            max_secret_size_bytes: 4 * 1024 * 1024,
            ..SecretPolicy::default()
        };
        assert_eq!(body_limit(&policy), 4 * 1024 * 1024 + BODY_OVERHEAD);
        let huge = SecretPolicy {
            max_secret_size_bytes: usize::MAX,
            ..SecretPolicy::default()
        };
        assert_eq!(body_limit(&huge), usize::MAX);
    }
}
