//! herd HTTP server.

use crate::config::HerdConfig;
use crate::routes;
use crate::session::{InMemorySessionStore, SessionStore};
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use herd_llm::{
    HttpTransport, ProviderClient, ProviderKind, ProviderSettings, Transport, available_providers,
    build_client,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Builds provider clients for sessions and one-off requests.
pub trait ClientFactory: Send + Sync {
    fn build(&self, kind: ProviderKind) -> herd_llm::Result<Box<dyn ProviderClient>>;

    fn availability(&self) -> BTreeMap<ProviderKind, bool>;
}

/// Clients over the configured credentials and one shared HTTP transport.
pub struct ConfiguredClients {
    settings: ProviderSettings,
    transport: Arc<dyn Transport>,
}

impl ConfiguredClients {
    pub fn new(settings: ProviderSettings, transport: Arc<dyn Transport>) -> Self {
        Self {
            settings,
            transport,
        }
    }

    pub fn from_config(cfg: &HerdConfig) -> Self {
        Self::new(
            cfg.providers.clone(),
            Arc::new(HttpTransport::new(cfg.request_timeout())),
        )
    }
}

impl ClientFactory for ConfiguredClients {
    fn build(&self, kind: ProviderKind) -> herd_llm::Result<Box<dyn ProviderClient>> {
        let client = build_client(kind, &self.settings, self.transport.clone())?;
        Ok(Box::new(client))
    }

    fn availability(&self) -> BTreeMap<ProviderKind, bool> {
        available_providers(&self.settings)
    }
}

pub struct AppState {
    pub config: HerdConfig,
    pub clients: Arc<dyn ClientFactory>,
    pub sessions: Arc<dyn SessionStore>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: HerdConfig,
        clients: Arc<dyn ClientFactory>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            config,
            clients,
            sessions,
            started_at: Instant::now(),
        }
    }

    /// Named provider, or the configured default when `None` or blank.
    pub fn resolve_provider(&self, name: Option<&str>) -> herd_llm::Result<ProviderKind> {
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.parse(),
            None => Ok(self.config.llm.default_provider),
        }
    }
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = HerdConfig::load_with_path(config_path).await?;
    let addr = cfg.bind_addr()?;
    tracing::info!(
        config_path = %path.display(),
        bind_addr = %addr,
        default_provider = %cfg.llm.default_provider,
        default_model = %cfg.default_model(),
        "config ok"
    );
    println!("config: {}", path.display());
    println!("default provider: {}", cfg.llm.default_provider);
    for (kind, available) in available_providers(&cfg.providers) {
        let status = if available {
            "ready"
        } else {
            "missing api key"
        };
        println!("  {kind:<10} {status}");
    }
    if !cfg.providers.is_available(cfg.llm.default_provider) {
        return Err(anyhow::anyhow!(
            "default provider {} is not usable: set {}",
            cfg.llm.default_provider,
            cfg.llm.default_provider.api_key_env().unwrap_or("its api key")
        ));
    }
    Ok(())
}

pub fn router(state: Arc<AppState>) -> axum::Router {
    routes::router().layer(Extension(state))
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = HerdConfig::load_with_path(config_path).await?;
    let addr = cfg.bind_addr()?;
    tracing::info!(
        config_path = %cfg_path.display(),
        bind_addr = %addr,
        default_provider = %cfg.llm.default_provider,
        default_model = %cfg.default_model(),
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        request_timeout_seconds = cfg.llm.request_timeout_seconds,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let clients = Arc::new(ConfiguredClients::from_config(&cfg));
    let available: Vec<&str> = clients
        .availability()
        .iter()
        .filter(|(_, ok)| **ok)
        .map(|(k, _)| k.as_str())
        .collect();
    tracing::info!(?available, "providers resolved");

    let http_timeout = Duration::from_secs(cfg.server.http_timeout_seconds);
    let max_in_flight = cfg.server.http_max_in_flight;
    let state = Arc::new(AppState::new(
        cfg,
        clients,
        Arc::new(InMemorySessionStore::new()),
    ));

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = router(state)
        .layer(GlobalConcurrencyLimitLayer::new(max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            http_timeout,
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "herd serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("http server shutdown completed");
    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "failed to install SIGTERM handler; falling back to ctrl_c only"
                );
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
}
