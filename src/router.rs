//! The edge application: preview interception, control routes and worker
//! dispatch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, DefaultBodyLimit, FromRequestParts, Request, State};
use axum::http::header::{HeaderName, HOST};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::config::EdgeConfig;
use crate::deploy::{run_deploy, DeployConfig, DeployRequest, DeployResponse};
use crate::dispatch::{resolve_worker, worker_from_host, HttpDispatcher, WorkerDispatcher};
use crate::error::ConfigError;
use crate::preview::{is_preview_host, HttpControlPlane, PreviewCache, PreviewResolver, SandboxControlPlane};
use crate::proxy::{error_page, Forwarder, ProxyRequest, WarmupPolicy};
use crate::websocket;

/// Shared state of the edge application.
pub struct EdgeState {
    pub config: EdgeConfig,
    /// Client for platform calls (deploy pipeline).
    pub http: reqwest::Client,
    pub resolver: PreviewResolver,
    pub forwarder: Forwarder,
    pub dispatcher: Option<Arc<dyn WorkerDispatcher>>,
}

pub type AppState = Arc<EdgeState>;

impl EdgeState {
    pub fn new(
        config: EdgeConfig,
        control_plane: Arc<dyn SandboxControlPlane>,
        dispatcher: Option<Arc<dyn WorkerDispatcher>>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let token_header =
            HeaderName::from_bytes(config.sandbox.token_header.as_bytes()).map_err(|e| {
                ConfigError::Invalid {
                    key: "sandbox.token_header",
                    message: e.to_string(),
                }
            })?;
        let warmup = config.preview.warmup.then(|| WarmupPolicy {
            interval: config.warmup_interval(),
            deadline: config.warmup_deadline(),
        });
        let forwarder = Forwarder::new(Forwarder::client()?, token_header, warmup);

        let cache = Arc::new(PreviewCache::new(
            config.preview.cache_capacity,
            config.cache_ttl(),
        ));
        let resolver = PreviewResolver::new(
            control_plane,
            cache,
            config.sandbox.default_port,
            config.sandbox.wake_stopped,
        );

        Ok(Self {
            config,
            http: reqwest::Client::new(),
            resolver,
            forwarder,
            dispatcher,
        })
    }

    /// State wired to the HTTP control plane and dispatcher named in `config`.
    pub fn from_config(config: EdgeConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let http = reqwest::Client::new();
        let control_plane = Arc::new(HttpControlPlane::from_config(http.clone(), &config.sandbox)?);
        let dispatcher = HttpDispatcher::from_config(Forwarder::client()?, &config.dispatch)
            .map(|d| Arc::new(d) as Arc<dyn WorkerDispatcher>);
        if dispatcher.is_none() {
            tracing::warn!("dispatch.upstream_template is not set, worker requests will fail");
        }
        Self::new(config, control_plane, dispatcher)
    }

    /// Periodically drop expired preview cache entries.
    pub fn spawn_cache_sweep(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.resolver.cache().clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.sweep();
                if removed > 0 {
                    tracing::debug!(removed, remaining = cache.len(), "swept preview cache");
                }
            }
        })
    }
}

/// Serve the edge application until ctrl-c.
pub async fn run_server(config: EdgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config.listen_addr()?;
    let sweep_every = config.sweep_interval();
    let state = Arc::new(EdgeState::from_config(config)?);
    let sweeper = state.spawn_cache_sweep(sweep_every);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "edge router listening");

    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    })
    .await?;

    sweeper.abort();
    Ok(())
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.server.max_body_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/deploy", post(deploy))
        .fallback(dispatch)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(state.clone(), host_gate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn request_host(request: &Request) -> Option<String> {
    request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.as_str().to_string()))
        .map(|host| host.to_ascii_lowercase())
}

fn client_ip(request: &Request) -> Option<std::net::IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

fn path_and_query(request: &Request) -> String {
    request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

/// Sends preview hosts to the forwarder and worker hosts to their worker
/// before any route matching, so `/health` and `/deploy` only answer on the
/// edge's own hostnames.
async fn host_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    match request_host(&request) {
        Some(host) if is_preview_host(&host) => proxy_preview(state, host, request).await,
        Some(host) if worker_from_host(&host, &state.config.dispatch).is_some() => {
            dispatch_request(state, request).await
        }
        _ => next.run(request).await,
    }
}

async fn proxy_preview(state: AppState, host: String, request: Request) -> Response {
    if websocket::is_upgrade_request(request.headers()) {
        let target = path_and_query(&request);
        let protocols = websocket::requested_protocols(request.headers());
        let (mut parts, _body) = request.into_parts();
        return match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(ws) => websocket::upgrade(ws, state, host, target, protocols),
            Err(rejection) => rejection.into_response(),
        };
    }

    let resolved = match state.resolver.resolve(&host).await {
        Ok(resolved) => resolved,
        Err(error) => {
            tracing::warn!(host = %host, error = %error, "preview resolution failed");
            return error_page(StatusCode::BAD_GATEWAY);
        }
    };

    let ip = client_ip(&request);
    let limit = state.config.server.max_body_bytes;
    let proxy_request = match ProxyRequest::from_request(request, host, ip, limit).await {
        Ok(proxy_request) => proxy_request,
        Err(error) => {
            tracing::debug!(error = %error, "failed to read preview request body");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };
    state.forwarder.forward(&resolved, &proxy_request).await
}

async fn health() -> &'static str {
    "ok"
}

async fn deploy(
    State(state): State<AppState>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> (StatusCode, Json<DeployResponse>) {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(DeployResponse::failed(rejection.body_text())),
            )
        }
    };

    let deploy = match DeployConfig::from_request(request, &state.config) {
        Ok(deploy) => deploy,
        Err(error) => {
            tracing::warn!(error = %error, "rejected deploy request");
            return (StatusCode::BAD_REQUEST, Json(DeployResponse::failed(error)));
        }
    };

    let script = deploy.script_name.clone();
    match run_deploy(&state.http, &state.config.api_base(), deploy).await {
        Ok(outcome) => {
            tracing::info!(
                script = %outcome.script_name,
                assets = outcome.asset_files,
                assets_uploaded = outcome.assets_uploaded,
                "deploy finished"
            );
            (StatusCode::OK, Json(DeployResponse::ok()))
        }
        Err(error) => {
            tracing::error!(script = %script, error = %error, "deploy failed");
            let status = if error.is_config() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(DeployResponse::failed(error)))
        }
    }
}

async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    dispatch_request(state, request).await
}

/// Route a non-preview request to the worker its host or path names.
async fn dispatch_request(state: AppState, request: Request) -> Response {
    let host = request_host(&request).unwrap_or_default();
    let Some(target) = resolve_worker(&host, &path_and_query(&request), &state.config.dispatch)
    else {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    };

    let Some(dispatcher) = state.dispatcher.clone() else {
        tracing::warn!(host = %host, worker = %target.name, "no worker dispatcher configured");
        return dispatch_failure(&host, &target.name);
    };

    let ip = client_ip(&request);
    let limit = state.config.server.max_body_bytes;
    let mut proxy_request = match ProxyRequest::from_request(request, host.clone(), ip, limit).await {
        Ok(proxy_request) => proxy_request,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };
    proxy_request.path_and_query = target.path_and_query;

    match dispatcher.fetch(&target.name, proxy_request).await {
        Ok(reply) => reply.into_response(),
        Err(error) => {
            tracing::warn!(host = %host, worker = %target.name, error = %error, "dispatch failed");
            dispatch_failure(&host, &target.name)
        }
    }
}

fn dispatch_failure(host: &str, worker: &str) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        format!("Dispatch failed for host {} (worker {})", host, worker),
    )
        .into_response()
}
