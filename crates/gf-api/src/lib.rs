use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use gf_dns::DnsProxy;
use gf_nft::FilterController;
use serde_json::{Value, json};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{error, info};

/// Maximum accepted `/policy` body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Header carrying the shared secret when one is configured.
pub const DEFAULT_TOKEN_HEADER: &str = "x-egress-token";

/// Everything the policy handlers need. The update gate serializes policy
/// replacements so filter and proxy always move together, filter first.
pub struct ApiContext {
    proxy: Arc<DnsProxy>,
    filter: Option<Arc<FilterController>>,
    seed_ips: Vec<IpAddr>,
    token: Option<String>,
    token_header: String,
    update_gate: tokio::sync::Mutex<()>,
}

impl ApiContext {
    pub fn new(
        proxy: Arc<DnsProxy>,
        filter: Option<Arc<FilterController>>,
        seed_ips: Vec<IpAddr>,
        token: Option<String>,
        token_header: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            proxy,
            filter,
            seed_ips,
            token,
            token_header: token_header.unwrap_or_else(|| DEFAULT_TOKEN_HEADER.to_string()),
            update_gate: tokio::sync::Mutex::new(()),
        })
    }

    fn enforcement(&self) -> &'static str {
        if self.filter.is_some() { "dns+nft" } else { "dns" }
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(token) = &self.token else {
            return Ok(());
        };

        let supplied = headers
            .get(self.token_header.as_str())
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        // Length check first; ct_eq requires equal-length slices anyway.
        if supplied.len() != token.len()
            || !bool::from(supplied.as_bytes().ct_eq(token.as_bytes()))
        {
            return Err(ApiError::Unauthorized);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

pub fn router(ctx: Arc<ApiContext>) -> Router {
    Router::new()
        .route("/policy", get(get_policy).post(set_policy).put(set_policy))
        .route("/healthz", get(healthz))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(ctx)
}

/// Bind and serve the policy plane until `shutdown` resolves, then drain.
pub async fn serve(
    ctx: Arc<ApiContext>,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind policy API on {}", addr))?;
    info!(addr = %addr, "policy API listening");

    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown)
        .await
        .context("policy API server failed")?;
    Ok(())
}

async fn healthz() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn get_policy(
    State(ctx): State<Arc<ApiContext>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&headers)?;

    let policy = ctx.proxy.current_policy();
    Ok(Json(json!({
        "policy": &*policy,
        "mode": policy.mode(),
        "enforcement": ctx.enforcement(),
        "rules": policy.rules.len(),
    })))
}

async fn set_policy(
    State(ctx): State<Arc<ApiContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    ctx.authorize(&headers)?;

    let text = std::str::from_utf8(&body)
        .map_err(|_| ApiError::BadRequest("policy body is not UTF-8".to_string()))?;
    let policy = gf_core::Policy::parse(text).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let _gate = ctx.update_gate.lock().await;

    // Filter first; a failed kernel apply leaves the proxy on the old
    // snapshot so both layers keep enforcing the same policy.
    if let Some(filter) = &ctx.filter {
        let merged = policy.with_extra_allow_ips(&ctx.seed_ips);
        filter.apply_static(&merged).await.map_err(|e| {
            error!("filter apply failed, policy not swapped: {}", e);
            ApiError::Internal(format!("filter apply failed: {}", e))
        })?;
    }

    ctx.proxy.update_policy(Some(policy.clone()));
    info!(
        mode = policy.mode().as_str(),
        rules = policy.rules.len(),
        "policy replaced"
    );

    Ok(Json(json!({
        "mode": policy.mode(),
        "enforcement": ctx.enforcement(),
        "rules": policy.rules.len(),
    })))
}
