//! HTTP relay between chat clients and the generative-content provider.

pub mod relay;

use crate::api::{ApiProtocol, ByteStream, UpstreamClient};
use crate::types::ChatRequest;
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::future::BoxFuture;
use futures::{stream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use relay::relay_text_stream;

/// A provider that can open one streaming generation per request.
pub trait ContentSource: Send + Sync {
    fn protocol(&self) -> ApiProtocol;

    fn model(&self) -> &str;

    fn open_stream<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, Result<ByteStream>>;
}

impl ContentSource for UpstreamClient {
    fn protocol(&self) -> ApiProtocol {
        UpstreamClient::protocol(self)
    }

    fn model(&self) -> &str {
        UpstreamClient::model(self)
    }

    fn open_stream<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, Result<ByteStream>> {
        Box::pin(self.create_stream(request))
    }
}

pub struct ProxyState {
    pub source: Arc<dyn ContentSource>,
}

impl ProxyState {
    pub fn new(source: Arc<dyn ContentSource>) -> Self {
        Self { source }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub protocol: String,
    pub model: String,
}

/// Relay failure that happened before any response byte was written.
#[derive(Debug)]
pub enum RelayError {
    Upstream(anyhow::Error),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            RelayError::Upstream(error) => (
                StatusCode::BAD_GATEWAY,
                format!("Upstream error: {error:#}"),
            ),
        };

        let body = serde_json::json!({
            "error": {
                "type": "upstream_error",
                "message": message
            }
        });

        (status, Json(body)).into_response()
    }
}

pub fn create_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/chat", post(chat))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the relay on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<ProxyState>, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr().context("listener has no local address")?;
    tracing::info!(%local_addr, "relay listening");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("relay server failed")
}

async fn health_check(State(state): State<Arc<ProxyState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol: state.source.protocol().as_str().to_string(),
        model: state.source.model().to_string(),
    })
}

/// Opens the upstream call and streams its text back as `text/plain`.
///
/// The status line is committed only once the first fragment (or a clean end)
/// arrives, so an upstream that fails before producing text yields a 502.
async fn chat(
    State(state): State<Arc<ProxyState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, RelayError> {
    tracing::info!(
        message_chars = request.message.chars().count(),
        history_turns = request.history.len(),
        "chat request received"
    );

    let upstream = state
        .source
        .open_stream(&request)
        .await
        .map_err(RelayError::Upstream)?;
    let mut relay = relay_text_stream(upstream, state.source.protocol());

    let body = match relay.next().await {
        Some(Err(error)) => return Err(RelayError::Upstream(error)),
        Some(Ok(first)) => Body::from_stream(stream::once(async move { Ok(first) }).chain(relay)),
        None => Body::empty(),
    };

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response())
}
