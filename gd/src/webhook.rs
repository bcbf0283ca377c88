//! Webhook listener
//!
//! An axum router that accepts a JSON push payload on `POST` to any path and
//! queues it on the deploy worker. The response only says whether the
//! notification was queued, never whether it was released.

use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use eyre::{Context, Result};
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::notification::PushNotification;
use crate::worker::DeployHandle;

/// Largest accepted request body
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Longest a request may take, body upload included
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const GITHUB_EVENT: &str = "x-github-event";

/// Routes every path to the push receiver
pub fn router(handle: DeployHandle) -> Router {
    Router::new()
        .fallback(receive)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

/// Bind the webhook listener
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind webhook listener on {}", addr))?;
    info!(addr = %listener.local_addr()?, "Listening for push notifications");
    Ok(listener)
}

/// Serve push notifications until the listener fails
pub async fn serve(listener: TcpListener, handle: DeployHandle) -> Result<()> {
    axum::serve(listener, router(handle))
        .await
        .context("Webhook listener failed")
}

/// Turn a request into a queued notification
async fn receive(
    State(handle): State<DeployHandle>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    debug!(%method, len = body.len(), "receive: called");
    if method != Method::POST {
        return (StatusCode::METHOD_NOT_ALLOWED, "POST a push payload\n".to_string());
    }

    let event = headers.get(GITHUB_EVENT).and_then(|v| v.to_str().ok());
    if event == Some("ping") {
        return (StatusCode::OK, "pong\n".to_string());
    }

    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok());
    if let Some(content_type) = content_type
        && content_type.starts_with("application/x-www-form-urlencoded")
    {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Send the payload as application/json\n".to_string(),
        );
    }

    let Json(notification) = match Json::<PushNotification>::from_bytes(&body) {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e.body_text(), "Failed to decode push payload");
            return (
                StatusCode::BAD_REQUEST,
                format!("Invalid push payload: {}\n", e.body_text()),
            );
        }
    };

    match handle.submit(notification) {
        Ok(()) => (StatusCode::ACCEPTED, "queued\n".to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("{}\n", e)),
    }
}
