//! HTTP endpoint for direct webhook delivery

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{error, info, warn};

use crate::error::{NylasError, Result};
use crate::signature::SIGNATURE_HEADER;
use crate::webhook::{handle_challenge, WebhookEndpoint};

async fn challenge_handler(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    match handle_challenge(&params) {
        Some(challenge) => (StatusCode::OK, challenge),
        None => (
            StatusCode::BAD_REQUEST,
            "Missing challenge parameter".to_string(),
        ),
    }
}

/// Verify and dispatch on the blocking pool; the delta handler may block
/// for as long as it needs without stalling other requests.
async fn notification_handler(
    State(endpoint): State<WebhookEndpoint>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let outcome =
        tokio::task::spawn_blocking(move || endpoint.handle(&body, signature.as_deref())).await;
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Webhook handler task failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            );
        }
    };

    match outcome {
        Ok(_) => (StatusCode::OK, "Success".to_string()),
        Err(NylasError::AuthError(_)) => (
            StatusCode::UNAUTHORIZED,
            "Signature verification failed!".to_string(),
        ),
        Err(e) => {
            warn!("Rejected webhook notification: {}", e);
            (StatusCode::BAD_REQUEST, e.to_string())
        }
    }
}

/// Build the webhook router mounted at `path`.
///
/// GET echoes the registration challenge, POST verifies and dispatches a
/// notification; other methods get 405.
pub fn build_router(path: &str, endpoint: WebhookEndpoint) -> Router {
    Router::new()
        .route(path, get(challenge_handler).post(notification_handler))
        .with_state(endpoint)
}

/// Serve the webhook endpoint until the listener fails
pub async fn serve(addr: SocketAddr, path: &str, endpoint: WebhookEndpoint) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Webhook endpoint listening on {}{}", listener.local_addr()?, path);
    axum::serve(listener, build_router(path, endpoint)).await?;
    Ok(())
}
