//! Common test utilities and fixtures
#![allow(dead_code)]

use mockall::mock;
use nylas_sync::auth::AppCredentials;
use nylas_sync::client::{ByteStream, NylasClient};
use nylas_sync::error::Result;
use nylas_sync::signature::compute_signature;
use nylas_sync::webhook::{Webhook, WebhookRequest};
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Once;

pub const CLIENT_ID: &str = "test-client-id";
pub const CLIENT_SECRET: &str = "test-client-secret";

static TRACING: Once = Once::new();

/// Route library logs to the test output; `RUST_LOG` controls the level
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn test_credentials() -> AppCredentials {
    AppCredentials::new(CLIENT_ID, CLIENT_SECRET)
}

/// One delta line as sent by the streaming endpoint
pub fn delta_json(id: &str, cursor: &str, object: &str) -> Value {
    json!({
        "id": id,
        "cursor": cursor,
        "event": "create",
        "object": object,
        "attributes": {
            "id": id,
            "account_id": "acc-1",
            "object": object
        }
    })
}

/// Newline-delimited body for `/delta/streaming`
pub fn streaming_body(deltas: &[Value]) -> String {
    deltas
        .iter()
        .map(|d| format!("{}\n", d))
        .collect::<String>()
}

pub fn envelope_json(cursor_start: &str, cursor_end: &str, deltas: Vec<Value>) -> Value {
    json!({
        "cursor_start": cursor_start,
        "cursor_end": cursor_end,
        "deltas": deltas
    })
}

/// Webhook notification body plus its valid signature
pub fn signed_notification(deltas: Vec<Value>) -> (Vec<u8>, String) {
    let body = serde_json::to_vec(&json!({ "deltas": deltas })).unwrap();
    let signature = compute_signature(CLIENT_SECRET.as_bytes(), &body);
    (body, signature)
}

pub fn webhook_delta_json(trigger: &str, object: &str, id: &str) -> Value {
    json!({
        "date": 1675098465,
        "object": object,
        "type": trigger,
        "object_data": {
            "id": id,
            "account_id": "acc-1",
            "namespace_id": "acc-1",
            "object": object,
            "attributes": null,
            "metadata": null
        }
    })
}

/// Relay frame: the notification JSON embedded as a string under `body`
pub fn relay_frame(deltas: Vec<Value>) -> String {
    let body = json!({ "deltas": deltas }).to_string();
    json!({ "body": body }).to_string()
}

pub fn webhook_for(request: &WebhookRequest, id: &str) -> Webhook {
    Webhook {
        id: id.to_string(),
        application_id: Some(CLIENT_ID.to_string()),
        callback_url: request.callback_url.clone(),
        state: request.state,
        triggers: request.triggers.clone(),
        version: Some("2.0".to_string()),
    }
}

// Mock implementation of NylasClient for testing
mock! {
    pub NylasClient {}

    #[async_trait::async_trait]
    impl NylasClient for NylasClient {
        async fn request_json(
            &self,
            method: Method,
            path: &str,
            query: &[(String, String)],
            body: Option<Value>,
        ) -> Result<Value>;
        async fn open_stream(&self, path: &str, query: &[(String, String)]) -> Result<ByteStream>;
        async fn create_webhook(&self, request: &WebhookRequest) -> Result<Webhook>;
        async fn delete_webhook(&self, webhook_id: &str) -> Result<()>;
        fn credentials(&self) -> &AppCredentials;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nylas_sync::delta::{DeltaEnvelope, DeltaRecord};
    use nylas_sync::tunnel::decode_frame;

    #[test]
    fn test_delta_json_parses() {
        let record = DeltaRecord::from_value(delta_json("m1", "c1", "message")).unwrap();
        assert_eq!(record.id(), "m1");
    }

    #[test]
    fn test_envelope_json_parses() {
        let envelope = DeltaEnvelope::from_value(envelope_json("a", "b", vec![])).unwrap();
        assert!(envelope.is_empty());
    }

    #[test]
    fn test_relay_frame_decodes() {
        let frame = relay_frame(vec![webhook_delta_json("message.created", "message", "m1")]);
        assert_eq!(decode_frame(&frame).unwrap().len(), 1);
    }
}
