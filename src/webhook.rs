//! Webhook registration types, challenge handshake and notification dispatch

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::delta::{ObjectType, ResolvedResource};
use crate::error::{NylasError, Result};
use crate::signature::verify_signature;

/// Event-type tag a webhook subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebhookTrigger {
    AccountConnected,
    AccountInvalid,
    AccountRunning,
    AccountStopped,
    AccountSyncError,
    CalendarCreated,
    CalendarUpdated,
    CalendarDeleted,
    ContactCreated,
    ContactUpdated,
    ContactDeleted,
    EventCreated,
    EventUpdated,
    EventDeleted,
    FolderCreated,
    FolderUpdated,
    FolderDeleted,
    JobSuccessful,
    JobFailed,
    LabelCreated,
    LabelUpdated,
    LabelDeleted,
    MessageCreated,
    MessageUpdated,
    MessageOpened,
    MessageLinkClicked,
    MessageBounced,
    ThreadReplied,
}

const ALL_TRIGGERS: [WebhookTrigger; 28] = [
    WebhookTrigger::AccountConnected,
    WebhookTrigger::AccountInvalid,
    WebhookTrigger::AccountRunning,
    WebhookTrigger::AccountStopped,
    WebhookTrigger::AccountSyncError,
    WebhookTrigger::CalendarCreated,
    WebhookTrigger::CalendarUpdated,
    WebhookTrigger::CalendarDeleted,
    WebhookTrigger::ContactCreated,
    WebhookTrigger::ContactUpdated,
    WebhookTrigger::ContactDeleted,
    WebhookTrigger::EventCreated,
    WebhookTrigger::EventUpdated,
    WebhookTrigger::EventDeleted,
    WebhookTrigger::FolderCreated,
    WebhookTrigger::FolderUpdated,
    WebhookTrigger::FolderDeleted,
    WebhookTrigger::JobSuccessful,
    WebhookTrigger::JobFailed,
    WebhookTrigger::LabelCreated,
    WebhookTrigger::LabelUpdated,
    WebhookTrigger::LabelDeleted,
    WebhookTrigger::MessageCreated,
    WebhookTrigger::MessageUpdated,
    WebhookTrigger::MessageOpened,
    WebhookTrigger::MessageLinkClicked,
    WebhookTrigger::MessageBounced,
    WebhookTrigger::ThreadReplied,
];

impl WebhookTrigger {
    /// Every trigger the platform emits
    pub fn all() -> &'static [WebhookTrigger] {
        &ALL_TRIGGERS
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookTrigger::AccountConnected => "account.connected",
            WebhookTrigger::AccountInvalid => "account.invalid",
            WebhookTrigger::AccountRunning => "account.running",
            WebhookTrigger::AccountStopped => "account.stopped",
            WebhookTrigger::AccountSyncError => "account.sync_error",
            WebhookTrigger::CalendarCreated => "calendar.created",
            WebhookTrigger::CalendarUpdated => "calendar.updated",
            WebhookTrigger::CalendarDeleted => "calendar.deleted",
            WebhookTrigger::ContactCreated => "contact.created",
            WebhookTrigger::ContactUpdated => "contact.updated",
            WebhookTrigger::ContactDeleted => "contact.deleted",
            WebhookTrigger::EventCreated => "event.created",
            WebhookTrigger::EventUpdated => "event.updated",
            WebhookTrigger::EventDeleted => "event.deleted",
            WebhookTrigger::FolderCreated => "folder.created",
            WebhookTrigger::FolderUpdated => "folder.updated",
            WebhookTrigger::FolderDeleted => "folder.deleted",
            WebhookTrigger::JobSuccessful => "job.successful",
            WebhookTrigger::JobFailed => "job.failed",
            WebhookTrigger::LabelCreated => "label.created",
            WebhookTrigger::LabelUpdated => "label.updated",
            WebhookTrigger::LabelDeleted => "label.deleted",
            WebhookTrigger::MessageCreated => "message.created",
            WebhookTrigger::MessageUpdated => "message.updated",
            WebhookTrigger::MessageOpened => "message.opened",
            WebhookTrigger::MessageLinkClicked => "message.link_clicked",
            WebhookTrigger::MessageBounced => "message.bounced",
            WebhookTrigger::ThreadReplied => "thread.replied",
        }
    }
}

impl fmt::Display for WebhookTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookTrigger {
    type Err = NylasError;

    fn from_str(s: &str) -> Result<Self> {
        ALL_TRIGGERS
            .iter()
            .find(|trigger| trigger.as_str() == s)
            .copied()
            .ok_or_else(|| NylasError::ValidationError(format!("Unknown webhook trigger '{}'", s)))
    }
}

impl Serialize for WebhookTrigger {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for WebhookTrigger {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        tag.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookState {
    #[default]
    Active,
    Inactive,
}

/// Body of a webhook registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub callback_url: String,
    pub triggers: Vec<WebhookTrigger>,
    #[serde(default)]
    pub state: WebhookState,
}

/// Registered webhook as returned by the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    #[serde(default)]
    pub application_id: Option<String>,
    pub callback_url: String,
    #[serde(default)]
    pub state: WebhookState,
    /// Triggers this crate does not know are skipped
    #[serde(default, deserialize_with = "known_triggers")]
    pub triggers: Vec<WebhookTrigger>,
    #[serde(default)]
    pub version: Option<String>,
}

fn known_triggers<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<WebhookTrigger>, D::Error> {
    let tags = Vec::<String>::deserialize(deserializer)?;
    Ok(tags
        .iter()
        .filter_map(|tag| match tag.parse() {
            Ok(trigger) => Some(trigger),
            Err(_) => {
                debug!("Skipping unknown webhook trigger {}", tag);
                None
            }
        })
        .collect())
}

/// Resource reference carried by a notification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookObjectData {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub namespace_id: Option<String>,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub attributes: Option<Value>,
    /// Tracking data for `message.opened` / `message.link_clicked`
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// One change record inside a webhook notification or tunnel frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDelta {
    /// Unix timestamp in seconds
    pub date: i64,
    pub object: String,
    /// Trigger tag such as `message.created`; kept as text so new triggers still parse
    #[serde(rename = "type")]
    pub trigger: String,
    #[serde(default)]
    pub object_data: Option<WebhookObjectData>,
}

impl WebhookDelta {
    pub fn trigger_kind(&self) -> Option<WebhookTrigger> {
        self.trigger.parse().ok()
    }

    pub fn object_type(&self) -> ObjectType {
        ObjectType::from_tag(&self.object)
    }

    /// Typed view of `object_data.attributes`, when both are present and the tag is known
    pub fn resolve(&self) -> Result<Option<ResolvedResource>> {
        match self.object_data.as_ref().and_then(|d| d.attributes.as_ref()) {
            Some(attributes) => ResolvedResource::from_attributes(&self.object_type(), attributes),
            None => Ok(None),
        }
    }
}

/// Decoded notification body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookNotification {
    #[serde(default)]
    pub deltas: Vec<WebhookDelta>,
}

impl WebhookNotification {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            NylasError::MalformedEnvelope(format!("invalid webhook notification: {}", e))
        })
    }
}

/// Dispatch counts for one accepted notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NotificationOutcome {
    pub delivered: usize,
    pub failed: usize,
}

/// Echo the registration handshake challenge, verbatim
pub fn handle_challenge(query: &HashMap<String, String>) -> Option<String> {
    query.get("challenge").cloned()
}

/// Pull the `challenge` query parameter out of a full URL
pub fn extract_challenge_parameter(url: &str) -> Result<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .query_pairs()
                .find(|(key, _)| key == "challenge")
                .map(|(_, value)| value.into_owned())
        })
        .ok_or_else(|| {
            NylasError::ValidationError("Invalid URL or no challenge parameter found.".to_string())
        })
}

/// Verify and dispatch one inbound notification.
///
/// Nothing is dispatched unless the signature verifies. Handler failures are
/// logged and counted; the notification is still acknowledged so the platform
/// does not redeliver it.
pub fn handle_notification<F, E>(
    raw_body: &[u8],
    signature: Option<&str>,
    secret: &[u8],
    mut on_delta: F,
) -> Result<NotificationOutcome>
where
    F: FnMut(&WebhookDelta) -> std::result::Result<(), E>,
    E: fmt::Display,
{
    let verified = signature
        .map(|sig| verify_signature(secret, raw_body, sig))
        .unwrap_or(false);
    if !verified {
        warn!("Rejected webhook notification with invalid signature");
        return Err(NylasError::AuthError("Signature verification failed!".to_string()));
    }

    let notification = WebhookNotification::from_slice(raw_body)?;
    let mut outcome = NotificationOutcome::default();

    for delta in &notification.deltas {
        match on_delta(delta) {
            Ok(()) => outcome.delivered += 1,
            Err(e) => {
                warn!("Webhook handler failed for {} ({}): {}", delta.trigger, delta.object, e);
                outcome.failed += 1;
            }
        }
    }

    debug!(
        "Dispatched webhook notification: {} delivered, {} failed",
        outcome.delivered, outcome.failed
    );
    Ok(outcome)
}

/// Per-delta callback shared with the HTTP endpoint
pub type DeltaHandler = Arc<dyn Fn(&WebhookDelta) -> Result<()> + Send + Sync>;

/// Secret and handler an inbound webhook endpoint dispatches with
#[derive(Clone)]
pub struct WebhookEndpoint {
    secret: Arc<Vec<u8>>,
    handler: DeltaHandler,
}

impl WebhookEndpoint {
    pub fn new<F>(secret: impl AsRef<[u8]>, handler: F) -> Self
    where
        F: Fn(&WebhookDelta) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            secret: Arc::new(secret.as_ref().to_vec()),
            handler: Arc::new(handler),
        }
    }

    pub fn handle(&self, raw_body: &[u8], signature: Option<&str>) -> Result<NotificationOutcome> {
        let handler = &self.handler;
        handle_notification(raw_body, signature, &self.secret, |delta| handler(delta))
    }
}

impl fmt::Debug for WebhookEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookEndpoint").finish_non_exhaustive()
    }
}
