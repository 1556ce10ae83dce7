//! Webhook tunnel relay client
//!
//! A tunnel registers an application webhook whose callback URL points at the
//! relay (`https://<callback-domain>/<tunnel-id>`), then holds a websocket to
//! the relay presenting the same tunnel id. The relay forwards every
//! notification for that webhook down the socket, so no public inbound
//! endpoint is needed.
//!
//! ```text
//!  API ──webhook──► relay ──websocket──► background task ──► callbacks
//! ```

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::auth::AppCredentials;
use crate::client::NylasClient;
use crate::error::{NylasError, Result};
use crate::webhook::{
    Webhook, WebhookDelta, WebhookNotification, WebhookRequest, WebhookState, WebhookTrigger,
};

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLIENT_ID_HEADER: HeaderName = HeaderName::from_static("client-id");
const CLIENT_SECRET_HEADER: HeaderName = HeaderName::from_static("client-secret");
const TUNNEL_ID_HEADER: HeaderName = HeaderName::from_static("tunnel-id");
const REGION_HEADER: HeaderName = HeaderName::from_static("region");

/// Data-center region declared to the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    #[default]
    Us,
    Ireland,
    Canada,
    Australia,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Us => "us",
            Region::Ireland => "ireland",
            Region::Canada => "canada",
            Region::Australia => "australia",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the background task recovers from a dropped relay connection
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Give up once reconnecting has taken this long
    pub max_elapsed: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            max_elapsed: Duration::from_secs(300),
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.initial_interval,
            current_interval: self.initial_interval,
            max_interval: self.max_interval,
            max_elapsed_time: Some(self.max_elapsed),
            ..ExponentialBackoff::default()
        };
        backoff.reset();
        backoff
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TunnelConfig {
    pub relay_url: String,
    /// Host the registered webhook points at; the tunnel id is appended as a path segment
    pub callback_domain: String,
    pub region: Region,
    pub triggers: Vec<WebhookTrigger>,
    pub ping_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            relay_url: "wss://tunnel.nylas.com".to_string(),
            callback_domain: "cb.nylas.com".to_string(),
            region: Region::default(),
            triggers: WebhookTrigger::all().to_vec(),
            ping_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl TunnelConfig {
    pub fn callback_url(&self, tunnel_id: &str) -> String {
        format!("https://{}/{}", self.callback_domain, tunnel_id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ping_interval.is_zero() {
            return Err(NylasError::ValidationError(
                "Tunnel ping interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Registering,
    Connecting,
    Open,
    Reconnecting,
    Closed,
    Errored,
}

/// Caller hooks invoked from the background task, one at a time, in frame order
#[derive(Clone, Default)]
pub struct TunnelCallbacks {
    on_open: Option<Arc<dyn Fn() + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(&NylasError) + Send + Sync>>,
    on_close: Option<Arc<dyn Fn(Option<u16>, &str) + Send + Sync>>,
    on_ping: Option<Arc<dyn Fn(&[u8]) + Send + Sync>>,
    on_pong: Option<Arc<dyn Fn(&[u8]) + Send + Sync>>,
    on_data: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    on_message: Option<Arc<dyn Fn(WebhookDelta) + Send + Sync>>,
}

impl TunnelCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_open(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&NylasError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Close code and reason, when the peer sent them
    pub fn on_close(mut self, f: impl Fn(Option<u16>, &str) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_ping(mut self, f: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.on_ping = Some(Arc::new(f));
        self
    }

    pub fn on_pong(mut self, f: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.on_pong = Some(Arc::new(f));
        self
    }

    /// Raw frame text, before decoding
    pub fn on_data(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_data = Some(Arc::new(f));
        self
    }

    /// One call per decoded delta
    pub fn on_message(mut self, f: impl Fn(WebhookDelta) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    fn open(&self) {
        if let Some(f) = &self.on_open {
            f();
        }
    }

    fn error(&self, e: &NylasError) {
        if let Some(f) = &self.on_error {
            f(e);
        }
    }

    fn close(&self, code: Option<u16>, reason: &str) {
        if let Some(f) = &self.on_close {
            f(code, reason);
        }
    }
}

impl fmt::Debug for TunnelCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelCallbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_ping", &self.on_ping.is_some())
            .field("on_pong", &self.on_pong.is_some())
            .field("on_data", &self.on_data.is_some())
            .field("on_message", &self.on_message.is_some())
            .finish()
    }
}

/// Decode one relay frame into its deltas.
///
/// Frames are double-encoded: the outer JSON object carries a `body` string,
/// which is itself the JSON notification holding `deltas`.
pub fn decode_frame(text: &str) -> Result<Vec<WebhookDelta>> {
    let outer: Value = serde_json::from_str(text)
        .map_err(|e| NylasError::MalformedEnvelope(format!("invalid relay frame: {}", e)))?;
    let body = outer.get("body").and_then(Value::as_str).ok_or_else(|| {
        NylasError::MalformedEnvelope("relay frame has no string 'body'".to_string())
    })?;

    Ok(WebhookNotification::from_slice(body.as_bytes())?.deltas)
}

/// A registered, connected tunnel.
///
/// Owns the relay connection through its background task. Dropping the handle
/// closes the connection; the webhook registration is left in place.
pub struct TunnelHandle {
    tunnel_id: String,
    webhook: Webhook,
    region: Region,
    state: watch::Receiver<TunnelState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TunnelHandle {
    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn webhook_id(&self) -> &str {
        &self.webhook.id
    }

    pub fn webhook(&self) -> &Webhook {
        &self.webhook
    }

    pub fn callback_url(&self) -> &str {
        &self.webhook.callback_url
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state.clone()
    }

    /// Send a close frame and wait for the background task to finish
    pub async fn close(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| NylasError::TunnelError(format!("Tunnel task failed: {}", e)))?;
        }
        info!("Tunnel {} closed", self.tunnel_id);
        Ok(())
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("tunnel_id", &self.tunnel_id)
            .field("webhook_id", &self.webhook.id)
            .field("region", &self.region)
            .field("state", &self.state())
            .finish()
    }
}

/// Everything the background task needs to (re)connect and dispatch
struct TunnelContext {
    config: TunnelConfig,
    credentials: AppCredentials,
    tunnel_id: String,
    callbacks: TunnelCallbacks,
    state: watch::Sender<TunnelState>,
}

impl TunnelContext {
    fn set_state(&self, state: TunnelState) {
        debug!("Tunnel {} -> {:?}", self.tunnel_id, state);
        self.state.send_replace(state);
    }
}

/// Register a webhook for a fresh tunnel id and connect to the relay.
///
/// Fails if registration fails. If the first relay connection fails the new
/// webhook is deleted again before the error is returned.
pub async fn open(
    client: Arc<dyn NylasClient>,
    config: TunnelConfig,
    callbacks: TunnelCallbacks,
) -> Result<TunnelHandle> {
    config.validate()?;

    let (state_tx, state_rx) = watch::channel(TunnelState::Idle);
    let ctx = TunnelContext {
        credentials: client.credentials().clone(),
        tunnel_id: uuid::Uuid::new_v4().to_string(),
        config,
        callbacks,
        state: state_tx,
    };

    ctx.set_state(TunnelState::Registering);
    let request = WebhookRequest {
        callback_url: ctx.config.callback_url(&ctx.tunnel_id),
        triggers: ctx.config.triggers.clone(),
        state: WebhookState::Active,
    };
    let webhook = match client.create_webhook(&request).await {
        Ok(webhook) => webhook,
        Err(e) => {
            error!("Failed to register tunnel webhook: {}", e);
            ctx.set_state(TunnelState::Errored);
            return Err(e);
        }
    };
    info!(
        "Registered webhook {} for tunnel {} ({} triggers)",
        webhook.id,
        ctx.tunnel_id,
        request.triggers.len()
    );

    ctx.set_state(TunnelState::Connecting);
    let socket = match connect(&ctx).await {
        Ok(socket) => socket,
        Err(e) => {
            error!("Failed to connect tunnel {} to relay: {}", ctx.tunnel_id, e);
            if let Err(cleanup) = client.delete_webhook(&webhook.id).await {
                warn!("Failed to delete webhook {} after connect failure: {}", webhook.id, cleanup);
            }
            ctx.set_state(TunnelState::Errored);
            return Err(e);
        }
    };

    ctx.set_state(TunnelState::Open);
    ctx.callbacks.open();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let tunnel_id = ctx.tunnel_id.clone();
    let region = ctx.config.region;
    let task = tokio::spawn(run(socket, ctx, shutdown_rx));

    Ok(TunnelHandle {
        tunnel_id,
        webhook,
        region,
        state: state_rx,
        shutdown: Some(shutdown_tx),
        task: Some(task),
    })
}

async fn connect(ctx: &TunnelContext) -> Result<RelaySocket> {
    let mut request = ctx.config.relay_url.as_str().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(CLIENT_ID_HEADER, header_value(&ctx.credentials.client_id)?);
    headers.insert(CLIENT_SECRET_HEADER, header_value(&ctx.credentials.client_secret)?);
    headers.insert(TUNNEL_ID_HEADER, header_value(&ctx.tunnel_id)?);
    headers.insert(REGION_HEADER, HeaderValue::from_static(ctx.config.region.as_str()));

    let (socket, _response) = connect_async(request).await?;
    debug!("Connected tunnel {} to {}", ctx.tunnel_id, ctx.config.relay_url);
    Ok(socket)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| NylasError::TunnelError(format!("Invalid relay header value: {}", e)))
}

enum SessionEnd {
    Shutdown,
    Dropped,
}

enum Reconnect {
    Connected(Box<RelaySocket>),
    Shutdown,
    GaveUp,
}

async fn run(mut socket: RelaySocket, ctx: TunnelContext, mut shutdown: oneshot::Receiver<()>) {
    loop {
        if let SessionEnd::Shutdown = session(&mut socket, &ctx, &mut shutdown).await {
            ctx.set_state(TunnelState::Closed);
            return;
        }

        if !ctx.config.reconnect.enabled {
            warn!("Tunnel {} lost its relay connection", ctx.tunnel_id);
            ctx.set_state(TunnelState::Errored);
            return;
        }

        ctx.set_state(TunnelState::Reconnecting);
        match reconnect(&ctx, &mut shutdown).await {
            Reconnect::Connected(new_socket) => {
                socket = *new_socket;
                ctx.set_state(TunnelState::Open);
                ctx.callbacks.open();
            }
            Reconnect::Shutdown => {
                ctx.set_state(TunnelState::Closed);
                return;
            }
            Reconnect::GaveUp => {
                error!("Tunnel {} gave up reconnecting", ctx.tunnel_id);
                ctx.set_state(TunnelState::Errored);
                return;
            }
        }
    }
}

/// Pump one relay connection until the caller closes it or it drops
async fn session(
    socket: &mut RelaySocket,
    ctx: &TunnelContext,
    shutdown: &mut oneshot::Receiver<()>,
) -> SessionEnd {
    let period = ctx.config.ping_interval;
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut *shutdown => {
                if let Err(e) = socket.close(None).await {
                    debug!("Error sending close frame: {}", e);
                }
                ctx.callbacks.close(None, "");
                return SessionEnd::Shutdown;
            }
            _ = ping.tick() => {
                if let Err(e) = socket.send(Message::Ping(Vec::new())).await {
                    let e = NylasError::from(e);
                    warn!("Tunnel {} ping failed: {}", ctx.tunnel_id, e);
                    ctx.callbacks.error(&e);
                    return SessionEnd::Dropped;
                }
            }
            frame = socket.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_text(ctx, &text),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => handle_text(ctx, text),
                    Err(_) => warn!("Ignoring non-UTF-8 relay frame ({} bytes)", data.len()),
                },
                Some(Ok(Message::Ping(payload))) => {
                    if let Some(f) = &ctx.callbacks.on_ping {
                        f(&payload);
                    }
                }
                Some(Ok(Message::Pong(payload))) => {
                    if let Some(f) = &ctx.callbacks.on_pong {
                        f(&payload);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (Some(u16::from(f.code)), f.reason.into_owned()))
                        .unwrap_or((None, String::new()));
                    info!("Relay closed tunnel {} ({:?} {})", ctx.tunnel_id, code, reason);
                    ctx.callbacks.close(code, &reason);
                    return SessionEnd::Dropped;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    let e = NylasError::from(e);
                    warn!("Tunnel {} connection error: {}", ctx.tunnel_id, e);
                    ctx.callbacks.error(&e);
                    return SessionEnd::Dropped;
                }
                None => {
                    info!("Relay connection for tunnel {} ended", ctx.tunnel_id);
                    ctx.callbacks.close(None, "");
                    return SessionEnd::Dropped;
                }
            },
        }
    }
}

fn handle_text(ctx: &TunnelContext, text: &str) {
    if let Some(f) = &ctx.callbacks.on_data {
        f(text);
    }
    let Some(on_message) = &ctx.callbacks.on_message else {
        return;
    };

    match decode_frame(text) {
        Ok(deltas) => {
            debug!("Tunnel {} received {} deltas", ctx.tunnel_id, deltas.len());
            for delta in deltas {
                on_message(delta);
            }
        }
        Err(e) => {
            warn!("Dropping undecodable relay frame: {}", e);
            ctx.callbacks.error(&e);
        }
    }
}

async fn reconnect(ctx: &TunnelContext, shutdown: &mut oneshot::Receiver<()>) -> Reconnect {
    let mut backoff = ctx.config.reconnect.backoff();
    let mut attempt = 0u32;

    loop {
        let Some(delay) = backoff.next_backoff() else {
            return Reconnect::GaveUp;
        };
        attempt += 1;
        info!(
            "Reconnecting tunnel {} in {:?} (attempt {})",
            ctx.tunnel_id, delay, attempt
        );

        tokio::select! {
            _ = &mut *shutdown => return Reconnect::Shutdown,
            _ = tokio::time::sleep(delay) => {}
        }

        match connect(ctx).await {
            Ok(socket) => return Reconnect::Connected(Box::new(socket)),
            Err(e) => {
                warn!("Tunnel {} reconnect attempt {} failed: {}", ctx.tunnel_id, attempt, e);
                ctx.callbacks.error(&e);
            }
        }
    }
}
