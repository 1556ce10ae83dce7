//! Nylas delta sync, webhook and tunnel client
//!
//! Incremental change feeds and authenticated event delivery for the Nylas
//! email/calendar/contacts API.
//!
//! # Overview
//!
//! - **Delta sync**: fetch the latest cursor, then follow changes with a
//!   single-shot fetch, a newline-delimited stream or a long-poll
//! - **Webhooks**: challenge handshake, HMAC-SHA256 signature verification
//!   and per-delta dispatch, plus an `axum` endpoint
//! - **Tunnel**: register a relay-backed webhook and receive notifications
//!   over a reconnecting websocket, no public endpoint required
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use nylas_sync::{config::Config, DeltaFetcher, ProductionNylasClient};
//!
//! #[tokio::main]
//! async fn main() -> nylas_sync::Result<()> {
//!     let mut config = Config::load("nylas.toml".as_ref()).await?;
//!     config.apply_env();
//!
//!     config.validate()?;
//!
//!     let client = Arc::new(ProductionNylasClient::from_config(&config)?);
//!     let fetcher = DeltaFetcher::from_config(client, &config);
//!
//!     let cursor = fetcher.latest_cursor().await?;
//!     let poll = fetcher
//!         .longpoll(&cursor, config.longpoll_timeout(), &config.delta_options())
//!         .await?;
//!     for delta in poll.deltas() {
//!         println!("{} {} {}", delta.event().as_str(), delta.object(), delta.id());
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`auth`] - Application credentials and OAuth helpers
//! - [`client`] - REST API client trait and `reqwest` implementation
//! - [`config`] - Configuration management
//! - [`delta`] - Cursors, delta records and envelopes
//! - [`delta_fetcher`] - Single-shot, streaming and long-poll transports
//! - [`error`] - Error types and result aliases
//! - [`models`] - Typed resources resolved from deltas
//! - [`signature`] - Webhook HMAC verification
//! - [`tunnel`] - Websocket relay client
//! - [`webhook`] - Webhook types, challenge and notification handling
//! - [`webhook_server`] - HTTP endpoint for direct webhook delivery

pub mod auth;
pub mod client;
pub mod config;
pub mod delta;
pub mod delta_fetcher;
pub mod error;
pub mod models;
pub mod signature;
pub mod tunnel;
pub mod webhook;
pub mod webhook_server;

// Re-export commonly used types for convenience
pub use error::{NylasError, Result};

pub use auth::{AppCredentials, AuthorizationRequest};
pub use client::{ByteStream, NylasClient, ProductionNylasClient};
pub use config::Config;

// Delta sync
pub use delta::{Cursor, DeltaEnvelope, DeltaEvent, DeltaRecord, DeltaView, ObjectType, ResolvedResource};
pub use delta_fetcher::{DeltaFetcher, DeltaOptions, LongPoll};

// Webhooks and tunnel
pub use signature::{compute_signature, verify_signature, SIGNATURE_HEADER};
pub use tunnel::{Region, TunnelCallbacks, TunnelConfig, TunnelHandle, TunnelState};
pub use webhook::{
    extract_challenge_parameter, handle_challenge, handle_notification, NotificationOutcome,
    WebhookDelta, WebhookEndpoint, WebhookTrigger,
};
