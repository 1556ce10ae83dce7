//! Delta transports: single-shot cursor fetch, streaming and long-poll
//!
//! All three normalise server output into [`DeltaRecord`]s and
//! [`DeltaEnvelope`]s. Records are handed out in exactly the order the server
//! sent them; nothing here reorders or deduplicates.

use futures::stream::{Stream, StreamExt};
use reqwest::Method;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{ByteStream, NylasClient};
use crate::config::Config;
use crate::delta::{Cursor, DeltaEnvelope, DeltaRecord, DeltaView, ObjectType};
use crate::error::{NylasError, Result};

/// Lazy, finite, non-restartable sequence of streamed records
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<DeltaRecord>> + Send>>;

/// Extra time allowed past the server-side long-poll timeout
pub const DEFAULT_LONGPOLL_GRACE: Duration = Duration::from_secs(10);

/// Filters shared by `stream` and `longpoll`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaOptions {
    pub view: Option<DeltaView>,
    pub include_types: Vec<ObjectType>,
    pub exclude_types: Vec<ObjectType>,
}

impl DeltaOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(mut self, view: DeltaView) -> Self {
        self.view = Some(view);
        self
    }

    pub fn include_types(mut self, types: impl IntoIterator<Item = ObjectType>) -> Self {
        self.include_types = types.into_iter().collect();
        self
    }

    pub fn exclude_types(mut self, types: impl IntoIterator<Item = ObjectType>) -> Self {
        self.exclude_types = types.into_iter().collect();
        self
    }

    /// Include and exclude filters are mutually exclusive
    pub fn validate(&self) -> Result<()> {
        if !self.include_types.is_empty() && !self.exclude_types.is_empty() {
            return Err(NylasError::ValidationError(
                "You cannot set both include_types and exclude_types".to_string(),
            ));
        }
        Ok(())
    }

    fn append_query(&self, query: &mut Vec<(String, String)>) {
        if let Some(view) = self.view {
            query.push(("view".to_string(), view.as_str().to_string()));
        }
        if !self.include_types.is_empty() {
            query.push(("include_types".to_string(), join_types(&self.include_types)));
        }
        if !self.exclude_types.is_empty() {
            query.push(("excluded_types".to_string(), join_types(&self.exclude_types)));
        }
    }
}

fn join_types(types: &[ObjectType]) -> String {
    types
        .iter()
        .map(ObjectType::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

fn timeout_secs(timeout: Duration) -> String {
    timeout.as_secs().max(1).to_string()
}

/// Result of one long-poll
#[derive(Debug, Clone, PartialEq)]
pub struct LongPoll {
    /// First complete envelope received, if any
    pub envelope: Option<DeltaEnvelope>,
    /// The deadline passed before a complete envelope arrived
    pub timed_out: bool,
}

impl LongPoll {
    pub fn deltas(&self) -> &[DeltaRecord] {
        self.envelope
            .as_ref()
            .map(|e| e.deltas.as_slice())
            .unwrap_or(&[])
    }

    /// Cursor to resume from; `None` when nothing complete arrived
    pub fn next_cursor(&self) -> Option<&Cursor> {
        self.envelope.as_ref().map(|e| &e.cursor_end)
    }
}

/// Delta sync client over a [`NylasClient`]
#[derive(Clone)]
pub struct DeltaFetcher {
    client: Arc<dyn NylasClient>,
    longpoll_grace: Duration,
}

impl DeltaFetcher {
    pub fn new(client: Arc<dyn NylasClient>) -> Self {
        Self {
            client,
            longpoll_grace: DEFAULT_LONGPOLL_GRACE,
        }
    }

    /// Fetcher using the configured long-poll grace period
    pub fn from_config(client: Arc<dyn NylasClient>, config: &Config) -> Self {
        Self::new(client).with_longpoll_grace(config.longpoll_grace())
    }

    pub fn with_longpoll_grace(mut self, grace: Duration) -> Self {
        self.longpoll_grace = grace;
        self
    }

    /// Cursor pointing at the current end of the change stream
    pub async fn latest_cursor(&self) -> Result<Cursor> {
        let response = self
            .client
            .request_json(Method::POST, "/delta/latest_cursor", &[], None)
            .await?;

        let cursor = response
            .get("cursor")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                NylasError::ProtocolError("Latest cursor response has no 'cursor' field".to_string())
            })?;

        debug!("Latest delta cursor: {}", cursor);
        Ok(Cursor::new(cursor))
    }

    /// One batch of deltas after `cursor`
    pub async fn since(&self, cursor: &Cursor) -> Result<DeltaEnvelope> {
        let query = vec![("cursor".to_string(), cursor.to_string())];
        let response = self
            .client
            .request_json(Method::GET, "/delta", &query, None)
            .await?;

        let envelope = DeltaEnvelope::from_value(response)?;
        debug!(
            "Fetched {} deltas ({} -> {})",
            envelope.len(),
            envelope.cursor_start,
            envelope.cursor_end
        );
        Ok(envelope)
    }

    /// Open the streaming endpoint and expose it as a record sequence.
    ///
    /// `timeout` is only forwarded to the server; the client-side limit is
    /// enforced by [`DeltaFetcher::stream_with`].
    pub async fn open_stream_records(
        &self,
        cursor: &Cursor,
        options: &DeltaOptions,
        timeout: Option<Duration>,
    ) -> Result<RecordStream> {
        options.validate()?;

        let mut query = vec![("cursor".to_string(), cursor.to_string())];
        if let Some(timeout) = timeout {
            query.push(("timeout".to_string(), timeout_secs(timeout)));
        }
        options.append_query(&mut query);

        let bytes = self.client.open_stream("/delta/streaming", &query).await?;
        Ok(frame_records(bytes))
    }

    pub async fn stream(
        &self,
        cursor: &Cursor,
        options: &DeltaOptions,
        timeout: Option<Duration>,
    ) -> Result<Vec<DeltaRecord>> {
        self.stream_with(cursor, options, timeout, |_| {}).await
    }

    /// Stream deltas, calling `on_delta` once per record before the next is read.
    ///
    /// Ends when the server closes the response or `timeout` elapses; either
    /// way everything received so far is returned.
    pub async fn stream_with<F>(
        &self,
        cursor: &Cursor,
        options: &DeltaOptions,
        timeout: Option<Duration>,
        mut on_delta: F,
    ) -> Result<Vec<DeltaRecord>>
    where
        F: FnMut(&DeltaRecord) + Send,
    {
        options.validate()?;

        let mut records = Vec::new();
        let run = async {
            let mut stream = self.open_stream_records(cursor, options, timeout).await?;
            while let Some(record) = stream.next().await {
                let record = record?;
                on_delta(&record);
                records.push(record);
            }
            Ok::<(), NylasError>(())
        };

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result?,
                Err(_) => info!("Delta stream reached its {:?} timeout", limit),
            },
            None => run.await?,
        }

        debug!("Delta stream finished with {} records", records.len());
        Ok(records)
    }

    pub async fn longpoll(
        &self,
        cursor: &Cursor,
        timeout: Duration,
        options: &DeltaOptions,
    ) -> Result<LongPoll> {
        self.longpoll_with(cursor, timeout, options, |_| {}).await
    }

    /// Wait up to `timeout` for the next batch after `cursor`.
    ///
    /// A deadline expiry is not an error: the result comes back with
    /// `timed_out` set and no envelope. `on_envelope` runs at most once.
    pub async fn longpoll_with<F>(
        &self,
        cursor: &Cursor,
        timeout: Duration,
        options: &DeltaOptions,
        mut on_envelope: F,
    ) -> Result<LongPoll>
    where
        F: FnMut(&DeltaEnvelope) + Send,
    {
        options.validate()?;

        let mut query = vec![
            ("cursor".to_string(), cursor.to_string()),
            ("timeout".to_string(), timeout_secs(timeout)),
        ];
        options.append_query(&mut query);

        let deadline = Instant::now() + timeout + self.longpoll_grace;
        let run = async {
            let bytes = self.client.open_stream("/delta/longpoll", &query).await?;
            read_envelope(bytes).await
        };

        let result = match tokio::time::timeout_at(deadline, run).await {
            Ok(envelope) => LongPoll {
                envelope: envelope?,
                timed_out: false,
            },
            Err(_) => {
                info!("Long-poll from cursor {} timed out", cursor);
                LongPoll {
                    envelope: None,
                    timed_out: true,
                }
            }
        };

        if let Some(envelope) = &result.envelope {
            debug!("Long-poll returned {} deltas", envelope.len());
            on_envelope(envelope);
        }
        Ok(result)
    }
}

/// Split a byte stream into newline-delimited records.
///
/// Blank lines are skipped. A complete line that does not parse is logged and
/// dropped. An unterminated final line is parsed only if the transport closes
/// cleanly.
pub fn frame_records(mut bytes: ByteStream) -> RecordStream {
    Box::pin(async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        let mut failed = false;

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    failed = true;
                    yield Err(e);
                    break;
                }
            };
            buffer.extend_from_slice(&chunk);

            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                if let Some(record) = parse_line(&line) {
                    yield Ok(record);
                }
            }
        }

        if !failed {
            if let Some(record) = parse_line(&buffer) {
                yield Ok(record);
            }
        }
    })
}

fn parse_line(line: &[u8]) -> Option<DeltaRecord> {
    let line = trim_ascii_whitespace(line);
    if line.is_empty() {
        return None;
    }

    match DeltaRecord::from_slice(line) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("Skipping undecodable delta frame: {}", e);
            None
        }
    }
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Accumulates long-poll chunks until they form one JSON document
#[derive(Debug, Default)]
pub struct EnvelopeBuffer {
    buffer: Vec<u8>,
}

impl EnvelopeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and try to parse everything received so far.
    ///
    /// `Ok(None)` means the document is still incomplete. Once the bytes form
    /// valid JSON, any envelope validation error is returned as-is.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<DeltaEnvelope>> {
        self.buffer.extend_from_slice(chunk);
        match serde_json::from_slice::<Value>(&self.buffer) {
            Ok(value) => DeltaEnvelope::from_value(value).map(Some),
            Err(_) => Ok(None),
        }
    }

    pub fn is_empty(&self) -> bool {
        trim_ascii_whitespace(&self.buffer).is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }
}

/// Read until the first complete envelope or the end of the body
async fn read_envelope(mut bytes: ByteStream) -> Result<Option<DeltaEnvelope>> {
    let mut buffer = EnvelopeBuffer::new();

    while let Some(chunk) = bytes.next().await {
        if let Some(envelope) = buffer.push(&chunk?)? {
            return Ok(Some(envelope));
        }
    }

    if buffer.is_empty() {
        return Ok(None);
    }
    Err(NylasError::MalformedEnvelope(format!(
        "long-poll body ended after {} bytes without a complete envelope",
        buffer.len()
    )))
}
