//! Delta records, envelopes and typed resource resolution

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::OnceLock;

use crate::error::{NylasError, Result};
use crate::models::{Contact, Draft, Event, File, Folder, Label, Message, Thread};

/// Opaque server-issued position in the change stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Cursor {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Cursor {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for Cursor {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What happened to the referenced resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaEvent {
    Create,
    #[serde(alias = "modify")]
    Update,
    Delete,
}

impl DeltaEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaEvent::Create => "create",
            DeltaEvent::Update => "update",
            DeltaEvent::Delete => "delete",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(DeltaEvent::Create),
            "update" | "modify" => Some(DeltaEvent::Update),
            "delete" => Some(DeltaEvent::Delete),
            _ => None,
        }
    }
}

/// Server-side rendering of delta attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaView {
    /// Threads carry full message objects instead of ids
    Expanded,
}

impl DeltaView {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaView::Expanded => "expanded",
        }
    }
}

/// Resource type tag of a delta; unknown tags are preserved verbatim
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Contact,
    File,
    Message,
    Draft,
    Thread,
    Event,
    Folder,
    Label,
    Other(String),
}

impl ObjectType {
    /// The tags the client knows how to resolve into typed resources
    pub const KNOWN: [ObjectType; 8] = [
        ObjectType::Contact,
        ObjectType::File,
        ObjectType::Message,
        ObjectType::Draft,
        ObjectType::Thread,
        ObjectType::Event,
        ObjectType::Folder,
        ObjectType::Label,
    ];

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "contact" => ObjectType::Contact,
            "file" => ObjectType::File,
            "message" => ObjectType::Message,
            "draft" => ObjectType::Draft,
            "thread" => ObjectType::Thread,
            "event" => ObjectType::Event,
            "folder" => ObjectType::Folder,
            "label" => ObjectType::Label,
            other => ObjectType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ObjectType::Contact => "contact",
            ObjectType::File => "file",
            ObjectType::Message => "message",
            ObjectType::Draft => "draft",
            ObjectType::Thread => "thread",
            ObjectType::Event => "event",
            ObjectType::Folder => "folder",
            ObjectType::Label => "label",
            ObjectType::Other(tag) => tag,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, ObjectType::Other(_))
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ObjectType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ObjectType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(ObjectType::from_tag(&tag))
    }
}

/// Typed resource reconstructed from a delta's attributes
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedResource {
    Contact(Contact),
    File(File),
    Message(Message),
    Draft(Draft),
    Thread(Thread),
    Event(Event),
    Folder(Folder),
    Label(Label),
}

impl ResolvedResource {
    /// Select a constructor by tag. Unknown tags resolve to `None`.
    pub fn from_attributes(object: &ObjectType, attributes: &Value) -> Result<Option<Self>> {
        fn decode<T: serde::de::DeserializeOwned>(object: &ObjectType, attributes: &Value) -> Result<T> {
            T::deserialize(attributes).map_err(|e| {
                NylasError::MalformedRecord(format!("invalid {} attributes: {}", object, e))
            })
        }

        let resource = match object {
            ObjectType::Contact => ResolvedResource::Contact(decode(object, attributes)?),
            ObjectType::File => ResolvedResource::File(decode(object, attributes)?),
            ObjectType::Message => ResolvedResource::Message(decode(object, attributes)?),
            ObjectType::Draft => ResolvedResource::Draft(decode(object, attributes)?),
            ObjectType::Thread => ResolvedResource::Thread(decode(object, attributes)?),
            ObjectType::Event => ResolvedResource::Event(decode(object, attributes)?),
            ObjectType::Folder => ResolvedResource::Folder(decode(object, attributes)?),
            ObjectType::Label => ResolvedResource::Label(decode(object, attributes)?),
            ObjectType::Other(_) => return Ok(None),
        };
        Ok(Some(resource))
    }

    pub fn object_type(&self) -> ObjectType {
        match self {
            ResolvedResource::Contact(_) => ObjectType::Contact,
            ResolvedResource::File(_) => ObjectType::File,
            ResolvedResource::Message(_) => ObjectType::Message,
            ResolvedResource::Draft(_) => ObjectType::Draft,
            ResolvedResource::Thread(_) => ObjectType::Thread,
            ResolvedResource::Event(_) => ObjectType::Event,
            ResolvedResource::Folder(_) => ObjectType::Folder,
            ResolvedResource::Label(_) => ObjectType::Label,
        }
    }
}

/// Wire shape of one delta before required fields are checked
#[derive(Debug, Deserialize)]
struct RawDeltaRecord {
    id: Option<String>,
    cursor: Option<String>,
    event: Option<String>,
    object: Option<String>,
    attributes: Option<Value>,
}

/// One change event. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct DeltaRecord {
    id: String,
    cursor: Cursor,
    event: DeltaEvent,
    object: ObjectType,
    raw_attributes: Option<Value>,
    resolved: OnceLock<Option<ResolvedResource>>,
}

impl PartialEq for DeltaRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.cursor == other.cursor
            && self.event == other.event
            && self.object == other.object
            && self.raw_attributes == other.raw_attributes
    }
}

impl DeltaRecord {
    /// Parse one JSON frame
    pub fn parse(json: &str) -> Result<Self> {
        Self::from_slice(json.as_bytes())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| NylasError::MalformedRecord(format!("invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawDeltaRecord = serde_json::from_value(value)
            .map_err(|e| NylasError::MalformedRecord(e.to_string()))?;

        let id = raw.id.ok_or_else(|| missing_field("id"))?;
        let cursor = raw.cursor.ok_or_else(|| missing_field("cursor"))?;
        let event = raw.event.ok_or_else(|| missing_field("event"))?;
        let object = raw.object.ok_or_else(|| missing_field("object"))?;

        let event = DeltaEvent::parse(&event).ok_or_else(|| {
            NylasError::MalformedRecord(format!("unknown event '{}' on delta {}", event, id))
        })?;

        Ok(Self {
            id,
            cursor: Cursor::from(cursor),
            event,
            object: ObjectType::from_tag(&object),
            raw_attributes: raw.attributes.filter(|a| !a.is_null()),
            resolved: OnceLock::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn event(&self) -> DeltaEvent {
        self.event
    }

    pub fn object(&self) -> &ObjectType {
        &self.object
    }

    pub fn raw_attributes(&self) -> Option<&Value> {
        self.raw_attributes.as_ref()
    }

    /// Typed view of the attributes.
    ///
    /// `Ok(None)` when the tag is unrecognised or no attributes were sent.
    /// The first successful construction is cached for the record's lifetime.
    pub fn resolve(&self) -> Result<Option<&ResolvedResource>> {
        if let Some(cached) = self.resolved.get() {
            return Ok(cached.as_ref());
        }

        let built = match &self.raw_attributes {
            Some(attributes) => ResolvedResource::from_attributes(&self.object, attributes)?,
            None => None,
        };
        Ok(self.resolved.get_or_init(|| built).as_ref())
    }
}

fn missing_field(name: &str) -> NylasError {
    NylasError::MalformedRecord(format!("missing required field '{}'", name))
}

/// Wire shape of a batch before validation
#[derive(Debug, Deserialize)]
struct RawDeltaEnvelope {
    cursor_start: Option<String>,
    cursor_end: Option<String>,
    #[serde(default)]
    deltas: Option<Vec<Value>>,
}

/// A batch of deltas and the cursor range it spans
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaEnvelope {
    pub cursor_start: Cursor,
    /// Cursor to send on the next request
    pub cursor_end: Cursor,
    pub deltas: Vec<DeltaRecord>,
}

impl DeltaEnvelope {
    pub fn parse(json: &str) -> Result<Self> {
        Self::from_slice(json.as_bytes())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| NylasError::MalformedEnvelope(format!("invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawDeltaEnvelope = serde_json::from_value(value)
            .map_err(|e| NylasError::MalformedEnvelope(e.to_string()))?;

        let cursor_start = raw.cursor_start.ok_or_else(|| {
            NylasError::MalformedEnvelope("missing required field 'cursor_start'".to_string())
        })?;
        let cursor_end = raw.cursor_end.ok_or_else(|| {
            NylasError::MalformedEnvelope("missing required field 'cursor_end'".to_string())
        })?;

        let deltas = raw
            .deltas
            .unwrap_or_default()
            .into_iter()
            .map(DeltaRecord::from_value)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| NylasError::MalformedEnvelope(e.to_string()))?;

        Ok(Self {
            cursor_start: Cursor::from(cursor_start),
            cursor_end: Cursor::from(cursor_end),
            deltas,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }
}
