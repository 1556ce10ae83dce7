//! Typed resources carried inside delta records
//!
//! Every struct tolerates missing fields and keeps attributes it does not
//! model in a flattened `extra` map, so decoding never drops server data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name/email pair used for message and thread participants
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: String,
}

/// Typed email or phone entry on a contact
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactEmail {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhoneNumber {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub number: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub middle_name: Option<String>,
    #[serde(default)]
    pub surname: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub birthday: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub emails: Vec<ContactEmail>,
    #[serde(default)]
    pub phone_numbers: Vec<PhoneNumber>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct File {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub message_ids: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Folder or label reference as it appears embedded in messages and threads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Label {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub from: Vec<Participant>,
    #[serde(default)]
    pub to: Vec<Participant>,
    #[serde(default)]
    pub cc: Vec<Participant>,
    #[serde(default)]
    pub bcc: Vec<Participant>,
    #[serde(default)]
    pub reply_to: Vec<Participant>,
    /// Unix timestamp in seconds
    #[serde(default)]
    pub date: Option<i64>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub unread: Option<bool>,
    #[serde(default)]
    pub starred: Option<bool>,
    #[serde(default)]
    pub folder: Option<Folder>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub files: Vec<File>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        self.date.and_then(|secs| DateTime::from_timestamp(secs, 0))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub reply_to_message_id: Option<String>,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub to: Vec<Participant>,
    #[serde(default)]
    pub cc: Vec<Participant>,
    #[serde(default)]
    pub bcc: Vec<Participant>,
    #[serde(default)]
    pub date: Option<i64>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub files: Vec<File>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub message_ids: Vec<String>,
    #[serde(default)]
    pub draft_ids: Vec<String>,
    #[serde(default)]
    pub first_message_timestamp: Option<i64>,
    #[serde(default)]
    pub last_message_timestamp: Option<i64>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub unread: Option<bool>,
    #[serde(default)]
    pub starred: Option<bool>,
    #[serde(default)]
    pub folders: Vec<Folder>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Event timing, discriminated by the `object` key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object", rename_all = "lowercase")]
pub enum When {
    Time {
        time: i64,
    },
    Timespan {
        start_time: i64,
        end_time: i64,
    },
    Date {
        date: String,
    },
    Datespan {
        start_date: String,
        end_date: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventParticipant {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub calendar_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub busy: Option<bool>,
    #[serde(default)]
    pub read_only: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub participants: Vec<EventParticipant>,
    #[serde(default)]
    pub when: Option<When>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_contact_keeps_unmodelled_attributes() {
        let contact: Contact = serde_json::from_value(json!({
            "id": "c1",
            "given_name": "Ada",
            "emails": [{"type": "work", "email": "ada@example.com"}],
            "picture_url": "https://example.com/ada.png"
        }))
        .unwrap();

        assert_eq!(contact.given_name.as_deref(), Some("Ada"));
        assert_eq!(contact.emails[0].kind.as_deref(), Some("work"));
        assert_eq!(
            contact.extra.get("picture_url"),
            Some(&json!("https://example.com/ada.png"))
        );
    }

    #[test]
    fn test_event_when_variants() {
        let timespan: When =
            serde_json::from_value(json!({"object": "timespan", "start_time": 1, "end_time": 2}))
                .unwrap();
        assert_eq!(timespan, When::Timespan { start_time: 1, end_time: 2 });

        let date: When =
            serde_json::from_value(json!({"object": "date", "date": "2024-01-01"})).unwrap();
        assert_eq!(date, When::Date { date: "2024-01-01".to_string() });
    }

    #[test]
    fn test_message_received_at() {
        let message = Message {
            date: Some(1675098465),
            ..Default::default()
        };
        assert_eq!(message.received_at().unwrap().timestamp(), 1675098465);
        assert!(Message::default().received_at().is_none());
    }
}
