use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MailError;

/// Longest subject we accept (RFC 5322 line-length ceiling).
pub const MAX_SUBJECT_LEN: usize = 998;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Inbox,
    Sent,
    Draft,
    Archived,
    Trash,
}

impl MessageStatus {
    pub fn parse(value: &str) -> Result<Self, MailError> {
        match value {
            "inbox" => Ok(MessageStatus::Inbox),
            "sent" => Ok(MessageStatus::Sent),
            "draft" => Ok(MessageStatus::Draft),
            "archived" => Ok(MessageStatus::Archived),
            "trash" => Ok(MessageStatus::Trash),
            other => Err(MailError::Validation(format!(
                "unknown status '{}' (expected inbox|sent|draft|archived|trash)",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Inbox => "inbox",
            MessageStatus::Sent => "sent",
            MessageStatus::Draft => "draft",
            MessageStatus::Archived => "archived",
            MessageStatus::Trash => "trash",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub address: String,
}

impl Default for EmailAddress {
    fn default() -> Self {
        Self {
            name: None,
            address: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
    /// Base64-encoded content.
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
}

impl Attachment {
    /// Declared size if present, otherwise derived from the base64 payload.
    pub fn effective_size(&self) -> usize {
        self.size.unwrap_or_else(|| decoded_len(&self.content))
    }

    pub fn decode_content(&self) -> Result<Vec<u8>, MailError> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(self.content.trim())
            .map_err(|e| {
                MailError::Validation(format!(
                    "attachment '{}' has invalid base64 content: {}",
                    self.filename, e
                ))
            })
    }
}

/// Decoded byte length of a base64 payload without decoding it.
fn decoded_len(b64: &str) -> usize {
    let chars = b64.bytes().filter(|b| !b.is_ascii_whitespace()).count();
    let padding = b64
        .trim_end()
        .bytes()
        .rev()
        .take_while(|&b| b == b'=')
        .count();
    (chars / 4 * 3).saturating_sub(padding)
}

/// One sent or received email. Never hard-deleted; "deleting" moves the
/// status to `trash`. `thread_id` is always set — a thread root carries its
/// own id there.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub subject: String,
    pub body: String,
    pub from_email: String,
    pub to_email: String,
    pub status: MessageStatus,
    pub is_read: bool,
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// RFC 5322 Message-ID, kept so inbound References headers can be
    /// resolved against stored records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Fresh record with a new id, self-referential thread id and current
    /// timestamps. Callers adjust thread/parent linkage afterwards.
    pub fn new(status: MessageStatus) -> Self {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            thread_id: id.clone(),
            id,
            subject: String::new(),
            body: String::new(),
            from_email: String::new(),
            to_email: String::new(),
            status,
            is_read: false,
            parent_id: None,
            message_id: None,
            attachments: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}
