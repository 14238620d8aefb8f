use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::MailError;
use crate::model::{Message, MessageStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    CreatedAt,
    UpdatedAt,
    Subject,
}

impl SortField {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "createdAt" => Some(SortField::CreatedAt),
            "updatedAt" => Some(SortField::UpdatedAt),
            "subject" => Some(SortField::Subject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "asc" => Some(SortOrder::Asc),
            "desc" => Some(SortOrder::Desc),
            _ => None,
        }
    }
}

/// Persistence interface owned by the surrounding CRUD application. The mail
/// subsystem only ever inserts records, looks them up for thread resolution,
/// and applies status/read-flag updates.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: Message) -> Result<Message, MailError>;

    async fn get(&self, id: &str) -> Result<Option<Message>, MailError>;

    /// Lookup by RFC 5322 Message-ID (normalized, no angle brackets).
    async fn find_by_message_id(&self, message_id: &str) -> Result<Option<Message>, MailError>;

    /// Status and/or read-flag update. Touches `updated_at`, nothing else.
    async fn update(
        &self,
        id: &str,
        status: Option<MessageStatus>,
        is_read: Option<bool>,
    ) -> Result<Message, MailError>;

    /// 1-based page.
    async fn list(
        &self,
        page: u32,
        limit: u32,
        sort: SortField,
        order: SortOrder,
    ) -> Result<Vec<Message>, MailError>;

    async fn count(&self) -> Result<u64, MailError>;
}

/// In-memory store used by tests and the demo daemon.
#[derive(Default)]
pub struct MemoryStore {
    messages: RwLock<Vec<Message>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert(&self, message: Message) -> Result<Message, MailError> {
        let mut messages = self.messages.write().await;
        if messages.iter().any(|m| m.id == message.id) {
            return Err(MailError::Store(format!(
                "duplicate message id {}",
                message.id
            )));
        }
        messages.push(message.clone());
        Ok(message)
    }

    async fn get(&self, id: &str) -> Result<Option<Message>, MailError> {
        let messages = self.messages.read().await;
        Ok(messages.iter().find(|m| m.id == id).cloned())
    }

    async fn find_by_message_id(&self, message_id: &str) -> Result<Option<Message>, MailError> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .find(|m| m.message_id.as_deref() == Some(message_id))
            .cloned())
    }

    async fn update(
        &self,
        id: &str,
        status: Option<MessageStatus>,
        is_read: Option<bool>,
    ) -> Result<Message, MailError> {
        let mut messages = self.messages.write().await;
        let message = messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| MailError::NotFound(format!("message {}", id)))?;
        if let Some(status) = status {
            message.status = status;
        }
        if let Some(is_read) = is_read {
            message.is_read = is_read;
        }
        message.updated_at = Utc::now();
        Ok(message.clone())
    }

    async fn list(
        &self,
        page: u32,
        limit: u32,
        sort: SortField,
        order: SortOrder,
    ) -> Result<Vec<Message>, MailError> {
        let messages = self.messages.read().await;
        let mut sorted: Vec<Message> = messages.clone();
        sorted.sort_by(|a, b| {
            let ordering = match sort {
                SortField::CreatedAt => a.created_at.cmp(&b.created_at),
                SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
                SortField::Subject => a.subject.cmp(&b.subject),
            };
            match order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let page = page.max(1) as usize;
        let start = (page - 1) * limit as usize;
        Ok(sorted.into_iter().skip(start).take(limit as usize).collect())
    }

    async fn count(&self) -> Result<u64, MailError> {
        Ok(self.messages.read().await.len() as u64)
    }
}
