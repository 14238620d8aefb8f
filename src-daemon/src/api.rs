use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use quotemail_core::{MailError, Message, MessageStatus, MessageStore, SortField, SortOrder};

use crate::dispatcher::{DeliveryReceipt, Dispatcher};
use crate::smtp::OutgoingMail;

/// Fixed-window request limiter applied at the send boundary, so excess
/// requests are rejected before they reach the dispatcher and stay
/// distinguishable from delivery failures.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    state: Mutex<(Instant, u32)>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            state: Mutex::new((Instant::now(), 0)),
        }
    }

    pub fn check(&self) -> Result<(), MailError> {
        let mut state = self.state.lock().expect("rate limiter poisoned");
        let (window_start, count) = *state;
        let now = Instant::now();

        if now.duration_since(window_start) >= self.window {
            *state = (now, 1);
            return Ok(());
        }
        if count >= self.max_requests {
            return Err(MailError::RateLimited(format!(
                "more than {} requests in {:?}",
                self.max_requests, self.window
            )));
        }
        state.1 += 1;
        Ok(())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(30, Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub id: String,
    pub subject: String,
    pub from_email: String,
    pub to_email: String,
    pub status: MessageStatus,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Message> for MessageSummary {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id.clone(),
            subject: m.subject.clone(),
            from_email: m.from_email.clone(),
            to_email: m.to_email.clone(),
            status: m.status,
            is_read: m.is_read,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub items: Vec<MessageSummary>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub message: Message,
    pub attempts: u32,
}

impl From<DeliveryReceipt> for SendResponse {
    fn from(receipt: DeliveryReceipt) -> Self {
        Self {
            message: receipt.message,
            attempts: receipt.attempts,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRequest {
    pub status: Option<String>,
    pub is_read: Option<bool>,
}

/// Handlers behind the `/emails` resource. The HTTP framing itself lives in
/// the surrounding web application; it calls these with already-deserialized
/// payloads.
pub struct EmailApi {
    store: Arc<dyn MessageStore>,
    dispatcher: Arc<Dispatcher>,
    limiter: RateLimiter,
}

impl EmailApi {
    pub fn new(store: Arc<dyn MessageStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self::with_limiter(store, dispatcher, RateLimiter::default())
    }

    pub fn with_limiter(
        store: Arc<dyn MessageStore>,
        dispatcher: Arc<Dispatcher>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            store,
            dispatcher,
            limiter,
        }
    }

    /// GET /emails
    pub async fn list_messages(&self, query: ListQuery) -> Result<ListResponse, MailError> {
        let page = query.page.unwrap_or(1).max(1);
        let limit = query.limit.unwrap_or(20).clamp(1, 100);
        let sort = query
            .sort_by
            .as_deref()
            .and_then(SortField::parse)
            .unwrap_or(SortField::CreatedAt);
        let order = query
            .sort_order
            .as_deref()
            .and_then(SortOrder::parse)
            .unwrap_or(SortOrder::Desc);

        let items = self.store.list(page, limit, sort, order).await?;
        let total = self.store.count().await?;

        Ok(ListResponse {
            items: items.iter().map(MessageSummary::from).collect(),
            total,
            page,
            limit,
        })
    }

    /// POST /emails
    pub async fn send_message(&self, request: OutgoingMail) -> Result<SendResponse, MailError> {
        self.limiter.check()?;
        let receipt = self.dispatcher.send(request).await?;
        Ok(receipt.into())
    }

    /// PATCH /emails/:id — status and/or read flag only.
    pub async fn patch_message(&self, id: &str, patch: PatchRequest) -> Result<Message, MailError> {
        if patch.status.is_none() && patch.is_read.is_none() {
            return Err(MailError::Validation(
                "patch must set status and/or isRead".into(),
            ));
        }
        let status = patch.status.as_deref().map(MessageStatus::parse).transpose()?;
        self.store.update(id, status, patch.is_read).await
    }
}
