use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use quotemail_core::model::MAX_SUBJECT_LEN;
use quotemail_core::threading::resolve_parent;
use quotemail_core::{AttachmentPolicy, MailError, Message, MessageStatus, MessageStore};

use crate::smtp::{DeliveryContext, OutgoingMail, OutboundTransport};

/// Capped exponential backoff: base delay doubling per attempt, optional
/// additive jitter up to 25%.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

/// Outcome of a failed attempt, as decided by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Retrying { next_delay: Duration },
    Exhausted,
}

impl RetryPolicy {
    /// Delay before the attempt after `attempt` (1-based) failed.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let exponential = self.base_delay.saturating_mul(1u32 << shift);
        let capped = exponential.min(self.max_delay);
        if self.jitter {
            let factor = rand::rng().random_range(1.0..1.25);
            capped.mul_f64(factor).min(self.max_delay.mul_f64(1.25))
        } else {
            capped
        }
    }

    pub fn after_failure(&self, attempt: u32) -> Attempt {
        if attempt >= self.max_attempts {
            Attempt::Exhausted
        } else {
            Attempt::Retrying {
                next_delay: self.backoff_delay(attempt),
            }
        }
    }
}

/// Best-effort, non-durable queue of sends that exhausted their retries.
/// Oldest entries are dropped when full; nothing here survives a restart.
pub struct FailureQueue {
    entries: Mutex<VecDeque<OutgoingMail>>,
    capacity: usize,
}

impl FailureQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn push(&self, mail: OutgoingMail) {
        let mut entries = self.entries.lock().expect("failure queue poisoned");
        if entries.len() >= self.capacity {
            if let Some(dropped) = entries.pop_front() {
                warn!(to = %dropped.to_email, "failure queue full, dropping oldest entry");
            }
        }
        entries.push_back(mail);
    }

    pub fn drain(&self) -> Vec<OutgoingMail> {
        let mut entries = self.entries.lock().expect("failure queue poisoned");
        entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("failure queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub message: Message,
    pub attempts: u32,
}

/// Validates, resolves threading, drives the retry loop and persists exactly
/// one `sent` record per successful delivery.
pub struct Dispatcher {
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn OutboundTransport>,
    policy: AttachmentPolicy,
    retry: RetryPolicy,
    failed: FailureQueue,
}

pub const FAILURE_QUEUE_CAPACITY: usize = 32;

impl Dispatcher {
    pub fn new(store: Arc<dyn MessageStore>, transport: Arc<dyn OutboundTransport>) -> Self {
        Self::with_policies(store, transport, AttachmentPolicy::default(), RetryPolicy::default())
    }

    pub fn with_policies(
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn OutboundTransport>,
        policy: AttachmentPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            transport,
            policy,
            retry,
            failed: FailureQueue::new(FAILURE_QUEUE_CAPACITY),
        }
    }

    pub fn failure_queue(&self) -> &FailureQueue {
        &self.failed
    }

    pub async fn send(&self, mail: OutgoingMail) -> Result<DeliveryReceipt, MailError> {
        // Input validation first — a rejected send must never consume a
        // retry attempt or touch the transport.
        validate_input(&mail)?;
        self.policy.validate(&mail.attachments)?;

        let sender = self.transport.sender()?;

        // Settle thread linkage before the first attempt.
        let parent = resolve_parent(
            self.store.as_ref(),
            mail.parent_id.as_deref(),
            &[],
        )
        .await?;

        let record_id = Uuid::new_v4().to_string();
        let thread_id = mail
            .thread_id
            .clone()
            .or_else(|| parent.as_ref().map(|p| p.thread_id.clone()))
            .unwrap_or_else(|| record_id.clone());

        let ctx = DeliveryContext {
            message_id: format!("<{}@{}>", record_id, sender_domain(&sender)),
            in_reply_to: parent
                .as_ref()
                .and_then(|p| p.message_id.clone())
                .map(|mid| format!("<{}>", mid.trim_matches(['<', '>']))),
            from: sender.clone(),
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.transport.deliver(&mail, &ctx).await {
                Ok(()) => break,
                Err(e) if e.is_transient() => {
                    self.transport.invalidate().await;
                    match self.retry.after_failure(attempt) {
                        Attempt::Retrying { next_delay } => {
                            warn!(
                                to = %mail.to_email,
                                attempt,
                                delay_ms = next_delay.as_millis() as u64,
                                "transient send failure, backing off: {}",
                                e
                            );
                            tokio::time::sleep(next_delay).await;
                        }
                        Attempt::Exhausted => {
                            warn!(to = %mail.to_email, attempts = attempt, "send exhausted retries, queueing");
                            self.failed.push(mail.clone());
                            return Err(MailError::DeliveryFailed {
                                attempts: attempt,
                                source: Box::new(e),
                            });
                        }
                    }
                }
                // Permanent rejection by the server: a terminal delivery
                // failure, not retried and not re-queued.
                Err(e @ MailError::Transport { .. }) => {
                    return Err(MailError::DeliveryFailed {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                // Validation/configuration problems pass through untouched.
                Err(e) => return Err(e),
            }
        }

        let mut record = Message::new(MessageStatus::Sent);
        record.id = record_id.clone();
        record.thread_id = thread_id;
        record.parent_id = parent.as_ref().map(|p| p.id.clone());
        record.message_id = Some(
            ctx.message_id
                .trim_matches(['<', '>'])
                .to_string(),
        );
        record.subject = mail.subject.clone();
        record.body = mail.body.clone();
        record.from_email = sender;
        record.to_email = mail.to_email.clone();
        record.is_read = true; // self-authored
        record.attachments = mail.attachments.clone();

        let message = self.store.insert(record).await?;
        info!(id = %message.id, to = %message.to_email, attempts = attempt, "message sent");

        Ok(DeliveryReceipt {
            message,
            attempts: attempt,
        })
    }

    /// Re-attempt everything in the failure queue. Entries that fail again
    /// are re-queued by `send` itself. Returns the number delivered.
    pub async fn retry_queued(&self) -> usize {
        let pending = self.failed.drain();
        if pending.is_empty() {
            return 0;
        }
        info!("re-attempting {} queued send(s)", pending.len());

        let mut delivered = 0;
        for mail in pending {
            match self.send(mail).await {
                Ok(_) => delivered += 1,
                Err(e) => warn!("queued send failed again: {}", e),
            }
        }
        delivered
    }
}

fn validate_input(mail: &OutgoingMail) -> Result<(), MailError> {
    let trimmed = mail.to_email.trim();
    if trimmed.is_empty() {
        return Err(MailError::Validation("recipient address is required".into()));
    }
    match mailparse::addrparse(trimmed) {
        Ok(addrs) if !addrs.is_empty() => {}
        _ => {
            return Err(MailError::Validation(format!(
                "malformed recipient address: {}",
                trimmed
            )))
        }
    }
    if !trimmed.contains('@') {
        return Err(MailError::Validation(format!(
            "malformed recipient address: {}",
            trimmed
        )));
    }

    if mail.subject.trim().is_empty() {
        return Err(MailError::Validation("subject is required".into()));
    }
    if mail.subject.len() > MAX_SUBJECT_LEN {
        return Err(MailError::Validation(format!(
            "subject exceeds {} characters",
            MAX_SUBJECT_LEN
        )));
    }
    if mail.body.trim().is_empty() {
        return Err(MailError::Validation("body is required".into()));
    }
    Ok(())
}

fn sender_domain(sender: &str) -> &str {
    match sender.rsplit_once('@') {
        Some((_, domain)) if !domain.is_empty() => domain,
        _ => "localhost",
    }
}
