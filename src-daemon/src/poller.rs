use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use quotemail_core::threading::resolve_parent;
use quotemail_core::{
    AttachmentPolicy, MailError, Message, MessageStatus, MessageStore, ParsedInbound,
};

use crate::imap::InboundSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Another poll was already in flight; this tick did nothing.
    Skipped,
    Completed {
        fetched: usize,
        persisted: usize,
        skipped: usize,
    },
}

/// Pulls unseen inbound messages on a timer, parses them, resolves their
/// thread and persists one `inbox` record per message. Runs never overlap;
/// per-message failures are contained.
pub struct Poller {
    source: Arc<dyn InboundSource>,
    store: Arc<dyn MessageStore>,
    policy: AttachmentPolicy,
    in_flight: AtomicBool,
    timer: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl Poller {
    pub fn new(source: Arc<dyn InboundSource>, store: Arc<dyn MessageStore>) -> Self {
        Self::with_policy(source, store, AttachmentPolicy::default())
    }

    pub fn with_policy(
        source: Arc<dyn InboundSource>,
        store: Arc<dyn MessageStore>,
        policy: AttachmentPolicy,
    ) -> Self {
        Self {
            source,
            store,
            policy,
            in_flight: AtomicBool::new(false),
            timer: Mutex::new(None),
        }
    }

    /// One poll cycle. Reentrancy-guarded: if a cycle is already running
    /// this call is a no-op (no duplicate mailbox open, no duplicate
    /// records).
    pub async fn poll_once(&self) -> Result<PollOutcome, MailError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("poll already in flight, skipping tick");
            return Ok(PollOutcome::Skipped);
        }

        let result = self.run_cycle().await;
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn run_cycle(&self) -> Result<PollOutcome, MailError> {
        // A connection-level failure aborts the whole cycle; the guard is
        // released by poll_once and the next tick retries.
        let batch = self.source.fetch_unseen().await?;
        let fetched = batch.len();
        if fetched == 0 {
            return Ok(PollOutcome::Completed {
                fetched: 0,
                persisted: 0,
                skipped: 0,
            });
        }

        let mut persisted = 0;
        let mut skipped = 0;

        for raw in batch {
            match self.ingest(raw.uid, &raw.body).await {
                Ok(true) => persisted += 1,
                Ok(false) => skipped += 1,
                // Malformed single messages must not abort the batch.
                Err(e) => {
                    warn!(uid = raw.uid, "skipping inbound message: {}", e);
                    skipped += 1;
                }
            }
        }

        info!(fetched, persisted, skipped, "poll cycle complete");
        Ok(PollOutcome::Completed {
            fetched,
            persisted,
            skipped,
        })
    }

    /// Returns Ok(true) if a record was persisted, Ok(false) for an already
    /// known message.
    async fn ingest(&self, uid: u32, raw: &[u8]) -> Result<bool, MailError> {
        let parsed = ParsedInbound::from_rfc822(raw)?;

        // The attachment caps gate persistence on this path too: a message
        // that violates them is skipped like a malformed one, never stored.
        self.policy.validate(&parsed.attachments)?;

        // A crash between persist and mark_seen re-fetches the message on
        // the next cycle; the Message-ID check keeps ingestion idempotent.
        if let Some(ref message_id) = parsed.message_id {
            if self.store.find_by_message_id(message_id).await?.is_some() {
                debug!(uid, message_id, "already ingested, re-marking seen");
                if let Err(e) = self.source.mark_seen(uid).await {
                    warn!(uid, "failed to mark duplicate seen: {}", e);
                }
                return Ok(false);
            }
        }

        let chain = parsed.reference_chain();
        let parent = resolve_parent(self.store.as_ref(), None, &chain).await?;

        let mut record = Message::new(MessageStatus::Inbox);
        if let Some(ref parent) = parent {
            record.thread_id = parent.thread_id.clone();
            record.parent_id = Some(parent.id.clone());
        }
        record.message_id = parsed.message_id.clone();
        record.subject = parsed.subject.clone();
        record.body = parsed.text.clone().unwrap_or_default();
        record.from_email = parsed.from.address.clone();
        record.to_email = parsed
            .to
            .first()
            .map(|a| a.address.clone())
            .unwrap_or_default();
        record.attachments = parsed.attachments.clone();
        if let Some(date) = parsed.date {
            record.created_at = date;
        }

        let message = self.store.insert(record).await?;
        debug!(uid, id = %message.id, thread = %message.thread_id, "inbound message persisted");

        if let Err(e) = self.source.mark_seen(uid).await {
            // Leaving the flag unset only risks a duplicate fetch, which the
            // Message-ID check absorbs.
            warn!(uid, "failed to mark message seen: {}", e);
        }

        Ok(true)
    }

    /// Start the recurring timer. The first cycle runs after one interval.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut timer = self.timer.lock().expect("poller timer poisoned");
        if timer.is_some() {
            warn!("polling already started");
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        let poller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // interval fires immediately; consume that first tick.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = poller.poll_once().await {
                            warn!("poll cycle failed: {}", e);
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("inbound polling stopped");
        });

        *timer = Some((tx, handle));
        info!("inbound polling every {:?}", interval);
    }

    /// Cancel the pending timer. An in-flight cycle finishes first; this
    /// waits for it.
    pub async fn stop(&self) {
        let taken = self.timer.lock().expect("poller timer poisoned").take();
        if let Some((tx, handle)) = taken {
            let _ = tx.send(true);
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::RawInbound;
    use async_trait::async_trait;
    use quotemail_core::MemoryStore;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Notify;

    fn raw_message(message_id: &str, in_reply_to: Option<&str>) -> Vec<u8> {
        let mut headers = format!(
            "From: anna@client.example\r\nTo: sales@quotedesk.example\r\n\
Subject: Offer talk\r\nMessage-ID: <{}>\r\n",
            message_id
        );
        if let Some(parent) = in_reply_to {
            headers.push_str(&format!("In-Reply-To: <{}>\r\n", parent));
        }
        headers.push_str("\r\nSounds good.\r\n");
        headers.into_bytes()
    }

    /// Mailbox double: unseen set shrinks as messages are marked seen.
    #[derive(Default)]
    struct FakeInbox {
        messages: Mutex<Vec<RawInbound>>,
        seen: Mutex<HashSet<u32>>,
        opens: AtomicU32,
        hold: Option<Arc<Notify>>,
    }

    impl FakeInbox {
        fn with_messages(messages: Vec<RawInbound>) -> Self {
            Self {
                messages: Mutex::new(messages),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl InboundSource for FakeInbox {
        async fn fetch_unseen(&self) -> Result<Vec<RawInbound>, MailError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if let Some(ref hold) = self.hold {
                hold.notified().await;
            }
            let seen = self.seen.lock().unwrap().clone();
            Ok(self
                .messages
                .lock()
                .unwrap()
                .iter()
                .filter(|m| !seen.contains(&m.uid))
                .cloned()
                .collect())
        }

        async fn mark_seen(&self, uid: u32) -> Result<(), MailError> {
            self.seen.lock().unwrap().insert(uid);
            Ok(())
        }
    }

    #[tokio::test]
    async fn persists_unseen_messages_as_inbox_unread() {
        let inbox = Arc::new(FakeInbox::with_messages(vec![RawInbound {
            uid: 1,
            body: raw_message("m1@client", None),
        }]));
        let store = Arc::new(MemoryStore::new());
        let poller = Poller::new(inbox, store.clone());

        let outcome = poller.poll_once().await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Completed {
                fetched: 1,
                persisted: 1,
                skipped: 0
            }
        );

        let page = store
            .list(1, 10, quotemail_core::SortField::CreatedAt, quotemail_core::SortOrder::Desc)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].status, MessageStatus::Inbox);
        assert!(!page[0].is_read);
        assert_eq!(page[0].from_email, "anna@client.example");
    }

    #[tokio::test]
    async fn reply_joins_existing_thread_unknown_reference_starts_new() {
        let inbox = Arc::new(FakeInbox::with_messages(vec![
            RawInbound {
                uid: 1,
                body: raw_message("a@client", None),
            },
            RawInbound {
                uid: 2,
                body: raw_message("b@client", Some("a@client")),
            },
            RawInbound {
                uid: 3,
                body: raw_message("c@client", Some("ghost@nowhere")),
            },
        ]));
        let store = Arc::new(MemoryStore::new());
        let poller = Poller::new(inbox, store.clone());

        poller.poll_once().await.unwrap();

        let a = store.find_by_message_id("a@client").await.unwrap().unwrap();
        let b = store.find_by_message_id("b@client").await.unwrap().unwrap();
        let c = store.find_by_message_id("c@client").await.unwrap().unwrap();

        assert_eq!(b.thread_id, a.thread_id);
        assert_eq!(b.parent_id.as_deref(), Some(a.id.as_str()));
        assert_ne!(c.thread_id, a.thread_id);
        assert_eq!(c.thread_id, c.id);
    }

    #[tokio::test]
    async fn overlapping_poll_is_skipped() {
        let hold = Arc::new(Notify::new());
        let inbox = Arc::new(FakeInbox {
            messages: Mutex::new(vec![RawInbound {
                uid: 1,
                body: raw_message("m1@client", None),
            }]),
            hold: Some(hold.clone()),
            ..Default::default()
        });
        let store = Arc::new(MemoryStore::new());
        let poller = Arc::new(Poller::new(inbox.clone(), store.clone()));

        let first = {
            let poller = Arc::clone(&poller);
            tokio::spawn(async move { poller.poll_once().await })
        };
        // Let the first poll reach the (held) mailbox open.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = poller.poll_once().await.unwrap();
        assert_eq!(second, PollOutcome::Skipped);
        assert_eq!(inbox.opens.load(Ordering::SeqCst), 1);

        hold.notify_one();
        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, PollOutcome::Completed { persisted: 1, .. }));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn second_poll_with_no_new_mail_persists_nothing() {
        let inbox = Arc::new(FakeInbox::with_messages(vec![RawInbound {
            uid: 1,
            body: raw_message("m1@client", None),
        }]));
        let store = Arc::new(MemoryStore::new());
        let poller = Poller::new(inbox, store.clone());

        poller.poll_once().await.unwrap();
        let outcome = poller.poll_once().await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Completed {
                fetched: 0,
                persisted: 0,
                skipped: 0
            }
        );
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_message_id_is_skipped_once() {
        // uid 1 and uid 2 carry the same Message-ID; one record results.
        let inbox = Arc::new(FakeInbox::with_messages(vec![
            RawInbound {
                uid: 1,
                body: raw_message("dup@client", None),
            },
            RawInbound {
                uid: 2,
                body: raw_message("dup@client", None),
            },
            RawInbound {
                uid: 3,
                body: raw_message("ok@client", None),
            },
        ]));
        let store = Arc::new(MemoryStore::new());
        let poller = Poller::new(inbox, store.clone());

        let outcome = poller.poll_once().await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Completed {
                fetched: 3,
                persisted: 2,
                skipped: 1
            }
        );
        assert_eq!(store.count().await.unwrap(), 2);
    }

    fn raw_with_attachments(message_id: &str, count: usize) -> Vec<u8> {
        let mut msg = format!(
            "From: anna@client.example\r\nTo: sales@quotedesk.example\r\n\
Subject: Bulky\r\nMessage-ID: <{}>\r\nMIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\r\n\
--b1\r\nContent-Type: text/plain\r\n\r\nSee attached.\r\n",
            message_id
        );
        for i in 0..count {
            msg.push_str(&format!(
                "--b1\r\nContent-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"part-{}.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\r\nJVBERi0xLjQ=\r\n",
                i
            ));
        }
        msg.push_str("--b1--\r\n");
        msg.into_bytes()
    }

    #[tokio::test]
    async fn attachment_cap_violation_is_skipped_not_persisted() {
        // 15 attachment parts against the default cap of 10.
        let inbox = Arc::new(FakeInbox::with_messages(vec![
            RawInbound {
                uid: 1,
                body: raw_with_attachments("bulky@client", 15),
            },
            RawInbound {
                uid: 2,
                body: raw_message("clean@client", None),
            },
        ]));
        let store = Arc::new(MemoryStore::new());
        let poller = Poller::new(inbox, store.clone());

        let outcome = poller.poll_once().await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Completed {
                fetched: 2,
                persisted: 1,
                skipped: 1
            }
        );
        assert!(store
            .find_by_message_id("bulky@client")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_by_message_id("clean@client")
            .await
            .unwrap()
            .is_some());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn custom_policy_is_enforced_on_inbound() {
        let policy = AttachmentPolicy {
            max_count: 1,
            ..Default::default()
        };
        let inbox = Arc::new(FakeInbox::with_messages(vec![RawInbound {
            uid: 1,
            body: raw_with_attachments("two@client", 2),
        }]));
        let store = Arc::new(MemoryStore::new());
        let poller = Poller::with_policy(inbox, store.clone(), policy);

        let outcome = poller.poll_once().await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Completed {
                fetched: 1,
                persisted: 0,
                skipped: 1
            }
        );
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn store_failure_on_one_message_does_not_abort_batch() {
        /// Rejects inserts for one Message-ID, delegates everything else.
        struct RejectingStore {
            inner: MemoryStore,
            poison: &'static str,
        }

        #[async_trait]
        impl MessageStore for RejectingStore {
            async fn insert(&self, message: Message) -> Result<Message, MailError> {
                if message.message_id.as_deref() == Some(self.poison) {
                    return Err(MailError::Store("row rejected".into()));
                }
                self.inner.insert(message).await
            }

            async fn get(&self, id: &str) -> Result<Option<Message>, MailError> {
                self.inner.get(id).await
            }

            async fn find_by_message_id(
                &self,
                message_id: &str,
            ) -> Result<Option<Message>, MailError> {
                self.inner.find_by_message_id(message_id).await
            }

            async fn update(
                &self,
                id: &str,
                status: Option<MessageStatus>,
                is_read: Option<bool>,
            ) -> Result<Message, MailError> {
                self.inner.update(id, status, is_read).await
            }

            async fn list(
                &self,
                page: u32,
                limit: u32,
                sort: quotemail_core::SortField,
                order: quotemail_core::SortOrder,
            ) -> Result<Vec<Message>, MailError> {
                self.inner.list(page, limit, sort, order).await
            }

            async fn count(&self) -> Result<u64, MailError> {
                self.inner.count().await
            }
        }

        let inbox = Arc::new(FakeInbox::with_messages(vec![
            RawInbound {
                uid: 1,
                body: raw_message("first@client", None),
            },
            RawInbound {
                uid: 2,
                body: raw_message("poison@client", None),
            },
            RawInbound {
                uid: 3,
                body: raw_message("last@client", None),
            },
        ]));
        let store = Arc::new(RejectingStore {
            inner: MemoryStore::new(),
            poison: "poison@client",
        });
        let poller = Poller::new(inbox.clone(), store.clone());

        let outcome = poller.poll_once().await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Completed {
                fetched: 3,
                persisted: 2,
                skipped: 1
            }
        );
        assert_eq!(store.count().await.unwrap(), 2);
        assert!(store
            .find_by_message_id("last@client")
            .await
            .unwrap()
            .is_some());
        // The rejected message keeps its unseen flag for the next cycle.
        assert!(!inbox.seen.lock().unwrap().contains(&2));
    }

    #[tokio::test]
    async fn connection_failure_releases_guard_for_next_tick() {
        struct BrokenInbox {
            calls: AtomicU32,
        }

        #[async_trait]
        impl InboundSource for BrokenInbox {
            async fn fetch_unseen(&self) -> Result<Vec<RawInbound>, MailError> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(MailError::transient("mailbox unreachable"))
                } else {
                    Ok(Vec::new())
                }
            }

            async fn mark_seen(&self, _uid: u32) -> Result<(), MailError> {
                Ok(())
            }
        }

        let store = Arc::new(MemoryStore::new());
        let poller = Poller::new(
            Arc::new(BrokenInbox {
                calls: AtomicU32::new(0),
            }),
            store,
        );

        assert!(poller.poll_once().await.is_err());
        // Guard released: the next tick polls again instead of skipping.
        let outcome = poller.poll_once().await.unwrap();
        assert!(matches!(outcome, PollOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn timer_polls_and_stop_cancels() {
        let inbox = Arc::new(FakeInbox::with_messages(vec![RawInbound {
            uid: 1,
            body: raw_message("m1@client", None),
        }]));
        let store = Arc::new(MemoryStore::new());
        let poller = Arc::new(Poller::new(inbox.clone(), store.clone()));

        poller.start(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        poller.stop().await;

        assert!(inbox.opens.load(Ordering::SeqCst) >= 1);
        assert_eq!(store.count().await.unwrap(), 1);

        let opens_after_stop = inbox.opens.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(inbox.opens.load(Ordering::SeqCst), opens_after_stop);
    }
}
