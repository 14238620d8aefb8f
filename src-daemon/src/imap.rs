use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, warn};

use quotemail_core::MailError;

use crate::connection::{ConnectionManager, ImapSession};

const INBOX: &str = "INBOX";

/// An unparsed message as fetched from the mailbox.
#[derive(Debug, Clone)]
pub struct RawInbound {
    pub uid: u32,
    pub body: Vec<u8>,
}

/// Seam between the poller and the mailbox protocol. The production
/// implementation is [`ImapInbox`]; tests use mocks.
#[async_trait]
pub trait InboundSource: Send + Sync {
    /// Fetch every currently-unseen message without marking it seen.
    async fn fetch_unseen(&self) -> Result<Vec<RawInbound>, MailError>;

    /// Flag a message seen once its record has been persisted.
    async fn mark_seen(&self, uid: u32) -> Result<(), MailError>;
}

/// async-imap backed inbox behind the connection lifecycle manager.
pub struct ImapInbox {
    connections: Arc<ConnectionManager>,
}

impl ImapInbox {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    async fn fetch_unseen_inner(session: &mut ImapSession) -> Result<Vec<RawInbound>, MailError> {
        session
            .select(INBOX)
            .await
            .map_err(|e| MailError::transient(format!("SELECT {} failed: {}", INBOX, e)))?;

        let mut uids: Vec<u32> = session
            .uid_search("UNSEEN")
            .await
            .map_err(|e| MailError::transient(format!("UID SEARCH UNSEEN failed: {}", e)))?
            .into_iter()
            .collect();
        uids.sort_unstable();

        if uids.is_empty() {
            debug!("no unseen messages");
            return Ok(Vec::new());
        }

        let uid_set = uids
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");

        // BODY.PEEK[] keeps the \Seen flag untouched until we have persisted
        // a record for the message.
        let fetch_stream = session
            .uid_fetch(&uid_set, "(UID BODY.PEEK[])")
            .await
            .map_err(|e| MailError::transient(format!("UID FETCH {} failed: {}", uid_set, e)))?;

        let mut fetches = Vec::new();
        for result in fetch_stream.collect::<Vec<_>>().await {
            match result {
                Ok(fetch) => fetches.push(fetch),
                Err(e) => warn!("errored FETCH response, skipping: {}", e),
            }
        }

        let mut messages = Vec::new();
        for fetch in &fetches {
            let uid = match fetch.uid {
                Some(uid) => uid,
                None => {
                    warn!("FETCH response without UID, skipping");
                    continue;
                }
            };
            match fetch.body() {
                Some(body) => messages.push(RawInbound {
                    uid,
                    body: body.to_vec(),
                }),
                None => warn!(uid, "FETCH response without body, skipping"),
            }
        }

        Ok(messages)
    }

    async fn mark_seen_inner(session: &mut ImapSession, uid: u32) -> Result<(), MailError> {
        session
            .select(INBOX)
            .await
            .map_err(|e| MailError::transient(format!("SELECT {} failed: {}", INBOX, e)))?;

        let _: Vec<_> = session
            .uid_store(uid.to_string(), "+FLAGS (\\Seen)")
            .await
            .map_err(|e| MailError::transient(format!("STORE \\Seen failed for {}: {}", uid, e)))?
            .collect::<Vec<_>>()
            .await;
        Ok(())
    }
}

#[async_trait]
impl InboundSource for ImapInbox {
    async fn fetch_unseen(&self) -> Result<Vec<RawInbound>, MailError> {
        let mut session = self.connections.acquire_inbound().await?;
        match Self::fetch_unseen_inner(&mut session).await {
            Ok(messages) => {
                self.connections.release_inbound(session).await;
                Ok(messages)
            }
            // Session state is suspect after a protocol error; drop it so
            // the next acquire reconnects.
            Err(e) => {
                let _ = session.logout().await;
                Err(e)
            }
        }
    }

    async fn mark_seen(&self, uid: u32) -> Result<(), MailError> {
        let mut session = self.connections.acquire_inbound().await?;
        match Self::mark_seen_inner(&mut session, uid).await {
            Ok(()) => {
                self.connections.release_inbound(session).await;
                Ok(())
            }
            Err(e) => {
                let _ = session.logout().await;
                Err(e)
            }
        }
    }
}
