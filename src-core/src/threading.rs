use tracing::debug;

use crate::error::MailError;
use crate::model::Message;
use crate::parse::normalize_message_id;
use crate::store::MessageStore;

/// Find the stored message a new one replies to.
///
/// `parent_id` (a record id) wins over the `references` chain, which is
/// scanned newest-first against stored Message-IDs. `Ok(None)` means "no
/// resolvable parent" — the caller starts a new thread with the record's own
/// id. An unresolvable reference is never an error; it must not block
/// ingestion.
pub async fn resolve_parent(
    store: &dyn MessageStore,
    parent_id: Option<&str>,
    references: &[String],
) -> Result<Option<Message>, MailError> {
    if let Some(pid) = parent_id {
        match store.get(pid).await? {
            Some(parent) => return Ok(Some(parent)),
            None => debug!(parent_id = pid, "parent record not found, trying references"),
        }
    }

    for reference in references.iter().rev() {
        let normalized = normalize_message_id(reference);
        if normalized.is_empty() {
            continue;
        }
        if let Some(parent) = store.find_by_message_id(&normalized).await? {
            return Ok(Some(parent));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Message, MessageStatus};
    use crate::store::MemoryStore;

    fn stored(message_id: Option<&str>) -> Message {
        let mut m = Message::new(MessageStatus::Sent);
        m.message_id = message_id.map(str::to_string);
        m
    }

    #[tokio::test]
    async fn parent_record_id_wins() {
        let store = MemoryStore::new();
        let parent = store.insert(stored(Some("root@qd"))).await.unwrap();

        let found = resolve_parent(&store, Some(&parent.id), &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.thread_id, parent.thread_id);
    }

    #[tokio::test]
    async fn reference_resolves_to_stored_thread() {
        let store = MemoryStore::new();
        let a = store.insert(stored(Some("msg-a@client"))).await.unwrap();

        let refs = vec!["<msg-a@client>".to_string()];
        let found = resolve_parent(&store, None, &refs).await.unwrap().unwrap();
        assert_eq!(found.thread_id, a.thread_id);
    }

    #[tokio::test]
    async fn newest_reference_checked_first() {
        let store = MemoryStore::new();
        let old = store.insert(stored(Some("old@client"))).await.unwrap();
        let new = store.insert(stored(Some("new@client"))).await.unwrap();
        assert_ne!(old.thread_id, new.thread_id);

        let refs = vec!["old@client".to_string(), "new@client".to_string()];
        let found = resolve_parent(&store, None, &refs).await.unwrap().unwrap();
        assert_eq!(found.id, new.id);
    }

    #[tokio::test]
    async fn unknown_reference_is_not_an_error() {
        let store = MemoryStore::new();
        let refs = vec!["<ghost@nowhere>".to_string()];
        assert!(resolve_parent(&store, None, &refs).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_parent_falls_back_to_references() {
        let store = MemoryStore::new();
        let a = store.insert(stored(Some("kept@client"))).await.unwrap();

        let refs = vec!["kept@client".to_string()];
        let found = resolve_parent(&store, Some("deleted-id"), &refs)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, a.id);
    }
}
