//! Thread storage backends.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::ids::{MessageId, ThreadId};
use super::message::{ContextQuery, Thread, ThreadMessage};
use super::{ThreadError, ThreadResult};

#[async_trait::async_trait]
pub trait ThreadStore: Send + Sync {
    fn name(&self) -> &str;

    async fn create_thread(&self, thread: Thread) -> ThreadResult<Thread>;

    async fn get_thread(&self, id: &ThreadId) -> ThreadResult<Option<Thread>>;

    /// Appends a message; fails if the thread does not exist.
    async fn save_message(&self, message: ThreadMessage) -> ThreadResult<MessageId>;

    async fn get_message(&self, id: &MessageId) -> ThreadResult<Option<ThreadMessage>>;

    /// Removes a message. Removing an unknown id is not an error.
    async fn delete_message(&self, id: &MessageId) -> ThreadResult<()>;

    /// The most recent messages matching `query`, oldest first.
    async fn context_messages(&self, query: &ContextQuery) -> ThreadResult<Vec<ThreadMessage>>;
}

/// Checks that `user_id` may post to `thread_id`.
pub async fn authorize_thread_access(
    store: &dyn ThreadStore,
    user_id: &str,
    thread_id: &ThreadId,
) -> ThreadResult<Thread> {
    let thread = store
        .get_thread(thread_id)
        .await?
        .ok_or_else(|| ThreadError::NotFound {
            id: thread_id.to_string(),
        })?;

    if !thread.is_accessible_by(user_id) {
        return Err(ThreadError::AccessDenied {
            id: thread_id.to_string(),
        });
    }
    Ok(thread)
}

#[derive(Debug, Default)]
struct Inner {
    threads: HashMap<ThreadId, Thread>,
    messages: HashMap<MessageId, ThreadMessage>,
    /// Message ids per thread in insertion order.
    order: HashMap<ThreadId, Vec<MessageId>>,
}

/// In-memory thread store (for testing and single-instance deployments)
#[derive(Debug, Default, Clone)]
pub struct MemoryThreadStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn message_count(&self, thread_id: &ThreadId) -> usize {
        self.inner
            .read()
            .await
            .order
            .get(thread_id)
            .map_or(0, Vec::len)
    }

    pub async fn messages(&self, thread_id: &ThreadId) -> Vec<ThreadMessage> {
        let inner = self.inner.read().await;
        inner
            .order
            .get(thread_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.messages.get(id).cloned())
            .collect()
    }
}

#[async_trait::async_trait]
impl ThreadStore for MemoryThreadStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_thread(&self, thread: Thread) -> ThreadResult<Thread> {
        let mut inner = self.inner.write().await;
        inner.order.entry(thread.id).or_default();
        inner.threads.insert(thread.id, thread.clone());
        Ok(thread)
    }

    async fn get_thread(&self, id: &ThreadId) -> ThreadResult<Option<Thread>> {
        Ok(self.inner.read().await.threads.get(id).cloned())
    }

    async fn save_message(&self, message: ThreadMessage) -> ThreadResult<MessageId> {
        let mut inner = self.inner.write().await;
        if !inner.threads.contains_key(&message.thread_id) {
            return Err(ThreadError::NotFound {
                id: message.thread_id.to_string(),
            });
        }

        let id = message.id.clone();
        inner
            .order
            .entry(message.thread_id)
            .or_default()
            .push(id.clone());
        inner.messages.insert(id.clone(), message);
        Ok(id)
    }

    async fn get_message(&self, id: &MessageId) -> ThreadResult<Option<ThreadMessage>> {
        Ok(self.inner.read().await.messages.get(id).cloned())
    }

    async fn delete_message(&self, id: &MessageId) -> ThreadResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(message) = inner.messages.remove(id)
            && let Some(ids) = inner.order.get_mut(&message.thread_id)
        {
            ids.retain(|m| m != id);
        }
        Ok(())
    }

    async fn context_messages(&self, query: &ContextQuery) -> ThreadResult<Vec<ThreadMessage>> {
        let Some(thread_id) = query.thread_id else {
            return Ok(Vec::new());
        };

        let inner = self.inner.read().await;
        let Some(ids) = inner.order.get(&thread_id) else {
            return Ok(Vec::new());
        };

        let mut recent: Vec<ThreadMessage> = ids
            .iter()
            .rev()
            .filter_map(|id| inner.messages.get(id))
            .filter(|m| match query.user_id.as_deref() {
                Some(user) => m.user_id.as_deref() == Some(user),
                None => true,
            })
            .take(query.recent_messages)
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (MemoryThreadStore, ThreadId) {
        let store = MemoryThreadStore::new();
        let thread = store
            .create_thread(Thread::new(Some("alice".into())))
            .await
            .unwrap();
        for text in ["one", "two", "three"] {
            store
                .save_message(ThreadMessage::user(thread.id, Some("alice".into()), text))
                .await
                .unwrap();
        }
        (store, thread.id)
    }

    #[tokio::test]
    async fn test_context_window_is_most_recent_oldest_first() {
        let (store, thread_id) = seeded().await;

        let recent = store
            .context_messages(&ContextQuery::recent(Some(thread_id), 2))
            .await
            .unwrap();
        let texts: Vec<_> = recent.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["two", "three"]);
    }

    #[tokio::test]
    async fn test_context_filters_by_user() {
        let (store, thread_id) = seeded().await;
        store
            .save_message(ThreadMessage::user(thread_id, Some("bob".into()), "intruder"))
            .await
            .unwrap();

        let recent = store
            .context_messages(&ContextQuery::recent(Some(thread_id), 2).for_user(Some("alice")))
            .await
            .unwrap();
        assert!(recent.iter().all(|m| m.user_id.as_deref() == Some("alice")));
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn test_context_without_thread_is_empty() {
        let (store, _) = seeded().await;
        let recent = store
            .context_messages(&ContextQuery::recent(None, 2))
            .await
            .unwrap();
        assert!(recent.is_empty());

        let unknown = store
            .context_messages(&ContextQuery::recent(Some(ThreadId::new()), 2))
            .await
            .unwrap();
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn test_save_message_requires_thread() {
        let store = MemoryThreadStore::new();
        let err = store
            .save_message(ThreadMessage::user(ThreadId::new(), None, "lost"))
            .await
            .unwrap_err();
        assert!(matches!(err, ThreadError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_message() {
        let (store, thread_id) = seeded().await;
        let id = store
            .save_message(ThreadMessage::user(thread_id, Some("alice".into()), "four"))
            .await
            .unwrap();

        store.delete_message(&id).await.unwrap();
        assert!(store.get_message(&id).await.unwrap().is_none());
        assert_eq!(store.message_count(&thread_id).await, 3);

        let recent = store
            .context_messages(&ContextQuery::recent(Some(thread_id), 1))
            .await
            .unwrap();
        assert_eq!(recent[0].text, "three");

        store.delete_message(&MessageId::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_authorize_thread_access() {
        let (store, thread_id) = seeded().await;

        assert!(authorize_thread_access(&store, "alice", &thread_id).await.is_ok());
        assert!(matches!(
            authorize_thread_access(&store, "bob", &thread_id).await,
            Err(ThreadError::AccessDenied { .. })
        ));
        assert!(matches!(
            authorize_thread_access(&store, "alice", &ThreadId::new()).await,
            Err(ThreadError::NotFound { .. })
        ));
    }
}
