//! Conversation affinity: (tenant sender id, end-user) -> remote dialogue context.
//!
//! Creation is serialized per key so two jobs for the same end-user can never end up
//! with two contexts. The in-process lock covers the remote create; the unique
//! constraint on the table covers other processes sharing the database.

use crate::assistant::{AssistantApi, AssistantError};
use crate::conversation::Conversation;
use crate::store::{Database, StoreError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Key of a conversation: tenant sender id + end-user id.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ConversationKey {
    pub sender_id: String,
    pub end_user: String,
}

impl ConversationKey {
    pub fn new(sender_id: impl Into<String>, end_user: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            end_user: end_user.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AffinityError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Assistant(#[from] AssistantError),
}

/// Per-key async locks; entries are dropped once nobody holds or waits on them.
#[derive(Default)]
struct KeyLocks {
    inner: std::sync::Mutex<HashMap<ConversationKey, Arc<Mutex<()>>>>,
}

/// Held lock on one conversation key.
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: ConversationKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self
            .locks
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if map
            .get(&self.key)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            map.remove(&self.key);
        }
    }
}

impl KeyLocks {
    async fn acquire(&self, key: &ConversationKey) -> KeyGuard<'_> {
        let mutex = {
            let mut map = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            map.entry(key.clone()).or_default().clone()
        };
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Affinity store shared by workers and the reaper.
pub struct AffinityStore {
    db: Database,
    assistant: Arc<dyn AssistantApi>,
    locks: KeyLocks,
}

impl AffinityStore {
    pub fn new(db: Database, assistant: Arc<dyn AssistantApi>) -> Self {
        Self {
            db,
            assistant,
            locks: KeyLocks::default(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Exclusive access to one key, e.g. for purging a conversation.
    pub async fn lock(&self, key: &ConversationKey) -> KeyGuard<'_> {
        self.locks.acquire(key).await
    }

    /// Existing conversation for the key, or a new one with a freshly created remote context.
    pub async fn get_or_create(&self, key: &ConversationKey) -> Result<Conversation, AffinityError> {
        if let Some(existing) = self.db.find_conversation(&key.sender_id, &key.end_user).await? {
            return Ok(existing);
        }
        let _guard = self.locks.acquire(key).await;
        // Another job may have created it while we waited.
        if let Some(existing) = self.db.find_conversation(&key.sender_id, &key.end_user).await? {
            return Ok(existing);
        }
        let context_id = self.assistant.create_context().await?;
        let (conversation, created) = self
            .db
            .insert_conversation_or_fetch(&key.sender_id, &key.end_user, &context_id, Utc::now())
            .await?;
        if created {
            log::info!(
                "affinity: new conversation {} for {}/{}",
                conversation.id,
                key.sender_id,
                key.end_user
            );
        } else {
            log::warn!(
                "affinity: lost creation race for {}/{}, closing orphan context",
                key.sender_id,
                key.end_user
            );
            if let Err(e) = self.assistant.close_context(&context_id).await {
                log::debug!("affinity: closing orphan context failed: {}", e);
            }
        }
        Ok(conversation)
    }

    /// Mark user-visible progress on the conversation.
    pub async fn touch(&self, key: &ConversationKey, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.db
            .touch_conversation(&key.sender_id, &key.end_user, now)
            .await
    }

    /// Remove the conversation and its messages. Returns the number of messages removed,
    /// or None when there was no conversation.
    pub async fn delete(&self, key: &ConversationKey) -> Result<Option<usize>, StoreError> {
        let _guard = self.locks.acquire(key).await;
        match self.db.find_conversation(&key.sender_id, &key.end_user).await? {
            Some(conversation) => Ok(Some(self.db.delete_conversation(conversation.id).await?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::RunSnapshot;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Slow context creation to widen the race window.
    #[derive(Default)]
    struct CountingContexts {
        created: AtomicUsize,
    }

    #[async_trait]
    impl AssistantApi for CountingContexts {
        async fn create_context(&self) -> Result<String, AssistantError> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(format!("thread_{}", n))
        }

        async fn append_message(&self, _: &str, _: &str) -> Result<(), AssistantError> {
            Ok(())
        }

        async fn submit_run(&self, _: &str, _: &str) -> Result<RunSnapshot, AssistantError> {
            unimplemented!()
        }

        async fn poll_run(&self, _: &str, _: &str) -> Result<RunSnapshot, AssistantError> {
            unimplemented!()
        }

        async fn latest_reply(&self, _: &str) -> Result<Option<String>, AssistantError> {
            Ok(None)
        }

        async fn close_context(&self, _: &str) -> Result<(), AssistantError> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_get_or_create_yields_one_context() {
        let api = Arc::new(CountingContexts::default());
        let store = Arc::new(AffinityStore::new(
            Database::open_in_memory().unwrap(),
            api.clone(),
        ));
        let key = ConversationKey::new("pn1", "u1");
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store.get_or_create(&key).await.unwrap().context_id
            }));
        }
        let mut contexts = Vec::new();
        for h in handles {
            contexts.push(h.await.unwrap());
        }
        contexts.dedup();
        assert_eq!(contexts.len(), 1);
        assert_eq!(api.created.load(Ordering::SeqCst), 1);
        assert_eq!(store.locks.len(), 0);
    }

    #[tokio::test]
    async fn delete_forgets_the_context() {
        let api = Arc::new(CountingContexts::default());
        let store = AffinityStore::new(Database::open_in_memory().unwrap(), api.clone());
        let key = ConversationKey::new("pn1", "u1");
        let first = store.get_or_create(&key).await.unwrap();
        assert_eq!(store.delete(&key).await.unwrap(), Some(0));
        assert_eq!(store.delete(&key).await.unwrap(), None);
        let second = store.get_or_create(&key).await.unwrap();
        assert_ne!(first.context_id, second.context_id);
    }
}
