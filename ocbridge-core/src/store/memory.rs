//! In-memory repository implementation.
//!
//! Non-durable [`BridgeStore`] over plain maps. Backs service and relay
//! tests; everything is lost on drop.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::store::{BridgeStore, StorageError};

#[derive(Default)]
struct Inner {
    allowed: BTreeSet<i64>,
    admins: BTreeSet<i64>,
    links: BTreeMap<(i64, i64), String>,
    models: BTreeMap<String, String>,
}

/// Map-backed [`BridgeStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BridgeStore for MemoryStore {
    async fn upsert_allowed(&self, user_id: i64) -> Result<(), StorageError> {
        self.inner.lock().unwrap().allowed.insert(user_id);
        Ok(())
    }

    async fn remove_allowed(&self, user_id: i64) -> Result<bool, StorageError> {
        Ok(self.inner.lock().unwrap().allowed.remove(&user_id))
    }

    async fn allowed_contains(&self, user_id: i64) -> Result<bool, StorageError> {
        Ok(self.inner.lock().unwrap().allowed.contains(&user_id))
    }

    async fn list_allowed(&self) -> Result<Vec<i64>, StorageError> {
        Ok(self.inner.lock().unwrap().allowed.iter().copied().collect())
    }

    async fn upsert_admin(&self, user_id: i64) -> Result<(), StorageError> {
        self.inner.lock().unwrap().admins.insert(user_id);
        Ok(())
    }

    async fn admin_contains(&self, user_id: i64) -> Result<bool, StorageError> {
        Ok(self.inner.lock().unwrap().admins.contains(&user_id))
    }

    async fn list_admins(&self) -> Result<Vec<i64>, StorageError> {
        Ok(self.inner.lock().unwrap().admins.iter().copied().collect())
    }

    async fn get_session_link(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> Result<Option<String>, StorageError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .links
            .get(&(chat_id, user_id))
            .cloned())
    }

    async fn set_session_link(
        &self,
        chat_id: i64,
        user_id: i64,
        session_id: &str,
    ) -> Result<(), StorageError> {
        self.inner
            .lock()
            .unwrap()
            .links
            .insert((chat_id, user_id), session_id.to_string());
        Ok(())
    }

    async fn clear_session_link(&self, chat_id: i64, user_id: i64) -> Result<bool, StorageError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .links
            .remove(&(chat_id, user_id))
            .is_some())
    }

    async fn find_recipients_by_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<(i64, i64)>, StorageError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .links
            .iter()
            .filter(|(_, sid)| sid.as_str() == session_id)
            .map(|(&key, _)| key)
            .collect())
    }

    async fn get_session_model(&self, session_id: &str) -> Result<Option<String>, StorageError> {
        Ok(self.inner.lock().unwrap().models.get(session_id).cloned())
    }

    async fn set_session_model(
        &self,
        session_id: &str,
        model_id: &str,
    ) -> Result<(), StorageError> {
        self.inner
            .lock()
            .unwrap()
            .models
            .insert(session_id.to_string(), model_id.to_string());
        Ok(())
    }

    async fn clear_session_model(&self, session_id: &str) -> Result<bool, StorageError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .models
            .remove(session_id)
            .is_some())
    }
}
