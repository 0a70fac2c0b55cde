//! Authorization over numeric Telegram user ids.
//!
//! Decisions depend only on the allowed and admin sets, never on usernames
//! or any free-text field. Admins are implicitly allowed.

use std::sync::Arc;

use crate::store::{BridgeStore, StorageError};

/// Evaluates whether a numeric user is allowed or is an admin.
pub struct Authorizer {
    store: Arc<dyn BridgeStore>,
}

impl Authorizer {
    /// Create an authorizer over the repository.
    pub fn new(store: Arc<dyn BridgeStore>) -> Self {
        Self { store }
    }

    /// Seed the configured admin and allowed ids into the store.
    ///
    /// Upsert only: ids removed from the environment are not deleted here.
    pub async fn seed(&self, admins: &[i64], allowed: &[i64]) -> Result<(), StorageError> {
        for &id in admins {
            self.store.upsert_admin(id).await?;
        }
        for &id in allowed {
            self.store.upsert_allowed(id).await?;
        }
        Ok(())
    }

    /// Whether the user may talk to the bridge. Admins always qualify,
    /// whether or not they appear in the allowed set.
    pub async fn is_allowed(&self, user_id: i64) -> Result<bool, StorageError> {
        if self.store.admin_contains(user_id).await? {
            return Ok(true);
        }
        self.store.allowed_contains(user_id).await
    }

    /// Whether the user may run admin commands.
    pub async fn is_admin(&self, user_id: i64) -> Result<bool, StorageError> {
        self.store.admin_contains(user_id).await
    }

    /// Add a user id to the allowed set.
    pub async fn allow(&self, user_id: i64) -> Result<(), StorageError> {
        self.store.upsert_allowed(user_id).await
    }

    /// Remove a user id from the allowed set.
    ///
    /// Returns `true` when the id was present.
    pub async fn deny(&self, user_id: i64) -> Result<bool, StorageError> {
        self.store.remove_allowed(user_id).await
    }

    /// All allowed user ids.
    pub async fn list_allowed(&self) -> Result<Vec<i64>, StorageError> {
        self.store.list_allowed().await
    }

    /// All admin user ids.
    pub async fn list_admins(&self) -> Result<Vec<i64>, StorageError> {
        self.store.list_admins().await
    }
}
