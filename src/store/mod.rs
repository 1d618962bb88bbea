mod memory;
mod postgres;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::StoreError;
use crate::types::{Contact, ContactPatch, DashboardStats, LeadFields, MessageRole, StoredMessage};

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

/// Durable per-contact record plus the session-scoped message log.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_contact(&self, id: &str) -> Result<Option<Contact>, StoreError>;

    /// Insert-if-absent. An existing row is returned untouched.
    async fn create_contact(&self, id: &str, initial: LeadFields) -> Result<Contact, StoreError>;

    /// Applies the patch and stamps `updated_at`. `data_cache`, when present,
    /// is the already-merged working memory.
    async fn update_contact(&self, id: &str, patch: ContactPatch) -> Result<Contact, StoreError>;

    /// Removes the contact and every message logged for it.
    async fn delete_contact(&self, id: &str) -> Result<bool, StoreError>;

    /// Append-only. User messages also bump the contact's message counter.
    async fn add_message(
        &self,
        contact_id: &str,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<StoredMessage, StoreError>;

    /// Most recent `limit` messages of one session, oldest first.
    async fn get_history(
        &self,
        contact_id: &str,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    async fn dashboard_stats(&self) -> Result<DashboardStats, StoreError>;
}
