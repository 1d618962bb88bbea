use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::SessionStore;
use crate::error::StoreError;
use crate::types::{
    Contact, ContactPatch, DashboardStats, LeadFields, MessageRole, OriginCount, Stage,
    StoredMessage,
};

#[derive(Default)]
struct MemoryInner {
    contacts: HashMap<String, Contact>,
    messages: Vec<StoredMessage>,
}

/// Single-process store. Backs tests and `STORE=memory` runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds or overwrites a contact row as-is.
    pub async fn put_contact(&self, contact: Contact) {
        let mut inner = self.inner.lock().await;
        inner.contacts.insert(contact.id.clone(), contact);
    }

    pub async fn message_count(&self, contact_id: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .messages
            .iter()
            .filter(|m| m.contact_id == contact_id)
            .count()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_contact(&self, id: &str) -> Result<Option<Contact>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.contacts.get(id).cloned())
    }

    async fn create_contact(&self, id: &str, initial: LeadFields) -> Result<Contact, StoreError> {
        let mut inner = self.inner.lock().await;
        let contact = inner
            .contacts
            .entry(id.to_string())
            .or_insert_with(|| Contact::new(id, initial, Utc::now()));
        Ok(contact.clone())
    }

    async fn update_contact(&self, id: &str, patch: ContactPatch) -> Result<Contact, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(contact) = inner.contacts.get_mut(id) else {
            return Err(StoreError::ContactNotFound(id.to_string()));
        };
        patch.apply(contact);
        contact.updated_at = Utc::now();
        Ok(contact.clone())
    }

    async fn delete_contact(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.messages.retain(|m| m.contact_id != id);
        Ok(inner.contacts.remove(id).is_some())
    }

    async fn add_message(
        &self,
        contact_id: &str,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<StoredMessage, StoreError> {
        let mut inner = self.inner.lock().await;
        let message = StoredMessage {
            contact_id: contact_id.to_string(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        inner.messages.push(message.clone());
        if role == MessageRole::User {
            if let Some(contact) = inner.contacts.get_mut(contact_id) {
                contact.total_messages += 1;
            }
        }
        Ok(message)
    }

    async fn get_history(
        &self,
        contact_id: &str,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let inner = self.inner.lock().await;
        let session = inner
            .messages
            .iter()
            .filter(|m| m.contact_id == contact_id && m.session_id == session_id)
            .cloned()
            .collect::<Vec<_>>();
        let keep = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        let skip = session.len().saturating_sub(keep);
        Ok(session.into_iter().skip(skip).collect())
    }

    async fn dashboard_stats(&self) -> Result<DashboardStats, StoreError> {
        let inner = self.inner.lock().await;
        let contacts = inner.contacts.values().collect::<Vec<_>>();
        let total = contacts.len() as i64;
        let completed = contacts
            .iter()
            .filter(|c| c.stage == Stage::Completed)
            .count() as i64;
        let qualified = contacts
            .iter()
            .filter(|c| c.icp_qualified == Some(true))
            .count() as i64;
        let disqualified = contacts
            .iter()
            .filter(|c| c.icp_qualified == Some(false) || c.stage == Stage::Disqualified)
            .count() as i64;

        let mut by_origin = BTreeMap::<String, i64>::new();
        for contact in &contacts {
            let origin = contact
                .origin
                .clone()
                .filter(|o| !o.trim().is_empty())
                .unwrap_or_else(|| "Desconhecido".to_string());
            *by_origin.entry(origin).or_default() += 1;
        }
        let mut by_origin = by_origin
            .into_iter()
            .map(|(name, count)| OriginCount { name, count })
            .collect::<Vec<_>>();
        by_origin.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));

        Ok(DashboardStats::from_counts(
            total,
            completed,
            qualified,
            disqualified,
            by_origin,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_is_insert_if_absent() {
        let store = MemoryStore::new();
        let first = store
            .create_contact(
                "5511987654321",
                LeadFields {
                    name: Some("Ana".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let second = store
            .create_contact("5511987654321", LeadFields::default())
            .await
            .unwrap();
        assert_eq!(first.data_cache, second.data_cache);
        assert_eq!(second.data_cache.name.as_deref(), Some("Ana"));
    }

    #[tokio::test]
    async fn history_is_scoped_to_one_session_and_capped() {
        let store = MemoryStore::new();
        store.create_contact("c1", LeadFields::default()).await.unwrap();
        store.add_message("c1", "s1", MessageRole::User, "old session").await.unwrap();
        for i in 0..5 {
            store
                .add_message("c1", "s2", MessageRole::User, &format!("m{i}"))
                .await
                .unwrap();
        }

        let history = store.get_history("c1", "s2", 3).await.unwrap();
        let contents = history.iter().map(|m| m.content.as_str()).collect::<Vec<_>>();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);

        let contact = store.get_contact("c1").await.unwrap().unwrap();
        assert_eq!(contact.total_messages, 6);
    }

    #[tokio::test]
    async fn delete_cascades_to_messages() {
        let store = MemoryStore::new();
        store.create_contact("c1", LeadFields::default()).await.unwrap();
        store.add_message("c1", "s1", MessageRole::User, "oi").await.unwrap();
        assert!(store.delete_contact("c1").await.unwrap());
        assert_eq!(store.message_count("c1").await, 0);
        assert!(store.get_contact("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_of_unknown_contact_fails() {
        let store = MemoryStore::new();
        let err = store
            .update_contact("nobody", ContactPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ContactNotFound(_)));
    }

    #[tokio::test]
    async fn stats_count_qualification_and_origin() {
        let store = MemoryStore::new();
        for (id, origin, qualified) in [
            ("a", Some("Instagram"), Some(true)),
            ("b", Some("Instagram"), Some(false)),
            ("c", None, None),
        ] {
            store.create_contact(id, LeadFields::default()).await.unwrap();
            store
                .update_contact(
                    id,
                    ContactPatch {
                        origin: Some(origin.map(str::to_string)),
                        icp_qualified: qualified,
                        stage: qualified.map(|_| Stage::Completed),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let stats = store.dashboard_stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.qualified, 1);
        assert_eq!(stats.disqualified, 1);
        assert_eq!(stats.conversion_rate, 33.3);
        assert_eq!(stats.by_origin[0].name, "Instagram");
        assert_eq!(stats.by_origin[0].count, 2);
    }
}
