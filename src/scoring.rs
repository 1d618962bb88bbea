use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::StoreError;
use crate::store::SessionStore;
use crate::types::{Contact, ContactPatch};

/// Fired after every durable field merge so an external ranker can recompute.
#[async_trait]
pub trait ScoreHook: Send + Sync {
    async fn fields_merged(&self, contact_id: &str) -> Result<(), StoreError>;
}

/// Hook that does nothing.
pub struct NoopScoreHook;

#[async_trait]
impl ScoreHook for NoopScoreHook {
    async fn fields_merged(&self, _contact_id: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

const WEIGHT_ACTIVITY: f64 = 0.30;
const WEIGHT_SIZE: f64 = 0.20;
const WEIGHT_RESPONSE: f64 = 0.15;
const WEIGHT_QUALITY: f64 = 0.15;
const WEIGHT_PRODUCT: f64 = 0.10;
const WEIGHT_ENGAGEMENT: f64 = 0.10;

/// No response-time signal is collected yet; everyone gets the midpoint.
const RESPONSE_TIME_SCORE: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temperature {
    Hot,
    Warm,
    Cold,
}

impl Temperature {
    pub fn from_score(score: i32) -> Self {
        if score >= 70 {
            Temperature::Hot
        } else if score >= 40 {
            Temperature::Warm
        } else {
            Temperature::Cold
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Temperature::Hot => "Quente",
            Temperature::Warm => "Morno",
            Temperature::Cold => "Frio",
        }
    }
}

fn present(value: &Option<String>) -> bool {
    value.as_ref().is_some_and(|v| !v.trim().is_empty())
}

fn activity_score(contact: &Contact) -> u32 {
    if !present(&contact.activity_code) {
        return 0;
    }
    if contact.icp_qualified == Some(true) {
        75
    } else {
        0
    }
}

fn size_score(contact: &Contact) -> u32 {
    let Some(size) = contact.company_size.as_deref() else {
        return 30;
    };
    match size.trim().to_uppercase().as_str() {
        "MEI" | "MICROEMPREENDEDOR INDIVIDUAL" => 20,
        "ME" | "MICRO EMPRESA" => 40,
        "EPP" | "EMPRESA DE PEQUENO PORTE" => 70,
        "DEMAIS" => 100,
        _ => 30,
    }
}

fn quality_score(contact: &Contact) -> u32 {
    let mut score = 50;
    if present(&contact.tax_id) {
        score += 20;
    }
    if present(&contact.email) {
        score += 10;
    }
    if present(&contact.product) {
        score += 10;
    }
    if present(&contact.deadline) {
        score += 10;
    }
    score.min(100)
}

fn product_score(contact: &Contact) -> u32 {
    let mut score = 0;
    if present(&contact.product) {
        score += 50;
    }
    if present(&contact.quantity) {
        score += 25;
    }
    if present(&contact.deadline) {
        score += 25;
    }
    score
}

fn engagement_score(contact: &Contact) -> u32 {
    let mut score = match contact.total_messages {
        n if n >= 10 => 40,
        n if n >= 5 => 30,
        n if n >= 3 => 20,
        n if n >= 1 => 10,
        _ => 0,
    };
    if contact.audio_received {
        score += 20;
    }
    if contact.catalog_sent {
        score += 20;
    }
    score.min(100)
}

/// Weighted 0-100 rank of a contact.
pub fn score_contact(contact: &Contact) -> i32 {
    let total = activity_score(contact) as f64 * WEIGHT_ACTIVITY
        + size_score(contact) as f64 * WEIGHT_SIZE
        + RESPONSE_TIME_SCORE as f64 * WEIGHT_RESPONSE
        + quality_score(contact) as f64 * WEIGHT_QUALITY
        + product_score(contact) as f64 * WEIGHT_PRODUCT
        + engagement_score(contact) as f64 * WEIGHT_ENGAGEMENT;
    total.round() as i32
}

/// Default hook: recomputes score and temperature and writes them back.
pub struct LeadScorer {
    store: Arc<dyn SessionStore>,
}

impl LeadScorer {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ScoreHook for LeadScorer {
    async fn fields_merged(&self, contact_id: &str) -> Result<(), StoreError> {
        let Some(contact) = self.store.get_contact(contact_id).await? else {
            return Err(StoreError::ContactNotFound(contact_id.to_string()));
        };
        let score = score_contact(&contact);
        let temperature = Temperature::from_score(score);
        debug!(contact_id = %contact_id, score, temperature = temperature.label(), "lead scored");
        self.store
            .update_contact(
                contact_id,
                ContactPatch {
                    score: Some(score),
                    temperature: Some(temperature.label().to_string()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}
