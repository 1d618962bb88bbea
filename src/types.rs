use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    New,
    Initial,
    Collecting,
    Completed,
    Disqualified,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::New => "new",
            Stage::Initial => "initial",
            Stage::Collecting => "collecting",
            Stage::Completed => "completed",
            Stage::Disqualified => "disqualified",
        }
    }

    pub fn parse(value: &str) -> Option<Stage> {
        match value.trim() {
            "new" => Some(Stage::New),
            "initial" => Some(Stage::Initial),
            "collecting" => Some(Stage::Collecting),
            "completed" => Some(Stage::Completed),
            "disqualified" => Some(Stage::Disqualified),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Disqualified)
    }

    fn rank(&self) -> u8 {
        match self {
            Stage::New => 0,
            Stage::Initial => 1,
            Stage::Collecting => 2,
            Stage::Completed | Stage::Disqualified => 3,
        }
    }

    /// Moves forward only; a lower target leaves the stage where it is.
    pub fn advance_to(self, target: Stage) -> Stage {
        if target.rank() > self.rank() {
            target
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<MessageRole> {
        match value {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub contact_id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Role-tagged message handed to the text generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Working memory collected from the conversation. Every field is optional;
/// unknown keys found in structured model output are kept in `extras`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadFields {
    #[serde(default, rename = "cnpj", skip_serializing_if = "Option::is_none")]
    pub tax_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<String>,
    #[serde(default, rename = "prazo", skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    #[serde(default, flatten)]
    pub extras: BTreeMap<String, Value>,
}

impl LeadFields {
    pub fn is_empty(&self) -> bool {
        self.tax_id.is_none()
            && self.name.is_none()
            && self.phone.is_none()
            && self.email.is_none()
            && self.origin.is_none()
            && self.source.is_none()
            && self.campaign.is_none()
            && self.product.is_none()
            && self.quantity.is_none()
            && self.deadline.is_none()
            && self.extras.is_empty()
    }

    /// Field-level merge: values present in `newer` win.
    pub fn merge_from(&mut self, newer: &LeadFields) {
        fn take(slot: &mut Option<String>, value: &Option<String>) {
            if let Some(value) = value.as_ref().filter(|v| !v.trim().is_empty()) {
                *slot = Some(value.clone());
            }
        }
        take(&mut self.tax_id, &newer.tax_id);
        take(&mut self.name, &newer.name);
        take(&mut self.phone, &newer.phone);
        take(&mut self.email, &newer.email);
        take(&mut self.origin, &newer.origin);
        take(&mut self.source, &newer.source);
        take(&mut self.campaign, &newer.campaign);
        take(&mut self.product, &newer.product);
        take(&mut self.quantity, &newer.quantity);
        take(&mut self.deadline, &newer.deadline);
        for (key, value) in &newer.extras {
            self.extras.insert(key.clone(), value.clone());
        }
    }

    pub fn merged(&self, newer: &LeadFields) -> LeadFields {
        let mut out = self.clone();
        out.merge_from(newer);
        out
    }

    pub fn set(&mut self, key: &str, value: String) {
        match key {
            "cnpj" | "tax_id" | "taxId" => self.tax_id = Some(value),
            "name" | "nome" => self.name = Some(value),
            "phone" | "telefone" => self.phone = Some(value),
            "email" => self.email = Some(value),
            "origin" | "origem" => self.origin = Some(value),
            "source" | "fonte" => self.source = Some(value),
            "campaign" | "campanha" => self.campaign = Some(value),
            "product" | "produto" => self.product = Some(value),
            "quantity" | "quantidade" => self.quantity = Some(value),
            "prazo" | "deadline" => self.deadline = Some(value),
            other => {
                self.extras.insert(other.to_string(), Value::String(value));
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub tax_id: Option<String>,
    pub origin: Option<String>,
    pub source: Option<String>,
    pub campaign: Option<String>,
    pub product: Option<String>,
    pub quantity: Option<String>,
    pub deadline: Option<String>,
    pub stage: Stage,
    pub data_cache: LeadFields,
    pub session_id: Option<String>,
    pub tax_id_attempts: i32,
    pub lockout_until: Option<DateTime<Utc>>,
    pub last_interaction_at: Option<DateTime<Utc>>,
    pub score: Option<i32>,
    pub temperature: Option<String>,
    pub moderation_flagged: bool,
    pub total_messages: i32,
    pub audio_received: bool,
    pub catalog_sent: bool,
    pub legal_name: Option<String>,
    pub trade_name: Option<String>,
    pub activity_code: Option<String>,
    pub activity_description: Option<String>,
    pub company_size: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub icp_qualified: Option<bool>,
    pub disqualification_reason: Option<String>,
    pub crm_deal_id: Option<String>,
    pub crm_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    pub fn new(id: &str, initial: LeadFields, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            email: None,
            tax_id: None,
            origin: None,
            source: None,
            campaign: None,
            product: None,
            quantity: None,
            deadline: None,
            stage: Stage::New,
            data_cache: initial,
            session_id: None,
            tax_id_attempts: 0,
            lockout_until: None,
            last_interaction_at: None,
            score: None,
            temperature: None,
            moderation_flagged: false,
            total_messages: 0,
            audio_received: false,
            catalog_sent: false,
            legal_name: None,
            trade_name: None,
            activity_code: None,
            activity_description: None,
            company_size: None,
            city: None,
            state: None,
            icp_qualified: None,
            disqualification_reason: None,
            crm_deal_id: None,
            crm_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// `data_cache` overlaid with the dedicated columns: everything currently known.
    pub fn merged_memory(&self) -> LeadFields {
        let columns = LeadFields {
            tax_id: self.tax_id.clone(),
            name: self.name.clone(),
            phone: None,
            email: self.email.clone(),
            origin: self.origin.clone(),
            source: self.source.clone(),
            campaign: self.campaign.clone(),
            product: self.product.clone(),
            quantity: self.quantity.clone(),
            deadline: self.deadline.clone(),
            extras: BTreeMap::new(),
        };
        self.data_cache.merged(&columns)
    }

    pub fn has_minimal_data(&self) -> bool {
        let present = |v: &Option<String>| v.as_ref().is_some_and(|s| !s.trim().is_empty());
        present(&self.tax_id) && present(&self.name)
    }

    /// Phone to report for the lead: the collected one, else the channel address.
    pub fn phone(&self) -> String {
        self.data_cache
            .phone
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.id.clone())
    }
}

/// Partial update. `None` leaves a column untouched; `Some(None)` clears a
/// nullable column.
#[derive(Debug, Clone, Default)]
pub struct ContactPatch {
    pub name: Option<Option<String>>,
    pub email: Option<Option<String>>,
    pub tax_id: Option<Option<String>>,
    pub origin: Option<Option<String>>,
    pub source: Option<Option<String>>,
    pub campaign: Option<Option<String>>,
    pub product: Option<Option<String>>,
    pub quantity: Option<Option<String>>,
    pub deadline: Option<Option<String>>,
    pub stage: Option<Stage>,
    pub data_cache: Option<LeadFields>,
    pub session_id: Option<String>,
    pub tax_id_attempts: Option<i32>,
    pub lockout_until: Option<Option<DateTime<Utc>>>,
    pub last_interaction_at: Option<DateTime<Utc>>,
    pub score: Option<i32>,
    pub temperature: Option<String>,
    pub moderation_flagged: Option<bool>,
    pub audio_received: Option<bool>,
    pub catalog_sent: Option<bool>,
    pub company: Option<CompanySnapshot>,
    pub icp_qualified: Option<bool>,
    pub disqualification_reason: Option<Option<String>>,
    pub crm_deal_id: Option<String>,
    pub crm_synced_at: Option<DateTime<Utc>>,
}

impl ContactPatch {
    pub fn apply(self, contact: &mut Contact) {
        if let Some(v) = self.name {
            contact.name = v;
        }
        if let Some(v) = self.email {
            contact.email = v;
        }
        if let Some(v) = self.tax_id {
            contact.tax_id = v;
        }
        if let Some(v) = self.origin {
            contact.origin = v;
        }
        if let Some(v) = self.source {
            contact.source = v;
        }
        if let Some(v) = self.campaign {
            contact.campaign = v;
        }
        if let Some(v) = self.product {
            contact.product = v;
        }
        if let Some(v) = self.quantity {
            contact.quantity = v;
        }
        if let Some(v) = self.deadline {
            contact.deadline = v;
        }
        if let Some(v) = self.stage {
            contact.stage = v;
        }
        if let Some(v) = self.data_cache {
            contact.data_cache = v;
        }
        if let Some(v) = self.session_id {
            contact.session_id = Some(v);
        }
        if let Some(v) = self.tax_id_attempts {
            contact.tax_id_attempts = v;
        }
        if let Some(v) = self.lockout_until {
            contact.lockout_until = v;
        }
        if let Some(v) = self.last_interaction_at {
            contact.last_interaction_at = Some(v);
        }
        if let Some(v) = self.score {
            contact.score = Some(v);
        }
        if let Some(v) = self.temperature {
            contact.temperature = Some(v);
        }
        if let Some(v) = self.moderation_flagged {
            contact.moderation_flagged = v;
        }
        if let Some(v) = self.audio_received {
            contact.audio_received = v;
        }
        if let Some(v) = self.catalog_sent {
            contact.catalog_sent = v;
        }
        if let Some(company) = self.company {
            contact.legal_name = Some(company.legal_name);
            contact.trade_name = Some(company.trade_name);
            contact.activity_code = Some(company.activity_code);
            contact.activity_description = Some(company.activity_description);
            contact.company_size = company.company_size;
            contact.city = Some(company.city);
            contact.state = Some(company.state);
        }
        if let Some(v) = self.icp_qualified {
            contact.icp_qualified = Some(v);
        }
        if let Some(v) = self.disqualification_reason {
            contact.disqualification_reason = v;
        }
        if let Some(v) = self.crm_deal_id {
            contact.crm_deal_id = Some(v);
        }
        if let Some(v) = self.crm_synced_at {
            contact.crm_synced_at = Some(v);
        }
    }
}

/// Company columns copied onto the contact after enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanySnapshot {
    pub legal_name: String,
    pub trade_name: String,
    pub activity_code: String,
    pub activity_description: String,
    pub company_size: Option<String>,
    pub city: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityCode {
    pub code: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub street: String,
    pub number: String,
    pub complement: String,
    pub district: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
}

/// Structured registry answer for one tax id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyRecord {
    pub tax_id: String,
    pub formatted_tax_id: String,
    pub legal_name: String,
    pub trade_name: String,
    pub registration_status: String,
    pub opened_on: String,
    pub primary_activity: ActivityCode,
    pub secondary_activities: Vec<ActivityCode>,
    pub address: Address,
    pub phone: String,
    pub email: String,
    pub share_capital: Option<f64>,
    pub company_size: Option<String>,
    pub legal_nature: String,
}

impl CompanyRecord {
    pub fn snapshot(&self) -> CompanySnapshot {
        CompanySnapshot {
            legal_name: self.legal_name.clone(),
            trade_name: self.trade_name.clone(),
            activity_code: self.primary_activity.code.clone(),
            activity_description: self.primary_activity.description.clone(),
            company_size: self.company_size.clone(),
            city: self.address.city.clone(),
            state: self.address.state.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginCount {
    pub name: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total: i64,
    pub completed: i64,
    pub qualified: i64,
    pub disqualified: i64,
    pub conversion_rate: f64,
    pub by_origin: Vec<OriginCount>,
}

impl DashboardStats {
    pub fn from_counts(
        total: i64,
        completed: i64,
        qualified: i64,
        disqualified: i64,
        by_origin: Vec<OriginCount>,
    ) -> Self {
        let conversion_rate = if total > 0 {
            ((qualified as f64 / total as f64) * 1000.0).round() / 10.0
        } else {
            0.0
        };
        Self {
            total,
            completed,
            qualified,
            disqualified,
            conversion_rate,
            by_origin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_only_moves_forward() {
        assert_eq!(Stage::New.advance_to(Stage::Initial), Stage::Initial);
        assert_eq!(Stage::Collecting.advance_to(Stage::Initial), Stage::Collecting);
        assert_eq!(Stage::Completed.advance_to(Stage::Collecting), Stage::Completed);
    }

    #[test]
    fn merge_keeps_existing_values_when_newer_is_blank() {
        let mut cache = LeadFields {
            name: Some("Ana".into()),
            ..Default::default()
        };
        cache.merge_from(&LeadFields {
            name: Some("  ".into()),
            email: Some("ana@loja.com.br".into()),
            ..Default::default()
        });
        assert_eq!(cache.name.as_deref(), Some("Ana"));
        assert_eq!(cache.email.as_deref(), Some("ana@loja.com.br"));
    }

    #[test]
    fn lead_fields_round_trip_with_extras() {
        let raw = r#"{"cnpj":"08054886000168","nome_loja":"Casa das Serras","prazo":"30 dias"}"#;
        let fields: LeadFields = serde_json::from_str(raw).unwrap();
        assert_eq!(fields.tax_id.as_deref(), Some("08054886000168"));
        assert_eq!(fields.deadline.as_deref(), Some("30 dias"));
        assert!(fields.extras.contains_key("nome_loja"));
    }

    #[test]
    fn merged_memory_prefers_dedicated_columns() {
        let mut contact = Contact::new("5511999990000", LeadFields::default(), Utc::now());
        contact.data_cache.name = Some("ana".into());
        contact.name = Some("Ana Souza".into());
        assert_eq!(contact.merged_memory().name.as_deref(), Some("Ana Souza"));
        assert_eq!(contact.phone(), "5511999990000");
    }
}
