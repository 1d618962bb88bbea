use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::CrmError;
use crate::icp::IcpVerdict;
use crate::types::{CompanyRecord, MessageRole, StoredMessage};

const CRM_TIMEOUT: Duration = Duration::from_secs(15);
const NOTE_RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadIdentity {
    pub contact_id: String,
    pub name: String,
    pub phone: String,
    pub email: String,
    pub tax_id: String,
    pub origin: String,
    pub source: Option<String>,
    pub campaign: Option<String>,
    pub product: Option<String>,
    pub quantity: Option<String>,
    pub deadline: Option<String>,
}

/// Everything the CRM receives for one finalized lead.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadSubmission {
    pub lead: LeadIdentity,
    pub company: Option<CompanyRecord>,
    pub verdict: IcpVerdict,
    pub conversation_summary: String,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrmReceipt {
    pub deal_id: String,
    /// False when an existing deal was linked instead of created.
    pub created: bool,
}

#[async_trait]
pub trait CrmClient: Send + Sync {
    fn is_configured(&self) -> bool;

    async fn submit_lead(&self, submission: &LeadSubmission) -> Result<CrmReceipt, CrmError>;

    async fn mark_lost(&self, deal_id: &str, reason: &str) -> Result<(), CrmError>;
}

/// "👤 Cliente: ..." / "🤖 Márcia: ..." lines, system notes left out.
pub fn conversation_summary(history: &[StoredMessage], agent_name: &str) -> String {
    history
        .iter()
        .filter_map(|message| match message.role {
            MessageRole::User => Some(format!("👤 Cliente: {}", message.content)),
            MessageRole::Assistant => Some(format!("🤖 {agent_name}: {}", message.content)),
            MessageRole::System => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn or_unknown(value: &str) -> &str {
    if value.trim().is_empty() {
        "Não informado"
    } else {
        value
    }
}

fn section(note: &mut String, title: &str) {
    note.push('\n');
    note.push_str(title);
    note.push('\n');
    note.push_str(NOTE_RULE);
    note.push('\n');
}

/// Human-readable deal note: company block, activity codes, verdict, transcript.
pub fn render_deal_note(
    lead: &LeadIdentity,
    company: Option<&CompanyRecord>,
    verdict: &IcpVerdict,
    conversation_summary: &str,
    now: DateTime<Utc>,
) -> String {
    let mut note = String::from("📊 INFORMAÇÕES DO CNPJ - Qualificação Automática\n");

    section(&mut note, "🏢 DADOS DA EMPRESA:");
    match company {
        Some(company) => {
            note.push_str(&format!("• Razão Social: {}\n", company.legal_name));
            note.push_str(&format!("• Nome Fantasia: {}\n", company.trade_name));
            note.push_str(&format!("• CNPJ: {}\n", company.formatted_tax_id));
            note.push_str(&format!(
                "• Porte: {}\n",
                or_unknown(company.company_size.as_deref().unwrap_or(""))
            ));
            note.push_str(&format!(
                "• Natureza Jurídica: {}\n",
                or_unknown(&company.legal_nature)
            ));
            let capital = company
                .share_capital
                .map(|value| format!("R$ {value:.2}"))
                .unwrap_or_else(|| "Não informado".to_string());
            note.push_str(&format!("• Capital Social: {capital}\n"));

            section(&mut note, "📍 ENDEREÇO:");
            let address = &company.address;
            let number = if address.number.trim().is_empty() {
                "S/N"
            } else {
                address.number.as_str()
            };
            note.push_str(&format!("{}, {}\n", address.street, number));
            if !address.complement.trim().is_empty() {
                note.push_str(&address.complement);
                note.push('\n');
            }
            note.push_str(&format!(
                "{} - {}/{}\nCEP: {}\n",
                address.district, address.city, address.state, address.zip_code
            ));
        }
        None => {
            note.push_str(&format!(
                "CNPJ {} não encontrado na Receita Federal\n",
                or_unknown(&lead.tax_id)
            ));
        }
    }

    section(&mut note, "📞 CONTATO:");
    note.push_str(&format!("• Nome: {}\n", or_unknown(&lead.name)));
    note.push_str(&format!("• Telefone Lead: {}\n", lead.phone));
    let email = company
        .map(|c| c.email.as_str())
        .filter(|e| !e.trim().is_empty())
        .unwrap_or(lead.email.as_str());
    note.push_str(&format!("• Email: {}\n", or_unknown(email)));

    if let Some(company) = company {
        section(&mut note, "🏭 ATIVIDADE ECONÔMICA (CNAE):");
        note.push_str(&format!(
            "📌 CNAE Principal:\n   {} - {}\n\n📋 CNAEs Secundários:\n",
            company.primary_activity.code, company.primary_activity.description
        ));
        if company.secondary_activities.is_empty() {
            note.push_str("   Nenhum CNAE secundário\n");
        }
        for activity in &company.secondary_activities {
            note.push_str(&format!("   • {} - {}\n", activity.code, activity.description));
        }
    }

    section(&mut note, "✅ RESULTADO DA QUALIFICAÇÃO:");
    note.push_str(if verdict.qualified {
        "Status: ✅ QUALIFICADO\n"
    } else {
        "Status: ❌ NÃO QUALIFICADO\n"
    });
    note.push_str(&format!("Motivo: {}\n", verdict.reason));

    if !conversation_summary.trim().is_empty() {
        section(&mut note, "💬 RESUMO DA CONVERSA:");
        note.push_str(conversation_summary.trim());
        note.push('\n');
    }

    section(&mut note, "📥 ORIGEM DO LEAD:");
    note.push_str(&format!("Fonte: {}\n", or_unknown(&lead.origin)));
    note.push_str(&format!("Data: {}\n", now.format("%d/%m/%Y %H:%M")));
    note.push_str(NOTE_RULE);
    note.push_str("\n🤖 Anotação gerada automaticamente pelo sistema de qualificação de leads");
    note
}

/// Generic JSON webhook CRM.
#[derive(Clone)]
pub struct HttpCrmClient {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl HttpCrmClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: api_token.into(),
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_token.trim().is_empty() {
            request
        } else {
            request.bearer_auth(self.api_token.trim())
        }
    }

    async fn find_existing_deal(&self, tax_id: &str) -> Result<Option<String>, CrmError> {
        let response = self
            .authorized(self.http.get(format!("{}/deals", self.base_url)))
            .query(&[("tax_id", tax_id)])
            .timeout(CRM_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CrmError::Status { status, body });
        }
        let payload = response.json::<Value>().await?;
        let first = payload
            .get("deals")
            .and_then(Value::as_array)
            .or_else(|| payload.as_array())
            .and_then(|items| items.first())
            .cloned();
        Ok(first.as_ref().and_then(deal_id_from_payload))
    }
}

fn deal_id_from_payload(payload: &Value) -> Option<String> {
    let candidates = [
        payload.get("dealId"),
        payload.get("deal_id"),
        payload.get("id"),
        payload.get("deal").and_then(|deal| deal.get("id")),
        payload.get("_id"),
    ];
    candidates.into_iter().flatten().find_map(|value| match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[async_trait]
impl CrmClient for HttpCrmClient {
    fn is_configured(&self) -> bool {
        !self.base_url.is_empty()
    }

    async fn submit_lead(&self, submission: &LeadSubmission) -> Result<CrmReceipt, CrmError> {
        let response = self
            .authorized(self.http.post(format!("{}/leads", self.base_url)))
            .json(submission)
            .timeout(CRM_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::CONFLICT || status == StatusCode::UNPROCESSABLE_ENTITY {
            let tax_id = submission.lead.tax_id.clone();
            warn!(tax_id = %tax_id, status = status.as_u16(), "crm reports lead already exists, linking");
            return match self.find_existing_deal(&tax_id).await? {
                Some(deal_id) => Ok(CrmReceipt {
                    deal_id,
                    created: false,
                }),
                None => Err(CrmError::AlreadyExists(tax_id)),
            };
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CrmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload = response.json::<Value>().await?;
        let deal_id = deal_id_from_payload(&payload).ok_or(CrmError::MissingDealId)?;
        info!(deal_id = %deal_id, "crm deal created");
        Ok(CrmReceipt {
            deal_id,
            created: true,
        })
    }

    async fn mark_lost(&self, deal_id: &str, reason: &str) -> Result<(), CrmError> {
        let response = self
            .authorized(self.http.put(format!("{}/deals/{}/lost", self.base_url, deal_id)))
            .json(&json!({ "reason": reason }))
            .timeout(CRM_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CrmError::Status { status, body });
        }
        info!(deal_id = %deal_id, "crm deal marked as lost");
        Ok(())
    }
}

/// Used when no CRM is configured. Logs and hands back a synthetic reference.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunCrm;

#[async_trait]
impl CrmClient for DryRunCrm {
    fn is_configured(&self) -> bool {
        false
    }

    async fn submit_lead(&self, submission: &LeadSubmission) -> Result<CrmReceipt, CrmError> {
        let deal_id = format!("dry-run-{}", Uuid::new_v4());
        info!(
            deal_id = %deal_id,
            contact_id = %submission.lead.contact_id,
            qualified = submission.verdict.qualified,
            "crm not configured, lead recorded in dry-run mode"
        );
        Ok(CrmReceipt {
            deal_id,
            created: true,
        })
    }

    async fn mark_lost(&self, deal_id: &str, reason: &str) -> Result<(), CrmError> {
        info!(deal_id = %deal_id, reason = %reason, "crm not configured, skipping mark-lost");
        Ok(())
    }
}
