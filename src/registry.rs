use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::RegistryError;
use crate::types::{ActivityCode, Address, CompanyRecord};
use crate::validation::{digits_only, format_phone, format_tax_id};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// National company registry lookup by tax id.
#[async_trait]
pub trait CompanyRegistry: Send + Sync {
    async fn lookup(&self, tax_id: &str) -> Result<CompanyRecord, RegistryError>;
}

#[derive(Clone)]
pub struct BrasilApiRegistry {
    http: reqwest::Client,
    base_url: String,
}

impl BrasilApiRegistry {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CompanyRegistry for BrasilApiRegistry {
    async fn lookup(&self, tax_id: &str) -> Result<CompanyRecord, RegistryError> {
        let digits = digits_only(tax_id);
        if digits.len() != 14 {
            return Err(RegistryError::Malformed(tax_id.to_string()));
        }

        info!(tax_id = %digits, "registry lookup");
        let response = self
            .http
            .get(format!("{}/{}", self.base_url, digits))
            .timeout(LOOKUP_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            warn!(tax_id = %digits, "tax id not found in registry");
            return Err(RegistryError::NotFound(digits));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| RegistryError::Decode(err.to_string()))?;
        let record = company_from_payload(&digits, &payload)?;
        info!(tax_id = %digits, legal_name = %record.legal_name, "registry lookup succeeded");
        Ok(record)
    }
}

fn text(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn activity(code: &Value, description: &Value) -> Option<ActivityCode> {
    let code = match code {
        Value::String(s) => digits_only(s),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if code.is_empty() || code == "0" {
        return None;
    }
    Some(ActivityCode {
        code,
        description: description.as_str().unwrap_or("").trim().to_string(),
    })
}

/// Maps a BrasilAPI `cnpj/v1` payload onto a `CompanyRecord`.
pub fn company_from_payload(tax_id: &str, payload: &Value) -> Result<CompanyRecord, RegistryError> {
    let null = Value::Null;
    let primary_activity = activity(
        payload.get("cnae_fiscal").unwrap_or(&null),
        payload.get("cnae_fiscal_descricao").unwrap_or(&null),
    )
    .ok_or_else(|| RegistryError::Decode("missing cnae_fiscal".to_string()))?;

    let secondary_activities = payload
        .get("cnaes_secundarios")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    activity(
                        item.get("codigo").unwrap_or(&null),
                        item.get("descricao").unwrap_or(&null),
                    )
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let legal_name = text(payload, "razao_social");
    let trade_name = Some(text(payload, "nome_fantasia"))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| legal_name.clone());
    let registry_tax_id = Some(digits_only(&text(payload, "cnpj")))
        .filter(|digits| digits.len() == 14)
        .unwrap_or_else(|| tax_id.to_string());
    let phone_raw = text(payload, "ddd_telefone_1");

    Ok(CompanyRecord {
        formatted_tax_id: format_tax_id(&registry_tax_id),
        tax_id: registry_tax_id,
        legal_name,
        trade_name,
        registration_status: text(payload, "descricao_situacao_cadastral"),
        opened_on: text(payload, "data_inicio_atividade"),
        primary_activity,
        secondary_activities,
        address: Address {
            street: text(payload, "logradouro"),
            number: text(payload, "numero"),
            complement: text(payload, "complemento"),
            district: text(payload, "bairro"),
            city: text(payload, "municipio"),
            state: text(payload, "uf"),
            zip_code: text(payload, "cep"),
        },
        phone: if phone_raw.is_empty() {
            String::new()
        } else {
            format_phone(&phone_raw)
        },
        email: text(payload, "email"),
        share_capital: payload.get("capital_social").and_then(Value::as_f64),
        company_size: Some(text(payload, "porte")).filter(|size| !size.is_empty()),
        legal_nature: text(payload, "natureza_juridica"),
    })
}
