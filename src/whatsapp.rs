use async_trait::async_trait;
use axum::http::header;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{info, warn};

use crate::batching::ReplySink;
use crate::config::WhatsAppConfig;
use crate::engine::TurnReply;
use crate::error::TransportError;
use crate::llm::AudioClip;
use crate::validation::contact_id_for_phone;

const GRAPH_BASE_URL: &str = "https://graph.facebook.com/v21.0";
const CATALOG_FILENAME: &str = "catalogo.pdf";

/// `X-Hub-Signature-256` check. An unset app secret disables verification.
pub fn verify_signature(app_secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if app_secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Answer to the `hub.*` subscription handshake, if the token matches.
pub fn verify_subscription<'a>(
    verify_token: &str,
    mode: &str,
    token: &str,
    challenge: &'a str,
) -> Option<&'a str> {
    let accepted = mode == "subscribe"
        && !challenge.is_empty()
        && !verify_token.is_empty()
        && token == verify_token;
    accepted.then_some(challenge)
}

pub fn normalize_phone(raw: &str) -> Option<String> {
    contact_id_for_phone(raw)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundContent {
    Text(String),
    Audio { media_id: String, mime_type: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhatsAppInbound {
    /// Canonical sender number; doubles as the contact id.
    pub from: String,
    pub profile_name: Option<String>,
    pub received_at: DateTime<Utc>,
    pub content: InboundContent,
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> &'a str {
    let mut current = value;
    for key in path {
        let Some(next) = current.get(key) else {
            return "";
        };
        current = next;
    }
    current.as_str().unwrap_or("").trim()
}

fn inbound_content(message: &Value) -> Option<InboundContent> {
    let msg_type = str_at(message, &["type"]).to_ascii_lowercase();
    let text = match msg_type.as_str() {
        "text" => str_at(message, &["text", "body"]),
        "button" => str_at(message, &["button", "text"]),
        "interactive" => {
            let button = str_at(message, &["interactive", "button_reply", "title"]);
            if button.is_empty() {
                str_at(message, &["interactive", "list_reply", "title"])
            } else {
                button
            }
        }
        "audio" | "voice" => {
            let media_id = str_at(message, &[msg_type.as_str(), "id"]);
            if media_id.is_empty() {
                return None;
            }
            let mime_type = str_at(message, &[msg_type.as_str(), "mime_type"]);
            return Some(InboundContent::Audio {
                media_id: media_id.to_string(),
                mime_type: if mime_type.is_empty() {
                    "audio/ogg".to_string()
                } else {
                    mime_type.to_string()
                },
            });
        }
        _ => "",
    };
    if text.is_empty() {
        None
    } else {
        Some(InboundContent::Text(text.to_string()))
    }
}

fn message_time(message: &Value) -> DateTime<Utc> {
    str_at(message, &["timestamp"])
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now)
}

/// Flattens a Cloud API webhook payload into the messages worth a turn.
/// Group, broadcast and own-number messages are skipped, as are unsupported types.
pub fn parse_webhook(payload: &Value, expected_phone_number_id: &str) -> Vec<WhatsAppInbound> {
    let mut inbound = Vec::new();
    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for entry in entries {
        let changes = entry
            .get("changes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for change in changes {
            let value = change.get("value").cloned().unwrap_or_else(|| json!({}));
            let metadata_phone_id = str_at(&value, &["metadata", "phone_number_id"]);
            if !expected_phone_number_id.is_empty()
                && !metadata_phone_id.is_empty()
                && expected_phone_number_id != metadata_phone_id
            {
                continue;
            }
            let own_number = normalize_phone(str_at(&value, &["metadata", "display_phone_number"]));

            let messages = value
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for message in messages {
                let raw_from = str_at(&message, &["from"]);
                if raw_from.contains("@g.us")
                    || raw_from == "status@broadcast"
                    || message.get("group_id").is_some()
                {
                    continue;
                }
                if message.get("from_me").and_then(Value::as_bool) == Some(true) {
                    continue;
                }
                let Some(from) = normalize_phone(raw_from) else {
                    continue;
                };
                if own_number.as_deref() == Some(from.as_str()) {
                    continue;
                }
                let Some(content) = inbound_content(&message) else {
                    continue;
                };
                let profile_name = value
                    .get("contacts")
                    .and_then(Value::as_array)
                    .and_then(|contacts| {
                        contacts.iter().find(|c| {
                            normalize_phone(str_at(c, &["wa_id"])).as_deref() == Some(from.as_str())
                        })
                    })
                    .map(|c| str_at(c, &["profile", "name"]).to_string())
                    .filter(|name| !name.is_empty());
                inbound.push(WhatsAppInbound {
                    from,
                    profile_name,
                    received_at: message_time(&message),
                    content,
                });
            }
        }
    }
    inbound
}

/// Graph API client for one business phone number.
#[derive(Clone)]
pub struct WhatsAppClient {
    http: reqwest::Client,
    config: WhatsAppConfig,
    catalog_url: Option<String>,
}

impl WhatsAppClient {
    pub fn new(http: reqwest::Client, config: WhatsAppConfig, catalog_url: Option<String>) -> Self {
        Self {
            http,
            config,
            catalog_url,
        }
    }

    pub fn config(&self) -> &WhatsAppConfig {
        &self.config
    }

    fn require_sending(&self) -> Result<(), TransportError> {
        if self.config.can_send() {
            Ok(())
        } else {
            Err(TransportError::NotConfigured(
                "missing WHATSAPP_ACCESS_TOKEN or WHATSAPP_PHONE_NUMBER_ID",
            ))
        }
    }

    /// Metadata lookup then authenticated download, as the Graph API requires.
    pub async fn fetch_media(
        &self,
        media_id: &str,
        fallback_mime: &str,
    ) -> Result<AudioClip, TransportError> {
        if self.config.access_token.is_empty() {
            return Err(TransportError::NotConfigured("missing WHATSAPP_ACCESS_TOKEN"));
        }
        let metadata_response = self
            .http
            .get(format!("{GRAPH_BASE_URL}/{media_id}"))
            .bearer_auth(&self.config.access_token)
            .send()
            .await?;
        if !metadata_response.status().is_success() {
            let status = metadata_response.status().as_u16();
            let body = metadata_response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }
        let metadata = metadata_response
            .json::<Value>()
            .await
            .unwrap_or_else(|_| json!({}));
        let media_url = str_at(&metadata, &["url"]).to_string();
        if media_url.is_empty() {
            return Err(TransportError::Media(format!(
                "missing media url for {media_id}"
            )));
        }
        let declared_mime = match str_at(&metadata, &["mime_type"]) {
            "" => fallback_mime.to_string(),
            mime => mime.to_string(),
        };

        let media_response = self
            .http
            .get(media_url)
            .bearer_auth(&self.config.access_token)
            .send()
            .await?;
        if !media_response.status().is_success() {
            let status = media_response.status().as_u16();
            let body = media_response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }
        let mime_type = media_response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(&declared_mime)
            .to_string();
        let bytes = media_response.bytes().await?;
        Ok(AudioClip {
            bytes: bytes.to_vec(),
            mime_type,
        })
    }

    pub async fn send_text(&self, to: &str, text: &str) -> Result<(), TransportError> {
        self.send(json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": { "preview_url": false, "body": text },
        }))
        .await
    }

    pub async fn send_document(
        &self,
        to: &str,
        link: &str,
        filename: &str,
        caption: &str,
    ) -> Result<(), TransportError> {
        self.send(json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "document",
            "document": { "link": link, "filename": filename, "caption": caption },
        }))
        .await
    }

    async fn send(&self, payload: Value) -> Result<(), TransportError> {
        self.require_sending()?;
        let response = self
            .http
            .post(format!(
                "{GRAPH_BASE_URL}/{}/messages",
                self.config.phone_number_id
            ))
            .bearer_auth(&self.config.access_token)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ReplySink for WhatsAppClient {
    async fn deliver(&self, contact_id: &str, reply: &TurnReply) -> Result<(), TransportError> {
        if !reply.text.trim().is_empty() {
            self.send_text(contact_id, &reply.text).await?;
        }
        if reply.send_catalog {
            match self.catalog_url.as_deref() {
                Some(link) => {
                    self.send_document(contact_id, link, CATALOG_FILENAME, "Catálogo Maxi Force")
                        .await?;
                    info!(contact_id = %contact_id, "catalog sent");
                }
                None => warn!(contact_id = %contact_id, "catalog requested but CATALOG_URL is unset"),
            }
        }
        Ok(())
    }
}
