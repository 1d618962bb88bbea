use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::batching::{Admission, BatchSettings, InboundMessage, MessageBatcher, ReplySink};
use crate::config::{Config, StoreKind};
use crate::content_filter::ContentFilter;
use crate::crm::{CrmClient, DryRunCrm, HttpCrmClient};
use crate::engine::{ConversationEngine, EngineSettings, TurnReply, AUDIO_FAILURE_REPLY};
use crate::error::FinalizeError;
use crate::finalizer::{FinalizeOutcome, LeadFinalizer, LeadHandoff};
use crate::icp;
use crate::knowledge::KnowledgeBase;
use crate::llm::OpenAiClient;
use crate::locks::ContactLocks;
use crate::origin::normalize_origin;
use crate::registry::BrasilApiRegistry;
use crate::scoring::LeadScorer;
use crate::store::{MemoryStore, PgStore, SessionStore};
use crate::types::{ContactPatch, LeadFields};
use crate::validation::{contact_id_for_phone, digits_only, validate_tax_id};
use crate::whatsapp::{self, InboundContent, WhatsAppClient};

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn SessionStore>,
    pub finalizer: Arc<LeadFinalizer>,
    pub crm: Arc<dyn CrmClient>,
    pub batcher: MessageBatcher,
    pub whatsapp: WhatsAppClient,
    pub locks: ContactLocks,
}

/// `RUST_LOG` filter, `info` when unset.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Wires every collaborator from `config` around an already-open store.
pub fn build_state(
    config: Config,
    store: Arc<dyn SessionStore>,
    knowledge: KnowledgeBase,
    http: reqwest::Client,
) -> Arc<AppState> {
    let crm: Arc<dyn CrmClient> = match config.crm_base_url.as_deref() {
        Some(base_url) => Arc::new(HttpCrmClient::new(
            http.clone(),
            base_url,
            config.crm_api_token.clone(),
        )),
        None => {
            info!("CRM_BASE_URL not set, CRM running in dry-run mode");
            Arc::new(DryRunCrm)
        }
    };
    let registry = Arc::new(BrasilApiRegistry::new(
        http.clone(),
        config.registry_base_url.clone(),
    ));
    let finalizer = Arc::new(LeadFinalizer::new(store.clone(), registry, crm.clone()));
    let openai = Arc::new(OpenAiClient::new(
        http.clone(),
        config.openai_api_key.clone(),
        config.openai_chat_model.clone(),
        config.openai_transcribe_model.clone(),
    ));
    let locks = ContactLocks::new();

    let engine = ConversationEngine::new(store.clone(), openai.clone(), finalizer.clone())
        .with_transcriber(openai)
        .with_score_hook(Arc::new(LeadScorer::new(store.clone())))
        .with_filter(ContentFilter::new(&config.profanity_extra_words))
        .with_knowledge(knowledge)
        .with_locks(locks.clone())
        .with_settings(EngineSettings::from(&config));

    let whatsapp = WhatsAppClient::new(http, config.whatsapp.clone(), config.catalog_url.clone());
    let batcher = MessageBatcher::new(
        Arc::new(engine),
        Arc::new(whatsapp.clone()),
        BatchSettings::from(&config),
    );

    Arc::new(AppState {
        config,
        store,
        finalizer,
        crm,
        batcher,
        whatsapp,
        locks,
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/webhook/whatsapp",
            get(whatsapp_webhook_verify).post(whatsapp_webhook_event),
        )
        .route("/webhook/lead", post(lead_webhook))
        .route("/api/icp-codes", get(icp_codes))
        .route("/api/dashboard/stats", get(dashboard_stats))
        .route("/api/contacts/{contact_id}", delete(delete_contact))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "crmConfigured": state.crm.is_configured(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn whatsapp_webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let param = |key: &str| params.get(key).map(String::as_str).unwrap_or("");
    match whatsapp::verify_subscription(
        &state.config.whatsapp.verify_token,
        param("hub.mode"),
        param("hub.verify_token"),
        param("hub.challenge"),
    ) {
        Some(challenge) => (StatusCode::OK, challenge.to_string()).into_response(),
        None => (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "invalid webhook verification token" })),
        )
            .into_response(),
    }
}

async fn whatsapp_webhook_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !whatsapp::verify_signature(&state.config.whatsapp.app_secret, signature_header, &body) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid webhook signature" })),
        )
            .into_response();
    }

    let payload = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));
    let mut processed = 0usize;
    for inbound in whatsapp::parse_webhook(&payload, &state.config.whatsapp.phone_number_id) {
        let (text, audio) = match inbound.content {
            InboundContent::Text(text) => (text, None),
            InboundContent::Audio {
                media_id,
                mime_type,
            } => match state.whatsapp.fetch_media(&media_id, &mime_type).await {
                Ok(clip) => (String::new(), Some(clip)),
                Err(err) => {
                    warn!(contact_id = %inbound.from, error = %err, "audio download failed");
                    let reply = TurnReply::text(AUDIO_FAILURE_REPLY);
                    if let Err(err) = state.whatsapp.deliver(&inbound.from, &reply).await {
                        error!(contact_id = %inbound.from, error = %err, "reply delivery failed");
                    }
                    continue;
                }
            },
        };
        let admission = state.batcher.enqueue(InboundMessage {
            contact_id: inbound.from,
            text,
            audio,
            received_at: inbound.received_at,
        });
        if admission == Admission::Buffered {
            processed += 1;
        }
    }

    (
        StatusCode::OK,
        Json(json!({ "received": true, "processed": processed })),
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct FormLead {
    #[serde(default)]
    pub cnpj: Option<String>,
    #[serde(default)]
    pub nome: Option<String>,
    #[serde(default)]
    pub telefone: Option<String>,
    #[serde(default)]
    pub origem: Option<String>,
}

/// Contact id and initial fields for a form submission, or the 400 message.
pub fn form_lead_fields(form: &FormLead) -> Result<(String, LeadFields), &'static str> {
    let present = |v: &Option<String>| v.as_deref().map(str::trim).filter(|v| !v.is_empty()).map(str::to_string);
    let (Some(cnpj), Some(name), Some(phone)) =
        (present(&form.cnpj), present(&form.nome), present(&form.telefone))
    else {
        return Err("Campos obrigatórios: cnpj, nome, telefone");
    };
    let tax_id = digits_only(&cnpj);
    if !validate_tax_id(&tax_id) {
        return Err("CNPJ inválido");
    }
    let Some(contact_id) = contact_id_for_phone(&phone) else {
        return Err("Telefone inválido");
    };
    let origin = present(&form.origem)
        .map(|o| normalize_origin(&o))
        .filter(|o| !o.is_empty());
    Ok((
        contact_id,
        LeadFields {
            tax_id: Some(tax_id),
            name: Some(name),
            phone: Some(phone),
            origin,
            ..Default::default()
        },
    ))
}

async fn lead_webhook(
    State(state): State<Arc<AppState>>,
    Json(form): Json<FormLead>,
) -> impl IntoResponse {
    let (contact_id, fields) = match form_lead_fields(&form) {
        Ok(parsed) => parsed,
        Err(message) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "error": message })),
            )
                .into_response();
        }
    };
    info!(contact_id = %contact_id, origin = ?fields.origin, "form lead received");

    let _turn = state.locks.acquire(&contact_id).await;
    let outcome: Result<FinalizeOutcome, FinalizeError> = async {
        let contact = state.store.create_contact(&contact_id, fields.clone()).await?;
        let origin = if contact.origin.is_none() {
            fields.origin.clone().map(Some)
        } else {
            None
        };
        state
            .store
            .update_contact(
                &contact_id,
                ContactPatch {
                    tax_id: Some(fields.tax_id.clone()),
                    name: Some(fields.name.clone()),
                    origin,
                    data_cache: Some(contact.merged_memory().merged(&fields)),
                    ..Default::default()
                },
            )
            .await?;
        state.finalizer.finalize(&contact_id).await
    }
    .await;

    match outcome {
        Ok(FinalizeOutcome::Submitted { deal_id, qualified }) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "contactId": contact_id,
                "dealId": deal_id,
                "qualified": qualified,
            })),
        )
            .into_response(),
        Ok(FinalizeOutcome::AlreadyCompleted) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "contactId": contact_id,
                "alreadyCompleted": true,
            })),
        )
            .into_response(),
        Err(err) => {
            error!(contact_id = %contact_id, error = %err, "form lead failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn icp_codes() -> impl IntoResponse {
    let codes = icp::permitted_codes();
    Json(json!({ "success": true, "total": codes.len(), "codes": codes }))
}

async fn dashboard_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.dashboard_stats().await {
        Ok(stats) => (StatusCode::OK, Json(json!(stats))).into_response(),
        Err(err) => {
            error!(error = %err, "dashboard stats failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

async fn delete_contact(
    Path(contact_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let _turn = state.locks.acquire(&contact_id).await;
    match state.store.delete_contact(&contact_id).await {
        Ok(true) => {
            info!(contact_id = %contact_id, "contact deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "contact not found" })),
        )
            .into_response(),
        Err(err) => {
            error!(contact_id = %contact_id, error = %err, "contact delete failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

pub async fn run() {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();

    let store: Arc<dyn SessionStore> = match config.store {
        StoreKind::Memory => {
            warn!("STORE=memory, contacts are lost on restart");
            Arc::new(MemoryStore::new())
        }
        StoreKind::Postgres => Arc::new(
            PgStore::connect(&config.database_url)
                .await
                .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)"),
        ),
    };
    let knowledge = KnowledgeBase::load(
        config.knowledge_base_path.as_deref(),
        config.knowledge_max_chars,
    )
    .await;
    if config.openai_api_key.is_empty() {
        warn!("OPENAI_API_KEY not set, the agent will answer with a fallback message");
    }

    let port = config.port;
    let state = build_state(config, store, knowledge, reqwest::Client::new());
    let app = router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    info!(port, "lead qualifier running at http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}
