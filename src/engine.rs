use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::content_filter::{ContentFilter, SensitiveKind};
use crate::error::{EngineError, LlmError};
use crate::extract::{extract_email, extract_structured, extract_tax_id, strip_control_tags};
use crate::finalizer::{FinalizeOutcome, LeadHandoff};
use crate::knowledge::KnowledgeBase;
use crate::llm::{AudioClip, TextGenerator, Transcriber};
use crate::locks::ContactLocks;
use crate::origin::normalize_origin;
use crate::prompting::{render_system_prompt, SystemPromptContext, INVALID_TAX_ID_NOTE};
use crate::scoring::{NoopScoreHook, ScoreHook};
use crate::store::SessionStore;
use crate::types::{Contact, ContactPatch, LeadFields, MessageRole, PromptMessage, Stage};
use crate::validation::{digits_only, validate_email, validate_tax_id};

pub const GENERIC_FAILURE_REPLY: &str = "Ops! Tive um probleminha aqui 😅 Pode repetir?";
pub const NOT_CONFIGURED_REPLY: &str =
    "Oi! No momento estou com problemas técnicos 😅 Tente novamente mais tarde!";
pub const AUDIO_FAILURE_REPLY: &str = "Tive um problema para ouvir seu áudio 😔 Pode escrever?";
pub const PROFANITY_REPLY: &str =
    "Vou pedir para alguém do nosso time continuar esse atendimento com você. Até já!";
pub const CARD_WARNING_REPLY: &str =
    "Por segurança, não envie dados de cartão por aqui 🔒 Essa mensagem foi descartada. Vamos seguir?";
pub const PASSWORD_WARNING_REPLY: &str =
    "Por segurança, não compartilhe senhas por aqui 🔒 Essa mensagem foi descartada. Vamos seguir?";
pub const INVALID_EMAIL_REPLY: &str =
    "Hmm, esse e-mail não parece certo 🤔 Pode conferir e me mandar de novo?";

/// Turn-level tunables.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub session_timeout: ChronoDuration,
    pub tax_id_max_attempts: i32,
    pub lockout: ChronoDuration,
    pub history_limit: i64,
    pub llm_timeout: Duration,
    pub escalation_contact: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            session_timeout: config.session_timeout,
            tax_id_max_attempts: config.tax_id_max_attempts,
            lockout: config.lockout,
            history_limit: config.history_limit,
            llm_timeout: config.llm_timeout,
            escalation_contact: config.escalation_contact.clone(),
        }
    }
}

/// What goes back to the transport for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReply {
    pub text: String,
    pub send_catalog: bool,
}

impl TurnReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            send_catalog: false,
        }
    }
}

pub struct ConversationEngine {
    store: Arc<dyn SessionStore>,
    generator: Arc<dyn TextGenerator>,
    transcriber: Option<Arc<dyn Transcriber>>,
    handoff: Arc<dyn LeadHandoff>,
    score_hook: Arc<dyn ScoreHook>,
    filter: ContentFilter,
    knowledge: KnowledgeBase,
    clock: Arc<dyn Clock>,
    locks: ContactLocks,
    settings: EngineSettings,
}

/// Tax-id candidate seen directly in the user's text.
struct PreExtraction {
    fields: LeadFields,
    tax_id_submission: Option<String>,
}

fn greeting_after_timeout(name: Option<&str>) -> String {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => format!(
            "Oi, {name}! Que bom falar com você de novo 😄 Vamos recomeçar? Me conta: qual o CNPJ da sua empresa?"
        ),
        None => "Oi! Que bom falar com você 😄 Vamos recomeçar? Me conta: qual o CNPJ da sua empresa?"
            .to_string(),
    }
}

fn lockout_notice(minutes: i64, escalation_contact: &str) -> String {
    format!(
        "Você atingiu o limite de tentativas de CNPJ 😕 Tente novamente em {minutes} minuto(s) \
         ou fale direto com nosso time: {escalation_contact}"
    )
}

fn invalid_tax_id_notice(attempt: i32, max_attempts: i32) -> String {
    format!(
        "Hmm, esse CNPJ não parece válido 🤔 Confere os números pra mim? (tentativa {attempt} de {max_attempts})"
    )
}

fn minutes_until(until: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let seconds = (until - now).num_seconds().max(0);
    ((seconds + 59) / 60).max(1)
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.trim().is_empty())
}

impl ConversationEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        generator: Arc<dyn TextGenerator>,
        handoff: Arc<dyn LeadHandoff>,
    ) -> Self {
        Self {
            store,
            generator,
            transcriber: None,
            handoff,
            score_hook: Arc::new(NoopScoreHook),
            filter: ContentFilter::default(),
            knowledge: KnowledgeBase::empty(),
            clock: Arc::new(SystemClock),
            locks: ContactLocks::new(),
            settings: EngineSettings::default(),
        }
    }

    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn with_score_hook(mut self, hook: Arc<dyn ScoreHook>) -> Self {
        self.score_hook = hook;
        self
    }

    pub fn with_filter(mut self, filter: ContentFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_knowledge(mut self, knowledge: KnowledgeBase) -> Self {
        self.knowledge = knowledge;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_locks(mut self, locks: ContactLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Runs one turn for `contact_id`. Turns for the same contact are serialized.
    /// Only store failures before the message is logged surface as errors; every
    /// other failure becomes an in-character reply.
    pub async fn handle_inbound_message(
        &self,
        contact_id: &str,
        raw_text: &str,
        audio: Option<AudioClip>,
    ) -> Result<TurnReply, EngineError> {
        let _turn = self.locks.acquire(contact_id).await;
        let now = self.clock.now();

        let mut text = raw_text.trim().to_string();
        let mut audio_received = false;
        if let Some(audio) = audio {
            match self.transcribe(&audio).await {
                Ok(transcript) => {
                    audio_received = true;
                    text = if text.is_empty() {
                        format!("[{transcript}]")
                    } else {
                        format!("{text} [{transcript}]")
                    };
                }
                Err(err) => {
                    warn!(contact_id = %contact_id, error = %err, "audio transcription failed");
                    if text.is_empty() {
                        return Ok(TurnReply::text(AUDIO_FAILURE_REPLY));
                    }
                }
            }
        }
        if text.is_empty() {
            return Ok(TurnReply::text(String::new()));
        }

        if self.filter.contains_profanity(&text) {
            warn!(contact_id = %contact_id, "message flagged for moderation");
            self.store
                .create_contact(contact_id, LeadFields::default())
                .await?;
            self.store
                .update_contact(
                    contact_id,
                    ContactPatch {
                        moderation_flagged: Some(true),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(TurnReply::text(PROFANITY_REPLY));
        }

        let sensitive = self.filter.contains_sensitive_data(&text);
        if sensitive.flag {
            warn!(contact_id = %contact_id, kind = ?sensitive.kind, "sensitive data discarded");
            let reply = match sensitive.kind {
                SensitiveKind::Password => PASSWORD_WARNING_REPLY,
                _ => CARD_WARNING_REPLY,
            };
            return Ok(TurnReply::text(reply));
        }

        let mut contact = match self.store.get_contact(contact_id).await? {
            Some(contact) => contact,
            None => {
                info!(contact_id = %contact_id, "new contact");
                self.store
                    .create_contact(contact_id, LeadFields::default())
                    .await?
            }
        };
        let session_id = match contact.session_id.clone() {
            Some(session_id) => session_id,
            None => {
                let session_id = Uuid::new_v4().to_string();
                contact = self
                    .store
                    .update_contact(
                        contact_id,
                        ContactPatch {
                            session_id: Some(session_id.clone()),
                            last_interaction_at: Some(now),
                            ..Default::default()
                        },
                    )
                    .await?;
                session_id
            }
        };

        if let Some(last) = contact.last_interaction_at {
            if now - last > self.settings.session_timeout {
                return self.reset_session(&contact, now).await;
            }
        }

        if let Some(until) = contact.lockout_until {
            if until > now {
                info!(contact_id = %contact_id, until = %until, "turn rejected, tax id lockout active");
                return Ok(TurnReply::text(lockout_notice(
                    minutes_until(until, now),
                    &self.settings.escalation_contact,
                )));
            }
            contact = self
                .store
                .update_contact(
                    contact_id,
                    ContactPatch {
                        lockout_until: Some(None),
                        tax_id_attempts: Some(0),
                        ..Default::default()
                    },
                )
                .await?;
            info!(contact_id = %contact_id, "tax id lockout expired");
        }

        if !self.generator.is_configured() {
            warn!("text generator not configured");
            return Ok(TurnReply::text(NOT_CONFIGURED_REPLY));
        }

        match self
            .run_model_turn(contact, &session_id, &text, audio_received, now)
            .await
        {
            Ok(reply) => Ok(reply),
            Err(err) => {
                error!(contact_id = %contact_id, session_id = %session_id, error = %err, "turn failed");
                Ok(TurnReply::text(GENERIC_FAILURE_REPLY))
            }
        }
    }

    async fn transcribe(&self, audio: &AudioClip) -> Result<String, LlmError> {
        let Some(transcriber) = self.transcriber.as_ref() else {
            return Err(LlmError::NotConfigured);
        };
        transcriber.transcribe(audio).await
    }

    async fn reset_session(
        &self,
        contact: &Contact,
        now: DateTime<Utc>,
    ) -> Result<TurnReply, EngineError> {
        let session_id = Uuid::new_v4().to_string();
        let name = non_blank(&contact.name).or_else(|| non_blank(&contact.data_cache.name));
        info!(
            contact_id = %contact.id,
            session_id = %session_id,
            "session timed out, starting a new one"
        );
        self.store
            .update_contact(
                &contact.id,
                ContactPatch {
                    session_id: Some(session_id),
                    stage: Some(Stage::New),
                    data_cache: Some(LeadFields {
                        name: name.clone(),
                        ..Default::default()
                    }),
                    tax_id_attempts: Some(0),
                    lockout_until: Some(None),
                    origin: Some(None),
                    source: Some(None),
                    campaign: Some(None),
                    tax_id: Some(None),
                    email: Some(None),
                    product: Some(None),
                    quantity: Some(None),
                    deadline: Some(None),
                    name: Some(name.clone()),
                    last_interaction_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        Ok(TurnReply::text(greeting_after_timeout(name.as_deref())))
    }

    async fn notify_score(&self, contact_id: &str) {
        if let Err(err) = self.score_hook.fields_merged(contact_id).await {
            warn!(contact_id = %contact_id, error = %err, "score hook failed");
        }
    }

    /// Valid email and tax id found verbatim in the user text.
    fn pre_extract(text: &str) -> PreExtraction {
        let mut fields = LeadFields::default();
        if let Some(email) = extract_email(text) {
            if validate_email(&email) {
                fields.email = Some(email);
            }
        }

        let tax_id_submission = extract_tax_id(text).map(|candidate| digits_only(&candidate));
        if let Some(digits) = tax_id_submission.as_ref() {
            if validate_tax_id(digits) {
                fields.tax_id = Some(digits.clone());
            }
        }
        PreExtraction {
            fields,
            tax_id_submission,
        }
    }

    async fn run_model_turn(
        &self,
        mut contact: Contact,
        session_id: &str,
        text: &str,
        audio_received: bool,
        now: DateTime<Utc>,
    ) -> Result<TurnReply, EngineError> {
        let contact_id = contact.id.clone();
        self.store
            .add_message(&contact_id, session_id, MessageRole::User, text)
            .await?;

        let pre = Self::pre_extract(text);
        if !pre.fields.is_empty() || audio_received {
            let memory = contact.merged_memory().merged(&pre.fields);
            contact = self
                .store
                .update_contact(
                    &contact_id,
                    ContactPatch {
                        tax_id: pre.fields.tax_id.clone().map(Some),
                        email: pre.fields.email.clone().map(Some),
                        data_cache: Some(memory),
                        audio_received: audio_received.then_some(true),
                        ..Default::default()
                    },
                )
                .await?;
            if !pre.fields.is_empty() {
                self.notify_score(&contact_id).await;
            }
        }
        let invalid_submission = pre
            .tax_id_submission
            .as_deref()
            .is_some_and(|digits| !validate_tax_id(digits));

        let memory = contact.merged_memory();
        let knowledge = self.knowledge.context();
        let system_prompt = render_system_prompt(&SystemPromptContext::new(&memory, &knowledge));
        let mut messages = self
            .store
            .get_history(&contact_id, session_id, self.settings.history_limit)
            .await?
            .into_iter()
            .map(|message| PromptMessage::new(message.role, message.content))
            .collect::<Vec<_>>();
        if invalid_submission {
            messages.push(PromptMessage::new(MessageRole::System, INVALID_TAX_ID_NOTE));
        }

        let timeout = self.settings.llm_timeout;
        let reply = tokio::time::timeout(
            timeout,
            self.generator.generate_reply(&system_prompt, &messages),
        )
        .await
        .map_err(|_| LlmError::Timeout(timeout.as_secs()))??;
        self.store
            .add_message(&contact_id, session_id, MessageRole::Assistant, &reply)
            .await?;

        let from_user = extract_structured(text);
        let from_reply = extract_structured(&reply);
        debug!(
            contact_id = %contact_id,
            user_source = ?from_user.source,
            reply_source = ?from_reply.source,
            "fields extracted"
        );
        let mut extracted = from_user.fields.merged(&from_reply.fields);
        let ready = from_user.ready || from_reply.ready;
        let confirmed = from_user.confirmed;

        let mut patch = ContactPatch {
            last_interaction_at: Some(now),
            ..Default::default()
        };

        let tax_id_candidate = non_blank(&extracted.tax_id).or(pre.tax_id_submission);
        if let Some(candidate) = tax_id_candidate {
            let digits = digits_only(&candidate);
            if validate_tax_id(&digits) {
                extracted.tax_id = Some(digits);
                if contact.tax_id_attempts != 0 {
                    patch.tax_id_attempts = Some(0);
                }
            } else {
                let attempts = contact.tax_id_attempts + 1;
                patch.tax_id_attempts = Some(attempts);
                if attempts >= self.settings.tax_id_max_attempts {
                    let until = now + self.settings.lockout;
                    patch.lockout_until = Some(Some(until));
                    self.store.update_contact(&contact_id, patch).await?;
                    warn!(contact_id = %contact_id, attempts, until = %until, "tax id lockout engaged");
                    return Ok(TurnReply::text(lockout_notice(
                        self.settings.lockout.num_minutes(),
                        &self.settings.escalation_contact,
                    )));
                }
                self.store.update_contact(&contact_id, patch).await?;
                info!(contact_id = %contact_id, attempts, "invalid tax id rejected");
                return Ok(TurnReply::text(invalid_tax_id_notice(
                    attempts,
                    self.settings.tax_id_max_attempts,
                )));
            }
        }

        if let Some(email) = non_blank(&extracted.email) {
            if !validate_email(&email) {
                self.store.update_contact(&contact_id, patch).await?;
                return Ok(TurnReply::text(INVALID_EMAIL_REPLY));
            }
        }

        // Attribution is written once per session.
        if contact.origin.is_some() {
            extracted.origin = None;
        } else {
            extracted.origin = non_blank(&extracted.origin)
                .map(|origin| normalize_origin(&origin))
                .filter(|origin| !origin.is_empty());
        }
        if contact.source.is_some() {
            extracted.source = None;
        }
        if contact.campaign.is_some() {
            extracted.campaign = None;
        }

        let (clean_reply, send_catalog) = strip_control_tags(&reply);
        let memory = contact.merged_memory().merged(&extracted);
        let target = if memory.is_empty() {
            Stage::Initial
        } else {
            Stage::Collecting
        };
        let column = |value: &Option<String>| non_blank(value).map(Some);
        patch.tax_id = column(&extracted.tax_id);
        patch.name = column(&extracted.name);
        patch.email = column(&extracted.email);
        patch.origin = column(&extracted.origin);
        patch.source = column(&extracted.source);
        patch.campaign = column(&extracted.campaign);
        patch.product = column(&extracted.product);
        patch.quantity = column(&extracted.quantity);
        patch.deadline = column(&extracted.deadline);
        patch.stage = Some(contact.stage.advance_to(target));
        patch.data_cache = Some(memory);
        if send_catalog {
            patch.catalog_sent = Some(true);
        }
        let updated = self.store.update_contact(&contact_id, patch).await?;

        self.notify_score(&contact_id).await;

        let should_finalize = ready || (confirmed && updated.has_minimal_data());
        if should_finalize && updated.stage != Stage::Completed {
            info!(contact_id = %contact_id, ready, confirmed, "collection complete, finalizing lead");
            match self.handoff.finalize(&contact_id).await {
                Ok(FinalizeOutcome::Submitted { deal_id, qualified }) => {
                    info!(contact_id = %contact_id, deal_id = ?deal_id, qualified, "lead finalized");
                }
                Ok(FinalizeOutcome::AlreadyCompleted) => {}
                Err(err) => {
                    error!(contact_id = %contact_id, error = %err, "lead finalization failed");
                }
            }
        }

        Ok(TurnReply {
            text: clean_reply,
            send_catalog,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::FinalizeError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const CONTACT: &str = "5511987654321";

    struct ScriptedGenerator {
        replies: Mutex<VecDeque<String>>,
        prompts: Mutex<Vec<(String, Vec<PromptMessage>)>>,
    }

    impl ScriptedGenerator {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }

        fn last_messages(&self) -> Vec<PromptMessage> {
            self.prompts.lock().unwrap().last().unwrap().1.clone()
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate_reply(
            &self,
            system_prompt: &str,
            messages: &[PromptMessage],
        ) -> Result<String, LlmError> {
            self.prompts
                .lock()
                .unwrap()
                .push((system_prompt.to_string(), messages.to_vec()));
            Ok(self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "Certo! Algo mais? 😄".to_string()))
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl TextGenerator for FailingGenerator {
        async fn generate_reply(
            &self,
            _system_prompt: &str,
            _messages: &[PromptMessage],
        ) -> Result<String, LlmError> {
            Err(LlmError::EmptyContent)
        }
    }

    struct UnconfiguredGenerator;

    #[async_trait]
    impl TextGenerator for UnconfiguredGenerator {
        fn is_configured(&self) -> bool {
            false
        }

        async fn generate_reply(
            &self,
            _system_prompt: &str,
            _messages: &[PromptMessage],
        ) -> Result<String, LlmError> {
            Err(LlmError::NotConfigured)
        }
    }

    #[derive(Default)]
    struct CountingHandoff {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LeadHandoff for CountingHandoff {
        async fn finalize(&self, contact_id: &str) -> Result<FinalizeOutcome, FinalizeError> {
            self.calls.lock().unwrap().push(contact_id.to_string());
            Ok(FinalizeOutcome::Submitted {
                deal_id: Some("deal-1".into()),
                qualified: true,
            })
        }
    }

    struct FixedTranscriber(Result<&'static str, ()>);

    #[async_trait]
    impl Transcriber for FixedTranscriber {
        async fn transcribe(&self, _audio: &AudioClip) -> Result<String, LlmError> {
            self.0
                .map(str::to_string)
                .map_err(|_| LlmError::EmptyContent)
        }
    }

    #[derive(Default)]
    struct CountingScoreHook {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl ScoreHook for CountingScoreHook {
        async fn fields_merged(&self, _contact_id: &str) -> Result<(), crate::error::StoreError> {
            *self.calls.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()
    }

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        handoff: Arc<CountingHandoff>,
        engine: ConversationEngine,
    }

    fn harness(generator: Arc<dyn TextGenerator>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let handoff = Arc::new(CountingHandoff::default());
        let engine = ConversationEngine::new(store.clone(), generator, handoff.clone())
            .with_clock(clock.clone());
        Harness {
            store,
            clock,
            handoff,
            engine,
        }
    }

    fn audio() -> AudioClip {
        AudioClip {
            bytes: vec![1, 2, 3],
            mime_type: "audio/ogg".into(),
        }
    }

    #[tokio::test]
    async fn first_message_creates_contact_and_session() {
        let generator = ScriptedGenerator::new(&["Bom dia! Sou a Márcia 😄 Qual o CNPJ da sua empresa?"]);
        let h = harness(generator.clone());

        let reply = h.engine.handle_inbound_message(CONTACT, "Oi", None).await.unwrap();
        assert!(reply.text.starts_with("Bom dia!"));

        let contact = h.store.get_contact(CONTACT).await.unwrap().unwrap();
        assert!(contact.session_id.is_some());
        assert_eq!(contact.stage, Stage::Initial);
        assert_eq!(contact.last_interaction_at, Some(start()));
        assert_eq!(h.store.message_count(CONTACT).await, 2);
        assert!(h.handoff.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn profanity_flags_contact_without_model_call() {
        let generator = ScriptedGenerator::new(&[]);
        let h = harness(generator.clone());
        let reply = h
            .engine
            .handle_inbound_message(CONTACT, "que merda", None)
            .await
            .unwrap();
        assert_eq!(reply.text, PROFANITY_REPLY);
        assert_eq!(generator.calls(), 0);
        let contact = h.store.get_contact(CONTACT).await.unwrap().unwrap();
        assert!(contact.moderation_flagged);
    }

    #[tokio::test]
    async fn sensitive_data_is_discarded() {
        let generator = ScriptedGenerator::new(&[]);
        let h = harness(generator.clone());
        let reply = h
            .engine
            .handle_inbound_message(CONTACT, "cartão 4111 1111 1111 1111", None)
            .await
            .unwrap();
        assert_eq!(reply.text, CARD_WARNING_REPLY);
        assert_eq!(generator.calls(), 0);
        assert_eq!(h.store.message_count(CONTACT).await, 0);
    }

    #[tokio::test]
    async fn valid_tax_id_in_user_text_reaches_the_prompt_memory() {
        let generator = ScriptedGenerator::new(&["Anotado! Qual o seu nome?"]);
        let h = harness(generator.clone());
        h.engine
            .handle_inbound_message(CONTACT, "meu cnpj é 08.054.886/0001-68", None)
            .await
            .unwrap();

        let (system_prompt, _) = generator.prompts.lock().unwrap()[0].clone();
        assert!(system_prompt.contains("08054886000168"));
        let contact = h.store.get_contact(CONTACT).await.unwrap().unwrap();
        assert_eq!(contact.tax_id.as_deref(), Some("08054886000168"));
        assert_eq!(contact.data_cache.tax_id.as_deref(), Some("08054886000168"));
        assert_eq!(contact.stage, Stage::Collecting);
    }

    #[tokio::test]
    async fn phone_before_tax_id_does_not_count_as_a_submission() {
        let generator = ScriptedGenerator::new(&["Anotado, Ana! Qual o seu e-mail?"]);
        let h = harness(generator.clone());
        let reply = h
            .engine
            .handle_inbound_message(CONTACT, "Ana 11987654321 cnpj 08054886000168", None)
            .await
            .unwrap();

        assert_eq!(reply.text, "Anotado, Ana! Qual o seu e-mail?");
        assert!(generator
            .last_messages()
            .iter()
            .all(|m| m.role != MessageRole::System));
        let contact = h.store.get_contact(CONTACT).await.unwrap().unwrap();
        assert_eq!(contact.tax_id_attempts, 0);
        assert_eq!(contact.tax_id.as_deref(), Some("08054886000168"));
    }

    #[tokio::test]
    async fn early_field_merge_notifies_the_score_hook_before_rejection() {
        let generator = ScriptedGenerator::new(&[]);
        let hook = Arc::new(CountingScoreHook::default());
        let mut h = harness(generator.clone());
        h.engine = h.engine.with_score_hook(hook.clone());

        let reply = h
            .engine
            .handle_inbound_message(
                CONTACT,
                "cnpj 08054886000199 email ana@casadasserras.com.br",
                None,
            )
            .await
            .unwrap();

        assert_eq!(reply.text, invalid_tax_id_notice(1, 3));
        assert_eq!(*hook.calls.lock().unwrap(), 1);
        let contact = h.store.get_contact(CONTACT).await.unwrap().unwrap();
        assert_eq!(contact.email.as_deref(), Some("ana@casadasserras.com.br"));
    }

    #[tokio::test]
    async fn invalid_tax_id_adds_transient_note_and_counts_an_attempt() {
        let generator = ScriptedGenerator::new(&["Esse CNPJ parece incorreto."]);
        let h = harness(generator.clone());
        let reply = h
            .engine
            .handle_inbound_message(CONTACT, "cnpj 08054886000199", None)
            .await
            .unwrap();

        assert_eq!(reply.text, invalid_tax_id_notice(1, 3));
        let messages = generator.last_messages();
        let note = messages.last().unwrap();
        assert_eq!(note.role, MessageRole::System);
        assert_eq!(note.content, INVALID_TAX_ID_NOTE);

        let contact = h.store.get_contact(CONTACT).await.unwrap().unwrap();
        assert_eq!(contact.tax_id_attempts, 1);
        assert!(contact.tax_id.is_none());
        let session = contact.session_id.unwrap();
        let stored = h.store.get_history(CONTACT, &session, 50).await.unwrap();
        assert!(stored.iter().all(|m| m.role != MessageRole::System));
    }

    #[tokio::test]
    async fn three_invalid_tax_ids_lock_out_for_exactly_one_hour() {
        let generator = ScriptedGenerator::new(&[]);
        let h = harness(generator.clone());
        for _ in 0..3 {
            h.engine
                .handle_inbound_message(CONTACT, "cnpj 08054886000199", None)
                .await
                .unwrap();
        }
        let contact = h.store.get_contact(CONTACT).await.unwrap().unwrap();
        assert_eq!(contact.tax_id_attempts, 3);
        assert_eq!(contact.lockout_until, Some(start() + ChronoDuration::hours(1)));

        h.clock.advance(ChronoDuration::minutes(30));
        let calls_before = generator.calls();
        let reply = h
            .engine
            .handle_inbound_message(CONTACT, "cnpj 08054886000199", None)
            .await
            .unwrap();
        assert!(reply.text.contains("30 minuto(s)"));
        assert_eq!(generator.calls(), calls_before);
        let contact = h.store.get_contact(CONTACT).await.unwrap().unwrap();
        assert_eq!(contact.tax_id_attempts, 3);

        h.clock.advance(ChronoDuration::minutes(31));
        h.engine
            .handle_inbound_message(CONTACT, "cnpj 08054886000168", None)
            .await
            .unwrap();
        let contact = h.store.get_contact(CONTACT).await.unwrap().unwrap();
        assert_eq!(contact.tax_id_attempts, 0);
        assert!(contact.lockout_until.is_none());
        assert_eq!(contact.tax_id.as_deref(), Some("08054886000168"));
    }

    #[tokio::test]
    async fn invalid_email_is_rejected() {
        let generator =
            ScriptedGenerator::new(&["Perfeito!\n{\"email\": \"ana@loja\", \"nome\": \"Ana\"}"]);
        let h = harness(generator.clone());
        let reply = h
            .engine
            .handle_inbound_message(CONTACT, "meu email é ana@loja", None)
            .await
            .unwrap();
        assert_eq!(reply.text, INVALID_EMAIL_REPLY);
        let contact = h.store.get_contact(CONTACT).await.unwrap().unwrap();
        assert!(contact.email.is_none());
        assert!(contact.name.is_none());
    }

    #[tokio::test]
    async fn ready_reply_triggers_handoff_once() {
        let generator = ScriptedGenerator::new(&[
            "Obrigada, Ana! Já encaminhei 🚀\n{\"cnpj\": \"08054886000168\", \"nome\": \"Ana\", \"telefone\": \"11987654321\"}",
        ]);
        let h = harness(generator.clone());
        let reply = h
            .engine
            .handle_inbound_message(
                CONTACT,
                "CNPJ: 08.054.886/0001-68\nNome: Ana\nTelefone: 11987654321",
                None,
            )
            .await
            .unwrap();
        assert_eq!(reply.text, "Obrigada, Ana! Já encaminhei 🚀");
        assert_eq!(h.handoff.calls.lock().unwrap().len(), 1);
        let contact = h.store.get_contact(CONTACT).await.unwrap().unwrap();
        assert_eq!(contact.name.as_deref(), Some("Ana"));
        assert_eq!(contact.data_cache.phone.as_deref(), Some("11987654321"));
    }

    #[tokio::test]
    async fn confirmation_with_minimal_data_triggers_handoff() {
        let generator = ScriptedGenerator::new(&["Tudo certo então!"]);
        let h = harness(generator.clone());
        h.store.create_contact(CONTACT, LeadFields::default()).await.unwrap();
        h.store
            .update_contact(
                CONTACT,
                ContactPatch {
                    session_id: Some("s1".into()),
                    last_interaction_at: Some(start()),
                    tax_id: Some(Some("08054886000168".into())),
                    name: Some(Some("Ana".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        h.engine
            .handle_inbound_message(CONTACT, "sim, está correto", None)
            .await
            .unwrap();
        assert_eq!(h.handoff.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn completed_contact_is_not_finalized_again() {
        let generator = ScriptedGenerator::new(&["Tudo certo então!"]);
        let h = harness(generator.clone());
        h.store.create_contact(CONTACT, LeadFields::default()).await.unwrap();
        h.store
            .update_contact(
                CONTACT,
                ContactPatch {
                    session_id: Some("s1".into()),
                    last_interaction_at: Some(start()),
                    tax_id: Some(Some("08054886000168".into())),
                    name: Some(Some("Ana".into())),
                    stage: Some(Stage::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        h.engine
            .handle_inbound_message(CONTACT, "ok", None)
            .await
            .unwrap();
        assert!(h.handoff.calls.lock().unwrap().is_empty());
        let contact = h.store.get_contact(CONTACT).await.unwrap().unwrap();
        assert_eq!(contact.stage, Stage::Completed);
    }

    #[tokio::test]
    async fn timeout_resets_session_but_keeps_name() {
        let generator = ScriptedGenerator::new(&[]);
        let h = harness(generator.clone());
        h.store.create_contact(CONTACT, LeadFields::default()).await.unwrap();
        h.store
            .update_contact(
                CONTACT,
                ContactPatch {
                    session_id: Some("old-session".into()),
                    last_interaction_at: Some(start() - ChronoDuration::hours(25)),
                    name: Some(Some("Ana".into())),
                    origin: Some(Some("Instagram".into())),
                    stage: Some(Stage::Collecting),
                    tax_id_attempts: Some(2),
                    data_cache: Some(LeadFields {
                        name: Some("Ana".into()),
                        origin: Some("Instagram".into()),
                        product: Some("discos".into()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let reply = h
            .engine
            .handle_inbound_message(CONTACT, "oi de novo", None)
            .await
            .unwrap();
        assert!(reply.text.starts_with("Oi, Ana!"));
        assert_eq!(generator.calls(), 0);

        let contact = h.store.get_contact(CONTACT).await.unwrap().unwrap();
        assert_ne!(contact.session_id.as_deref(), Some("old-session"));
        assert_eq!(contact.name.as_deref(), Some("Ana"));
        assert!(contact.origin.is_none());
        assert_eq!(contact.stage, Stage::New);
        assert_eq!(contact.tax_id_attempts, 0);
        assert_eq!(contact.data_cache.name.as_deref(), Some("Ana"));
        assert!(contact.data_cache.product.is_none());
        assert_eq!(contact.last_interaction_at, Some(start()));
    }

    #[tokio::test]
    async fn origin_is_normalized_and_written_once() {
        let generator = ScriptedGenerator::new(&[
            "Legal!\n[DATA]\nOrigem: vi no insta\n[/DATA]",
            "Entendi!\n[DATA]\nOrigem: pelo site\n[/DATA]",
        ]);
        let h = harness(generator.clone());
        h.engine
            .handle_inbound_message(CONTACT, "vi no insta", None)
            .await
            .unwrap();
        h.engine
            .handle_inbound_message(CONTACT, "também vi no site", None)
            .await
            .unwrap();
        let contact = h.store.get_contact(CONTACT).await.unwrap().unwrap();
        assert_eq!(contact.origin.as_deref(), Some("Instagram"));
        assert_eq!(contact.data_cache.origin.as_deref(), Some("Instagram"));
    }

    #[tokio::test]
    async fn model_failure_becomes_generic_reply() {
        let h = harness(Arc::new(FailingGenerator));
        let reply = h
            .engine
            .handle_inbound_message(CONTACT, "Oi", None)
            .await
            .unwrap();
        assert_eq!(reply.text, GENERIC_FAILURE_REPLY);
        // The triggering message stays logged.
        assert_eq!(h.store.message_count(CONTACT).await, 1);
    }

    #[tokio::test]
    async fn missing_model_configuration_has_fixed_reply() {
        let h = harness(Arc::new(UnconfiguredGenerator));
        let reply = h
            .engine
            .handle_inbound_message(CONTACT, "Oi", None)
            .await
            .unwrap();
        assert_eq!(reply.text, NOT_CONFIGURED_REPLY);
    }

    #[tokio::test]
    async fn catalog_tag_is_stripped_and_recorded() {
        let generator = ScriptedGenerator::new(&["Claro, vou te mandar o catálogo! [SEND_CATALOG]"]);
        let h = harness(generator.clone());
        let reply = h
            .engine
            .handle_inbound_message(CONTACT, "me manda o catálogo", None)
            .await
            .unwrap();
        assert_eq!(reply.text, "Claro, vou te mandar o catálogo!");
        assert!(reply.send_catalog);
        let contact = h.store.get_contact(CONTACT).await.unwrap().unwrap();
        assert!(contact.catalog_sent);
    }

    #[tokio::test]
    async fn audio_transcript_is_appended_in_brackets() {
        let generator = ScriptedGenerator::new(&["Entendi!"]);
        let h = harness(generator.clone());
        let engine = h
            .engine
            .with_transcriber(Arc::new(FixedTranscriber(Ok("quero discos de porcelanato"))));
        engine
            .handle_inbound_message(CONTACT, "olha", Some(audio()))
            .await
            .unwrap();
        let messages = generator.last_messages();
        assert_eq!(messages[0].content, "olha [quero discos de porcelanato]");
        let contact = h.store.get_contact(CONTACT).await.unwrap().unwrap();
        assert!(contact.audio_received);
    }

    #[tokio::test]
    async fn failed_transcription_of_audio_only_message_asks_to_write() {
        let generator = ScriptedGenerator::new(&[]);
        let h = harness(generator.clone());
        let engine = h.engine.with_transcriber(Arc::new(FixedTranscriber(Err(()))));
        let reply = engine
            .handle_inbound_message(CONTACT, "", Some(audio()))
            .await
            .unwrap();
        assert_eq!(reply.text, AUDIO_FAILURE_REPLY);
        assert_eq!(generator.calls(), 0);
    }
}
