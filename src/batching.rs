use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::engine::{ConversationEngine, TurnReply};
use crate::error::{EngineError, TransportError};
use crate::llm::AudioClip;

const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub contact_id: String,
    pub text: String,
    pub audio: Option<AudioClip>,
    pub received_at: DateTime<Utc>,
}

/// Whatever runs a coalesced turn. The engine in production, fakes in tests.
#[async_trait]
pub trait TurnHandler: Send + Sync {
    async fn handle_turn(
        &self,
        contact_id: &str,
        text: &str,
        audio: Option<AudioClip>,
    ) -> Result<TurnReply, EngineError>;
}

#[async_trait]
impl TurnHandler for ConversationEngine {
    async fn handle_turn(
        &self,
        contact_id: &str,
        text: &str,
        audio: Option<AudioClip>,
    ) -> Result<TurnReply, EngineError> {
        self.handle_inbound_message(contact_id, text, audio).await
    }
}

/// Delivers a turn's reply back over the channel the messages came from.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn deliver(&self, contact_id: &str, reply: &TurnReply) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub debounce: Duration,
    pub capacity: usize,
    pub rate_limit_per_minute: usize,
    pub rate_limit_cooldown: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for BatchSettings {
    fn from(config: &Config) -> Self {
        Self {
            debounce: config.batch_debounce,
            capacity: config.batch_capacity.max(1),
            rate_limit_per_minute: config.rate_limit_per_minute,
            rate_limit_cooldown: config.rate_limit_cooldown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Buffered,
    RateLimited,
}

#[derive(Default)]
struct PendingBatch {
    messages: VecDeque<InboundMessage>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RateWindow {
    hits: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

impl RateWindow {
    /// Records a hit at `now`; false once the contact is over the limit.
    fn admit(&mut self, now: Instant, settings: &BatchSettings) -> bool {
        if let Some(until) = self.blocked_until {
            if now < until {
                return false;
            }
            self.blocked_until = None;
            self.hits.clear();
        }
        while self
            .hits
            .front()
            .is_some_and(|hit| now.duration_since(*hit) >= RATE_WINDOW)
        {
            self.hits.pop_front();
        }
        self.hits.push_back(now);
        if settings.rate_limit_per_minute > 0 && self.hits.len() > settings.rate_limit_per_minute {
            self.blocked_until = Some(now + settings.rate_limit_cooldown);
            return false;
        }
        true
    }

    /// No hit inside the window and no cooldown running.
    fn is_idle(&self, now: Instant) -> bool {
        let unblocked = self.blocked_until.map_or(true, |until| now >= until);
        let quiet = self
            .hits
            .back()
            .map_or(true, |hit| now.duration_since(*hit) >= RATE_WINDOW);
        unblocked && quiet
    }
}

#[derive(Default)]
struct BatchState {
    pending: HashMap<String, PendingBatch>,
    rates: HashMap<String, RateWindow>,
}

struct BatcherInner {
    handler: Arc<dyn TurnHandler>,
    sink: Arc<dyn ReplySink>,
    settings: BatchSettings,
    state: Mutex<BatchState>,
}

/// Per-contact debounce in front of the engine. Timers and counters live in
/// this process; run a single instance.
#[derive(Clone)]
pub struct MessageBatcher {
    inner: Arc<BatcherInner>,
}

impl MessageBatcher {
    pub fn new(
        handler: Arc<dyn TurnHandler>,
        sink: Arc<dyn ReplySink>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                handler,
                sink,
                settings,
                state: Mutex::new(BatchState::default()),
            }),
        }
    }

    pub fn enqueue(&self, message: InboundMessage) -> Admission {
        let contact_id = message.contact_id.clone();
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let now = Instant::now();
        state
            .rates
            .retain(|id, window| id == &contact_id || !window.is_idle(now));
        let admitted = state
            .rates
            .entry(contact_id.clone())
            .or_default()
            .admit(now, &self.inner.settings);
        if !admitted {
            if let Some(batch) = state.pending.remove(&contact_id) {
                if let Some(timer) = batch.timer {
                    timer.abort();
                }
            }
            warn!(contact_id = %contact_id, "rate limit exceeded, message dropped");
            return Admission::RateLimited;
        }

        let capacity = self.inner.settings.capacity;
        let batch = state.pending.entry(contact_id.clone()).or_default();
        batch.messages.push_back(message);
        while batch.messages.len() > capacity {
            batch.messages.pop_front();
        }
        batch.generation += 1;
        if let Some(previous) = batch.timer.take() {
            previous.abort();
        }

        let generation = batch.generation;
        let inner = self.inner.clone();
        batch.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.settings.debounce).await;
            flush(inner, contact_id, generation).await;
        }));
        Admission::Buffered
    }

    /// Messages currently waiting for `contact_id`'s timer.
    pub fn pending_len(&self, contact_id: &str) -> usize {
        let state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state
            .pending
            .get(contact_id)
            .map(|batch| batch.messages.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn tracked_rate_windows(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .rates
            .len()
    }
}

async fn flush(inner: Arc<BatcherInner>, contact_id: String, generation: u64) {
    let messages = {
        let mut state = inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = state
            .pending
            .get(&contact_id)
            .is_some_and(|batch| batch.generation == generation);
        if !current {
            return;
        }
        match state.pending.remove(&contact_id) {
            Some(batch) => batch.messages,
            None => return,
        }
    };

    let Some((text, audio)) = coalesce(messages) else {
        return;
    };
    debug!(contact_id = %contact_id, chars = text.len(), "flushing batched turn");

    let reply = match inner.handler.handle_turn(&contact_id, &text, audio).await {
        Ok(reply) => reply,
        Err(err) => {
            error!(contact_id = %contact_id, error = %err, "batched turn failed");
            return;
        }
    };
    if reply.text.trim().is_empty() && !reply.send_catalog {
        return;
    }
    if let Err(err) = inner.sink.deliver(&contact_id, &reply).await {
        error!(contact_id = %contact_id, error = %err, "reply delivery failed");
    }
}

/// Timestamp-ordered, space-joined text plus the latest message's audio.
fn coalesce(messages: VecDeque<InboundMessage>) -> Option<(String, Option<AudioClip>)> {
    let mut messages = Vec::from(messages);
    messages.sort_by_key(|m| m.received_at);
    let audio = messages.last()?.audio.clone();
    let text = messages
        .iter()
        .map(|m| m.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    Some((text, audio))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Default)]
    struct RecordingHandler {
        turns: Mutex<Vec<(String, String, bool)>>,
    }

    #[async_trait]
    impl TurnHandler for RecordingHandler {
        async fn handle_turn(
            &self,
            contact_id: &str,
            text: &str,
            audio: Option<AudioClip>,
        ) -> Result<TurnReply, EngineError> {
            self.turns.lock().unwrap().push((
                contact_id.to_string(),
                text.to_string(),
                audio.is_some(),
            ));
            Ok(TurnReply::text(format!("eco: {text}")))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ReplySink for RecordingSink {
        async fn deliver(&self, contact_id: &str, reply: &TurnReply) -> Result<(), TransportError> {
            self.delivered
                .lock()
                .unwrap()
                .push((contact_id.to_string(), reply.text.clone()));
            Ok(())
        }
    }

    fn message(contact_id: &str, text: &str, second: u32) -> InboundMessage {
        InboundMessage {
            contact_id: contact_id.to_string(),
            text: text.to_string(),
            audio: None,
            received_at: Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, second).unwrap(),
        }
    }

    fn batcher(
        settings: BatchSettings,
    ) -> (MessageBatcher, Arc<RecordingHandler>, Arc<RecordingSink>) {
        let handler = Arc::new(RecordingHandler::default());
        let sink = Arc::new(RecordingSink::default());
        let batcher = MessageBatcher::new(handler.clone(), sink.clone(), settings);
        (batcher, handler, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_becomes_one_turn_in_send_order() {
        let (batcher, handler, sink) = batcher(BatchSettings::default());
        batcher.enqueue(message("c1", "meu cnpj", 0));
        tokio::time::sleep(Duration::from_millis(300)).await;
        batcher.enqueue(message("c1", "é 08.054.886/0001-68", 1));
        tokio::time::sleep(Duration::from_millis(300)).await;
        batcher.enqueue(message("c1", "obrigado", 1));

        tokio::time::sleep(Duration::from_secs(4)).await;
        let turns = handler.turns.lock().unwrap().clone();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].1, "meu cnpj é 08.054.886/0001-68 obrigado");
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
        assert_eq!(batcher.pending_len("c1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_keeps_only_the_newest_messages() {
        let (batcher, handler, _sink) = batcher(BatchSettings::default());
        for (i, text) in ["um", "dois", "três", "quatro"].iter().enumerate() {
            batcher.enqueue(message("c1", text, i as u32));
        }
        assert_eq!(batcher.pending_len("c1"), 3);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(handler.turns.lock().unwrap()[0].1, "dois três quatro");
    }

    #[tokio::test(start_paused = true)]
    async fn contacts_are_batched_independently() {
        let (batcher, handler, _sink) = batcher(BatchSettings::default());
        batcher.enqueue(message("c1", "oi", 0));
        batcher.enqueue(message("c2", "olá", 0));
        tokio::time::sleep(Duration::from_secs(4)).await;
        let mut contacts = handler
            .turns
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.0.clone())
            .collect::<Vec<_>>();
        contacts.sort();
        assert_eq!(contacts, vec!["c1", "c2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_senders_stop_being_tracked() {
        let (batcher, _handler, _sink) = batcher(BatchSettings::default());
        batcher.enqueue(message("c1", "oi", 0));
        batcher.enqueue(message("c2", "olá", 0));
        assert_eq!(batcher.tracked_rate_windows(), 2);

        tokio::time::sleep(Duration::from_secs(61)).await;
        batcher.enqueue(message("c3", "bom dia", 0));
        assert_eq!(batcher.tracked_rate_windows(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn only_latest_audio_is_forwarded() {
        let (batcher, handler, _sink) = batcher(BatchSettings::default());
        let mut first = message("c1", "", 0);
        first.audio = Some(AudioClip {
            bytes: vec![1],
            mime_type: "audio/ogg".into(),
        });
        batcher.enqueue(first);
        batcher.enqueue(message("c1", "escrevi agora", 1));
        tokio::time::sleep(Duration::from_secs(4)).await;
        let turns = handler.turns.lock().unwrap().clone();
        assert_eq!(turns[0].1, "escrevi agora");
        assert!(!turns[0].2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_blocks_for_the_cooldown() {
        let settings = BatchSettings {
            debounce: Duration::from_millis(100),
            capacity: 3,
            rate_limit_per_minute: 2,
            rate_limit_cooldown: Duration::from_secs(300),
        };
        let (batcher, handler, _sink) = batcher(settings);
        assert_eq!(batcher.enqueue(message("c1", "a", 0)), Admission::Buffered);
        assert_eq!(batcher.enqueue(message("c1", "b", 1)), Admission::Buffered);
        assert_eq!(batcher.enqueue(message("c1", "c", 2)), Admission::RateLimited);
        assert_eq!(batcher.pending_len("c1"), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(batcher.enqueue(message("c1", "d", 3)), Admission::RateLimited);
        assert!(handler.turns.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(181)).await;
        assert_eq!(batcher.enqueue(message("c1", "e", 4)), Admission::Buffered);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handler.turns.lock().unwrap()[0].1, "e");
    }
}
