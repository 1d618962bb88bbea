use std::{env, path::PathBuf, time::Duration};

use chrono::Duration as ChronoDuration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub phone_number_id: String,
    pub access_token: String,
    pub verify_token: String,
    pub app_secret: String,
}

impl WhatsAppConfig {
    pub fn can_send(&self) -> bool {
        !self.phone_number_id.is_empty() && !self.access_token.is_empty()
    }
}

/// Process-wide settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub store: StoreKind,
    pub database_url: String,
    pub openai_api_key: String,
    pub openai_chat_model: String,
    pub openai_transcribe_model: String,
    pub llm_timeout: Duration,
    pub session_timeout: ChronoDuration,
    pub tax_id_max_attempts: i32,
    pub lockout: ChronoDuration,
    pub history_limit: i64,
    pub batch_debounce: Duration,
    pub batch_capacity: usize,
    pub rate_limit_per_minute: usize,
    pub rate_limit_cooldown: Duration,
    pub knowledge_base_path: Option<PathBuf>,
    pub knowledge_max_chars: usize,
    pub escalation_contact: String,
    pub profanity_extra_words: Vec<String>,
    pub registry_base_url: String,
    pub crm_base_url: Option<String>,
    pub crm_api_token: String,
    pub whatsapp: WhatsAppConfig,
    pub catalog_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4000,
            store: StoreKind::Postgres,
            database_url: String::new(),
            openai_api_key: String::new(),
            openai_chat_model: "gpt-4o-mini".to_string(),
            openai_transcribe_model: "whisper-1".to_string(),
            llm_timeout: Duration::from_secs(45),
            session_timeout: ChronoDuration::hours(24),
            tax_id_max_attempts: 3,
            lockout: ChronoDuration::minutes(60),
            history_limit: 50,
            batch_debounce: Duration::from_millis(3000),
            batch_capacity: 3,
            rate_limit_per_minute: 10,
            rate_limit_cooldown: Duration::from_secs(300),
            knowledge_base_path: None,
            knowledge_max_chars: 50_000,
            escalation_contact: "(11) 4000-1000".to_string(),
            profanity_extra_words: Vec::new(),
            registry_base_url: "https://brasilapi.com.br/api/cnpj/v1".to_string(),
            crm_base_url: None,
            crm_api_token: String::new(),
            whatsapp: WhatsAppConfig {
                phone_number_id: String::new(),
                access_token: String::new(),
                verify_token: String::new(),
                app_secret: String::new(),
            },
            catalog_url: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        let store = match env_string("STORE").to_ascii_lowercase().as_str() {
            "memory" => StoreKind::Memory,
            _ => StoreKind::Postgres,
        };

        Self {
            port: env_parse("PORT", defaults.port),
            store,
            database_url: resolve_database_url(),
            openai_api_key: env_string("OPENAI_API_KEY"),
            openai_chat_model: env_or("OPENAI_CHAT_MODEL", &defaults.openai_chat_model),
            openai_transcribe_model: env_or(
                "OPENAI_TRANSCRIBE_MODEL",
                &defaults.openai_transcribe_model,
            ),
            llm_timeout: Duration::from_secs(env_parse("LLM_TIMEOUT_SECS", 45)),
            session_timeout: ChronoDuration::hours(env_parse("SESSION_TIMEOUT_HOURS", 24)),
            tax_id_max_attempts: env_parse("TAX_ID_MAX_ATTEMPTS", defaults.tax_id_max_attempts)
                .max(1),
            lockout: ChronoDuration::minutes(env_parse("LOCKOUT_MINUTES", 60)),
            history_limit: env_parse("HISTORY_LIMIT", defaults.history_limit).max(1),
            batch_debounce: Duration::from_millis(env_parse("BATCH_DEBOUNCE_MS", 3000)),
            batch_capacity: env_parse("BATCH_CAPACITY", defaults.batch_capacity).max(1),
            rate_limit_per_minute: env_parse("RATE_LIMIT_PER_MINUTE", defaults.rate_limit_per_minute),
            rate_limit_cooldown: Duration::from_secs(env_parse("RATE_LIMIT_COOLDOWN_SECS", 300)),
            knowledge_base_path: env_optional("KNOWLEDGE_BASE_PATH").map(PathBuf::from),
            knowledge_max_chars: env_parse("KNOWLEDGE_MAX_CHARS", defaults.knowledge_max_chars),
            escalation_contact: env_or("ESCALATION_CONTACT", &defaults.escalation_contact),
            profanity_extra_words: env_string("PROFANITY_EXTRA_WORDS")
                .split(',')
                .map(|word| word.trim().to_string())
                .filter(|word| !word.is_empty())
                .collect(),
            registry_base_url: env_or("REGISTRY_BASE_URL", &defaults.registry_base_url)
                .trim_end_matches('/')
                .to_string(),
            crm_base_url: env_optional("CRM_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            crm_api_token: env_string("CRM_API_TOKEN"),
            whatsapp: WhatsAppConfig {
                phone_number_id: env_string("WHATSAPP_PHONE_NUMBER_ID"),
                access_token: env_string("WHATSAPP_ACCESS_TOKEN"),
                verify_token: env_string("WHATSAPP_VERIFY_TOKEN"),
                app_secret: env_string("WHATSAPP_APP_SECRET"),
            },
            catalog_url: env_optional("CATALOG_URL"),
        }
    }
}

fn env_string(key: &str) -> String {
    env::var(key).map(|v| v.trim().to_string()).unwrap_or_default()
}

fn env_optional(key: &str) -> Option<String> {
    Some(env_string(key)).filter(|v| !v.is_empty())
}

fn env_or(key: &str, fallback: &str) -> String {
    env_optional(key).unwrap_or_else(|| fallback.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    env_optional(key)
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(fallback)
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "lead_qualifier".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.port, 4000);
        assert_eq!(config.tax_id_max_attempts, 3);
        assert_eq!(config.lockout, ChronoDuration::hours(1));
        assert_eq!(config.session_timeout, ChronoDuration::hours(24));
        assert_eq!(config.batch_capacity, 3);
        assert_eq!(config.rate_limit_per_minute, 10);
        assert!(config.crm_base_url.is_none());
    }
}
