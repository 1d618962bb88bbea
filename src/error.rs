use thiserror::Error;

/// The system of record could not be read or written. Fatal to a turn.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row for contact {contact_id}: {detail}")]
    Corrupt { contact_id: String, detail: String },

    #[error("contact not found: {0}")]
    ContactNotFound(String),
}

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("OPENAI_API_KEY not configured")]
    NotConfigured,

    #[error("model request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("model returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("model response had empty content")]
    EmptyContent,

    #[error("model call timed out after {0}s")]
    Timeout(u64),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("tax id not found in registry: {0}")]
    NotFound(String),

    #[error("malformed tax id: {0}")]
    Malformed(String),

    #[error("registry request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("registry returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("registry payload could not be decoded: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum CrmError {
    #[error("entity already exists: {0}")]
    AlreadyExists(String),

    #[error("crm request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("crm returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("crm response missing deal id")]
    MissingDealId,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("whatsapp transport not configured: {0}")]
    NotConfigured(&'static str),

    #[error("whatsapp request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("whatsapp returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{0}")]
    Media(String),
}

#[derive(Error, Debug)]
pub enum FinalizeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Crm(#[from] CrmError),

    #[error("contact {0} has no tax id to finalize")]
    MissingTaxId(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Llm(#[from] LlmError),
}
