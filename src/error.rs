//! Error taxonomy for the ingestion, agent and follow-up pipelines.

use thiserror::Error;

/// Errors from the WhatsApp Graph API adapter.
#[derive(Debug, Error)]
pub enum VendorError {
    /// 5xx, timeouts, connection resets. Retried inside the adapter.
    #[error("transient vendor error: {0}")]
    Transient(String),

    /// 401/403. Never retried; surfaces as a configuration problem.
    #[error("config error: vendor rejected credentials ({status}): {body}")]
    Auth { status: u16, body: String },

    /// Any other 4xx.
    #[error("vendor rejected request ({status}): {body}")]
    Permanent { status: u16, body: String },

    /// Media could not be fetched, transcoded or uploaded.
    #[error("media error: {0}")]
    Media(String),

    /// Missing or undecryptable tenant credentials.
    #[error("config error: {0}")]
    Config(String),
}

impl VendorError {
    pub fn is_auth(&self) -> bool {
        matches!(self, VendorError::Auth { .. } | VendorError::Config(_))
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("no LLM API keys configured")]
    NoKeys,

    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("all LLM API keys exhausted: {0}")]
    AllKeysExhausted(String),

    #[error("prompt blocked: {0}")]
    Blocked(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transient LLM error: {0}")]
    Transient(String),

    #[error("LLM returned unparseable JSON after {attempts} attempts: {raw}")]
    Schema { attempts: u32, raw: String },
}

impl LlmError {
    /// Errors that must not be retried with the same or another key.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LlmError::Blocked(_) | LlmError::InvalidArgument(_) | LlmError::NoKeys
        )
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row {table}#{id}: {reason}")]
    Corrupt {
        table: &'static str,
        id: i64,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("queue payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential key must be 32 bytes of base64")]
    BadKey,

    #[error("credential ciphertext is malformed")]
    Malformed,

    #[error("credential decryption failed")]
    Decrypt,

    #[error("credential encryption failed")]
    Encrypt,
}

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("drive request failed: {0}")]
    Request(String),

    #[error("drive returned {status} for file {file_id}")]
    Status { status: u16, file_id: String },
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to launch transcoder: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("transcoder exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Failure of one pipeline run that must make the queue redeliver.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
