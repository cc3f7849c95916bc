use std::{env, time::Duration};

use tracing::warn;

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub queue_url: String,
    pub queue_name: String,
    pub port: u16,
    pub verify_token: String,
    pub app_secret: String,
    pub webhook_base_url: String,
    pub graph_api_base: String,
    pub graph_api_version: String,
    pub credentials_key: String,
    pub llm_api_keys: Vec<String>,
    pub llm_api_base: String,
    pub llm_model: String,
    pub llm_tries_per_key: u32,
    pub llm_json_retries: u32,
    pub frontend_origins: Vec<String>,
    pub flood_cutoff: Duration,
    pub settle_delay: Duration,
    pub agent_poll: Duration,
    pub agent_batch_size: usize,
    pub followup_poll: Duration,
    pub worker_concurrency: usize,
    pub drive_api_base: String,
    pub drive_access_token: String,
    pub ffmpeg_path: String,
}

fn env_text(name: &str) -> String {
    env::var(name)
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

fn env_or(name: &str, fallback: &str) -> String {
    let value = env_text(name);
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

fn env_number<T>(name: &str, fallback: T) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Display,
{
    let raw = env_text(name);
    if raw.is_empty() {
        return fallback;
    }
    match raw.parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warn!(variable = name, value = %raw, default = %fallback, "ignoring unparseable number");
            fallback
        }
    }
}

pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn resolve_database_url() -> String {
    let url = env_text("DATABASE_URL");
    if !url.is_empty() {
        return url;
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
        .unwrap_or_default();
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "wa_agent".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

impl Settings {
    /// Reads the process environment (after loading an optional `.env`).
    pub fn from_env() -> Settings {
        let _ = dotenvy::dotenv();

        let database_url = resolve_database_url();
        let queue_url = env_or("QUEUE_URL", &database_url);
        Settings {
            database_url,
            queue_url,
            queue_name: env_or("QUEUE_NAME", "whatsapp_inbound"),
            port: env_number("PORT", 8000),
            verify_token: env_text("WHATSAPP_VERIFY_TOKEN"),
            app_secret: env_text("WHATSAPP_APP_SECRET"),
            webhook_base_url: env_text("WEBHOOK_BASE_URL")
                .trim_end_matches('/')
                .to_string(),
            graph_api_base: env_or("GRAPH_API_BASE", "https://graph.facebook.com")
                .trim_end_matches('/')
                .to_string(),
            graph_api_version: env_or("GRAPH_API_VERSION", "v24.0"),
            credentials_key: env_text("CREDENTIALS_KEY"),
            llm_api_keys: split_list(&env_text("LLM_API_KEYS")),
            llm_api_base: env_or(
                "LLM_API_BASE",
                "https://generativelanguage.googleapis.com",
            )
            .trim_end_matches('/')
            .to_string(),
            llm_model: env_or("LLM_MODEL", "gemini-2.5-flash"),
            llm_tries_per_key: env_number("LLM_TRIES_PER_KEY", 2u32).max(1),
            llm_json_retries: env_number("LLM_JSON_RETRIES", 3u32).max(1),
            frontend_origins: split_list(&env_text("FRONTEND_ORIGINS")),
            flood_cutoff: Duration::from_secs(env_number("FLOOD_CUTOFF_SECONDS", 300u64)),
            settle_delay: Duration::from_secs(env_number("SETTLE_SECONDS", 15u64)),
            agent_poll: Duration::from_secs(env_number("AGENT_POLL_SECONDS", 5u64).max(1)),
            agent_batch_size: env_number("AGENT_BATCH_SIZE", 20usize).max(1),
            followup_poll: Duration::from_secs(env_number("FOLLOWUP_POLL_SECONDS", 300u64).max(1)),
            worker_concurrency: env_number("WORKER_CONCURRENCY", 4usize).max(1),
            drive_api_base: env_or("DRIVE_API_BASE", "https://www.googleapis.com")
                .trim_end_matches('/')
                .to_string(),
            drive_access_token: env_text("DRIVE_ACCESS_TOKEN"),
            ffmpeg_path: env_or("FFMPEG_PATH", "ffmpeg"),
        }
    }

    pub fn require_verify_token(&self) -> Result<&str, ConfigError> {
        if self.verify_token.is_empty() {
            return Err(ConfigError::Missing("WHATSAPP_VERIFY_TOKEN"));
        }
        Ok(&self.verify_token)
    }

    pub fn require_llm_keys(&self) -> Result<&[String], ConfigError> {
        if self.llm_api_keys.is_empty() {
            return Err(ConfigError::Missing("LLM_API_KEYS"));
        }
        Ok(&self.llm_api_keys)
    }

    pub fn require_credentials_key(&self) -> Result<&str, ConfigError> {
        if self.credentials_key.is_empty() {
            return Err(ConfigError::Missing("CREDENTIALS_KEY"));
        }
        Ok(&self.credentials_key)
    }
}
