//! Gemini client with API key rotation, per-call token accounting and
//! structured JSON replies.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    error::LlmError,
    prompting::render_media_prompt,
    store::TokenLedger,
    timeline::truncate_chars,
    types::MessageKind,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for model calls. Only connecting is bounded; a long video analysis
/// runs until the vendor answers.
pub fn http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "nome_exato", default)]
    pub exact_name: String,
    #[serde(rename = "id_arquivo", default)]
    pub file_id: String,
    #[serde(rename = "tipo_midia", default)]
    pub media_type: String,
}

/// The model's decision for one agent turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentAction {
    #[serde(rename = "mensagem_para_enviar", default)]
    pub message: Option<String>,
    #[serde(rename = "nova_situacao", default)]
    pub next_status: Option<String>,
    #[serde(rename = "nome_contato", default)]
    pub contact_name: Option<String>,
    #[serde(rename = "observacoes", default)]
    pub notes: Option<String>,
    #[serde(rename = "arquivos_anexos", default)]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(rename = "tags_sugeridas", default)]
    pub suggested_tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowupAction {
    #[serde(rename = "mensagem_para_enviar", default)]
    pub message: Option<String>,
}

/// Parses a model reply that should be a JSON object, tolerating markdown
/// fences and chatter around the object.
pub fn parse_json_reply<T: DeserializeOwned>(raw: &str) -> Option<T> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut candidates = vec![trimmed.to_string()];
    if trimmed.starts_with("```") {
        let stripped = trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```JSON")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string();
        if !stripped.is_empty() {
            candidates.push(stripped);
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            candidates.push(trimmed[start..=end].to_string());
        }
    }

    candidates.into_iter().find_map(|candidate| {
        let value = serde_json::from_str::<Value>(&candidate).ok()?;
        if !value.is_object() {
            return None;
        }
        serde_json::from_value::<T>(value).ok()
    })
}

fn error_status(body: &Value) -> &str {
    body.get("error")
        .and_then(|error| error.get("status"))
        .and_then(Value::as_str)
        .unwrap_or("")
}

fn error_message(body: &Value, raw: &str) -> String {
    let message = body
        .get("error")
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .unwrap_or(raw);
    truncate_chars(message.trim(), 300)
}

/// Maps a non-success HTTP response onto the error taxonomy.
fn classify_failure(status: StatusCode, raw_body: &str) -> LlmError {
    let body = serde_json::from_str::<Value>(raw_body).unwrap_or(Value::Null);
    let vendor_status = error_status(&body);
    let message = error_message(&body, raw_body);

    if status == StatusCode::TOO_MANY_REQUESTS || vendor_status == "RESOURCE_EXHAUSTED" {
        return LlmError::QuotaExhausted(message);
    }
    // A revoked or restricted key is handled like an exhausted one: the next
    // key may still work.
    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || vendor_status == "PERMISSION_DENIED"
    {
        return LlmError::QuotaExhausted(format!("key rejected ({status}): {message}"));
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return LlmError::Transient(format!("{status}: {message}"));
    }
    LlmError::InvalidArgument(format!("{status}: {message}"))
}

/// Pulls the text out of a successful `generateContent` payload.
fn extract_text(payload: &Value) -> Result<String, LlmError> {
    if let Some(reason) = payload
        .get("promptFeedback")
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str)
    {
        return Err(LlmError::Blocked(reason.to_string()));
    }

    let candidate = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first());
    let text = candidate
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        let finish = candidate
            .and_then(|candidate| candidate.get("finishReason"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if matches!(finish, "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" | "SPII") {
            return Err(LlmError::Blocked(finish.to_string()));
        }
        return Err(LlmError::Transient("model returned no text".to_string()));
    }
    Ok(text.trim().to_string())
}

/// Owns the API key list and the process-wide rotation index.
pub struct LlmClient {
    http: reqwest::Client,
    api_base: String,
    model: String,
    keys: Vec<String>,
    key_index: AtomicUsize,
    tries_per_key: u32,
    json_retries: u32,
    retry_delay: Duration,
    ledger: Arc<dyn TokenLedger>,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("keys", &self.keys.len())
            .field("key_index", &self.key_index.load(Ordering::Relaxed))
            .finish()
    }
}

impl LlmClient {
    pub fn new(
        http: reqwest::Client,
        api_base: &str,
        model: &str,
        keys: Vec<String>,
        ledger: Arc<dyn TokenLedger>,
    ) -> Self {
        LlmClient {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            model: model.trim().to_string(),
            keys,
            key_index: AtomicUsize::new(0),
            tries_per_key: 2,
            json_retries: 3,
            retry_delay: Duration::from_secs(1),
            ledger,
        }
    }

    pub fn with_tries_per_key(mut self, tries: u32) -> Self {
        self.tries_per_key = tries.max(1);
        self
    }

    pub fn with_json_retries(mut self, retries: u32) -> Self {
        self.json_retries = retries.max(1);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn current_key_index(&self) -> usize {
        self.key_index.load(Ordering::Acquire)
    }

    /// Advances from `from` to the next key. Concurrent callers that saw the
    /// same key advance the index only once.
    fn rotate_key(&self, from: usize) -> usize {
        let next = (from + 1) % self.keys.len();
        match self
            .key_index
            .compare_exchange(from, next, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                info!(from, to = next, "rotated LLM API key");
                next
            }
            Err(actual) => actual % self.keys.len(),
        }
    }

    async fn request_once(&self, key: &str, body: &Value) -> Result<String, LlmError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.api_base, self.model
        );
        let response = self
            .http
            .post(url)
            .query(&[("key", key)])
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::Transient(e.without_url().to_string()))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|e| LlmError::Transient(e.without_url().to_string()))?;
        if !status.is_success() {
            return Err(classify_failure(status, &raw));
        }
        let payload = serde_json::from_str::<Value>(&raw)
            .map_err(|e| LlmError::Transient(format!("unreadable model payload: {e}")))?;
        if let Some(total) = payload
            .get("usageMetadata")
            .and_then(|usage| usage.get("totalTokenCount"))
            .and_then(Value::as_i64)
        {
            debug!(model = %self.model, total_tokens = total, "model usage");
        }
        extract_text(&payload)
    }

    async fn debit(&self, tenant_id: i64) {
        if let Err(err) = self.ledger.debit_token(tenant_id).await {
            warn!(tenant_id, error = %err, "token debit failed; response kept");
        }
    }

    /// One model call under the key rotation policy. Debits the tenant once on
    /// success.
    async fn call(&self, tenant_id: i64, parts: Vec<Value>, structured: bool) -> Result<String, LlmError> {
        if self.keys.is_empty() {
            return Err(LlmError::NoKeys);
        }
        let mut body = json!({
            "contents": [{ "role": "user", "parts": parts }]
        });
        if structured {
            body["generationConfig"] = json!({ "responseMimeType": "application/json" });
        }

        let start = self.current_key_index() % self.keys.len();
        let mut current = start;
        let mut last_error = String::new();
        loop {
            let key = &self.keys[current];
            for attempt in 1..=self.tries_per_key {
                match self.request_once(key, &body).await {
                    Ok(text) => {
                        self.debit(tenant_id).await;
                        return Ok(text);
                    }
                    Err(err) if err.is_fatal() => {
                        warn!(tenant_id, key_index = current, error = %err, "LLM call failed permanently");
                        return Err(err);
                    }
                    Err(err) => {
                        warn!(tenant_id, key_index = current, attempt, error = %err, "LLM call failed");
                        last_error = err.to_string();
                        if attempt < self.tries_per_key {
                            tokio::time::sleep(self.retry_delay * attempt).await;
                        }
                    }
                }
            }
            current = self.rotate_key(current);
            if current == start {
                return Err(LlmError::AllKeysExhausted(last_error));
            }
        }
    }

    /// Structured call: the reply must parse as `T`. Unparseable replies are
    /// retried with the same input.
    async fn call_json<T: DeserializeOwned>(&self, tenant_id: i64, prompt: &Value) -> Result<T, LlmError> {
        let text = serde_json::to_string_pretty(prompt)
            .map_err(|e| LlmError::InvalidArgument(e.to_string()))?;
        let mut last_raw = String::new();
        for attempt in 1..=self.json_retries {
            let raw = self
                .call(tenant_id, vec![json!({ "text": text })], true)
                .await?;
            if let Some(parsed) = parse_json_reply::<T>(&raw) {
                return Ok(parsed);
            }
            warn!(tenant_id, attempt, "model reply is not the expected JSON");
            last_raw = raw;
        }
        Err(LlmError::Schema {
            attempts: self.json_retries,
            raw: truncate_chars(&last_raw, 500),
        })
    }

    /// Transcribes audio or describes other media. The reply is free text.
    pub async fn analyze_media(
        &self,
        tenant_id: i64,
        kind: MessageKind,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<String, LlmError> {
        let mime_type = mime_type
            .split(';')
            .next()
            .map(str::trim)
            .filter(|mime| !mime.is_empty())
            .unwrap_or("application/octet-stream");
        let parts = vec![
            json!({ "text": render_media_prompt(kind) }),
            json!({
                "inline_data": {
                    "mime_type": mime_type,
                    "data": STANDARD.encode(bytes),
                }
            }),
        ];
        self.call(tenant_id, parts, false).await
    }

    pub async fn generate_action(&self, tenant_id: i64, prompt: &Value) -> Result<AgentAction, LlmError> {
        self.call_json::<AgentAction>(tenant_id, prompt).await
    }

    pub async fn generate_followup(&self, tenant_id: i64, prompt: &Value) -> Result<FollowupAction, LlmError> {
        self.call_json::<FollowupAction>(tenant_id, prompt).await
    }
}
