//! Typed client for the WhatsApp Business Platform (Graph API).

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use reqwest::{header, multipart, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    credentials::CredentialStore,
    error::VendorError,
    phone::normalize_phone,
    transcoder::{TargetCodec, Transcoder},
    types::Tenant,
};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const SEND_RETRIES: u32 = 3;
const BODY_PREVIEW_BYTES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub id: String,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMedia {
    pub id: String,
    pub media_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfo {
    pub url: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: String,
    pub status: String,
    pub language: String,
    pub components: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundMedia {
    Image,
    Video,
    Audio,
    Document,
}

impl OutboundMedia {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboundMedia::Image => "image",
            OutboundMedia::Video => "video",
            OutboundMedia::Audio => "audio",
            OutboundMedia::Document => "document",
        }
    }

    pub fn parse(raw: &str) -> Option<OutboundMedia> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "image" | "imagem" => Some(OutboundMedia::Image),
            "video" | "vídeo" => Some(OutboundMedia::Video),
            "audio" | "áudio" => Some(OutboundMedia::Audio),
            "document" | "documento" => Some(OutboundMedia::Document),
            _ => None,
        }
    }
}

/// One outbound media send.
#[derive(Debug, Clone)]
pub struct MediaUpload<'a> {
    pub kind: OutboundMedia,
    pub bytes: &'a [u8],
    pub filename: &'a str,
    pub mime_type: &'a str,
    pub caption: Option<&'a str>,
}

#[derive(Clone)]
pub struct WhatsAppClient {
    http: reqwest::Client,
    api_base: String,
    credentials: Arc<dyn CredentialStore>,
    transcoder: Transcoder,
    retry_backoff: Duration,
}

fn body_preview(body: &[u8]) -> String {
    let end = body.len().min(BODY_PREVIEW_BYTES);
    String::from_utf8_lossy(&body[..end]).to_string()
}

fn is_html(content_type: &str, body: &[u8]) -> bool {
    if content_type.contains("text/html") {
        return true;
    }
    let head = String::from_utf8_lossy(&body[..body.len().min(64)])
        .trim_start()
        .to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

fn classify_status(status: StatusCode, body: String) -> VendorError {
    match status.as_u16() {
        401 | 403 => VendorError::Auth {
            status: status.as_u16(),
            body,
        },
        429 => VendorError::Transient(format!("rate limited: {body}")),
        code if status.is_server_error() => VendorError::Transient(format!("{code}: {body}")),
        code => VendorError::Permanent { status: code, body },
    }
}

fn classify_transport(err: reqwest::Error) -> VendorError {
    VendorError::Transient(err.to_string())
}

fn recipient(to: &str) -> Result<String, VendorError> {
    normalize_phone(to).ok_or_else(|| VendorError::Permanent {
        status: 0,
        body: format!("invalid recipient '{to}'"),
    })
}

fn first_message_id(payload: &Value) -> String {
    payload
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(|item| item.get("id"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

impl WhatsAppClient {
    pub fn new(
        http: reqwest::Client,
        graph_api_base: &str,
        api_version: &str,
        credentials: Arc<dyn CredentialStore>,
        transcoder: Transcoder,
    ) -> Self {
        WhatsAppClient {
            http,
            api_base: format!(
                "{}/{}",
                graph_api_base.trim_end_matches('/'),
                api_version.trim_matches('/')
            ),
            credentials,
            transcoder,
            retry_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    fn access_token(&self, tenant: &Tenant) -> Result<String, VendorError> {
        self.credentials
            .access_token(tenant)
            .map_err(|e| VendorError::Config(format!("tenant {} credentials: {e}", tenant.id)))
    }

    fn messages_url(&self, tenant: &Tenant) -> Result<String, VendorError> {
        if tenant.phone_number_id.trim().is_empty() {
            return Err(VendorError::Config(format!(
                "tenant {} has no phone_number_id",
                tenant.id
            )));
        }
        Ok(format!("{}/{}/messages", self.api_base, tenant.phone_number_id))
    }

    /// POSTs a JSON message payload, retrying transient failures with a
    /// linearly growing pause.
    async fn post_message(&self, tenant: &Tenant, payload: &Value) -> Result<Value, VendorError> {
        let token = self.access_token(tenant)?;
        let url = self.messages_url(tenant)?;
        let mut attempt = 0u32;
        loop {
            let result = self
                .http
                .post(&url)
                .bearer_auth(&token)
                .timeout(SEND_TIMEOUT)
                .json(payload)
                .send()
                .await;
            let outcome = match result {
                Ok(response) => {
                    let status = response.status();
                    let raw = response.text().await.unwrap_or_default();
                    if status.is_success() {
                        return Ok(serde_json::from_str::<Value>(&raw)
                            .unwrap_or_else(|_| json!({ "raw": raw })));
                    }
                    classify_status(status, raw)
                }
                Err(err) => classify_transport(err),
            };
            if !matches!(outcome, VendorError::Transient(_)) || attempt >= SEND_RETRIES {
                return Err(outcome);
            }
            attempt += 1;
            warn!(tenant_id = tenant.id, attempt, error = %outcome, "retrying whatsapp send");
            tokio::time::sleep(self.retry_backoff * attempt).await;
        }
    }

    pub async fn send_text(&self, tenant: &Tenant, to: &str, text: &str) -> Result<SentMessage, VendorError> {
        let payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": recipient(to)?,
            "type": "text",
            "text": { "preview_url": false, "body": text }
        });
        let body = self.post_message(tenant, &payload).await?;
        let id = first_message_id(&body);
        debug!(tenant_id = tenant.id, message_id = %id, "whatsapp text sent");
        Ok(SentMessage {
            id,
            timestamp: None,
        })
    }

    pub async fn send_template(
        &self,
        tenant: &Tenant,
        to: &str,
        name: &str,
        language: &str,
        components: Option<Value>,
    ) -> Result<SentMessage, VendorError> {
        let mut template = json!({
            "name": name,
            "language": { "code": language }
        });
        if let Some(components) = components.filter(|c| !c.is_null()) {
            template["components"] = components;
        }
        let payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": recipient(to)?,
            "type": "template",
            "template": template
        });
        let body = self.post_message(tenant, &payload).await?;
        Ok(SentMessage {
            id: first_message_id(&body),
            timestamp: None,
        })
    }

    /// Uploads the bytes, then sends a message referencing the uploaded media
    /// id. Audio goes out as MP3 and images as upright JPEG.
    pub async fn send_media(
        &self,
        tenant: &Tenant,
        to: &str,
        upload: MediaUpload<'_>,
    ) -> Result<SentMedia, VendorError> {
        let to = recipient(to)?;
        let target = match upload.kind {
            OutboundMedia::Audio => Some(TargetCodec::Mp3),
            OutboundMedia::Image => Some(TargetCodec::Jpeg),
            OutboundMedia::Video | OutboundMedia::Document => None,
        };
        let (bytes, mime_type, filename) = match target {
            Some(codec) => {
                let converted = self
                    .transcoder
                    .convert(upload.bytes, codec)
                    .await
                    .map_err(|e| VendorError::Media(e.to_string()))?;
                let stem = upload
                    .filename
                    .rsplit_once('.')
                    .map(|(stem, _)| stem)
                    .unwrap_or(upload.filename);
                (
                    converted,
                    codec.mime_type().to_string(),
                    format!("{stem}.{}", codec.extension()),
                )
            }
            None => (
                upload.bytes.to_vec(),
                upload.mime_type.to_string(),
                upload.filename.to_string(),
            ),
        };

        let media_id = self
            .upload_media(tenant, bytes, &mime_type, &filename)
            .await?;

        let mut media = json!({ "id": media_id });
        let caption = upload.caption.map(str::trim).filter(|c| !c.is_empty());
        match upload.kind {
            OutboundMedia::Image | OutboundMedia::Video => {
                if let Some(caption) = caption {
                    media["caption"] = json!(caption);
                }
            }
            OutboundMedia::Document => {
                media["filename"] = json!(filename);
                if let Some(caption) = caption {
                    media["caption"] = json!(caption);
                }
            }
            OutboundMedia::Audio => {}
        }
        let kind = upload.kind.as_str();
        let mut payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": kind,
        });
        payload[kind] = media;

        let body = self.post_message(tenant, &payload).await?;
        Ok(SentMedia {
            id: first_message_id(&body),
            media_id,
        })
    }

    async fn upload_media(
        &self,
        tenant: &Tenant,
        bytes: Vec<u8>,
        mime_type: &str,
        filename: &str,
    ) -> Result<String, VendorError> {
        let token = self.access_token(tenant)?;
        let part = multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime_type)
            .map_err(|e| VendorError::Media(format!("invalid mime type {mime_type}: {e}")))?;
        let form = multipart::Form::new()
            .text("messaging_product", "whatsapp")
            .text("type", mime_type.to_string())
            .part("file", part);

        let response = self
            .http
            .post(format!("{}/{}/media", self.api_base, tenant.phone_number_id))
            .bearer_auth(&token)
            .timeout(UPLOAD_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = response.status();
        let raw = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_status(status, raw));
        }
        let payload = serde_json::from_str::<Value>(&raw).unwrap_or(Value::Null);
        let media_id = payload
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if media_id.is_empty() {
            return Err(VendorError::Media(format!(
                "upload response without media id: {}",
                body_preview(raw.as_bytes())
            )));
        }
        Ok(media_id)
    }

    /// Looks up the short-lived download URL of an inbound media id.
    pub async fn get_media_url(&self, tenant: &Tenant, media_id: &str) -> Result<MediaInfo, VendorError> {
        let token = self.access_token(tenant)?;
        let response = self
            .http
            .get(format!("{}/{}", self.api_base, media_id))
            .bearer_auth(&token)
            .timeout(SEND_TIMEOUT)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = response.status();
        let raw = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_status(status, raw));
        }
        let metadata = serde_json::from_str::<Value>(&raw).unwrap_or(Value::Null);
        let url = metadata
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if url.is_empty() {
            return Err(VendorError::Media(format!(
                "missing media url for {media_id}"
            )));
        }
        let mime_type = metadata
            .get("mime_type")
            .and_then(Value::as_str)
            .unwrap_or("application/octet-stream")
            .to_string();
        Ok(MediaInfo { url, mime_type })
    }

    /// Downloads media bytes. An HTML body means the vendor served a login or
    /// error page instead of the file (typically a revoked token).
    pub async fn download_media(&self, tenant: &Tenant, url: &str) -> Result<Bytes, VendorError> {
        let token = self.access_token(tenant)?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&token)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let bytes = response.bytes().await.map_err(classify_transport)?;

        if status != StatusCode::OK {
            return Err(VendorError::Media(format!(
                "media download returned {}: {}",
                status.as_u16(),
                body_preview(&bytes)
            )));
        }
        let looks_like_html = is_html(&content_type, &bytes);
        if looks_like_html {
            return Err(VendorError::Media(format!(
                "media download returned HTML instead of media: {}",
                body_preview(&bytes)
            )));
        }
        Ok(bytes)
    }

    /// Message templates of the tenant's business account, following paging.
    pub async fn list_templates(&self, tenant: &Tenant) -> Result<Vec<Template>, VendorError> {
        let business_account_id = tenant
            .business_account_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| VendorError::Config(format!("tenant {} has no business account id", tenant.id)))?;
        let token = self.access_token(tenant)?;
        let mut next = Some(format!(
            "{}/{}/message_templates?fields=name,status,language,components&limit=200",
            self.api_base, business_account_id
        ));
        let mut templates = Vec::new();
        while let Some(url) = next.take() {
            let response = self
                .http
                .get(&url)
                .bearer_auth(&token)
                .timeout(SEND_TIMEOUT)
                .send()
                .await
                .map_err(classify_transport)?;
            let status = response.status();
            let raw = response.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(classify_status(status, raw));
            }
            let payload = serde_json::from_str::<Value>(&raw).unwrap_or(Value::Null);
            for item in payload
                .get("data")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
            {
                let text = |key: &str| {
                    item.get(key)
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string()
                };
                templates.push(Template {
                    name: text("name"),
                    status: text("status"),
                    language: text("language"),
                    components: item
                        .get("components")
                        .cloned()
                        .unwrap_or_else(|| json!([])),
                });
            }
            next = payload
                .get("paging")
                .and_then(|p| p.get("next"))
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Ok(templates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, String::new()),
            VendorError::Auth { status: 401, .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, String::new()),
            VendorError::Auth { status: 403, .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, String::new()),
            VendorError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, String::new()),
            VendorError::Permanent { status: 400, .. }
        ));
    }

    #[test]
    fn media_kind_parsing_accepts_portuguese() {
        assert_eq!(OutboundMedia::parse("imagem"), Some(OutboundMedia::Image));
        assert_eq!(OutboundMedia::parse("DOCUMENT"), Some(OutboundMedia::Document));
        assert_eq!(OutboundMedia::parse("sticker"), None);
    }

    #[test]
    fn html_detection() {
        assert!(is_html("text/html; charset=utf-8", b"anything"));
        assert!(is_html("application/octet-stream", b"  <!DOCTYPE html><html>"));
        assert!(is_html("", b"<html><body>login</body></html>"));
        assert!(!is_html("audio/ogg", b"OggS\x00\x02"));
    }

    #[test]
    fn preview_is_capped() {
        let body = vec![b'a'; 4096];
        assert_eq!(body_preview(&body).len(), BODY_PREVIEW_BYTES);
    }
}
