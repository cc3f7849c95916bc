//! Inbound worker: turns queued webhook values into timeline messages.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::{InfraError, VendorError},
    llm::LlmClient,
    phone::normalize_phone,
    prompting::media_prefix,
    queue::{WorkItem, WorkQueue},
    store::ConversationStore,
    timeline::{append_note, contains_message, mark_delivery_failed, record_inbound},
    transcoder::{TargetCodec, Transcoder},
    types::{Message, MessageKind, Tenant, Ticket},
    whatsapp::WhatsAppClient,
};

pub const MAX_MEDIA_BYTES: usize = 20 * 1024 * 1024;

/// What happened to one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Report {
    pub stale: bool,
    pub unrouted: bool,
    pub appended: usize,
    pub duplicates: usize,
    pub failed_statuses: usize,
    pub skipped: usize,
}

/// Text and media metadata assembled for one inbound vendor message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct Content {
    text: String,
    kind: Option<MessageKind>,
    media_id: Option<String>,
    mime_type: Option<String>,
    filename: Option<String>,
    diagnostic: Option<String>,
}

fn text_at<'a>(value: &'a Value, path: &[&str]) -> &'a str {
    let mut current = value;
    for key in path {
        match current.get(*key) {
            Some(next) => current = next,
            None => return "",
        }
    }
    current.as_str().unwrap_or("").trim()
}

fn parse_vendor_timestamp(value: &Value) -> Option<i64> {
    let raw = value.get("timestamp")?;
    raw.as_i64()
        .or_else(|| raw.as_str().and_then(|text| text.trim().parse::<i64>().ok()))
}

/// The vendor timestamp of the first message, or of the first status when
/// the value carries no messages.
pub fn batch_timestamp(value: &Value) -> Option<i64> {
    ["messages", "statuses"].iter().find_map(|key| {
        value
            .get(*key)
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .and_then(parse_vendor_timestamp)
    })
}

/// True when the batch is older than the flood cutoff.
pub fn is_stale(value: &Value, now: DateTime<Utc>, cutoff: Duration) -> bool {
    let Some(vendor_ts) = batch_timestamp(value) else {
        return false;
    };
    now.timestamp() - vendor_ts > cutoff.as_secs() as i64
}

fn contact_profile_names(value: &Value) -> HashMap<String, String> {
    let contacts = value
        .get("contacts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut map = HashMap::new();
    for contact in contacts {
        let wa_id = contact
            .get("wa_id")
            .and_then(Value::as_str)
            .or_else(|| contact.get("input").and_then(Value::as_str))
            .unwrap_or("");
        let Some(digits) = normalize_phone(wa_id) else {
            continue;
        };
        let name = text_at(&contact, &["profile", "name"]);
        if !name.is_empty() {
            map.insert(digits, name.to_string());
        }
    }
    map
}

fn location_text(message: &Value) -> String {
    let location = message.get("location").cloned().unwrap_or(Value::Null);
    let coordinate = |key: &str| {
        location
            .get(key)
            .and_then(|v| v.as_f64().map(|n| n.to_string()).or_else(|| v.as_str().map(str::to_string)))
            .unwrap_or_default()
    };
    let mut text = "[Localização compartilhada]:".to_string();
    let name = text_at(&location, &["name"]);
    if !name.is_empty() {
        text.push(' ');
        text.push_str(name);
    }
    text.push_str(&format!(" ({},{})", coordinate("latitude"), coordinate("longitude")));
    let address = text_at(&location, &["address"]);
    if !address.is_empty() {
        text.push(' ');
        text.push_str(address);
    }
    text
}

fn contacts_text(message: &Value) -> String {
    message
        .get("contacts")
        .and_then(Value::as_array)
        .map(|contacts| {
            contacts
                .iter()
                .map(|contact| {
                    let name = text_at(contact, &["name", "formatted_name"]);
                    let wa_id = contact
                        .get("phones")
                        .and_then(Value::as_array)
                        .and_then(|phones| phones.first())
                        .map(|phone| {
                            let wa_id = text_at(phone, &["wa_id"]);
                            if wa_id.is_empty() {
                                text_at(phone, &["phone"])
                            } else {
                                wa_id
                            }
                        })
                        .unwrap_or("");
                    format!("{name} ({wa_id})")
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default()
}

fn interactive_text(message: &Value) -> String {
    let button = text_at(message, &["button", "text"]);
    if !button.is_empty() {
        return button.to_string();
    }
    for reply in ["button_reply", "list_reply"] {
        let title = text_at(message, &["interactive", reply, "title"]);
        if !title.is_empty() {
            return title.to_string();
        }
    }
    String::new()
}

fn media_fallback(vendor_type: &str, caption: &str) -> String {
    let mut text = format!("[{vendor_type} recebida, não foi possível analisar o conteúdo]");
    if !caption.is_empty() {
        text.push_str(&format!("\nLegenda: {caption}"));
    }
    text
}

pub struct InboundWorker {
    store: Arc<dyn ConversationStore>,
    whatsapp: WhatsAppClient,
    llm: Arc<LlmClient>,
    transcoder: Transcoder,
    flood_cutoff: Duration,
}

impl InboundWorker {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        whatsapp: WhatsAppClient,
        llm: Arc<LlmClient>,
        transcoder: Transcoder,
        flood_cutoff: Duration,
    ) -> Self {
        InboundWorker {
            store,
            whatsapp,
            llm,
            transcoder,
            flood_cutoff,
        }
    }

    /// Runs the enrichment pipeline for one queued value. Only store failures
    /// surface as errors; everything local to one message is logged and
    /// skipped.
    pub async fn process(&self, value: &Value, now: DateTime<Utc>) -> Result<Report, InfraError> {
        let mut report = Report::default();
        if is_stale(value, now, self.flood_cutoff) {
            info!(vendor_ts = ?batch_timestamp(value), "dropping stale webhook batch");
            report.stale = true;
            return Ok(report);
        }

        let phone_number_id = text_at(value, &["metadata", "phone_number_id"]);
        let Some(tenant) = self.store.tenant_by_phone_number_id(phone_number_id).await? else {
            warn!(phone_number_id, "no tenant for phone_number_id, dropping");
            report.unrouted = true;
            return Ok(report);
        };

        let names = contact_profile_names(value);
        let messages = value
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for message in &messages {
            match self.handle_message(&tenant, message, &names, now).await? {
                Some(true) => report.appended += 1,
                Some(false) => report.duplicates += 1,
                None => report.skipped += 1,
            }
        }

        let statuses = value
            .get("statuses")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for status in &statuses {
            if self.handle_status(&tenant, status).await? {
                report.failed_statuses += 1;
            }
        }
        Ok(report)
    }

    /// `Some(true)` appended, `Some(false)` replayed id, `None` skipped.
    async fn handle_message(
        &self,
        tenant: &Tenant,
        message: &Value,
        names: &HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<Option<bool>, InfraError> {
        let from = text_at(message, &["from"]);
        let Some(phone) = normalize_phone(from) else {
            warn!(tenant_id = tenant.id, from, "inbound message without a usable sender, skipping");
            return Ok(None);
        };
        let message_id = match text_at(message, &["id"]) {
            "" => format!("local-{}", Uuid::new_v4()),
            id => id.to_string(),
        };
        let contact_name = names.get(&phone).map(String::as_str);

        let ticket = self
            .store
            .get_or_create_ticket(tenant, &phone, contact_name)
            .await?;
        if contains_message(&ticket.timeline, &message_id) {
            debug!(ticket_id = ticket.id, message_id = %message_id, "replayed message, skipping");
            return Ok(Some(false));
        }

        let content = self.assemble_content(tenant, message).await;
        let timestamp = parse_vendor_timestamp(message).unwrap_or_else(|| now.timestamp());
        let mut record = Message::user(message_id.clone(), content.text, timestamp);
        record.kind = content.kind;
        record.media_id = content.media_id;
        record.mime_type = content.mime_type;
        record.filename = content.filename;
        let diagnostic = content.diagnostic;

        let mut appended = false;
        let updated = self
            .store
            .with_locked_ticket(ticket.id, &mut |ticket: &mut Ticket| {
                appended = record_inbound(ticket, record.clone());
                if appended {
                    if let Some(note) = &diagnostic {
                        ticket.summary = append_note(&ticket.summary, note);
                    }
                }
                appended
            })
            .await?;
        if let Some(ticket) = updated {
            info!(
                tenant_id = tenant.id,
                ticket_id = ticket.id,
                phone = %phone,
                message_id = %message_id,
                status = %ticket.status,
                appended,
                "inbound message recorded"
            );
        }
        Ok(Some(appended))
    }

    async fn assemble_content(&self, tenant: &Tenant, message: &Value) -> Content {
        let vendor_type = text_at(message, &["type"]);
        let kind = MessageKind::from_vendor_type(vendor_type);
        match (vendor_type, kind) {
            ("text", _) => Content {
                text: text_at(message, &["text", "body"]).to_string(),
                kind: Some(MessageKind::Text),
                ..Content::default()
            },
            ("button" | "interactive", _) => Content {
                text: interactive_text(message),
                kind: Some(MessageKind::Text),
                ..Content::default()
            },
            (_, Some(MessageKind::Location)) => Content {
                text: location_text(message),
                kind: Some(MessageKind::Location),
                ..Content::default()
            },
            (_, Some(MessageKind::Contacts)) => Content {
                text: contacts_text(message),
                kind: Some(MessageKind::Contacts),
                ..Content::default()
            },
            (_, Some(kind)) if kind.is_media() => {
                self.assemble_media(tenant, message, vendor_type, kind).await
            }
            _ => Content {
                text: format!("[Mensagem do tipo '{vendor_type}' recebida, conteúdo não processado]"),
                ..Content::default()
            },
        }
    }

    async fn assemble_media(
        &self,
        tenant: &Tenant,
        message: &Value,
        vendor_type: &str,
        kind: MessageKind,
    ) -> Content {
        let media = message.get(vendor_type).cloned().unwrap_or(Value::Null);
        let media_id = text_at(&media, &["id"]).to_string();
        let caption = text_at(&media, &["caption"]).to_string();
        let filename = Some(text_at(&media, &["filename"]).to_string()).filter(|name| !name.is_empty());
        let declared_mime = Some(text_at(&media, &["mime_type"]).to_string()).filter(|mime| !mime.is_empty());

        let mut content = Content {
            kind: Some(kind),
            media_id: Some(media_id.clone()).filter(|id| !id.is_empty()),
            mime_type: declared_mime.clone(),
            filename,
            ..Content::default()
        };

        match self
            .analyze_media(tenant, &media_id, kind, declared_mime.as_deref())
            .await
        {
            Ok((analysis, mime_type)) => {
                let mut text = format!("[{}]: {}", media_prefix(kind), analysis.trim());
                if !caption.is_empty() {
                    text.push_str(&format!("\nLegenda: {caption}"));
                }
                content.text = text;
                content.mime_type = Some(mime_type);
            }
            Err(err) => {
                warn!(tenant_id = tenant.id, media_id = %media_id, error = %err, "media enrichment failed, using fallback");
                if let MediaFailure::Vendor(vendor) = &err {
                    if vendor.is_auth() {
                        error!(tenant_id = tenant.id, "config error: whatsapp credentials rejected");
                        content.diagnostic = Some(format!("Erro de configuração: {vendor}"));
                    }
                }
                content.text = media_fallback(vendor_type, &caption);
            }
        }
        content
    }

    async fn analyze_media(
        &self,
        tenant: &Tenant,
        media_id: &str,
        kind: MessageKind,
        declared_mime: Option<&str>,
    ) -> Result<(String, String), MediaFailure> {
        if media_id.is_empty() {
            return Err(MediaFailure::Other("message has no media id".to_string()));
        }
        let info = self
            .whatsapp
            .get_media_url(tenant, media_id)
            .await
            .map_err(MediaFailure::Vendor)?;
        let bytes = self
            .whatsapp
            .download_media(tenant, &info.url)
            .await
            .map_err(MediaFailure::Vendor)?;
        if bytes.len() > MAX_MEDIA_BYTES {
            return Err(MediaFailure::Other(format!(
                "media too large to analyse ({} bytes)",
                bytes.len()
            )));
        }

        let mut mime_type = declared_mime.unwrap_or(&info.mime_type).to_string();
        let mut payload = bytes.to_vec();
        if kind == MessageKind::Audio {
            match self.transcoder.convert(&payload, TargetCodec::Mp3).await {
                Ok(converted) => {
                    payload = converted;
                    mime_type = TargetCodec::Mp3.mime_type().to_string();
                }
                Err(err) => {
                    warn!(media_id, error = %err, "audio transcode failed, analysing original");
                }
            }
        }

        let analysis = self
            .llm
            .analyze_media(tenant.id, kind, &payload, &mime_type)
            .await
            .map_err(|err| MediaFailure::Other(err.to_string()))?;
        Ok((analysis, declared_mime.unwrap_or(&info.mime_type).to_string()))
    }

    /// Applies a `failed` delivery status to the matching outbound message.
    async fn handle_status(&self, tenant: &Tenant, status: &Value) -> Result<bool, InfraError> {
        if text_at(status, &["status"]) != "failed" {
            return Ok(false);
        }
        let message_id = text_at(status, &["id"]).to_string();
        let Some(phone) = normalize_phone(text_at(status, &["recipient_id"])) else {
            return Ok(false);
        };
        let Some(ticket) = self.store.find_ticket(tenant.id, &phone).await? else {
            debug!(tenant_id = tenant.id, phone = %phone, "failed status for unknown ticket");
            return Ok(false);
        };

        let error = status
            .get("errors")
            .and_then(Value::as_array)
            .and_then(|errors| errors.first())
            .cloned()
            .unwrap_or(Value::Null);
        let error_code = error.get("code").and_then(Value::as_i64);
        let error_title = Some(text_at(&error, &["title"]).to_string()).filter(|t| !t.is_empty());

        let mut marked = false;
        self.store
            .with_locked_ticket(ticket.id, &mut |ticket: &mut Ticket| {
                marked = mark_delivery_failed(ticket, &message_id, error_code, error_title.clone());
                marked
            })
            .await?;
        if marked {
            warn!(tenant_id = tenant.id, ticket_id = ticket.id, message_id = %message_id, ?error_code, "outbound message failed");
        }
        Ok(marked)
    }

    /// Processes one dequeued item and settles it on the queue.
    pub async fn handle_item(&self, queue: &dyn WorkQueue, item: WorkItem) {
        let value = match serde_json::from_str::<Value>(&item.payload) {
            Ok(value) => value,
            Err(err) => {
                warn!(queue_id = item.id, error = %err, "malformed work item, dropping");
                if let Err(err) = queue.ack(item.id).await {
                    error!(queue_id = item.id, error = %err, "ack failed");
                }
                return;
            }
        };
        match self.process(&value, Utc::now()).await {
            Ok(report) => {
                debug!(queue_id = item.id, ?report, "work item processed");
                if let Err(err) = queue.ack(item.id).await {
                    error!(queue_id = item.id, error = %err, "ack failed");
                }
            }
            Err(err) => {
                error!(queue_id = item.id, attempts = item.attempts, error = %err, "work item failed, requeueing");
                if let Err(err) = queue.nack(item.id).await {
                    error!(queue_id = item.id, error = %err, "nack failed");
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum MediaFailure {
    #[error(transparent)]
    Vendor(VendorError),
    #[error("{0}")]
    Other(String),
}

/// One consumer with prefetch 1: it takes the next item only after the
/// previous one is acked or nacked.
pub async fn run_consumer(
    worker: Arc<InboundWorker>,
    queue: Arc<dyn WorkQueue>,
    shutdown: CancellationToken,
    idle_wait: Duration,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        match queue.dequeue().await {
            Ok(Some(item)) => worker.handle_item(queue.as_ref(), item).await,
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = queue.wait_for_work(idle_wait) => {}
                }
            }
            Err(err) => {
                error!(error = %err, "dequeue failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                }
            }
        }
    }
    debug!("inbound consumer stopped");
}

pub async fn run_consumers(
    worker: Arc<InboundWorker>,
    queue: Arc<dyn WorkQueue>,
    concurrency: usize,
    shutdown: CancellationToken,
) {
    info!(concurrency, "inbound worker started");
    let consumers = (0..concurrency.max(1))
        .map(|_| {
            tokio::spawn(run_consumer(
                worker.clone(),
                queue.clone(),
                shutdown.clone(),
                Duration::from_secs(5),
            ))
        })
        .collect::<Vec<_>>();
    for result in join_all(consumers).await {
        if let Err(err) = result {
            error!(error = %err, "inbound consumer task panicked");
        }
    }
    info!("inbound worker stopped");
}
