//! Agent scheduler: picks settled tickets, asks the model for the next
//! action, sends it and folds the result back into the ticket.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    drive::DriveClient,
    error::{StoreError, VendorError},
    llm::{AgentAction, Attachment, LlmClient},
    prompting::build_agent_prompt,
    store::ConversationStore,
    timeline::{append_note, fail_generation, finalize_generation, AgentOutcome, Finalized},
    types::{Message, MessageKind, Persona, Tenant, Ticket, TicketStatus},
    whatsapp::{MediaUpload, OutboundMedia, WhatsAppClient},
};

/// Result of one generation cycle for one ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cycle {
    /// Someone else claimed the ticket or its status moved on.
    Skipped,
    Finalized(Finalized),
    Failed(TicketStatus),
}

/// Splits a reply into WhatsApp-sized parts on blank lines.
pub fn split_parts(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                parts.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line.trim_end());
        }
    }
    if !current.is_empty() {
        parts.push(current.join("\n"));
    }
    parts
        .into_iter()
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

fn outbound_kind(attachment: &Attachment, mime_type: &str) -> OutboundMedia {
    if let Some(kind) = OutboundMedia::parse(&attachment.media_type) {
        return kind;
    }
    let mime = mime_type.to_ascii_lowercase();
    if mime.starts_with("image/") {
        OutboundMedia::Image
    } else if mime.starts_with("video/") {
        OutboundMedia::Video
    } else if mime.starts_with("audio/") {
        OutboundMedia::Audio
    } else {
        OutboundMedia::Document
    }
}

fn message_kind(kind: OutboundMedia) -> MessageKind {
    match kind {
        OutboundMedia::Image => MessageKind::Image,
        OutboundMedia::Video => MessageKind::Video,
        OutboundMedia::Audio => MessageKind::Audio,
        OutboundMedia::Document => MessageKind::Document,
    }
}

fn vendor_note(prefix: &str, err: &VendorError) -> String {
    if err.is_auth() {
        format!("Erro de configuração: {err}")
    } else {
        format!("{prefix}: {err}")
    }
}

fn message_id_or_local(id: String) -> String {
    if id.trim().is_empty() {
        format!("local-{}", Uuid::new_v4())
    } else {
        id
    }
}

/// Messages sent during one cycle plus the first failure, if any.
#[derive(Debug, Default)]
struct Delivery {
    sent: Vec<Message>,
    failure: Option<(TicketStatus, String)>,
}

pub struct AgentScheduler {
    store: Arc<dyn ConversationStore>,
    whatsapp: WhatsAppClient,
    llm: Arc<LlmClient>,
    drive: DriveClient,
    settle_delay: Duration,
    batch_size: usize,
    part_delay_ms: (u64, u64),
}

impl AgentScheduler {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        whatsapp: WhatsAppClient,
        llm: Arc<LlmClient>,
        drive: DriveClient,
        settle_delay: Duration,
        batch_size: usize,
    ) -> Self {
        AgentScheduler {
            store,
            whatsapp,
            llm,
            drive,
            settle_delay,
            batch_size: batch_size.max(1),
            part_delay_ms: (2_000, 4_000),
        }
    }

    /// Pause between consecutive text parts, drawn uniformly from the range.
    pub fn with_part_delay(mut self, min: Duration, max: Duration) -> Self {
        let min_ms = min.as_millis() as u64;
        let max_ms = (max.as_millis() as u64).max(min_ms);
        self.part_delay_ms = (min_ms, max_ms);
        self
    }

    async fn pause_between_parts(&self) {
        let (min, max) = self.part_delay_ms;
        if max == 0 {
            return;
        }
        let millis = rand::thread_rng().gen_range(min..=max);
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    /// One poll: runs a cycle for every settled ticket, oldest first, with
    /// bounded concurrency. Returns how many tickets were looked at.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let settle = chrono::Duration::from_std(self.settle_delay).unwrap_or_else(|_| chrono::Duration::zero());
        let ids = self
            .store
            .eligible_tickets(now - settle, self.batch_size)
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }
        debug!(count = ids.len(), "eligible tickets");
        let count = ids.len();
        stream::iter(ids)
            .map(|ticket_id| async move {
                if let Err(err) = self.run_cycle(ticket_id).await {
                    error!(ticket_id, error = %err, "agent cycle failed");
                }
            })
            .buffer_unordered(self.batch_size)
            .collect::<Vec<_>>()
            .await;
        Ok(count)
    }

    /// Moves the ticket from `Message Received` to `Generating Response`
    /// under the row lock. `None` when the ticket is in any other state.
    pub async fn claim(&self, ticket_id: i64) -> Result<Option<Ticket>, StoreError> {
        let mut claimed = false;
        let ticket = self
            .store
            .with_locked_ticket(ticket_id, &mut |ticket: &mut Ticket| {
                claimed = ticket.status == TicketStatus::MessageReceived;
                if claimed {
                    ticket.status = TicketStatus::GeneratingResponse;
                }
                claimed
            })
            .await?;
        Ok(ticket.filter(|_| claimed))
    }

    pub async fn run_cycle(&self, ticket_id: i64) -> Result<Cycle, StoreError> {
        let Some(ticket) = self.claim(ticket_id).await? else {
            debug!(ticket_id, "ticket not claimable, skipping");
            return Ok(Cycle::Skipped);
        };
        info!(ticket_id, tenant_id = ticket.tenant_id, "generating response");

        let (tenant, persona) = match self.load_context(&ticket).await {
            Ok(context) => context,
            Err(reason) => {
                warn!(ticket_id, reason = %reason, "context build failed");
                return self
                    .fail(ticket_id, TicketStatus::ContextError, &format!("Erro de contexto: {reason}"))
                    .await;
            }
        };

        let prompt = build_agent_prompt(&tenant, &persona, &ticket, Utc::now());
        let action = match self.llm.generate_action(tenant.id, &prompt).await {
            Ok(action) => action,
            Err(err) => {
                warn!(ticket_id, tenant_id = tenant.id, error = %err, "LLM call failed");
                return self
                    .fail(ticket_id, TicketStatus::LlmError, &format!("Erro na IA: {err}"))
                    .await;
            }
        };

        let delivery = self.deliver(&tenant, &persona, &ticket, &action).await;
        self.finalize(&tenant, ticket_id, &action, delivery).await
    }

    /// Tenant and active persona for the ticket. Store failures are folded
    /// into the reason so the claimed ticket never stays in `Generating
    /// Response`.
    async fn load_context(&self, ticket: &Ticket) -> Result<(Tenant, Persona), String> {
        let tenant = self
            .store
            .tenant(ticket.tenant_id)
            .await
            .map_err(|e| format!("falha ao carregar tenant {}: {e}", ticket.tenant_id))?
            .ok_or_else(|| format!("tenant {} not found", ticket.tenant_id))?;
        let persona_id = ticket
            .persona_id
            .or(tenant.default_persona_id)
            .ok_or_else(|| "nenhuma persona configurada".to_string())?;
        let persona = self
            .store
            .persona(persona_id)
            .await
            .map_err(|e| format!("falha ao carregar persona {persona_id}: {e}"))?
            .ok_or_else(|| format!("persona {persona_id} não encontrada"))?;
        Ok((tenant, persona))
    }

    async fn fail(&self, ticket_id: i64, status: TicketStatus, reason: &str) -> Result<Cycle, StoreError> {
        self.store
            .with_locked_ticket(ticket_id, &mut |ticket: &mut Ticket| {
                fail_generation(ticket, status, reason);
                true
            })
            .await?;
        Ok(Cycle::Failed(status))
    }

    /// Sends the text parts, then the attachments. A text failure stops
    /// everything; an attachment failure only skips that file.
    async fn deliver(
        &self,
        tenant: &Tenant,
        persona: &Persona,
        ticket: &Ticket,
        action: &AgentAction,
    ) -> Delivery {
        let mut delivery = Delivery::default();

        let parts = action.message.as_deref().map(split_parts).unwrap_or_default();
        for (index, part) in parts.iter().enumerate() {
            if index > 0 {
                self.pause_between_parts().await;
            }
            match self.whatsapp.send_text(tenant, &ticket.phone, part).await {
                Ok(sent) => {
                    let timestamp = sent.timestamp.unwrap_or_else(|| Utc::now().timestamp());
                    delivery.sent.push(
                        Message::assistant(message_id_or_local(sent.id), part.clone(), timestamp)
                            .with_kind(MessageKind::Text),
                    );
                }
                Err(err) => {
                    warn!(ticket_id = ticket.id, part = index, error = %err, "text send failed");
                    delivery.failure = Some((TicketStatus::SendFailed, vendor_note("Falha no envio", &err)));
                    return delivery;
                }
            }
        }

        for attachment in action.attachments.iter().flatten() {
            if let Err(reason) = self.send_attachment(tenant, persona, ticket, attachment, &mut delivery.sent).await {
                warn!(ticket_id = ticket.id, file_id = %attachment.file_id, reason = %reason, "attachment not sent");
                if delivery.failure.is_none() {
                    delivery.failure = Some((TicketStatus::DriveError, reason));
                }
            }
        }
        delivery
    }

    async fn send_attachment(
        &self,
        tenant: &Tenant,
        persona: &Persona,
        ticket: &Ticket,
        attachment: &Attachment,
        sent: &mut Vec<Message>,
    ) -> Result<(), String> {
        let file = persona
            .drive_tree
            .as_ref()
            .and_then(|tree| tree.find_file(attachment.file_id.trim()))
            .ok_or_else(|| format!("Erro no Drive: arquivo '{}' não está na lista", attachment.exact_name))?;
        let bytes = self
            .drive
            .download(&file.id)
            .await
            .map_err(|e| format!("Erro no Drive: {e}"))?;

        let kind = outbound_kind(attachment, &file.mime_type);
        let filename = if attachment.exact_name.trim().is_empty() {
            file.name.as_str()
        } else {
            attachment.exact_name.trim()
        };
        let mime_type = if file.mime_type.is_empty() {
            "application/octet-stream"
        } else {
            file.mime_type.as_str()
        };
        let result = self
            .whatsapp
            .send_media(
                tenant,
                &ticket.phone,
                MediaUpload {
                    kind,
                    bytes: bytes.as_ref(),
                    filename,
                    mime_type,
                    caption: None,
                },
            )
            .await
            .map_err(|e| vendor_note("Erro no envio do arquivo", &e))?;

        let mut message = Message::assistant(
            message_id_or_local(result.id),
            format!("[Arquivo enviado: {filename}]"),
            Utc::now().timestamp(),
        )
        .with_kind(message_kind(kind));
        message.media_id = Some(result.media_id);
        message.mime_type = Some(mime_type.to_string());
        message.filename = Some(filename.to_string());
        sent.push(message);
        Ok(())
    }

    async fn finalize(
        &self,
        tenant: &Tenant,
        ticket_id: i64,
        action: &AgentAction,
        delivery: Delivery,
    ) -> Result<Cycle, StoreError> {
        let notes = action
            .notes
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        let (next_status, summary) = match &delivery.failure {
            Some((status, reason)) => (*status, append_note(&notes, reason)),
            None => (
                TicketStatus::from_agent_choice(action.next_status.as_deref().unwrap_or("")),
                notes,
            ),
        };
        let outcome = AgentOutcome {
            sent: delivery.sent,
            next_status: Some(next_status),
            summary: Some(summary),
            contact_name: action.contact_name.clone(),
            tags: action.suggested_tags.clone().unwrap_or_default(),
        };
        self.apply_outcome(tenant, ticket_id, outcome).await
    }

    /// Reopens the ticket under lock and folds the outcome in.
    pub async fn apply_outcome(
        &self,
        tenant: &Tenant,
        ticket_id: i64,
        outcome: AgentOutcome,
    ) -> Result<Cycle, StoreError> {
        let sent = outcome.sent.len();
        let mut result = None;
        self.store
            .with_locked_ticket(ticket_id, &mut |ticket: &mut Ticket| {
                result = Some(finalize_generation(ticket, outcome.clone(), &tenant.tag_catalog));
                true
            })
            .await?;
        let Some(finalized) = result else {
            warn!(ticket_id, "ticket vanished before finalize");
            return Ok(Cycle::Skipped);
        };
        match finalized {
            Finalized::Applied(status) => {
                info!(ticket_id, tenant_id = tenant.id, status = %status, sent, "response finalized")
            }
            Finalized::Interleaved(status) => {
                info!(ticket_id, tenant_id = tenant.id, status = %status, sent, "inbound arrived during generation, status kept")
            }
        }
        Ok(Cycle::Finalized(finalized))
    }

    pub async fn run(self: Arc<Self>, poll: Duration, shutdown: CancellationToken) {
        info!(poll_seconds = poll.as_secs(), "agent scheduler started");
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.poll_once(Utc::now()).await {
                error!(error = %err, "agent poll failed");
            }
        }
        info!("agent scheduler stopped");
    }
}
