//! Timeline and status rules shared by every writer of a ticket.
//!
//! All functions here are pure; the store calls them inside the row-locked
//! transaction so that ordering and deduplication hold regardless of which
//! process performed the write.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::types::{Message, Role, Tag, Ticket, TicketStatus};

pub const SUMMARY_NOTE_LIMIT: usize = 250;

const TAG_PALETTE: [&str; 8] = [
    "#2563eb", "#16a34a", "#dc2626", "#d97706", "#7c3aed", "#0891b2", "#db2777", "#4b5563",
];

/// Appends messages whose id is not already in the timeline, then re-sorts by
/// timestamp. The sort is stable so equal timestamps keep arrival order.
/// Returns how many messages were actually added.
pub fn append_messages<I>(timeline: &mut Vec<Message>, incoming: I) -> usize
where
    I: IntoIterator<Item = Message>,
{
    let mut seen = timeline
        .iter()
        .map(|message| message.id.clone())
        .collect::<HashSet<_>>();
    let before = timeline.len();
    for message in incoming {
        if seen.insert(message.id.clone()) {
            timeline.push(message);
        }
    }
    timeline.sort_by_key(|message| message.timestamp);
    timeline.len() - before
}

pub fn contains_message(timeline: &[Message], message_id: &str) -> bool {
    timeline.iter().any(|message| message.id == message_id)
}

pub fn last_user_timestamp(timeline: &[Message]) -> Option<i64> {
    timeline
        .iter()
        .filter(|message| message.role == Role::User)
        .map(|message| message.timestamp)
        .max()
}

/// Status after an inbound event: sticky statuses survive, anything else is
/// reset to `Message Received`.
pub fn status_after_inbound(current: TicketStatus) -> TicketStatus {
    if current.is_sticky() {
        current
    } else {
        TicketStatus::MessageReceived
    }
}

/// Records one inbound user message on the ticket. Returns false when the
/// vendor id was already present, in which case nothing changes.
pub fn record_inbound(ticket: &mut Ticket, message: Message) -> bool {
    if append_messages(&mut ticket.timeline, [message]) == 0 {
        return false;
    }
    ticket.status = status_after_inbound(ticket.status);
    true
}

/// Marks a previously sent message as failed. Returns false when the id is not
/// in the timeline.
pub fn mark_delivery_failed(
    ticket: &mut Ticket,
    message_id: &str,
    error_code: Option<i64>,
    error_title: Option<String>,
) -> bool {
    let Some(message) = ticket
        .timeline
        .iter_mut()
        .find(|message| message.id == message_id)
    else {
        return false;
    };
    message.status = Some(crate::types::DeliveryStatus::Failed);
    message.error_code = error_code;
    message.error_title = error_title;
    true
}

pub fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    text.chars().take(limit).collect()
}

/// Human readable diagnostic for the CRM summary, capped at 250 characters.
pub fn summary_note(text: &str) -> String {
    truncate_chars(text.trim(), SUMMARY_NOTE_LIMIT)
}

/// Appends a truncated note on its own line after the existing summary.
pub fn append_note(summary: &str, text: &str) -> String {
    let note = summary_note(text);
    let summary = summary.trim_end();
    if summary.is_empty() {
        note
    } else {
        format!("{summary}\n{note}")
    }
}

pub fn palette_color(name: &str) -> String {
    let digest = Sha256::digest(name.trim().to_lowercase().as_bytes());
    TAG_PALETTE[digest[0] as usize % TAG_PALETTE.len()].to_string()
}

/// Merges suggested tag names into the ticket tags by case-insensitive name.
/// Colors come from the tenant catalog when the name is known there.
pub fn merge_tags(existing: &[Tag], suggested: &[String], catalog: &[Tag]) -> Vec<Tag> {
    let mut merged = existing.to_vec();
    for raw in suggested {
        let name = raw.trim();
        if name.is_empty() {
            continue;
        }
        if merged
            .iter()
            .any(|tag| tag.name.eq_ignore_ascii_case(name))
        {
            continue;
        }
        let color = catalog
            .iter()
            .find(|tag| tag.name.eq_ignore_ascii_case(name))
            .map(|tag| tag.color.clone())
            .unwrap_or_else(|| palette_color(name));
        let name = catalog
            .iter()
            .find(|tag| tag.name.eq_ignore_ascii_case(name))
            .map(|tag| tag.name.clone())
            .unwrap_or_else(|| name.to_string());
        merged.push(Tag { name, color });
    }
    merged
}

/// Everything the agent produced during one generation cycle.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub sent: Vec<Message>,
    pub next_status: Option<TicketStatus>,
    pub summary: Option<String>,
    pub contact_name: Option<String>,
    pub tags: Vec<String>,
}

/// What `finalize_generation` did to the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalized {
    Applied(TicketStatus),
    Interleaved(TicketStatus),
}

/// Folds a generation cycle back into the ticket. The agent's messages are
/// always appended; the status is only replaced while the ticket is still in
/// `Generating Response`, otherwise an inbound event won the race and its
/// status is preserved.
pub fn finalize_generation(ticket: &mut Ticket, outcome: AgentOutcome, catalog: &[Tag]) -> Finalized {
    append_messages(&mut ticket.timeline, outcome.sent);

    let summary = outcome
        .summary
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| ticket.summary.clone());

    let result = if ticket.status == TicketStatus::GeneratingResponse {
        let next = outcome.next_status.unwrap_or(TicketStatus::AwaitingResponse);
        ticket.status = next;
        ticket.summary = summary;
        Finalized::Applied(next)
    } else {
        let note = "Nova mensagem do contato chegou durante a geração da resposta; status preservado.";
        ticket.summary = append_note(&summary, note);
        Finalized::Interleaved(ticket.status)
    };

    let has_name = ticket
        .contact_name
        .as_deref()
        .map(|name| !name.trim().is_empty())
        .unwrap_or(false);
    if !has_name {
        if let Some(name) = outcome
            .contact_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
        {
            ticket.contact_name = Some(name);
        }
    }

    ticket.tags = merge_tags(&ticket.tags, &outcome.tags, catalog);
    result
}

/// Moves a ticket that is still generating into an error status and records
/// the reason. Tickets that moved on meanwhile only get the note.
pub fn fail_generation(ticket: &mut Ticket, status: TicketStatus, reason: &str) {
    if ticket.status == TicketStatus::GeneratingResponse {
        ticket.status = status;
    }
    ticket.summary = append_note(&ticket.summary, reason);
}
