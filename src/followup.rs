//! Business-hours aware follow-ups for contacts that went quiet.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::StoreError,
    llm::LlmClient,
    prompting::build_followup_prompt,
    store::ConversationStore,
    timeline::{append_messages, last_user_timestamp},
    types::{BusinessHours, FollowupInterval, Message, MessageKind, Role, Tenant, Ticket, TicketStatus},
    whatsapp::WhatsAppClient,
};

/// No follow-up once the vendor's 24 hour customer window has closed.
const MESSAGING_WINDOW_HOURS: f64 = 24.0;

pub fn followup_tag(hours: u32) -> String {
    format!("followup_{hours}h_sent")
}

fn parse_clock(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}

/// Whether `now` falls on a configured weekday (0 = Sunday) between `start`
/// and `end`, both inclusive, in the tenant's timezone. An empty day list
/// means every day.
pub fn within_business_hours(hours: &BusinessHours, now: DateTime<Utc>) -> bool {
    let tz = match hours.timezone.trim().parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(timezone = %hours.timezone, "unknown timezone in business hours");
            return false;
        }
    };
    let (Some(start), Some(end)) = (parse_clock(&hours.start), parse_clock(&hours.end)) else {
        warn!(start = %hours.start, end = %hours.end, "unparseable business hours");
        return false;
    };

    let local = now.with_timezone(&tz);
    let weekday = local.weekday().num_days_from_sunday() as u8;
    if !hours.days.is_empty() && !hours.days.contains(&weekday) {
        return false;
    }
    let Some(clock) = NaiveTime::from_hms_opt(local.hour(), local.minute(), 0) else {
        return false;
    };
    if start <= end {
        clock >= start && clock <= end
    } else {
        clock >= start || clock <= end
    }
}

/// The follow-up interval that is due for this timeline, if any: the smallest
/// configured interval already elapsed since the last user message that has
/// not been sent since that message.
pub fn due_interval(timeline: &[Message], intervals: &[FollowupInterval], now: DateTime<Utc>) -> Option<u32> {
    let last_user = last_user_timestamp(timeline)?;
    let inactive_hours = (now.timestamp() - last_user) as f64 / 3600.0;
    if inactive_hours > MESSAGING_WINDOW_HOURS || inactive_hours < 0.0 {
        return None;
    }

    let mut hours = intervals
        .iter()
        .map(|interval| interval.hours)
        .filter(|hours| *hours > 0)
        .collect::<Vec<_>>();
    hours.sort_unstable();
    hours.dedup();

    hours.into_iter().find(|&h| {
        if inactive_hours < f64::from(h) {
            return false;
        }
        let tag = followup_tag(h);
        !timeline.iter().any(|message| {
            message.role == Role::Assistant
                && message.tag.as_deref() == Some(tag.as_str())
                && message.timestamp > last_user
        })
    })
}

fn skips_followups(status: TicketStatus) -> bool {
    matches!(
        status,
        TicketStatus::IgnoreContact
            | TicketStatus::HandlerCalled
            | TicketStatus::Completed
            | TicketStatus::GeneratingResponse
    )
}

pub struct FollowupScheduler {
    store: Arc<dyn ConversationStore>,
    whatsapp: WhatsAppClient,
    llm: Arc<LlmClient>,
}

impl FollowupScheduler {
    pub fn new(store: Arc<dyn ConversationStore>, whatsapp: WhatsAppClient, llm: Arc<LlmClient>) -> Self {
        FollowupScheduler {
            store,
            whatsapp,
            llm,
        }
    }

    /// One pass over every follow-up tenant. Returns how many follow-ups
    /// were sent.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut sent = 0;
        for tenant in self.store.followup_tenants().await? {
            if tenant.tokens <= 0 {
                debug!(tenant_id = tenant.id, "tenant out of tokens, no follow-ups");
                continue;
            }
            if tenant.followup.intervals.is_empty() {
                continue;
            }
            if !within_business_hours(&tenant.followup.business_hours, now) {
                debug!(tenant_id = tenant.id, "outside business hours");
                continue;
            }
            let since = now - chrono::Duration::hours(24);
            for ticket in self.store.tickets_updated_since(tenant.id, since).await? {
                if skips_followups(ticket.status) {
                    continue;
                }
                let Some(hours) = due_interval(&ticket.timeline, &tenant.followup.intervals, now) else {
                    continue;
                };
                if self.send_followup(&tenant, &ticket, hours, now).await? {
                    sent += 1;
                }
            }
        }
        Ok(sent)
    }

    async fn send_followup(
        &self,
        tenant: &Tenant,
        ticket: &Ticket,
        hours: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let persona = match ticket.persona_id.or(tenant.default_persona_id) {
            Some(persona_id) => self.store.persona(persona_id).await?,
            None => None,
        };
        let prompt = build_followup_prompt(tenant, persona.as_ref(), ticket, hours, now);
        let action = match self.llm.generate_followup(tenant.id, &prompt).await {
            Ok(action) => action,
            Err(err) => {
                warn!(tenant_id = tenant.id, ticket_id = ticket.id, hours, error = %err, "follow-up generation failed");
                return Ok(false);
            }
        };
        let Some(text) = action
            .message
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
        else {
            debug!(ticket_id = ticket.id, hours, "model declined to follow up");
            return Ok(false);
        };

        let sent = match self.whatsapp.send_text(tenant, &ticket.phone, &text).await {
            Ok(sent) => sent,
            Err(err) => {
                warn!(tenant_id = tenant.id, ticket_id = ticket.id, hours, error = %err, "follow-up send failed");
                return Ok(false);
            }
        };

        let id = if sent.id.trim().is_empty() {
            format!("local-{}", Uuid::new_v4())
        } else {
            sent.id
        };
        let mut message = Message::assistant(id, text, sent.timestamp.unwrap_or_else(|| now.timestamp()))
            .with_kind(MessageKind::Followup);
        message.tag = Some(followup_tag(hours));

        self.store
            .with_locked_ticket(ticket.id, &mut |ticket: &mut Ticket| {
                append_messages(&mut ticket.timeline, [message.clone()]) > 0
            })
            .await?;
        info!(tenant_id = tenant.id, ticket_id = ticket.id, phone = %ticket.phone, hours, "follow-up sent");
        Ok(true)
    }

    pub async fn run(self: Arc<Self>, poll: Duration, shutdown: CancellationToken) {
        info!(poll_seconds = poll.as_secs(), "follow-up scheduler started");
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.poll_once(Utc::now()).await {
                Ok(0) => {}
                Ok(sent) => debug!(sent, "follow-up pass finished"),
                Err(err) => error!(error = %err, "follow-up poll failed"),
            }
        }
        info!("follow-up scheduler stopped");
    }
}
