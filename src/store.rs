//! Conversation store: tenants, personas and tickets with their timelines.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::debug;

use crate::{
    error::StoreError,
    types::{DriveNode, FollowupConfig, Message, Persona, Tag, Tenant, Ticket, TicketStatus},
};

/// Mutation applied to a row-locked ticket. Returns true when the ticket was
/// changed and must be written back.
pub type TicketEdit<'a> = &'a mut (dyn FnMut(&mut Ticket) -> bool + Send);

#[async_trait]
pub trait TokenLedger: Send + Sync {
    /// Consumes one unit of the tenant's quota. Never drives it below zero.
    async fn debit_token(&self, tenant_id: i64) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ConversationStore: TokenLedger {
    async fn tenant(&self, tenant_id: i64) -> Result<Option<Tenant>, StoreError>;

    async fn tenant_by_phone_number_id(&self, phone_number_id: &str) -> Result<Option<Tenant>, StoreError>;

    async fn followup_tenants(&self) -> Result<Vec<Tenant>, StoreError>;

    async fn persona(&self, persona_id: i64) -> Result<Option<Persona>, StoreError>;

    async fn find_ticket(&self, tenant_id: i64, phone: &str) -> Result<Option<Ticket>, StoreError>;

    /// Returns the single ticket for `(tenant, phone)`, creating it in
    /// `Message Received` with the tenant's default persona when absent.
    async fn get_or_create_ticket(
        &self,
        tenant: &Tenant,
        phone: &str,
        contact_name: Option<&str>,
    ) -> Result<Ticket, StoreError>;

    /// Runs `edit` against the ticket under a row lock in one transaction.
    /// The timeline is re-sorted and `updated_at` advanced only when `edit`
    /// reports a change. Returns the ticket as it stands after the edit.
    async fn with_locked_ticket(
        &self,
        ticket_id: i64,
        edit: TicketEdit<'_>,
    ) -> Result<Option<Ticket>, StoreError>;

    /// Tickets waiting for the agent: status `Message Received`, untouched
    /// since `settled_before`, owned by an enabled tenant with quota left.
    /// Oldest first.
    async fn eligible_tickets(
        &self,
        settled_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<i64>, StoreError>;

    async fn tickets_updated_since(
        &self,
        tenant_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<Ticket>, StoreError>;
}

#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

fn json_text<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn parse_json_column<T: DeserializeOwned>(
    raw: &str,
    table: &'static str,
    id: i64,
) -> Result<T, StoreError> {
    serde_json::from_str::<T>(raw).map_err(|e| StoreError::Corrupt {
        table,
        id,
        reason: e.to_string(),
    })
}

const TENANT_COLUMNS: &str = "id, name, phone_number_id, business_account_id, credentials, \
    default_persona_id, tokens, agent_enabled, followup_enabled, followup_config, tag_catalog";

const TICKET_COLUMNS: &str = "id, tenant_id, phone, contact_name, status, persona_id, conversa, \
    summary, tags, created_at, updated_at";

fn parse_tenant_row(row: &PgRow) -> Result<Tenant, StoreError> {
    let id: i64 = row.try_get("id")?;
    let followup_raw: String = row.try_get("followup_config")?;
    let catalog_raw: String = row.try_get("tag_catalog")?;
    Ok(Tenant {
        id,
        name: row.try_get("name")?,
        phone_number_id: row.try_get("phone_number_id")?,
        business_account_id: row.try_get("business_account_id")?,
        credentials: row.try_get("credentials")?,
        default_persona_id: row.try_get("default_persona_id")?,
        tokens: row.try_get("tokens")?,
        agent_enabled: row.try_get("agent_enabled")?,
        followup_enabled: row.try_get("followup_enabled")?,
        followup: parse_json_column::<FollowupConfig>(&followup_raw, "tenants", id)?,
        tag_catalog: parse_json_column::<Vec<Tag>>(&catalog_raw, "tenants", id)?,
    })
}

fn parse_ticket_row(row: &PgRow) -> Result<Ticket, StoreError> {
    let id: i64 = row.try_get("id")?;
    let status_raw: String = row.try_get("status")?;
    let status = status_raw
        .parse::<TicketStatus>()
        .map_err(|e| StoreError::Corrupt {
            table: "tickets",
            id,
            reason: e.to_string(),
        })?;
    let conversa: String = row.try_get("conversa")?;
    let tags: String = row.try_get("tags")?;
    Ok(Ticket {
        id,
        tenant_id: row.try_get("tenant_id")?,
        phone: row.try_get("phone")?,
        contact_name: row.try_get("contact_name")?,
        status,
        persona_id: row.try_get("persona_id")?,
        timeline: parse_json_column::<Vec<Message>>(&conversa, "tickets", id)?,
        summary: row.try_get("summary")?,
        tags: parse_json_column::<Vec<Tag>>(&tags, "tickets", id)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_persona_row(row: &PgRow) -> Result<Persona, StoreError> {
    let id: i64 = row.try_get("id")?;
    let sheet_raw: String = row.try_get("sheet_context")?;
    let drive_raw: Option<String> = row.try_get("drive_tree")?;
    let drive_tree = match drive_raw.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() && raw != "null" => {
            Some(parse_json_column::<DriveNode>(raw, "personas", id)?)
        }
        _ => None,
    };
    Ok(Persona {
        id,
        name: row.try_get("name")?,
        system_prompt: row.try_get("system_prompt")?,
        sheet_context: serde_json::from_str::<Value>(&sheet_raw).unwrap_or(Value::Null),
        drive_tree,
    })
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        PgStore { db }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.db).await?;
        Ok(())
    }
}

#[async_trait]
impl TokenLedger for PgStore {
    async fn debit_token(&self, tenant_id: i64) -> Result<(), StoreError> {
        let mut tx = self.db.begin().await?;
        sqlx::query("UPDATE tenants SET tokens = tokens - 1 WHERE id = $1 AND tokens > 0")
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn tenant(&self, tenant_id: i64) -> Result<Option<Tenant>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1"))
            .bind(tenant_id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(parse_tenant_row).transpose()
    }

    async fn tenant_by_phone_number_id(&self, phone_number_id: &str) -> Result<Option<Tenant>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE phone_number_id = $1 LIMIT 1"
        ))
        .bind(phone_number_id)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(parse_tenant_row).transpose()
    }

    async fn followup_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE followup_enabled = true ORDER BY id"
        ))
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(parse_tenant_row).collect()
    }

    async fn persona(&self, persona_id: i64) -> Result<Option<Persona>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, system_prompt, sheet_context, drive_tree FROM personas WHERE id = $1",
        )
        .bind(persona_id)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(parse_persona_row).transpose()
    }

    async fn find_ticket(&self, tenant_id: i64, phone: &str) -> Result<Option<Ticket>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE tenant_id = $1 AND phone = $2"
        ))
        .bind(tenant_id)
        .bind(phone)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(parse_ticket_row).transpose()
    }

    async fn get_or_create_ticket(
        &self,
        tenant: &Tenant,
        phone: &str,
        contact_name: Option<&str>,
    ) -> Result<Ticket, StoreError> {
        let contact_name = contact_name
            .map(str::trim)
            .filter(|name| !name.is_empty());
        // The unique (tenant_id, phone) constraint makes concurrent creators
        // converge on one row; the no-op update only exists to get RETURNING.
        let row = sqlx::query(&format!(
            "INSERT INTO tickets (tenant_id, phone, contact_name, status, persona_id) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (tenant_id, phone) DO UPDATE \
             SET contact_name = COALESCE(NULLIF(tickets.contact_name, ''), EXCLUDED.contact_name) \
             RETURNING {TICKET_COLUMNS}"
        ))
        .bind(tenant.id)
        .bind(phone)
        .bind(contact_name)
        .bind(TicketStatus::MessageReceived.as_str())
        .bind(tenant.default_persona_id)
        .fetch_one(&self.db)
        .await?;
        parse_ticket_row(&row)
    }

    async fn with_locked_ticket(
        &self,
        ticket_id: i64,
        edit: TicketEdit<'_>,
    ) -> Result<Option<Ticket>, StoreError> {
        let mut tx = self.db.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1 FOR UPDATE"
        ))
        .bind(ticket_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let mut ticket = parse_ticket_row(&row)?;
        if !edit(&mut ticket) {
            tx.rollback().await?;
            return Ok(Some(ticket));
        }

        ticket.timeline.sort_by_key(|message| message.timestamp);
        let updated_at: DateTime<Utc> = sqlx::query_scalar(
            "UPDATE tickets \
             SET status = $1, contact_name = $2, persona_id = $3, conversa = $4, \
                 summary = $5, tags = $6, \
                 updated_at = GREATEST(now(), updated_at + interval '1 microsecond') \
             WHERE id = $7 \
             RETURNING updated_at",
        )
        .bind(ticket.status.as_str())
        .bind(&ticket.contact_name)
        .bind(ticket.persona_id)
        .bind(json_text(&ticket.timeline))
        .bind(&ticket.summary)
        .bind(json_text(&ticket.tags))
        .bind(ticket.id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        ticket.updated_at = updated_at;
        debug!(ticket_id, status = %ticket.status, messages = ticket.timeline.len(), "ticket written");
        Ok(Some(ticket))
    }

    async fn eligible_tickets(
        &self,
        settled_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<i64>, StoreError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT t.id FROM tickets t \
             JOIN tenants tn ON tn.id = t.tenant_id \
             WHERE tn.agent_enabled = true \
               AND tn.tokens > 0 \
               AND t.status = $1 \
               AND t.updated_at < $2 \
             ORDER BY t.updated_at ASC \
             LIMIT $3",
        )
        .bind(TicketStatus::MessageReceived.as_str())
        .bind(settled_before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.db)
        .await?;
        Ok(ids)
    }

    async fn tickets_updated_since(
        &self,
        tenant_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<Ticket>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets \
             WHERE tenant_id = $1 AND updated_at >= $2 \
             ORDER BY updated_at ASC"
        ))
        .bind(tenant_id)
        .bind(since)
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(parse_ticket_row).collect()
    }
}
