//! In-memory store and queue used by the pipeline tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{
    error::{QueueError, StoreError},
    queue::{WorkItem, WorkQueue, MAX_ATTEMPTS},
    store::{ConversationStore, TicketEdit, TokenLedger},
    types::{Persona, Tenant, Ticket, TicketStatus},
};

#[derive(Default)]
struct State {
    tenants: HashMap<i64, Tenant>,
    personas: HashMap<i64, Persona>,
    tickets: Vec<Ticket>,
    corrupt_personas: HashSet<i64>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn add_tenant(&self, tenant: Tenant) {
        self.state.lock().unwrap().tenants.insert(tenant.id, tenant);
    }

    pub fn add_persona(&self, persona: Persona) {
        self.state.lock().unwrap().personas.insert(persona.id, persona);
    }

    pub fn insert_ticket(&self, ticket: Ticket) {
        self.state.lock().unwrap().tickets.push(ticket);
    }

    pub fn tickets(&self) -> Vec<Ticket> {
        self.state.lock().unwrap().tickets.clone()
    }

    pub fn ticket_now(&self, id: i64) -> Ticket {
        self.tickets()
            .into_iter()
            .find(|ticket| ticket.id == id)
            .unwrap()
    }

    pub fn tokens(&self, tenant_id: i64) -> i64 {
        self.state.lock().unwrap().tenants[&tenant_id].tokens
    }

    pub fn set_tokens(&self, tenant_id: i64, tokens: i64) {
        if let Some(tenant) = self.state.lock().unwrap().tenants.get_mut(&tenant_id) {
            tenant.tokens = tokens;
        }
    }

    /// Makes `persona()` fail for this id the way an unparseable row does.
    pub fn corrupt_persona(&self, id: i64) {
        self.state.lock().unwrap().corrupt_personas.insert(id);
    }

    /// Moves `updated_at` into the past so settle delays can be simulated.
    pub fn age_ticket(&self, id: i64, by: chrono::Duration) {
        let mut state = self.state.lock().unwrap();
        if let Some(ticket) = state.tickets.iter_mut().find(|ticket| ticket.id == id) {
            ticket.updated_at -= by;
        }
    }
}

#[async_trait]
impl TokenLedger for MemoryStore {
    async fn debit_token(&self, tenant_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(tenant) = state.tenants.get_mut(&tenant_id) {
            if tenant.tokens > 0 {
                tenant.tokens -= 1;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn tenant(&self, tenant_id: i64) -> Result<Option<Tenant>, StoreError> {
        Ok(self.state.lock().unwrap().tenants.get(&tenant_id).cloned())
    }

    async fn tenant_by_phone_number_id(&self, phone_number_id: &str) -> Result<Option<Tenant>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tenants
            .values()
            .find(|tenant| tenant.phone_number_id == phone_number_id)
            .cloned())
    }

    async fn followup_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let mut tenants = self
            .state
            .lock()
            .unwrap()
            .tenants
            .values()
            .filter(|tenant| tenant.followup_enabled)
            .cloned()
            .collect::<Vec<_>>();
        tenants.sort_by_key(|tenant| tenant.id);
        Ok(tenants)
    }

    async fn persona(&self, persona_id: i64) -> Result<Option<Persona>, StoreError> {
        let state = self.state.lock().unwrap();
        if state.corrupt_personas.contains(&persona_id) {
            return Err(StoreError::Corrupt {
                table: "personas",
                id: persona_id,
                reason: "bad drive_tree json".to_string(),
            });
        }
        Ok(state.personas.get(&persona_id).cloned())
    }

    async fn find_ticket(&self, tenant_id: i64, phone: &str) -> Result<Option<Ticket>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tickets
            .iter()
            .find(|ticket| ticket.tenant_id == tenant_id && ticket.phone == phone)
            .cloned())
    }

    async fn get_or_create_ticket(
        &self,
        tenant: &Tenant,
        phone: &str,
        contact_name: Option<&str>,
    ) -> Result<Ticket, StoreError> {
        let mut state = self.state.lock().unwrap();
        let contact_name = contact_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        if let Some(ticket) = state
            .tickets
            .iter_mut()
            .find(|ticket| ticket.tenant_id == tenant.id && ticket.phone == phone)
        {
            if ticket.contact_name.as_deref().unwrap_or("").is_empty() && contact_name.is_some() {
                ticket.contact_name = contact_name;
            }
            return Ok(ticket.clone());
        }
        let id = state.tickets.iter().map(|ticket| ticket.id).max().unwrap_or(0) + 1;
        let mut ticket = Ticket::new(id, tenant, phone, Utc::now());
        ticket.contact_name = contact_name;
        state.tickets.push(ticket.clone());
        Ok(ticket)
    }

    async fn with_locked_ticket(
        &self,
        ticket_id: i64,
        edit: TicketEdit<'_>,
    ) -> Result<Option<Ticket>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(slot) = state.tickets.iter_mut().find(|ticket| ticket.id == ticket_id) else {
            return Ok(None);
        };
        let mut ticket = slot.clone();
        if !edit(&mut ticket) {
            return Ok(Some(ticket));
        }
        ticket.timeline.sort_by_key(|message| message.timestamp);
        let now = Utc::now();
        ticket.updated_at = if now > slot.updated_at {
            now
        } else {
            slot.updated_at + chrono::Duration::microseconds(1)
        };
        *slot = ticket.clone();
        Ok(Some(ticket))
    }

    async fn eligible_tickets(
        &self,
        settled_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<i64>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut eligible = state
            .tickets
            .iter()
            .filter(|ticket| {
                state
                    .tenants
                    .get(&ticket.tenant_id)
                    .map(|tenant| tenant.agent_enabled && tenant.tokens > 0)
                    .unwrap_or(false)
            })
            .filter(|ticket| ticket.status == TicketStatus::MessageReceived)
            .filter(|ticket| ticket.updated_at < settled_before)
            .collect::<Vec<_>>();
        eligible.sort_by_key(|ticket| ticket.updated_at);
        Ok(eligible
            .into_iter()
            .take(limit)
            .map(|ticket| ticket.id)
            .collect())
    }

    async fn tickets_updated_since(
        &self,
        tenant_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<Ticket>, StoreError> {
        let mut tickets = self
            .state
            .lock()
            .unwrap()
            .tickets
            .iter()
            .filter(|ticket| ticket.tenant_id == tenant_id && ticket.updated_at >= since)
            .cloned()
            .collect::<Vec<_>>();
        tickets.sort_by_key(|ticket| ticket.updated_at);
        Ok(tickets)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    Processing,
    Failed,
}

#[derive(Default)]
pub struct MemoryQueue {
    items: Mutex<VecDeque<(WorkItem, ItemState)>>,
    next_id: Mutex<i64>,
    fail_enqueue: Mutex<bool>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        MemoryQueue::default()
    }

    pub fn failing() -> Self {
        let queue = MemoryQueue::default();
        *queue.fail_enqueue.lock().unwrap() = true;
        queue
    }

    pub fn push_raw(&self, payload: &str) -> i64 {
        let id = {
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            *next_id
        };
        self.items.lock().unwrap().push_back((
            WorkItem {
                id,
                payload: payload.to_string(),
                attempts: 0,
            },
            ItemState::Pending,
        ));
        id
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.items
            .lock()
            .unwrap()
            .iter()
            .map(|(item, _)| serde_json::from_str(&item.payload).unwrap())
            .collect()
    }

    pub fn state_of(&self, id: i64) -> Option<ItemState> {
        self.items
            .lock()
            .unwrap()
            .iter()
            .find(|(item, _)| item.id == id)
            .map(|(_, state)| *state)
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, payload: &Value) -> Result<i64, QueueError> {
        if *self.fail_enqueue.lock().unwrap() {
            return Err(QueueError::Database(sqlx::Error::PoolTimedOut));
        }
        let body = serde_json::to_string(payload)?;
        Ok(self.push_raw(&body))
    }

    async fn dequeue(&self) -> Result<Option<WorkItem>, QueueError> {
        let mut items = self.items.lock().unwrap();
        let next = items
            .iter_mut()
            .find(|(item, state)| *state == ItemState::Pending && item.attempts < MAX_ATTEMPTS);
        Ok(next.map(|(item, state)| {
            *state = ItemState::Processing;
            item.attempts += 1;
            item.clone()
        }))
    }

    async fn ack(&self, id: i64) -> Result<(), QueueError> {
        self.items.lock().unwrap().retain(|(item, _)| item.id != id);
        Ok(())
    }

    async fn nack(&self, id: i64) -> Result<(), QueueError> {
        let mut items = self.items.lock().unwrap();
        if let Some((item, state)) = items.iter_mut().find(|(item, _)| item.id == id) {
            *state = if item.attempts >= MAX_ATTEMPTS {
                ItemState::Failed
            } else {
                ItemState::Pending
            };
        }
        Ok(())
    }

    async fn wait_for_work(&self, timeout: Duration) {
        tokio::time::sleep(timeout.min(Duration::from_millis(5))).await;
    }
}

pub fn tenant(id: i64) -> Tenant {
    Tenant {
        id,
        name: "Loja Teste".to_string(),
        phone_number_id: format!("pn-{id}"),
        business_account_id: Some(format!("waba-{id}")),
        credentials: "token-abc".to_string(),
        default_persona_id: Some(id * 100),
        tokens: 10,
        agent_enabled: true,
        followup_enabled: false,
        followup: Default::default(),
        tag_catalog: Vec::new(),
    }
}

pub fn persona(id: i64) -> Persona {
    Persona {
        id,
        name: "Bia".to_string(),
        system_prompt: "Atenda com simpatia.".to_string(),
        sheet_context: Value::Null,
        drive_tree: None,
    }
}
