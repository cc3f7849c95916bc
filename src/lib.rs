//! WhatsApp customer-service agent: webhook receiver, inbound enrichment
//! worker, reply scheduler and follow-up engine sharing one Postgres store.

pub mod agent;
pub mod config;
pub mod credentials;
pub mod drive;
pub mod error;
pub mod followup;
pub mod inbound;
pub mod llm;
pub mod phone;
pub mod prompting;
pub mod queue;
pub mod shutdown;
pub mod store;
pub mod timeline;
pub mod transcoder;
pub mod types;
pub mod webhook;
pub mod whatsapp;

#[cfg(test)]
mod testing;
