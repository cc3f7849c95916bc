use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketStatus {
    #[serde(rename = "Message Received")]
    MessageReceived,
    #[serde(rename = "Generating Response")]
    GeneratingResponse,
    #[serde(rename = "Awaiting Response")]
    AwaitingResponse,
    #[serde(rename = "Handler Called", alias = "Human Handler Called")]
    HandlerCalled,
    #[serde(rename = "Completed")]
    Completed,
    #[serde(rename = "Ignore Contact")]
    IgnoreContact,
    #[serde(rename = "LLM Error")]
    LlmError,
    #[serde(rename = "Context Error")]
    ContextError,
    #[serde(rename = "Drive Error")]
    DriveError,
    #[serde(rename = "Send Failed")]
    SendFailed,
}

impl TicketStatus {
    pub const ALL: [TicketStatus; 10] = [
        TicketStatus::MessageReceived,
        TicketStatus::GeneratingResponse,
        TicketStatus::AwaitingResponse,
        TicketStatus::HandlerCalled,
        TicketStatus::Completed,
        TicketStatus::IgnoreContact,
        TicketStatus::LlmError,
        TicketStatus::ContextError,
        TicketStatus::DriveError,
        TicketStatus::SendFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::MessageReceived => "Message Received",
            TicketStatus::GeneratingResponse => "Generating Response",
            TicketStatus::AwaitingResponse => "Awaiting Response",
            TicketStatus::HandlerCalled => "Handler Called",
            TicketStatus::Completed => "Completed",
            TicketStatus::IgnoreContact => "Ignore Contact",
            TicketStatus::LlmError => "LLM Error",
            TicketStatus::ContextError => "Context Error",
            TicketStatus::DriveError => "Drive Error",
            TicketStatus::SendFailed => "Send Failed",
        }
    }

    /// Statuses an inbound event must not overwrite.
    pub fn is_sticky(self) -> bool {
        matches!(self, TicketStatus::IgnoreContact | TicketStatus::HandlerCalled)
    }

    /// Maps the status chosen by the model onto the closed set it may pick from.
    /// Anything unknown becomes `Awaiting Response`.
    pub fn from_agent_choice(raw: &str) -> TicketStatus {
        match raw.trim().parse::<TicketStatus>() {
            Ok(
                status @ (TicketStatus::AwaitingResponse
                | TicketStatus::HandlerCalled
                | TicketStatus::Completed),
            ) => status,
            _ => TicketStatus::AwaitingResponse,
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown ticket status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for TicketStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("Human Handler Called") {
            return Ok(TicketStatus::HandlerCalled);
        }
        TicketStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownStatus(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Video,
    Document,
    Sticker,
    Location,
    Contacts,
    Followup,
}

impl MessageKind {
    pub fn from_vendor_type(raw: &str) -> Option<MessageKind> {
        match raw {
            "text" | "button" | "interactive" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "audio" => Some(MessageKind::Audio),
            "video" => Some(MessageKind::Video),
            "document" => Some(MessageKind::Document),
            "sticker" => Some(MessageKind::Sticker),
            "location" => Some(MessageKind::Location),
            "contacts" => Some(MessageKind::Contacts),
            _ => None,
        }
    }

    pub fn is_media(self) -> bool {
        matches!(
            self,
            MessageKind::Image
                | MessageKind::Audio
                | MessageKind::Video
                | MessageKind::Document
                | MessageKind::Sticker
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Unread,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: i64,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default)]
    pub status: Option<DeliveryStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>, timestamp: i64) -> Self {
        Message {
            id: id.into(),
            role,
            content: content.into(),
            timestamp,
            kind: None,
            media_id: None,
            mime_type: None,
            filename: None,
            status: None,
            error_code: None,
            error_title: None,
            tag: None,
        }
    }

    pub fn user(id: impl Into<String>, content: impl Into<String>, timestamp: i64) -> Self {
        Message::new(id, Role::User, content, timestamp)
    }

    pub fn assistant(id: impl Into<String>, content: impl Into<String>, timestamp: i64) -> Self {
        Message::new(id, Role::Assistant, content, timestamp)
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub mime_type: String,
    #[serde(default)]
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DriveNode {
    Folder {
        name: String,
        #[serde(default)]
        files: Vec<DriveFile>,
        #[serde(default)]
        subfolders: Vec<DriveNode>,
    },
    File(DriveFile),
}

impl DriveNode {
    pub fn file_count(&self) -> usize {
        match self {
            DriveNode::File(_) => 1,
            DriveNode::Folder {
                files, subfolders, ..
            } => files.len() + subfolders.iter().map(DriveNode::file_count).sum::<usize>(),
        }
    }

    pub fn find_file(&self, file_id: &str) -> Option<&DriveFile> {
        match self {
            DriveNode::File(file) => (file.id == file_id).then_some(file),
            DriveNode::Folder {
                files, subfolders, ..
            } => files
                .iter()
                .find(|file| file.id == file_id)
                .or_else(|| subfolders.iter().find_map(|node| node.find_file(file_id))),
        }
    }

    /// Copy of the tree holding at most `limit` files, depth first.
    pub fn capped(&self, limit: usize) -> DriveNode {
        let mut remaining = limit;
        self.capped_inner(&mut remaining)
    }

    fn capped_inner(&self, remaining: &mut usize) -> DriveNode {
        match self {
            DriveNode::File(file) => {
                *remaining = remaining.saturating_sub(1);
                DriveNode::File(file.clone())
            }
            DriveNode::Folder {
                name,
                files,
                subfolders,
            } => {
                let take = files.len().min(*remaining);
                *remaining -= take;
                let kept_files = files.iter().take(take).cloned().collect::<Vec<_>>();
                let mut kept_folders = Vec::new();
                for folder in subfolders {
                    if *remaining == 0 {
                        break;
                    }
                    kept_folders.push(folder.capped_inner(remaining));
                }
                DriveNode::Folder {
                    name: name.clone(),
                    files: kept_files,
                    subfolders: kept_folders,
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Persona {
    pub id: i64,
    pub name: String,
    pub system_prompt: String,
    pub sheet_context: Value,
    pub drive_tree: Option<DriveNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub days: Vec<u8>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "America/Sao_Paulo".to_string()
}

impl Default for BusinessHours {
    fn default() -> Self {
        BusinessHours {
            start: "08:00".to_string(),
            end: "18:00".to_string(),
            days: vec![1, 2, 3, 4, 5],
            timezone: default_timezone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowupInterval {
    pub hours: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowupConfig {
    #[serde(default)]
    pub business_hours: BusinessHours,
    #[serde(default)]
    pub intervals: Vec<FollowupInterval>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    pub phone_number_id: String,
    pub business_account_id: Option<String>,
    pub credentials: String,
    pub default_persona_id: Option<i64>,
    pub tokens: i64,
    pub agent_enabled: bool,
    pub followup_enabled: bool,
    pub followup: FollowupConfig,
    pub tag_catalog: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    pub id: i64,
    pub tenant_id: i64,
    pub phone: String,
    pub contact_name: Option<String>,
    pub status: TicketStatus,
    pub persona_id: Option<i64>,
    pub timeline: Vec<Message>,
    pub summary: String,
    pub tags: Vec<Tag>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub fn new(id: i64, tenant: &Tenant, phone: &str, now: DateTime<Utc>) -> Self {
        Ticket {
            id,
            tenant_id: tenant.id,
            phone: phone.to_string(),
            contact_name: None,
            status: TicketStatus::MessageReceived,
            persona_id: tenant.default_persona_id,
            timeline: Vec::new(),
            summary: String::new(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_round_trip_through_serde() {
        for status in TicketStatus::ALL {
            let encoded = serde_json::to_string(&status).unwrap();
            assert_eq!(encoded, format!("\"{}\"", status.as_str()));
            let decoded: TicketStatus = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, status);
        }
    }

    #[test]
    fn human_handler_alias_parses() {
        let decoded: TicketStatus = serde_json::from_str("\"Human Handler Called\"").unwrap();
        assert_eq!(decoded, TicketStatus::HandlerCalled);
        assert_eq!(
            "human handler called".parse::<TicketStatus>(),
            Ok(TicketStatus::HandlerCalled)
        );
    }

    #[test]
    fn agent_choice_is_restricted() {
        assert_eq!(
            TicketStatus::from_agent_choice("Completed"),
            TicketStatus::Completed
        );
        assert_eq!(
            TicketStatus::from_agent_choice("Handler Called"),
            TicketStatus::HandlerCalled
        );
        assert_eq!(
            TicketStatus::from_agent_choice("Ignore Contact"),
            TicketStatus::AwaitingResponse
        );
        assert_eq!(
            TicketStatus::from_agent_choice("whatever"),
            TicketStatus::AwaitingResponse
        );
    }

    #[test]
    fn message_serializes_vendor_shape() {
        let mut message = Message::user("wamid.1", "oi", 10).with_kind(MessageKind::Text);
        message.tag = Some("followup_3h_sent".to_string());
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["role"], "user");
        assert_eq!(value["status"], Value::Null);
        assert!(value.get("media_id").is_none());
        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, message);
    }

    fn sample_tree() -> DriveNode {
        let file = |id: &str| DriveFile {
            id: id.to_string(),
            name: format!("{id}.pdf"),
            mime_type: "application/pdf".to_string(),
            link: String::new(),
        };
        DriveNode::Folder {
            name: "root".to_string(),
            files: vec![file("a"), file("b")],
            subfolders: vec![DriveNode::Folder {
                name: "inner".to_string(),
                files: vec![file("c"), file("d"), file("e")],
                subfolders: vec![],
            }],
        }
    }

    #[test]
    fn drive_tree_lookup_and_cap() {
        let tree = sample_tree();
        assert_eq!(tree.file_count(), 5);
        assert_eq!(tree.find_file("d").map(|f| f.name.as_str()), Some("d.pdf"));
        assert!(tree.find_file("zzz").is_none());

        let capped = tree.capped(3);
        assert_eq!(capped.file_count(), 3);
        assert!(capped.find_file("c").is_some());
        assert!(capped.find_file("d").is_none());
    }

    #[test]
    fn drive_tree_parses_tagged_json() {
        let raw = serde_json::json!({
            "kind": "folder",
            "name": "Catálogo",
            "files": [{"id": "1", "name": "tabela.pdf", "type": "document", "link": "https://x"}],
            "subfolders": [{"kind": "file", "id": "2", "name": "foto.jpg", "type": "image"}]
        });
        let tree: DriveNode = serde_json::from_value(raw).unwrap();
        assert_eq!(tree.file_count(), 2);
        assert_eq!(tree.find_file("2").map(|f| f.mime_type.as_str()), Some("image"));
    }
}
