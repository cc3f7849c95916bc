use chrono::{DateTime, Utc};
use minijinja::{context, Environment};
use serde_json::{json, Value};

use crate::types::{Message, MessageKind, Persona, Role, Tenant, Ticket, TicketStatus};

const AGENT_RULES_TEMPLATE: &str = include_str!("prompts/agent_rules.j2");
const MEDIA_ANALYSIS_TEMPLATE: &str = include_str!("prompts/media_analysis.j2");
const FOLLOWUP_TEMPLATE: &str = include_str!("prompts/followup.j2");

pub const HISTORY_LIMIT: usize = 60;
pub const DRIVE_FILE_LIMIT: usize = 500;

fn render(name: &str, source: &str, ctx: minijinja::Value) -> Option<String> {
    let mut env = Environment::new();
    env.add_template(name, source).ok()?;
    let template = env.get_template(name).ok()?;
    template
        .render(ctx)
        .ok()
        .map(|text| text.trim().to_string())
}

fn display_name<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback
    } else {
        trimmed
    }
}

pub fn render_agent_rules(tenant: &Tenant, persona: &Persona) -> String {
    let persona_name = display_name(&persona.name, "Assistente");
    let tenant_name = display_name(&tenant.name, "nossa empresa");
    render(
        "agent_rules",
        AGENT_RULES_TEMPLATE,
        context! {
            persona_name => persona_name,
            tenant_name => tenant_name,
            system_prompt => persona.system_prompt.trim(),
        },
    )
    .unwrap_or_else(|| {
        format!(
            "Você é {persona_name}, atendente virtual de {tenant_name} no WhatsApp.\n{}\n\
             Responda apenas com o objeto JSON descrito em \"formato_resposta_obrigatorio\".",
            persona.system_prompt.trim()
        )
    })
}

pub fn render_media_prompt(kind: MessageKind) -> String {
    let kind_name = match kind {
        MessageKind::Audio => "audio",
        MessageKind::Image => "image",
        MessageKind::Sticker => "sticker",
        MessageKind::Video => "video",
        _ => "document",
    };
    render(
        "media_analysis",
        MEDIA_ANALYSIS_TEMPLATE,
        context! { kind => kind_name },
    )
    .unwrap_or_else(|| "Descreva o conteúdo desta mídia de forma breve, em português.".to_string())
}

/// Label used in front of the model's analysis when the result is stored in
/// the timeline.
pub fn media_prefix(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Audio => "Transcrição do áudio",
        MessageKind::Image => "Análise da imagem",
        MessageKind::Sticker => "Análise da figurinha",
        MessageKind::Video => "Análise do vídeo",
        _ => "Análise do documento",
    }
}

fn agent_response_schema() -> Value {
    json!({
        "mensagem_para_enviar": "string | null. Texto a enviar ao contato; separe mensagens com uma linha em branco.",
        "nova_situacao": [
            TicketStatus::AwaitingResponse.as_str(),
            TicketStatus::HandlerCalled.as_str(),
            TicketStatus::Completed.as_str()
        ],
        "nome_contato": "string | null. Apenas se o nome ainda não for conhecido.",
        "observacoes": "string. Resumo curto do atendimento para a equipe.",
        "arquivos_anexos": [
            { "nome_exato": "string", "id_arquivo": "string", "tipo_midia": "image | video | document" }
        ],
        "tags_sugeridas": ["string"]
    })
}

fn followup_response_schema() -> Value {
    json!({
        "mensagem_para_enviar": "string | null"
    })
}

fn format_timestamp(seconds: i64) -> String {
    DateTime::<Utc>::from_timestamp(seconds, 0)
        .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| seconds.to_string())
}

/// Renders the most recent `limit` messages as one line each.
pub fn format_history(timeline: &[Message], limit: usize) -> String {
    let start = timeline.len().saturating_sub(limit);
    timeline
        .iter()
        .skip(start)
        .map(|message| {
            let speaker = match message.role {
                Role::User => "Cliente",
                Role::Assistant => "Atendente",
            };
            let mut line = format!(
                "[{}] {}: {}",
                format_timestamp(message.timestamp),
                speaker,
                message.content.trim()
            );
            if let Some(filename) = message.filename.as_deref().filter(|name| !name.is_empty()) {
                line.push_str(&format!(" (arquivo: {filename})"));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn conversation_state(ticket: &Ticket, now: DateTime<Utc>) -> Value {
    json!({
        "nome_contato": ticket.contact_name.as_deref().unwrap_or(""),
        "telefone": ticket.phone,
        "situacao_atual": ticket.status.as_str(),
        "observacoes_anteriores": ticket.summary,
        "tags_atuais": ticket.tags.iter().map(|tag| tag.name.as_str()).collect::<Vec<_>>(),
        "data_hora_atual": now.format("%Y-%m-%d %H:%M UTC").to_string(),
        "historico": format_history(&ticket.timeline, HISTORY_LIMIT),
    })
}

/// The structured prompt for one agent turn.
pub fn build_agent_prompt(
    tenant: &Tenant,
    persona: &Persona,
    ticket: &Ticket,
    now: DateTime<Utc>,
) -> Value {
    let files = persona
        .drive_tree
        .as_ref()
        .map(|tree| serde_json::to_value(tree.capped(DRIVE_FILE_LIMIT)).unwrap_or(Value::Null))
        .unwrap_or(Value::Null);
    let tag_catalog = tenant
        .tag_catalog
        .iter()
        .map(|tag| tag.name.as_str())
        .collect::<Vec<_>>();

    json!({
        "instrucao_geral": render_agent_rules(tenant, persona),
        "formato_resposta_obrigatorio": agent_response_schema(),
        "contexto_planilha": persona.sheet_context,
        "arquivos_disponiveis": files,
        "tags_conhecidas": tag_catalog,
        "dados_atuais_conversa": conversation_state(ticket, now),
    })
}

pub fn build_followup_prompt(
    tenant: &Tenant,
    persona: Option<&Persona>,
    ticket: &Ticket,
    hours: u32,
    now: DateTime<Utc>,
) -> Value {
    let persona_name = persona
        .map(|persona| display_name(&persona.name, "Assistente"))
        .unwrap_or("Assistente");
    let system_prompt = persona
        .map(|persona| persona.system_prompt.trim())
        .unwrap_or("");
    let tenant_name = display_name(&tenant.name, "nossa empresa");
    let rules = render(
        "followup",
        FOLLOWUP_TEMPLATE,
        context! {
            persona_name => persona_name,
            tenant_name => tenant_name,
            system_prompt => system_prompt,
            hours => hours,
        },
    )
    .unwrap_or_else(|| {
        format!(
            "O contato não responde há {hours} horas. Escreva uma mensagem curta retomando a conversa."
        )
    });

    json!({
        "instrucao_geral": rules,
        "formato_resposta_obrigatorio": followup_response_schema(),
        "contexto_planilha": persona.map(|persona| persona.sheet_context.clone()).unwrap_or(Value::Null),
        "dados_atuais_conversa": conversation_state(ticket, now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DriveFile, DriveNode};

    fn tenant() -> Tenant {
        Tenant {
            id: 3,
            name: "Padaria Central".to_string(),
            phone_number_id: "pn".to_string(),
            business_account_id: None,
            credentials: String::new(),
            default_persona_id: Some(1),
            tokens: 5,
            agent_enabled: true,
            followup_enabled: true,
            followup: Default::default(),
            tag_catalog: Vec::new(),
        }
    }

    fn persona() -> Persona {
        Persona {
            id: 1,
            name: "Bia".to_string(),
            system_prompt: "Venda pães.".to_string(),
            sheet_context: json!({"precos": {"pao": "1,00"}}),
            drive_tree: Some(DriveNode::Folder {
                name: "raiz".to_string(),
                files: vec![DriveFile {
                    id: "f1".to_string(),
                    name: "cardapio.pdf".to_string(),
                    mime_type: "application/pdf".to_string(),
                    link: String::new(),
                }],
                subfolders: Vec::new(),
            }),
        }
    }

    #[test]
    fn agent_prompt_has_required_sections() {
        let tenant = tenant();
        let mut ticket = Ticket::new(9, &tenant, "551112345678", Utc::now());
        ticket.timeline.push(Message::user("m1", "oi", 1_700_000_000));
        let prompt = build_agent_prompt(&tenant, &persona(), &ticket, Utc::now());

        for key in [
            "instrucao_geral",
            "formato_resposta_obrigatorio",
            "contexto_planilha",
            "arquivos_disponiveis",
            "dados_atuais_conversa",
        ] {
            assert!(prompt.get(key).is_some(), "missing {key}");
        }
        let rules = prompt["instrucao_geral"].as_str().unwrap();
        assert!(rules.contains("Bia"));
        assert!(rules.contains("Padaria Central"));
        assert!(rules.contains("Venda pães."));
        assert_eq!(prompt["arquivos_disponiveis"]["files"][0]["id"], "f1");
        assert!(prompt["dados_atuais_conversa"]["historico"]
            .as_str()
            .unwrap()
            .contains("Cliente: oi"));
    }

    #[test]
    fn history_keeps_only_the_tail() {
        let timeline = (0..5)
            .map(|i| Message::user(format!("m{i}"), format!("msg {i}"), 1_700_000_000 + i))
            .collect::<Vec<_>>();
        let history = format_history(&timeline, 2);
        assert_eq!(history.lines().count(), 2);
        assert!(history.contains("msg 4"));
        assert!(!history.contains("msg 2"));
    }

    #[test]
    fn media_prompt_depends_on_kind() {
        assert!(render_media_prompt(MessageKind::Audio).contains("Transcreva"));
        assert!(render_media_prompt(MessageKind::Document).contains("documento"));
        assert_eq!(media_prefix(MessageKind::Image), "Análise da imagem");
    }

    #[test]
    fn followup_prompt_mentions_interval() {
        let tenant = tenant();
        let ticket = Ticket::new(9, &tenant, "551112345678", Utc::now());
        let prompt = build_followup_prompt(&tenant, Some(&persona()), &ticket, 6, Utc::now());
        assert!(prompt["instrucao_geral"].as_str().unwrap().contains("6 horas"));
        assert!(prompt["formato_resposta_obrigatorio"]
            .get("mensagem_para_enviar")
            .is_some());
    }
}
