use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::json;
use wa_agent::{
    credentials::PlainCredentials,
    drive::DriveClient,
    error::{DriveError, LlmError, StoreError, VendorError},
    llm::{self, LlmClient},
    store::TokenLedger,
    transcoder::Transcoder,
    types::{FollowupConfig, MessageKind, Tenant},
    whatsapp::{MediaUpload, OutboundMedia, WhatsAppClient},
};
use wiremock::{
    matchers::{body_partial_json, header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn tenant() -> Tenant {
    Tenant {
        id: 7,
        name: "Loja".to_string(),
        phone_number_id: "pn-7".to_string(),
        business_account_id: Some("waba-7".to_string()),
        credentials: "token-xyz".to_string(),
        default_persona_id: None,
        tokens: 5,
        agent_enabled: true,
        followup_enabled: false,
        followup: FollowupConfig::default(),
        tag_catalog: Vec::new(),
    }
}

fn whatsapp(server: &MockServer) -> WhatsAppClient {
    WhatsAppClient::new(
        reqwest::Client::new(),
        &server.uri(),
        "v24.0",
        Arc::new(PlainCredentials),
        Transcoder::new("/nonexistent/ffmpeg"),
    )
    .with_retry_backoff(Duration::ZERO)
}

#[derive(Default)]
struct CountingLedger {
    debits: AtomicU32,
    broken: bool,
}

#[async_trait]
impl TokenLedger for CountingLedger {
    async fn debit_token(&self, _tenant_id: i64) -> Result<(), StoreError> {
        self.debits.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

fn llm(server: &MockServer, keys: &[&str], ledger: Arc<CountingLedger>) -> LlmClient {
    LlmClient::new(
        llm::http_client().unwrap(),
        &server.uri(),
        "test-model",
        keys.iter().map(|key| key.to_string()).collect(),
        ledger,
    )
    .with_tries_per_key(2)
    .with_retry_delay(Duration::ZERO)
}

const GENERATE_PATH: &str = "/v1beta/models/test-model:generateContent";

fn model_reply(text: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "candidates": [{ "content": { "parts": [{ "text": text }] }, "finishReason": "STOP" }],
        "usageMetadata": { "totalTokenCount": 42 }
    }))
}

#[tokio::test]
async fn send_text_retries_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v24.0/pn-7/messages"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v24.0/pn-7/messages"))
        .and(header("authorization", "Bearer token-xyz"))
        .and(body_partial_json(json!({ "to": "551112345678", "type": "text" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "messages": [{ "id": "wamid.ok" }] })))
        .mount(&server)
        .await;

    let sent = whatsapp(&server)
        .send_text(&tenant(), "5511912345678", "Olá!")
        .await
        .unwrap();
    assert_eq!(sent.id, "wamid.ok");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn rejected_credentials_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("{\"error\":{\"code\":190}}"))
        .mount(&server)
        .await;

    let err = whatsapp(&server)
        .send_text(&tenant(), "551112345678", "oi")
        .await
        .unwrap_err();
    assert!(matches!(err, VendorError::Auth { status: 401, .. }));
    assert!(err.is_auth());
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn media_url_then_download() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v24.0/media-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": format!("{}/files/media-9", server.uri()),
            "mime_type": "audio/ogg; codecs=opus"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/media-9"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(vec![1u8, 2, 3], "audio/ogg"))
        .mount(&server)
        .await;

    let client = whatsapp(&server);
    let info = client.get_media_url(&tenant(), "media-9").await.unwrap();
    assert_eq!(info.mime_type, "audio/ogg; codecs=opus");
    let bytes = client.download_media(&tenant(), &info.url).await.unwrap();
    assert_eq!(bytes.as_ref(), &[1u8, 2, 3]);
}

#[tokio::test]
async fn html_download_is_a_media_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("<!DOCTYPE html><html><body>login</body></html>", "text/html"),
        )
        .mount(&server)
        .await;

    let err = whatsapp(&server)
        .download_media(&tenant(), &format!("{}/files/x", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, VendorError::Media(ref reason) if reason.contains("HTML")));
}

#[tokio::test]
async fn documents_are_uploaded_then_sent_by_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v24.0/pn-7/media"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "upload-1" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v24.0/pn-7/messages"))
        .and(body_partial_json(json!({
            "type": "document",
            "document": { "id": "upload-1", "filename": "catalogo.pdf" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "messages": [{ "id": "wamid.doc" }] })))
        .mount(&server)
        .await;

    let sent = whatsapp(&server)
        .send_media(
            &tenant(),
            "551112345678",
            MediaUpload {
                kind: OutboundMedia::Document,
                bytes: b"%PDF-1.4",
                filename: "catalogo.pdf",
                mime_type: "application/pdf",
                caption: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(sent.id, "wamid.doc");
    assert_eq!(sent.media_id, "upload-1");
}

#[tokio::test]
async fn templates_follow_paging() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v24.0/waba-7/message_templates"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "name": "boas_vindas", "status": "APPROVED", "language": "pt_BR", "components": [] }],
            "paging": { "next": format!("{}/page-2", server.uri()) }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "name": "retorno", "status": "PENDING", "language": "pt_BR" }]
        })))
        .mount(&server)
        .await;

    let templates = whatsapp(&server).list_templates(&tenant()).await.unwrap();
    let names = templates.iter().map(|t| t.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["boas_vindas", "retorno"]);
    assert_eq!(templates[1].components, json!([]));
}

#[tokio::test]
async fn templates_need_a_business_account() {
    let server = MockServer::start().await;
    let mut tenant = tenant();
    tenant.business_account_id = Some("  ".to_string());

    let err = whatsapp(&server).list_templates(&tenant).await.unwrap_err();
    assert!(matches!(err, VendorError::Config(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_key_rotates_and_debits_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(GENERATE_PATH))
        .and(query_param("key", "k1"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "code": 429, "status": "RESOURCE_EXHAUSTED", "message": "quota" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(GENERATE_PATH))
        .and(query_param("key", "k2"))
        .respond_with(model_reply("Um cachorro segurando uma placa."))
        .mount(&server)
        .await;

    let ledger = Arc::new(CountingLedger::default());
    let client = llm(&server, &["k1", "k2"], ledger.clone());
    let text = client
        .analyze_media(7, MessageKind::Image, b"jpeg", "image/jpeg")
        .await
        .unwrap();
    assert_eq!(text, "Um cachorro segurando uma placa.");
    assert_eq!(client.current_key_index(), 1);
    assert_eq!(ledger.debits.load(Ordering::SeqCst), 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn slow_model_reply_is_awaited() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(GENERATE_PATH))
        .respond_with(model_reply("Vídeo de um bolo sendo decorado.").set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let ledger = Arc::new(CountingLedger::default());
    let client = llm(&server, &["k1", "k2"], ledger.clone());
    let text = client
        .analyze_media(7, MessageKind::Video, b"mp4", "video/mp4")
        .await
        .unwrap();
    assert_eq!(text, "Vídeo de um bolo sendo decorado.");
    assert_eq!(client.current_key_index(), 0);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn every_key_exhausted_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let ledger = Arc::new(CountingLedger::default());
    let client = llm(&server, &["k1", "k2"], ledger.clone());
    let err = client
        .analyze_media(7, MessageKind::Audio, b"ogg", "audio/ogg")
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::AllKeysExhausted(_)));
    assert_eq!(client.current_key_index(), 0);
    assert_eq!(ledger.debits.load(Ordering::SeqCst), 0);
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

#[tokio::test]
async fn blocked_prompts_do_not_rotate() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "promptFeedback": { "blockReason": "SAFETY" }
        })))
        .mount(&server)
        .await;

    let ledger = Arc::new(CountingLedger::default());
    let client = llm(&server, &["k1", "k2"], ledger.clone());
    let err = client
        .generate_action(7, &json!({ "instrucao_geral": "x" }))
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Blocked(_)));
    assert_eq!(client.current_key_index(), 0);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn unparseable_replies_are_retried_then_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(model_reply("desculpe, não entendi"))
        .mount(&server)
        .await;

    let ledger = Arc::new(CountingLedger::default());
    let client = llm(&server, &["k1"], ledger.clone()).with_json_retries(3);
    let err = client
        .generate_followup(7, &json!({ "instrucao_geral": "x" }))
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Schema { attempts: 3, .. }));
    assert_eq!(ledger.debits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn failed_debit_keeps_the_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(model_reply(
            "```json\n{\"mensagem_para_enviar\": \"Oi!\", \"nova_situacao\": \"Atendente Chamado\"}\n```",
        ))
        .mount(&server)
        .await;

    let ledger = Arc::new(CountingLedger {
        debits: AtomicU32::new(0),
        broken: true,
    });
    let client = llm(&server, &["k1"], ledger.clone());
    let action = client
        .generate_action(7, &json!({ "instrucao_geral": "x" }))
        .await
        .unwrap();
    assert_eq!(action.message.as_deref(), Some("Oi!"));
    assert_eq!(ledger.debits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn drive_download_retries_then_gives_up() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/file-1"))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/file-1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"conteudo".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let drive = DriveClient::new(reqwest::Client::new(), &server.uri(), "drive-token")
        .with_retry_backoff(Duration::ZERO);
    let bytes = drive.download("file-1").await.unwrap();
    assert_eq!(bytes.as_ref(), b"conteudo");

    let err = drive.download("missing").await.unwrap_err();
    assert!(matches!(err, DriveError::Status { status: 404, .. }));
}
