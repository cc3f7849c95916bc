//! HTTP receiver for WhatsApp webhooks. Forwards accepted `value` objects to
//! the work queue and does nothing else on the request path.

use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

use crate::queue::WorkQueue;

#[derive(Clone)]
pub struct ReceiverState {
    pub queue: Arc<dyn WorkQueue>,
    pub verify_token: String,
    pub app_secret: String,
}

/// Checks `X-Hub-Signature-256` against the app secret. Without a configured
/// secret every request passes.
pub fn verify_signature(app_secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if app_secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Returns the `value` objects that carry messages or statuses, or `None`
/// when the payload is not a WhatsApp Business Account notification.
pub fn forwardable_values(payload: &Value) -> Option<Vec<Value>> {
    if payload.get("object").and_then(Value::as_str) != Some("whatsapp_business_account") {
        return None;
    }
    let entries = payload.get("entry").and_then(Value::as_array)?;
    let mut values = Vec::new();
    for entry in entries {
        let changes = entry.get("changes").and_then(Value::as_array)?;
        for change in changes {
            let Some(value) = change.get("value").filter(|value| value.is_object()) else {
                continue;
            };
            let has_work = ["messages", "statuses"].iter().any(|key| {
                value
                    .get(*key)
                    .and_then(Value::as_array)
                    .map(|items| !items.is_empty())
                    .unwrap_or(false)
            });
            if has_work {
                values.push(value.clone());
            }
        }
    }
    Some(values)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": chrono::Utc::now().to_rfc3339() }))
}

async fn webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<ReceiverState>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").cloned().unwrap_or_default();
    let verify_token = params.get("hub.verify_token").cloned().unwrap_or_default();
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    if mode == "subscribe" && !state.verify_token.is_empty() && verify_token == state.verify_token {
        info!("webhook verification accepted");
        return (StatusCode::OK, challenge).into_response();
    }
    warn!(mode = %mode, "webhook verification rejected");
    (StatusCode::FORBIDDEN, "Forbidden").into_response()
}

async fn webhook_event(
    State(state): State<Arc<ReceiverState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !verify_signature(&state.app_secret, signature_header, &body) {
        warn!("webhook signature mismatch");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid webhook signature" })),
        )
            .into_response();
    }

    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "body is not valid JSON" })),
        )
            .into_response();
    };
    let Some(values) = forwardable_values(&payload) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "unexpected webhook payload" })),
        )
            .into_response();
    };

    for value in &values {
        match state.queue.enqueue(value).await {
            Ok(queue_id) => debug!(queue_id, "webhook value enqueued"),
            Err(err) => {
                error!(error = %err, "failed to enqueue webhook value");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "enqueue failed" })),
                )
                    .into_response();
            }
        }
    }
    (StatusCode::OK, "EVENT_RECEIVED").into_response()
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let allowed = origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect::<Vec<_>>();
    if allowed.is_empty() {
        return None;
    }
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any),
    )
}

pub fn router(state: ReceiverState, frontend_origins: &[String]) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/webhook", get(webhook_verify).post(webhook_event))
        .layer(TraceLayer::new_for_http());
    if let Some(cors) = cors_layer(frontend_origins) {
        app = app.layer(cors);
    }
    app.with_state(Arc::new(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryQueue;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    fn app(queue: Arc<MemoryQueue>, app_secret: &str) -> Router {
        router(
            ReceiverState {
                queue,
                verify_token: "segredo".to_string(),
                app_secret: app_secret.to_string(),
            },
            &[],
        )
    }

    fn sample_payload() -> Value {
        json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "waba",
                "changes": [
                    { "field": "messages", "value": {
                        "metadata": { "phone_number_id": "pn-1" },
                        "messages": [{ "id": "wamid.1", "from": "5511912345678", "timestamp": "1700000000", "type": "text", "text": { "body": "oi" } }]
                    }},
                    { "field": "messages", "value": { "metadata": { "phone_number_id": "pn-1" } } }
                ]
            }]
        })
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn verify_echoes_challenge() {
        let response = app(Arc::new(MemoryQueue::new()), "")
            .oneshot(
                Request::get("/webhook?hub.mode=subscribe&hub.verify_token=segredo&hub.challenge=123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "123");
    }

    #[tokio::test]
    async fn verify_rejects_wrong_token() {
        let response = app(Arc::new(MemoryQueue::new()), "")
            .oneshot(
                Request::get("/webhook?hub.mode=subscribe&hub.verify_token=errado&hub.challenge=123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn post_enqueues_only_values_with_work() {
        let queue = Arc::new(MemoryQueue::new());
        let response = app(queue.clone(), "")
            .oneshot(
                Request::post("/webhook")
                    .header("content-type", "application/json")
                    .body(Body::from(sample_payload().to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "EVENT_RECEIVED");
        let payloads = queue.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["messages"][0]["id"], "wamid.1");
    }

    #[tokio::test]
    async fn post_rejects_foreign_objects() {
        let response = app(Arc::new(MemoryQueue::new()), "")
            .oneshot(
                Request::post("/webhook")
                    .body(Body::from(json!({ "object": "page", "entry": [] }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn enqueue_failure_is_500() {
        let response = app(Arc::new(MemoryQueue::failing()), "")
            .oneshot(
                Request::post("/webhook")
                    .body(Body::from(sample_payload().to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn signature_is_checked_when_secret_is_set() {
        let body = sample_payload().to_string();
        let mut mac = Hmac::<Sha256>::new_from_slice(b"app-secret").unwrap();
        mac.update(body.as_bytes());
        let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        let queue = Arc::new(MemoryQueue::new());
        let ok = app(queue.clone(), "app-secret")
            .oneshot(
                Request::post("/webhook")
                    .header("x-hub-signature-256", signature)
                    .body(Body::from(body.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let rejected = app(queue, "app-secret")
            .oneshot(
                Request::post("/webhook")
                    .header("x-hub-signature-256", "sha256=00")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_is_ok() {
        let response = app(Arc::new(MemoryQueue::new()), "")
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
