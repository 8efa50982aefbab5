use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clients::{AssistantClient, ChatwootClient, ClientError};
use crate::sanitize::sanitize;
use crate::types::{Escalation, EscalationContext, ReplyFailure, RunStatus, ESCALATION_APOLOGY};

const RUN_POLL_INTERVAL_SECS: u64 = 1;
const RUN_POLL_CEILING: u32 = 30;
const RETRY_BACKOFF_SECS: u64 = 2;

/// Hard ceiling on one webhook request's orchestration, retries included.
const ORCHESTRATION_TIMEOUT_SECS: u64 = 30;

const ESCALATION_MESSAGE_LIMIT: usize = 300;
const ESCALATION_HEADER: &str = "AI assistant escalation";

pub struct AppState {
    pub chatwoot: ChatwootClient,
    pub assistant: AssistantClient,
    pub orchestrator: Orchestrator,
    pub notifier: Notifier,
    pub webhook_secret: Option<String>,
    pub orchestration_timeout: Duration,
    pub thread_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AppState {
    pub fn orchestration_timeout_default() -> Duration {
        Duration::from_secs(ORCHESTRATION_TIMEOUT_SECS)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(webhook_event))
        .with_state(state)
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn webhook_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !verify_webhook_signature(state.webhook_secret.as_deref(), signature, &body) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "status": "error - invalid signature" })),
        )
            .into_response();
    }

    let payload = match serde_json::from_slice::<Value>(&body) {
        Ok(payload) => payload,
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": format!("error: {err}") })),
            )
                .into_response();
        }
    };

    let message_type = payload.get("message_type").and_then(Value::as_str);
    if message_type != Some("incoming") {
        return (
            StatusCode::OK,
            Json(json!({ "status": "skipped - not incoming" })),
        )
            .into_response();
    }

    let conversation_id = payload
        .get("conversation")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64);
    let sender_id = payload
        .get("sender")
        .and_then(|s| s.get("id"))
        .and_then(Value::as_i64);
    let (Some(conversation_id), Some(sender_id)) = (conversation_id, sender_id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error - missing conv_id or contact_id" })),
        )
            .into_response();
    };

    let content = payload
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let sender_name = payload
        .get("sender")
        .and_then(|s| s.get("name"))
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    let sender_email = payload
        .get("sender")
        .and_then(|s| s.get("email"))
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let event_id = Uuid::new_v4();
    tracing::info!(
        event_id = %event_id,
        conversation_id,
        sender_id,
        "incoming customer message accepted"
    );

    match handle_incoming(
        &state,
        event_id,
        conversation_id,
        sender_id,
        &content,
        sender_name,
        sender_email,
    )
    .await
    {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "success" }))).into_response(),
        Err(err) => {
            tracing::error!(event_id = %event_id, conversation_id, error = %err, "webhook processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": format!("error: {err}") })),
            )
                .into_response()
        }
    }
}

async fn handle_incoming(
    state: &AppState,
    event_id: Uuid,
    conversation_id: i64,
    sender_id: i64,
    content: &str,
    sender_name: Option<String>,
    sender_email: Option<String>,
) -> Result<(), ClientError> {
    let thread_id = resolve_thread(state, conversation_id, sender_id).await?;

    // Contact lookup only enriches the escalation card; the reply path does
    // not depend on it.
    let contact = state.chatwoot.get_contact(sender_id).await.ok();
    let context = EscalationContext {
        conversation_id,
        conversation_url: state.chatwoot.conversation_url(conversation_id),
        customer: customer_label(contact.as_ref(), sender_name, sender_email),
        customer_message: content.to_string(),
    };

    if let Err(err) = state.chatwoot.toggle_typing(conversation_id, true).await {
        tracing::debug!(conversation_id, error = %err, "typing-on toggle failed");
    }

    let outcome = tokio::time::timeout(
        state.orchestration_timeout,
        state.orchestrator.resolve_reply(&thread_id, content, &context),
    )
    .await;

    if let Err(err) = state.chatwoot.toggle_typing(conversation_id, false).await {
        tracing::debug!(conversation_id, error = %err, "typing-off toggle failed");
    }

    match outcome {
        Ok(Ok(reply)) => {
            state.chatwoot.send_message(conversation_id, &reply).await?;
            tracing::info!(event_id = %event_id, conversation_id, "assistant reply delivered");
        }
        Ok(Err(failure)) => {
            tracing::warn!(
                event_id = %event_id,
                conversation_id,
                reason = %failure.reason(),
                "assistant reply exhausted retries"
            );
            state
                .chatwoot
                .send_message(conversation_id, ESCALATION_APOLOGY)
                .await?;
            state.notifier.notify(&context.with_failure(&failure)).await;
        }
        Err(_elapsed) => {
            tracing::warn!(event_id = %event_id, conversation_id, "orchestration hit the request ceiling");
            state
                .chatwoot
                .send_message(conversation_id, ESCALATION_APOLOGY)
                .await?;
            state
                .notifier
                .notify(&context.with_reason("timeout", Some("request ceiling exceeded".into())))
                .await;
        }
    }
    Ok(())
}

fn thread_attribute_key(sender_id: i64) -> String {
    format!("assistant_thread_{sender_id}")
}

/// Returns the stored thread id for this (conversation, contact) pair, or
/// creates one and persists it. Serialized per pair so two near-simultaneous
/// first messages cannot each create a thread and silently drop one.
async fn resolve_thread(
    state: &AppState,
    conversation_id: i64,
    sender_id: i64,
) -> Result<String, ClientError> {
    let key = format!("{conversation_id}:{sender_id}");
    let lock = {
        let mut locks = state.thread_locks.lock().await;
        locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    };
    let _guard = lock.lock().await;

    let attribute_key = thread_attribute_key(sender_id);
    let conversation = state.chatwoot.get_conversation(conversation_id).await?;
    if let Some(existing) = conversation
        .get("custom_attributes")
        .and_then(|attrs| attrs.get(&attribute_key))
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
    {
        return Ok(existing.to_string());
    }

    let thread_id = state.assistant.create_thread().await?;
    let mut attributes = serde_json::Map::new();
    attributes.insert(attribute_key, Value::String(thread_id.clone()));
    state
        .chatwoot
        .update_conversation_attributes(conversation_id, Value::Object(attributes))
        .await?;
    tracing::info!(conversation_id, sender_id, %thread_id, "created assistant thread");
    Ok(thread_id)
}

fn customer_label(
    contact: Option<&Value>,
    fallback_name: Option<String>,
    fallback_email: Option<String>,
) -> Option<String> {
    let field = |key: &str| {
        contact
            .and_then(|c| c.get(key))
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let name = field("name").or(fallback_name);
    let email = field("email").or(fallback_email);
    match (name, email) {
        (Some(name), Some(email)) => Some(format!("{name} <{email}>")),
        (Some(name), None) => Some(name),
        (None, Some(email)) => Some(email),
        (None, None) => None,
    }
}

/// Shared-secret check of the raw webhook body. An unset secret disables the
/// check; a configured secret requires a matching `sha256=<hex>` header.
fn verify_webhook_signature(
    secret: Option<&str>,
    signature_header: Option<&str>,
    body: &[u8],
) -> bool {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return true;
    };
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature).trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Drives one inbound message through the AI service: submit the turn, poll
/// the run, extract and sanitize the reply, retrying the whole cycle a
/// bounded number of times.
#[derive(Clone)]
pub struct Orchestrator {
    assistant: AssistantClient,
    notifier: Notifier,
    max_retries: u32,
    poll_interval: Duration,
    poll_ceiling: u32,
    retry_backoff: Duration,
}

impl Orchestrator {
    pub fn new(assistant: AssistantClient, notifier: Notifier, max_retries: u32) -> Self {
        Self {
            assistant,
            notifier,
            max_retries,
            poll_interval: Duration::from_secs(RUN_POLL_INTERVAL_SECS),
            poll_ceiling: RUN_POLL_CEILING,
            retry_backoff: Duration::from_secs(RETRY_BACKOFF_SECS),
        }
    }

    /// Overrides the polling and backoff cadence (for tests).
    pub fn with_timings(
        mut self,
        poll_interval: Duration,
        poll_ceiling: u32,
        retry_backoff: Duration,
    ) -> Self {
        self.poll_interval = poll_interval;
        self.poll_ceiling = poll_ceiling;
        self.retry_backoff = retry_backoff;
        self
    }

    /// Bounded-retry wrapper: up to `1 + max_retries` attempts with a fixed
    /// backoff between them, returning the last failure on exhaustion.
    pub async fn resolve_reply(
        &self,
        thread_id: &str,
        message: &str,
        context: &EscalationContext,
    ) -> Result<String, ReplyFailure> {
        let mut attempt = 0u32;
        loop {
            match self.attempt_reply(thread_id, message, context, attempt).await {
                Ok(reply) => return Ok(reply),
                Err(failure) => {
                    if attempt >= self.max_retries {
                        return Err(failure);
                    }
                    tracing::warn!(
                        thread_id,
                        attempt,
                        reason = %failure.reason(),
                        "assistant attempt failed, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt_reply(
        &self,
        thread_id: &str,
        message: &str,
        context: &EscalationContext,
        attempt: u32,
    ) -> Result<String, ReplyFailure> {
        let outcome = self.run_once(thread_id, message).await;
        if let Err(failure) = &outcome {
            // One escalation per inbound event, from the first attempt only;
            // retries stay quiet to avoid flooding the channel.
            if attempt == 0 {
                self.notifier.notify(&context.with_failure(failure)).await;
            }
        }
        outcome
    }

    async fn run_once(&self, thread_id: &str, message: &str) -> Result<String, ReplyFailure> {
        let upstream = |err: ClientError| ReplyFailure::Upstream(err.to_string());

        self.assistant
            .create_message(thread_id, message)
            .await
            .map_err(upstream)?;
        let run_id = self.assistant.create_run(thread_id).await.map_err(upstream)?;

        for _ in 0..self.poll_ceiling {
            let status = self
                .assistant
                .run_status(thread_id, &run_id)
                .await
                .map_err(upstream)?;
            match status {
                RunStatus::Completed => return self.extract_reply(thread_id).await,
                status if status.is_terminal_failure() => {
                    return Err(ReplyFailure::RunEnded { status, run_id });
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
        Err(ReplyFailure::RunTimedOut)
    }

    /// Pulls the most recent assistant-authored message off the thread and
    /// returns its sanitized text.
    async fn extract_reply(&self, thread_id: &str) -> Result<String, ReplyFailure> {
        let listing = self
            .assistant
            .list_messages(thread_id)
            .await
            .map_err(|err| ReplyFailure::Upstream(err.to_string()))?;

        let entries = listing
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in &entries {
            if entry.get("role").and_then(Value::as_str) != Some("assistant") {
                continue;
            }
            let segments = entry
                .get("content")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let text = segments
                .iter()
                .filter(|segment| segment.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|segment| {
                    segment
                        .get("text")
                        .and_then(|t| t.get("value"))
                        .and_then(Value::as_str)
                })
                .collect::<Vec<_>>()
                .join("\n");
            return Ok(sanitize(&text));
        }
        Err(ReplyFailure::ReplyNotFound)
    }
}

/// Best-effort push of failure summaries to the team notification channel.
/// Never propagates: a lost escalation must not cost the customer a reply.
#[derive(Clone)]
pub struct Notifier {
    http: reqwest::Client,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(http: reqwest::Client, webhook_url: Option<String>) -> Self {
        Self { http, webhook_url }
    }

    pub async fn notify(&self, escalation: &Escalation) -> bool {
        let Some(url) = self.webhook_url.as_deref() else {
            tracing::debug!("escalation channel not configured, skipping notification");
            return false;
        };

        let card = escalation_card(escalation);
        match self.http.post(url).json(&card).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(
                    conversation_id = escalation.conversation_id,
                    reason = %escalation.reason,
                    "escalation notification delivered"
                );
                true
            }
            Ok(response) => {
                tracing::warn!(
                    conversation_id = escalation.conversation_id,
                    status = response.status().as_u16(),
                    "escalation notification rejected"
                );
                false
            }
            Err(err) => {
                tracing::warn!(
                    conversation_id = escalation.conversation_id,
                    error = %err,
                    "escalation notification failed"
                );
                false
            }
        }
    }
}

fn escalation_card(escalation: &Escalation) -> Value {
    let customer = escalation.customer.as_deref().unwrap_or("unknown");
    let mut widgets = vec![
        json!({ "keyValue": { "topLabel": "Customer", "content": customer } }),
        json!({ "keyValue": { "topLabel": "Reason", "content": escalation.reason } }),
        json!({ "keyValue": { "topLabel": "Time", "content": now_iso() } }),
        json!({ "textParagraph": {
            "text": truncate_for_card(&escalation.customer_message, ESCALATION_MESSAGE_LIMIT),
        } }),
    ];
    if let Some(detail) = &escalation.detail {
        widgets.push(json!({ "keyValue": { "topLabel": "Detail", "content": detail } }));
    }
    widgets.push(json!({ "buttons": [{ "textButton": {
        "text": "OPEN CONVERSATION",
        "onClick": { "openLink": { "url": escalation.conversation_url } },
    } }] }));

    json!({
        "cards": [{
            "header": {
                "title": ESCALATION_HEADER,
                "subtitle": format!("conversation #{}", escalation.conversation_id),
            },
            "sections": [{ "widgets": widgets }],
        }]
    })
}

fn truncate_for_card(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(limit).collect();
    truncated.push('…');
    truncated
}
