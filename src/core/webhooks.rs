//! Webhook ingress: verify, deduplicate by external id, persist an audit
//! record, enqueue the substantive work, and ack fast. The enqueued
//! follow-up runs on the worker pool with the same retry and lease
//! machinery as any other task.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::core::agents::runner::sanitize_consult_tags;
use crate::core::orchestrator::Orchestrator;
use crate::core::orchestrator::types::{Job, JobKind, Task};
use crate::core::queue::Queue;
use crate::core::signal::now_epoch;
use crate::core::signing::verify_webhook;
use crate::core::store::{Store, WebhookAuditEntry};
use crate::error::{EngineError, Result};

pub const MAX_PAYLOAD_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEndpoint {
    Mail,
    Scrape,
    Booking,
    Alert,
}

impl WebhookEndpoint {
    pub fn from_path(segment: &str) -> Option<Self> {
        match segment {
            "mail" => Some(WebhookEndpoint::Mail),
            "scrape" => Some(WebhookEndpoint::Scrape),
            "booking" => Some(WebhookEndpoint::Booking),
            "alert" => Some(WebhookEndpoint::Alert),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WebhookEndpoint::Mail => "mail",
            WebhookEndpoint::Scrape => "scrape",
            WebhookEndpoint::Booking => "booking",
            WebhookEndpoint::Alert => "alert",
        }
    }

    fn task_label(self) -> String {
        format!("webhook_{}", self.as_str())
    }
}

#[derive(Debug, PartialEq)]
pub enum IngestOutcome {
    Accepted { task_id: String },
    Duplicate,
}

pub struct WebhookIngress {
    store: Arc<dyn Store>,
    queue: Arc<dyn Queue>,
    secret: String,
}

impl WebhookIngress {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn Queue>, secret: &str) -> Self {
        Self {
            store,
            queue,
            secret: secret.to_string(),
        }
    }

    /// The ingress contract, in order: signature, external id, size, dedup,
    /// audit, enqueue. Bounded by the HTTP layer's ack deadline.
    pub async fn ingest(
        &self,
        endpoint: WebhookEndpoint,
        signature: Option<&str>,
        headers: Value,
        body: &[u8],
    ) -> Result<IngestOutcome> {
        let signature_valid = verify_webhook(body, signature, &self.secret);
        if !signature_valid {
            warn!(endpoint = endpoint.as_str(), "webhook signature rejected");
            return Err(EngineError::Unauthorized("invalid webhook signature".into()));
        }

        let payload: Value = serde_json::from_slice(body)
            .map_err(|_| EngineError::BadRequest("body is not valid JSON".into()))?;
        let external_id = payload
            .get("external_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EngineError::BadRequest("external_id is required".into()))?
            .to_string();

        if body.len() > MAX_PAYLOAD_BYTES {
            return Err(EngineError::PayloadTooLarge(body.len()));
        }

        if self
            .store
            .lookup_audit_entry(endpoint.as_str(), &external_id)
            .await?
            .is_some()
        {
            info!(
                endpoint = endpoint.as_str(),
                external_id, "duplicate webhook delivery"
            );
            return Ok(IngestOutcome::Duplicate);
        }

        let entry = WebhookAuditEntry {
            endpoint: endpoint.as_str().to_string(),
            external_id: external_id.clone(),
            signature_valid,
            headers,
            received_at: now_epoch(),
        };
        if self.store.insert_audit_entry(&entry).await.is_err() {
            // Unique key on (endpoint, external_id): a concurrent delivery
            // won the insert.
            return Ok(IngestOutcome::Duplicate);
        }

        let requester = payload
            .get("requester_id")
            .and_then(|v| v.as_str())
            .unwrap_or("system")
            .to_string();
        let task = Task::new(&requester, &endpoint.task_label(), payload.clone());
        self.store.insert_task(&task).await?;
        self.queue
            .enqueue(Job::new(
                JobKind::WebhookFollowUp,
                &task.id,
                json!({
                    "endpoint": endpoint.as_str(),
                    "external_id": external_id,
                    "body": payload,
                }),
            ))
            .await?;

        info!(
            endpoint = endpoint.as_str(),
            external_id,
            task = %task.id,
            "webhook accepted"
        );
        Ok(IngestOutcome::Accepted { task_id: task.id })
    }
}

/// Worker-side substantive handling for an accepted webhook. Returns the
/// text stored as the follow-up task's output.
pub async fn handle_follow_up(
    store: &Arc<dyn Store>,
    orchestrator: &Orchestrator,
    payload: &Value,
) -> Result<String> {
    let endpoint = payload
        .get("endpoint")
        .and_then(|v| v.as_str())
        .and_then(WebhookEndpoint::from_path)
        .ok_or_else(|| EngineError::BadRequest("job names no webhook endpoint".into()))?;
    let body = payload.get("body").cloned().unwrap_or(Value::Null);
    let requester = body
        .get("requester_id")
        .and_then(|v| v.as_str())
        .unwrap_or("system")
        .to_string();

    match endpoint {
        WebhookEndpoint::Mail => handle_mail(store, orchestrator, &requester, &body).await,
        WebhookEndpoint::Scrape => handle_scrape(store, orchestrator, &requester, &body).await,
        WebhookEndpoint::Booking => handle_booking(store, orchestrator, &requester, &body).await,
        WebhookEndpoint::Alert => handle_alert(store, orchestrator, &requester, &body).await,
    }
}

async fn handle_mail(
    store: &Arc<dyn Store>,
    orchestrator: &Orchestrator,
    requester: &str,
    body: &Value,
) -> Result<String> {
    let event_type = body.get("event_type").and_then(|v| v.as_str()).unwrap_or("");
    let from = body.get("from").and_then(|v| v.as_str()).unwrap_or("");
    let subject = body.get("subject").and_then(|v| v.as_str()).unwrap_or("");

    let mut actions = Vec::new();
    if !from.is_empty() {
        store
            .insert_domain_entity(
                "lead",
                requester,
                &json!({ "email": from, "first_contact_subject": subject }),
            )
            .await?;
        actions.push("lead recorded".to_string());
    }

    if matches!(event_type, "received" | "replied") {
        let mail_text = sanitize_consult_tags(
            body.get("body").and_then(|v| v.as_str()).unwrap_or(""),
        );
        let reply_task = orchestrator
            .submit(
                requester,
                "outbound_mail",
                json!({
                    "prompt": format!(
                        "An email arrived from {from} with subject {subject:?}. Draft a \
                         short, personal reply.\n\nEmail body:\n{mail_text}"
                    ),
                }),
                None,
                None,
            )
            .await?;
        actions.push(format!("reply task {} queued", reply_task.id));
    }

    Ok(format!("mail event {event_type}: {}", actions.join(", ")))
}

async fn handle_scrape(
    store: &Arc<dyn Store>,
    orchestrator: &Orchestrator,
    requester: &str,
    body: &Value,
) -> Result<String> {
    let url = body.get("url").and_then(|v| v.as_str()).unwrap_or("");
    let content = body.get("content").and_then(|v| v.as_str()).unwrap_or("");
    let event_type = body.get("event_type").and_then(|v| v.as_str()).unwrap_or("");

    store
        .insert_domain_entity(
            "scrape",
            requester,
            &json!({
                "url": url,
                "status": if event_type == "failed" { "failed" } else { "completed" },
                "content_bytes": content.len(),
            }),
        )
        .await?;

    if !content.is_empty() {
        let digest_task = orchestrator
            .submit(
                requester,
                "leadgen",
                json!({
                    "prompt": format!(
                        "A scrape of {url} finished. Extract qualified leads and contact \
                         details from the content below.\n\n{}",
                        sanitize_consult_tags(content)
                    ),
                }),
                None,
                None,
            )
            .await?;
        return Ok(format!(
            "scrape stored, digest task {} queued",
            digest_task.id
        ));
    }
    Ok(format!("scrape {event_type} recorded for {url}"))
}

async fn handle_booking(
    store: &Arc<dyn Store>,
    orchestrator: &Orchestrator,
    requester: &str,
    body: &Value,
) -> Result<String> {
    let name = body.get("name").and_then(|v| v.as_str()).unwrap_or("unknown");
    let email = body.get("email").and_then(|v| v.as_str()).unwrap_or("");
    let scheduled_at = body
        .get("scheduled_at")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    store
        .insert_domain_entity(
            "calendar_event",
            requester,
            &json!({ "name": name, "email": email, "scheduled_at": scheduled_at }),
        )
        .await?;

    let prep_task = orchestrator
        .submit(
            requester,
            "call_prep",
            json!({
                "prompt": format!(
                    "A call with {name} ({email}) was booked for {scheduled_at}. Prepare a \
                     call script and a short brief."
                ),
            }),
            None,
            None,
        )
        .await?;
    Ok(format!(
        "booking recorded, call-prep task {} queued",
        prep_task.id
    ))
}

async fn handle_alert(
    store: &Arc<dyn Store>,
    orchestrator: &Orchestrator,
    requester: &str,
    body: &Value,
) -> Result<String> {
    let severity = body.get("severity").and_then(|v| v.as_str()).unwrap_or("info");
    let service = body.get("service").and_then(|v| v.as_str()).unwrap_or("unknown");
    let message = body.get("message").and_then(|v| v.as_str()).unwrap_or("");

    store
        .insert_domain_entity(
            "alert",
            requester,
            &json!({ "severity": severity, "service": service, "message": message, "open": true }),
        )
        .await?;

    let triage_task = orchestrator
        .submit(
            requester,
            "engineer",
            json!({
                "prompt": format!(
                    "A {severity} alert fired for {service}: {}. Triage the likely cause \
                     and propose next steps.",
                    sanitize_consult_tags(message)
                ),
            }),
            None,
            None,
        )
        .await?;
    Ok(format!(
        "alert recorded, triage task {} queued",
        triage_task.id
    ))
}
