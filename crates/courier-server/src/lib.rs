use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use courier_config::Config;
use courier_contracts::{
    ActorType, AgentRegistration, AgentStatus, EventEnvelope, PublishRequest, RegisterRequest,
};
use courier_kernel::{
    action_name, classify, policy_action, warn_suffixed, LoopPolicy, PolicyAction, TRACE_WINDOW_MS,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

mod admin;
mod audit;
mod delivery;
mod store;

use audit::AuditDb;
use delivery::DeliveryEngine;
use store::MemoryStore;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server.port));
    let app = build_app(cfg)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    tracing::info!("courier listening on http://{addr}");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(cfg)?;
    Ok(Router::new()
        .route("/health", get(health))
        .route("/agents/register", post(register))
        .route("/mcp/events/publish", post(publish))
        .route("/mcp/sessions/{session_key}/events", get(session_events))
        .route("/admin/login", post(admin::login))
        .route("/admin/logout", post(admin::logout))
        .route("/admin/session", get(admin::session))
        .route("/admin/agents/pending", get(admin::agents_pending))
        .route("/admin/agents/approved", get(admin::agents_approved))
        .route("/admin/agents/approve", post(admin::agents_approve))
        .route("/admin/agents/reject", post(admin::agents_reject))
        .route("/admin/api/metrics", get(admin::api_metrics))
        .route("/admin/api/sessions", get(admin::api_sessions))
        .route("/admin/api/loops", get(admin::api_loops))
        .route("/admin/api/deliveries", get(admin::api_deliveries))
        .with_state(state))
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) cfg: Config,
    pub(crate) store: Arc<Mutex<MemoryStore>>,
    pub(crate) audit: Arc<AuditDb>,
    pub(crate) delivery: Arc<DeliveryEngine>,
    pub(crate) admin_tokens: Arc<Mutex<HashSet<String>>>,
}

impl AppState {
    fn new(cfg: Config) -> Result<Self, String> {
        let audit = Arc::new(AuditDb::open(&cfg.audit.sqlite_path).map_err(|e| e.to_string())?);
        let delivery = Arc::new(DeliveryEngine::new(
            cfg.delivery.max_retries,
            cfg.delivery.base_delay_ms,
            cfg.delivery.timeout_ms,
            audit.clone(),
        )?);
        Ok(Self {
            store: Arc::new(Mutex::new(MemoryStore::default())),
            admin_tokens: Arc::new(Mutex::new(HashSet::new())),
            audit,
            delivery,
            cfg,
        })
    }

    async fn process_publish(&self, request: PublishRequest) -> (StatusCode, Json<Value>) {
        let now_ms = Utc::now().timestamp_millis();
        let evt = match normalize_publish(request, now_ms) {
            Ok(evt) => evt,
            Err(problems) => {
                return (
                    StatusCode::BAD_REQUEST,
                    error_body("invalid_envelope", &problems.join("; ")),
                );
            }
        };

        if evt.origin_actor_type == ActorType::Agent {
            let store = self.store.lock().await;
            if !store.can_access(&evt.origin_actor_id, &evt.session_key) {
                return (
                    StatusCode::FORBIDDEN,
                    Json(json!({
                        "accepted": false,
                        "reason": "agent not approved for this session",
                    })),
                );
            }
        }

        if let Some(emitted_event_id) = &evt.emitted_event_id {
            let mut store = self.store.lock().await;
            if !store.note_emitted(emitted_event_id) {
                return (
                    StatusCode::OK,
                    Json(json!({
                        "accepted": false,
                        "reason": "self-echo duplicate emittedEventId blocked",
                    })),
                );
            }
        }

        let recent = {
            let store = self.store.lock().await;
            store.recent_by_trace(&evt.trace_id, TRACE_WINDOW_MS, now_ms)
        };
        let policy = LoopPolicy {
            max_per_minute: self.cfg.loop_guard.max_per_minute,
            default_delay_ms: self.cfg.loop_guard.delay_default_ms,
            burst_delay_ms: self.cfg.loop_guard.burst_delay_ms(),
        };
        let (delay_ms, decision) = classify(&evt.text, &recent, &policy);
        let action = policy_action(&decision);
        if let Err(err) = self
            .audit
            .record_decision(&evt, &decision, action_name(action), delay_ms)
        {
            tracing::warn!(event_id = %evt.event_id, "failed to audit loop decision: {err}");
        }

        if action == PolicyAction::Stop {
            return (
                StatusCode::OK,
                Json(json!({
                    "accepted": false,
                    "stopped": true,
                    "decision": &decision,
                })),
            );
        }

        let mut outbound = evt.clone();
        if action == PolicyAction::Warn {
            outbound.text = warn_suffixed(&evt.text, decision.confidence);
        }

        if delay_ms > 0 {
            let state = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                state.run_accepted(outbound).await;
            });
        } else {
            self.run_accepted(outbound).await;
        }

        (
            StatusCode::OK,
            Json(json!({
                "accepted": true,
                "eventId": evt.event_id,
                "delayed": delay_ms > 0,
                "delayMs": delay_ms,
                "decision": &decision,
            })),
        )
    }

    /// The deferred half of a publish: append, audit, fan out. Runs inline
    /// for undelayed events and on a timer for delayed ones; a duplicate
    /// eventId stops it silently.
    async fn run_accepted(&self, evt: EventEnvelope) {
        let recipients = {
            let mut store = self.store.lock().await;
            if !store.append(evt.clone()) {
                return;
            }
            store.recipients_for(&evt.session_key)
        };
        if let Err(err) = self.audit.record_event(&evt) {
            tracing::warn!(event_id = %evt.event_id, "failed to audit event record: {err}");
        }
        for recipient in recipients {
            if evt.origin_actor_type == ActorType::Agent
                && evt.origin_actor_id == recipient.agent_id
            {
                continue;
            }
            self.delivery.dispatch(&evt, &recipient);
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let store = state.store.lock().await;
    Json(json!({
        "status": "ok",
        "sessions": store.session_count(),
        "approvedAgents": store.status_count(AgentStatus::Approved),
        "pendingAgents": store.status_count(AgentStatus::Pending),
    }))
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let request: RegisterRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                error_body("invalid_registration", &format!("malformed body: {err}")),
            );
        }
    };

    let mut problems = Vec::new();
    let agent_id = match request.agent_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            problems.push("agentId must be a non-empty string".to_string());
            String::new()
        }
    };
    let callback_url = match request.callback_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => url.to_string(),
        _ => {
            problems.push("callbackUrl must be a non-empty string".to_string());
            String::new()
        }
    };
    if let Some(secret) = &request.callback_secret {
        if secret.len() < 8 {
            problems.push("callbackSecret must be at least 8 characters".to_string());
        }
    }
    if !problems.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            error_body("invalid_registration", &problems.join("; ")),
        );
    }

    let registration = AgentRegistration {
        agent_id: agent_id.clone(),
        display_name: request.display_name,
        callback_url,
        callback_secret: request.callback_secret,
        requested_session_keys: request.requested_session_keys,
        registered_at: Utc::now().timestamp_millis(),
        status: AgentStatus::Pending,
    };
    state.store.lock().await.register(registration);
    (
        StatusCode::ACCEPTED,
        Json(json!({"status": "pending", "agentId": agent_id})),
    )
}

async fn publish(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let request: PublishRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                error_body("invalid_envelope", &format!("malformed body: {err}")),
            );
        }
    };
    state.process_publish(request).await
}

#[derive(Debug, Deserialize)]
struct SessionEventsQuery {
    #[serde(rename = "agentId")]
    agent_id: Option<String>,
}

async fn session_events(
    State(state): State<AppState>,
    Path(session_key): Path<String>,
    Query(query): Query<SessionEventsQuery>,
) -> (StatusCode, Json<Value>) {
    let agent_id = match query.agent_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                error_body("invalid_request", "agentId query parameter is required"),
            );
        }
    };

    let store = state.store.lock().await;
    if !store.can_access(&agent_id, &session_key) {
        return (
            StatusCode::FORBIDDEN,
            error_body("not_approved", "agent not approved for this session"),
        );
    }
    let events = store.list(&session_key);
    (
        StatusCode::OK,
        Json(json!({"sessionKey": session_key, "events": events})),
    )
}

fn normalize_publish(request: PublishRequest, now_ms: i64) -> Result<EventEnvelope, Vec<String>> {
    let mut problems = Vec::new();

    let trace_id = required_string(request.trace_id, "traceId", &mut problems);
    let session_key = required_string(request.session_key, "sessionKey", &mut problems);
    let origin_actor_id = required_string(request.origin_actor_id, "originActorId", &mut problems);
    let text = required_string(request.text, "text", &mut problems);

    let origin_actor_type = match request.origin_actor_type.as_deref() {
        Some("human") => Some(ActorType::Human),
        Some("agent") => Some(ActorType::Agent),
        Some("system") => Some(ActorType::System),
        Some(other) => {
            problems.push(format!(
                "originActorType '{other}' must be one of human|agent|system"
            ));
            None
        }
        None => {
            problems.push("originActorType is required".to_string());
            None
        }
    };

    let hop_count = match request.hop_count {
        None => 0,
        Some(n) if (0..=u32::MAX as i64).contains(&n) => n as u32,
        Some(n) => {
            problems.push(format!("hopCount {n} must be a non-negative integer"));
            0
        }
    };

    match (trace_id, session_key, origin_actor_id, text, origin_actor_type) {
        (Some(trace_id), Some(session_key), Some(origin_actor_id), Some(text), Some(origin_actor_type))
            if problems.is_empty() =>
        {
            Ok(EventEnvelope {
                event_id: request
                    .event_id
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                trace_id,
                session_key,
                source_channel: request.source_channel.unwrap_or_default(),
                source_chat_id: request.source_chat_id.unwrap_or_default(),
                source_thread_id: request.source_thread_id.unwrap_or_default(),
                source_message_id: request.source_message_id.unwrap_or_default(),
                origin_actor_type,
                origin_actor_id,
                text,
                hop_count,
                seen_agents: request.seen_agents.unwrap_or_default(),
                emitted_by_agent_id: request.emitted_by_agent_id,
                emitted_event_id: request.emitted_event_id,
                // Server-assigned: any client-supplied createdAt is ignored.
                created_at: now_ms,
            })
        }
        _ => Err(problems),
    }
}

fn required_string(
    value: Option<String>,
    field: &str,
    problems: &mut Vec<String>,
) -> Option<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Some(v),
        _ => {
            problems.push(format!("{field} must be a non-empty string"));
            None
        }
    }
}

pub(crate) fn error_body(code: &str, message: &str) -> Json<Value> {
    Json(json!({"error": {"code": code, "message": message}}))
}
