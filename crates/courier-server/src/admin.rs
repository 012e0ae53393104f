use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use courier_contracts::{AgentStatus, ApproveRequest, RejectRequest};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::store::StoreError;
use crate::{error_body, AppState};

const ADMIN_COOKIE: &str = "courier_admin";

type HandlerError = (StatusCode, Json<Value>);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LoginRequest {
    password: String,
}

pub(crate) async fn login(
    State(state): State<AppState>,
    Json(input): Json<LoginRequest>,
) -> Result<([(header::HeaderName, String); 1], Json<Value>), HandlerError> {
    if input.password != state.cfg.admin.password {
        return Err((
            StatusCode::UNAUTHORIZED,
            error_body("unauthorized", "invalid admin password"),
        ));
    }
    let token = uuid::Uuid::new_v4().to_string();
    state.admin_tokens.lock().await.insert(token.clone());
    Ok((
        [(
            header::SET_COOKIE,
            format!("{ADMIN_COOKIE}={token}; HttpOnly; Path=/; SameSite=Strict"),
        )],
        Json(json!({"ok": true})),
    ))
}

pub(crate) async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<Value> {
    if let Some(token) = cookie_token(&headers) {
        state.admin_tokens.lock().await.remove(&token);
    }
    Json(json!({"ok": true}))
}

pub(crate) async fn session(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    let authenticated = match cookie_token(&headers) {
        Some(token) => state.admin_tokens.lock().await.contains(&token),
        None => false,
    };
    Json(json!({"authenticated": authenticated}))
}

pub(crate) async fn agents_pending(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, HandlerError> {
    require_admin(&state, &headers).await?;
    let agents = state
        .store
        .lock()
        .await
        .registrations_with_status(AgentStatus::Pending);
    Ok(Json(json!({"agents": agents})))
}

pub(crate) async fn agents_approved(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, HandlerError> {
    require_admin(&state, &headers).await?;
    let agents = state
        .store
        .lock()
        .await
        .registrations_with_status(AgentStatus::Approved);
    Ok(Json(json!({"agents": agents})))
}

pub(crate) async fn agents_approve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<ApproveRequest>,
) -> Result<Json<Value>, HandlerError> {
    require_admin(&state, &headers).await?;
    let mut store = state.store.lock().await;
    store
        .approve(&input.agent_id, input.session_keys.clone())
        .map_err(not_found)?;
    Ok(Json(json!({
        "ok": true,
        "agentId": input.agent_id,
        "sessionKeys": input.session_keys,
    })))
}

pub(crate) async fn agents_reject(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<RejectRequest>,
) -> Result<Json<Value>, HandlerError> {
    require_admin(&state, &headers).await?;
    let mut store = state.store.lock().await;
    store.reject(&input.agent_id).map_err(not_found)?;
    Ok(Json(json!({"ok": true, "agentId": input.agent_id})))
}

pub(crate) async fn api_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, HandlerError> {
    require_admin(&state, &headers).await?;
    state.audit.metrics().map(Json).map_err(audit_unavailable)
}

pub(crate) async fn api_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, HandlerError> {
    require_admin(&state, &headers).await?;
    state
        .audit
        .session_rollup(50)
        .map(|sessions| Json(json!({"sessions": sessions})))
        .map_err(audit_unavailable)
}

pub(crate) async fn api_loops(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, HandlerError> {
    require_admin(&state, &headers).await?;
    state
        .audit
        .recent_decisions(50)
        .map(|decisions| Json(json!({"decisions": decisions})))
        .map_err(audit_unavailable)
}

pub(crate) async fn api_deliveries(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, HandlerError> {
    require_admin(&state, &headers).await?;
    state
        .audit
        .recent_deliveries(50)
        .map(|deliveries| Json(json!({"deliveries": deliveries})))
        .map_err(audit_unavailable)
}

async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), HandlerError> {
    if let Some(token) = cookie_token(headers) {
        if state.admin_tokens.lock().await.contains(&token) {
            return Ok(());
        }
    }
    Err((
        StatusCode::UNAUTHORIZED,
        error_body("unauthorized", "admin session required"),
    ))
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == ADMIN_COOKIE)
        .map(|(_, value)| value.to_string())
}

fn not_found(err: StoreError) -> HandlerError {
    (
        StatusCode::NOT_FOUND,
        error_body("agent_not_found", &err.to_string()),
    )
}

fn audit_unavailable(err: crate::audit::AuditError) -> HandlerError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        error_body("audit_unavailable", &err.to_string()),
    )
}
