//! Operational control surface
//!
//! - `GET /healthz`: kill-switch state and last snapshot time, unauthenticated
//!   so monitoring can poll it
//! - `POST /kill/toggle?reason=...`: flip the kill switch
//! - `POST /drp/restore` `{"snapshot_path": ...}`: make a snapshot the
//!   session's current state
//!
//! Mutating routes need `Authorization: Bearer $CONTROL_API_TOKEN`. Without a
//! configured token they answer 500 rather than run open.

use crate::audit::AuditLog;
use crate::drp::{render_timestamp, SnapshotStore};
use crate::kill_switch::KillSwitch;
use crate::Error;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

const DEFAULT_TOGGLE_REASON: &str = "manual override";

#[derive(Clone)]
pub struct ControlState {
    pub kill_switch: KillSwitch,
    pub drp: Arc<SnapshotStore>,
    pub audit: AuditLog,
    pub token: Option<Arc<SecretString>>,
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/kill/toggle", post(toggle_kill))
        .route("/drp/restore", post(restore))
        .with_state(state)
}

/// Serve until the listener fails.
pub async fn serve(bind: &str, state: ControlState) -> crate::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "Control API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[derive(Debug)]
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "detail": self.1 }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Storage(msg) if msg.contains("not found") => StatusCode::NOT_FOUND,
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

fn verify(state: &ControlState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(token) = &state.token else {
        return Err(ApiError(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Control token not configured".into(),
        ));
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    // blake3::Hash equality is constant time.
    if blake3::hash(presented.as_bytes()) != blake3::hash(token.expose_secret().as_bytes()) {
        tracing::warn!("Rejected control request with bad credentials");
        return Err(Error::Unauthorized.into());
    }
    Ok(())
}

async fn healthz(State(state): State<ControlState>) -> Json<Value> {
    let status = state.kill_switch.status().await;
    let last_snapshot = match state.drp.get_last_snapshot_timestamp().await {
        Ok(ts) => render_timestamp(ts),
        Err(e) => {
            tracing::warn!(error = %e, "Last snapshot time unavailable");
            "unknown".to_string()
        }
    };
    Json(json!({
        "status": "ok",
        "kill_switch_active": status.active,
        "kill_switch_reason": status.reason,
        "kill_switch_activated_at": status.activated_at,
        "last_snapshot": last_snapshot,
    }))
}

#[derive(Debug, Deserialize)]
struct ToggleQuery {
    #[serde(default)]
    reason: String,
}

async fn toggle_kill(
    State(state): State<ControlState>,
    headers: HeaderMap,
    Query(query): Query<ToggleQuery>,
) -> Result<Json<Value>, ApiError> {
    verify(&state, &headers)?;

    let was_active = state.kill_switch.is_active().await;
    let reason = match query.reason.trim() {
        "" => DEFAULT_TOGGLE_REASON,
        r => r,
    };
    if was_active {
        state.kill_switch.deactivate().await?;
    } else {
        state.kill_switch.activate(reason).await?;
    }
    let active = state.kill_switch.is_active().await;
    let reason = (!was_active).then_some(reason);
    tracing::warn!(active, ?reason, "Kill switch toggled via control API");
    state
        .audit
        .record(
            "kill_switch_toggled",
            json!({ "active": active, "reason": reason, "source": "control_api" }),
        )
        .await;
    Ok(Json(json!({ "kill_switch_active": active })))
}

#[derive(Debug, Deserialize)]
struct RestoreRequest {
    snapshot_path: String,
}

async fn restore(
    State(state): State<ControlState>,
    headers: HeaderMap,
    Json(body): Json<RestoreRequest>,
) -> Result<Json<Value>, ApiError> {
    verify(&state, &headers)?;

    let restored = state.drp.load_snapshot(&body.snapshot_path).await?;
    let current = state.drp.persist_session(&restored).await?;
    tracing::warn!(
        session_id = %restored.session_id(),
        cycle = restored.cycle_counter(),
        snapshot = %body.snapshot_path,
        "DRP restored"
    );
    state
        .audit
        .record_for(
            "drp_restored",
            restored.session_id(),
            restored.cycle_counter(),
            json!({ "snapshot": body.snapshot_path, "current": current }),
        )
        .await;
    Ok(Json(json!({
        "session_id": restored.session_id().to_string(),
        "cycle": restored.cycle_counter(),
    })))
}
