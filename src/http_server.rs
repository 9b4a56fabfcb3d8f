//! HTTP server implementation using Axum.
//!
//! Session lifecycle, command execution, and terminal-ticket minting. The
//! portal front end authenticates users and forwards the identity in the
//! `x-user-id` header; this service enforces ownership on top of it.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{Error, Result};
use crate::exec::{self, ExecOutcome};
use crate::state::{AppState, SessionSummary};
use crate::ticket;

/// How often the garbage collector looks for idle sessions.
const GC_INTERVAL_SECS: u64 = 60;

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
    workspace: String,
}

#[derive(Deserialize)]
struct ExecRequest {
    command: String,
}

#[derive(Serialize)]
struct TicketResponse {
    ticket: String,
    gateway_path: &'static str,
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) {
    // One recurring sweep serializes garbage collection; destroy itself is
    // idempotent, so even an overlapping run would be harmless.
    let gc_state = state.clone();
    tokio::spawn(async move {
        let mut interval = interval(Duration::from_secs(GC_INTERVAL_SECS));
        loop {
            interval.tick().await;
            gc_state.manager.sweep(gc_state.config.idle_ttl).await;
        }
    });

    let app = Router::new()
        // Session management
        .route("/sessions", post(create_session))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", delete(delete_session))
        .route("/sessions/:id/exec", post(exec_command))
        .route("/sessions/:id/terminal-ticket", post(mint_terminal_ticket))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn health() -> &'static str {
    "OK"
}

/// The authenticated caller, as forwarded by the portal.
fn require_user(headers: &HeaderMap) -> Result<String> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(Error::Unauthenticated)
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CreateSessionResponse>> {
    let user_id = require_user(&headers)?;
    let session = state.manager.create(&user_id).await?;
    Ok(Json(CreateSessionResponse {
        session_id: session.id,
        workspace: session.workspace.display().to_string(),
    }))
}

async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<SessionSummary>>> {
    let user_id = require_user(&headers)?;
    Ok(Json(state.manager.list(&user_id).await))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    let user_id = require_user(&headers)?;
    state.manager.destroy(&id, &user_id, false).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn exec_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ExecRequest>,
) -> Result<Json<ExecOutcome>> {
    let user_id = require_user(&headers)?;
    let outcome = exec::execute(&state, &id, &user_id, &req.command).await?;
    Ok(Json(outcome))
}

/// Mint a signed, short-lived ticket authorizing one terminal attach to an
/// existing active session owned by the caller.
async fn mint_terminal_ticket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TicketResponse>> {
    let user_id = require_user(&headers)?;
    let session = state.manager.get_active(&id, &user_id).await?;
    let ticket = ticket::mint(&state.config.ticket_secret, &user_id, &session.id);
    info!(session_id = %session.id, user_id, "minted terminal ticket");
    Ok(Json(TicketResponse {
        ticket,
        gateway_path: "/terminal",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn user_header_is_required_and_trimmed() {
        let mut headers = HeaderMap::new();
        assert!(matches!(require_user(&headers), Err(Error::Unauthenticated)));

        headers.insert("x-user-id", HeaderValue::from_static("  "));
        assert!(matches!(require_user(&headers), Err(Error::Unauthenticated)));

        headers.insert("x-user-id", HeaderValue::from_static(" u1 "));
        assert_eq!(require_user(&headers).unwrap(), "u1");
    }
}
