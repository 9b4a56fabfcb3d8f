//! Terminal gateway: long-lived interactive shells over WebSocket.
//!
//! Runs as its own process, decoupled from the request/response API. A
//! connection is authenticated by a signed single-purpose ticket passed as a
//! query parameter (WebSocket upgrades cannot carry custom headers from every
//! client environment), never by the normal API credentials.
//!
//! Wire protocol: client sends JSON text frames
//! `{"type":"data","data":"..."}` for keystrokes and
//! `{"type":"resize","data":{"cols":N,"rows":N}}`; the server streams raw
//! shell output bytes back as binary frames. Either side closing tears the
//! other down.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::backend;
use crate::config::Config;
use crate::ticket::{self, TicketClaims};
use crate::workspace::{self, SessionMeta};

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;
const MIN_COLS: u16 = 20;
const MAX_COLS: u16 = 500;
const MIN_ROWS: u16 = 5;
const MAX_ROWS: u16 = 200;

/// Oversized input frames are dropped, not written to the shell.
const MAX_INPUT_BYTES: usize = 8 * 1024;

#[derive(Debug, Deserialize)]
struct TerminalQuery {
    ticket: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Data { data: String },
    Resize { data: ResizeRequest },
}

#[derive(Debug, Deserialize)]
struct ResizeRequest {
    cols: u16,
    rows: u16,
}

enum OutputEvent {
    Output(Vec<u8>),
    Closed,
}

struct ShellRuntime {
    master: Box<dyn portable_pty::MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    output_rx: tokio::sync::mpsc::UnboundedReceiver<OutputEvent>,
}

/// Run the terminal gateway on the given port.
pub async fn run_gateway(port: u16, config: Arc<Config>) {
    let app = Router::new()
        .route("/terminal", get(terminal_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(config);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting terminal gateway on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn terminal_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<TerminalQuery>,
    State(config): State<Arc<Config>>,
) -> impl IntoResponse {
    // No ticket, no upgrade.
    let Some(ticket) = query.ticket else {
        return (StatusCode::UNAUTHORIZED, "missing ticket").into_response();
    };
    ws.on_upgrade(move |socket| handle_connection(socket, ticket, config))
        .into_response()
}

async fn handle_connection(mut socket: WebSocket, ticket: String, config: Arc<Config>) {
    let claims = match ticket::verify(&config.ticket_secret, &ticket) {
        Ok(claims) => claims,
        Err(reason) => {
            warn!(%reason, "rejected terminal connection");
            reject(&mut socket, &format!("terminal attach rejected: {reason}")).await;
            return;
        }
    };

    let ws_dir = workspace::path_for(&config.workspace_root, &claims.sid);
    if let Err(reason) = ensure_workspace(&ws_dir, &claims) {
        warn!(session_id = %claims.sid, %reason, "terminal workspace unavailable");
        reject(&mut socket, &format!("terminal attach rejected: {reason}")).await;
        return;
    }
    if let Err(e) = workspace::touch_meta(&ws_dir) {
        warn!(session_id = %claims.sid, error = %e, "failed to bump session last-used");
    }

    let mut runtime = match spawn_shell(&ws_dir, &claims.sid, DEFAULT_COLS, DEFAULT_ROWS) {
        Ok(runtime) => runtime,
        Err(reason) => {
            warn!(session_id = %claims.sid, %reason, "failed to provision terminal");
            reject(&mut socket, &format!("terminal attach failed: {reason}")).await;
            return;
        }
    };

    info!(session_id = %claims.sid, user_id = %claims.sub, "terminal attached");
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            maybe_output = runtime.output_rx.recv() => {
                match maybe_output {
                    Some(OutputEvent::Output(data)) => {
                        if ws_tx.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(OutputEvent::Closed) | None => {
                        debug!(session_id = %claims.sid, "shell exited");
                        break;
                    }
                }
            }
            maybe_msg = ws_rx.next() => {
                let Some(Ok(msg)) = maybe_msg else {
                    break;
                };
                match msg {
                    Message::Text(text) => {
                        if !handle_frame(&mut runtime, &text) {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    // Ping/pong are answered by the transport; stray binary
                    // frames are not part of the protocol.
                    Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    // Whichever side closed first, tear the other down. Killing an already
    // dead shell is a no-op.
    let _ = runtime.child.kill();
    info!(session_id = %claims.sid, "terminal detached");
}

/// Apply one client frame. Returns `false` when the shell's input side is
/// gone and the connection should close.
fn handle_frame(runtime: &mut ShellRuntime, text: &str) -> bool {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::Data { data }) => {
            if data.is_empty() {
                return true;
            }
            if data.len() > MAX_INPUT_BYTES {
                warn!(len = data.len(), "dropping oversized terminal input frame");
                return true;
            }
            let written = runtime
                .writer
                .write_all(data.as_bytes())
                .and_then(|()| runtime.writer.flush());
            if let Err(e) = written {
                warn!(error = %e, "failed to write to shell");
                return false;
            }
            true
        }
        Ok(ClientFrame::Resize { data }) => {
            let (cols, rows) = clamp_dims(data.cols, data.rows);
            if let Err(e) = runtime.master.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            }) {
                warn!(error = %e, "failed to resize terminal");
            }
            true
        }
        Err(e) => {
            // Malformed frames are logged and ignored, never fatal.
            debug!(error = %e, "ignoring malformed terminal frame");
            true
        }
    }
}

/// Columns and rows are clamped to a safe range before touching the PTY so a
/// pathological resize request cannot exhaust resources.
fn clamp_dims(cols: u16, rows: u16) -> (u16, u16) {
    (cols.clamp(MIN_COLS, MAX_COLS), rows.clamp(MIN_ROWS, MAX_ROWS))
}

/// Make sure the target workspace exists and belongs to the ticket subject.
/// A missing directory is recreated from the ticket claims: the signed ticket
/// proves the session, and first attach after a restart must still work.
fn ensure_workspace(ws_dir: &Path, claims: &TicketClaims) -> Result<(), String> {
    match workspace::read_meta(ws_dir) {
        Ok(meta) if meta.user_id != claims.sub => Err("session ownership mismatch".to_string()),
        Ok(_) => Ok(()),
        Err(_) => {
            let now = Utc::now();
            let meta = SessionMeta {
                session_id: claims.sid.clone(),
                user_id: claims.sub.clone(),
                created_at: now,
                last_used: now,
            };
            let root = ws_dir.parent().unwrap_or(ws_dir);
            workspace::provision(root, &meta)
                .map(|_| ())
                .map_err(|e| format!("workspace unavailable: {e}"))
        }
    }
}

fn spawn_shell(
    workspace: &Path,
    session_id: &str,
    cols: u16,
    rows: u16,
) -> Result<ShellRuntime, String> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| format!("failed to allocate PTY: {e}"))?;

    let portable_pty::PtyPair { master, slave } = pair;

    let mut cmd = CommandBuilder::new("sh");
    cmd.arg("-i");
    cmd.cwd(workspace);
    cmd.env("TERM", "xterm-256color");
    cmd.env("HOME", workspace);
    cmd.env("PATH", backend::LOCAL_PATH);
    cmd.env("PS1", format!("[{}] $ ", prompt_tag(session_id)));

    let child = slave
        .spawn_command(cmd)
        .map_err(|e| format!("failed to spawn shell: {e}"))?;
    drop(slave);

    let writer = master
        .take_writer()
        .map_err(|e| format!("failed to open shell input: {e}"))?;
    let reader = master
        .try_clone_reader()
        .map_err(|e| format!("failed to open shell output: {e}"))?;
    let output_rx = spawn_reader(reader)?;

    Ok(ShellRuntime {
        master,
        writer,
        child,
        output_rx,
    })
}

/// Blocking PTY reads happen on a dedicated thread feeding a channel; the
/// async pump never blocks on the shell.
fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
) -> Result<tokio::sync::mpsc::UnboundedReceiver<OutputEvent>, String> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("terminal-reader".to_string())
        .spawn(move || {
            let mut buf = vec![0_u8; 16 * 1024];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        let _ = tx.send(OutputEvent::Closed);
                        break;
                    }
                    Ok(n) => {
                        if tx.send(OutputEvent::Output(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        let _ = tx.send(OutputEvent::Closed);
                        break;
                    }
                }
            }
        })
        .map_err(|e| format!("failed to launch shell reader thread: {e}"))?;
    Ok(rx)
}

/// Short session tag advertised in the shell prompt.
fn prompt_tag(session_id: &str) -> String {
    session_id.chars().take(8).collect()
}

async fn reject(socket: &mut WebSocket, reason: &str) {
    // Best effort: the diagnostic may not arrive if the peer is already gone.
    let _ = socket.send(Message::Text(format!("{reason}\r\n"))).await;
    let _ = socket.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dims_are_clamped_to_the_safe_range() {
        assert_eq!(clamp_dims(0, 0), (MIN_COLS, MIN_ROWS));
        assert_eq!(clamp_dims(u16::MAX, u16::MAX), (MAX_COLS, MAX_ROWS));
        assert_eq!(clamp_dims(120, 40), (120, 40));
    }

    #[test]
    fn client_frames_parse() {
        let data: ClientFrame = serde_json::from_str(r#"{"type":"data","data":"ls\n"}"#).unwrap();
        assert!(matches!(data, ClientFrame::Data { data } if data == "ls\n"));

        let resize: ClientFrame =
            serde_json::from_str(r#"{"type":"resize","data":{"cols":132,"rows":43}}"#).unwrap();
        assert!(matches!(resize, ClientFrame::Resize { data } if data.cols == 132 && data.rows == 43));
    }

    #[test]
    fn unknown_frames_fail_to_parse_and_are_ignorable() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"exec","data":"rm"}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>("not json").is_err());
    }

    #[test]
    fn prompt_tag_is_short() {
        assert_eq!(prompt_tag("0123456789abcdef"), "01234567");
        assert_eq!(prompt_tag("abc"), "abc");
    }

    #[test]
    fn ensure_workspace_recreates_missing_and_checks_owner() {
        let root = tempfile::tempdir().unwrap();
        let claims = TicketClaims {
            sub: "u1".into(),
            scope: crate::ticket::TERMINAL_SCOPE.into(),
            sid: "s1".into(),
            exp: 0,
        };
        let ws_dir = workspace::path_for(root.path(), "s1");

        // First attach after a restart: directory is recreated.
        ensure_workspace(&ws_dir, &claims).unwrap();
        assert!(ws_dir.join(workspace::WELCOME_FILE).is_file());

        // Wrong subject is rejected once metadata exists.
        let foreign = TicketClaims { sub: "u2".into(), ..claims };
        assert!(ensure_workspace(&ws_dir, &foreign).is_err());
    }
}
