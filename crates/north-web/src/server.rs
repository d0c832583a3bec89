// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The `north-web` control server: a minimal `axum` WebSocket endpoint
//! speaking the JSON protocol in [`crate::protocol`] (spec.md §6).
//!
//! Grounded on the teacher's own `sven-gateway` WebSocket bridge
//! (`http::ws::handle_socket`'s upgrade-then-select! shape), stripped of its
//! TLS/libp2p/rate-limiting machinery: this crate's only job is the
//! loopback-or-allowlist Origin check, the `hello`-token handshake, and
//! forwarding chat/review/cancel messages to an [`Orchestrator`].

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use north_config::{Config, WebServerConfig};
use north_core::{Orchestrator, OrchestratorHandle, Session, ShellService};
use north_tools::{
    DeleteFileTool, EditFileTool, GlobFileSearchTool, GrepTool, ListDirTool, ReadFileTool,
    RunTerminalCommandTool, ToolRegistry, WriteTool,
};

use crate::protocol::{parse_decision, ClientMessage, ReviewDecision, ServerMessage};

/// One live conversation: the orchestrator behind a lock (exclusive while a
/// turn is running) plus the cheap [`OrchestratorHandle`] used to resolve
/// gates and cancel/stop without contending for that lock.
struct SessionEntry {
    orchestrator: Arc<Mutex<Orchestrator>>,
    handle: OrchestratorHandle,
    state_tx: mpsc::Sender<ServerMessage>,
}

pub struct AppState {
    config: Arc<Config>,
    auth_token: String,
    web: WebServerConfig,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

/// Bind and serve the control socket until the process is shut down.
/// Returns the per-process auth token the caller must hand to clients
/// out-of-band (e.g. print it to the terminal that launched the server).
pub async fn serve(config: Arc<Config>) -> Result<String> {
    let web = config.web.clone();
    let auth_token = uuid::Uuid::new_v4().to_string();
    let state = Arc::new(AppState { config, auth_token: auth_token.clone(), web: web.clone(), sessions: Mutex::new(HashMap::new()) });

    let app = Router::new().route("/", get(ws_handler)).with_state(state);
    let listener = tokio::net::TcpListener::bind(&web.bind).await.with_context(|| format!("binding web control socket to {}", web.bind))?;
    info!(bind = %web.bind, "north-web control socket listening");

    axum::serve(listener, app.into_make_service())
        .await
        .context("control socket server error")?;
    Ok(auth_token)
}

/// spec.md §6: the Origin header must match loopback at the bound port, or
/// an explicit entry in `origin_allowlist`.
fn origin_is_allowed(headers: &HeaderMap, web: &WebServerConfig) -> bool {
    let Some(origin) = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let loopback_origins = [format!("http://127.0.0.1:{}", port_of(&web.bind)), format!("http://localhost:{}", port_of(&web.bind))];
    loopback_origins.iter().any(|o| o == origin) || web.origin_allowlist.iter().any(|o| o == origin)
}

fn port_of(bind: &str) -> &str {
    bind.rsplit(':').next().unwrap_or("")
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !origin_is_allowed(&headers, &state.web) {
        warn!("rejecting control socket upgrade: Origin not loopback or allowlisted");
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

const CLOSE_AUTH_MISMATCH: u16 = 1008;

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    if !authenticate(&mut socket, &state).await {
        return;
    }
    let protocol_version = state.web.protocol_version;
    if send_json(&mut socket, &ServerMessage::Ready { protocol_version }).await.is_err() {
        return;
    }

    let (state_tx, mut state_rx) = mpsc::channel::<ServerMessage>(32);

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_client_message(&text, &state, &state_tx, &mut socket).await {
                            let _ = send_json(&mut socket, &ServerMessage::Error { session_id: None, message: e.to_string() }).await;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "control socket read error");
                        break;
                    }
                }
            }
            Some(msg) = state_rx.recv() => {
                if send_json(&mut socket, &msg).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// spec.md §6: first message MUST be `hello` with a token matching this
/// process's random auth token and the negotiated protocol version; any
/// mismatch closes with code 1008.
async fn authenticate(socket: &mut WebSocket, state: &Arc<AppState>) -> bool {
    let first = match socket.recv().await {
        Some(Ok(Message::Text(text))) => text,
        _ => {
            close_with(socket, CLOSE_AUTH_MISMATCH, "expected hello as the first message").await;
            return false;
        }
    };
    let hello: ClientMessage = match serde_json::from_str(&first) {
        Ok(m) => m,
        Err(_) => {
            close_with(socket, CLOSE_AUTH_MISMATCH, "first message was not valid JSON").await;
            return false;
        }
    };
    match hello {
        ClientMessage::Hello { token, protocol_version } if token == state.auth_token && protocol_version == state.web.protocol_version => true,
        ClientMessage::Hello { .. } => {
            close_with(socket, CLOSE_AUTH_MISMATCH, "token or protocol version mismatch").await;
            false
        }
        _ => {
            close_with(socket, CLOSE_AUTH_MISMATCH, "expected hello as the first message").await;
            false
        }
    }
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    use axum::extract::ws::CloseFrame;
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: reason.to_string().into() })))
        .await;
}

async fn send_json(socket: &mut WebSocket, msg: &ServerMessage) -> Result<()> {
    let text = serde_json::to_string(msg)?;
    socket.send(Message::Text(text)).await.context("sending control socket message")
}

async fn handle_client_message(
    text: &str,
    state: &Arc<AppState>,
    state_tx: &mpsc::Sender<ServerMessage>,
    socket: &mut WebSocket,
) -> Result<()> {
    let msg: ClientMessage = serde_json::from_str(text).context("malformed control message")?;
    match msg {
        ClientMessage::Hello { .. } => anyhow::bail!("hello already completed for this connection"),
        ClientMessage::SessionCreate { repo_root, conversation_id, initial_state: _ } => {
            let session_id = conversation_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let repo_root = repo_root.unwrap_or_else(|| ".".to_string());
            let orchestrator = build_orchestrator(&state.config, &repo_root)?;
            let snapshot = orchestrator.session.snapshot();
            let handle = orchestrator.handle();
            if state.web.review_timeout_secs > 0 {
                tokio::spawn(review_gate_timeout_watcher(
                    handle.clone(),
                    state.web.review_timeout_secs,
                    session_id.clone(),
                    state_tx.clone(),
                ));
            }
            state.sessions.lock().await.insert(
                session_id.clone(),
                SessionEntry { orchestrator: Arc::new(Mutex::new(orchestrator)), handle, state_tx: state_tx.clone() },
            );
            send_json(socket, &ServerMessage::SessionCreated { session_id, state: snapshot }).await
        }
        ClientMessage::ChatSend { session_id, content, mode: _, attached_files: _ } => {
            let entry = {
                let sessions = state.sessions.lock().await;
                sessions.get(&session_id).map(|e| (e.orchestrator.clone(), e.state_tx.clone()))
            };
            let Some((orchestrator, tx)) = entry else {
                anyhow::bail!("unknown session '{session_id}'");
            };
            // send_message parks on any gate it opens; running it in its own
            // task lets this connection's recv loop keep servicing
            // review.resolve/session.cancel for the same session meanwhile.
            tokio::spawn(async move {
                let result = orchestrator.lock().await.send_message(content).await;
                if let Err(e) = result {
                    let _ = tx.send(ServerMessage::Error { session_id: Some(session_id.clone()), message: e.to_string() }).await;
                }
                let snapshot = orchestrator.lock().await.session.snapshot();
                let _ = tx.send(ServerMessage::State { session_id, state: snapshot }).await;
            });
            Ok(())
        }
        ClientMessage::ReviewResolve { session_id, review_id, kind, decision } => {
            let handle = {
                let sessions = state.sessions.lock().await;
                sessions.get(&session_id).map(|e| e.handle.clone())
            };
            let Some(handle) = handle else {
                anyhow::bail!("unknown session '{session_id}'");
            };
            match parse_decision(kind, &decision) {
                Some(ReviewDecision::Write(d)) => handle.resolve_write(&review_id, d).await?,
                Some(ReviewDecision::Shell(d)) => handle.resolve_shell(&review_id, d).await?,
                Some(ReviewDecision::Command(d)) => handle.resolve_command(&review_id, d).await?,
                None => anyhow::bail!("decision '{decision}' is not valid for a {kind:?} review"),
            }
            Ok(())
        }
        ClientMessage::SessionCancel { session_id } => {
            let handle = state.sessions.lock().await.get(&session_id).map(|e| e.handle.clone());
            match handle {
                Some(h) => {
                    h.cancel().await;
                    Ok(())
                }
                None => anyhow::bail!("unknown session '{session_id}'"),
            }
        }
        ClientMessage::SessionStop { session_id } => {
            let handle = state.sessions.lock().await.get(&session_id).map(|e| e.handle.clone());
            match handle {
                Some(h) => {
                    h.stop().await;
                    Ok(())
                }
                None => anyhow::bail!("unknown session '{session_id}'"),
            }
        }
    }
}

/// spec.md §7: a review gate auto-resolves to its terminal-reject decision
/// after `review_timeout_secs` with no client response, and an `error`
/// notification is emitted alongside it. Runs for the life of the session,
/// re-arming after each gate it observes close.
async fn review_gate_timeout_watcher(
    handle: OrchestratorHandle,
    review_timeout_secs: u64,
    session_id: String,
    state_tx: mpsc::Sender<ServerMessage>,
) {
    let timeout = std::time::Duration::from_secs(review_timeout_secs);
    loop {
        let Some(gate_id) = handle.pending_review_id().await else {
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            continue;
        };
        tokio::time::sleep(timeout).await;
        if handle.pending_review_id().await.as_deref() == Some(gate_id.as_str()) {
            warn!(entry_id = %gate_id, "review gate timed out, auto-resolving to terminal rejection");
            handle.cancel().await;
            let _ = state_tx
                .send(ServerMessage::Error {
                    session_id: Some(session_id.clone()),
                    message: "review timed out".to_string(),
                })
                .await;
        }
    }
}

/// Build one fresh [`Orchestrator`] for a `session.create` message, wiring
/// the same builtin tool set and shell dispatcher the headless CLI path
/// uses (`src/main.rs::run_headless`).
fn build_orchestrator(config: &Config, repo_root: &str) -> Result<Orchestrator> {
    let provider: Arc<dyn north_model::ModelProvider> = Arc::from(north_model::from_config(&config.model)?);
    let default_window = north_model::catalog::context_window(&config.model.provider, &config.model.name, 128_000);
    let context_limit = provider.catalog_context_window().unwrap_or(default_window) as usize;

    let shell: Arc<dyn north_tools::ShellDispatcher> = Arc::new(ShellService::new());
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool);
    registry.register(WriteTool);
    registry.register(EditFileTool);
    registry.register(DeleteFileTool);
    registry.register(GlobFileSearchTool);
    registry.register(GrepTool);
    registry.register(ListDirTool);
    registry.register(RunTerminalCommandTool::new(shell.clone(), repo_root));

    let session = Session::new(config.model.name.clone(), context_limit);
    Ok(Orchestrator::new(
        session,
        Arc::new(registry),
        provider,
        shell,
        &config.tools,
        config.agent.clone(),
        repo_root,
        config.agent.default_mode,
    ))
}
