//! WebSocket session gateway
//!
//! One task per connection. The handshake is authenticated and bound to a
//! workspace before the upgrade; after the upgrade the workspace is hydrated,
//! the root snapshot is sent once, and inbound messages are dispatched until
//! the client goes away. Disconnect kills the connection's terminal before
//! asking the orchestrator to stop the workspace's compute.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, Uri},
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use replhost_protocol::{new_id, ClientMessage, ConnectionState, FileNode, ServerMessage};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::auth::{authenticate, Principal};
use crate::error::GatewayError;
use crate::state::AppState;
use crate::terminal::{CreateOutcome, OutputSink};
use crate::workspace::{resolve_workspace, WorkspaceId};
use crate::workspace_fs::{self, RelPath};

/// Close code sent when the workspace cannot be loaded
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Messages that can be sent through the WebSocket
enum OutboundMessage {
    /// JSON-serialized ServerMessage
    Json(ServerMessage),
    /// Raw pong response
    Pong(Bytes),
    /// Close the socket after everything queued before it
    Close { code: u16, reason: String },
}

/// Per-connection state owned by the dispatch loop
struct ConnectionContext {
    conn_id: String,
    workspace: WorkspaceId,
    local_root: PathBuf,
    remote_prefix: String,
    /// Every node this client has been shown, keyed by path
    known_nodes: BTreeMap<String, FileNode>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    uri: Uri,
) -> Response {
    match accept_connection(&state, &headers, &params, uri.query()) {
        Ok((principal, workspace)) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, principal, workspace))
            .into_response(),
        Err(e) => {
            warn!(
                component = "websocket",
                event = "ws.handshake.rejected",
                status = e.status().as_u16(),
                error = %e,
                "Rejected connection"
            );
            e.into_response()
        }
    }
}

/// Authenticate the handshake and bind it to a workspace.
fn accept_connection(
    state: &AppState,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
    raw_query: Option<&str>,
) -> Result<(Principal, WorkspaceId), GatewayError> {
    let principal = authenticate(state.validator.as_ref(), headers, raw_query)?;
    debug!(
        component = "websocket",
        event = "ws.handshake.authenticated",
        principal = %principal.name,
        state = ?ConnectionState::Authenticated,
        "Handshake authenticated"
    );
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    let workspace = resolve_workspace(state.resolution, &principal, params, host)?;
    Ok((principal, workspace))
}

/// Handle a WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    principal: Principal,
    workspace: WorkspaceId,
) {
    let conn_id = new_id();
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = %conn_id,
        workspace = %workspace,
        principal = %principal.name,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(256);

    let send_conn_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = %send_conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
                OutboundMessage::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = %send_conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let Some(mut ctx) = open_workspace(&state, conn_id.clone(), workspace, &outbound_tx).await
    else {
        // Let the error and close frame drain before dropping the socket.
        drop(outbound_tx);
        let _ = send_task.await;
        log_closed(&conn_id);
        return;
    };

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = %conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = %conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        match parse_client_message(&text) {
            Ok(client_msg) => {
                handle_client_message(client_msg, &outbound_tx, &state, &mut ctx).await;
            }
            Err(reply) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = %conn_id,
                    payload_bytes = text.len(),
                    payload_preview = %truncate_for_log(&text, 240),
                    "Failed to parse client message"
                );
                send_json(&outbound_tx, reply).await;
            }
        }
    }

    teardown(&state, &ctx).await;
    log_closed(&conn_id);
    send_task.abort();
}

fn log_closed(conn_id: &str) {
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = %conn_id,
        state = ?ConnectionState::Closed,
        "WebSocket connection closed"
    );
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

fn parse_client_message(text: &str) -> Result<ClientMessage, ServerMessage> {
    serde_json::from_str(text).map_err(|e| ServerMessage::Error {
        code: "parse_error".into(),
        message: e.to_string(),
        request_id: None,
    })
}

/// Send a ServerMessage through the outbound channel
async fn send_json(tx: &mpsc::Sender<OutboundMessage>, msg: ServerMessage) {
    let _ = tx.send(OutboundMessage::Json(msg)).await;
}

async fn send_error(
    tx: &mpsc::Sender<OutboundMessage>,
    err: &GatewayError,
    request_id: Option<String>,
) {
    send_json(tx, err.to_message(request_id)).await;
}

/// Hydrate the workspace and send the root snapshot. On failure the client
/// gets an error and a close frame, never an empty snapshot.
async fn open_workspace(
    state: &AppState,
    conn_id: String,
    workspace: WorkspaceId,
    tx: &mpsc::Sender<OutboundMessage>,
) -> Option<ConnectionContext> {
    let cold_start = !state.cache.is_hydrated(&workspace);
    let loaded = async {
        let local_root = state.cache.ensure(&workspace).await?;
        let root = workspace_fs::list_directory(&local_root, "")
            .await
            .map_err(|e| GatewayError::Hydration(e.into()))?;
        Ok::<_, GatewayError>((local_root, root))
    }
    .await;

    let (local_root, root_content) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            error!(
                component = "websocket",
                event = "ws.workspace.hydration_failed",
                connection_id = %conn_id,
                workspace = %workspace,
                error = %e,
                "Failed to load workspace, closing connection"
            );
            send_error(tx, &e, None).await;
            let _ = tx
                .send(OutboundMessage::Close {
                    code: CLOSE_INTERNAL_ERROR,
                    reason: e.code().to_string(),
                })
                .await;
            return None;
        }
    };

    let mut known_nodes = BTreeMap::new();
    workspace_fs::merge_nodes(&mut known_nodes, &root_content);

    info!(
        component = "websocket",
        event = "ws.workspace.loaded",
        connection_id = %conn_id,
        workspace = %workspace,
        root_entries = root_content.len(),
        cold_start,
        state = ?ConnectionState::Active,
        "Workspace loaded"
    );
    send_json(
        tx,
        ServerMessage::WorkspaceLoaded {
            workspace: workspace.to_string(),
            root_content,
        },
    )
    .await;

    Some(ConnectionContext {
        conn_id,
        remote_prefix: state.cache.remote_prefix(&workspace),
        workspace,
        local_root,
        known_nodes,
    })
}

async fn handle_client_message(
    msg: ClientMessage,
    client_tx: &mpsc::Sender<OutboundMessage>,
    state: &Arc<AppState>,
    ctx: &mut ConnectionContext,
) {
    match msg {
        ClientMessage::FetchDirectory { request_id, path } => {
            let path = match RelPath::parse(&path) {
                Ok(rel) if rel.is_root() => "/".to_string(),
                Ok(rel) => rel.canonical(),
                Err(e) => {
                    send_error(client_tx, &GatewayError::from(e), Some(request_id)).await;
                    return;
                }
            };
            match workspace_fs::list_directory(&ctx.local_root, &path).await {
                Ok(nodes) => {
                    workspace_fs::merge_nodes(&mut ctx.known_nodes, &nodes);
                    send_json(
                        client_tx,
                        ServerMessage::DirectoryListing {
                            request_id,
                            path,
                            nodes,
                        },
                    )
                    .await;
                }
                Err(e) => send_error(client_tx, &GatewayError::from(e), Some(request_id)).await,
            }
        }

        ClientMessage::FetchContent { request_id, path } => {
            match workspace_fs::read_text(&ctx.local_root, &path).await {
                Ok(content) => {
                    remember_content(ctx, &path, &content);
                    send_json(
                        client_tx,
                        ServerMessage::FileContent {
                            request_id,
                            path,
                            content,
                        },
                    )
                    .await;
                }
                Err(e) => send_error(client_tx, &GatewayError::from(e), Some(request_id)).await,
            }
        }

        ClientMessage::UpdateContent { path, content } => {
            let canonical = match RelPath::parse(&path) {
                Ok(rel) => rel.canonical(),
                Err(e) => {
                    send_error(client_tx, &GatewayError::from(e), None).await;
                    return;
                }
            };
            if let Err(e) =
                workspace_fs::write_file(&ctx.local_root, &canonical, content.as_bytes()).await
            {
                warn!(
                    component = "websocket",
                    event = "ws.content.write_failed",
                    connection_id = %ctx.conn_id,
                    path = %canonical,
                    error = %e,
                    "Local write failed"
                );
                send_error(client_tx, &GatewayError::from(e), None).await;
                return;
            }

            remember_content(ctx, &canonical, &content);
            send_json(
                client_tx,
                ServerMessage::ContentSaved {
                    path: canonical.clone(),
                },
            )
            .await;

            state
                .remote_sync
                .push(
                    &ctx.workspace.to_string(),
                    &ctx.remote_prefix,
                    &canonical,
                    Bytes::from(content),
                );
        }

        ClientMessage::RequestTerminal => {
            open_terminal(client_tx, state, ctx).await;
        }

        ClientMessage::TerminalInput { data } => {
            if !state.terminals.is_running(&ctx.conn_id) {
                return;
            }
            let terminals = state.terminals.clone();
            let id = ctx.conn_id.clone();
            let _ = tokio::task::spawn_blocking(move || terminals.write(&id, data.as_bytes())).await;
        }

        ClientMessage::ResizeTerminal { cols, rows } => {
            if !state.terminals.is_running(&ctx.conn_id) {
                return;
            }
            let terminals = state.terminals.clone();
            let id = ctx.conn_id.clone();
            let _ = tokio::task::spawn_blocking(move || terminals.resize(&id, cols, rows)).await;
        }

        ClientMessage::ClearTerminal => {
            if !state.terminals.is_running(&ctx.conn_id) {
                return;
            }
            let terminals = state.terminals.clone();
            let id = ctx.conn_id.clone();
            let _ = tokio::task::spawn_blocking(move || terminals.clear(&id)).await;
        }
    }
}

/// Attach fetched or written content to a node the client already knows.
fn remember_content(ctx: &mut ConnectionContext, path: &str, content: &str) {
    let Ok(rel) = RelPath::parse(path) else {
        return;
    };
    if let Some(node) = ctx.known_nodes.get_mut(&rel.canonical()) {
        if !node.is_dir() {
            node.content = Some(content.to_string());
        }
    }
}

async fn open_terminal(
    client_tx: &mpsc::Sender<OutboundMessage>,
    state: &Arc<AppState>,
    ctx: &ConnectionContext,
) {
    let output_tx = client_tx.clone();
    let on_data: OutputSink = Box::new(move |chunk: Vec<u8>| {
        let msg = ServerMessage::TerminalOutput {
            data: STANDARD.encode(chunk),
        };
        // Runs on the PTY reader thread.
        let _ = output_tx.blocking_send(OutboundMessage::Json(msg));
    });

    let terminals = state.terminals.clone();
    let id = ctx.conn_id.clone();
    let workdir = ctx.local_root.clone();
    let result =
        tokio::task::spawn_blocking(move || terminals.create_session(&id, &workdir, on_data)).await;

    match result {
        Ok(Ok(outcome)) => {
            if outcome == CreateOutcome::Created {
                info!(
                    component = "websocket",
                    event = "ws.terminal.opened",
                    connection_id = %ctx.conn_id,
                    workspace = %ctx.workspace,
                    "Terminal opened"
                );
            }
            send_json(client_tx, ServerMessage::TerminalReady).await;
        }
        Ok(Err(e)) => {
            let err = GatewayError::from(e);
            warn!(
                component = "websocket",
                event = "ws.terminal.spawn_failed",
                connection_id = %ctx.conn_id,
                error = %err,
                "Terminal spawn failed"
            );
            send_error(client_tx, &err, None).await;
        }
        Err(e) => {
            error!(
                component = "websocket",
                event = "ws.terminal.spawn_panicked",
                connection_id = %ctx.conn_id,
                error = %e,
                "Terminal spawn task failed"
            );
            send_json(
                client_tx,
                ServerMessage::Error {
                    code: "terminal_spawn_failed".into(),
                    message: e.to_string(),
                    request_id: None,
                },
            )
            .await;
        }
    }
}

/// Kill the connection's terminal, then fire off the compute stop request
/// without waiting for it.
async fn teardown(state: &Arc<AppState>, ctx: &ConnectionContext) {
    let terminals = state.terminals.clone();
    let id = ctx.conn_id.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || terminals.clear(&id)).await {
        error!(
            component = "websocket",
            event = "ws.teardown.terminal_failed",
            connection_id = %ctx.conn_id,
            error = %e,
            "Terminal teardown task failed"
        );
    }
    debug!(
        component = "websocket",
        event = "ws.teardown.terminal_cleared",
        connection_id = %ctx.conn_id,
        live_terminals = state.terminals.session_count(),
        "Connection terminal released"
    );

    let compute = state.compute.clone();
    let conn_id = ctx.conn_id.clone();
    let owner = ctx.workspace.owner().to_string();
    let name = ctx.workspace.name().to_string();
    tokio::spawn(async move {
        if let Err(e) = compute.stop_workspace(&owner, &name).await {
            let err = GatewayError::from(e);
            warn!(
                component = "websocket",
                event = "ws.teardown.compute_failed",
                connection_id = %conn_id,
                owner = %owner,
                workspace = %name,
                error = %err,
                "Failed to stop workspace compute"
            );
        }
    });
}
