//! HTTP/WebSocket transport.
//!
//! One WebSocket connection carries the whole protocol: a snapshot on
//! open, lifecycle events as they happen, and per-session output streams
//! for the sessions the client has attached to. The event subscription
//! is taken before the snapshot is built, so nothing falls between them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::guard::DestroyAuthority;
use crate::protocol::{ClientMessage, ServerMessage, SessionView};
use crate::registry::{
    CreateSessionRequest, Registry, RegistryError, RegistryEvent, SessionMeta,
};

/// Maximum concurrent WebSocket connections. Per-session attachment
/// limits exist separately; this caps the server as a whole.
const MAX_WS_CONNECTIONS: usize = 256;

/// Per-connection outbound queue depth. Output forwarders block when a
/// client reads slowly, which is the backpressure we want.
const OUTBOUND_QUEUE: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub shutdown: CancellationToken,
    pub connections: ConnectionManager,
}

impl AppState {
    pub fn new(registry: Registry, shutdown: CancellationToken) -> Self {
        Self {
            registry,
            shutdown,
            connections: ConnectionManager::new(MAX_WS_CONNECTIONS),
        }
    }
}

/// The set of live viewer connections. Injected through [`AppState`], never
/// reached as process-global state. Owns admission (the server-wide
/// connection cap) and one outbound handle per admitted viewer.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<parking_lot::Mutex<HashMap<u64, mpsc::Sender<ServerMessage>>>>,
    capacity: usize,
    next_id: Arc<AtomicU64>,
}

impl ConnectionManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            capacity,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Admit a viewer, or `None` when the server is at capacity. The
    /// returned guard removes the entry when the connection winds down.
    fn register(&self, out_tx: mpsc::Sender<ServerMessage>) -> Option<ConnectionGuard> {
        let mut inner = self.inner.lock();
        if inner.len() >= self.capacity {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        inner.insert(id, out_tx);
        Some(ConnectionGuard {
            manager: self.clone(),
            id,
        })
    }

    pub fn active(&self) -> usize {
        self.inner.lock().len()
    }
}

struct ConnectionGuard {
    manager: ConnectionManager,
    id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.inner.lock().remove(&self.id);
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.connections.active(),
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let (out_tx, out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE);
    let Some(guard) = state.connections.register(out_tx.clone()) else {
        return axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    ws.on_upgrade(move |socket| async move {
        let _guard = guard;
        handle_connection(socket, state, out_tx, out_rx).await;
    })
    .into_response()
}

fn view(registry: &Registry, meta: SessionMeta) -> SessionView {
    let task_scoped = registry.is_task_scoped(&meta);
    SessionView { meta, task_scoped }
}

fn snapshot_message(registry: &Registry) -> ServerMessage {
    let catalogue = registry.snapshot();
    ServerMessage::Snapshot {
        sessions: catalogue
            .sessions
            .into_iter()
            .map(|meta| view(registry, meta))
            .collect(),
        tabs: catalogue.tabs,
    }
}

fn event_message(registry: &Registry, event: RegistryEvent) -> ServerMessage {
    match event {
        RegistryEvent::SessionCreated {
            meta,
            correlation_id,
        } => ServerMessage::SessionCreated {
            session: view(registry, meta),
            correlation_id,
        },
        RegistryEvent::SessionDestroyed { meta, cause, reason } => {
            ServerMessage::SessionDestroyed {
                id: meta.id,
                cause,
                reason,
            }
        }
        RegistryEvent::SessionExited { id, exit_code } => {
            ServerMessage::SessionExited { id, exit_code }
        }
        RegistryEvent::SessionRenamed { id, name } => {
            ServerMessage::SessionRenamed { id, name }
        }
        RegistryEvent::SessionResized { id, rows, cols } => {
            ServerMessage::SessionResized { id, rows, cols }
        }
        RegistryEvent::SessionTabChanged {
            id,
            tab_id,
            position,
        } => ServerMessage::SessionTabChanged {
            id,
            tab_id,
            position,
        },
        RegistryEvent::BufferCleared { id } => ServerMessage::BufferCleared { id },
        RegistryEvent::TabCreated {
            tab,
            correlation_id,
        } => ServerMessage::TabCreated {
            tab,
            correlation_id,
        },
        RegistryEvent::TabUpdated { tab } => ServerMessage::TabUpdated { tab },
        RegistryEvent::TabDeleted { id } => ServerMessage::TabDeleted { id },
        RegistryEvent::TabReordered { tabs } => ServerMessage::TabReordered { tabs },
    }
}

/// Stable error codes clients can branch on.
fn error_code(err: &RegistryError) -> &'static str {
    match err {
        RegistryError::NotFound(_) => "not_found",
        RegistryError::TabNotFound(_) => "tab_not_found",
        RegistryError::EntityStale(_) => "entity_stale",
        RegistryError::InvalidName(_) => "invalid_name",
        RegistryError::MaxSessionsReached => "max_sessions",
        RegistryError::NotRunning(_) => "not_running",
        RegistryError::ClientLimit(_) => "client_limit",
        RegistryError::Unauthorized(_) => "unauthorized_destroy",
        RegistryError::Spawn(_) => "spawn_failed",
    }
}

/// Reply for a failed operation on `id`. Commands that race a concurrent
/// deletion get the dedicated stale event instead of a generic error, so
/// the sender reconciles rather than retrying.
fn op_error(err: RegistryError, id: String) -> ServerMessage {
    match err {
        RegistryError::EntityStale(_) => ServerMessage::EntityStale { id },
        e => ServerMessage::error(error_code(&e), e.to_string(), Some(id)),
    }
}

async fn send_msg(tx: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => tx.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(?e, "failed to serialize server message");
            true
        }
    }
}

async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    out_tx: mpsc::Sender<ServerMessage>,
    mut out_rx: mpsc::Receiver<ServerMessage>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Subscribe BEFORE building the snapshot: an event raced with the
    // snapshot shows up on the subscription instead of vanishing.
    let mut events_rx = state.registry.subscribe_events();
    if !send_msg(&mut ws_tx, &snapshot_message(&state.registry)).await {
        return;
    }

    let mut attachments: HashMap<String, CancellationToken> = HashMap::new();

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                match event {
                    Ok(event) => {
                        // Drop the forwarder for sessions that no longer exist.
                        if let RegistryEvent::SessionDestroyed { ref meta, .. } = event {
                            if let Some(token) = attachments.remove(&meta.id) {
                                token.cancel();
                            }
                        }
                        let msg = event_message(&state.registry, event);
                        if !send_msg(&mut ws_tx, &msg).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Missed events are unrecoverable piecemeal; resync.
                        tracing::warn!(missed = n, "event stream lagged, resending snapshot");
                        if !send_msg(&mut ws_tx, &snapshot_message(&state.registry)).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            Some(msg) = out_rx.recv() => {
                if !send_msg(&mut ws_tx, &msg).await {
                    break;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(command) => {
                                handle_command(&state, &mut attachments, &out_tx, command).await
                            }
                            Err(e) => Some(ServerMessage::error(
                                "invalid_message",
                                format!("could not parse command: {e}"),
                                None,
                            )),
                        };
                        if let Some(reply) = reply {
                            if !send_msg(&mut ws_tx, &reply).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(?e, "websocket receive error");
                        break;
                    }
                }
            }

            _ = state.shutdown.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }

    for token in attachments.values() {
        token.cancel();
    }
    tracing::debug!("websocket connection closed");
}

/// Execute one command. Lifecycle changes answer through the broadcast
/// event stream; only attach/detach/startup/agent replies and errors go
/// back directly.
async fn handle_command(
    state: &AppState,
    attachments: &mut HashMap<String, CancellationToken>,
    out_tx: &mpsc::Sender<ServerMessage>,
    command: ClientMessage,
) -> Option<ServerMessage> {
    let registry = &state.registry;
    match command {
        ClientMessage::CreateSession {
            name,
            cwd,
            tab_id,
            rows,
            cols,
            startup,
            correlation_id,
        } => {
            let correlation = correlation_id.clone();
            let req = CreateSessionRequest {
                name,
                cwd,
                tab_id,
                rows,
                cols,
                startup,
                correlation_id,
            };
            match registry.create_session(req) {
                Ok(_) => None,
                Err(e) => Some(ServerMessage::error_correlated(
                    error_code(&e),
                    e.to_string(),
                    correlation,
                )),
            }
        }

        ClientMessage::DestroySession { id, forced, reason } => {
            let authority = match DestroyAuthority::from_command(forced, reason) {
                Ok(authority) => authority,
                Err(e) => {
                    return Some(ServerMessage::error(
                        "unauthorized_destroy",
                        e.to_string(),
                        Some(id),
                    ))
                }
            };
            match registry.destroy_session(&id, &authority) {
                Ok(_) => None,
                Err(e) => Some(op_error(e, id)),
            }
        }

        ClientMessage::SendInput { id, data } => {
            match registry.send_input(&id, bytes::Bytes::from(data)).await {
                Ok(()) => None,
                Err(e) => Some(op_error(e, id)),
            }
        }

        ClientMessage::ResizeSession { id, rows, cols } => {
            match registry.resize_session(&id, rows, cols) {
                Ok(_) => None,
                Err(e) => Some(op_error(e, id)),
            }
        }

        ClientMessage::AttachSession { id } => {
            // Re-attaching replaces the previous stream instead of
            // stacking a second one.
            if let Some(previous) = attachments.remove(&id) {
                previous.cancel();
            }
            match registry.attach(&id) {
                Ok((meta, attachment)) => {
                    let token = CancellationToken::new();
                    attachments.insert(id.clone(), token.clone());
                    spawn_output_forwarder(
                        id.clone(),
                        attachment.output,
                        attachment.guard,
                        token,
                        out_tx.clone(),
                    );
                    Some(ServerMessage::Attached {
                        id,
                        snapshot: attachment.snapshot,
                        rows: meta.rows,
                        cols: meta.cols,
                    })
                }
                Err(e) => Some(op_error(e, id)),
            }
        }

        ClientMessage::DetachSession { id } => {
            if let Some(token) = attachments.remove(&id) {
                token.cancel();
            }
            Some(ServerMessage::Detached { id })
        }

        ClientMessage::RenameSession { id, name } => {
            match registry.rename_session(&id, &name) {
                Ok(_) => None,
                Err(e) => Some(op_error(e, id)),
            }
        }

        ClientMessage::AssignTab {
            id,
            tab_id,
            position,
        } => match registry.assign_tab(&id, tab_id, position) {
            Ok(_) => None,
            Err(e) => Some(op_error(e, id)),
        },

        ClientMessage::ClearBuffer { id } => match registry.clear_buffer(&id) {
            Ok(()) => None,
            Err(e) => Some(op_error(e, id)),
        },

        ClientMessage::KillAgent { id } => match registry.kill_agent(&id).await {
            Ok(pid) => Some(ServerMessage::AgentKilled { id, pid }),
            Err(e) => Some(op_error(e, id)),
        },

        ClientMessage::ClaimStartup { id } => {
            if registry.get(&id).is_none() {
                return Some(ServerMessage::error(
                    "not_found",
                    format!("session not found: {id}"),
                    Some(id),
                ));
            }
            let startup = registry.take_startup(&id);
            Some(ServerMessage::Startup { id, startup })
        }

        ClientMessage::CreateTab {
            name,
            default_cwd,
            correlation_id,
        } => {
            registry.create_tab(&name, default_cwd, correlation_id);
            None
        }

        ClientMessage::UpdateTab {
            id,
            name,
            default_cwd,
        } => match registry.update_tab(&id, name, default_cwd) {
            Ok(_) => None,
            Err(e) => Some(op_error(e, id)),
        },

        ClientMessage::DeleteTab { id } => match registry.delete_tab(&id) {
            Ok(_) => None,
            Err(e) => Some(op_error(e, id)),
        },

        ClientMessage::ReorderTab { id, position } => {
            match registry.reorder_tab(&id, position) {
                Ok(_) => None,
                Err(e) => Some(op_error(e, id)),
            }
        }
    }
}

/// Pump one session's output broadcast into the connection's outbound
/// queue until the viewer detaches or the connection closes. Holds the
/// session's client-count guard for exactly that long.
fn spawn_output_forwarder(
    id: String,
    mut output: broadcast::Receiver<bytes::Bytes>,
    guard: crate::session::ClientGuard,
    token: CancellationToken,
    out_tx: mpsc::Sender<ServerMessage>,
) {
    tokio::spawn(async move {
        let _guard = guard;
        loop {
            tokio::select! {
                chunk = output.recv() => {
                    match chunk {
                        Ok(data) => {
                            let msg = ServerMessage::SessionOutput {
                                id: id.clone(),
                                data: data.to_vec(),
                            };
                            if out_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(session = %id, missed = n, "viewer lagged, output dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = token.cancelled() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    fn test_state(dir: &std::path::Path) -> AppState {
        let config = Config {
            worktrees_root: dir.join("worktrees"),
            state_dir: dir.join("state"),
            shell: Some("/bin/sh".into()),
            ..Config::default()
        };
        AppState::new(Registry::new(config, None), CancellationToken::new())
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ws_route_requires_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let response = app
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        // A plain GET without upgrade headers is rejected by the extractor.
        assert_ne!(response.status(), StatusCode::OK);
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(error_code(&RegistryError::NotFound("x".into())), "not_found");
        assert_eq!(
            error_code(&RegistryError::Unauthorized(
                crate::guard::GuardError::UnauthorizedDestroy
            )),
            "unauthorized_destroy"
        );
        assert_eq!(error_code(&RegistryError::MaxSessionsReached), "max_sessions");
    }

    #[test]
    fn connection_cap_is_enforced() {
        let manager = ConnectionManager::new(2);
        let (tx, _rx) = mpsc::channel(1);
        let first = manager.register(tx.clone()).expect("first admitted");
        let _second = manager.register(tx.clone()).expect("second admitted");
        assert!(manager.register(tx.clone()).is_none(), "third is over capacity");
        assert_eq!(manager.active(), 2);

        drop(first);
        assert_eq!(manager.active(), 1);
        assert!(manager.register(tx).is_some(), "guard drop frees the slot");
    }

    #[test]
    fn stale_error_becomes_dedicated_event() {
        let msg = op_error(RegistryError::EntityStale("sess-1".into()), "sess-1".into());
        assert!(matches!(msg, ServerMessage::EntityStale { ref id } if id == "sess-1"));

        let msg = op_error(RegistryError::NotFound("sess-2".into()), "sess-2".into());
        assert!(matches!(msg, ServerMessage::Error { ref code, .. } if code == "not_found"));
    }

    #[tokio::test]
    async fn event_message_computes_task_scope() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let worktree = state.registry.config().worktrees_root.join("task-1");
        std::fs::create_dir_all(&worktree).unwrap();

        let meta = state
            .registry
            .create_session(CreateSessionRequest {
                cwd: Some(worktree),
                ..Default::default()
            })
            .unwrap();

        let msg = event_message(
            &state.registry,
            RegistryEvent::SessionCreated {
                meta: meta.clone(),
                correlation_id: Some("tmp-9".into()),
            },
        );
        match msg {
            ServerMessage::SessionCreated {
                session,
                correlation_id,
            } => {
                assert!(session.task_scoped);
                assert_eq!(correlation_id.as_deref(), Some("tmp-9"));
            }
            other => panic!("expected SessionCreated, got: {other:?}"),
        }

        state
            .registry
            .destroy_session(&meta.id, &DestroyAuthority::UserForced { reason: None })
            .unwrap();
    }
}
