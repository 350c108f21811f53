//! End-to-end tests driving the WebSocket protocol against a live server.
//!
//! Each test binds an ephemeral port, connects with a real WebSocket
//! client, and exercises the command/event flow the way a browser or TUI
//! client would: snapshot on connect, optimistic creation with
//! correlation ids, attach/output streaming, the destroy guard, and the
//! tab-delete cascade.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use agentmux::config::Config;
use agentmux::protocol::{ClientMessage, ServerMessage};
use agentmux::registry::{Registry, StartupDescriptor};
use agentmux::ws::{router, AppState};

async fn start_server(dir: &std::path::Path) -> SocketAddr {
    let config = Config {
        worktrees_root: dir.join("worktrees"),
        state_dir: dir.join("state"),
        shell: Some("/bin/sh".into()),
        ..Config::default()
    };
    let registry = Registry::new(config, None);
    let state = AppState::new(registry, CancellationToken::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    addr
}

struct WsClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        Self { ws }
    }

    async fn send(&mut self, msg: &ClientMessage) {
        let json = serde_json::to_string(msg).unwrap();
        self.ws.send(Message::Text(json.into())).await.unwrap();
    }

    async fn recv(&mut self) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), self.ws.next())
                .await
                .expect("timed out waiting for server message")
                .expect("connection closed")
                .unwrap();
            if let Message::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    /// Read messages until `pred` extracts a value, discarding the rest.
    async fn recv_until<T>(&mut self, mut pred: impl FnMut(ServerMessage) -> Option<T>) -> T {
        loop {
            if let Some(out) = pred(self.recv().await) {
                return out;
            }
        }
    }

    async fn create_session(
        &mut self,
        cwd: &std::path::Path,
        name: &str,
        tab_id: Option<String>,
        startup: Option<StartupDescriptor>,
    ) -> String {
        self.send(&ClientMessage::CreateSession {
            name: Some(name.to_string()),
            cwd: Some(cwd.to_path_buf()),
            tab_id,
            rows: Some(24),
            cols: Some(80),
            startup,
            correlation_id: Some(format!("corr-{name}")),
        })
        .await;
        let expected = format!("corr-{name}");
        self.recv_until(|msg| match msg {
            ServerMessage::SessionCreated {
                session,
                correlation_id,
            } if correlation_id.as_deref() == Some(expected.as_str()) => Some(session.meta.id),
            _ => None,
        })
        .await
    }

    async fn destroy(&mut self, id: &str) {
        self.send(&ClientMessage::DestroySession {
            id: id.to_string(),
            forced: true,
            reason: None,
        })
        .await;
        let id = id.to_string();
        self.recv_until(|msg| match msg {
            ServerMessage::SessionDestroyed { id: got, .. } if got == id => Some(()),
            _ => None,
        })
        .await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_arrives_on_connect() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path()).await;
    let mut client = WsClient::connect(addr).await;

    match client.recv().await {
        ServerMessage::Snapshot { sessions, tabs } => {
            assert!(sessions.is_empty());
            assert!(tabs.is_empty());
        }
        other => panic!("expected snapshot first, got: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn create_attach_and_stream_output() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path()).await;
    let mut client = WsClient::connect(addr).await;
    client.recv().await; // snapshot

    let id = client
        .create_session(dir.path(), "echoer", None, None)
        .await;

    client
        .send(&ClientMessage::AttachSession { id: id.clone() })
        .await;
    let attach_id = id.clone();
    let (rows, cols) = client
        .recv_until(|msg| match msg {
            ServerMessage::Attached {
                id, rows, cols, ..
            } if id == attach_id => Some((rows, cols)),
            _ => None,
        })
        .await;
    assert_eq!((rows, cols), (24, 80));

    client
        .send(&ClientMessage::SendInput {
            id: id.clone(),
            data: b"echo agentmux_marker\n".to_vec(),
        })
        .await;

    let output_id = id.clone();
    let mut seen = Vec::new();
    client
        .recv_until(|msg| match msg {
            ServerMessage::SessionOutput { id, data } if id == output_id => {
                seen.extend_from_slice(&data);
                if String::from_utf8_lossy(&seen).contains("agentmux_marker") {
                    Some(())
                } else {
                    None
                }
            }
            _ => None,
        })
        .await;

    client.destroy(&id).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unforced_destroy_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path()).await;
    let mut client = WsClient::connect(addr).await;
    client.recv().await;

    let id = client
        .create_session(dir.path(), "guarded", None, None)
        .await;

    client
        .send(&ClientMessage::DestroySession {
            id: id.clone(),
            forced: false,
            reason: None,
        })
        .await;
    let code = client
        .recv_until(|msg| match msg {
            ServerMessage::Error { code, .. } => Some(code),
            _ => None,
        })
        .await;
    assert_eq!(code, "unauthorized_destroy");

    // The session is still alive and still destroyable the right way.
    client.destroy(&id).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn tab_delete_cascade_orders_events() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path()).await;
    let mut client = WsClient::connect(addr).await;
    client.recv().await;

    client
        .send(&ClientMessage::CreateTab {
            name: "work".into(),
            default_cwd: None,
            correlation_id: Some("tab-corr".into()),
        })
        .await;
    let tab_id = client
        .recv_until(|msg| match msg {
            ServerMessage::TabCreated {
                tab,
                correlation_id,
            } if correlation_id.as_deref() == Some("tab-corr") => Some(tab.id),
            _ => None,
        })
        .await;

    let session_id = client
        .create_session(dir.path(), "tabbed", Some(tab_id.clone()), None)
        .await;

    client
        .send(&ClientMessage::DeleteTab { id: tab_id.clone() })
        .await;

    // Contained sessions are destroyed strictly before the tab record goes.
    let mut destroyed_at = None;
    let mut order = 0usize;
    client
        .recv_until(|msg| {
            match msg {
                ServerMessage::SessionDestroyed { id, cause, .. } if id == session_id => {
                    assert_eq!(cause, "tab_deleted");
                    destroyed_at = Some(order);
                    order += 1;
                    None
                }
                ServerMessage::TabDeleted { id } if id == tab_id => Some(order),
                _ => None,
            }
        })
        .await;
    assert_eq!(destroyed_at, Some(0), "session_destroyed must precede tab_deleted");
}

#[tokio::test(flavor = "multi_thread")]
async fn startup_descriptor_is_claimed_once() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path()).await;
    let mut first = WsClient::connect(addr).await;
    first.recv().await;

    let id = first
        .create_session(
            dir.path(),
            "agent",
            None,
            Some(StartupDescriptor {
                setup_script: Some("make setup".into()),
                agent_mode: Some("auto".into()),
                agent_context: None,
                task_name: Some("task-7".into()),
            }),
        )
        .await;

    let mut second = WsClient::connect(addr).await;
    second.recv().await;

    first
        .send(&ClientMessage::ClaimStartup { id: id.clone() })
        .await;
    let claimed = first
        .recv_until(|msg| match msg {
            ServerMessage::Startup { startup, .. } => Some(startup),
            _ => None,
        })
        .await;
    assert_eq!(
        claimed.as_ref().and_then(|s| s.task_name.as_deref()),
        Some("task-7")
    );

    second
        .send(&ClientMessage::ClaimStartup { id: id.clone() })
        .await;
    let late = second
        .recv_until(|msg| match msg {
            ServerMessage::Startup { startup, .. } => Some(startup),
            _ => None,
        })
        .await;
    assert!(late.is_none(), "second claim must come back empty");

    first.destroy(&id).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn second_viewer_sees_lifecycle_events() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path()).await;
    let mut first = WsClient::connect(addr).await;
    first.recv().await;

    let id = first
        .create_session(dir.path(), "shared", None, None)
        .await;

    let mut second = WsClient::connect(addr).await;
    match second.recv().await {
        ServerMessage::Snapshot { sessions, .. } => {
            assert!(sessions.iter().any(|s| s.meta.id == id));
        }
        other => panic!("expected snapshot first, got: {other:?}"),
    }

    first
        .send(&ClientMessage::RenameSession {
            id: id.clone(),
            name: "renamed".into(),
        })
        .await;

    let rename_id = id.clone();
    let name = second
        .recv_until(|msg| match msg {
            ServerMessage::SessionRenamed { id, name } if id == rename_id => Some(name),
            _ => None,
        })
        .await;
    assert_eq!(name, "renamed");

    first.destroy(&id).await;
}
