//! WebSocket protocol for agentmux client/server communication.
//!
//! Every frame is a JSON object tagged by `type`. Raw terminal bytes
//! (input, output, scrollback snapshots) are base64-encoded strings so
//! the whole protocol stays valid JSON.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::registry::{SessionMeta, StartupDescriptor, Tab};

/// A session as clients see it: the catalogue record plus the computed
/// task-scope flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub meta: SessionMeta,
    /// True when the session has no tab and lives under the worktrees
    /// root. Recomputed by the server on every message that carries it.
    pub task_scoped: bool,
}

/// Client → Server commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    CreateSession {
        name: Option<String>,
        cwd: Option<PathBuf>,
        tab_id: Option<String>,
        rows: Option<u16>,
        cols: Option<u16>,
        startup: Option<StartupDescriptor>,
        correlation_id: Option<String>,
    },
    /// Destroy is refused unless `forced` is set; there is no unforced
    /// variant of this command.
    DestroySession {
        id: String,
        #[serde(default)]
        forced: bool,
        reason: Option<String>,
    },
    SendInput {
        id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    ResizeSession {
        id: String,
        rows: u16,
        cols: u16,
    },
    AttachSession {
        id: String,
    },
    DetachSession {
        id: String,
    },
    RenameSession {
        id: String,
        name: String,
    },
    AssignTab {
        id: String,
        tab_id: Option<String>,
        position: Option<u32>,
    },
    ClearBuffer {
        id: String,
    },
    KillAgent {
        id: String,
    },
    /// Claim the session's one-shot startup descriptor. Only the first
    /// claim across all clients gets it.
    ClaimStartup {
        id: String,
    },
    CreateTab {
        name: String,
        default_cwd: Option<PathBuf>,
        correlation_id: Option<String>,
    },
    UpdateTab {
        id: String,
        name: Option<String>,
        default_cwd: Option<PathBuf>,
    },
    DeleteTab {
        id: String,
    },
    ReorderTab {
        id: String,
        position: u32,
    },
}

/// Server → Client events and replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full catalogue state, sent once when a connection opens.
    Snapshot {
        sessions: Vec<SessionView>,
        tabs: Vec<Tab>,
    },
    SessionCreated {
        session: SessionView,
        correlation_id: Option<String>,
    },
    SessionDestroyed {
        id: String,
        cause: String,
        reason: Option<String>,
    },
    SessionExited {
        id: String,
        exit_code: Option<i32>,
    },
    SessionOutput {
        id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    SessionResized {
        id: String,
        rows: u16,
        cols: u16,
    },
    SessionRenamed {
        id: String,
        name: String,
    },
    SessionTabChanged {
        id: String,
        tab_id: Option<String>,
        position: u32,
    },
    BufferCleared {
        id: String,
    },
    /// Reply to `attach_session`: the scrollback accumulated so far.
    /// Output produced after this point arrives as `session_output`.
    Attached {
        id: String,
        #[serde(with = "base64_bytes")]
        snapshot: Vec<u8>,
        rows: u16,
        cols: u16,
    },
    Detached {
        id: String,
    },
    AgentKilled {
        id: String,
        pid: Option<u32>,
    },
    /// Reply to `claim_startup`. `startup` is `None` when another client
    /// already claimed it (or the session never had one).
    Startup {
        id: String,
        startup: Option<StartupDescriptor>,
    },
    TabCreated {
        tab: Tab,
        correlation_id: Option<String>,
    },
    TabUpdated {
        tab: Tab,
    },
    TabDeleted {
        id: String,
    },
    TabReordered {
        tabs: Vec<Tab>,
    },
    /// A command targeted an entity that a concurrent operation already
    /// deleted. Reported explicitly so the sender can reconcile instead
    /// of waiting for a reply that will never come.
    EntityStale {
        id: String,
    },
    Error {
        code: String,
        message: String,
        /// Entity the failed command referred to, when there was one.
        id: Option<String>,
        /// Echo of the failed command's correlation token, when it
        /// carried one. Lets clients roll back the matching placeholder.
        correlation_id: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>, id: Option<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
            id,
            correlation_id: None,
        }
    }

    pub fn error_correlated(
        code: &str,
        message: impl Into<String>,
        correlation_id: Option<String>,
    ) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
            id: None,
            correlation_id,
        }
    }
}

/// Serde helper for base64-encoded byte vectors in JSON.
pub mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionStatus;

    fn sample_meta() -> SessionMeta {
        SessionMeta {
            id: "sess-1".into(),
            name: "build".into(),
            cwd: "/tmp".into(),
            rows: 24,
            cols: 80,
            status: SessionStatus::Running,
            exit_code: None,
            created_at: 1_700_000_000,
            tab_id: None,
            position: 0,
        }
    }

    #[test]
    fn client_messages_are_snake_case_tagged() {
        let msg = ClientMessage::CreateSession {
            name: Some("build".into()),
            cwd: Some("/tmp".into()),
            tab_id: None,
            rows: Some(24),
            cols: Some(80),
            startup: None,
            correlation_id: Some("tmp-1".into()),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "create_session");
        assert_eq!(json["correlation_id"], "tmp-1");

        let back: ClientMessage = serde_json::from_value(json).unwrap();
        assert!(matches!(back, ClientMessage::CreateSession { .. }));
    }

    #[test]
    fn destroy_defaults_to_unforced() {
        let raw = r#"{"type":"destroy_session","id":"sess-1","reason":null}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::DestroySession { forced, .. } => assert!(!forced),
            other => panic!("expected DestroySession, got: {other:?}"),
        }
    }

    #[test]
    fn send_input_data_is_base64() {
        let msg = ClientMessage::SendInput {
            id: "sess-1".into(),
            data: b"ls -la\n".to_vec(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["data"], "bHMgLWxhCg==");

        let back: ClientMessage = serde_json::from_value(json).unwrap();
        match back {
            ClientMessage::SendInput { data, .. } => assert_eq!(data, b"ls -la\n"),
            other => panic!("expected SendInput, got: {other:?}"),
        }
    }

    #[test]
    fn session_view_flattens_meta() {
        let view = SessionView {
            meta: sample_meta(),
            task_scoped: true,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["id"], "sess-1");
        assert_eq!(json["status"], "running");
        assert_eq!(json["task_scoped"], true);

        let back: SessionView = serde_json::from_value(json).unwrap();
        assert_eq!(back.meta.id, "sess-1");
        assert!(back.task_scoped);
    }

    #[test]
    fn server_snapshot_roundtrip() {
        let msg = ServerMessage::Snapshot {
            sessions: vec![SessionView {
                meta: sample_meta(),
                task_scoped: false,
            }],
            tabs: vec![Tab {
                id: "tab-1".into(),
                name: "main".into(),
                position: 0,
                default_cwd: Some("/work".into()),
            }],
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        match back {
            ServerMessage::Snapshot { sessions, tabs } => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(tabs[0].name, "main");
            }
            other => panic!("expected Snapshot, got: {other:?}"),
        }
    }

    #[test]
    fn attached_snapshot_is_base64() {
        let msg = ServerMessage::Attached {
            id: "sess-1".into(),
            snapshot: b"$ echo hi\nhi\n".to_vec(),
            rows: 24,
            cols: 80,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "attached");
        assert!(json["snapshot"].is_string());

        let back: ServerMessage = serde_json::from_value(json).unwrap();
        match back {
            ServerMessage::Attached { snapshot, .. } => {
                assert_eq!(snapshot, b"$ echo hi\nhi\n")
            }
            other => panic!("expected Attached, got: {other:?}"),
        }
    }

    #[test]
    fn error_helper_sets_fields() {
        let msg = ServerMessage::error("not_found", "no such session", Some("sess-9".into()));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "not_found");
        assert_eq!(json["id"], "sess-9");
        assert!(json["correlation_id"].is_null());
    }

    #[test]
    fn stale_entity_has_dedicated_event() {
        let msg = ServerMessage::EntityStale { id: "sess-9".into() };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "entity_stale");
        assert_eq!(json["id"], "sess-9");
    }

    #[test]
    fn correlated_error_echoes_token() {
        let msg = ServerMessage::error_correlated("spawn_failed", "no such shell", Some("tmp-3".into()));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["correlation_id"], "tmp-3");
        assert!(json["id"].is_null());
    }

    #[test]
    fn unknown_message_type_fails() {
        let raw = r#"{"type":"open_portal","id":"x"}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn startup_descriptor_roundtrip() {
        let msg = ClientMessage::CreateSession {
            name: None,
            cwd: None,
            tab_id: None,
            rows: None,
            cols: None,
            startup: Some(StartupDescriptor {
                setup_script: Some("make setup".into()),
                agent_mode: Some("auto".into()),
                agent_context: None,
                task_name: Some("task-42".into()),
            }),
            correlation_id: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        match back {
            ClientMessage::CreateSession { startup: Some(s), .. } => {
                assert_eq!(s.setup_script.as_deref(), Some("make setup"));
                assert_eq!(s.task_name.as_deref(), Some("task-42"));
            }
            other => panic!("expected CreateSession with startup, got: {other:?}"),
        }
    }
}
