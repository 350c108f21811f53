//! Client-side reconciliation of optimistic state.
//!
//! A client renders a session or tab the instant the user asks for one,
//! under a locally generated temporary id, and sends the create command
//! with a correlation token. When the server's confirmation (or error)
//! comes back carrying that token, the placeholder is resolved: every
//! piece of client state keyed by the temporary id moves to the real id
//! in one step. The races this construction closes off:
//!
//! - state split across two keys after confirmation (move, never copy)
//! - the same output sink registered twice for one surface (idempotent
//!   attach returns the existing handle)
//! - an `attached` confirmation arriving before the client registered
//!   its callback (recorded per id, a late registration fires at once)

use std::collections::HashMap;

use crate::protocol::ServerMessage;
use crate::registry::StartupDescriptor;

/// Receives the ordered output bytes for one session.
pub trait OutputSink: Send {
    fn on_output(&mut self, data: &[u8]);
}

impl<F: FnMut(&[u8]) + Send> OutputSink for F {
    fn on_output(&mut self, data: &[u8]) {
        self(data)
    }
}

/// Invoked with the scrollback snapshot when an attach is confirmed.
pub type AttachCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Token for a registered output sink. Returned again, unchanged, if the
/// same target is attached twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetachHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Session,
    Tab,
}

/// Lifecycle of one client-originated entity. Transitions happen only on
/// correlated server events, never on timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileState {
    Pending,
    Confirmed { real_id: String },
    Rejected { code: String },
}

struct Optimistic {
    kind: EntityKind,
    state: ReconcileState,
}

struct SinkEntry {
    handle: DetachHandle,
    sink: Box<dyn OutputSink>,
}

/// Client-held view state for one connection.
///
/// Single-threaded by construction: the owning client applies every
/// server message through [`Reconciler::apply`] in arrival order, which
/// is also the registry's application order.
#[derive(Default)]
pub struct Reconciler {
    entities: HashMap<String, Optimistic>,
    by_correlation: HashMap<String, String>,
    sinks: HashMap<String, SinkEntry>,
    attach_callbacks: HashMap<String, AttachCallback>,
    /// `attached` snapshots that arrived before any callback was
    /// registered for their id.
    unclaimed_attached: HashMap<String, Vec<u8>>,
    startup: HashMap<String, StartupDescriptor>,
    next_temp: u64,
    next_handle: u64,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a temporary id for an optimistic entity.
    pub fn temp_id(&mut self) -> String {
        self.next_temp += 1;
        format!("tmp-{}", self.next_temp)
    }

    /// Record an optimistic session before the create command is sent.
    /// The startup descriptor, if any, rides along under the temporary id
    /// until confirmation rekeys it.
    pub fn begin_session(
        &mut self,
        temp_id: &str,
        correlation_id: &str,
        startup: Option<StartupDescriptor>,
    ) {
        self.begin(temp_id, correlation_id, EntityKind::Session);
        if let Some(startup) = startup {
            self.startup.insert(temp_id.to_string(), startup);
        }
    }

    /// Record an optimistic tab before the create command is sent.
    pub fn begin_tab(&mut self, temp_id: &str, correlation_id: &str) {
        self.begin(temp_id, correlation_id, EntityKind::Tab);
    }

    fn begin(&mut self, temp_id: &str, correlation_id: &str, kind: EntityKind) {
        self.entities.insert(
            temp_id.to_string(),
            Optimistic {
                kind,
                state: ReconcileState::Pending,
            },
        );
        self.by_correlation
            .insert(correlation_id.to_string(), temp_id.to_string());
    }

    /// Current lifecycle state of an optimistic entity.
    pub fn state_of(&self, temp_id: &str) -> Option<&ReconcileState> {
        self.entities.get(temp_id).map(|e| &e.state)
    }

    /// The server-assigned id for a confirmed placeholder.
    pub fn real_id(&self, temp_id: &str) -> Option<&str> {
        match self.state_of(temp_id)? {
            ReconcileState::Confirmed { real_id } => Some(real_id),
            _ => None,
        }
    }

    /// Register an output sink for a session id. Attaching to an id that
    /// already has a sink returns the existing handle and drops the new
    /// sink without registering it.
    pub fn attach_sink(&mut self, id: &str, sink: Box<dyn OutputSink>) -> DetachHandle {
        if let Some(entry) = self.sinks.get(id) {
            return entry.handle;
        }
        self.next_handle += 1;
        let handle = DetachHandle(self.next_handle);
        self.sinks.insert(id.to_string(), SinkEntry { handle, sink });
        handle
    }

    /// Remove the sink the handle refers to, wherever its key moved to.
    /// Detaching an already-detached handle is a no-op.
    pub fn detach_sink(&mut self, handle: DetachHandle) {
        self.sinks.retain(|_, entry| entry.handle != handle);
    }

    pub fn has_sink(&self, id: &str) -> bool {
        self.sinks.contains_key(id)
    }

    /// Register the callback fired when an attach for `id` is confirmed.
    /// If the confirmation already arrived, the callback fires now with
    /// the recorded snapshot.
    pub fn register_attach_callback(&mut self, id: &str, mut callback: AttachCallback) {
        if let Some(snapshot) = self.unclaimed_attached.remove(id) {
            callback(&snapshot);
        }
        self.attach_callbacks.insert(id.to_string(), callback);
    }

    /// Consume the startup descriptor for `id`. The first call gets it;
    /// every later call sees `None`.
    pub fn take_startup(&mut self, id: &str) -> Option<StartupDescriptor> {
        self.startup.remove(id)
    }

    /// Apply one server message in arrival order.
    pub fn apply(&mut self, msg: &ServerMessage) {
        match msg {
            ServerMessage::SessionCreated {
                session,
                correlation_id: Some(correlation),
            } => {
                self.confirm(correlation, &session.meta.id, EntityKind::Session);
            }
            ServerMessage::TabCreated {
                tab,
                correlation_id: Some(correlation),
            } => {
                self.confirm(correlation, &tab.id, EntityKind::Tab);
            }
            ServerMessage::Error {
                code,
                correlation_id: Some(correlation),
                ..
            } => {
                self.reject(correlation, code);
            }
            ServerMessage::Attached { id, snapshot, .. } => {
                match self.attach_callbacks.get_mut(id) {
                    Some(callback) => callback(snapshot),
                    None => {
                        self.unclaimed_attached.insert(id.clone(), snapshot.clone());
                    }
                }
            }
            ServerMessage::SessionOutput { id, data } => {
                if let Some(entry) = self.sinks.get_mut(id) {
                    entry.sink.on_output(data);
                }
            }
            ServerMessage::Startup {
                id,
                startup: Some(startup),
            } => {
                self.startup.insert(id.clone(), startup.clone());
            }
            ServerMessage::SessionDestroyed { id, .. }
            | ServerMessage::TabDeleted { id }
            | ServerMessage::Detached { id }
            | ServerMessage::EntityStale { id } => {
                self.drop_keyed_state(id);
            }
            _ => {}
        }
    }

    /// Resolve a pending placeholder to its real id and move every piece
    /// of keyed state across in one step.
    fn confirm(&mut self, correlation: &str, real_id: &str, kind: EntityKind) {
        let Some(temp_id) = self.by_correlation.remove(correlation) else {
            return;
        };
        let Some(entity) = self.entities.get_mut(&temp_id) else {
            return;
        };
        if entity.kind != kind || entity.state != ReconcileState::Pending {
            return;
        }
        entity.state = ReconcileState::Confirmed {
            real_id: real_id.to_string(),
        };
        self.rekey(&temp_id, real_id);
    }

    /// Roll a pending placeholder back: mark it rejected and drop all the
    /// state that was staged under its temporary id.
    fn reject(&mut self, correlation: &str, code: &str) {
        let Some(temp_id) = self.by_correlation.remove(correlation) else {
            return;
        };
        let Some(entity) = self.entities.get_mut(&temp_id) else {
            return;
        };
        if entity.state != ReconcileState::Pending {
            return;
        }
        entity.state = ReconcileState::Rejected {
            code: code.to_string(),
        };
        self.drop_keyed_state(&temp_id);
    }

    fn rekey(&mut self, from: &str, to: &str) {
        if let Some(entry) = self.sinks.remove(from) {
            self.sinks.insert(to.to_string(), entry);
        }
        if let Some(callback) = self.attach_callbacks.remove(from) {
            self.attach_callbacks.insert(to.to_string(), callback);
        }
        if let Some(snapshot) = self.unclaimed_attached.remove(from) {
            self.unclaimed_attached.insert(to.to_string(), snapshot);
        }
        if let Some(startup) = self.startup.remove(from) {
            self.startup.insert(to.to_string(), startup);
        }
    }

    fn drop_keyed_state(&mut self, id: &str) {
        self.sinks.remove(id);
        self.attach_callbacks.remove(id);
        self.unclaimed_attached.remove(id);
        self.startup.remove(id);
    }
}
