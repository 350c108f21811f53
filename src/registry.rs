//! Session and tab catalogue plus lifecycle coordination.
//!
//! The registry is the single authority for which sessions and tabs
//! exist. Every mutation updates the maps and emits its lifecycle event
//! under the same write lock, so subscribers always observe events in
//! the order the registry applied them. A catalogue snapshot is queued
//! for the durability writer before the lock is released.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::{cwd_under_worktrees, Config};
use crate::guard::{CascadeOrigin, DestroyAuthority, GuardError};
use crate::persist::Catalogue;
use crate::pty::{PtyError, SpawnCommand};
use crate::session::{validate_session_name, Attachment, Session};

/// Session lifecycle status as recorded in the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Exited,
    Error,
}

/// Durable description of one session. Everything here survives a
/// restart; the live PTY does not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub name: String,
    pub cwd: PathBuf,
    pub rows: u16,
    pub cols: u16,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
    /// Unix timestamp (seconds) of creation.
    pub created_at: u64,
    /// Owning tab, or `None` for a detached session.
    pub tab_id: Option<String>,
    /// Ordering among siblings (same tab, or among detached sessions).
    pub position: u32,
}

/// A named container grouping sessions in the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tab {
    pub id: String,
    pub name: String,
    pub position: u32,
    /// Directory new sessions in this tab start in when the request
    /// doesn't name one.
    pub default_cwd: Option<PathBuf>,
}

/// One-shot bootstrap data attached to a session at creation and
/// consumed exactly once by the first client that claims it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartupDescriptor {
    pub setup_script: Option<String>,
    pub agent_mode: Option<String>,
    pub agent_context: Option<String>,
    pub task_name: Option<String>,
}

/// Parameters for creating a session.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionRequest {
    pub name: Option<String>,
    pub cwd: Option<PathBuf>,
    pub tab_id: Option<String>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    pub startup: Option<StartupDescriptor>,
    /// Client-chosen id echoed back in the created event so optimistic
    /// UI entries can be reconciled with the server-assigned id.
    pub correlation_id: Option<String>,
}

/// Registry lifecycle events, emitted under the registry write lock.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    SessionCreated {
        meta: SessionMeta,
        correlation_id: Option<String>,
    },
    SessionDestroyed {
        meta: SessionMeta,
        cause: String,
        reason: Option<String>,
    },
    SessionExited {
        id: String,
        exit_code: Option<i32>,
    },
    SessionRenamed {
        id: String,
        name: String,
    },
    SessionResized {
        id: String,
        rows: u16,
        cols: u16,
    },
    SessionTabChanged {
        id: String,
        tab_id: Option<String>,
        position: u32,
    },
    BufferCleared {
        id: String,
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
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("tab not found: {0}")]
    TabNotFound(String),
    #[error("entity was deleted: {0}")]
    EntityStale(String),
    #[error("invalid session name: {0}")]
    InvalidName(String),
    #[error("maximum number of sessions reached")]
    MaxSessionsReached,
    #[error("session has no live process: {0}")]
    NotRunning(String),
    #[error("session viewer limit reached: {0}")]
    ClientLimit(String),
    #[error(transparent)]
    Unauthorized(#[from] GuardError),
    #[error("failed to spawn session: {0}")]
    Spawn(#[from] PtyError),
}

struct SessionEntry {
    meta: SessionMeta,
    /// Live runtime, present while the server that spawned the shell is
    /// still the one running. Sessions restored from the catalogue have
    /// no runtime.
    runtime: Option<Session>,
}

struct RegistryInner {
    sessions: HashMap<String, SessionEntry>,
    tabs: HashMap<String, Tab>,
    startup: HashMap<String, StartupDescriptor>,
    /// Ids of sessions and tabs that existed and were deleted. Lets
    /// operations on a concurrently-deleted entity fail with
    /// `EntityStale` instead of a misleading `NotFound`.
    tombstones: HashSet<String>,
}

/// Shared handle to the registry. Clones are cheap.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<RegistryInner>>,
    events_tx: broadcast::Sender<RegistryEvent>,
    config: Arc<Config>,
    persist_tx: Option<mpsc::UnboundedSender<Catalogue>>,
}

impl Registry {
    /// Each session costs ~2 fds (PTY pair) + 3 blocking threads. 256
    /// leaves headroom below tokio's default blocking pool of 512.
    const MAX_SESSIONS: usize = 256;

    pub fn new(config: Config, persist_tx: Option<mpsc::UnboundedSender<Catalogue>>) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                tabs: HashMap::new(),
                startup: HashMap::new(),
                tombstones: HashSet::new(),
            })),
            events_tx,
            config: Arc::new(config),
            persist_tx,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events_tx.subscribe()
    }

    fn catalogue_of(inner: &RegistryInner) -> Catalogue {
        let mut sessions: Vec<SessionMeta> =
            inner.sessions.values().map(|e| e.meta.clone()).collect();
        sessions.sort_by(|a, b| {
            (&a.tab_id, a.position, a.created_at, &a.id)
                .cmp(&(&b.tab_id, b.position, b.created_at, &b.id))
        });
        let mut tabs: Vec<Tab> = inner.tabs.values().cloned().collect();
        tabs.sort_by_key(|t| (t.position, t.id.clone()));
        Catalogue { sessions, tabs }
    }

    fn persist_locked(&self, inner: &RegistryInner) {
        if let Some(tx) = &self.persist_tx {
            let _ = tx.send(Self::catalogue_of(inner));
        }
    }

    /// Full catalogue view, sorted for display.
    pub fn snapshot(&self) -> Catalogue {
        Self::catalogue_of(&self.inner.read())
    }

    pub fn get(&self, id: &str) -> Option<SessionMeta> {
        self.inner.read().sessions.get(id).map(|e| e.meta.clone())
    }

    pub fn get_tab(&self, id: &str) -> Option<Tab> {
        self.inner.read().tabs.get(id).cloned()
    }

    fn runtime(&self, id: &str) -> Result<Session, RegistryError> {
        let inner = self.inner.read();
        let entry = inner
            .sessions
            .get(id)
            .ok_or_else(|| self.missing(&inner, id))?;
        entry
            .runtime
            .clone()
            .ok_or_else(|| RegistryError::NotRunning(id.to_string()))
    }

    fn missing(&self, inner: &RegistryInner, id: &str) -> RegistryError {
        if inner.tombstones.contains(id) {
            RegistryError::EntityStale(id.to_string())
        } else {
            RegistryError::NotFound(id.to_string())
        }
    }

    /// Task-scoped means structurally: no owning tab and a cwd under the
    /// worktrees root. Computed per call, never cached, so it stays
    /// correct across tab assignment and worktree deletion.
    pub fn is_task_scoped(&self, meta: &SessionMeta) -> bool {
        meta.tab_id.is_none() && cwd_under_worktrees(&self.config.worktrees_root, &meta.cwd)
    }

    fn next_position(inner: &RegistryInner, tab_id: &Option<String>) -> u32 {
        inner
            .sessions
            .values()
            .filter(|e| &e.meta.tab_id == tab_id)
            .count() as u32
    }

    fn now_unix() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Create a session: spawn the shell, then register it atomically.
    ///
    /// The tab pre-check happens before the expensive fork/exec; the
    /// authoritative check repeats under the write lock, since the tab
    /// can be deleted while the shell is spawning. Losing that race
    /// costs one immediately-reaped spawn, nothing else.
    pub fn create_session(
        &self,
        req: CreateSessionRequest,
    ) -> Result<SessionMeta, RegistryError> {
        if let Some(name) = &req.name {
            validate_session_name(name).map_err(RegistryError::InvalidName)?;
        }

        let cwd = {
            let inner = self.inner.read();
            if inner.sessions.len() >= Self::MAX_SESSIONS {
                return Err(RegistryError::MaxSessionsReached);
            }
            let tab_default = match &req.tab_id {
                Some(tab_id) => {
                    let tab = inner
                        .tabs
                        .get(tab_id)
                        .ok_or_else(|| self.missing_tab(&inner, tab_id))?;
                    tab.default_cwd.clone()
                }
                None => None,
            };
            req.cwd
                .clone()
                .or(tab_default)
                .or_else(dirs::home_dir)
                .unwrap_or_else(std::env::temp_dir)
        };

        let id = uuid::Uuid::new_v4().to_string();
        let rows = req.rows.unwrap_or(24);
        let cols = req.cols.unwrap_or(80);
        let command = SpawnCommand {
            shell: self.config.shell.clone(),
            startup_line: req
                .startup
                .as_ref()
                .and_then(|s| s.setup_script.clone()),
        };
        let spawned = Session::spawn(
            id.clone(),
            &command,
            &cwd,
            rows,
            cols,
            self.config.scrollback_bytes,
        )?;

        let name = req.name.clone().unwrap_or_else(|| {
            cwd.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "shell".to_string())
        });

        let meta = {
            let mut inner = self.inner.write();
            if let Some(tab_id) = &req.tab_id {
                if !inner.tabs.contains_key(tab_id) {
                    let err = self.missing_tab(&inner, tab_id);
                    drop(inner);
                    spawned.session.abort_unregistered();
                    return Err(err);
                }
            }
            let meta = SessionMeta {
                id: id.clone(),
                name,
                cwd,
                rows,
                cols,
                status: SessionStatus::Running,
                exit_code: None,
                created_at: Self::now_unix(),
                tab_id: req.tab_id.clone(),
                position: Self::next_position(&inner, &req.tab_id),
            };
            if let Some(startup) = req.startup {
                inner.startup.insert(id.clone(), startup);
            }
            inner.sessions.insert(
                id.clone(),
                SessionEntry {
                    meta: meta.clone(),
                    runtime: Some(spawned.session),
                },
            );
            let _ = self.events_tx.send(RegistryEvent::SessionCreated {
                meta: meta.clone(),
                correlation_id: req.correlation_id,
            });
            self.persist_locked(&inner);
            meta
        };

        self.monitor_child_exit(id, spawned.child_exit_rx);
        Ok(meta)
    }

    fn missing_tab(&self, inner: &RegistryInner, id: &str) -> RegistryError {
        if inner.tombstones.contains(id) {
            RegistryError::EntityStale(id.to_string())
        } else {
            RegistryError::TabNotFound(id.to_string())
        }
    }

    /// Watch for the shell's exit and flip the session to `Exited`.
    ///
    /// The session stays in the catalogue with its scrollback intact;
    /// only an authorized destroy removes it. Ids are never reused, so
    /// the lookup by id cannot hit a successor entry.
    fn monitor_child_exit(&self, id: String, child_exit_rx: oneshot::Receiver<Option<i32>>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let exit_code = child_exit_rx.await.unwrap_or(None);
            let mut inner = registry.inner.write();
            match inner.sessions.get_mut(&id) {
                Some(entry) if entry.meta.status == SessionStatus::Running => {
                    tracing::info!(session = %id, ?exit_code, "session shell exited");
                    entry.meta.status = SessionStatus::Exited;
                    entry.meta.exit_code = exit_code;
                    let _ = registry.events_tx.send(RegistryEvent::SessionExited {
                        id: id.clone(),
                        exit_code,
                    });
                    registry.persist_locked(&inner);
                }
                Some(_) => {}
                None => {
                    tracing::debug!(session = %id, "shell exited after session removal");
                }
            }
        });
    }

    /// Destroy a session under the given authority.
    ///
    /// The only ways to obtain a [`DestroyAuthority`] are the forced
    /// protocol command and the internal cascades, so reaching this
    /// method already implies authorization. The entry, its startup
    /// descriptor, and its event are handled under one write lock; the
    /// process tree is killed after the lock drops.
    pub fn destroy_session(
        &self,
        id: &str,
        authority: &DestroyAuthority,
    ) -> Result<SessionMeta, RegistryError> {
        let (meta, runtime) = {
            let mut inner = self.inner.write();
            let entry = match inner.sessions.remove(id) {
                Some(entry) => entry,
                None => return Err(self.missing(&inner, id)),
            };
            inner.startup.remove(id);
            inner.tombstones.insert(id.to_string());
            let _ = self.events_tx.send(RegistryEvent::SessionDestroyed {
                meta: entry.meta.clone(),
                cause: authority.label().to_string(),
                reason: authority.reason().map(|r| r.to_string()),
            });
            self.persist_locked(&inner);
            (entry.meta, entry.runtime)
        };
        if let Some(runtime) = runtime {
            runtime.cancelled.cancel();
            runtime.kill_tree();
        }
        tracing::info!(session = %id, cause = authority.label(), "session destroyed");
        Ok(meta)
    }

    /// Attach a viewer to a session, returning its metadata alongside
    /// the scrollback snapshot and live subscription.
    pub fn attach(&self, id: &str) -> Result<(SessionMeta, Attachment), RegistryError> {
        let inner = self.inner.read();
        let entry = inner
            .sessions
            .get(id)
            .ok_or_else(|| self.missing(&inner, id))?;
        let runtime = entry
            .runtime
            .as_ref()
            .ok_or_else(|| RegistryError::NotRunning(id.to_string()))?;
        let attachment = runtime
            .attach()
            .ok_or_else(|| RegistryError::ClientLimit(id.to_string()))?;
        Ok((entry.meta.clone(), attachment))
    }

    pub async fn send_input(&self, id: &str, data: Bytes) -> Result<(), RegistryError> {
        let runtime = self.runtime(id)?;
        if !runtime.write_input(data).await {
            tracing::debug!(session = %id, "input dropped, writer gone");
        }
        Ok(())
    }

    pub fn resize_session(
        &self,
        id: &str,
        rows: u16,
        cols: u16,
    ) -> Result<SessionMeta, RegistryError> {
        let mut inner = self.inner.write();
        let entry = match inner.sessions.get_mut(id) {
            Some(entry) => entry,
            None => return Err(self.missing(&inner, id)),
        };
        if let Some(runtime) = &entry.runtime {
            runtime.resize(rows, cols)?;
        }
        entry.meta.rows = rows;
        entry.meta.cols = cols;
        let meta = entry.meta.clone();
        let _ = self.events_tx.send(RegistryEvent::SessionResized {
            id: id.to_string(),
            rows,
            cols,
        });
        self.persist_locked(&inner);
        Ok(meta)
    }

    pub fn rename_session(&self, id: &str, name: &str) -> Result<SessionMeta, RegistryError> {
        validate_session_name(name).map_err(RegistryError::InvalidName)?;
        let mut inner = self.inner.write();
        let entry = match inner.sessions.get_mut(id) {
            Some(entry) => entry,
            None => return Err(self.missing(&inner, id)),
        };
        entry.meta.name = name.to_string();
        let meta = entry.meta.clone();
        let _ = self.events_tx.send(RegistryEvent::SessionRenamed {
            id: id.to_string(),
            name: name.to_string(),
        });
        self.persist_locked(&inner);
        Ok(meta)
    }

    /// Move a session into a tab (or detach it with `None`). Position
    /// defaults to the end of the target group.
    pub fn assign_tab(
        &self,
        id: &str,
        tab_id: Option<String>,
        position: Option<u32>,
    ) -> Result<SessionMeta, RegistryError> {
        let mut inner = self.inner.write();
        if let Some(tab_id) = &tab_id {
            if !inner.tabs.contains_key(tab_id) {
                return Err(self.missing_tab(&inner, tab_id));
            }
        }
        if !inner.sessions.contains_key(id) {
            return Err(self.missing(&inner, id));
        }
        let position = position.unwrap_or_else(|| Self::next_position(&inner, &tab_id));
        let entry = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        entry.meta.tab_id = tab_id.clone();
        entry.meta.position = position;
        let meta = entry.meta.clone();
        let _ = self.events_tx.send(RegistryEvent::SessionTabChanged {
            id: id.to_string(),
            tab_id,
            position,
        });
        self.persist_locked(&inner);
        Ok(meta)
    }

    /// Empty the session's scrollback ring. Live subscribers keep their
    /// stream; only late joiners see the cleared history.
    pub fn clear_buffer(&self, id: &str) -> Result<(), RegistryError> {
        let inner = self.inner.read();
        let entry = inner
            .sessions
            .get(id)
            .ok_or_else(|| self.missing(&inner, id))?;
        let runtime = entry
            .runtime
            .as_ref()
            .ok_or_else(|| RegistryError::NotRunning(id.to_string()))?;
        runtime.hub.clear();
        let _ = self
            .events_tx
            .send(RegistryEvent::BufferCleared { id: id.to_string() });
        Ok(())
    }

    /// Kill the identifiable foreground agent inside the session's
    /// process tree, leaving the shell alive. Returns the agent PID if
    /// one was found.
    pub async fn kill_agent(&self, id: &str) -> Result<Option<u32>, RegistryError> {
        let runtime = self.runtime(id)?;
        let _op = runtime.op_lock.lock().await;
        let names = self.config.agent_process_names.clone();
        Ok(runtime.kill_agent(&names))
    }

    /// Hand out the session's startup descriptor, exactly once. The
    /// second and later claims get `None` no matter which client asks.
    pub fn take_startup(&self, id: &str) -> Option<StartupDescriptor> {
        self.inner.write().startup.remove(id)
    }

    // ---- tabs ----

    pub fn create_tab(
        &self,
        name: &str,
        default_cwd: Option<PathBuf>,
        correlation_id: Option<String>,
    ) -> Tab {
        let mut inner = self.inner.write();
        let tab = Tab {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            position: inner.tabs.len() as u32,
            default_cwd,
        };
        inner.tabs.insert(tab.id.clone(), tab.clone());
        let _ = self.events_tx.send(RegistryEvent::TabCreated {
            tab: tab.clone(),
            correlation_id,
        });
        self.persist_locked(&inner);
        tab
    }

    pub fn update_tab(
        &self,
        id: &str,
        name: Option<String>,
        default_cwd: Option<PathBuf>,
    ) -> Result<Tab, RegistryError> {
        let mut inner = self.inner.write();
        if !inner.tabs.contains_key(id) {
            return Err(self.missing_tab(&inner, id));
        }
        let tab = inner
            .tabs
            .get_mut(id)
            .ok_or_else(|| RegistryError::TabNotFound(id.to_string()))?;
        if let Some(name) = name {
            tab.name = name;
        }
        if let Some(cwd) = default_cwd {
            tab.default_cwd = Some(cwd);
        }
        let tab = tab.clone();
        let _ = self.events_tx.send(RegistryEvent::TabUpdated { tab: tab.clone() });
        self.persist_locked(&inner);
        Ok(tab)
    }

    /// Delete a tab and everything it contains.
    ///
    /// Cascade order is fixed: every contained session is destroyed
    /// first (each emitting its own destroyed event), then the tab
    /// record is removed and the tab-deleted event fires. A subscriber
    /// never sees a tab disappear while its sessions still exist.
    pub fn delete_tab(&self, id: &str) -> Result<Tab, RegistryError> {
        let contained: Vec<String> = {
            let inner = self.inner.read();
            if !inner.tabs.contains_key(id) {
                return Err(self.missing_tab(&inner, id));
            }
            inner
                .sessions
                .values()
                .filter(|e| e.meta.tab_id.as_deref() == Some(id))
                .map(|e| e.meta.id.clone())
                .collect()
        };

        let authority = DestroyAuthority::Internal(CascadeOrigin::TabDeleted);
        for session_id in contained {
            // A concurrent destroy may have won; that's fine.
            if let Err(e) = self.destroy_session(&session_id, &authority) {
                tracing::debug!(session = %session_id, error = %e, "cascade destroy skipped");
            }
        }

        let mut inner = self.inner.write();
        let tab = match inner.tabs.remove(id) {
            Some(tab) => tab,
            None => return Err(self.missing_tab(&inner, id)),
        };
        inner.tombstones.insert(id.to_string());
        let _ = self
            .events_tx
            .send(RegistryEvent::TabDeleted { id: id.to_string() });
        self.persist_locked(&inner);
        tracing::info!(tab = %id, "tab deleted");
        Ok(tab)
    }

    /// Move a tab to a new index and renumber the rest densely.
    pub fn reorder_tab(&self, id: &str, position: u32) -> Result<Vec<Tab>, RegistryError> {
        let mut inner = self.inner.write();
        if !inner.tabs.contains_key(id) {
            return Err(self.missing_tab(&inner, id));
        }
        let mut ordered: Vec<Tab> = inner.tabs.values().cloned().collect();
        ordered.sort_by_key(|t| (t.position, t.id.clone()));
        let from = ordered
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| RegistryError::TabNotFound(id.to_string()))?;
        let moved = ordered.remove(from);
        let to = (position as usize).min(ordered.len());
        ordered.insert(to, moved);
        for (idx, tab) in ordered.iter_mut().enumerate() {
            tab.position = idx as u32;
            if let Some(stored) = inner.tabs.get_mut(&tab.id) {
                stored.position = idx as u32;
            }
        }
        let _ = self
            .events_tx
            .send(RegistryEvent::TabReordered { tabs: ordered.clone() });
        self.persist_locked(&inner);
        Ok(ordered)
    }

    // ---- cascades and lifecycle ----

    /// The worktree subsystem removed a directory. Destroy every
    /// task-scoped session living under it. Tab-owned sessions under the
    /// same path are left alone; losing a cwd doesn't kill a tab shell.
    pub fn worktree_removed(&self, path: &Path) -> Vec<SessionMeta> {
        let doomed: Vec<String> = {
            let inner = self.inner.read();
            inner
                .sessions
                .values()
                .filter(|e| self.is_task_scoped(&e.meta) && e.meta.cwd.starts_with(path))
                .map(|e| e.meta.id.clone())
                .collect()
        };
        let authority = DestroyAuthority::Internal(CascadeOrigin::WorktreeRemoved);
        let mut destroyed = Vec::new();
        for id in doomed {
            match self.destroy_session(&id, &authority) {
                Ok(meta) => destroyed.push(meta),
                Err(e) => {
                    tracing::debug!(session = %id, error = %e, "worktree cascade skipped")
                }
            }
        }
        destroyed
    }

    /// Rebuild the registry from a persisted catalogue at startup.
    ///
    /// Sessions recorded as running lost their process with the old
    /// server, so they come back as `Error`. No events are emitted; this
    /// runs before any client can subscribe.
    pub fn restore(&self, catalogue: Catalogue) {
        let mut inner = self.inner.write();
        for mut meta in catalogue.sessions {
            if meta.status == SessionStatus::Running {
                meta.status = SessionStatus::Error;
                meta.exit_code = None;
            }
            inner.sessions.insert(
                meta.id.clone(),
                SessionEntry {
                    meta,
                    runtime: None,
                },
            );
        }
        for tab in catalogue.tabs {
            inner.tabs.insert(tab.id.clone(), tab);
        }
        self.persist_locked(&inner);
        tracing::info!(
            sessions = inner.sessions.len(),
            tabs = inner.tabs.len(),
            "catalogue restored"
        );
    }

    /// Server shutdown: SIGHUP every live shell, escalate to a full tree
    /// kill after 3 seconds. Catalogue entries are left untouched so the
    /// next start restores them.
    pub fn drain(&self) -> Option<tokio::task::JoinHandle<()>> {
        let runtimes: Vec<Session> = {
            let inner = self.inner.read();
            inner
                .sessions
                .values()
                .filter_map(|e| e.runtime.clone())
                .collect()
        };
        if runtimes.is_empty() {
            return None;
        }
        for runtime in &runtimes {
            runtime.cancelled.cancel();
            runtime.send_sighup();
        }
        Some(tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
            for runtime in &runtimes {
                runtime.kill_tree();
            }
        }))
    }
}
