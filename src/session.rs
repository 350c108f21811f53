//! Process Supervisor: one PTY-backed shell per session.
//!
//! A `Session` owns the PTY, the input channel, and the output hub for one
//! shell. The registry holds sessions by id; everything here is runtime
//! state that dies with the process and is never persisted.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::proctree;
use crate::pty::{Pty, PtyError, SpawnCommand};
use crate::scrollback::OutputHub;

/// Validate a session name. Names must be 1-64 chars, alphanumeric/hyphens/underscores/dots.
pub fn validate_session_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("session name must not be empty".into());
    }
    if name.len() > 64 {
        return Err(format!("session name too long ({} chars, max 64)", name.len()));
    }
    if !name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.') {
        return Err(format!(
            "session name contains invalid characters: {}",
            &name[..name.len().min(64)]
        ));
    }
    Ok(())
}

/// Maximum number of concurrent viewers per session.
///
/// Prevents resource exhaustion from too many simultaneous WebSocket
/// connections streaming a single session.
const MAX_CLIENTS_PER_SESSION: usize = 64;

/// RAII guard that decrements the session client count on drop.
pub struct ClientGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Release);
    }
}

/// Runtime half of a session: the live PTY and its I/O plumbing.
///
/// Cloning is cheap; all clones share the same underlying channels and
/// process. Metadata (name, cwd, tab placement, status) lives in the
/// registry, not here.
#[derive(Clone)]
pub struct Session {
    /// Session id, assigned by the registry at creation.
    pub id: String,
    /// PID of the shell spawned in the PTY, if available.
    pub pid: Option<u32>,
    /// Number of currently attached viewers.
    pub client_count: Arc<AtomicUsize>,
    pub input_tx: mpsc::Sender<Bytes>,
    /// Scrollback ring plus live broadcast for this session's output.
    pub hub: OutputHub,
    pub pty: Arc<parking_lot::Mutex<Pty>>,
    /// Fires when this session is destroyed. Streaming loops add this to
    /// their `select!` so they stop immediately rather than operating on
    /// ghost state.
    pub cancelled: CancellationToken,
    /// Set by the child monitor when the shell exits. Checked before
    /// signaling so a recycled PID is never hit.
    pub child_exited: Arc<AtomicBool>,
    /// Serializes process-affecting operations (destroy, agent kill) so
    /// two signal paths never interleave on the same tree.
    pub op_lock: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// A freshly spawned session plus the one-shot child-exit receiver.
///
/// The receiver is consumed exactly once, by the registry at registration
/// time, which wires it to the exit monitor. Carrying it in a separate
/// type makes it impossible to register the same spawn twice.
pub struct SpawnedSession {
    pub session: Session,
    /// Resolves with the child's exit code when the shell terminates.
    /// `None` if the exit status carried no code.
    pub child_exit_rx: oneshot::Receiver<Option<i32>>,
}

/// Everything a viewer needs after attaching: the scrollback snapshot,
/// the live output subscription, and the RAII slot guard.
///
/// Snapshot and subscription are taken atomically from the hub, so a
/// chunk arriving mid-attach shows up in exactly one of the two.
pub struct Attachment {
    pub snapshot: Vec<u8>,
    pub output: tokio::sync::broadcast::Receiver<Bytes>,
    pub guard: ClientGuard,
}

impl Session {
    /// Register a new viewer, returning an RAII guard that decrements the
    /// count when dropped.
    ///
    /// Returns `None` if the session already has [`MAX_CLIENTS_PER_SESSION`]
    /// viewers. Uses a compare-exchange loop for race-free admission.
    pub fn connect(&self) -> Option<ClientGuard> {
        loop {
            let current = self.client_count.load(Ordering::Acquire);
            if current >= MAX_CLIENTS_PER_SESSION {
                return None;
            }
            if self
                .client_count
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(ClientGuard {
                    counter: Arc::clone(&self.client_count),
                });
            }
        }
    }

    /// Return the number of currently attached viewers.
    pub fn clients(&self) -> usize {
        self.client_count.load(Ordering::Acquire)
    }

    /// Attach a viewer: claim a client slot, then snapshot the scrollback
    /// and subscribe to live output in one atomic step.
    ///
    /// Returns `None` when the session is at its viewer limit.
    pub fn attach(&self) -> Option<Attachment> {
        let guard = self.connect()?;
        let (snapshot, output) = self.hub.attach();
        Some(Attachment {
            snapshot,
            output,
            guard,
        })
    }

    /// Queue bytes for the shell's stdin.
    pub async fn write_input(&self, data: Bytes) -> bool {
        self.input_tx.send(data).await.is_ok()
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.pty.lock().resize(rows, cols)
    }

    /// Shut down a session that never made it into the registry (e.g. the
    /// insert lost a race). Cancels watchers and kills the child tree.
    pub fn abort_unregistered(&self) {
        self.cancelled.cancel();
        self.kill_tree();
    }

    /// Send SIGHUP to the shell's process group.
    ///
    /// Used during drain to request graceful termination. portable_pty
    /// spawns the child via setsid(), so the shell leads its own process
    /// group and the negative-PID signal reaches everything it forked.
    pub fn send_sighup(&self) {
        if let Some(pid) = self.pid {
            if pid == 0 || pid > i32::MAX as u32 {
                tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
                return;
            }
            if self.child_exited.load(Ordering::Acquire) {
                tracing::debug!(pid, "child already exited, skipping SIGHUP");
                return;
            }
            #[cfg(unix)]
            unsafe {
                libc::kill(-(pid as i32), libc::SIGHUP);
            }
        }
    }

    /// SIGKILL the full process tree rooted at the shell: descendants
    /// deepest-first, then the shell, then a process-group sweep.
    ///
    /// Checks `child_exited` before signaling so a recycled PID is never
    /// hit. Skipping the signal is safe: once the shell is dead its
    /// orphaned descendants were already covered by the group sweep that
    /// the exit path performed.
    pub fn kill_tree(&self) {
        if let Some(pid) = self.pid {
            if self.child_exited.load(Ordering::Acquire) {
                tracing::debug!(pid, "child already exited, skipping tree kill");
                return;
            }
            proctree::kill_tree(pid);
        }
    }

    /// Kill only the identifiable foreground agent inside this session's
    /// tree, leaving the shell alive. Returns the agent PID if one was
    /// found and signaled.
    pub fn kill_agent(&self, agent_names: &[String]) -> Option<u32> {
        let pid = self.pid?;
        if self.child_exited.load(Ordering::Acquire) {
            return None;
        }
        proctree::kill_agent(pid, agent_names)
    }

    /// Spawn a new session: open a PTY, exec the shell in `cwd`, and start
    /// the reader, writer, and child-exit monitor tasks.
    ///
    /// The PTY reader publishes into the session's [`OutputHub`]; the
    /// writer consumes from the input channel. If the command carries a
    /// startup line it is queued as the first input, newline-terminated.
    pub fn spawn(
        id: String,
        command: &SpawnCommand,
        cwd: &Path,
        rows: u16,
        cols: u16,
        scrollback_bytes: usize,
    ) -> Result<SpawnedSession, PtyError> {
        let cmd = Pty::build_command(command, cwd);
        let mut pty = Pty::spawn_with_cmd(rows, cols, cmd)?;
        let pty_reader = pty.take_reader()?;
        let pty_writer = pty.take_writer()?;
        let pty_child = pty.take_child();
        let pid = pty_child.as_ref().and_then(|c| c.process_id());
        let pty = Arc::new(parking_lot::Mutex::new(pty));

        let hub = OutputHub::new(scrollback_bytes);
        let (input_tx, input_rx) = mpsc::channel::<Bytes>(64);
        let child_exited = Arc::new(AtomicBool::new(false));

        // Monitor child exit via a oneshot channel.
        //
        // NOTE: The JoinHandles from the blocking tasks below are
        // intentionally not stored. Session derives Clone, and JoinHandle
        // is not Clone, so tracking them would require per-task
        // Arc<Mutex<Option<JoinHandle>>>. All three tasks self-terminate
        // when the PTY fd closes or the child exits, and the tokio runtime
        // lets blocking tasks run to completion on shutdown.
        let (child_exit_tx, child_exit_rx) = oneshot::channel::<Option<i32>>();
        if let Some(mut child) = pty_child {
            let child_exited = child_exited.clone();
            tokio::task::spawn_blocking(move || {
                let exit_code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    match child.wait() {
                        Ok(status) => {
                            tracing::debug!(?status, "session child exited");
                            i32::try_from(status.exit_code()).ok()
                        }
                        Err(e) => {
                            tracing::error!(?e, "error waiting for session child");
                            None
                        }
                    }
                }))
                .unwrap_or_else(|e| {
                    tracing::error!("child exit monitor task panicked: {:?}", e);
                    None
                });
                // Set the flag BEFORE resolving the oneshot, so any
                // signal path woken by the exit sees it and skips a
                // potentially-recycled PID.
                child_exited.store(true, Ordering::Release);
                let _ = child_exit_tx.send(exit_code);
            });
        } else {
            child_exited.store(true, Ordering::Release);
            let _ = child_exit_tx.send(None);
        }

        // PTY reader: every chunk goes into the hub, which appends to the
        // scrollback ring and fans out to live subscribers in one step.
        {
            let hub = hub.clone();
            tokio::task::spawn_blocking(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    use std::io::Read;
                    let mut reader = pty_reader;
                    let mut buf = [0u8; 4096];
                    loop {
                        match reader.read(&mut buf) {
                            Ok(0) => break,
                            Ok(n) => hub.push(Bytes::copy_from_slice(&buf[..n])),
                            Err(_) => break,
                        }
                    }
                }));
                if let Err(e) = result {
                    tracing::error!("PTY reader task panicked: {:?}", e);
                }
            });
        }

        // PTY writer. Blocks on `blocking_recv()` until the channel closes
        // or a write fails. When the shell dies the PTY slave fd closes,
        // the next write_all fails with EIO, and this loop exits; the
        // channel end closes when the last Session clone drops.
        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                use std::io::Write;
                let mut writer = pty_writer;
                let mut rx = input_rx;
                while let Some(data) = rx.blocking_recv() {
                    if writer.write_all(&data).is_err() {
                        break;
                    }
                    let _ = writer.flush();
                }
            }));
            if let Err(e) = result {
                tracing::error!("PTY writer task panicked: {:?}", e);
            }
        });

        // Queue the startup line as the very first input. The channel is
        // empty at this point so try_send cannot fail on capacity.
        if let Some(line) = &command.startup_line {
            let mut bytes = line.clone().into_bytes();
            if !bytes.ends_with(b"\n") {
                bytes.push(b'\n');
            }
            let _ = input_tx.try_send(Bytes::from(bytes));
        }

        let session = Session {
            id,
            pid,
            client_count: Arc::new(AtomicUsize::new(0)),
            input_tx,
            hub,
            pty,
            cancelled: CancellationToken::new(),
            child_exited,
            op_lock: Arc::new(tokio::sync::Mutex::new(())),
        };

        Ok(SpawnedSession {
            session,
            child_exit_rx,
        })
    }
}
