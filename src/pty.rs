use portable_pty::{native_pty_system, CommandBuilder, PtyPair, PtySize};
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("failed to wait for child: {0}")]
    Wait(#[from] std::io::Error),
}

/// The shell command a session's PTY runs.
#[derive(Debug, Clone, Default)]
pub struct SpawnCommand {
    /// Shell binary to exec. Falls back to $SHELL, then /bin/sh.
    pub shell: Option<String>,
    /// First command line typed into the shell after spawn, if any.
    pub startup_line: Option<String>,
}

pub struct Pty {
    pair: PtyPair,
    child: Option<Box<dyn portable_pty::Child + Send + Sync>>,
}

impl Pty {
    /// Build the PTY command for a session: the configured shell with
    /// TERM inherited, rooted at `cwd`.
    pub fn build_command(spawn: &SpawnCommand, cwd: &Path) -> CommandBuilder {
        let shell = spawn
            .shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string());
        let mut cmd = CommandBuilder::new(&shell);
        cmd.env(
            "TERM",
            std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string()),
        );
        cmd.cwd(cwd);
        cmd
    }

    /// Open a PTY of the given size and spawn `cmd` into it.
    pub fn spawn_with_cmd(rows: u16, cols: u16, cmd: CommandBuilder) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system.openpty(size).map_err(PtyError::OpenPty)?;
        let child = pair.slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;

        Ok(Self {
            pair,
            child: Some(child),
        })
    }

    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.pair.master.try_clone_reader().map_err(PtyError::CloneReader)
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.pair.master.take_writer().map_err(PtyError::TakeWriter)
    }

    /// Take the child handle out of the PTY so a dedicated task can wait
    /// on it. Returns None if already taken.
    pub fn take_child(&mut self) -> Option<Box<dyn portable_pty::Child + Send + Sync>> {
        self.child.take()
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.pair
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)
    }
}
