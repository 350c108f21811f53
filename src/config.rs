use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level server config, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to bind the HTTP/WebSocket server.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Root directory under which task worktrees live. A session with no
    /// tab whose cwd is under this root is a task-scoped session.
    #[serde(default = "default_worktrees_root")]
    pub worktrees_root: PathBuf,
    /// Directory for the durable session/tab catalogue.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Per-session output ring buffer size in bytes.
    #[serde(default = "default_scrollback_bytes")]
    pub scrollback_bytes: usize,
    /// Shell to spawn (overrides $SHELL).
    pub shell: Option<String>,
    /// Process comm names recognized as foreground agents for
    /// `kill_agent`. Matched against `/proc/<pid>/comm`.
    #[serde(default = "default_agent_names")]
    pub agent_process_names: Vec<String>,
}

fn default_bind() -> SocketAddr {
    "127.0.0.1:8700".parse().expect("static default addr")
}

fn default_worktrees_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/"))
        .join("worktrees")
}

fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("agentmux")
}

fn default_scrollback_bytes() -> usize {
    256 * 1024
}

fn default_agent_names() -> Vec<String> {
    vec!["claude".into(), "codex".into(), "aider".into()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            worktrees_root: default_worktrees_root(),
            state_dir: default_state_dir(),
            scrollback_bytes: default_scrollback_bytes(),
            shell: None,
            agent_process_names: default_agent_names(),
        }
    }
}

impl Config {
    /// Load config from a TOML file path. Returns None if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Save config to a TOML file path, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Default config file location (`$XDG_CONFIG_HOME/agentmux/config.toml`).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("agentmux")
            .join("config.toml")
    }

    /// Path of the durable session/tab catalogue file.
    pub fn catalogue_path(&self) -> PathBuf {
        self.state_dir.join("sessions.json")
    }
}

/// Errors that can occur when loading or saving config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    WriteFailed(PathBuf, std::io::Error),
    SerializeFailed(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::WriteFailed(path, e) => {
                write!(f, "Failed to write config {}: {}", path.display(), e)
            }
            Self::SerializeFailed(e) => write!(f, "Failed to serialize config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

/// True if `cwd` lies under the worktrees root.
///
/// Pure path containment; no filesystem access, so it holds for sessions
/// whose worktree has already been deleted.
pub fn cwd_under_worktrees(worktrees_root: &Path, cwd: &Path) -> bool {
    cwd.starts_with(worktrees_root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.scrollback_bytes, 256 * 1024);
        assert!(config.shell.is_none());
        assert!(!config.agent_process_names.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            bind = "0.0.0.0:9000"
            worktrees_root = "/srv/worktrees"
            scrollback_bytes = 1024
            shell = "/bin/zsh"
            agent_process_names = ["claude"]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.worktrees_root, PathBuf::from("/srv/worktrees"));
        assert_eq!(config.scrollback_bytes, 1024);
        assert_eq!(config.shell.as_deref(), Some("/bin/zsh"));
        assert_eq!(config.agent_process_names, vec!["claude"]);
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        assert!(Config::load(&path).unwrap().is_none());
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");
        let config = Config {
            worktrees_root: PathBuf::from("/work/trees"),
            scrollback_bytes: 4096,
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap().expect("file should exist");
        assert_eq!(loaded.worktrees_root, PathBuf::from("/work/trees"));
        assert_eq!(loaded.scrollback_bytes, 4096);
    }

    #[test]
    fn load_invalid_toml_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "bind = [not valid").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn cwd_under_worktrees_containment() {
        let root = Path::new("/home/user/worktrees");
        assert!(cwd_under_worktrees(root, Path::new("/home/user/worktrees/task-42")));
        assert!(cwd_under_worktrees(root, Path::new("/home/user/worktrees/task-42/src")));
        assert!(!cwd_under_worktrees(root, Path::new("/home/user/projects/task-42")));
        assert!(!cwd_under_worktrees(root, Path::new("/home/user/worktrees-other")));
    }
}
