//! Durable session/tab catalogue.
//!
//! The registry streams a full catalogue snapshot after every mutation;
//! a single writer task serializes them to disk, coalescing bursts so
//! only the newest snapshot is written. Write failures are logged and
//! never surfaced to the operation that triggered them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::registry::{SessionMeta, Tab};

/// On-disk snapshot of everything that survives a server restart.
/// Runtime state (PTYs, scrollback, attachments) is deliberately absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalogue {
    #[serde(default)]
    pub sessions: Vec<SessionMeta>,
    #[serde(default)]
    pub tabs: Vec<Tab>,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("failed to read catalogue {0}: {1}")]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse catalogue {0}: {1}")]
    ParseFailed(PathBuf, #[source] serde_json::Error),
    #[error("failed to write catalogue {0}: {1}")]
    WriteFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to serialize catalogue: {0}")]
    SerializeFailed(#[source] serde_json::Error),
}

/// Load the catalogue from disk. Returns `None` if the file doesn't exist.
pub fn load(path: &Path) -> Result<Option<Catalogue>, PersistError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .map_err(|e| PersistError::ReadFailed(path.to_path_buf(), e))?;
    let catalogue = serde_json::from_str(&contents)
        .map_err(|e| PersistError::ParseFailed(path.to_path_buf(), e))?;
    Ok(Some(catalogue))
}

/// Write the catalogue atomically: serialize to a sibling tmp file, then
/// rename over the target so readers never observe a partial file.
pub fn write_catalogue(path: &Path, catalogue: &Catalogue) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| PersistError::WriteFailed(path.to_path_buf(), e))?;
    }
    let contents =
        serde_json::to_string_pretty(catalogue).map_err(PersistError::SerializeFailed)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents).map_err(|e| PersistError::WriteFailed(tmp.clone(), e))?;
    std::fs::rename(&tmp, path).map_err(|e| PersistError::WriteFailed(path.to_path_buf(), e))?;
    Ok(())
}

/// Spawn the catalogue writer task and return its input channel.
///
/// Snapshots are coalesced: when several arrive while a write is in
/// flight, only the newest one hits the disk. The channel closing shuts
/// the task down after a final write of the last snapshot seen.
pub fn spawn_writer(path: PathBuf) -> mpsc::UnboundedSender<Catalogue> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Catalogue>();
    tokio::spawn(async move {
        while let Some(mut catalogue) = rx.recv().await {
            while let Ok(newer) = rx.try_recv() {
                catalogue = newer;
            }
            let write_path = path.clone();
            let result = tokio::task::spawn_blocking(move || {
                write_catalogue(&write_path, &catalogue)
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "catalogue write failed"),
                Err(e) => tracing::error!(?e, "catalogue writer task panicked"),
            }
        }
        tracing::debug!("catalogue writer stopped");
    });
    tx
}
