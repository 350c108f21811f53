//! Protection Gate for destructive session operations.
//!
//! Every path that destroys a session carries a [`DestroyAuthority`].
//! The public protocol can only produce `UserForced` (and only when the
//! command set the explicit `forced` flag); the internal cascade variants
//! cannot be constructed from a wire message. Unauthorized requests are
//! rejected here, uniformly for task-scoped and tab-scoped sessions.

use thiserror::Error;

/// Where a trusted internal cascade destroy originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeOrigin {
    /// The session's owning tab was deleted.
    TabDeleted,
    /// The task/worktree subsystem removed the session's worktree.
    WorktreeRemoved,
}

/// Legitimacy of a destroy request.
#[derive(Debug, Clone)]
pub enum DestroyAuthority {
    /// Explicit user action from an interactive surface, with the reason
    /// the client supplied.
    UserForced { reason: Option<String> },
    /// Cascade from a container deletion. Already authorized by the
    /// operation that triggered it.
    Internal(CascadeOrigin),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardError {
    #[error("session destruction requires the forced flag")]
    UnauthorizedDestroy,
}

impl DestroyAuthority {
    /// Classify a public destroy command. Without `forced`, the request
    /// is rejected regardless of which session it targets.
    pub fn from_command(forced: bool, reason: Option<String>) -> Result<Self, GuardError> {
        if forced {
            Ok(Self::UserForced { reason })
        } else {
            Err(GuardError::UnauthorizedDestroy)
        }
    }

    /// Short label used in destroy events and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::UserForced { .. } => "user_forced",
            Self::Internal(CascadeOrigin::TabDeleted) => "tab_deleted",
            Self::Internal(CascadeOrigin::WorktreeRemoved) => "worktree_removed",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::UserForced { reason } => reason.as_deref(),
            Self::Internal(_) => None,
        }
    }
}
