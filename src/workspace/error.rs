//! Error types for session workspace operations

use std::path::PathBuf;

/// Error type for workspace operations
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Path escapes the workspace root: {path}")]
    PathEscape { path: String },

    #[error("git clone failed: {message}")]
    CloneFailed { message: String },

    #[error("Archive extraction failed: {message}")]
    ArchiveFailed { message: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Repository '{repo_name}' not found in session {session_id}")]
    RepoNotFound {
        session_id: String,
        repo_name: String,
    },

    #[error("No files selected for export from '{repo_name}'")]
    NothingToExport { repo_name: String },

    #[error("Could not remove {failures} entries under {path}")]
    TeardownPartialFailure { path: PathBuf, failures: usize },

    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },

    #[error("Internal workspace error: {0}")]
    Internal(String),
}

impl WorkspaceError {
    pub fn path_escape(path: impl std::fmt::Display) -> Self {
        Self::PathEscape {
            path: path.to_string(),
        }
    }

    pub fn clone_failed(message: impl Into<String>) -> Self {
        Self::CloneFailed {
            message: message.into(),
        }
    }

    pub fn archive_failed(message: impl Into<String>) -> Self {
        Self::ArchiveFailed {
            message: message.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the error was caused by client input rather than a server fault
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::PathEscape { .. }
                | Self::CloneFailed { .. }
                | Self::ArchiveFailed { .. }
                | Self::SessionNotFound(_)
                | Self::RepoNotFound { .. }
                | Self::NothingToExport { .. }
        )
    }
}

/// Result type for workspace operations
pub type WorkspaceResult<T> = Result<T, WorkspaceError>;
