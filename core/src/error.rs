use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DmgError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {status}: {stderr}")]
    ProcessFailure {
        program: String,
        status: i32,
        stderr: String,
    },

    #[error("Image is still attached after all detach attempts: {0}")]
    MountBusy(PathBuf),

    #[error("No icon resource found in {0}")]
    IconNotFound(PathBuf),

    #[error("Icon could not be applied: {0}")]
    IconMethodFailed(String),

    #[error("Unexpected output from {program}: {detail}")]
    UnexpectedOutput { program: String, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed structured output: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure class of a [`DmgError`], for branching without matching on text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    Validation,
    Spawn,
    ProcessFailure,
    MountBusy,
    IconNotFound,
    IconMethodFailed,
    UnexpectedOutput,
    Io,
    Json,
}

impl DmgError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DmgError::Validation(_) => ErrorKind::Validation,
            DmgError::Spawn { .. } => ErrorKind::Spawn,
            DmgError::ProcessFailure { .. } => ErrorKind::ProcessFailure,
            DmgError::MountBusy(_) => ErrorKind::MountBusy,
            DmgError::IconNotFound(_) => ErrorKind::IconNotFound,
            DmgError::IconMethodFailed(_) => ErrorKind::IconMethodFailed,
            DmgError::UnexpectedOutput { .. } => ErrorKind::UnexpectedOutput,
            DmgError::Io(_) => ErrorKind::Io,
            DmgError::Json(_) => ErrorKind::Json,
        }
    }

    /// Exit status carried by a process failure.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            DmgError::ProcessFailure { status, .. } => Some(*status),
            _ => None,
        }
    }
}
