//! Error taxonomy shared by the remote engine and the orchestrator.

use std::path::PathBuf;

use thiserror::Error;

/// Typed failures callers classify with `downcast_ref`.
///
/// Errors raised inside one host's workflow are caught at the orchestration
/// boundary. The configuration variants surface before any host is touched
/// and abort the command.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("host {host} not responding to SSH")]
    Unreachable { host: String },

    #[error("authentication failed for {user}@{host}, key loaded?")]
    Authentication { user: String, host: String },

    #[error("transport error on {host}: {message}")]
    Transport { host: String, message: String },

    #[error("no such section: {0}")]
    UnknownSection(String),

    #[error(
        "no installer artifact matching `{pattern}` in {}; download the release tarball and put it there",
        dir.display()
    )]
    ArtifactNotFound { dir: PathBuf, pattern: String },

    #[error("{what} not found at {}", path.display())]
    NotFound { what: &'static str, path: PathBuf },

    #[error("inventory row has no hostname")]
    EmptyRow,
}
