//! Transport abstraction for remote execution and uploads.
//!
//! The [`Transport`] trait decouples the executor from the actual channel
//! (currently the platform `ssh` client, see [`crate::io::ssh`]). Tests use
//! scripted transports that replay predetermined events without a network.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Event emitted while a remote command runs.
///
/// Output chunks are arbitrary byte fragments; they carry no line structure.
/// `ExitCode` is followed by `Finish`. `ExitSignal` is terminal on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent<'a> {
    Start,
    Stdout(&'a [u8]),
    Stderr(&'a [u8]),
    ExitCode(i32),
    ExitSignal(String),
    Finish,
}

/// Authentication methods offered to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    None,
    Publickey,
    /// Rejected by config validation; listed so the policy is explicit.
    Password,
}

/// Connection settings shared by every operation of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub user: String,
    pub port: u16,
    pub auth_methods: Vec<AuthMethod>,
    pub connect_timeout: Duration,
    /// Per-command limit; `None` leaves only the session ceiling.
    pub operation_timeout: Option<Duration>,
    pub session_timeout: Duration,
}

impl SessionOptions {
    /// Longest a single command or upload may take.
    pub fn command_deadline(&self) -> Duration {
        match self.operation_timeout {
            Some(limit) => limit.min(self.session_timeout),
            None => self.session_timeout,
        }
    }
}

/// Transport-level failure: the command's own exit status is never one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportFailure {
    pub message: String,
}

impl TransportFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Abstraction over remote channels.
pub trait Transport {
    /// Run `command` on `host`, delivering events in order on the calling thread.
    fn exec(
        &self,
        host: &str,
        command: &str,
        stdin: Option<&[u8]>,
        session: &SessionOptions,
        on_event: &mut dyn FnMut(ExecEvent<'_>),
    ) -> Result<(), TransportFailure>;

    /// Copy `local_path` to `remote_path`, reporting `(bytes_sent, bytes_total)`.
    fn put(
        &self,
        host: &str,
        local_path: &Path,
        remote_path: &str,
        session: &SessionOptions,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), TransportFailure>;
}
