//! Shared result types for remote command execution.

/// Outcome of one remote command that reached a terminal state.
///
/// Exactly one of `exit_code` / `signal` is set once the command completed;
/// transport failures are reported as errors, never as a result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteCommandResult {
    pub exit_code: Option<i32>,
    /// Name of the signal that terminated the command (e.g. `TERM`).
    pub signal: Option<String>,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

impl RemoteCommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Whether the command exited normally with one of `codes`.
    pub fn exited_with_any(&self, codes: &[i32]) -> bool {
        self.exit_code.is_some_and(|code| codes.contains(&code))
    }

    /// Human-readable terminal state, e.g. `exit status 3` or `signal TERM`.
    pub fn termination(&self) -> String {
        match (&self.exit_code, &self.signal) {
            (Some(code), _) => format!("exit status {code}"),
            (None, Some(signal)) => format!("signal {signal}"),
            (None, None) => "no exit status".to_string(),
        }
    }
}
