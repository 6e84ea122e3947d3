//! Privilege escalation for remote commands.
//!
//! The escalation password travels on the remote command's stdin exactly
//! once. [`Privilege::script`] reads it into a shell variable before anything
//! else runs, and every `sudo` in the command gets its own copy piped in, so
//! later calls do not depend on sudo's credential cache and no other process
//! can drain the stream.

/// Whether remote commands need escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeMode {
    /// Logged in as the privileged account.
    None,
    Escalate,
}

/// Escalation settings for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Privilege {
    pub mode: PrivilegeMode,
    /// Password fed to `sudo -S` on stdin; ignored without escalation.
    pub password: Option<String>,
}

/// Unexported shell variable holding the password inside remote scripts.
const PASSWORD_VAR: &str = "INSTALLER_SUDO_PASSWORD";

impl Privilege {
    pub const PRIVILEGED_USER: &'static str = "root";

    /// Escalate unless the login user is the privileged account.
    pub fn for_login(user: &str, password: Option<String>) -> Self {
        let mode = if user == Self::PRIVILEGED_USER {
            PrivilegeMode::None
        } else {
            PrivilegeMode::Escalate
        };
        Self { mode, password }
    }

    fn feeds_password(&self) -> bool {
        self.mode == PrivilegeMode::Escalate && self.password.is_some()
    }

    /// Command prefix exposed to templates as `sudo` (empty without escalation).
    pub fn prefix(&self) -> String {
        match (self.mode, self.password.is_some()) {
            (PrivilegeMode::None, _) => String::new(),
            (PrivilegeMode::Escalate, false) => "sudo".to_string(),
            (PrivilegeMode::Escalate, true) => {
                format!("printf '%s\\n' \"${PASSWORD_VAR}\" | sudo -S -p ''")
            }
        }
    }

    /// Prefix `command` for escalated execution.
    pub fn wrap(&self, command: &str) -> String {
        match self.prefix().as_str() {
            "" => command.to_string(),
            prefix => format!("{prefix} {command}"),
        }
    }

    /// Complete remote script: reads the password off stdin first when one
    /// is fed.
    pub fn script(&self, body: &str) -> String {
        if self.feeds_password() {
            format!("IFS= read -r {PASSWORD_VAR}\n{body}")
        } else {
            body.to_string()
        }
    }

    /// Bytes to send on the remote command's stdin.
    pub fn stdin(&self) -> Option<Vec<u8>> {
        match &self.password {
            Some(password) if self.feeds_password() => Some(format!("{password}\n").into_bytes()),
            _ => None,
        }
    }
}
