//! Installer configuration stored in `installer.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::io::transport::{AuthMethod, SessionOptions};

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "installer.toml";

/// Installer configuration (TOML).
///
/// Every field is optional in the file; missing fields take the defaults
/// below. Command-line flags override the login user and inventory path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InstallerConfig {
    /// Inventory file with `[controllers]` / `[agents]` sections.
    pub inventory_path: PathBuf,

    /// Directory scanned for the controller installer artifact.
    pub artifact_dir: PathBuf,

    /// Regex that release tarball file names must match.
    pub artifact_pattern: String,

    /// Directory whose files override the built-in templates by name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub templates_dir: Option<PathBuf>,

    pub ssh: SshConfig,

    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SshConfig {
    /// SSH client executable.
    pub program: String,

    /// Control port probed before every remote operation.
    pub port: u16,

    /// Login user. Anything but `root` escalates with `sudo`.
    pub user: String,

    /// Upper bound for the reachability probe, in milliseconds.
    pub probe_timeout_ms: u64,

    pub connect_timeout_secs: u64,

    /// Per-command limit in seconds; 0 means unbounded (the session ceiling
    /// still applies).
    pub operation_timeout_secs: u64,

    /// Ceiling for any single remote command or upload, in seconds.
    pub session_timeout_secs: u64,

    /// Value for the client's `StrictHostKeyChecking` option.
    pub host_key_checking: String,

    pub auth_methods: Vec<AuthMethod>,
}

/// Well-known paths on the managed hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteConfig {
    /// Directory holding the agent's executables.
    pub tool_bin: String,

    /// Directory holding the controller's client tools.
    pub client_bin: String,

    /// Agent configuration directory (receives `csr_attributes.yaml`).
    pub config_dir: String,

    /// Destination of the rendered code-sync configuration.
    pub code_sync_config: String,

    /// Directory the code-sync tool deploys environments into.
    pub code_dir: String,

    /// World-writable directory uploads land in before being moved into place.
    pub staging_dir: String,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            inventory_path: PathBuf::from("inventory/hosts"),
            artifact_dir: PathBuf::from("."),
            artifact_pattern: r"^puppet-enterprise-20.*\.tar\.gz$".to_string(),
            templates_dir: None,
            ssh: SshConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            port: 22,
            user: "root".to_string(),
            probe_timeout_ms: 1000,
            connect_timeout_secs: 60,
            operation_timeout_secs: 0,
            session_timeout_secs: 60 * 60,
            host_key_checking: "accept-new".to_string(),
            auth_methods: vec![AuthMethod::None, AuthMethod::Publickey],
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            tool_bin: "/opt/puppetlabs/puppet/bin".to_string(),
            client_bin: "/opt/puppetlabs/bin".to_string(),
            config_dir: "/etc/puppetlabs/puppet".to_string(),
            code_sync_config: "/etc/puppetlabs/r10k/r10k.yaml".to_string(),
            code_dir: "/etc/puppetlabs/code/environments".to_string(),
            staging_dir: "/tmp".to_string(),
        }
    }
}

impl InstallerConfig {
    pub fn validate(&self) -> Result<()> {
        self.artifact_regex()?;
        self.ssh.validate()?;
        for (name, value) in [
            ("remote.tool_bin", &self.remote.tool_bin),
            ("remote.client_bin", &self.remote.client_bin),
            ("remote.config_dir", &self.remote.config_dir),
            ("remote.code_sync_config", &self.remote.code_sync_config),
            ("remote.code_dir", &self.remote.code_dir),
            ("remote.staging_dir", &self.remote.staging_dir),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("{name} must not be empty"));
            }
        }
        Ok(())
    }

    pub fn artifact_regex(&self) -> Result<Regex> {
        Regex::new(&self.artifact_pattern)
            .with_context(|| format!("invalid artifact_pattern `{}`", self.artifact_pattern))
    }
}

impl SshConfig {
    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(anyhow!("ssh.program must not be empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("ssh.port must be > 0"));
        }
        if self.user.trim().is_empty() {
            return Err(anyhow!("ssh.user must not be empty"));
        }
        if self.probe_timeout_ms == 0 {
            return Err(anyhow!("ssh.probe_timeout_ms must be > 0"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(anyhow!("ssh.connect_timeout_secs must be > 0"));
        }
        if self.session_timeout_secs == 0 {
            return Err(anyhow!("ssh.session_timeout_secs must be > 0"));
        }
        if self.auth_methods.contains(&AuthMethod::Password) {
            return Err(anyhow!(
                "ssh.auth_methods: password authentication is disabled, use keys"
            ));
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Session options for `user` (the `--user` flag wins over the file).
    pub fn session_options(&self, user: Option<&str>) -> SessionOptions {
        SessionOptions {
            user: user.unwrap_or(&self.user).to_string(),
            port: self.port,
            auth_methods: self.auth_methods.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            operation_timeout: (self.operation_timeout_secs > 0)
                .then(|| Duration::from_secs(self.operation_timeout_secs)),
            session_timeout: Duration::from_secs(self.session_timeout_secs),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `InstallerConfig::default()`.
pub fn load_config(path: &Path) -> Result<InstallerConfig> {
    if !path.exists() {
        let cfg = InstallerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: InstallerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}
