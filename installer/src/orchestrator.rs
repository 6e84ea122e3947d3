//! Per-role, per-host workflows over the inventory.
//!
//! Hosts are processed strictly one after another in document order. Each
//! host runs inside a failure boundary: an unreachable host is skipped, any
//! other error marks the host failed, and the loop moves on.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use minijinja::{Value, context};
use regex::Regex;
use tempfile::NamedTempFile;
use tracing::{error, info, instrument, warn};

use crate::core::inventory::{Inventory, InventoryRecord, Role};
use crate::core::privilege::Privilege;
use crate::core::report::{HostOutcome, RunReport};
use crate::core::types::RemoteCommandResult;
use crate::error::InstallError;
use crate::io::artifact::find_artifact;
use crate::io::config::RemoteConfig;
use crate::io::executor::{CommandOptions, RemoteExecutor};
use crate::io::shell::quote;
use crate::io::templates::{TemplateId, Templates};
use crate::io::transfer::{TransferJob, TransferManager};

/// Exit codes of `puppet agent -t` meaning "ran fine" (2: changes applied).
const RECONCILE_OK_CODES: [i32; 2] = [0, 2];

const CERT_ATTRIBUTES_FILE: &str = "csr_attributes.yaml";

/// Run-wide inputs from flags and configuration.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub privilege: Privilege,
    /// Controller agents bootstrap from.
    pub controller: Option<String>,
    pub console_password: Option<String>,
    pub control_repo: Option<String>,
    pub challenge_password: Option<String>,
    pub artifact_dir: PathBuf,
    pub artifact_pattern: Regex,
    pub remote: RemoteConfig,
}

pub struct Orchestrator<'a> {
    inventory: &'a Inventory,
    executor: &'a RemoteExecutor<'a>,
    transfers: &'a TransferManager<'a>,
    templates: &'a Templates,
    settings: &'a WorkflowSettings,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        inventory: &'a Inventory,
        executor: &'a RemoteExecutor<'a>,
        transfers: &'a TransferManager<'a>,
        templates: &'a Templates,
        settings: &'a WorkflowSettings,
    ) -> Self {
        Self {
            inventory,
            executor,
            transfers,
            templates,
            settings,
        }
    }

    /// Install every host of `section_key` according to the section's role.
    ///
    /// Fails only on configuration-level problems (unknown section, missing
    /// artifact or required settings); host failures land in the report.
    #[instrument(skip_all, fields(section = section_key))]
    pub fn run(&self, section_key: &str) -> Result<RunReport> {
        let key = section_key.trim().to_lowercase();
        let records = self.inventory.section(&key)?;
        match Role::from_section(&key) {
            Some(Role::Controllers) => self.install_controllers(&key, records),
            Some(Role::Agents) => self.install_agents(&key, records),
            None => {
                warn!(section = %key, "section has no known role, skipping");
                self.message(&format!("Unknown section: {key}"));
                Ok(RunReport::default())
            }
        }
    }

    /// Run the status script on every host of every section.
    #[instrument(skip_all)]
    pub fn status(&self) -> Result<RunReport> {
        let mut report = RunReport::default();
        for section in self.inventory.iter() {
            for record in &section.records {
                let host = record.hostname.as_str();
                self.guarded(&mut report, &section.name, host, || self.report_status(host));
            }
        }
        Ok(report)
    }

    /// Configure and run the code-sync tool on every controller.
    #[instrument(skip_all)]
    pub fn setup_code_sync(&self) -> Result<RunReport> {
        let control_repo = required(
            self.settings.control_repo.as_deref(),
            "--control-repo is required for code sync",
        )?;
        let section = Role::Controllers.section_name();
        let records = self.inventory.section(section)?;

        let mut report = RunReport::default();
        for record in records {
            let host = record.hostname.as_str();
            self.guarded(&mut report, section, host, || {
                self.setup_code_sync_on(host, control_repo)
            });
        }
        Ok(report)
    }

    fn install_agents(&self, section: &str, records: &[InventoryRecord]) -> Result<RunReport> {
        let controller = required(
            self.settings.controller.as_deref(),
            "--controller is required to install agents",
        )?;

        let mut report = RunReport::default();
        for record in records {
            self.guarded(&mut report, section, &record.hostname, || {
                self.install_agent(record, controller)
            });
        }
        Ok(report)
    }

    fn install_controllers(&self, section: &str, records: &[InventoryRecord]) -> Result<RunReport> {
        let console_password = required(
            self.settings.console_password.as_deref(),
            "--console-password is required to install controllers",
        )?;
        if records.iter().any(InventoryRecord::has_deploy_flag) {
            required(
                self.settings.control_repo.as_deref(),
                "--control-repo is required for controllers marked deploy_code",
            )?;
        }
        let artifact = find_artifact(&self.settings.artifact_dir, &self.settings.artifact_pattern)?;
        info!(artifact = %artifact.display(), "installing controllers");

        let mut report = RunReport::default();
        for record in records {
            self.guarded(&mut report, section, &record.hostname, || {
                self.install_controller(record, &artifact, console_password)
            });
        }
        Ok(report)
    }

    /// Failure boundary around one host's workflow.
    fn guarded(
        &self,
        report: &mut RunReport,
        section: &str,
        host: &str,
        work: impl FnOnce() -> Result<()>,
    ) {
        if !self.executor.is_reachable(host) {
            let reason = InstallError::Unreachable {
                host: host.to_string(),
            }
            .to_string();
            warn!(host, "skipping unreachable host");
            self.message(&format!("{reason}, skipping"));
            report.record(section, host, HostOutcome::Skipped(reason));
            return;
        }

        match work() {
            Ok(()) => report.record(section, host, HostOutcome::Success),
            Err(err) => {
                let reason = format!("{err:#}");
                error!(host, err = %reason, "host failed");
                self.message(&format!("{host}: {reason}"));
                report.record(section, host, HostOutcome::Failed(reason));
            }
        }
    }

    #[instrument(skip_all, fields(host = %record.hostname))]
    fn install_agent(&self, record: &InventoryRecord, controller: &str) -> Result<()> {
        let host = record.hostname.as_str();
        self.message(&format!("Installing agent on {host}"));
        self.setup_cert_attributes(record)?;

        let installer_url = format!("https://{controller}:8140/packages/current/install.bash");
        let script = self.templates.render(
            TemplateId::InstallAgent,
            context! {
                sudo => self.settings.privilege.prefix(),
                tool_bin => quote(&self.settings.remote.tool_bin),
                installer_url => quote(&installer_url),
                installer_script => quote(&self.staged("install_agent.bash")),
            },
        )?;
        self.run_required(host, &script, "agent installer")?;
        Ok(())
    }

    #[instrument(skip_all, fields(host = %record.hostname))]
    fn install_controller(
        &self,
        record: &InventoryRecord,
        artifact: &Path,
        console_password: &str,
    ) -> Result<()> {
        let host = record.hostname.as_str();
        self.message(&format!("Installing controller on {host}"));
        self.setup_cert_attributes(record)?;

        let artifact_name = artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("artifact path {} has no file name", artifact.display()))?;
        let remote_artifact = self.staged(&artifact_name);
        self.transfers.upload_if_needed(
            &TransferJob::new(host, artifact, &remote_artifact).with_label("Upload installer"),
        )?;

        let deploy_code = record.has_deploy_flag();
        let control_repo_json = match (deploy_code, self.settings.control_repo.as_deref()) {
            (true, Some(repo)) => Some(json(repo)?),
            _ => None,
        };
        let script = self.templates.render(
            TemplateId::InstallController,
            context! {
                sudo => self.settings.privilege.prefix(),
                artifact => quote(&remote_artifact),
                extract_dir => quote(&self.staged(&extract_dir_name(&artifact_name))),
                console_password_json => json(console_password)?,
                deploy_code => deploy_code,
                control_repo_json => control_repo_json,
            },
        )?;
        self.run_required(host, &script, "controller installer")?;

        let reconcile = self.settings.privilege.wrap(&format!(
            "{}/puppet agent -t",
            quote(&self.settings.remote.tool_bin)
        ));
        self.run_accepting(host, &reconcile, &RECONCILE_OK_CODES, "post-install agent run")?;

        if deploy_code {
            self.setup_code_deploy(host, console_password)?;
        }
        Ok(())
    }

    /// Place the certificate-request attribute document on `record`'s host.
    ///
    /// No-op unless the row carries registry attributes or a challenge
    /// password is configured.
    fn setup_cert_attributes(&self, record: &InventoryRecord) -> Result<()> {
        let challenge = self.settings.challenge_password.as_deref();
        if !record.needs_cert_attributes && challenge.is_none() {
            return Ok(());
        }
        let host = record.hostname.as_str();
        self.message(&format!("Setting up certificate attributes on {host}"));

        let extension_requests = record
            .cert_attributes()
            .map(|(name, value)| -> Result<Value> {
                Ok(context! {
                    name => name,
                    value_json => json(value.as_text())?,
                })
            })
            .collect::<Result<Vec<Value>>>()?;
        let document = self.templates.render(
            TemplateId::CertAttributes,
            context! {
                challenge_password_json => challenge.map(json).transpose()?,
                extension_requests => extension_requests,
            },
        )?;
        let local = write_temp(&document)?;

        let config_dir = &self.settings.remote.config_dir;
        let privilege = &self.settings.privilege;
        self.run_required(
            host,
            &privilege.wrap(&format!("mkdir -p {}", quote(config_dir))),
            "create agent configuration directory",
        )?;
        let staged = self.staged(CERT_ATTRIBUTES_FILE);
        self.transfers.upload(
            &TransferJob::new(host, local.path(), &staged).with_label(CERT_ATTRIBUTES_FILE),
        )?;
        self.run_required(
            host,
            &privilege.wrap(&format!(
                "mv {} {}",
                quote(&staged),
                quote(&remote_join(config_dir, CERT_ATTRIBUTES_FILE))
            )),
            "install certificate attributes",
        )?;
        Ok(())
    }

    fn setup_code_deploy(&self, host: &str, console_password: &str) -> Result<()> {
        self.message(&format!("Setting up code deployment on {host}"));
        let script = self.templates.render(
            TemplateId::SetupCodeDeploy,
            context! {
                sudo => self.settings.privilege.prefix(),
                console_password => quote(console_password),
                client_bin => quote(&self.settings.remote.client_bin),
            },
        )?;
        self.run_required(host, &script, "code deployment setup")?;
        Ok(())
    }

    fn report_status(&self, host: &str) -> Result<()> {
        self.message(&format!("host {host} status:"));
        let script = self.templates.render(
            TemplateId::Status,
            context! {
                sudo => self.settings.privilege.prefix(),
                tool_bin => quote(&self.settings.remote.tool_bin),
            },
        )?;
        self.run_required(host, &script, "status script")?;
        Ok(())
    }

    #[instrument(skip_all, fields(host = %host))]
    fn setup_code_sync_on(&self, host: &str, control_repo: &str) -> Result<()> {
        self.message(&format!("Setting up code sync on {host}"));
        let remote = &self.settings.remote;
        let document = self.templates.render(
            TemplateId::CodeSyncConfig,
            context! {
                control_repo_json => json(control_repo)?,
                code_dir_json => json(&remote.code_dir)?,
            },
        )?;
        let local = write_temp(&document)?;

        let (config_dir, config_name) = split_remote_path(&remote.code_sync_config)?;
        let staged = self.staged(config_name);
        self.transfers
            .upload(&TransferJob::new(host, local.path(), &staged).with_label(config_name))?;

        let script = self.templates.render(
            TemplateId::RunCodeSync,
            context! {
                sudo => self.settings.privilege.prefix(),
                tool_bin => quote(&remote.tool_bin),
                sync_config_dir => quote(config_dir),
                staged_config => quote(&staged),
                sync_config => quote(&remote.code_sync_config),
            },
        )?;
        self.run_required(host, &script, "code sync")?;
        Ok(())
    }

    fn run_required(&self, host: &str, command: &str, step: &str) -> Result<RemoteCommandResult> {
        self.run_accepting(host, command, &[0], step)
    }

    /// Run a step that fails the host unless it exits with one of `codes`.
    fn run_accepting(
        &self,
        host: &str,
        command: &str,
        codes: &[i32],
        step: &str,
    ) -> Result<RemoteCommandResult> {
        let privilege = &self.settings.privilege;
        let opts = CommandOptions {
            stdin: privilege.stdin(),
            ..Default::default()
        };
        let result = self.executor.run(host, &privilege.script(command), &opts)?;
        if !result.exited_with_any(codes) {
            bail!("{step} failed on {host}: {}", result.termination());
        }
        Ok(result)
    }

    fn staged(&self, name: &str) -> String {
        remote_join(&self.settings.remote.staging_dir, name)
    }

    fn message(&self, text: &str) {
        self.executor.sink().message(text);
    }
}

fn required<'v>(value: Option<&'v str>, message: &'static str) -> Result<&'v str> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => bail!(message),
    }
}

/// JSON string literal, valid in both YAML and HOCON documents.
fn json(value: &str) -> Result<String> {
    serde_json::to_string(value).context("encode template value")
}

fn write_temp(contents: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new().context("create temporary file")?;
    file.write_all(contents.as_bytes())
        .and_then(|()| file.flush())
        .with_context(|| format!("write {}", file.path().display()))?;
    Ok(file)
}

fn remote_join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// Split an absolute remote file path into directory and file name.
fn split_remote_path(path: &str) -> Result<(&str, &str)> {
    match path.rsplit_once('/') {
        Some((dir, name)) if !name.is_empty() => Ok((if dir.is_empty() { "/" } else { dir }, name)),
        _ => bail!("remote path `{path}` does not name a file"),
    }
}

/// Directory the release tarball is unpacked into.
fn extract_dir_name(artifact_name: &str) -> String {
    artifact_name
        .strip_suffix(".tar.gz")
        .or_else(|| artifact_name.strip_suffix(".tgz"))
        .map(str::to_string)
        .unwrap_or_else(|| format!("{artifact_name}.d"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_paths_join_without_double_slash() {
        assert_eq!(remote_join("/tmp/", "a.yaml"), "/tmp/a.yaml");
        assert_eq!(remote_join("/tmp", "a.yaml"), "/tmp/a.yaml");
        assert_eq!(
            split_remote_path("/etc/puppetlabs/r10k/r10k.yaml").expect("split"),
            ("/etc/puppetlabs/r10k", "r10k.yaml")
        );
        assert_eq!(split_remote_path("/r10k.yaml").expect("split"), ("/", "r10k.yaml"));
        assert!(split_remote_path("/etc/r10k/").is_err());
    }

    #[test]
    fn extract_dir_strips_archive_suffix() {
        assert_eq!(
            extract_dir_name("puppet-enterprise-2021.2-el-8-x86_64.tar.gz"),
            "puppet-enterprise-2021.2-el-8-x86_64"
        );
        assert_eq!(extract_dir_name("media.tgz"), "media");
        assert_eq!(extract_dir_name("media.zip"), "media.zip.d");
    }

    #[test]
    fn required_rejects_blank_values() {
        assert_eq!(required(Some("pe1"), "missing").expect("value"), "pe1");
        assert!(required(Some("  "), "missing").is_err());
        assert_eq!(
            required(None, "--controller is required").unwrap_err().to_string(),
            "--controller is required"
        );
    }

    #[test]
    fn json_literals_escape_quotes() {
        assert_eq!(json("pa\"ss").expect("json"), "\"pa\\\"ss\"");
    }
}
