//! Script and document templates rendered with minijinja.
//!
//! Built-in templates are compiled into the binary. A templates directory may
//! override any of them with a file of the same name. Rendering is strict:
//! referencing a binding the caller did not supply is an error.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use serde::Serialize;
use tracing::debug;

const INSTALL_AGENT_TEMPLATE: &str = include_str!("templates/install_agent.sh.j2");
const INSTALL_CONTROLLER_TEMPLATE: &str = include_str!("templates/install_controller.sh.j2");
const STATUS_TEMPLATE: &str = include_str!("templates/status.sh.j2");
const CERT_ATTRIBUTES_TEMPLATE: &str = include_str!("templates/csr_attributes.yaml.j2");
const CODE_SYNC_CONFIG_TEMPLATE: &str = include_str!("templates/code_sync.yaml.j2");
const RUN_CODE_SYNC_TEMPLATE: &str = include_str!("templates/run_code_sync.sh.j2");
const SETUP_CODE_DEPLOY_TEMPLATE: &str = include_str!("templates/setup_code_deploy.sh.j2");

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TemplateId {
    InstallAgent,
    InstallController,
    Status,
    CertAttributes,
    CodeSyncConfig,
    RunCodeSync,
    SetupCodeDeploy,
}

impl TemplateId {
    pub const ALL: [TemplateId; 7] = [
        Self::InstallAgent,
        Self::InstallController,
        Self::Status,
        Self::CertAttributes,
        Self::CodeSyncConfig,
        Self::RunCodeSync,
        Self::SetupCodeDeploy,
    ];

    /// File name looked up in the override directory.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::InstallAgent => "install_agent.sh.j2",
            Self::InstallController => "install_controller.sh.j2",
            Self::Status => "status.sh.j2",
            Self::CertAttributes => "csr_attributes.yaml.j2",
            Self::CodeSyncConfig => "code_sync.yaml.j2",
            Self::RunCodeSync => "run_code_sync.sh.j2",
            Self::SetupCodeDeploy => "setup_code_deploy.sh.j2",
        }
    }

    fn builtin(self) -> &'static str {
        match self {
            Self::InstallAgent => INSTALL_AGENT_TEMPLATE,
            Self::InstallController => INSTALL_CONTROLLER_TEMPLATE,
            Self::Status => STATUS_TEMPLATE,
            Self::CertAttributes => CERT_ATTRIBUTES_TEMPLATE,
            Self::CodeSyncConfig => CODE_SYNC_CONFIG_TEMPLATE,
            Self::RunCodeSync => RUN_CODE_SYNC_TEMPLATE,
            Self::SetupCodeDeploy => SETUP_CODE_DEPLOY_TEMPLATE,
        }
    }
}

/// Template sources plus the rendering environment.
pub struct Templates {
    env: Environment<'static>,
    sources: BTreeMap<TemplateId, String>,
}

impl Templates {
    pub fn builtin() -> Self {
        let sources = TemplateId::ALL
            .into_iter()
            .map(|id| (id, id.builtin().to_string()))
            .collect();
        Self {
            env: environment(),
            sources,
        }
    }

    /// Built-in templates, each replaced by `<override_dir>/<file_name>` when present.
    pub fn load(override_dir: Option<&Path>) -> Result<Self> {
        let mut templates = Self::builtin();
        let Some(dir) = override_dir else {
            return Ok(templates);
        };
        for id in TemplateId::ALL {
            let path = dir.join(id.file_name());
            if !path.is_file() {
                continue;
            }
            let source =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            debug!(template = id.file_name(), path = %path.display(), "using template override");
            templates.sources.insert(id, source);
        }
        Ok(templates)
    }

    pub fn render<S: Serialize>(&self, id: TemplateId, ctx: S) -> Result<String> {
        let source = self
            .sources
            .get(&id)
            .map(String::as_str)
            .unwrap_or_else(|| id.builtin());
        self.env
            .render_named_str(id.file_name(), source, ctx)
            .with_context(|| format!("render template {}", id.file_name()))
    }
}

fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    // Values are quoted for their target by the caller.
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.set_keep_trailing_newline(true);
    env
}
