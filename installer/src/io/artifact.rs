//! Locating the controller installer artifact on the local disk.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, instrument};

use crate::core::artifact::select_artifact;
use crate::error::InstallError;

/// Find the artifact to upload in `dir`.
///
/// Only regular files are considered. Fails with
/// `InstallError::ArtifactNotFound` when nothing matches `pattern`.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn find_artifact(dir: &Path, pattern: &Regex) -> Result<PathBuf> {
    let entries = fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }

    let selected = select_artifact(names.iter().map(String::as_str), pattern).ok_or_else(|| {
        InstallError::ArtifactNotFound {
            dir: dir.to_path_buf(),
            pattern: pattern.as_str().to_string(),
        }
    })?;
    debug!(artifact = selected, "selected installer artifact");
    Ok(dir.join(selected))
}
