//! Loading the inventory file from disk.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::inventory::Inventory;
use crate::error::InstallError;

impl Inventory {
    /// Read and parse the inventory at `path`.
    ///
    /// A missing file is `InstallError::NotFound`, so callers can tell it
    /// apart from a malformed one.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(InstallError::NotFound {
                what: "inventory file",
                path: path.to_path_buf(),
            }
            .into());
        }
        let text =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let inventory =
            Inventory::parse(&text).with_context(|| format!("parse {}", path.display()))?;
        debug!(sections = ?inventory.sections(), "inventory loaded");
        Ok(inventory)
    }
}
