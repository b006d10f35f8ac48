use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;

/// Platform data directory for burnbox (`~/.local/share/burnbox/`, etc.).
///
/// Only consulted when neither `secrets.storage_path` nor `BURNBOX_DATA_DIR`
/// is set. The directory is not created here; the file store does that.
pub fn data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", "burnbox")
        .context("could not determine platform data directory")?;
    Ok(dirs.data_dir().to_owned())
}
