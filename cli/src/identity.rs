// Local identifier: a v4 UUID generated once and kept in a read-only file

use anyhow::{Context, Result};
use fsend_core::protocol;
use std::path::Path;
use uuid::Uuid;

/// Read the identifier at `path`, generating and persisting a new one if the
/// file does not exist yet
pub fn load_or_create(path: &Path) -> Result<String> {
    if path.exists() {
        return load(path);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create identifier directory")?;
    }

    let uid = Uuid::new_v4().to_string();
    std::fs::write(path, &uid)
        .with_context(|| format!("Failed to write identifier file {}", path.display()))?;

    let mut permissions = std::fs::metadata(path)
        .context("Failed to read identifier file metadata")?
        .permissions();
    permissions.set_readonly(true);
    std::fs::set_permissions(path, permissions).context("Failed to protect identifier file")?;

    tracing::info!(uid = %uid, path = %path.display(), "Generated new identifier");
    Ok(uid)
}

fn load(path: &Path) -> Result<String> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read identifier file {}", path.display()))?;
    let uid = contents.trim();
    if uid.is_empty() {
        anyhow::bail!("Identifier file {} is empty", path.display());
    }
    protocol::validate_field("uid", uid)?;
    Ok(uid.to_string())
}
