//! Unix domain socket listener

use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::Path;
use tokio::net::UnixListener;
use tracing::debug;

use crate::error::{DaemonError, Result};

/// Bind the agent socket, readable and writable by the owner only
pub(super) fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Remove a socket left behind by a previous run
    if let Ok(metadata) = std::fs::symlink_metadata(path) {
        if !metadata.file_type().is_socket() {
            return Err(DaemonError::Ipc(format!(
                "{:?} exists and is not a socket",
                path
            )));
        }
        debug!("Removing stale socket {:?}", path);
        std::fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path)
        .map_err(|e| DaemonError::Ipc(format!("Failed to bind socket: {}", e)))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

    Ok(listener)
}

pub(super) fn cleanup(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}
