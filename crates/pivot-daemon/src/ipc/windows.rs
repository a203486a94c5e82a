//! Windows named pipe listener

use ssh_agent_lib::agent::NamedPipeListener;
use std::path::Path;

use crate::error::{DaemonError, Result};

pub(super) fn bind(path: &Path) -> Result<NamedPipeListener> {
    NamedPipeListener::bind(path.as_os_str())
        .map_err(|e| DaemonError::Ipc(format!("Failed to create named pipe: {}", e)))
}

/// Named pipes disappear with their last handle
pub(super) fn cleanup(_path: &Path) -> Result<()> {
    Ok(())
}
