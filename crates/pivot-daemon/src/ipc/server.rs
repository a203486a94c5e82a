//! Listener setup and the accept loop

use std::path::PathBuf;
use ssh_agent_lib::agent::listen;
use tracing::info;

use crate::agent::PivAgent;
use crate::error::{DaemonError, Result};

use super::session::AgentSession;

#[cfg(unix)]
use super::unix as platform;
#[cfg(windows)]
use super::windows as platform;

/// Agent protocol server
pub struct AgentServer {
    /// Socket path or pipe name
    socket_path: PathBuf,

    /// Agent core shared by every connection
    agent: PivAgent,
}

impl AgentServer {
    pub fn new(socket_path: PathBuf, agent: PivAgent) -> Self {
        Self { socket_path, agent }
    }

    /// Accept connections until the listener fails
    ///
    /// Each connection gets its own session task; requests within one
    /// connection are handled in order.
    pub async fn run(&self) -> Result<()> {
        let listener = platform::bind(&self.socket_path)?;

        info!("Agent listening on {:?}", self.socket_path);
        info!(
            "Use it with: export SSH_AUTH_SOCK=\"{}\"",
            self.socket_path.display()
        );

        listen(listener, AgentSession::new(self.agent.clone()))
            .await
            .map_err(|e| DaemonError::Ipc(format!("listener failed: {}", e)))
    }

    /// Remove the listener's filesystem entry, if any
    pub fn cleanup(&self) -> Result<()> {
        platform::cleanup(&self.socket_path)
    }
}
