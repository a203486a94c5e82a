//! Agent protocol listener
//!
//! Serves the SSH agent protocol on a Unix domain socket, or on a named pipe
//! on Windows. Wire encoding is handled by `ssh-agent-lib`.

mod server;
mod session;

#[cfg(unix)]
mod unix;

#[cfg(windows)]
mod windows;

// Public API
pub use server::AgentServer;
pub use session::AgentSession;
