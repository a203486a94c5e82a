//! Pivot Daemon - SSH agent backed by PIV hardware tokens
//!
//! This crate provides:
//! - Token discovery, health checks and reconnection
//! - The agent core: key listing and signing with algorithm negotiation
//! - A touch watchdog that notifies while a signature waits for touch
//! - A pinentry PIN broker and desktop notification sinks
//! - The agent protocol listener (Unix socket or Windows named pipe)

pub mod agent;
pub mod config;
pub mod device;
pub mod error;
pub mod ipc;
pub mod notify;
pub mod pinentry;
pub mod registry;
pub mod signer;
pub mod watchdog;

pub use agent::{PivAgent, SignerReport};
pub use config::{DaemonConfig, DeviceSelector, ReleasePolicy};
pub use error::{DaemonError, Result};
pub use ipc::{AgentServer, AgentSession};
pub use notify::{CommandNotifier, LogNotifier, Notification, NotificationSink};
pub use pinentry::PinentryBroker;
pub use registry::DeviceRegistry;
pub use watchdog::{ArmedWatchdog, TouchWatchdog};
