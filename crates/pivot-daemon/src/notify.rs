//! Desktop notification sinks

use std::process::{Command, Stdio};
use tracing::{info, warn};

/// A shown notification that may be taken down again
#[derive(Default)]
pub struct Notification {
    dismiss: Option<Box<dyn FnOnce() + Send>>,
}

impl Notification {
    /// A notification with nothing to take down
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_dismiss(dismiss: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dismiss: Some(Box::new(dismiss)),
        }
    }

    /// Take the notification down
    pub fn dismiss(mut self) {
        if let Some(dismiss) = self.dismiss.take() {
            dismiss();
        }
    }
}

/// Where user-visible prompts go
///
/// Notifying is fire-and-forget: failures are logged by the sink and never
/// reach the operation that triggered them.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str) -> Notification;
}

/// Runs an external command with the message appended
pub struct CommandNotifier {
    argv: Vec<String>,
}

impl CommandNotifier {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl NotificationSink for CommandNotifier {
    fn notify(&self, message: &str) -> Notification {
        let Some((program, args)) = self.argv.split_first() else {
            return LogNotifier.notify(message);
        };

        let spawned = Command::new(program)
            .args(args)
            .arg(message)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match spawned {
            Ok(mut child) => Notification::with_dismiss(move || {
                // The helper may already have exited
                let _ = child.kill();
                let _ = child.wait();
            }),
            Err(e) => {
                warn!(program = %program, "Failed to show notification: {}", e);
                Notification::none()
            }
        }
    }
}

/// Writes notifications to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, message: &str) -> Notification {
        info!("{}", message);
        Notification::none()
    }
}

#[cfg(any(test, feature = "fake-device"))]
pub use recording::RecordingNotifier;

#[cfg(any(test, feature = "fake-device"))]
mod recording {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{Notification, NotificationSink};

    /// Counts shown and dismissed notifications
    #[derive(Clone, Default)]
    pub struct RecordingNotifier {
        shown: Arc<AtomicUsize>,
        dismissed: Arc<AtomicUsize>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn shown(&self) -> usize {
            self.shown.load(Ordering::SeqCst)
        }

        pub fn dismissed(&self) -> usize {
            self.dismissed.load(Ordering::SeqCst)
        }
    }

    impl NotificationSink for RecordingNotifier {
        fn notify(&self, _message: &str) -> Notification {
            self.shown.fetch_add(1, Ordering::SeqCst);
            let dismissed = Arc::clone(&self.dismissed);
            Notification::with_dismiss(move || {
                dismissed.fetch_add(1, Ordering::SeqCst);
            })
        }
    }
}
