//! Touch watchdog
//!
//! Armed around every signature. If the hardware has not answered once the
//! grace period elapses, a notification asks the user to touch the token.
//! PIN prompts pause the watchdog so the two never show at the same time.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::debug;

use pivot_core::TOUCH_PROMPT;

use crate::notify::{Notification, NotificationSink};

/// Factory for per-signature watchdog timers
#[derive(Clone)]
pub struct TouchWatchdog {
    grace: Duration,
    sink: Arc<dyn NotificationSink>,
    runtime: Handle,
}

impl TouchWatchdog {
    /// Timers are spawned on `runtime`, so arming works from blocking threads
    pub fn new(grace: Duration, sink: Arc<dyn NotificationSink>, runtime: Handle) -> Self {
        Self {
            grace,
            sink,
            runtime,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Start a timer for one signature
    pub fn arm(&self) -> ArmedWatchdog {
        let mut armed = ArmedWatchdog {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Paused),
                sink: Arc::clone(&self.sink),
            }),
            grace: self.grace,
            runtime: self.runtime.clone(),
            cancel: None,
            epoch: 0,
        };
        armed.start();
        armed
    }
}

enum State {
    Waiting { epoch: u64 },
    Paused,
    Fired(Notification),
    Retired,
}

struct Shared {
    state: Mutex<State>,
    sink: Arc<dyn NotificationSink>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Called by the timer task once the grace period elapsed
    fn fire(&self, epoch: u64) {
        let mut state = self.state();
        if matches!(*state, State::Waiting { epoch: current } if current == epoch) {
            debug!("Signature still pending, asking for touch");
            *state = State::Fired(self.sink.notify(TOUCH_PROMPT));
        }
    }

    /// Move to `next`, returning a notification that must be taken down
    fn replace(&self, next: State) -> Option<Notification> {
        match std::mem::replace(&mut *self.state(), next) {
            State::Fired(notification) => Some(notification),
            _ => None,
        }
    }
}

/// A running timer for one signature
///
/// Dropping it cancels the timer and takes down any notification it showed,
/// so every exit path of a signature retires the watchdog.
pub struct ArmedWatchdog {
    shared: Arc<Shared>,
    grace: Duration,
    runtime: Handle,
    cancel: Option<oneshot::Sender<()>>,
    epoch: u64,
}

impl ArmedWatchdog {
    fn start(&mut self) {
        self.epoch += 1;
        let epoch = self.epoch;
        self.shared.replace(State::Waiting { epoch });

        let (cancel, cancelled) = oneshot::channel::<()>();
        self.cancel = Some(cancel);

        let shared = Arc::clone(&self.shared);
        let grace = self.grace;
        self.runtime.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(grace) => shared.fire(epoch),
                // Sent or dropped, either way the timer is cancelled
                _ = cancelled => {}
            }
        });
    }

    fn stop(&mut self, next: State) {
        self.cancel.take();
        if let Some(notification) = self.shared.replace(next) {
            notification.dismiss();
        }
    }

    /// Suspend the timer while a PIN prompt is open
    ///
    /// The timer restarts with a full grace period when the guard drops.
    pub fn pause(&mut self) -> PausedWatchdog<'_> {
        self.stop(State::Paused);
        PausedWatchdog { watchdog: self }
    }

    /// Whether the touch notification has been shown
    pub fn has_fired(&self) -> bool {
        matches!(*self.shared.state(), State::Fired(_))
    }

    /// Cancel the timer and take down any notification
    pub fn disarm(self) {}
}

impl Drop for ArmedWatchdog {
    fn drop(&mut self) {
        self.stop(State::Retired);
    }
}

/// Keeps a watchdog paused until dropped
pub struct PausedWatchdog<'a> {
    watchdog: &'a mut ArmedWatchdog,
}

impl Drop for PausedWatchdog<'_> {
    fn drop(&mut self) {
        self.watchdog.start();
    }
}
