/*!
 * User-facing status event stream
 *
 * The lifecycle manager reports progress and failures as `StatusEvent`s on a
 * crossbeam channel. Every event is mirrored to `tracing` so it also lands
 * in the diagnostic log.
 */

use crossbeam_channel::{Receiver, Sender};
use tracing::{error, info, warn};

/// A status update for whoever presents progress to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Informational progress message
    Info(String),

    /// A failed step; the operation that emitted it reports the error too
    Error(String),

    /// The session to `host` was lost without a disconnect request
    Disconnected { host: String },

    /// Structural data cached from the lost instance can no longer be trusted
    InvalidateStructure,
}

/// Sending half of the status stream
///
/// A sink without a receiver only logs.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<StatusEvent>>,
}

impl EventSink {
    /// Create a sink and the receiver that observes it
    pub fn channel() -> (Self, Receiver<StatusEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that only writes to the log
    pub fn log_only() -> Self {
        Self { tx: None }
    }

    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.emit(StatusEvent::Info(message));
    }

    pub fn log_error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("{}", message);
        self.emit(StatusEvent::Error(message));
    }

    /// Report an involuntary disconnect and the cache invalidation it implies
    pub fn disconnected(&self, host: &str) {
        warn!(host, "session lost");
        self.emit(StatusEvent::Disconnected {
            host: host.to_string(),
        });
        self.emit(StatusEvent::InvalidateStructure);
    }

    fn emit(&self, event: StatusEvent) {
        if let Some(tx) = &self.tx {
            // A dropped receiver just means nobody is watching any more.
            let _ = tx.send(event);
        }
    }
}
