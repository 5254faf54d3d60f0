//! Periodic keep-alive on the active session

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, tick, Sender};
use tracing::{debug, warn};

use crate::remote::RemoteSession;

/// Session slot shared between the manager and the keep-alive thread
///
/// Holding the lock for a whole command keeps keep-alives from
/// interleaving with it.
pub type SharedSession<S> = Arc<Mutex<Option<S>>>;

/// Background thread sending a keep-alive every `interval`
///
/// Ticks with no session in the slot are skipped. Failures are logged and
/// never escalated. Dropping the handle stops and joins the thread.
pub struct KeepAlive {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl KeepAlive {
    pub fn spawn<S>(slot: SharedSession<S>, interval: Duration) -> Self
    where
        S: RemoteSession + 'static,
    {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let ticker = tick(interval);

        let handle = thread::Builder::new()
            .name("skyrun-keepalive".to_string())
            .spawn(move || loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => send_keepalive(&slot),
                }
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "failed to start keep-alive thread");
                None
            }
        };

        Self {
            stop: Some(stop_tx),
            handle,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the stop channel.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop();
    }
}

fn send_keepalive<S: RemoteSession>(slot: &SharedSession<S>) {
    let mut guard = match slot.lock() {
        Ok(guard) => guard,
        Err(_) => {
            warn!("session lock poisoned; skipping keep-alive");
            return;
        }
    };

    if let Some(session) = guard.as_mut() {
        match session.keepalive() {
            Ok(()) => debug!(host = session.host(), "keep-alive sent"),
            Err(e) => warn!(host = session.host(), error = %e, "keep-alive failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, ScriptedSession};

    #[test]
    fn test_sends_keepalives_until_stopped() {
        let session = ScriptedSession::new("10.0.0.9");
        let journal = session.script();
        let slot = Arc::new(Mutex::new(Some(session)));

        let mut keepalive = KeepAlive::spawn(slot.clone(), Duration::from_millis(10));
        assert!(keepalive.is_running());
        thread::sleep(Duration::from_millis(80));
        keepalive.stop();
        assert!(!keepalive.is_running());

        let sent = journal
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Keepalive { .. }))
            .count();
        assert!(sent >= 2, "expected several keep-alives, got {}", sent);

        let after_stop = journal.calls().len();
        thread::sleep(Duration::from_millis(40));
        assert_eq!(journal.calls().len(), after_stop);
    }

    #[test]
    fn test_empty_slot_is_skipped() {
        let slot: SharedSession<ScriptedSession> = Arc::new(Mutex::new(None));
        let keepalive = KeepAlive::spawn(slot, Duration::from_millis(5));
        thread::sleep(Duration::from_millis(20));
        drop(keepalive);
    }

    #[test]
    fn test_failed_keepalive_is_not_fatal() {
        let session = ScriptedSession::new("10.0.0.9");
        session.set_live(false);
        let journal = session.script();
        let slot = Arc::new(Mutex::new(Some(session)));

        let keepalive = KeepAlive::spawn(slot, Duration::from_millis(5));
        thread::sleep(Duration::from_millis(30));
        assert!(keepalive.is_running());
        drop(keepalive);

        assert!(journal
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Keepalive { .. })));
    }
}
