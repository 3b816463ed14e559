//! Cancellable one-shot timer.

use std::{
    sync::mpsc::{channel, RecvTimeoutError, Sender},
    thread,
    time::Duration,
};

/// A callback scheduled to run once on its own thread after a delay.
///
/// Dropping the timer before it fires cancels it. Cancelling cannot interrupt a callback which
/// has already started.
pub struct ExpiryTimer {
    _cancel: Sender<()>,
}

impl ExpiryTimer {
    pub fn schedule<F>(name: &str, delay: Duration, callback: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel, cancelled) = channel::<()>();

        thread::Builder::new().name(name.into()).spawn(move || {
            // Both a cancel message and a dropped sender end the wait early
            if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(delay) {
                callback()
            }
        })?;

        Ok(Self { _cancel: cancel })
    }

    /// Cancel the timer, the same as dropping it.
    pub fn cancel(self) {}
}
