//! Shutdown signalling for session worker threads.
//!
//! The signal is a channel that never carries a message: closing it (or
//! dropping the handle) is the shutdown, so a worker can both check it
//! cheaply and sleep on it with a timeout.

use async_channel::{Receiver, Sender};
use futures::future::{self, Either};
use futures_timer::Delay;
use std::pin::pin;
use std::time::Duration;

/// Owner side of a shutdown signal. Signals when dropped.
#[derive(Debug)]
pub struct ShutdownHandle {
    sender: Sender<()>,
}

impl ShutdownHandle {
    /// Create a handle and the signal its worker watches.
    #[must_use]
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = async_channel::bounded(1);
        (Self { sender }, ShutdownSignal { receiver })
    }

    /// Signal shutdown now rather than on drop.
    pub fn shutdown(&self) {
        self.sender.close();
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        self.sender.close();
    }
}

/// Worker side of a shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: Receiver<()>,
}

impl ShutdownSignal {
    /// Whether shutdown was signalled (non-blocking).
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.receiver.is_closed()
    }

    /// Sleep for up to `timeout`, waking early on shutdown.
    ///
    /// Returns whether shutdown was signalled.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_shutdown() {
            return true;
        }
        pollster::block_on(async {
            let closed = pin!(self.receiver.recv());
            let delay = pin!(Delay::new(timeout));
            match future::select(closed, delay).await {
                Either::Left(_) => true,
                Either::Right(_) => self.is_shutdown(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn drop_signals_shutdown() {
        let (handle, signal) = ShutdownHandle::new();
        assert!(!signal.is_shutdown());
        drop(handle);
        assert!(signal.is_shutdown());
    }

    #[test]
    fn wait_timeout_expires_without_signal() {
        let (_handle, signal) = ShutdownHandle::new();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn wait_timeout_wakes_on_signal() {
        let (handle, signal) = ShutdownHandle::new();
        let waiter = thread::spawn(move || {
            let start = Instant::now();
            let signalled = signal.wait_timeout(Duration::from_secs(10));
            (signalled, start.elapsed())
        });
        thread::sleep(Duration::from_millis(20));
        handle.shutdown();
        let (signalled, elapsed) = waiter.join().unwrap();
        assert!(signalled);
        assert!(elapsed < Duration::from_secs(5));
    }
}
