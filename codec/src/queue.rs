//! Unbounded FIFO hand-off between a session's thread and its consumers.

use async_channel::{Receiver, Sender};
use futures::future::{self, Either};
use futures_timer::Delay;
use std::pin::pin;
use std::time::Duration;

/// Producer side of the output queue, owned by a session.
///
/// Pushing never blocks. Closing marks the end of output: consumers still
/// receive everything queued before the close, then see `None` immediately.
#[derive(Debug)]
pub struct OutputQueue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T> Default for OutputQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OutputQueue<T> {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        Self { sender, receiver }
    }

    /// Append a unit.
    ///
    /// Returns `false` if the queue was already closed, in which case the
    /// unit is dropped.
    pub fn push(&self, unit: T) -> bool {
        // Unbounded, so the only failure is a closed channel.
        self.sender.try_send(unit).is_ok()
    }

    /// A consumer handle. Handles can be cloned and moved to other threads.
    #[must_use]
    pub fn receiver(&self) -> OutputReceiver<T> {
        OutputReceiver {
            receiver: self.receiver.clone(),
        }
    }

    /// Mark the end of output.
    pub fn close(&self) {
        self.sender.close();
    }

    /// Whether the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Number of queued units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    /// Whether no units are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

/// Consumer side of an [`OutputQueue`].
#[derive(Debug)]
pub struct OutputReceiver<T> {
    receiver: Receiver<T>,
}

impl<T> Clone for OutputReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
        }
    }
}

impl<T> OutputReceiver<T> {
    /// Take the oldest unit if one is queued (non-blocking).
    #[must_use]
    pub fn try_poll(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Wait up to `timeout` for the oldest unit.
    ///
    /// `Duration::ZERO` polls once without waiting. Returns `None` on timeout
    /// or once the queue is closed and empty. A unit arriving after the
    /// timeout stays queued for the next call.
    #[must_use]
    pub fn poll(&self, timeout: Duration) -> Option<T> {
        if let Some(unit) = self.try_poll() {
            return Some(unit);
        }
        if timeout.is_zero() {
            return None;
        }
        pollster::block_on(self.recv_timeout(timeout))
    }

    /// Wait for the oldest unit (async).
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn recv(&self) -> Option<T> {
        self.receiver.recv().await.ok()
    }

    /// Wait up to `timeout` for the oldest unit (async).
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        let recv = pin!(self.receiver.recv());
        let delay = pin!(Delay::new(timeout));
        // Dropping a pending `recv` does not consume anything.
        match future::select(recv, delay).await {
            Either::Left((unit, _)) => unit.ok(),
            Either::Right(((), _)) => None,
        }
    }

    /// Take every unit queued right now, oldest first.
    #[must_use]
    pub fn drain(&self) -> Vec<T> {
        std::iter::from_fn(|| self.try_poll()).collect()
    }

    /// Number of queued units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether no units are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Whether the producer has closed the queue.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.receiver.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn preserves_insertion_order() {
        let queue = OutputQueue::new();
        let receiver = queue.receiver();
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(queue.push(3));
        assert_eq!(receiver.poll(Duration::ZERO), Some(1));
        assert_eq!(receiver.poll(Duration::ZERO), Some(2));
        assert_eq!(receiver.poll(Duration::ZERO), Some(3));
        assert_eq!(receiver.poll(Duration::ZERO), None);
    }

    #[test]
    fn zero_timeout_does_not_wait() {
        let queue = OutputQueue::<u8>::new();
        let start = Instant::now();
        assert_eq!(queue.receiver().poll(Duration::ZERO), None);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn timed_out_poll_keeps_late_unit() {
        let queue = OutputQueue::new();
        let receiver = queue.receiver();
        assert_eq!(receiver.poll(Duration::from_millis(20)), None);
        queue.push("late");
        assert_eq!(receiver.poll(Duration::ZERO), Some("late"));
    }

    #[test]
    fn poll_waits_for_other_thread() {
        let queue = OutputQueue::new();
        let receiver = queue.receiver();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            queue.push(7_u32);
            queue
        });
        assert_eq!(receiver.poll(Duration::from_secs(5)), Some(7));
        let _queue = producer.join().unwrap();
    }

    #[test]
    fn closed_queue_drains_then_ends() {
        let queue = OutputQueue::new();
        let receiver = queue.receiver();
        queue.push('a');
        queue.push('b');
        queue.close();
        assert!(!queue.push('c'));
        assert!(receiver.is_closed());

        assert_eq!(receiver.drain(), vec!['a', 'b']);
        let start = Instant::now();
        assert_eq!(receiver.poll(Duration::from_secs(5)), None);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn async_recv_sees_units_and_close() {
        let queue = OutputQueue::new();
        let receiver = queue.receiver();
        queue.push(10);
        assert_eq!(receiver.recv().await, Some(10));
        assert_eq!(receiver.recv_timeout(Duration::from_millis(10)).await, None);
        queue.close();
        assert_eq!(receiver.recv().await, None);
    }
}
