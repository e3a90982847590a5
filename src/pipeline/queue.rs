//! Bounded stage queues with stop-aware send and receive.
//!
//! Producers block while a queue is full and consumers block while it is
//! empty, but both sides poll the shared stop flag so a shutdown is never
//! wedged behind a full or empty queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// How often blocked senders and receivers re-check the stop flag.
const QUEUE_POLL: Duration = Duration::from_millis(100);

/// Shared stop signal for all pipeline workers.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Error returned when a send is abandoned.
#[derive(Debug, PartialEq, Eq)]
pub enum SendAborted {
    /// The stop flag was set while waiting for capacity.
    Stopped,
    /// The receiver is gone.
    Closed,
}

/// Sending half of a bounded stage queue.
#[derive(Debug, Clone)]
pub struct BatchSender<T> {
    tx: mpsc::Sender<T>,
}

/// Receiving half of a bounded stage queue.
#[derive(Debug)]
pub struct BatchReceiver<T> {
    rx: mpsc::Receiver<T>,
}

/// Create a bounded queue with the given capacity.
pub fn bounded<T>(capacity: usize) -> (BatchSender<T>, BatchReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (BatchSender { tx }, BatchReceiver { rx })
}

impl<T> BatchSender<T> {
    /// Push an item, waiting for capacity but giving up once `stop` is set.
    pub async fn send(&self, mut item: T, stop: &StopFlag) -> Result<(), SendAborted> {
        loop {
            if stop.is_set() {
                return Err(SendAborted::Stopped);
            }
            match self.tx.try_send(item) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(returned)) => {
                    item = returned;
                    tokio::time::sleep(QUEUE_POLL).await;
                }
                Err(TrySendError::Closed(_)) => return Err(SendAborted::Closed),
            }
        }
    }
}

impl<T> BatchReceiver<T> {
    /// Take the next item, returning `None` after `wait` with nothing queued.
    ///
    /// Consumer loops call this with a short timeout so they can observe the
    /// stop flag between items.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<T> {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(item) => item,
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_recv_roundtrip() {
        let stop = StopFlag::new();
        let (tx, mut rx) = bounded::<u32>(2);
        tx.send(7, &stop).await.unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_millis(50)).await, Some(7));
        assert_eq!(rx.recv_timeout(Duration::from_millis(50)).await, None);
    }

    #[tokio::test]
    async fn test_send_aborts_on_stop() {
        let stop = StopFlag::new();
        let (tx, _rx) = bounded::<u32>(1);
        tx.send(1, &stop).await.unwrap();

        // Queue is now full; a stop set from elsewhere must unblock the send.
        let stop_clone = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop_clone.set();
        });
        let result = tx.send(2, &stop).await;
        assert_eq!(result, Err(SendAborted::Stopped));
    }

    #[tokio::test]
    async fn test_send_fails_when_receiver_dropped() {
        let stop = StopFlag::new();
        let (tx, rx) = bounded::<u32>(1);
        drop(rx);
        assert_eq!(tx.send(1, &stop).await, Err(SendAborted::Closed));
    }
}
