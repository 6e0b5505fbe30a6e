use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::{Arc, Mutex};

/// A bounded broadcast channel that never blocks the producer.
///
/// Every subscriber gets its own bounded channel. When a subscriber's channel
/// is full the oldest queued message is discarded to make room for the new
/// one, so a stalled consumer observes a gap instead of stalling the sender.
/// Disconnected subscribers are pruned on the next broadcast.
#[derive(Debug, Clone)]
pub struct BoundedBroadcast<T> {
    capacity: usize,
    subscribers: Arc<Mutex<Vec<Subscription<T>>>>,
}

#[derive(Debug)]
struct Subscription<T> {
    tx: Sender<T>,
    // kept so the broadcaster can discard the oldest element on overflow
    rx: Receiver<T>,
}

impl<T: Clone> BoundedBroadcast<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a new receiver on the channel.
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = bounded(self.capacity);
        self.subscribers
            .lock()
            .expect("broadcast subscriber list poisoned")
            .push(Subscription { tx, rx: rx.clone() });
        rx
    }

    /// Delivers `message` to every live subscriber, dropping each full
    /// subscriber's oldest queued message first.
    pub fn broadcast(&self, message: T) {
        self.subscribers
            .lock()
            .expect("broadcast subscriber list poisoned")
            .retain(|sub| match sub.tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(msg)) => {
                    let _ = sub.rx.try_recv();
                    !matches!(sub.tx.try_send(msg), Err(TrySendError::Disconnected(_)))
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
    }
}
