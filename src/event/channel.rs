use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use thiserror::Error;

/// Receiving half of an event channel.
#[derive(Debug)]
pub struct EventConsumer<E>(Receiver<E>);

impl<E> From<Receiver<E>> for EventConsumer<E> {
    fn from(value: Receiver<E>) -> Self {
        Self(value)
    }
}

/// Sending half of an event channel.
#[derive(Debug)]
pub struct EventPublisher<E>(Sender<E>);

impl<E> From<Sender<E>> for EventPublisher<E> {
    fn from(value: Sender<E>) -> Self {
        Self(value)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum EventPublisherError {
    #[error("error while publishing event: {0}")]
    SendError(String),
}

/// Builds an unbounded publisher/consumer pair.
pub fn pub_sub<E>() -> (EventPublisher<E>, EventConsumer<E>) {
    let (s, r) = unbounded();
    (EventPublisher(s), EventConsumer(r))
}

/// Builds a bounded publisher/consumer pair holding at most `capacity`
/// undelivered events.
pub fn bounded_pub_sub<E>(capacity: usize) -> (EventPublisher<E>, EventConsumer<E>) {
    let (s, r) = bounded(capacity);
    (EventPublisher(s), EventConsumer(r))
}

impl<E> EventPublisher<E> {
    /// Blocks until the event is accepted or every consumer is gone.
    pub fn publish(&self, event: E) -> Result<(), EventPublisherError> {
        self.0
            .send(event)
            .map_err(|err| EventPublisherError::SendError(err.to_string()))
    }

    /// Never blocks. Fails when the channel is full or disconnected.
    pub fn try_publish(&self, event: E) -> Result<(), EventPublisherError> {
        self.0
            .try_send(event)
            .map_err(|err| EventPublisherError::SendError(err.to_string()))
    }
}

impl<E> Clone for EventPublisher<E> {
    fn clone(&self) -> Self {
        EventPublisher(self.0.clone())
    }
}

// Exit watchers and stop watchdogs wait on the same instance exit channel, so
// consumers are cloneable as well.
impl<E> Clone for EventConsumer<E> {
    fn clone(&self) -> Self {
        EventConsumer(self.0.clone())
    }
}

impl<E> AsRef<Receiver<E>> for EventConsumer<E> {
    fn as_ref(&self) -> &Receiver<E> {
        &self.0
    }
}
