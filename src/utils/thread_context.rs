use std::{
    thread::{sleep, JoinHandle},
    time::Duration,
};

use crate::{
    event::{
        cancellation::CancellationMessage,
        channel::{pub_sub, EventConsumer, EventPublisher},
    },
    utils::threads::spawn_named_thread,
};

const GRACEFUL_STOP_RETRY: u16 = 50;
const GRACEFUL_STOP_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// A named worker thread paired with the publisher that tells it to stop.
///
/// The callback receives a cancellation consumer and is expected to either
/// select on it or check it between units of work. Output relays rely on
/// [`ThreadContext::stop`] blocking until the thread has fully exited: no byte
/// may reach stdout from a relay that was asked to stop.
pub struct ThreadContext {
    thread_name: String,
    stop_publisher: EventPublisher<CancellationMessage>,
    join_handle: JoinHandle<()>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ThreadContextError {
    #[error("error sending stop signal to '{0}' thread: {1}")]
    StopSignal(String, String),

    #[error("error joining '{0}' thread")]
    Join(String),

    #[error("timeout waiting for '{0}' thread to finish")]
    StopTimeout(String),
}

impl ThreadContext {
    /// Spawns `callback` on a named thread, wired to a fresh stop channel.
    pub fn spawn<S, F>(thread_name: S, callback: F) -> Self
    where
        S: Into<String>,
        F: FnOnce(EventConsumer<CancellationMessage>) + Send + 'static,
    {
        let thread_name = thread_name.into();
        let (stop_publisher, stop_consumer) = pub_sub::<CancellationMessage>();
        let join_handle =
            spawn_named_thread(thread_name.clone(), move || callback(stop_consumer));
        Self {
            thread_name,
            stop_publisher,
            join_handle,
        }
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Sends the stop signal and blocks until the thread handle is joined.
    pub fn stop_blocking(self) -> Result<(), ThreadContextError> {
        // A thread that already returned dropped its consumer: the failed
        // publish is not an error in that case.
        let _ = self.stop_publisher.publish(());
        self.join_handle
            .join()
            .map_err(|_| ThreadContextError::Join(self.thread_name))
    }

    /// Sends the stop signal and polls for the thread to finish, giving up
    /// after a bounded number of retries.
    pub fn stop(self) -> Result<(), ThreadContextError> {
        let _ = self.stop_publisher.publish(());
        for _ in 0..GRACEFUL_STOP_RETRY {
            if self.join_handle.is_finished() {
                return self
                    .join_handle
                    .join()
                    .map_err(|_| ThreadContextError::Join(self.thread_name));
            }
            sleep(GRACEFUL_STOP_RETRY_INTERVAL);
        }
        Err(ThreadContextError::StopTimeout(self.thread_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn spawn_and_stop_blocking() {
        let ctx = ThreadContext::spawn("test-worker", |stop| loop {
            if stop.signalled_within(Duration::from_millis(1)) {
                break;
            }
        });
        assert!(!ctx.is_finished());
        ctx.stop_blocking().unwrap();
    }

    #[test]
    fn stop_times_out_on_stuck_thread() {
        let ctx = ThreadContext::spawn("stuck", |_stop| {
            sleep(Duration::from_secs(3600));
        });
        assert_eq!(
            ctx.stop().unwrap_err(),
            ThreadContextError::StopTimeout("stuck".to_string())
        );
    }

    #[test]
    fn stop_joins_thread_that_already_returned() {
        let ctx = ThreadContext::spawn("short-lived", |_stop| {});
        while !ctx.is_finished() {
            sleep(Duration::from_millis(1));
        }
        ctx.stop_blocking().unwrap();
    }
}
