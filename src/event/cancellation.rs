use super::channel::EventConsumer;
use crossbeam::channel::RecvTimeoutError;
use std::time::Duration;

/// Unit message published to ask a worker to wind down.
pub type CancellationMessage = ();

impl<E> EventConsumer<E> {
    /// Waits up to `timeout` for the next event, consuming it.
    ///
    /// Returns true when an event arrived or every publisher is gone, false
    /// when the wait timed out quietly. A vanished publisher counts as a
    /// signal on purpose: a relay whose stop channel was dropped must wind
    /// down, and an exit channel whose instance is being torn down means the
    /// child is done. Stop consumers poll this with a short timeout between
    /// units of work; the stop watchdog runs it against an instance's exit
    /// channel to wait out the whole kill grace period.
    pub fn signalled_within(&self, timeout: Duration) -> bool {
        match self.as_ref().recv_timeout(timeout) {
            Ok(_) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::event::channel::pub_sub;
    use std::time::Duration;

    #[test]
    fn signalled_after_publish() {
        let (publisher, consumer) = pub_sub();
        publisher.publish(()).unwrap();
        assert!(consumer.signalled_within(Duration::from_millis(10)));
    }

    #[test]
    fn quiet_channel_times_out() {
        let (_publisher, consumer) = pub_sub::<()>();
        assert!(!consumer.signalled_within(Duration::from_millis(10)));
    }

    #[test]
    fn dropped_publisher_counts_as_a_signal() {
        let (publisher, consumer) = pub_sub::<()>();
        drop(publisher);
        assert!(consumer.signalled_within(Duration::from_millis(10)));
    }

    #[test]
    fn works_on_typed_event_channels() {
        // the stop watchdog waits on an instance's exit channel this way
        let (publisher, consumer) = pub_sub::<i32>();
        publisher.publish(7).unwrap();
        assert!(consumer.signalled_within(Duration::from_millis(10)));
        // the event was consumed by the wait
        assert!(consumer.as_ref().try_recv().is_err());
    }
}
