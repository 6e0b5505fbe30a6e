use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::sync::Mutex;

/// Depth of each subscriber's chunk channel. A subscriber that falls this far
/// behind starts observing gaps instead of stalling the PTY reader.
const SUBSCRIBER_CHANNEL_DEPTH: usize = 256;

pub type SubscriberId = u64;

/// Capacity-bounded scrollback for one process's PTY output.
///
/// The ring does two jobs at once: it stores the most recent bytes for replay
/// and it fans every written chunk out to the current subscribers. The writer
/// never blocks. A subscriber whose channel is full loses that chunk (its
/// drop counter increments); all other subscribers are unaffected.
///
/// `snapshot_and_subscribe` performs both steps under the write lock, so no
/// byte written concurrently can be missed by the snapshot and duplicated on
/// the channel, or lost by both.
#[derive(Debug)]
pub struct ScrollbackRing {
    inner: Mutex<RingInner>,
}

#[derive(Debug)]
struct RingInner {
    buf: Box<[u8]>,
    write_pos: usize,
    wrapped: bool,
    subscribers: HashMap<SubscriberId, Subscriber>,
    next_id: SubscriberId,
}

#[derive(Debug)]
struct Subscriber {
    tx: Sender<Vec<u8>>,
    dropped_chunks: u64,
}

impl ScrollbackRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
                write_pos: 0,
                wrapped: false,
                subscribers: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Stores `chunk` (keeping only the newest bytes on overflow) and fans a
    /// copy out to every live subscriber. Always accepts the whole chunk.
    pub fn write(&self, chunk: &[u8]) -> usize {
        let mut inner = self.lock();
        inner.store(chunk);
        inner.fan_out(chunk);
        chunk.len()
    }

    /// Copy of the stored bytes in chronological order. Later writes do not
    /// mutate the returned buffer.
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().snapshot()
    }

    /// Registers a subscriber; every subsequent write delivers a copy of the
    /// written chunk on the returned channel.
    pub fn subscribe(&self) -> (SubscriberId, Receiver<Vec<u8>>) {
        self.lock().subscribe()
    }

    /// Atomic [snapshot](Self::snapshot) + [subscribe](Self::subscribe): the
    /// first chunk on the channel is exactly the first write after the
    /// returned snapshot.
    pub fn snapshot_and_subscribe(&self) -> (Vec<u8>, SubscriberId, Receiver<Vec<u8>>) {
        let mut inner = self.lock();
        let snapshot = inner.snapshot();
        let (id, rx) = inner.subscribe();
        (snapshot, id, rx)
    }

    /// Removes the subscriber and closes its channel. Unknown ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.lock().subscribers.remove(&id);
    }

    /// Chunks dropped so far for a lagging subscriber.
    pub fn dropped_chunks(&self, id: SubscriberId) -> Option<u64> {
        self.lock().subscribers.get(&id).map(|s| s.dropped_chunks)
    }

    pub fn capacity(&self) -> usize {
        self.lock().buf.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RingInner> {
        self.inner.lock().expect("scrollback lock poisoned")
    }
}

impl RingInner {
    fn store(&mut self, chunk: &[u8]) {
        let capacity = self.buf.len();
        // Only the newest `capacity` bytes of an oversized chunk can survive.
        let src = if chunk.len() > capacity {
            self.wrapped = true;
            &chunk[chunk.len() - capacity..]
        } else {
            chunk
        };

        let first = (capacity - self.write_pos).min(src.len());
        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&src[..first]);
        let rest = &src[first..];
        if !rest.is_empty() {
            self.buf[..rest.len()].copy_from_slice(rest);
            self.wrapped = true;
            self.write_pos = rest.len();
        } else {
            self.write_pos += first;
            if self.write_pos == capacity {
                self.wrapped = true;
                self.write_pos = 0;
            }
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        if self.wrapped {
            let mut out = Vec::with_capacity(self.buf.len());
            out.extend_from_slice(&self.buf[self.write_pos..]);
            out.extend_from_slice(&self.buf[..self.write_pos]);
            out
        } else {
            self.buf[..self.write_pos].to_vec()
        }
    }

    fn subscribe(&mut self) -> (SubscriberId, Receiver<Vec<u8>>) {
        let (tx, rx) = bounded(SUBSCRIBER_CHANNEL_DEPTH);
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(
            id,
            Subscriber {
                tx,
                dropped_chunks: 0,
            },
        );
        (id, rx)
    }

    fn fan_out(&mut self, chunk: &[u8]) {
        self.subscribers.retain(|_, sub| {
            match sub.tx.try_send(chunk.to_vec()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    sub.dropped_chunks += 1;
                    true
                }
                // Receiver went away without unsubscribing.
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }
}
