use crossbeam::select;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::event::cancellation::CancellationMessage;
use crate::event::channel::EventConsumer;
use crate::scrollback::{ScrollbackRing, SubscriberId};
use crate::state::{ProcessId, NO_SELECTION};
use crate::utils::thread_context::ThreadContext;

pub(crate) const CLEAR_SCREEN: &[u8] = b"\x1b[2J\x1b[H";

#[derive(Debug, Error)]
pub enum ViewerError {
    #[error("terminal write failed: {0}")]
    Io(#[from] io::Error),
}

/// Shared handle to the single output sink. Production uses stdout; tests
/// substitute a capture buffer.
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// The single writer to the controlling terminal.
///
/// At most one process is displayed at a time and at most one relay thread
/// exists at a time. Switching is atomic: the prior relay is stopped and
/// joined before the screen is cleared, and the new relay only starts after
/// the scrollback snapshot and header have been written. No byte from the
/// previous process can appear after the clear.
pub struct Viewer {
    inner: Mutex<ViewerInner>,
    out: SharedWriter,
}

struct ViewerInner {
    relay: Option<ThreadContext>,
    subscription: Option<(Arc<ScrollbackRing>, SubscriberId)>,
    current: ProcessId,
    placeholder: String,
}

impl Viewer {
    pub fn new(placeholder: String) -> Self {
        Self::with_writer(placeholder, Box::new(io::stdout()))
    }

    pub fn with_writer(placeholder: String, writer: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Mutex::new(ViewerInner {
                relay: None,
                subscription: None,
                current: NO_SELECTION,
                placeholder,
            }),
            out: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn current(&self) -> ProcessId {
        self.lock().current
    }

    pub fn set_placeholder(&self, text: String) {
        self.lock().placeholder = text;
    }

    /// Clears the display and renders the placeholder banner.
    pub fn show_placeholder(&self) -> Result<(), ViewerError> {
        self.switch(NO_SELECTION, "", None, true)
    }

    /// Switches the displayed process. A no-op when `id` is already shown.
    pub fn switch_to_process(
        &self,
        id: ProcessId,
        label: &str,
        ring: Option<Arc<ScrollbackRing>>,
    ) -> Result<(), ViewerError> {
        self.switch(id, label, ring, false)
    }

    /// Re-runs the full switch sequence even when `id` is unchanged. Used
    /// when the viewed process is restarted and its ring replaced.
    pub fn refresh_current_process(
        &self,
        id: ProcessId,
        label: &str,
        ring: Option<Arc<ScrollbackRing>>,
    ) -> Result<(), ViewerError> {
        self.switch(id, label, ring, true)
    }

    /// Stops the relay and releases the subscription without touching the
    /// display. The toggle coordinator calls this before handing the terminal
    /// to the client pane.
    pub fn suspend(&self) {
        let mut inner = self.lock();
        inner.stop_relay();
    }

    fn switch(
        &self,
        id: ProcessId,
        label: &str,
        ring: Option<Arc<ScrollbackRing>>,
        force: bool,
    ) -> Result<(), ViewerError> {
        let mut inner = self.lock();
        if !force && inner.current == id {
            return Ok(());
        }

        // The prior relay must be fully gone before stdout is touched.
        inner.stop_relay();
        inner.current = id;

        let mut out = self.lock_out();
        out.write_all(CLEAR_SCREEN)?;

        if id == NO_SELECTION {
            out.write_all(inner.placeholder.as_bytes())?;
            out.write_all(b"\r\n")?;
            out.flush()?;
            return Ok(());
        }

        let Some(ring) = ring else {
            out.write_all(format!("[{label} is not running]\r\n").as_bytes())?;
            out.flush()?;
            return Ok(());
        };

        // Snapshot and live channel are taken in one step so no byte between
        // them can be lost or duplicated.
        let (snapshot, sub_id, chunks) = ring.snapshot_and_subscribe();
        out.write_all(&snapshot)?;
        out.write_all(format!("\r\n[viewing {label}]\r\n").as_bytes())?;
        out.flush()?;
        drop(out);

        inner.subscription = Some((Arc::clone(&ring), sub_id));
        let out = Arc::clone(&self.out);
        inner.relay = Some(ThreadContext::spawn(
            format!("viewer-relay-{label}"),
            move |stop| relay_loop(chunks, out, stop),
        ));
        debug!(process = label, "viewer switched");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ViewerInner> {
        self.inner.lock().expect("viewer lock poisoned")
    }

    fn lock_out(&self) -> std::sync::MutexGuard<'_, Box<dyn Write + Send>> {
        self.out.lock().expect("viewer output lock poisoned")
    }
}

impl ViewerInner {
    fn stop_relay(&mut self) {
        if let Some(relay) = self.relay.take() {
            if let Err(err) = relay.stop_blocking() {
                warn!(error = %err, "viewer relay did not stop cleanly");
            }
        }
        if let Some((ring, sub_id)) = self.subscription.take() {
            ring.unsubscribe(sub_id);
        }
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.stop_relay();
        }
    }
}

fn relay_loop(
    chunks: crossbeam::channel::Receiver<Vec<u8>>,
    out: SharedWriter,
    stop: EventConsumer<CancellationMessage>,
) {
    loop {
        select! {
            recv(chunks) -> chunk => match chunk {
                Ok(chunk) => {
                    let mut out = out.lock().expect("viewer output lock poisoned");
                    if out.write_all(&chunk).and_then(|()| out.flush()).is_err() {
                        break;
                    }
                }
                // ring dropped the channel: instance is gone
                Err(_) => break,
            },
            recv(stop.as_ref()) -> _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }

        fn after_last_clear(&self) -> Vec<u8> {
            let data = self.contents();
            match data
                .windows(CLEAR_SCREEN.len())
                .rposition(|w| w == CLEAR_SCREEN)
            {
                Some(pos) => data[pos + CLEAR_SCREEN.len()..].to_vec(),
                None => data,
            }
        }
    }

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn viewer_with_capture() -> (Viewer, Capture) {
        let capture = Capture::default();
        let viewer = Viewer::with_writer("banner".to_string(), Box::new(capture.clone()));
        (viewer, capture)
    }

    fn wait_until(mut predicate: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !predicate() {
            assert!(std::time::Instant::now() < deadline, "condition never held");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn placeholder_renders_after_clear() {
        let (viewer, capture) = viewer_with_capture();
        viewer.show_placeholder().unwrap();
        let tail = capture.after_last_clear();
        assert!(tail.starts_with(b"banner"));
    }

    #[test]
    fn switch_replays_scrollback_then_streams_live() {
        let (viewer, capture) = viewer_with_capture();
        let ring = Arc::new(ScrollbackRing::new(1024));
        ring.write(b"history;");

        viewer.switch_to_process(2, "web", Some(Arc::clone(&ring))).unwrap();
        ring.write(b"live;");

        wait_until(|| {
            let data = capture.contents();
            data.windows(5).any(|w| w == b"live;")
        });
        let tail = capture.after_last_clear();
        let history_at = tail.windows(8).position(|w| w == b"history;").unwrap();
        let live_at = tail.windows(5).position(|w| w == b"live;").unwrap();
        assert!(history_at < live_at);
    }

    #[test]
    fn no_byte_from_the_previous_process_after_the_clear() {
        let (viewer, capture) = viewer_with_capture();
        let ring_a = Arc::new(ScrollbackRing::new(4096));
        let ring_b = Arc::new(ScrollbackRing::new(4096));
        ring_b.write(b"bbbb");

        viewer.switch_to_process(2, "a", Some(Arc::clone(&ring_a))).unwrap();

        // keep process A chatty while we switch away
        let stop_writes = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let writer = {
            let ring_a = Arc::clone(&ring_a);
            let stop_writes = Arc::clone(&stop_writes);
            std::thread::spawn(move || {
                while !stop_writes.load(std::sync::atomic::Ordering::Relaxed) {
                    ring_a.write(b"aaaa");
                }
            })
        };

        viewer.switch_to_process(3, "b", Some(Arc::clone(&ring_b))).unwrap();
        // A keeps producing after the switch; none of it may surface
        std::thread::sleep(Duration::from_millis(50));
        stop_writes.store(true, std::sync::atomic::Ordering::Relaxed);
        writer.join().unwrap();

        let tail = capture.after_last_clear();
        assert!(
            !tail.contains(&b'a'),
            "bytes from the previous process leaked past the clear"
        );
        assert!(tail.windows(4).any(|w| w == b"bbbb"));
    }

    #[test]
    fn switch_to_same_process_is_a_no_op() {
        let (viewer, capture) = viewer_with_capture();
        let ring = Arc::new(ScrollbackRing::new(64));
        viewer.switch_to_process(2, "web", Some(Arc::clone(&ring))).unwrap();
        let before = capture.contents().len();
        viewer.switch_to_process(2, "web", Some(ring)).unwrap();
        assert_eq!(capture.contents().len(), before);
    }

    #[test]
    fn refresh_forces_a_replay() {
        let (viewer, capture) = viewer_with_capture();
        let ring = Arc::new(ScrollbackRing::new(64));
        ring.write(b"once");
        viewer.switch_to_process(2, "web", Some(Arc::clone(&ring))).unwrap();
        let before = capture.contents().len();
        viewer.refresh_current_process(2, "web", Some(ring)).unwrap();
        assert!(capture.contents().len() > before);
    }

    #[test]
    fn halted_process_renders_a_notice() {
        let (viewer, capture) = viewer_with_capture();
        viewer.switch_to_process(2, "db", None).unwrap();
        let tail = capture.after_last_clear();
        assert!(tail.starts_with(b"[db is not running]"));
    }
}
