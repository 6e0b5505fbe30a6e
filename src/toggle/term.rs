use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use signal_hook::consts::SIGWINCH;
use signal_hook::iterator::Signals;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::warn;

use crate::utils::threads::spawn_named_thread;

const FALLBACK_ROWS: u16 = 24;
const FALLBACK_COLS: u16 = 80;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("terminal attribute change failed: {0}")]
    Termios(#[from] nix::Error),

    #[error("signal watcher setup failed: {0}")]
    SignalSetup(#[from] std::io::Error),
}

/// Scoped raw-mode acquisition for the controlling terminal.
///
/// The saved attributes are restored on drop, so raw mode cannot outlive the
/// coordinator on any exit path that unwinds or returns. Signal-driven exits
/// route through the application event channel and unwind normally.
pub struct RawModeGuard {
    original: Termios,
}

impl RawModeGuard {
    pub fn enter() -> Result<Self, TerminalError> {
        let original = tcgetattr(std::io::stdin())?;
        let mut raw = original.clone();
        cfmakeraw(&mut raw);
        tcsetattr(std::io::stdin(), SetArg::TCSANOW, &raw)?;
        Ok(Self { original })
    }

    pub fn restore(&self) {
        if let Err(err) = tcsetattr(std::io::stdin(), SetArg::TCSANOW, &self.original) {
            warn!(error = %err, "terminal attributes could not be restored");
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Size of the controlling terminal, falling back to 80x24 when stdout is not
/// a tty.
pub fn terminal_size() -> (u16, u16) {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let rc = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if rc == 0 && ws.ws_row > 0 && ws.ws_col > 0 {
        (ws.ws_row, ws.ws_col)
    } else {
        (FALLBACK_ROWS, FALLBACK_COLS)
    }
}

/// Background SIGWINCH watcher. Calls `on_resize` with the fresh terminal
/// size after every window change; stops when dropped.
pub struct WinsizeWatcher {
    handle: signal_hook::iterator::Handle,
    thread: Option<JoinHandle<()>>,
}

impl WinsizeWatcher {
    pub fn spawn<F>(on_resize: F) -> Result<Self, TerminalError>
    where
        F: Fn(u16, u16) + Send + 'static,
    {
        let mut signals = Signals::new([SIGWINCH])?;
        let handle = signals.handle();
        let thread = spawn_named_thread("winsize-watcher", move || {
            for _signal in signals.forever() {
                let (rows, cols) = terminal_size();
                on_resize(rows, cols);
            }
        });
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }
}

impl Drop for WinsizeWatcher {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_size_has_a_sane_fallback() {
        let (rows, cols) = terminal_size();
        assert!(rows > 0);
        assert!(cols > 0);
    }

    #[test]
    fn winsize_watcher_reports_on_sigwinch() {
        let (tx, rx) = crossbeam::channel::bounded(4);
        let watcher = WinsizeWatcher::spawn(move |rows, cols| {
            let _ = tx.try_send((rows, cols));
        })
        .unwrap();

        nix::sys::signal::kill(nix::unistd::Pid::this(), nix::sys::signal::Signal::SIGWINCH)
            .unwrap();

        let (rows, cols) = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("resize callback should fire");
        assert!(rows > 0);
        assert!(cols > 0);
        drop(watcher);
    }
}
