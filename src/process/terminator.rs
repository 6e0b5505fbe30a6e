use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Grace period before a SIGTERM stop escalates to SIGKILL.
pub const KILL_ESCALATION_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Error, PartialEq)]
pub enum TerminateError {
    #[error("invalid stop signal number {0}")]
    InvalidSignal(i32),

    #[error("could not signal pid {pid}: {errno}")]
    Kill { pid: u32, errno: Errno },
}

/// Delivers stop signals to a child by pid, escalating to SIGKILL when asked.
///
/// Signalling a process that already exited is not an error: the stop path
/// always races the exit reaper.
pub struct ProcessTerminator {
    pid: u32,
}

impl ProcessTerminator {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    /// Sends the configured stop signal.
    pub fn signal(&self, signal_number: i32) -> Result<(), TerminateError> {
        let sig = Signal::try_from(signal_number)
            .map_err(|_| TerminateError::InvalidSignal(signal_number))?;
        self.deliver(sig)
    }

    /// Sends SIGTERM and, unless `wait_exited` reports the process gone within
    /// the escalation delay, follows up with SIGKILL.
    pub fn shutdown<F>(&self, wait_exited: F) -> Result<(), TerminateError>
    where
        F: FnOnce(Duration) -> bool,
    {
        self.deliver(Signal::SIGTERM)?;
        if !wait_exited(KILL_ESCALATION_DELAY) {
            debug!(pid = self.pid, "stop grace period elapsed, sending SIGKILL");
            self.deliver(Signal::SIGKILL)?;
        }
        Ok(())
    }

    fn deliver(&self, sig: Signal) -> Result<(), TerminateError> {
        match signal::kill(Pid::from_raw(self.pid as i32), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(TerminateError::Kill {
                pid: self.pid,
                errno,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::{
        process::Command,
        thread::{self, sleep},
        time::Duration,
    };

    #[rstest]
    #[case::ignores_sigterm(35, |_grace| false, "signal: 9 (SIGKILL)")]
    #[case::exits_in_time(1, |_grace| true, "exit status: 0")]
    fn shutdown_escalation(
        #[case] trap_sleep: u64,
        #[case] wait_exited: fn(Duration) -> bool,
        #[case] expected: &str,
    ) {
        let mut trap_cmd = Command::new("sh")
            .arg("-c")
            .arg(format!(
                "trap \"sleep {trap_sleep};exit 0\" TERM;while true; do sleep 1; done"
            ))
            .spawn()
            .unwrap();

        // Warm-up time for the trap sub-process to install its handler
        sleep(Duration::from_secs(1));

        let pid = trap_cmd.id();
        thread::spawn(move || {
            ProcessTerminator::new(pid).shutdown(wait_exited).unwrap();
        });

        let result = trap_cmd.wait().unwrap();
        assert_eq!(expected, result.to_string());
    }

    #[test]
    fn signalling_a_finished_process_is_not_an_error() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        // pid is reaped, ESRCH expected underneath
        assert_eq!(ProcessTerminator::new(pid).signal(15), Ok(()));
    }

    #[test]
    fn invalid_signal_number_is_rejected() {
        assert_eq!(
            ProcessTerminator::new(1).signal(4242),
            Err(TerminateError::InvalidSignal(4242))
        );
    }
}
