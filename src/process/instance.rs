use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ProcessConfig;
use crate::event::channel::{pub_sub, EventConsumer, EventPublisher};
use crate::scrollback::ScrollbackRing;
use crate::utils::threads::spawn_named_thread;

const PTY_READ_BUF: usize = 4096;

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("process `{0}` configures no runnable command")]
    NoCommand(String),

    #[error("could not allocate a pty for `{label}`: {reason}")]
    OpenPty { label: String, reason: String },

    #[error("could not spawn `{label}`: {reason}")]
    Spawn { label: String, reason: String },
}

/// Exit notification published once the child has been waited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitEvent {
    /// Exit code when the child exited normally, `None` when it was killed by
    /// a signal or the wait itself failed.
    pub code: Option<u32>,
}

/// One running child program under a PTY.
///
/// Owns the PTY master and the scrollback ring. Two background threads live
/// with it: a reader pumping master output into the ring and a waiter that
/// publishes the [ExitEvent] exactly once. Dropping the instance closes the
/// master, which the kernel turns into EOF/SIGHUP for the child.
pub struct Instance {
    label: String,
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    ring: Arc<ScrollbackRing>,
    exit: EventConsumer<ExitEvent>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Instance {
    /// Spawns the configured command under a fresh PTY of the given size.
    pub fn spawn(
        label: &str,
        config: &ProcessConfig,
        size: PtySize,
        scrollback_bytes: usize,
    ) -> Result<Self, InstanceError> {
        let cmd = build_command(label, config)?;

        let pty = native_pty_system()
            .openpty(size)
            .map_err(|err| InstanceError::OpenPty {
                label: label.to_string(),
                reason: err.to_string(),
            })?;

        let child = pty
            .slave
            .spawn_command(cmd)
            .map_err(|err| InstanceError::Spawn {
                label: label.to_string(),
                reason: err.to_string(),
            })?;
        // The slave handle is only needed for the spawn itself.
        drop(pty.slave);

        let pid = child.process_id();
        let reader = pty
            .master
            .try_clone_reader()
            .map_err(|err| InstanceError::Spawn {
                label: label.to_string(),
                reason: err.to_string(),
            })?;
        let writer = pty
            .master
            .take_writer()
            .map_err(|err| InstanceError::Spawn {
                label: label.to_string(),
                reason: err.to_string(),
            })?;

        let ring = Arc::new(ScrollbackRing::new(scrollback_bytes));
        spawn_reader(label, reader, Arc::clone(&ring));

        let (exit_publisher, exit) = pub_sub::<ExitEvent>();
        spawn_waiter(label, child, exit_publisher);

        debug!(process = label, pid, "spawned instance");
        Ok(Self {
            label: label.to_string(),
            pid,
            master: Mutex::new(pty.master),
            writer: Mutex::new(writer),
            ring,
            exit,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn ring(&self) -> Arc<ScrollbackRing> {
        Arc::clone(&self.ring)
    }

    /// A clone of the exit channel; every holder observes the single exit
    /// event (first come, first served between clones).
    pub fn exit_consumer(&self) -> EventConsumer<ExitEvent> {
        self.exit.clone()
    }

    /// Forwards operator keystrokes to the child's stdin. Write failures are
    /// logged and swallowed: a dying child must not poison the command loop.
    pub fn write_input(&self, bytes: &[u8]) {
        let mut writer = self.writer.lock().expect("pty writer lock poisoned");
        if let Err(err) = writer.write_all(bytes).and_then(|()| writer.flush()) {
            warn!(process = %self.label, error = %err, "pty stdin write failed");
        }
    }

    pub fn resize(&self, rows: u16, cols: u16) {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let master = self.master.lock().expect("pty master lock poisoned");
        if let Err(err) = master.resize(size) {
            warn!(process = %self.label, error = %err, "pty resize failed");
        }
    }
}

fn build_command(label: &str, config: &ProcessConfig) -> Result<CommandBuilder, InstanceError> {
    let mut cmd = match (&config.shell, &config.cmd) {
        (Some(shell), None) => {
            let mut cmd = CommandBuilder::new("/bin/sh");
            cmd.args(["-c", shell.as_str()]);
            cmd
        }
        (None, Some(argv)) if !argv.is_empty() => {
            let mut cmd = CommandBuilder::new(&argv[0]);
            cmd.args(&argv[1..]);
            cmd
        }
        _ => return Err(InstanceError::NoCommand(label.to_string())),
    };

    if let Some(cwd) = &config.cwd {
        cmd.cwd(cwd);
    }
    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    if !config.add_path.is_empty() {
        let mut path = config
            .add_path
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":");
        if let Ok(inherited) = std::env::var("PATH") {
            path.push(':');
            path.push_str(&inherited);
        }
        cmd.env("PATH", path);
    }
    Ok(cmd)
}

fn spawn_reader(label: &str, mut reader: Box<dyn Read + Send>, ring: Arc<ScrollbackRing>) {
    spawn_named_thread(format!("pty-reader-{label}"), move || {
        let mut buf = [0u8; PTY_READ_BUF];
        loop {
            match reader.read(&mut buf) {
                // EOF: the child closed its side or exited.
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    ring.write(&buf[..n]);
                }
            }
        }
    });
}

fn spawn_waiter(
    label: &str,
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
    exit_publisher: EventPublisher<ExitEvent>,
) {
    let label = label.to_string();
    spawn_named_thread(format!("pty-wait-{label}"), move || {
        let code = match child.wait() {
            Ok(status) => {
                debug!(process = %label, code = status.exit_code(), "child exited");
                Some(status.exit_code())
            }
            Err(err) => {
                warn!(process = %label, error = %err, "wait on child failed");
                None
            }
        };
        // Consumers may already be gone during shutdown.
        let _ = exit_publisher.publish(ExitEvent { code });
    });
}
