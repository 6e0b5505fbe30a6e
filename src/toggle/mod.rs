//! Unified single-terminal mode: the supervisor runs in-process, a child
//! client TUI runs under its own PTY, and one configured byte toggles the
//! physical terminal between the client pane and the selected process's
//! output pane.

pub mod term;

use crossbeam::channel::Receiver;
use crossbeam::select;
use portable_pty::PtySize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{GeneralConfig, ProcessConfig};
use crate::event::broadcaster::BoundedBroadcast;
use crate::event::cancellation::CancellationMessage;
use crate::event::channel::EventConsumer;
use crate::event::ApplicationEvent;
use crate::ipc::socket::SOCKET_ENV;
use crate::process::instance::{Instance, InstanceError};
use crate::scrollback::{ScrollbackRing, SubscriberId};
use crate::state::StateUpdate;
use crate::supervisor::contract::{CommandDispatcher, ProcessController, StateSink};
use crate::supervisor::Supervisor;
use crate::utils::thread_context::ThreadContext;
use crate::utils::threads::spawn_named_thread;
use crate::viewer::CLEAR_SCREEN;

use term::{terminal_size, RawModeGuard, TerminalError, WinsizeWatcher};

/// Depth of the in-process state channel consumed by the coordinator.
const STATE_CHANNEL_DEPTH: usize = 16;

const STDIN_READ_BUF: usize = 512;

#[derive(Debug, Error)]
pub enum ToggleError {
    #[error(transparent)]
    Terminal(#[from] TerminalError),

    #[error(transparent)]
    ClientSpawn(#[from] InstanceError),

    #[error("could not determine the proctmux executable: {0}")]
    Executable(std::io::Error),
}

/// Which logical pane currently owns the physical terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pane {
    Client,
    Process,
}

/// In-process state sink: the coordinator's variant of the IPC broadcast,
/// delivered over a bounded drop-oldest channel instead of a socket.
pub struct InProcessStateSink {
    broadcast: BoundedBroadcast<StateUpdate>,
}

impl InProcessStateSink {
    pub fn new() -> Self {
        Self {
            broadcast: BoundedBroadcast::new(STATE_CHANNEL_DEPTH),
        }
    }

    pub fn subscribe(&self) -> Receiver<StateUpdate> {
        self.broadcast.subscribe()
    }
}

impl Default for InProcessStateSink {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSink for InProcessStateSink {
    fn broadcast(&self, update: &StateUpdate) {
        self.broadcast.broadcast(update.clone());
    }
}

/// Fans supervisor broadcasts out to several sinks (the socket server and the
/// in-process channel).
pub struct FanoutSink(pub Vec<Arc<dyn StateSink>>);

impl StateSink for FanoutSink {
    fn broadcast(&self, update: &StateUpdate) {
        for sink in &self.0 {
            sink.broadcast(update);
        }
    }
}

/// One parsed piece of raw operator input.
#[derive(Debug, PartialEq, Eq)]
enum RouterEvent<'a> {
    Forward(&'a [u8]),
    Toggle,
}

/// Splits raw input around the toggle byte. Bytes before each toggle flush to
/// the pane that was active when they were typed; the toggle byte itself is
/// never forwarded.
fn segment(bytes: &[u8], toggle: u8) -> Vec<RouterEvent<'_>> {
    let mut events = Vec::new();
    let mut start = 0;
    for (i, byte) in bytes.iter().enumerate() {
        if *byte == toggle {
            if i > start {
                events.push(RouterEvent::Forward(&bytes[start..i]));
            }
            events.push(RouterEvent::Toggle);
            start = i + 1;
        }
    }
    if start < bytes.len() {
        events.push(RouterEvent::Forward(&bytes[start..]));
    }
    events
}

/// Routes stdin bytes to the active pane and performs pane switches.
///
/// Switch discipline matches the viewer's: the prior pane's relay is stopped
/// and joined before the next pane touches stdout, and a screen clear
/// precedes the new pane's first output.
struct PaneRouter {
    supervisor: Supervisor,
    controller: Arc<dyn ProcessController>,
    client: Arc<Instance>,
    toggle_byte: u8,
    state: Mutex<PaneState>,
}

struct PaneState {
    pane: Pane,
    client_relay: Option<ThreadContext>,
    client_sub: Option<(Arc<ScrollbackRing>, SubscriberId)>,
}

impl PaneRouter {
    fn new(supervisor: Supervisor, client: Arc<Instance>, toggle_byte: u8) -> Self {
        let controller = supervisor.controller();
        Self {
            supervisor,
            controller,
            client,
            toggle_byte,
            state: Mutex::new(PaneState {
                pane: Pane::Client,
                client_relay: None,
                client_sub: None,
            }),
        }
    }

    fn pane(&self) -> Pane {
        self.lock().pane
    }

    fn route(&self, bytes: &[u8]) {
        for event in segment(bytes, self.toggle_byte) {
            match event {
                RouterEvent::Forward(chunk) => self.forward(chunk),
                RouterEvent::Toggle => self.toggle(),
            }
        }
    }

    fn forward(&self, bytes: &[u8]) {
        match self.pane() {
            Pane::Client => self.client.write_input(bytes),
            Pane::Process => self.controller.write_to_selected(bytes),
        }
    }

    fn toggle(&self) {
        let mut state = self.lock();
        match state.pane {
            Pane::Client => {
                Self::stop_client_relay(&mut state);
                state.pane = Pane::Process;
                drop(state);
                // clears the screen and replays the selected scrollback
                self.supervisor.refresh_viewer();
                debug!("toggled to process pane");
            }
            Pane::Process => {
                // the viewer relay must be gone before the client pane writes
                self.supervisor.viewer().suspend();
                self.enter_client_locked(&mut state);
                state.pane = Pane::Client;
                debug!("toggled to client pane");
            }
        }
    }

    /// Shows the client pane: clear, replay the client scrollback, stream
    /// live output, then nudge the TUI to repaint via a resize bump.
    fn enter_client_locked(&self, state: &mut PaneState) {
        let mut stdout = std::io::stdout();
        let ring = self.client.ring();
        let (snapshot, sub_id, chunks) = ring.snapshot_and_subscribe();
        if stdout
            .write_all(CLEAR_SCREEN)
            .and_then(|()| stdout.write_all(&snapshot))
            .and_then(|()| stdout.flush())
            .is_err()
        {
            warn!("client pane replay failed");
        }
        state.client_sub = Some((ring, sub_id));
        state.client_relay = Some(ThreadContext::spawn("client-relay", move |stop| {
            client_relay_loop(chunks, stop)
        }));

        let (rows, cols) = terminal_size();
        self.client.resize(rows, cols + 1);
        self.client.resize(rows, cols);
    }

    fn stop_client_relay(state: &mut PaneState) {
        if let Some(relay) = state.client_relay.take() {
            if let Err(err) = relay.stop_blocking() {
                warn!(error = %err, "client relay did not stop cleanly");
            }
        }
        if let Some((ring, sub_id)) = state.client_sub.take() {
            ring.unsubscribe(sub_id);
        }
    }

    fn enter_client_pane(&self) {
        self.supervisor.viewer().suspend();
        let mut state = self.lock();
        self.enter_client_locked(&mut state);
        state.pane = Pane::Client;
    }

    fn shutdown(&self) {
        let mut state = self.lock();
        Self::stop_client_relay(&mut state);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PaneState> {
        self.state.lock().expect("pane state lock poisoned")
    }
}

fn client_relay_loop(
    chunks: Receiver<Vec<u8>>,
    stop: EventConsumer<CancellationMessage>,
) {
    let mut stdout = std::io::stdout();
    loop {
        select! {
            recv(chunks) -> chunk => match chunk {
                Ok(chunk) => {
                    if stdout
                        .write_all(&chunk)
                        .and_then(|()| stdout.flush())
                        .is_err()
                    {
                        break;
                    }
                }
                Err(_) => break,
            },
            recv(stop.as_ref()) -> _ => break,
        }
    }
}

/// Runs the unified single-terminal mode around an in-process supervisor.
pub struct ToggleCoordinator {
    supervisor: Supervisor,
    config_path: PathBuf,
    socket_path: PathBuf,
    general: GeneralConfig,
    state_updates: Receiver<StateUpdate>,
}

impl ToggleCoordinator {
    pub fn new(
        supervisor: Supervisor,
        config_path: PathBuf,
        socket_path: PathBuf,
        general: GeneralConfig,
        state_updates: Receiver<StateUpdate>,
    ) -> Self {
        Self {
            supervisor,
            config_path,
            socket_path,
            general,
            state_updates,
        }
    }

    /// Blocks until shutdown is requested, the client TUI exits or the
    /// supervisor begins exiting. Raw mode is held for the whole run and
    /// restored on every way out.
    pub fn run(&self, shutdown: &EventConsumer<ApplicationEvent>) -> Result<(), ToggleError> {
        let _raw = RawModeGuard::enter()?;
        let (rows, cols) = terminal_size();

        let client = Arc::new(self.spawn_client(rows, cols)?);
        let client_exit = client.exit_consumer();

        let _winsize = WinsizeWatcher::spawn({
            let client = Arc::clone(&client);
            move |rows, cols| client.resize(rows, cols)
        })?;

        let router = Arc::new(PaneRouter::new(
            self.supervisor.clone(),
            Arc::clone(&client),
            self.general.toggle_byte,
        ));
        router.enter_client_pane();

        // Detached: a blocking stdin read cannot be cancelled, and the
        // process is exiting by the time this loop stops mattering.
        {
            let router = Arc::clone(&router);
            spawn_named_thread("stdin-router", move || {
                let mut stdin = std::io::stdin();
                let mut buf = [0u8; STDIN_READ_BUF];
                loop {
                    match stdin.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => router.route(&buf[..n]),
                    }
                }
            });
        }

        info!("unified mode running");
        loop {
            select! {
                recv(shutdown.as_ref()) -> _ => break,
                recv(client_exit.as_ref()) -> _ => {
                    info!("client TUI exited");
                    break;
                }
                recv(self.state_updates) -> update => match update {
                    Ok(update) if update.state.exiting => break,
                    Ok(_) => {}
                    Err(_) => break,
                },
            }
        }
        router.shutdown();
        Ok(())
    }

    fn spawn_client(&self, rows: u16, cols: u16) -> Result<Instance, ToggleError> {
        let exe = std::env::current_exe().map_err(ToggleError::Executable)?;
        let mut env = HashMap::new();
        env.insert(
            SOCKET_ENV.to_string(),
            self.socket_path.to_string_lossy().into_owned(),
        );
        let client_config = ProcessConfig {
            cmd: Some(vec![
                exe.to_string_lossy().into_owned(),
                "--mode".to_string(),
                "client".to_string(),
                "-f".to_string(),
                self.config_path.to_string_lossy().into_owned(),
            ]),
            env,
            ..Default::default()
        };
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        Ok(Instance::spawn(
            "client",
            &client_config,
            size,
            self.general.scrollback_bytes,
        )?)
    }
}
