//! The supervisor owns the authoritative process table. Every lifecycle
//! mutation, selection change and state snapshot goes through its single
//! internal mutex, and every mutation ends with one state broadcast.

pub mod contract;
pub mod error;

use portable_pty::PtySize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{Config, GeneralConfig, ProcessConfig};
use crate::process::instance::Instance;
use crate::process::terminator::ProcessTerminator;
use crate::state::{
    AppState, ProcessId, ProcessSnapshot, ProcessStatus, StateUpdate, FIRST_REAL_ID, NO_SELECTION,
    PLACEHOLDER_ID,
};
use crate::toggle::term::terminal_size;
use crate::utils::threads::spawn_named_thread;
use crate::viewer::Viewer;

use contract::{
    Action, CommandDispatcher, CommandOutcome, ListedProcess, ProcessController, StateSink,
};
use error::SupervisorError;

/// Pause between a completed stop and the follow-up start of a restart.
const RESTART_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Bound on waiting for a process to reach Halted (restart, shutdown).
const HALT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

const HALT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const PLACEHOLDER_LABEL: &str = "placeholder";

/// Cloneable handle to the shared supervisor state.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

struct Shared {
    inner: Mutex<Inner>,
    viewer: Arc<Viewer>,
    sink: RwLock<Option<Arc<dyn StateSink>>>,
    general: GeneralConfig,
}

struct Inner {
    slots: Vec<Slot>,
    instances: HashMap<ProcessId, Arc<Instance>>,
    current: ProcessId,
    exiting: bool,
}

struct Slot {
    id: ProcessId,
    label: String,
    status: ProcessStatus,
    config: Arc<ProcessConfig>,
}

impl Supervisor {
    /// Builds the process table from the parsed config. Process ids follow
    /// the file's declaration order, starting after the synthetic
    /// placeholder, and `list` rows come back in the same order.
    pub fn new(config: &Config, viewer: Arc<Viewer>) -> Self {
        let mut slots = vec![Slot {
            id: PLACEHOLDER_ID,
            label: PLACEHOLDER_LABEL.to_string(),
            status: ProcessStatus::Halted,
            config: Arc::new(ProcessConfig::default()),
        }];
        for (offset, (label, proc_config)) in config.procs.iter().enumerate() {
            slots.push(Slot {
                id: FIRST_REAL_ID + offset,
                label: label.to_string(),
                status: ProcessStatus::Halted,
                config: Arc::new(proc_config.clone()),
            });
        }
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    slots,
                    instances: HashMap::new(),
                    current: NO_SELECTION,
                    exiting: false,
                }),
                viewer,
                sink: RwLock::new(None),
                general: config.general.clone(),
            }),
        }
    }

    /// Wires the state sink once the IPC side exists. Broadcasts before this
    /// point are dropped.
    pub fn set_state_sink(&self, sink: Arc<dyn StateSink>) {
        *self
            .shared
            .sink
            .write()
            .expect("state sink lock poisoned") = Some(sink);
    }

    pub fn viewer(&self) -> Arc<Viewer> {
        Arc::clone(&self.shared.viewer)
    }

    /// Starts every process configured with `autostart`, then issues a single
    /// broadcast. Individual spawn failures are logged and skipped.
    pub fn start_autostart(&self) {
        let mut inner = self.lock();
        let autostart_ids: Vec<ProcessId> = inner
            .slots
            .iter()
            .filter(|s| s.id != PLACEHOLDER_ID && s.config.autostart)
            .map(|s| s.id)
            .collect();
        for id in autostart_ids {
            if let Err(err) = self.start_locked(&mut inner, id) {
                error!(error = %err, "autostart failed");
            }
        }
        self.broadcast_locked(&inner);
    }

    /// Re-runs the viewer switch for the current selection. The toggle
    /// coordinator calls this when the process pane takes the terminal back.
    pub fn refresh_viewer(&self) {
        let inner = self.lock();
        let id = inner.current;
        if id == NO_SELECTION {
            if let Err(err) = self.shared.viewer.show_placeholder() {
                warn!(error = %err, "placeholder render failed");
            }
            return;
        }
        let label = inner.label_of(id).unwrap_or_default();
        let ring = inner.instances.get(&id).map(|i| i.ring());
        if let Err(err) = self
            .shared
            .viewer
            .refresh_current_process(id, &label, ring)
        {
            warn!(error = %err, "viewer refresh failed");
        }
    }

    /// Signals every running process and waits (bounded) for the table to
    /// drain. Children never outlive the supervisor.
    pub fn shutdown(&self) {
        let running = {
            let mut inner = self.lock();
            inner.exiting = true;
            let running = inner.running_labels();
            self.broadcast_locked(&inner);
            running
        };
        for label in &running {
            if let Err(err) = self.stop_by_label(label) {
                warn!(process = %label, error = %err, "stop during shutdown failed");
            }
        }
        let deadline = Instant::now() + HALT_WAIT_TIMEOUT;
        while Instant::now() < deadline {
            if self.lock().instances.is_empty() {
                break;
            }
            std::thread::sleep(HALT_POLL_INTERVAL);
        }
        info!("supervisor shut down");
    }

    fn start_by_label(&self, label: &str) -> Result<(), SupervisorError> {
        let mut inner = self.lock();
        let id = inner.resolve(label)?;
        self.start_locked(&mut inner, id)?;
        self.broadcast_locked(&inner);
        Ok(())
    }

    /// Spawns the instance for `id`. Idempotent while the process is running
    /// or still halting (no duplicate spawn); a failed spawn leaves the slot
    /// Halted with no partial instance.
    fn start_locked(&self, inner: &mut Inner, id: ProcessId) -> Result<(), SupervisorError> {
        let slot = inner.slot_mut(id);
        if slot.status != ProcessStatus::Halted {
            return Ok(());
        }
        let label = slot.label.clone();
        let config = Arc::clone(&slot.config);

        let (term_rows, term_cols) = terminal_size();
        let size = PtySize {
            rows: config.rows.unwrap_or(term_rows),
            cols: config.cols.unwrap_or(term_cols),
            pixel_width: 0,
            pixel_height: 0,
        };
        let instance = Arc::new(Instance::spawn(
            &label,
            &config,
            size,
            self.shared.general.scrollback_bytes,
        )?);

        self.spawn_exit_watcher(id, &label, &instance);
        inner.instances.insert(id, Arc::clone(&instance));
        inner.slot_mut(id).status = ProcessStatus::Running;
        info!(process = %label, pid = instance.pid(), "process started");

        if inner.current == id {
            // restarted while being viewed: replay onto a clean screen
            if let Err(err) =
                self.shared
                    .viewer
                    .refresh_current_process(id, &label, Some(instance.ring()))
            {
                warn!(error = %err, "viewer refresh after start failed");
            }
        }
        Ok(())
    }

    fn stop_by_label(&self, label: &str) -> Result<(), SupervisorError> {
        let mut inner = self.lock();
        let id = inner.resolve(label)?;
        self.stop_locked(&mut inner, id)?;
        self.broadcast_locked(&inner);
        Ok(())
    }

    /// Delivers the configured stop signal. Idempotent for halted processes;
    /// a second stop while Halting is a no-op (the watchdog is already armed).
    fn stop_locked(&self, inner: &mut Inner, id: ProcessId) -> Result<(), SupervisorError> {
        let slot = inner.slot_mut(id);
        match slot.status {
            ProcessStatus::Halted | ProcessStatus::Halting => return Ok(()),
            ProcessStatus::Running => {}
        }
        let label = slot.label.clone();
        let config = Arc::clone(&slot.config);

        let Some(instance) = inner.instances.get(&id).cloned() else {
            // never alive: no Halting detour needed
            inner.slot_mut(id).status = ProcessStatus::Halted;
            return Ok(());
        };
        let Some(pid) = instance.pid() else {
            warn!(process = %label, "instance has no pid, waiting for natural exit");
            inner.slot_mut(id).status = ProcessStatus::Halting;
            return Ok(());
        };

        let terminator = ProcessTerminator::new(pid);
        if config.escalates_to_kill() {
            // SIGTERM now, SIGKILL from the watchdog if the child ignores it
            let exit = instance.exit_consumer();
            spawn_named_thread(format!("stop-watchdog-{label}"), move || {
                if let Err(err) = terminator.shutdown(|grace| exit.signalled_within(grace)) {
                    warn!(error = %err, "stop watchdog failed");
                }
            });
        } else {
            terminator.signal(config.stop_signal())?;
        }
        inner.slot_mut(id).status = ProcessStatus::Halting;
        debug!(process = %label, pid, signal = config.stop_signal(), "stop signal dispatched");
        Ok(())
    }

    /// Stop, bounded wait for Halted, settle, start.
    fn restart_by_label(&self, label: &str) -> Result<(), SupervisorError> {
        self.stop_by_label(label)?;
        self.wait_for_halted(label)?;
        std::thread::sleep(RESTART_SETTLE_DELAY);
        self.start_by_label(label)
    }

    fn wait_for_halted(&self, label: &str) -> Result<(), SupervisorError> {
        let deadline = Instant::now() + HALT_WAIT_TIMEOUT;
        loop {
            {
                let mut inner = self.lock();
                let id = inner.resolve(label)?;
                if inner.slot_mut(id).status == ProcessStatus::Halted {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(SupervisorError::HaltTimeout {
                    label: label.to_string(),
                    timeout: HALT_WAIT_TIMEOUT,
                });
            }
            std::thread::sleep(HALT_POLL_INTERVAL);
        }
    }

    /// Updates the selection and retargets the viewer. Never starts or stops
    /// anything.
    fn switch_by_label(&self, label: &str) -> Result<(), SupervisorError> {
        let mut inner = self.lock();
        let id = inner.resolve(label)?;
        inner.current = id;
        let ring = inner.instances.get(&id).map(|i| i.ring());
        if let Err(err) = self.shared.viewer.switch_to_process(id, label, ring) {
            warn!(error = %err, "viewer switch failed");
        }
        self.broadcast_locked(&inner);
        Ok(())
    }

    fn list(&self) -> Vec<ListedProcess> {
        let inner = self.lock();
        inner
            .slots
            .iter()
            .filter(|s| s.id != PLACEHOLDER_ID)
            .enumerate()
            .map(|(index, slot)| ListedProcess {
                name: slot.label.clone(),
                running: slot.status.is_running(),
                index,
            })
            .collect()
    }

    /// Applies `op` to a snapshot of the currently running labels.
    /// Best-effort: the set can change while iterating, and per-label
    /// failures are logged, not propagated.
    fn for_each_running(&self, op: impl Fn(&Self, &str) -> Result<(), SupervisorError>) {
        let labels = self.lock().running_labels();
        for label in labels {
            if let Err(err) = op(self, &label) {
                warn!(process = %label, error = %err, "bulk operation failed for process");
            }
        }
    }

    /// Removes the instance after its child exited. The table entry is the
    /// one-shot guard: whichever thread removes it runs the cleanup, any
    /// racing path finds it gone.
    fn reap(&self, id: ProcessId, expected: Weak<Instance>) {
        let mut inner = self.lock();
        let matches = inner
            .instances
            .get(&id)
            .is_some_and(|live| expected.upgrade().is_some_and(|e| Arc::ptr_eq(live, &e)));
        if !matches {
            return;
        }
        inner.instances.remove(&id);
        let slot = inner.slot_mut(id);
        slot.status = ProcessStatus::Halted;
        info!(process = %slot.label, "process reaped");
        self.broadcast_locked(&inner);
    }

    fn spawn_exit_watcher(&self, id: ProcessId, label: &str, instance: &Arc<Instance>) {
        let supervisor = self.clone();
        let exit = instance.exit_consumer();
        let expected = Arc::downgrade(instance);
        spawn_named_thread(format!("exit-watcher-{label}"), move || {
            // Ok carries the exit event; Err means the publisher vanished.
            // Either way the child is done.
            let _ = exit.as_ref().recv();
            supervisor.reap(id, expected);
        });
    }

    fn broadcast_locked(&self, inner: &Inner) {
        let update = inner.state_update();
        if let Some(sink) = self
            .shared
            .sink
            .read()
            .expect("state sink lock poisoned")
            .as_ref()
        {
            sink.broadcast(&update);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.shared.inner.lock().expect("supervisor lock poisoned")
    }
}

impl CommandDispatcher for Supervisor {
    fn handle_command(
        &self,
        action: Action,
        label: Option<&str>,
    ) -> Result<CommandOutcome, SupervisorError> {
        if action.requires_label() && label.is_none() {
            return Err(SupervisorError::MissingLabel(action.to_string()));
        }
        let label = label.unwrap_or_default();
        match action {
            Action::Start => self.start_by_label(label).map(|()| CommandOutcome::Done),
            Action::Stop => self.stop_by_label(label).map(|()| CommandOutcome::Done),
            Action::Restart => self.restart_by_label(label).map(|()| CommandOutcome::Done),
            Action::Switch => self.switch_by_label(label).map(|()| CommandOutcome::Done),
            Action::List => Ok(CommandOutcome::List(self.list())),
            Action::StopRunning => {
                self.for_each_running(Self::stop_by_label);
                Ok(CommandOutcome::Done)
            }
            Action::RestartRunning => {
                self.for_each_running(Self::restart_by_label);
                Ok(CommandOutcome::Done)
            }
        }
    }

    fn get_state(&self) -> StateUpdate {
        self.lock().state_update()
    }

    fn controller(&self) -> Arc<dyn ProcessController> {
        Arc::new(self.clone())
    }
}

impl ProcessController for Supervisor {
    fn write_to_selected(&self, bytes: &[u8]) {
        let instance = {
            let inner = self.lock();
            inner.instances.get(&inner.current).cloned()
        };
        // writing outside the lock keeps a blocked PTY from stalling commands
        if let Some(instance) = instance {
            instance.write_input(bytes);
        }
    }
}

impl Inner {
    fn resolve(&self, label: &str) -> Result<ProcessId, SupervisorError> {
        self.slots
            .iter()
            .find(|s| s.id != PLACEHOLDER_ID && s.label == label)
            .map(|s| s.id)
            .ok_or_else(|| SupervisorError::NotFound(label.to_string()))
    }

    fn slot_mut(&mut self, id: ProcessId) -> &mut Slot {
        self.slots
            .iter_mut()
            .find(|s| s.id == id)
            .expect("slot ids are fixed at startup")
    }

    fn label_of(&self, id: ProcessId) -> Option<String> {
        self.slots
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.label.clone())
    }

    fn running_labels(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|s| s.id != PLACEHOLDER_ID && s.status.is_running())
            .map(|s| s.label.clone())
            .collect()
    }

    fn state_update(&self) -> StateUpdate {
        let processes = self
            .slots
            .iter()
            .map(|slot| ProcessSnapshot {
                id: slot.id,
                label: slot.label.clone(),
                status: slot.status,
                pid: self
                    .instances
                    .get(&slot.id)
                    .and_then(|i| i.pid())
                    .unwrap_or(0),
                description: slot.config.description.clone(),
                docs: slot.config.docs.clone(),
                categories: slot.config.categories.clone(),
            })
            .collect();
        StateUpdate::from_state(AppState {
            processes,
            current: self.current,
            exiting: self.exiting,
        })
    }
}
