use serde::{Deserialize, Serialize};

/// Stable process identifier. 0 addresses "nothing selected", 1 is the
/// synthetic placeholder entry, real processes start at 2.
pub type ProcessId = usize;

pub const NO_SELECTION: ProcessId = 0;
pub const PLACEHOLDER_ID: ProcessId = 1;
pub const FIRST_REAL_ID: ProcessId = 2;

/// Lifecycle status of one declared process.
///
/// A process leaves `Running` only through `Halting` (a stop signal is in
/// flight or the exit is being reaped); it returns to `Halted` once cleanup
/// has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Halted,
    Running,
    Halting,
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running)
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            ProcessStatus::Halted => "halted",
            ProcessStatus::Running => "running",
            ProcessStatus::Halting => "halting",
        };
        f.write_str(status)
    }
}

/// Public snapshot of one process. Only presentation-safe fields are carried:
/// env maps, cwd and path overrides never leave the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub id: ProcessId,
    pub label: String,
    pub status: ProcessStatus,
    /// 0 when no instance is alive.
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

/// Immutable snapshot of the application state, produced under the supervisor
/// lock and shipped to IPC clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    pub processes: Vec<ProcessSnapshot>,
    /// Currently selected process id, [NO_SELECTION] when none.
    pub current: ProcessId,
    pub exiting: bool,
}

/// Row of the state broadcast's derived view list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessView {
    pub id: ProcessId,
    pub label: String,
    pub status: ProcessStatus,
    pub pid: u32,
}

/// One broadcast envelope: the state snapshot plus its derived view list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub state: AppState,
    pub process_views: Vec<ProcessView>,
}

impl StateUpdate {
    pub fn from_state(state: AppState) -> Self {
        let process_views = state
            .processes
            .iter()
            .map(|p| ProcessView {
                id: p.id,
                label: p.label.clone(),
                status: p.status,
                pid: p.pid,
            })
            .collect();
        Self {
            state,
            process_views,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: ProcessId, label: &str, status: ProcessStatus) -> ProcessSnapshot {
        ProcessSnapshot {
            id,
            label: label.to_string(),
            status,
            pid: 0,
            description: None,
            docs: None,
            categories: Vec::new(),
        }
    }

    #[test]
    fn views_mirror_the_process_list() {
        let state = AppState {
            processes: vec![
                snapshot(PLACEHOLDER_ID, "placeholder", ProcessStatus::Halted),
                snapshot(2, "web", ProcessStatus::Running),
            ],
            current: 2,
            exiting: false,
        };
        let update = StateUpdate::from_state(state);

        assert_eq!(update.process_views.len(), update.state.processes.len());
        assert_eq!(update.process_views[1].label, "web");
        assert!(update.process_views[1].status.is_running());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&ProcessStatus::Halting).unwrap();
        assert_eq!(json, r#""halting""#);
    }
}
