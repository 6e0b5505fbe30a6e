use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::state::StateUpdate;
use crate::supervisor::error::SupervisorError;

/// Control verbs accepted by the supervisor and carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Start,
    Stop,
    Restart,
    Switch,
    List,
    RestartRunning,
    StopRunning,
}

impl Action {
    /// Whether the verb addresses a single labelled process.
    pub fn requires_label(&self) -> bool {
        matches!(
            self,
            Action::Start | Action::Stop | Action::Restart | Action::Switch
        )
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verb = match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Restart => "restart",
            Action::Switch => "switch",
            Action::List => "list",
            Action::RestartRunning => "restart-running",
            Action::StopRunning => "stop-running",
        };
        f.write_str(verb)
    }
}

/// Row returned by the `list` verb.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListedProcess {
    pub name: String,
    pub running: bool,
    pub index: usize,
}

/// Successful result of a dispatched command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Done,
    List(Vec<ListedProcess>),
}

/// The narrow face of the supervisor that the IPC layer consumes. Keeping the
/// two sides behind traits breaks the supervisor <-> server reference cycle.
pub trait CommandDispatcher: Send + Sync {
    fn handle_command(
        &self,
        action: Action,
        label: Option<&str>,
    ) -> Result<CommandOutcome, SupervisorError>;

    fn get_state(&self) -> StateUpdate;

    fn controller(&self) -> Arc<dyn ProcessController>;
}

/// Raw-input access to the currently selected process, used by the toggle
/// coordinator to route operator keystrokes.
pub trait ProcessController: Send + Sync {
    fn write_to_selected(&self, bytes: &[u8]);
}

/// The narrow face of the IPC layer that the supervisor consumes.
pub trait StateSink: Send + Sync {
    fn broadcast(&self, update: &StateUpdate);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_serialize_kebab_case() {
        assert_eq!(
            serde_json::to_string(&Action::RestartRunning).unwrap(),
            r#""restart-running""#
        );
        assert_eq!(
            serde_json::from_str::<Action>(r#""stop-running""#).unwrap(),
            Action::StopRunning
        );
    }

    #[test]
    fn label_requirements() {
        assert!(Action::Start.requires_label());
        assert!(Action::Switch.requires_label());
        assert!(!Action::List.requires_label());
        assert!(!Action::StopRunning.requires_label());
    }
}
