//! One-shot signal commands: connect, send one request, report the result.
//! Every path returns an error to the caller; only `main` decides exit codes.

use std::io::Write;
use std::path::Path;
use thiserror::Error;

use crate::ipc::client::IpcClient;
use crate::ipc::error::TransportError;
use crate::supervisor::contract::Action;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("server rejected the command: {0}")]
    Rejected(String),

    #[error("could not write command output: {0}")]
    Output(#[from] std::io::Error),
}

/// Sends one action to a running server and succeeds iff the server does.
pub fn signal_action(
    socket: &Path,
    action: Action,
    label: Option<&str>,
) -> Result<(), CommandError> {
    let client = IpcClient::connect(socket)?;
    let response = client.request(action, label)?;
    if response.success {
        Ok(())
    } else {
        Err(CommandError::Rejected(
            response.error.unwrap_or_else(|| "unknown error".to_string()),
        ))
    }
}

/// Prints the tab-delimited process table: a `NAME\tSTATUS` header, then one
/// `<label>\t(running|stopped)` row per declared process.
pub fn signal_list(socket: &Path, out: &mut impl Write) -> Result<(), CommandError> {
    let client = IpcClient::connect(socket)?;
    let response = client.request(Action::List, None)?;
    if !response.success {
        return Err(CommandError::Rejected(
            response.error.unwrap_or_else(|| "unknown error".to_string()),
        ));
    }
    writeln!(out, "NAME\tSTATUS")?;
    for row in response.process_list.unwrap_or_default() {
        let status = if row.running { "running" } else { "stopped" };
        writeln!(out, "{}\t{}", row.name, status)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::server::IpcServer;
    use crate::state::{AppState, StateUpdate};
    use crate::supervisor::contract::{
        CommandDispatcher, CommandOutcome, ListedProcess, ProcessController,
    };
    use crate::supervisor::error::SupervisorError;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    struct NoopController;

    impl ProcessController for NoopController {
        fn write_to_selected(&self, _bytes: &[u8]) {}
    }

    struct StubDispatcher;

    impl CommandDispatcher for StubDispatcher {
        fn handle_command(
            &self,
            action: Action,
            label: Option<&str>,
        ) -> Result<CommandOutcome, SupervisorError> {
            match (action, label) {
                (Action::List, _) => Ok(CommandOutcome::List(vec![
                    ListedProcess {
                        name: "web".to_string(),
                        running: true,
                        index: 0,
                    },
                    ListedProcess {
                        name: "db".to_string(),
                        running: false,
                        index: 1,
                    },
                ])),
                (_, Some("ghost")) => Err(SupervisorError::NotFound("ghost".to_string())),
                _ => Ok(CommandOutcome::Done),
            }
        }

        fn get_state(&self) -> StateUpdate {
            StateUpdate::from_state(AppState {
                processes: Vec::new(),
                current: 0,
                exiting: false,
            })
        }

        fn controller(&self) -> Arc<dyn ProcessController> {
            Arc::new(NoopController)
        }
    }

    fn start_server(dir: &tempfile::TempDir) -> IpcServer {
        IpcServer::start(&dir.path().join("control.socket"), Arc::new(StubDispatcher)).unwrap()
    }

    #[test]
    fn signal_list_prints_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir);

        let mut out = Vec::new();
        signal_list(server.path(), &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "NAME\tSTATUS\nweb\trunning\ndb\tstopped\n"
        );
        server.stop();
    }

    #[test]
    fn signal_action_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir);

        signal_action(server.path(), Action::Start, Some("web")).unwrap();
        assert_matches!(
            signal_action(server.path(), Action::Stop, Some("ghost")),
            Err(CommandError::Rejected(reason)) if reason.contains("not found")
        );
        server.stop();
    }
}
