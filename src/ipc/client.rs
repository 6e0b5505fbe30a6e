use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::ipc::error::TransportError;
use crate::ipc::protocol::{self, CommandMessage, Message, ResponseMessage, StateMessage};
use crate::supervisor::contract::Action;
use crate::utils::threads::spawn_named_thread;

pub const CONNECT_ATTEMPTS: u32 = 5;
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Depth of the state-update channel; older snapshots are discarded when a
/// slow consumer falls behind.
const STATE_CHANNEL_DEPTH: usize = 16;

/// Client side of the control socket.
///
/// A background reader thread splits the incoming stream into responses
/// (correlated to pending requests by id) and state broadcasts (delivered on
/// a bounded drop-oldest channel).
pub struct IpcClient {
    writer: Mutex<UnixStream>,
    pending: Arc<Mutex<HashMap<String, Sender<ResponseMessage>>>>,
    states: Receiver<StateMessage>,
    next_request: AtomicU64,
}

impl IpcClient {
    /// Connects with bounded retries, for servers that are still starting up.
    pub fn connect(path: &Path) -> Result<Self, TransportError> {
        let mut last_err = None;
        for attempt in 0..CONNECT_ATTEMPTS {
            if attempt > 0 {
                std::thread::sleep(CONNECT_RETRY_DELAY);
            }
            match UnixStream::connect(path) {
                Ok(stream) => return Self::from_stream(stream),
                Err(err) => {
                    debug!(attempt, error = %err, "control socket connect failed");
                    last_err = Some(err);
                }
            }
        }
        Err(TransportError::Connect {
            path: path.to_path_buf(),
            reason: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    fn from_stream(stream: UnixStream) -> Result<Self, TransportError> {
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        let pending: Arc<Mutex<HashMap<String, Sender<ResponseMessage>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (state_tx, state_rx) = bounded(STATE_CHANNEL_DEPTH);

        let reader_stream = stream.try_clone()?;
        let reader_pending = Arc::clone(&pending);
        let state_overflow_rx = state_rx.clone();
        spawn_named_thread("ipc-client-reader", move || {
            reader_loop(reader_stream, reader_pending, state_tx, state_overflow_rx);
        });

        Ok(Self {
            writer: Mutex::new(stream),
            pending,
            states: state_rx,
            next_request: AtomicU64::new(0),
        })
    }

    /// Sends one command and waits for its correlated response.
    pub fn request(
        &self,
        action: Action,
        label: Option<&str>,
    ) -> Result<ResponseMessage, TransportError> {
        let request_id = format!(
            "{}-{}",
            std::process::id(),
            self.next_request.fetch_add(1, Ordering::SeqCst)
        );
        let (tx, rx) = bounded(1);
        self.pending
            .lock()
            .expect("pending request map poisoned")
            .insert(request_id.clone(), tx);

        let line = protocol::encode_line(&Message::Command(CommandMessage {
            request_id: request_id.clone(),
            action,
            label: label.map(String::from),
        }))
        .map_err(|err| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            ))
        })?;

        let write_result = {
            let mut writer = self.writer.lock().expect("client writer lock poisoned");
            writer
                .write_all(line.as_bytes())
                .and_then(|()| writer.flush())
        };
        if let Err(err) = write_result {
            self.forget(&request_id);
            return Err(TransportError::Io(err));
        }

        match rx.recv_timeout(REQUEST_TIMEOUT) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => {
                self.forget(&request_id);
                Err(TransportError::RequestTimeout(request_id))
            }
            // reader thread gone: the server closed on us
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    /// State broadcast channel. Closed once the connection dies.
    pub fn state_updates(&self) -> &Receiver<StateMessage> {
        &self.states
    }

    fn forget(&self, request_id: &str) {
        self.pending
            .lock()
            .expect("pending request map poisoned")
            .remove(request_id);
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        if let Ok(writer) = self.writer.lock() {
            let _ = writer.shutdown(std::net::Shutdown::Both);
        }
    }
}

fn reader_loop(
    stream: UnixStream,
    pending: Arc<Mutex<HashMap<String, Sender<ResponseMessage>>>>,
    state_tx: Sender<StateMessage>,
    state_overflow_rx: Receiver<StateMessage>,
) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        match protocol::decode_line(&line) {
            Ok(Message::Response(response)) => {
                let waiter = pending
                    .lock()
                    .expect("pending request map poisoned")
                    .remove(&response.request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        debug!(request_id = %response.request_id, "response with no waiter")
                    }
                }
            }
            Ok(Message::State(state)) => {
                // drop-oldest keeps the newest snapshot flowing
                if let Err(TrySendError::Full(state)) = state_tx.try_send(state) {
                    let _ = state_overflow_rx.try_recv();
                    let _ = state_tx.try_send(state);
                }
            }
            Ok(Message::Command(_)) => {
                warn!("server sent a command message, ignoring");
            }
            Err(err) => {
                warn!(error = %err, "undecodable line from server, ignoring");
            }
        }
    }
    // dropping state_tx closes the state channel; dropping the pending map
    // entries fails any in-flight request with Disconnected
    pending
        .lock()
        .expect("pending request map poisoned")
        .clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::server::IpcServer;
    use crate::state::{AppState, StateUpdate};
    use crate::supervisor::contract::{
        CommandDispatcher, CommandOutcome, ListedProcess, ProcessController, StateSink,
    };
    use crate::supervisor::error::SupervisorError;
    use assert_matches::assert_matches;

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
                (Action::List, _) => Ok(CommandOutcome::List(vec![ListedProcess {
                    name: "db".to_string(),
                    running: false,
                    index: 0,
                }])),
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
    fn request_response_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir);
        let client = IpcClient::connect(server.path()).unwrap();

        let response = client.request(Action::List, None).unwrap();
        assert!(response.success);
        assert_eq!(response.process_list.unwrap()[0].name, "db");

        let failure = client.request(Action::Stop, Some("ghost")).unwrap();
        assert!(!failure.success);
        server.stop();
    }

    #[test]
    fn initial_state_arrives_on_connect() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir);
        let client = IpcClient::connect(server.path()).unwrap();

        let state = client
            .state_updates()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert!(!state.state.exiting);
        server.stop();
    }

    #[test]
    fn broadcasts_flow_to_the_state_channel() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir);
        let client = IpcClient::connect(server.path()).unwrap();
        let _hello = client
            .state_updates()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();

        server.broadcast(&StubDispatcher.get_state());
        client
            .state_updates()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        server.stop();
    }

    #[test]
    fn server_stop_closes_the_state_channel_and_fails_requests() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir);
        let client = IpcClient::connect(server.path()).unwrap();
        let _hello = client
            .state_updates()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();

        server.stop();

        // the reader thread exits on EOF and closes the channel
        assert_matches!(
            client.state_updates().recv_timeout(Duration::from_secs(5)),
            Err(RecvTimeoutError::Disconnected)
        );
        assert!(client.request(Action::List, None).is_err());
    }

    #[test]
    fn connect_to_a_missing_socket_fails_after_retries() {
        // empty path, no retries worth waiting for: use a nonexistent dir
        let missing = std::env::temp_dir().join("proctmux-no-such-socket.socket");
        let started = std::time::Instant::now();
        let result = IpcClient::connect(&missing);
        assert!(result.is_err());
        // retried with delays rather than failing instantly
        assert!(started.elapsed() >= CONNECT_RETRY_DELAY);
    }
}
