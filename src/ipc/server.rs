use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use nix::unistd::Uid;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ipc::error::{AuthError, TransportError};
use crate::ipc::protocol::{
    self, CommandMessage, Message, ResponseMessage, StateMessage,
};
use crate::state::StateUpdate;
use crate::supervisor::contract::{CommandDispatcher, CommandOutcome, StateSink};
use crate::utils::threads::spawn_named_thread;

/// Deadline on every per-client socket write.
pub const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Control-plane server on a Unix socket.
///
/// One thread accepts connections, one thread per client reads and dispatches
/// commands. Clients that time out on writes or fail authorization are
/// removed; the server itself keeps running until [IpcServer::stop].
pub struct IpcServer {
    shared: Arc<ServerShared>,
}

struct ServerShared {
    path: PathBuf,
    dispatcher: Arc<dyn CommandDispatcher>,
    clients: RwLock<Vec<Arc<ClientConnection>>>,
    handlers: Mutex<Vec<JoinHandle<()>>>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
    next_client_id: AtomicU64,
}

struct ClientConnection {
    id: u64,
    stream: UnixStream,
    writer: Mutex<UnixStream>,
}

impl ClientConnection {
    /// Serialized write with the shared per-connection deadline.
    fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().expect("client writer lock poisoned");
        writer.write_all(line.as_bytes())?;
        writer.flush()
    }
}

impl IpcServer {
    /// Removes any stale socket file, binds, restricts the file to the owner
    /// and starts accepting.
    pub fn start(
        path: &Path,
        dispatcher: Arc<dyn CommandDispatcher>,
    ) -> Result<Self, TransportError> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(TransportError::Listen {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
        let listener = UnixListener::bind(path).map_err(|source| TransportError::Listen {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(
            |source| TransportError::Listen {
                path: path.to_path_buf(),
                source,
            },
        )?;

        let shared = Arc::new(ServerShared {
            path: path.to_path_buf(),
            dispatcher,
            clients: RwLock::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
            accept_handle: Mutex::new(None),
            stopping: AtomicBool::new(false),
            next_client_id: AtomicU64::new(0),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_handle = spawn_named_thread("ipc-accept", move || {
            accept_loop(listener, accept_shared);
        });
        *shared
            .accept_handle
            .lock()
            .expect("accept handle lock poisoned") = Some(accept_handle);

        info!(path = %path.display(), "control socket listening");
        Ok(Self { shared })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Closes the listener, disconnects every client, joins every thread and
    /// removes the socket file.
    pub fn stop(&self) {
        if self.shared.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        // a throwaway connection unblocks the accept loop
        let _ = UnixStream::connect(&self.shared.path);
        if let Some(handle) = self
            .shared
            .accept_handle
            .lock()
            .expect("accept handle lock poisoned")
            .take()
        {
            let _ = handle.join();
        }

        let clients = std::mem::take(
            &mut *self
                .shared
                .clients
                .write()
                .expect("client set lock poisoned"),
        );
        for client in clients {
            let _ = client.stream.shutdown(std::net::Shutdown::Both);
        }
        let handlers = std::mem::take(
            &mut *self
                .shared
                .handlers
                .lock()
                .expect("handler set lock poisoned"),
        );
        for handle in handlers {
            let _ = handle.join();
        }

        let _ = std::fs::remove_file(&self.shared.path);
        info!(path = %self.shared.path.display(), "control socket stopped");
    }
}

impl StateSink for IpcServer {
    /// Marshals once, then fans out with per-client deadlines. Clients that
    /// fail the write are dropped; the broadcast continues.
    fn broadcast(&self, update: &StateUpdate) {
        let message = Message::State(StateMessage {
            state: update.state.clone(),
            process_views: update.process_views.clone(),
        });
        let line = match protocol::encode_line(&message) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "state broadcast could not be encoded");
                return;
            }
        };

        let clients: Vec<Arc<ClientConnection>> = self
            .shared
            .clients
            .read()
            .expect("client set lock poisoned")
            .clone();
        for client in clients {
            if let Err(err) = client.write_line(&line) {
                warn!(client = client.id, error = %err, "dropping client after failed broadcast");
                self.shared.remove_client(client.id);
            }
        }
    }
}

impl ServerShared {
    fn remove_client(&self, id: u64) {
        let mut clients = self.clients.write().expect("client set lock poisoned");
        if let Some(pos) = clients.iter().position(|c| c.id == id) {
            let client = clients.swap_remove(pos);
            let _ = client.stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

fn accept_loop(listener: UnixListener, shared: Arc<ServerShared>) {
    for stream in listener.incoming() {
        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                if let Err(err) = admit_client(stream, &shared) {
                    warn!(error = %err, "rejected control connection");
                }
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
            }
        }
    }
}

/// Authorization happens before any byte from the connection is read.
fn authorize(stream: &UnixStream) -> Result<(), AuthError> {
    static PEER_CRED_UNSUPPORTED: Once = Once::new();
    match getsockopt(stream, PeerCredentials) {
        Ok(creds) => {
            let server_uid = Uid::effective();
            if Uid::from_raw(creds.uid()) == server_uid {
                Ok(())
            } else {
                Err(AuthError::UidMismatch {
                    peer: creds.uid(),
                    server: server_uid.as_raw(),
                })
            }
        }
        Err(_) => {
            PEER_CRED_UNSUPPORTED.call_once(|| {
                warn!("peer credentials unsupported on this platform, relying on socket file permissions");
            });
            Ok(())
        }
    }
}

fn admit_client(stream: UnixStream, shared: &Arc<ServerShared>) -> Result<(), TransportError> {
    authorize(&stream).map_err(|err| {
        let _ = stream.shutdown(std::net::Shutdown::Both);
        TransportError::Connect {
            path: shared.path.clone(),
            reason: err.to_string(),
        }
    })?;

    let writer = stream.try_clone()?;
    writer.set_write_timeout(Some(CLIENT_WRITE_TIMEOUT))?;
    let client = Arc::new(ClientConnection {
        id: shared.next_client_id.fetch_add(1, Ordering::SeqCst),
        stream,
        writer: Mutex::new(writer),
    });

    // the newcomer sees the current state before anything else
    let state = shared.dispatcher.get_state();
    let hello = protocol::encode_line(&Message::State(StateMessage {
        state: state.state,
        process_views: state.process_views,
    }))
    .map_err(|err| TransportError::Connect {
        path: shared.path.clone(),
        reason: err.to_string(),
    })?;
    client.write_line(&hello)?;

    shared
        .clients
        .write()
        .expect("client set lock poisoned")
        .push(Arc::clone(&client));

    let handler_shared = Arc::clone(shared);
    let handle = spawn_named_thread(format!("ipc-client-{}", client.id), move || {
        client_loop(client, handler_shared);
    });
    shared
        .handlers
        .lock()
        .expect("handler set lock poisoned")
        .push(handle);
    Ok(())
}

fn client_loop(client: Arc<ClientConnection>, shared: Arc<ServerShared>) {
    let reader = match client.stream.try_clone() {
        Ok(stream) => BufReader::new(stream),
        Err(err) => {
            warn!(client = client.id, error = %err, "could not clone client stream");
            shared.remove_client(client.id);
            return;
        }
    };

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match protocol::decode_line(&line) {
            Ok(Message::Command(command)) => dispatch(&*shared.dispatcher, command),
            Ok(_) => ResponseMessage::failure(
                String::new(),
                "only command messages are accepted from clients".to_string(),
            ),
            // a single bad line is answered, not fatal
            Err(err) => {
                ResponseMessage::failure(protocol::salvage_request_id(&line), err.to_string())
            }
        };

        let encoded = match protocol::encode_line(&Message::Response(response)) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(client = client.id, error = %err, "response could not be encoded");
                continue;
            }
        };
        if client.write_line(&encoded).is_err() {
            break;
        }
    }
    debug!(client = client.id, "client disconnected");
    shared.remove_client(client.id);
}

fn dispatch(dispatcher: &dyn CommandDispatcher, command: CommandMessage) -> ResponseMessage {
    match dispatcher.handle_command(command.action, command.label.as_deref()) {
        Ok(CommandOutcome::Done) => ResponseMessage::ok(command.request_id),
        Ok(CommandOutcome::List(list)) => {
            ResponseMessage::ok_with_list(command.request_id, list)
        }
        Err(err) => ResponseMessage::failure(command.request_id, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AppState, StateUpdate};
    use crate::supervisor::contract::{Action, ListedProcess, ProcessController};
    use crate::supervisor::error::SupervisorError;

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
                    name: "web".to_string(),
                    running: true,
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

        fn controller(&self) -> Arc<dyn crate::supervisor::contract::ProcessController> {
            Arc::new(NoopController)
        }
    }

    fn start_server(dir: &tempfile::TempDir) -> IpcServer {
        let path = dir.path().join("control.socket");
        IpcServer::start(&path, Arc::new(StubDispatcher)).unwrap()
    }

    fn read_line(reader: &mut BufReader<UnixStream>) -> Message {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        protocol::decode_line(line.trim_end()).unwrap()
    }

    fn connect(server: &IpcServer) -> (UnixStream, BufReader<UnixStream>) {
        let stream = UnixStream::connect(server.path()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        (stream, reader)
    }

    fn send(stream: &mut UnixStream, message: &Message) {
        let line = protocol::encode_line(message).unwrap();
        stream.write_all(line.as_bytes()).unwrap();
    }

    #[test]
    fn socket_file_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir);
        let mode = std::fs::metadata(server.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        server.stop();
    }

    #[test]
    fn newcomer_receives_the_current_state_first() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir);
        let (_stream, mut reader) = connect(&server);

        assert!(matches!(read_line(&mut reader), Message::State(_)));
        server.stop();
    }

    #[test]
    fn command_gets_a_correlated_response() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir);
        let (mut stream, mut reader) = connect(&server);
        let _hello = read_line(&mut reader);

        send(
            &mut stream,
            &Message::Command(CommandMessage {
                request_id: "req-1".to_string(),
                action: Action::List,
                label: None,
            }),
        );
        let Message::Response(response) = read_line(&mut reader) else {
            panic!("expected a response");
        };
        assert_eq!(response.request_id, "req-1");
        assert!(response.success);
        assert_eq!(response.process_list.unwrap()[0].name, "web");
        server.stop();
    }

    #[test]
    fn handler_errors_become_error_responses() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir);
        let (mut stream, mut reader) = connect(&server);
        let _hello = read_line(&mut reader);

        send(
            &mut stream,
            &Message::Command(CommandMessage {
                request_id: "req-2".to_string(),
                action: Action::Stop,
                label: Some("ghost".to_string()),
            }),
        );
        let Message::Response(response) = read_line(&mut reader) else {
            panic!("expected a response");
        };
        assert!(!response.success);
        assert!(response.error.unwrap().contains("not found"));
        server.stop();
    }

    #[test]
    fn parse_errors_keep_the_connection_alive() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir);
        let (mut stream, mut reader) = connect(&server);
        let _hello = read_line(&mut reader);

        stream.write_all(b"this is not json\n").unwrap();
        let Message::Response(bad) = read_line(&mut reader) else {
            panic!("expected a response");
        };
        assert!(!bad.success);

        // the same connection still dispatches commands
        send(
            &mut stream,
            &Message::Command(CommandMessage {
                request_id: "after-garbage".to_string(),
                action: Action::Start,
                label: Some("web".to_string()),
            }),
        );
        let Message::Response(ok) = read_line(&mut reader) else {
            panic!("expected a response");
        };
        assert_eq!(ok.request_id, "after-garbage");
        assert!(ok.success);
        server.stop();
    }

    #[test]
    fn broadcast_reaches_every_client() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir);
        let (_s1, mut r1) = connect(&server);
        let (_s2, mut r2) = connect(&server);
        let _ = read_line(&mut r1);
        let _ = read_line(&mut r2);

        server.broadcast(&StubDispatcher.get_state());

        assert!(matches!(read_line(&mut r1), Message::State(_)));
        assert!(matches!(read_line(&mut r2), Message::State(_)));
        server.stop();
    }

    #[test]
    fn stop_removes_the_socket_and_disconnects_clients() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir);
        let (_stream, mut reader) = connect(&server);
        let _hello = read_line(&mut reader);

        server.stop();

        assert!(!server.path().exists());
        let mut line = String::new();
        // EOF: the handler is gone and the stream is shut down
        assert_eq!(reader.read_line(&mut line).unwrap_or(0), 0);
    }

    #[test]
    fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir);
        server.stop();
        server.stop();
    }

    #[test]
    fn same_uid_peer_is_authorized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.socket");
        let listener = UnixListener::bind(&path).unwrap();
        let client = UnixStream::connect(&path).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        assert_eq!(authorize(&server_side), Ok(()));
        drop(client);
    }
}
