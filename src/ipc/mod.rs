//! Control-plane IPC: a JSON-lines protocol over a per-config Unix socket
//! with peer-UID authorization, plus the client side used by signal commands
//! and the TUI.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod socket;
