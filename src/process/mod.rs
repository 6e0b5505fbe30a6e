//! PTY-backed child process handling: spawning an [instance::Instance],
//! pumping its output into the scrollback ring and delivering stop signals.

pub mod instance;
pub mod terminator;

pub use instance::{ExitEvent, Instance, InstanceError};
pub use terminator::ProcessTerminator;
