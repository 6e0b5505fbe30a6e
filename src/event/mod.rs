//! In-process eventing: channel newtypes, cancellation and the bounded
//! broadcast used to fan state snapshots out to in-memory consumers.

pub mod broadcaster;
pub mod cancellation;
pub mod channel;

/// Events addressed to the application entrypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationEvent {
    /// An external signal or an internal failure asked the process to stop.
    StopRequested,
}
