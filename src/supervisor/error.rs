use std::time::Duration;
use thiserror::Error;

use crate::process::instance::InstanceError;
use crate::process::terminator::TerminateError;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("process `{0}` not found")]
    NotFound(String),

    #[error("action `{0}` requires a process label")]
    MissingLabel(String),

    #[error(transparent)]
    Spawn(#[from] InstanceError),

    #[error(transparent)]
    Terminate(#[from] TerminateError),

    #[error("process `{label}` did not halt within {timeout:?}")]
    HaltTimeout { label: String, timeout: Duration },
}
