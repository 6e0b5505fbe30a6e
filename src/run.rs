//! Wiring for the three long-running modes (primary server, unified
//! single-terminal, line client) and the one-shot signal commands.

use std::io::Write;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::cli::{Cli, Command};
use crate::commands::{self, CommandError};
use crate::config::{Config, ConfigError};
use crate::event::channel::{pub_sub, EventPublisher};
use crate::event::ApplicationEvent;
use crate::ipc::client::IpcClient;
use crate::ipc::error::TransportError;
use crate::ipc::server::IpcServer;
use crate::ipc::socket;
use crate::logging::LoggingError;
use crate::supervisor::contract::{Action, StateSink};
use crate::supervisor::Supervisor;
use crate::toggle::{FanoutSink, InProcessStateSink, ToggleCoordinator, ToggleError};
use crate::viewer::{Viewer, ViewerError};

/// How long clients wait for the server's socket file to appear.
const CLIENT_SOCKET_WAIT: std::time::Duration = std::time::Duration::from_secs(30);

/// The unified coordinator starts its own server and waits less.
const COORDINATOR_SOCKET_WAIT: std::time::Duration = std::time::Duration::from_secs(5);

/// Disables the alternate screen in the client when truthy.
pub const NO_ALTSCREEN_ENV: &str = "PROCTMUX_NO_ALTSCREEN";

/// Test hook consumed by the external terminal-integration adapter.
pub const TMUX_BIN_ENV: &str = "PROCTMUX_TMUX_BIN";

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Viewer(#[from] ViewerError),

    #[error(transparent)]
    Toggle(#[from] ToggleError),

    #[error("could not install the shutdown signal handler: {0}")]
    SignalHandler(#[from] ctrlc::Error),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Primary server mode: supervisor + viewer on this terminal, control socket
/// for clients, until INT/TERM.
pub fn run_primary(cli: &Cli) -> Result<(), RunError> {
    let config = Config::load(&cli.config)?;
    let _log_guard = config
        .logging
        .try_init_file(&socket::default_log_path(&config))?;
    log_integration_hook();

    let socket_path = socket::socket_path(&config);
    let viewer = Arc::new(Viewer::new(config.general.placeholder_banner.clone()));
    let supervisor = Supervisor::new(&config, Arc::clone(&viewer));

    let server = Arc::new(IpcServer::start(&socket_path, Arc::new(supervisor.clone()))?);
    supervisor.set_state_sink(Arc::clone(&server) as Arc<dyn StateSink>);

    let (stop_publisher, stop_consumer) = pub_sub::<ApplicationEvent>();
    install_shutdown_handler(stop_publisher)?;

    supervisor.start_autostart();
    viewer.show_placeholder()?;
    info!("primary server running");

    // parked until INT/TERM arrives
    let _ = stop_consumer.as_ref().recv();
    info!("shutdown requested");

    supervisor.shutdown();
    server.stop();
    Ok(())
}

/// Unified mode: everything of primary, plus the toggle coordinator driving
/// this terminal and a child client TUI.
pub fn run_unified(cli: &Cli) -> Result<(), RunError> {
    let config = Config::load(&cli.config)?;
    let _log_guard = config
        .logging
        .try_init_file(&socket::default_log_path(&config))?;
    log_integration_hook();
    debug!(placement = ?cli.unified_placement(), "unified mode requested");

    let socket_path = socket::socket_path(&config);
    let viewer = Arc::new(Viewer::new(config.general.placeholder_banner.clone()));
    let supervisor = Supervisor::new(&config, viewer);

    let server = Arc::new(IpcServer::start(&socket_path, Arc::new(supervisor.clone()))?);
    let in_process = Arc::new(InProcessStateSink::new());
    let state_updates = in_process.subscribe();
    supervisor.set_state_sink(Arc::new(FanoutSink(vec![
        Arc::clone(&server) as Arc<dyn StateSink>,
        in_process as Arc<dyn StateSink>,
    ])));

    let (stop_publisher, stop_consumer) = pub_sub::<ApplicationEvent>();
    install_shutdown_handler(stop_publisher)?;

    supervisor.start_autostart();
    socket::wait_for_socket(&socket_path, COORDINATOR_SOCKET_WAIT)?;

    let coordinator = ToggleCoordinator::new(
        supervisor.clone(),
        cli.config.clone(),
        socket_path,
        config.general.clone(),
        state_updates,
    );
    let result = coordinator.run(&stop_consumer);

    supervisor.shutdown();
    server.stop();
    result.map_err(RunError::from)
}

/// Line client: subscribe to state broadcasts and render them until the
/// server goes away. The rich TUI is an external program; this client is the
/// plumbing it builds on.
pub fn run_client(cli: &Cli) -> Result<(), RunError> {
    let config = Config::load(&cli.config)?;
    let _ = config.logging.try_init_stderr();

    let socket_path = socket::socket_path(&config);
    socket::wait_for_socket(&socket_path, CLIENT_SOCKET_WAIT)?;
    let client = IpcClient::connect(&socket_path)?;

    let use_altscreen = !env_truthy(NO_ALTSCREEN_ENV);
    let mut out = std::io::stdout();
    if use_altscreen {
        let _ = out.write_all(b"\x1b[?1049h");
    }

    for update in client.state_updates().iter() {
        let _ = out.write_all(b"\x1b[2J\x1b[H");
        let _ = writeln!(out, "NAME\tSTATUS\tPID\r");
        for view in update
            .process_views
            .iter()
            .filter(|v| v.id != crate::state::PLACEHOLDER_ID)
        {
            let marker = if view.id == update.state.current {
                "*"
            } else {
                " "
            };
            let _ = writeln!(
                out,
                "{marker}{}\t{}\t{}\r",
                view.label, view.status, view.pid
            );
        }
        let _ = out.flush();
        if update.state.exiting {
            break;
        }
    }

    if use_altscreen {
        let _ = out.write_all(b"\x1b[?1049l");
        let _ = out.flush();
    }
    info!("server connection closed");
    Ok(())
}

/// Runs one signal subcommand against a live server.
pub fn run_signal(cli: &Cli, command: &Command) -> Result<(), RunError> {
    let config = Config::load(&cli.config)?;
    let _ = config.logging.try_init_stderr();
    let socket_path = socket::socket_path(&config);

    match command {
        Command::SignalList => commands::signal_list(&socket_path, &mut std::io::stdout())?,
        Command::SignalStart { name } => {
            commands::signal_action(&socket_path, Action::Start, Some(name))?
        }
        Command::SignalStop { name } => {
            commands::signal_action(&socket_path, Action::Stop, Some(name))?
        }
        Command::SignalRestart { name } => {
            commands::signal_action(&socket_path, Action::Restart, Some(name))?
        }
        Command::SignalRestartRunning => {
            commands::signal_action(&socket_path, Action::RestartRunning, None)?
        }
        Command::SignalStopRunning => {
            commands::signal_action(&socket_path, Action::StopRunning, None)?
        }
        Command::Start => unreachable!("start is handled by the mode dispatch"),
    }
    Ok(())
}

/// INT/TERM publish a stop request; the main loop unwinds from there so that
/// every scoped resource (raw mode included) is released.
fn install_shutdown_handler(
    publisher: EventPublisher<ApplicationEvent>,
) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!("termination signal received, stopping");
        if let Err(err) = publisher.publish(ApplicationEvent::StopRequested) {
            error!(error = %err, "could not publish the stop request");
        }
    })
}

fn log_integration_hook() {
    if let Ok(bin) = std::env::var(TMUX_BIN_ENV) {
        debug!(bin, "terminal integration adapter override set");
    }
}

fn env_truthy(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => {
            let value = value.trim().to_ascii_lowercase();
            !(value.is_empty() || value == "0" || value == "false" || value == "no")
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_truthy_rules() {
        // uses a name no other test touches
        std::env::set_var("PROCTMUX_TEST_TRUTHY", "1");
        assert!(env_truthy("PROCTMUX_TEST_TRUTHY"));
        std::env::set_var("PROCTMUX_TEST_TRUTHY", "false");
        assert!(!env_truthy("PROCTMUX_TEST_TRUTHY"));
        std::env::set_var("PROCTMUX_TEST_TRUTHY", "0");
        assert!(!env_truthy("PROCTMUX_TEST_TRUTHY"));
        std::env::remove_var("PROCTMUX_TEST_TRUTHY");
        assert!(!env_truthy("PROCTMUX_TEST_TRUTHY"));
    }
}
