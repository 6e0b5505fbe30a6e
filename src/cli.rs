use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Terminal process supervisor with PTY scrollback and a local control socket.
#[derive(Debug, Parser)]
#[command(name = "proctmux", version, about)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'f', long = "config", default_value = "proctmux.yaml")]
    pub config: PathBuf,

    /// Role of this invocation.
    #[arg(long, value_enum, default_value_t = Mode::Primary)]
    pub mode: Mode,

    /// Shorthand for `--mode client`.
    #[arg(long)]
    pub client: bool,

    /// Run supervisor and client TUI on one terminal, toggled by a keypress.
    #[arg(long)]
    pub unified: bool,

    /// Unified mode with the client pane docked left.
    #[arg(long)]
    pub unified_left: bool,

    /// Unified mode with the client pane docked right.
    #[arg(long)]
    pub unified_right: bool,

    /// Unified mode with the client pane docked top.
    #[arg(long)]
    pub unified_top: bool,

    /// Unified mode with the client pane docked bottom.
    #[arg(long)]
    pub unified_bottom: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Primary,
    Client,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Mode::Primary => "primary",
            Mode::Client => "client",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Subcommand)]
pub enum Command {
    /// Run the supervisor (the default when no subcommand is given).
    Start,

    /// Print every declared process and whether it is running.
    SignalList,

    /// Ask a running server to start a process by name.
    SignalStart { name: String },

    /// Ask a running server to stop a process by name.
    SignalStop { name: String },

    /// Ask a running server to restart a process by name.
    SignalRestart { name: String },

    /// Restart every currently running process.
    SignalRestartRunning,

    /// Stop every currently running process.
    SignalStopRunning,
}

/// Client pane placement in unified mode. Advisory: the layout itself is the
/// TUI's concern, the coordinator only records the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnifiedPlacement {
    Full,
    Left,
    Right,
    Top,
    Bottom,
}

impl Cli {
    pub fn effective_mode(&self) -> Mode {
        if self.client {
            Mode::Client
        } else {
            self.mode
        }
    }

    pub fn unified_placement(&self) -> Option<UnifiedPlacement> {
        if self.unified_left {
            Some(UnifiedPlacement::Left)
        } else if self.unified_right {
            Some(UnifiedPlacement::Right)
        } else if self.unified_top {
            Some(UnifiedPlacement::Top)
        } else if self.unified_bottom {
            Some(UnifiedPlacement::Bottom)
        } else if self.unified {
            Some(UnifiedPlacement::Full)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["proctmux"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("proctmux.yaml"));
        assert_eq!(cli.effective_mode(), Mode::Primary);
        assert_eq!(cli.unified_placement(), None);
        assert_eq!(cli.command, None);
    }

    #[test]
    fn client_flag_overrides_mode() {
        let cli = Cli::try_parse_from(["proctmux", "--client"]).unwrap();
        assert_eq!(cli.effective_mode(), Mode::Client);

        let cli = Cli::try_parse_from(["proctmux", "--mode", "client"]).unwrap();
        assert_eq!(cli.effective_mode(), Mode::Client);
    }

    #[test]
    fn signal_subcommands_parse() {
        let cli = Cli::try_parse_from(["proctmux", "-f", "dev.yaml", "signal-start", "web"])
            .unwrap();
        assert_eq!(cli.config, PathBuf::from("dev.yaml"));
        assert_eq!(
            cli.command,
            Some(Command::SignalStart {
                name: "web".to_string()
            })
        );

        let cli = Cli::try_parse_from(["proctmux", "signal-list"]).unwrap();
        assert_eq!(cli.command, Some(Command::SignalList));

        let cli = Cli::try_parse_from(["proctmux", "signal-restart-running"]).unwrap();
        assert_eq!(cli.command, Some(Command::SignalRestartRunning));
    }

    #[test]
    fn unified_placements() {
        let cli = Cli::try_parse_from(["proctmux", "--unified"]).unwrap();
        assert_eq!(cli.unified_placement(), Some(UnifiedPlacement::Full));

        let cli = Cli::try_parse_from(["proctmux", "--unified-left"]).unwrap();
        assert_eq!(cli.unified_placement(), Some(UnifiedPlacement::Left));
    }

    #[test]
    fn unknown_arguments_are_rejected() {
        assert!(Cli::try_parse_from(["proctmux", "--definitely-not-a-flag"]).is_err());
        assert!(Cli::try_parse_from(["proctmux", "signal-start"]).is_err());
    }
}
