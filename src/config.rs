use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::logging::LoggingConfig;

/// SIGTERM, the stop signal used when a process does not configure one.
pub const DEFAULT_STOP_SIGNAL: i32 = 15;

/// Scrollback kept per process instance.
pub const DEFAULT_SCROLLBACK_BYTES: usize = 1024 * 1024;

const DEFAULT_PLACEHOLDER_BANNER: &str =
    "no process selected - use the client or signal commands to switch";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse config file `{path}`: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("process `{0}` must set exactly one of `shell` or `cmd`")]
    ShellCmdExclusive(String),

    #[error("process `{0}` configures an empty `cmd`")]
    EmptyCmd(String),

    #[error("no processes declared")]
    NoProcesses,
}

/// The full parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub procs: Procs,

    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The declared process table, in file declaration order.
///
/// Declaration order is observable: it fixes process ids and the row order of
/// `list`/`signal-list`, so the YAML mapping is kept as an ordered sequence
/// of entries rather than a sorted map. Duplicate labels are rejected at
/// parse time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Procs(Vec<(String, ProcessConfig)>);

impl Procs {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ProcessConfig)> {
        self.0.iter().map(|(label, config)| (label.as_str(), config))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, label: &str) -> Option<&ProcessConfig> {
        self.0
            .iter()
            .find(|(existing, _)| existing == label)
            .map(|(_, config)| config)
    }

    /// Label-sorted copy, used when a declaration-order-independent view is
    /// needed (the socket path hash).
    pub fn sorted_by_label(&self) -> Self {
        let mut entries = self.0.clone();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        Self(entries)
    }
}

impl FromIterator<(String, ProcessConfig)> for Procs {
    fn from_iter<I: IntoIterator<Item = (String, ProcessConfig)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for Procs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (label, config) in &self.0 {
            map.serialize_entry(label, config)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Procs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ProcsVisitor;

        impl<'de> Visitor<'de> for ProcsVisitor {
            type Value = Procs;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a mapping of process labels to process settings")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Procs, A::Error> {
                let mut entries: Vec<(String, ProcessConfig)> =
                    Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((label, config)) =
                    access.next_entry::<String, ProcessConfig>()?
                {
                    if entries.iter().any(|(existing, _)| *existing == label) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate process label `{label}`"
                        )));
                    }
                    entries.push((label, config));
                }
                Ok(Procs(entries))
            }
        }

        deserializer.deserialize_map(ProcsVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Banner the viewer renders when no process is selected.
    pub placeholder_banner: String,

    /// Scrollback capacity in bytes for every process instance.
    pub scrollback_bytes: usize,

    /// Byte the toggle coordinator intercepts to switch panes. 0x17 = Ctrl+W.
    pub toggle_byte: u8,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            placeholder_banner: DEFAULT_PLACEHOLDER_BANNER.to_string(),
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            toggle_byte: 0x17,
        }
    }
}

/// One declared process. Immutable after load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Shell-form command, run as `sh -c <shell>`. Mutually exclusive with `cmd`.
    pub shell: Option<String>,

    /// Argv-form command. Mutually exclusive with `shell`.
    pub cmd: Option<Vec<String>>,

    pub cwd: Option<PathBuf>,

    pub env: HashMap<String, String>,

    /// Directories prepended to the child's PATH.
    pub add_path: Vec<PathBuf>,

    /// Signal number delivered on `stop`. 0 and 15 both mean SIGTERM, which
    /// escalates to SIGKILL if the process ignores it.
    pub stop: i32,

    pub autostart: bool,

    pub categories: Vec<String>,

    pub description: Option<String>,

    pub docs: Option<String>,

    /// Optional fixed PTY size. Defaults to the controlling terminal's size.
    pub rows: Option<u16>,
    pub cols: Option<u16>,
}

impl ProcessConfig {
    /// The stop signal number, with the 0-means-default rule applied.
    pub fn stop_signal(&self) -> i32 {
        if self.stop == 0 {
            DEFAULT_STOP_SIGNAL
        } else {
            self.stop
        }
    }

    /// Whether the stop path escalates to SIGKILL after the grace period.
    pub fn escalates_to_kill(&self) -> bool {
        self.stop_signal() == DEFAULT_STOP_SIGNAL
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.procs.is_empty() {
            return Err(ConfigError::NoProcesses);
        }
        for (label, proc) in self.procs.iter() {
            match (&proc.shell, &proc.cmd) {
                (Some(_), None) => {}
                (None, Some(cmd)) if cmd.is_empty() => {
                    return Err(ConfigError::EmptyCmd(label.to_string()))
                }
                (None, Some(_)) => {}
                _ => return Err(ConfigError::ShellCmdExclusive(label.to_string())),
            }
        }
        Ok(())
    }
}
