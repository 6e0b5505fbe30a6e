use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::ipc::error::TransportError;

/// When set, clients use this socket path directly and skip discovery.
pub const SOCKET_ENV: &str = "PROCTMUX_SOCKET";

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Short content hash of the parsed config. Two servers with identical
/// configs share a socket path; any config edit yields a new one. The process
/// table is hashed label-sorted, so reordering declarations in the file does
/// not orphan an existing socket.
pub fn config_hash(config: &Config) -> String {
    let mut canonical = config.clone();
    canonical.procs = canonical.procs.sorted_by_label();
    let yaml = serde_yaml::to_string(&canonical).expect("parsed config must serialize");
    let digest = Sha256::digest(yaml.as_bytes());
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

pub fn socket_path(config: &Config) -> PathBuf {
    if let Ok(path) = std::env::var(SOCKET_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    std::env::temp_dir().join(format!("proctmux-{}.socket", config_hash(config)))
}

/// Default log file, kept next to the socket and named by the same hash.
pub fn default_log_path(config: &Config) -> PathBuf {
    std::env::temp_dir().join(format!("proctmux-{}.log", config_hash(config)))
}

/// Blocks until the socket file exists, polling with a bounded deadline.
pub fn wait_for_socket(path: &Path, timeout: Duration) -> Result<(), TransportError> {
    let deadline = Instant::now() + timeout;
    while !path.exists() {
        if Instant::now() >= deadline {
            return Err(TransportError::SocketWait {
                path: path.to_path_buf(),
            });
        }
        std::thread::sleep(SOCKET_POLL_INTERVAL);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;
    use assert_matches::assert_matches;

    fn shell_proc(label: &str, shell: &str) -> (String, ProcessConfig) {
        (
            label.to_string(),
            ProcessConfig {
                shell: Some(shell.to_string()),
                ..Default::default()
            },
        )
    }

    fn config_with(label: &str, shell: &str) -> Config {
        Config {
            procs: [shell_proc(label, shell)].into_iter().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn equal_configs_share_a_hash() {
        assert_eq!(
            config_hash(&config_with("web", "true")),
            config_hash(&config_with("web", "true"))
        );
    }

    #[test]
    fn different_configs_get_different_hashes() {
        assert_ne!(
            config_hash(&config_with("web", "true")),
            config_hash(&config_with("web", "false"))
        );
    }

    #[test]
    fn declaration_order_does_not_change_the_hash() {
        let forward = Config {
            procs: [shell_proc("web", "true"), shell_proc("db", "true")]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let reversed = Config {
            procs: [shell_proc("db", "true"), shell_proc("web", "true")]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        assert_eq!(config_hash(&forward), config_hash(&reversed));
    }

    #[test]
    fn socket_path_is_named_by_the_hash() {
        let config = config_with("web", "true");
        let path = socket_path(&config);
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("proctmux-"));
        assert!(name.ends_with(".socket"));
        assert!(name.contains(&config_hash(&config)));
    }

    #[test]
    fn wait_for_socket_gives_up() {
        let missing = std::env::temp_dir().join("proctmux-never-appears.socket");
        assert_matches!(
            wait_for_socket(&missing, Duration::from_millis(50)),
            Err(TransportError::SocketWait { .. })
        );
    }

    #[test]
    fn wait_for_socket_sees_existing_files() {
        let file = tempfile::NamedTempFile::new().unwrap();
        wait_for_socket(file.path(), Duration::from_millis(50)).unwrap();
    }
}
