use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// How to launch the worker executable.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Command {
    pub bin_path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// How long to wait for the worker to complete its handshake after spawn.
    #[serde(default = "default_start_timeout")]
    pub start_timeout: Duration,
}

impl Command {
    pub fn new(bin_path: impl Into<PathBuf>) -> Self {
        Self {
            bin_path: bin_path.into(),
            args: Vec::new(),
            start_timeout: default_start_timeout(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Config {
    pub command: Command,
    /// Deadline for the liveness probe sent before every call. `None` waits forever.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: Option<Duration>,
    /// Deadline for decode/render calls. A call that exceeds it is treated as a dead
    /// worker.
    #[serde(default)]
    pub call_timeout: Option<Duration>,
    /// Maximum number of callers allowed to wait for the worker at once.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Config {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            ping_timeout: default_ping_timeout(),
            call_timeout: None,
            queue_capacity: default_queue_capacity(),
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }
}

fn default_start_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_ping_timeout() -> Option<Duration> {
    Some(Duration::from_secs(10))
}

fn default_queue_capacity() -> usize {
    64
}

#[test]
fn config_from_json_fills_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sandpix.json");
    fs::write(&path, r#"{ "command": { "bin_path": "/usr/bin/sandpix-worker" } }"#).unwrap();

    let config = Config::from_json_file(&path).unwrap();

    assert_eq!(config, Config::new(Command::new("/usr/bin/sandpix-worker")));
    assert_eq!(config.command.start_timeout, Duration::from_secs(60));
    assert_eq!(config.queue_capacity, 64);
}

#[test]
fn config_from_missing_file_is_config_error() {
    let err = Config::from_json_file("/definitely/not/here.json").unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
