use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:4096";

/// Maestro sync - follow OpenCode sessions from the terminal
#[derive(Parser, Debug)]
#[command(name = "maestro-sync")]
pub struct Args {
    /// OpenCode server URL
    #[arg(long, env = "OPENCODE_SERVER_URL")]
    pub server: Option<String>,

    /// Project directory sent with every request
    #[arg(long, env = "OPENCODE_DIRECTORY")]
    pub directory: Option<String>,

    /// Data directory
    #[arg(long, env = "MAESTRO_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List sessions
    Sessions,

    /// Create a session
    New {
        #[arg(long)]
        title: Option<String>,
    },

    /// Follow a session's transcript
    Watch { session: String },

    /// Send a prompt and follow the reply
    Send { session: String, message: String },

    /// Abort the session's running turn
    Abort { session: String },

    /// Run a command on a PTY (defaults to $SHELL)
    Run {
        #[arg(long)]
        cwd: Option<PathBuf>,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

impl Args {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| dirs_data_dir().join("maestro"))
    }

    /// Merge flags and env with the config file. Flags win.
    pub fn resolve(&self, file: SyncConfig) -> Settings {
        Settings {
            server: self
                .server
                .clone()
                .or(file.server)
                .unwrap_or_else(|| DEFAULT_SERVER.to_string()),
            directory: self.directory.clone().or(file.directory),
        }
    }
}

fn dirs_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(".local/share"))
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// config.json format
#[derive(Debug, Default, Deserialize)]
pub struct SyncConfig {
    pub server: Option<String>,
    pub directory: Option<String>,
}

impl SyncConfig {
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let path = data_dir.join("config.json");
        if !path.exists() {
            return Ok(SyncConfig::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;

        serde_json::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
    }
}

/// Effective connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server: String,
    pub directory: Option<String>,
}
