use clap::Args;
use panewatch_core::panes::{
    DEFAULT_AGENTS_SESSION, DEFAULT_CAPTURE_LINES, DEFAULT_PANE_COUNT, DEFAULT_TMUX_BIN,
};
use panewatch_core::PaneQuery;
use panewatch_ssh::config::DEFAULT_SSH_PORT;
use panewatch_ssh::poller::DEFAULT_POLL_INTERVAL;
use panewatch_ssh::{Credentials, ReconnectPolicy, SessionConfig};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAIN_TARGET: &str = "shogun:main";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("no host configured (use --host, `host` in the config file or PANEWATCH_HOST)")]
    MissingHost,
    #[error("no user configured (use --user, `user` in the config file or PANEWATCH_USER)")]
    MissingUser,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub max_attempts: Option<u32>,
    pub delay_secs: Option<u64>,
}

/// Contents of `config.toml`; every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub key_path: Option<PathBuf>,
    pub password: Option<String>,
    pub agents_session: Option<String>,
    pub main_target: Option<String>,
    pub pane_count: Option<usize>,
    pub tmux_bin: Option<String>,
    pub capture_lines: Option<u32>,
    pub poll_interval_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub channel_timeout_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,
    pub keepalive_secs: Option<u64>,
    pub reconnect: ReconnectSection,
    pub project_path: Option<String>,
    pub log_dir: Option<String>,
}

/// Connection flags shared by every subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct ConnectionArgs {
    /// SSH host
    #[arg(long, global = true)]
    pub host: Option<String>,
    #[arg(long, global = true)]
    pub port: Option<u16>,
    #[arg(long, global = true)]
    pub user: Option<String>,
    /// Private key; disables password auth when set
    #[arg(long, global = true)]
    pub key: Option<PathBuf>,
    /// Remote checkout holding dashboard.md and scripts/
    #[arg(long, global = true)]
    pub project_path: Option<String>,
    #[arg(long, global = true)]
    pub log_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub credentials: Credentials,
    pub session: SessionConfig,
    pub query: PaneQuery,
    pub pane_count: usize,
    pub main_target: String,
    pub poll_interval: Duration,
    pub project_path: Option<String>,
    pub log_dir: Option<PathBuf>,
}

impl Settings {
    pub fn pane_indices(&self) -> Vec<usize> {
        (0..self.pane_count).collect()
    }
}

/// Picks `--config`, then `PANEWATCH_CONFIG`, then the per-user default.
///
/// An explicitly named file must exist; the default path is optional.
pub fn load_file_config(flag: Option<&Path>) -> Result<FileConfig, ConfigError> {
    if let Some(path) = flag {
        return read_config(path);
    }
    if let Ok(value) = env::var("PANEWATCH_CONFIG") {
        if !value.trim().is_empty() {
            return read_config(Path::new(&value));
        }
    }
    match default_config_path() {
        Some(path) if path.exists() => read_config(&path),
        _ => Ok(FileConfig::default()),
    }
}

pub fn read_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn default_config_path() -> Option<PathBuf> {
    if let Ok(value) = env::var("XDG_CONFIG_HOME") {
        if !value.trim().is_empty() {
            return Some(PathBuf::from(value).join("panewatch/config.toml"));
        }
    }
    dirs::home_dir().map(|home| home.join(".config/panewatch/config.toml"))
}

pub fn env_var(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Flags win over the file; environment variables only fill what is left.
pub fn resolve_settings(
    file: FileConfig,
    flags: &ConnectionArgs,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Settings, ConfigError> {
    let host = resolve_value(flags.host.clone(), file.host, "PANEWATCH_HOST", &lookup)
        .ok_or(ConfigError::MissingHost)?;
    let user = resolve_value(flags.user.clone(), file.user, "PANEWATCH_USER", &lookup)
        .ok_or(ConfigError::MissingUser)?;
    let key_path = resolve_value(
        flags.key.as_ref().map(|path| path.to_string_lossy().to_string()),
        file.key_path.map(|path| path.to_string_lossy().to_string()),
        "PANEWATCH_KEY",
        &lookup,
    )
    .map(PathBuf::from);
    let password = resolve_value(None, file.password, "PANEWATCH_PASSWORD", &lookup);
    let log_dir = resolve_value(flags.log_dir.clone(), file.log_dir, "PANEWATCH_LOG_DIR", &lookup)
        .map(PathBuf::from);
    let project_path = resolve_value(
        flags.project_path.clone(),
        file.project_path,
        "PANEWATCH_PROJECT_PATH",
        &lookup,
    );

    let mut credentials =
        Credentials::new(host, user).with_port(flags.port.or(file.port).unwrap_or(DEFAULT_SSH_PORT));
    credentials.key_path = key_path;
    credentials.password = password;

    let defaults = SessionConfig::default();
    let session = SessionConfig {
        connect_timeout: secs_or(file.connect_timeout_secs, defaults.connect_timeout),
        channel_timeout: secs_or(file.channel_timeout_secs, defaults.channel_timeout),
        command_timeout: secs_or(file.command_timeout_secs, defaults.command_timeout),
        keepalive_interval: secs_or(file.keepalive_secs, defaults.keepalive_interval),
        reconnect: ReconnectPolicy {
            max_attempts: file
                .reconnect
                .max_attempts
                .unwrap_or(defaults.reconnect.max_attempts),
            delay: secs_or(file.reconnect.delay_secs, defaults.reconnect.delay),
        },
        ..defaults
    };

    let query = PaneQuery {
        tmux_bin: file
            .tmux_bin
            .unwrap_or_else(|| DEFAULT_TMUX_BIN.to_string()),
        session: file
            .agents_session
            .unwrap_or_else(|| DEFAULT_AGENTS_SESSION.to_string()),
        window: 0,
        capture_lines: file.capture_lines.unwrap_or(DEFAULT_CAPTURE_LINES),
    };

    Ok(Settings {
        credentials,
        session,
        query,
        pane_count: file.pane_count.unwrap_or(DEFAULT_PANE_COUNT),
        main_target: file
            .main_target
            .unwrap_or_else(|| DEFAULT_MAIN_TARGET.to_string()),
        poll_interval: secs_or(file.poll_interval_secs, DEFAULT_POLL_INTERVAL),
        project_path,
        log_dir,
    })
}

fn resolve_value(
    flag: Option<String>,
    file: Option<String>,
    env_key: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    [flag, file, lookup(env_key)]
        .into_iter()
        .flatten()
        .find(|value| !value.trim().is_empty())
}

fn secs_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}
