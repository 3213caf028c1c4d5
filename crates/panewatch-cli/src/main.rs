mod config;
mod render;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::{ConnectionArgs, Settings};
use panewatch_ssh::{PanePoller, PollOutcome, RemoteSession, RusshConnector, SessionEvent};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

const PANE_TAIL_LINES: usize = 20;
const MAIN_TAIL_LINES: usize = 60;

#[derive(Parser)]
#[command(name = "panewatch")]
#[command(about = "Supervise remote tmux agent panes over SSH", long_about = None)]
struct Cli {
    /// Config file (defaults to PANEWATCH_CONFIG or ~/.config/panewatch/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(flatten)]
    connection: ConnectionArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll every agent pane once
    Panes,
    /// Keep polling agent panes until interrupted
    Watch {
        /// Seconds between refreshes
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Type text into a pane and press Enter; the pane is `main` or an agent index
    Send { pane: PaneSelector, text: String },
    /// Run a one-shot remote command
    Exec { command: String },
    /// Capture the main command pane
    Main,
    /// Run the rate limit report script
    Usage,
    /// Print the remote dashboard
    Dashboard,
    /// Attach stdin/stdout to the remote interactive shell
    Shell,
}

/// Pane addressed by `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PaneSelector {
    Main,
    Agent(usize),
}

impl FromStr for PaneSelector {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("main") {
            return Ok(PaneSelector::Main);
        }
        value
            .parse()
            .map(PaneSelector::Agent)
            .map_err(|_| format!("expected `main` or a pane index, got `{value}`"))
    }
}

struct LogGuard {
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

struct MultiWriter {
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let file_config =
        config::load_file_config(cli.config.as_deref()).context("Failed to load config")?;
    let settings = config::resolve_settings(file_config, &cli.connection, config::env_var)
        .context("Incomplete connection settings")?;
    let _log_guard = init_logging(&settings);

    let session = RemoteSession::new(RusshConnector, settings.session.clone());
    session
        .connect(settings.credentials.clone())
        .await
        .with_context(|| {
            format!(
                "Failed to connect to {}@{}:{}",
                settings.credentials.username, settings.credentials.host, settings.credentials.port
            )
        })?;

    let outcome = run(cli.command, &session, &settings).await;
    session.disconnect().await;
    outcome
}

async fn run(command: Commands, session: &RemoteSession, settings: &Settings) -> Result<()> {
    let mut stdout = io::stdout();
    match command {
        Commands::Panes => {
            match session
                .poll_panes_batch(&settings.query, &settings.pane_indices())
                .await
                .context("Pane poll failed")?
            {
                PollOutcome::Fresh(batch) => render::write_batch(&mut stdout, &batch, PANE_TAIL_LINES)?,
                PollOutcome::Skipped => println!("poll already in flight"),
            }
        }
        Commands::Watch { interval } => {
            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or(settings.poll_interval);
            watch_panes(session, settings, interval).await?;
        }
        Commands::Send { pane, text } => {
            let (target, tail) = send_target(pane, settings)?;
            session
                .send_to_pane(&settings.query, &target, &text)
                .await
                .with_context(|| format!("Failed to send to {target}"))?;
            let content = session
                .capture_pane(&settings.query, &target)
                .await
                .context("Failed to capture pane")?;
            render::write_styled(&mut stdout, render::tail_lines(&content, tail))?;
            println!();
        }
        Commands::Exec { command } => {
            let output = session.exec(&command).await.context("Remote command failed")?;
            print!("{output}");
        }
        Commands::Main => {
            let content = session
                .capture_pane(&settings.query, &settings.main_target)
                .await
                .with_context(|| format!("Failed to capture {}", settings.main_target))?;
            render::write_styled(&mut stdout, render::tail_lines(&content, MAIN_TAIL_LINES))?;
            println!();
        }
        Commands::Usage => {
            let script = format!("{}/scripts/ratelimit_check.sh", project_path(settings)?);
            let report = session
                .run_usage_report(&script)
                .await
                .context("Usage report failed")?;
            render::write_usage(&mut stdout, &report)?;
        }
        Commands::Dashboard => {
            let path = format!("{}/dashboard.md", project_path(settings)?);
            let dashboard = session
                .read_remote_file(&path)
                .await
                .with_context(|| format!("Failed to read {path}"))?;
            print!("{dashboard}");
        }
        Commands::Shell => interactive_shell(session).await?,
    }
    stdout.flush()?;
    Ok(())
}

/// Target for paced input and how many lines of it to show afterwards.
fn send_target(pane: PaneSelector, settings: &Settings) -> Result<(String, usize)> {
    match pane {
        PaneSelector::Main => Ok((settings.main_target.clone(), MAIN_TAIL_LINES)),
        PaneSelector::Agent(index) if index < settings.pane_count => {
            Ok((settings.query.target(index), PANE_TAIL_LINES))
        }
        PaneSelector::Agent(index) => {
            bail!("pane {index} is outside 0..{}", settings.pane_count)
        }
    }
}

fn project_path(settings: &Settings) -> Result<&str> {
    match settings.project_path.as_deref() {
        Some(path) => Ok(path.trim_end_matches('/')),
        None => bail!("project_path is not configured (--project-path or PANEWATCH_PROJECT_PATH)"),
    }
}

async fn watch_panes(session: &RemoteSession, settings: &Settings, interval: Duration) -> Result<()> {
    let poller = PanePoller::spawn(
        session.clone(),
        settings.query.clone(),
        settings.pane_indices(),
        interval,
    );
    let mut latest = poller.subscribe();
    let mut events = session.subscribe();
    let mut stdout = io::stdout();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = latest.changed() => {
                if changed.is_err() {
                    break;
                }
                let batch = latest.borrow_and_update().clone();
                if let Some(batch) = batch {
                    render::clear_screen(&mut stdout)?;
                    render::write_batch(&mut stdout, &batch, PANE_TAIL_LINES)?;
                }
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Reconnecting { attempt, max_attempts }) => {
                    info!(attempt, max_attempts, "watch_reconnecting");
                }
                Ok(SessionEvent::Reconnected) => poller.refresh_now(),
                Ok(SessionEvent::ReconnectFailed { message }) => {
                    warn!("watch_reconnect_failed: {message}");
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    }

    poller.stop().await;
    Ok(())
}

async fn interactive_shell(session: &RemoteSession) -> Result<()> {
    let mut events = session.subscribe();
    let printer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        loop {
            match events.recv().await {
                Ok(SessionEvent::Output(text)) => {
                    let _ = render::write_styled(&mut stdout, &text);
                    let _ = stdout.flush();
                }
                Ok(SessionEvent::Disconnected { reason, .. }) => {
                    warn!("shell_lost: {reason}");
                }
                Ok(SessionEvent::ReconnectFailed { .. }) | Err(RecvError::Closed) => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => {
                    if let Err(err) = session.send_raw(&line).await {
                        warn!("shell_send_error: {err}");
                    }
                }
                None => break,
            }
        }
    }

    printer.abort();
    Ok(())
}

fn init_logging(settings: &Settings) -> Option<LogGuard> {
    let level = std::env::var("PANEWATCH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match settings.log_dir.as_deref() {
        Some(dir) => match open_log_file(dir) {
            Ok(guard) => guard,
            Err(err) => {
                eprintln!("log_file_error: {err}");
                LogGuard { file: None }
            }
        },
        None => LogGuard { file: None },
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter { file: file.clone() });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

fn open_log_file(dir: &Path) -> io::Result<LogGuard> {
    std::fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("panewatch.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(StdMutex::new(file))),
    })
}
