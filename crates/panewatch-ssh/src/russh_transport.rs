use crate::config::{Credentials, SessionConfig};
use crate::error::{Result, SessionError};
use crate::transport::{Connector, ShellStream, Transport};
use async_trait::async_trait;
use russh::client::{self, Handle, KeyboardInteractiveAuthResponse, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const KEEPALIVE_MAX: usize = 3;
const MAX_INTERACTIVE_ROUNDS: usize = 4;
const PTY_TERM: &str = "xterm-256color";
const PTY_COLS: u32 = 200;
const PTY_ROWS: u32 = 50;

/// Connects with russh.
///
/// Host keys are accepted without verification: the target is a single
/// pre-known private host. The fingerprint is logged at debug.
#[derive(Debug, Clone, Copy, Default)]
pub struct RusshConnector;

struct PermissiveHostKeys {
    host: String,
}

#[async_trait]
impl client::Handler for PermissiveHostKeys {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(),
            "ssh_host_key_accepted"
        );
        Ok(true)
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        credentials: &Credentials,
        config: &SessionConfig,
    ) -> Result<Arc<dyn Transport>> {
        let ssh_config = Arc::new(client::Config {
            keepalive_interval: Some(config.keepalive_interval),
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        });
        let handler = PermissiveHostKeys {
            host: credentials.host.clone(),
        };

        let mut handle = client::connect(
            ssh_config,
            (credentials.host.as_str(), credentials.port),
            handler,
        )
        .await
        .map_err(|err| connect_error(credentials, err))?;

        let accepted = authenticate(&mut handle, credentials)
            .await
            .map_err(|err| connect_error(credentials, err))?;
        if !accepted {
            return Err(SessionError::AuthRejected {
                user: credentials.username.clone(),
                host: credentials.host.clone(),
            });
        }

        info!(
            host = %credentials.host,
            port = credentials.port,
            user = %credentials.username,
            "ssh_connected"
        );
        Ok(Arc::new(RusshTransport {
            handle,
            channel_timeout: config.channel_timeout,
        }))
    }
}

async fn authenticate(
    handle: &mut Handle<PermissiveHostKeys>,
    credentials: &Credentials,
) -> std::result::Result<bool, String> {
    let user = credentials.username.as_str();

    if let Some(path) = &credentials.key_path {
        let key_pair = russh_keys::load_secret_key(path, None)
            .map_err(|err| format!("load key {}: {err}", path.display()))?;
        return handle
            .authenticate_publickey(user, Arc::new(key_pair))
            .await
            .map_err(|err| err.to_string());
    }

    // The password is submitted at most once: to the first keyboard-interactive
    // prompt round, or to plain password auth when no prompt was ever shown.
    let password = credentials.password.clone().unwrap_or_default();
    let mut budget = PasswordBudget::default();
    if keyboard_interactive(handle, user, &password, &mut budget).await? {
        return Ok(true);
    }
    if !budget.allows_password_auth() {
        debug!("ssh_auth_password_already_used");
        return Ok(false);
    }
    handle
        .authenticate_password(user, password.as_str())
        .await
        .map_err(|err| err.to_string())
}

async fn keyboard_interactive(
    handle: &mut Handle<PermissiveHostKeys>,
    user: &str,
    password: &str,
    budget: &mut PasswordBudget,
) -> std::result::Result<bool, String> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(user, None::<String>)
        .await
        .map_err(|err| err.to_string())?;
    for _ in 0..MAX_INTERACTIVE_ROUNDS {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::Failure => return Ok(false),
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                let Some(answers) = budget.answer_round(prompts.len(), password) else {
                    debug!("ssh_auth_second_prompt_refused");
                    return Ok(false);
                };
                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(|err| err.to_string())?;
            }
        }
    }
    Ok(false)
}

/// Tracks the single password submission allowed per connection.
#[derive(Debug, Default)]
struct PasswordBudget {
    spent: bool,
}

impl PasswordBudget {
    /// Answers for one prompt round, or `None` when the round would need the
    /// password a second time. Empty rounds cost nothing.
    fn answer_round(&mut self, prompts: usize, password: &str) -> Option<Vec<String>> {
        if prompts == 0 {
            return Some(Vec::new());
        }
        if self.spent {
            return None;
        }
        self.spent = true;
        Some(vec![password.to_string(); prompts])
    }

    fn allows_password_auth(&self) -> bool {
        !self.spent
    }
}

fn connect_error(credentials: &Credentials, cause: impl ToString) -> SessionError {
    SessionError::Connect {
        host: credentials.host.clone(),
        port: credentials.port,
        password_len: credentials.password_len(),
        cause: cause.to_string(),
    }
}

fn channel_error(err: russh::Error) -> SessionError {
    SessionError::Channel(err.to_string())
}

struct RusshTransport {
    handle: Handle<PermissiveHostKeys>,
    channel_timeout: Duration,
}

impl RusshTransport {
    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, russh::Error>>,
    {
        match tokio::time::timeout(self.channel_timeout, fut).await {
            Ok(result) => result.map_err(channel_error),
            Err(_) => Err(SessionError::ChannelTimeout {
                operation,
                after: self.channel_timeout,
            }),
        }
    }
}

#[async_trait]
impl Transport for RusshTransport {
    fn is_alive(&self) -> bool {
        !self.handle.is_closed()
    }

    async fn open_shell(&self) -> Result<Box<dyn ShellStream>> {
        let channel = self
            .bounded("open_shell", async {
                let channel = self.handle.channel_open_session().await?;
                channel
                    .request_pty(false, PTY_TERM, PTY_COLS, PTY_ROWS, 0, 0, &[])
                    .await?;
                channel.request_shell(true).await?;
                Ok(channel)
            })
            .await?;
        debug!("ssh_shell_opened");
        Ok(Box::new(RusshShell { channel }))
    }

    async fn exec(&self, command: &str) -> Result<String> {
        let mut channel = self
            .bounded("exec", async {
                let channel = self.handle.channel_open_session().await?;
                channel.exec(true, command).await?;
                Ok(channel)
            })
            .await?;

        let mut stdout = Vec::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => {
                    debug!(exit_status, "ssh_exec_exit_status");
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    async fn close(&self) {
        if let Err(err) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("ssh_disconnect_error: {err}");
        }
    }
}

struct RusshShell {
    channel: Channel<Msg>,
}

#[async_trait]
impl ShellStream for RusshShell {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::ExtendedData { data, .. }) => return Ok(Some(data.to_vec())),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => return Ok(None),
                Some(_) => continue,
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.channel.data(data).await.map_err(channel_error)
    }

    async fn close(&mut self) {
        let _ = self.channel.eof().await;
        let _ = self.channel.close().await;
    }
}
