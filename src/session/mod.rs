//! Remote command and file transfer sessions over the system `ssh` client.
//!
//! A [`RemoteSession`] is opened once per boot of the target host. Opening
//! runs a no-op command so authentication and reachability failures surface
//! before any real work is attempted. Commands run through a
//! [`CommandRunner`] so tests can script the transport.

use std::ffi::OsString;
use std::net::IpAddr;

use camino::Utf8PathBuf;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::debug;

mod config;
mod types;

pub use config::{DEFAULT_CONNECT_TIMEOUT_SECS, SessionConfig};
pub use types::{CommandOutput, CommandRunner, ProcessCommandRunner};

/// Keep-alive probe interval; the probe budget derives from the connect
/// timeout so a silent host is abandoned after roughly that long.
const SERVER_ALIVE_INTERVAL_SECS: u64 = 30;

/// Key-based credentials accepted by [`RemoteSession::connect`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Credentials {
    /// Use whatever keys the local SSH agent offers.
    Agent,
    /// Use a specific private key file.
    IdentityFile(Utf8PathBuf),
}

impl Credentials {
    /// Picks credentials from configuration, preferring an explicit identity
    /// file over the agent.
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        config.identity_file.as_deref().map_or(Self::Agent, |path| {
            Self::IdentityFile(Utf8PathBuf::from(expand_tilde(path)))
        })
    }
}

/// Errors raised by the remote session layer.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    /// Raised when session configuration is invalid.
    #[error("invalid ssh configuration for {field}: {message}")]
    InvalidConfig {
        /// Field that failed validation.
        field: String,
        /// Guidance for fixing the value.
        message: String,
    },
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the initial probe command fails.
    #[error("ssh connection to {user}@{host} failed with status {status_text}: {stderr}")]
    Connect {
        /// Remote user.
        user: String,
        /// Remote host.
        host: IpAddr,
        /// Human readable exit status.
        status_text: String,
        /// Stderr captured from the client.
        stderr: String,
    },
    /// Raised when a remote command exits unsuccessfully.
    #[error("remote command exited with status {status_text}: {stderr}")]
    Command {
        /// Command as sent to the host.
        command: String,
        /// Exit status as reported by the client.
        status: Option<i32>,
        /// Human readable exit status.
        status_text: String,
        /// Captured stdout.
        stdout: String,
        /// Captured stderr.
        stderr: String,
    },
    /// Raised when writing a remote file fails.
    #[error("upload to {path} failed with status {status_text}: {stderr}")]
    Upload {
        /// Destination path on the host.
        path: String,
        /// Human readable exit status.
        status_text: String,
        /// Captured stderr.
        stderr: String,
    },
}

/// Authenticated shell access to one host.
#[derive(Clone, Debug)]
pub struct RemoteSession<R: CommandRunner> {
    config: SessionConfig,
    runner: R,
    host: IpAddr,
    credentials: Credentials,
}

impl<R: CommandRunner> RemoteSession<R> {
    /// Opens a session by running a no-op command on `host`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] when the configuration is
    /// incomplete, [`SessionError::Spawn`] when `ssh` cannot be started, or
    /// [`SessionError::Connect`] when authentication or the connection fails.
    pub fn connect(
        config: SessionConfig,
        runner: R,
        host: IpAddr,
        credentials: Credentials,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let session = Self {
            config,
            runner,
            host,
            credentials,
        };

        let args = session.ssh_args("true");
        let output = session.runner.run(&session.config.ssh_bin, &args)?;
        if !output.is_success() {
            return Err(SessionError::Connect {
                user: session.config.user.clone(),
                host,
                status_text: output.status_text(),
                stderr: output.stderr.trim().to_owned(),
            });
        }

        debug!(host = %host, user = %session.config.user, "ssh session established");
        Ok(session)
    }

    /// Host this session talks to.
    #[must_use]
    pub const fn host(&self) -> IpAddr {
        self.host
    }

    /// Runs `command` and returns its output when it exits with status zero.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Command`] carrying stdout and stderr when the
    /// command fails, or [`SessionError::Spawn`] when `ssh` cannot start.
    ///
    /// # Security
    ///
    /// `command` is passed verbatim to the remote shell. Callers must quote
    /// untrusted values.
    pub fn run(&self, command: &str) -> Result<CommandOutput, SessionError> {
        let args = self.ssh_args(command);
        let output = self.runner.run(&self.config.ssh_bin, &args)?;
        if output.is_success() {
            return Ok(output);
        }

        Err(SessionError::Command {
            command: command.to_owned(),
            status: output.code,
            status_text: output.status_text(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Writes `contents` to `remote_path` and applies the octal `mode`.
    ///
    /// The file is created under a restrictive umask so secrets are never
    /// world-readable, even briefly.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Upload`] when the remote write fails.
    pub fn upload(&self, remote_path: &str, contents: &[u8], mode: u32) -> Result<(), SessionError> {
        let path = escape(remote_path.into());
        let command = format!("umask 077 && cat > {path} && chmod {mode:o} {path}");
        let args = self.ssh_args(&command);
        let output = self
            .runner
            .run_with_input(&self.config.ssh_bin, &args, contents)?;
        if output.is_success() {
            debug!(host = %self.host, path = remote_path, bytes = contents.len(), "uploaded file");
            return Ok(());
        }

        Err(SessionError::Upload {
            path: remote_path.to_owned(),
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        })
    }

    /// Ends the session. The system client holds no persistent connection,
    /// so this only records the event.
    pub fn close(self) {
        debug!(host = %self.host, "ssh session closed");
    }

    fn ssh_args(&self, remote_command: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.config.port.to_string()),
        ];

        if let Credentials::IdentityFile(ref path) = self.credentials {
            args.push(OsString::from("-i"));
            args.push(OsString::from(path.as_str()));
            push_option(&mut args, "IdentitiesOnly=yes");
        }

        let alive_count = self
            .config
            .connect_timeout_secs
            .div_ceil(SERVER_ALIVE_INTERVAL_SECS)
            .max(1);

        push_option(&mut args, "BatchMode=yes");
        push_option(&mut args, "PasswordAuthentication=no");
        push_option(&mut args, "StrictHostKeyChecking=no");
        push_option(
            &mut args,
            &format!("UserKnownHostsFile={}", self.config.known_hosts_file),
        );
        push_option(
            &mut args,
            &format!("ConnectTimeout={}", self.config.connect_timeout_secs),
        );
        push_option(
            &mut args,
            &format!("ServerAliveInterval={SERVER_ALIVE_INTERVAL_SECS}"),
        );
        push_option(&mut args, &format!("ServerAliveCountMax={alive_count}"));
        args.push(OsString::from(format!("{}@{}", self.config.user, self.host)));
        args.push(OsString::from(remote_command));
        args
    }
}

fn push_option(args: &mut Vec<OsString>, option: &str) {
    args.push(OsString::from("-o"));
    args.push(OsString::from(option));
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// When `HOME` is unset the input is returned unchanged.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
