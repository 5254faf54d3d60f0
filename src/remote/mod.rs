//! Authenticated command and file-copy channels to remote hosts
//!
//! `RemoteSession` is the seam between the lifecycle manager and the
//! transport. `SshSession` implements it over `ssh2`; the scripted session
//! in [`crate::testing`] implements it in memory.
//!
//! A session runs one command at a time. Callers that share a session
//! between threads (the keep-alive timer does) must serialize access with a
//! lock held for the whole call.

mod ssh;
mod transfer;

pub use ssh::{SshConnector, SshSession};
pub(crate) use transfer::join_remote;
pub use transfer::read_declared;

use crate::error::Result;
use secrecy::SecretString;
use std::path::PathBuf;

/// SSH authentication method
#[derive(Debug, Clone)]
pub enum SshAuth {
    /// Public key authentication with private key file
    KeyFile {
        key_path: PathBuf,
        passphrase: Option<SecretString>,
    },

    /// Password authentication
    Password(SecretString),

    /// SSH agent authentication
    Agent,
}

/// Where and as whom to log in
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
    /// Connect and handshake timeout in seconds
    pub timeout_secs: u64,
    /// Read deadline for one command in seconds (0 = none)
    pub command_timeout_secs: u64,
    /// Seconds between protocol keep-alive messages (0 = never send)
    pub keepalive_secs: u32,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, username: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            auth,
            timeout_secs: 30,
            command_timeout_secs: 0,
            keepalive_secs: 0,
        }
    }

    /// Log in with a private key file
    pub fn with_key(
        host: impl Into<String>,
        username: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self::new(
            host,
            username,
            SshAuth::KeyFile {
                key_path: key_path.into(),
                passphrase: None,
            },
        )
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_command_timeout(mut self, timeout_secs: u64) -> Self {
        self.command_timeout_secs = timeout_secs;
        self
    }

    pub fn with_keepalive(mut self, interval_secs: u64) -> Self {
        self.keepalive_secs = u32::try_from(interval_secs).unwrap_or(u32::MAX);
        self
    }

    /// `host:port` socket address string
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Captured result of one remote command
///
/// `text` holds stdout and stderr merged in arrival order. Whether the
/// command succeeded is decided by whoever interprets the text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub text: String,
    pub exit_status: Option<i32>,
}

impl CommandOutput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            exit_status: None,
        }
    }
}

/// Receives each output chunk as it arrives
pub type OutputObserver<'a> = &'a mut dyn FnMut(&str);

/// One authenticated channel to one host
pub trait RemoteSession: Send {
    /// Host this session is connected to
    fn host(&self) -> &str;

    /// Run `command` to completion and capture its output
    ///
    /// A read failure aborts the command with `RemoteError::Channel`.
    fn execute(
        &mut self,
        command: &str,
        observer: Option<OutputObserver<'_>>,
    ) -> Result<CommandOutput>;

    /// Round trip to the peer; false once the connection is gone. Never reconnects
    fn is_live(&mut self) -> bool;

    /// Send a no-op keep-alive message
    fn keepalive(&mut self) -> Result<()>;

    /// Copy `data` to `remote_dir/remote_name`
    fn push(&mut self, data: &[u8], remote_dir: &str, remote_name: &str) -> Result<()>;

    /// Copy a remote file into memory
    fn pull(&mut self, remote_path: &str) -> Result<Vec<u8>>;

    /// Tear down the connection; later calls fail
    fn close(&mut self);
}

/// Opens sessions to targets
pub trait Connector: Send + Sync {
    type Session: RemoteSession + 'static;

    fn open(&self, target: &SshTarget) -> Result<Self::Session>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_builder() {
        let target = SshTarget::with_key("10.1.2.3", "root", "/keys/alice")
            .with_port(2222)
            .with_timeout(5)
            .with_command_timeout(600)
            .with_keepalive(45);

        assert_eq!(target.endpoint(), "10.1.2.3:2222");
        assert_eq!(target.username, "root");
        assert_eq!(target.timeout_secs, 5);
        assert_eq!(target.command_timeout_secs, 600);
        assert_eq!(target.keepalive_secs, 45);
        assert!(matches!(target.auth, SshAuth::KeyFile { .. }));
    }

    #[test]
    fn test_target_defaults() {
        let target = SshTarget::new("broker", "ops", SshAuth::Agent);
        assert_eq!(target.port, 22);
        assert_eq!(target.timeout_secs, 30);
        assert_eq!(target.command_timeout_secs, 0);
        assert_eq!(target.keepalive_secs, 0);
    }
}
