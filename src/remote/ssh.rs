//! SSH command channel over `ssh2`

use super::{CommandOutput, Connector, OutputObserver, RemoteSession, SshAuth, SshTarget};
use crate::error::{RemoteError, Result};
use secrecy::ExposeSecret;
use ssh2::{ExtendedData, Session};
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, trace};

const READ_CHUNK: usize = 16 * 1024;

/// An authenticated SSH connection to one host
///
/// Holds at most one live `ssh2::Session`. `connect` tears down any
/// existing connection before opening a new one, and dropping the value
/// disconnects.
pub struct SshSession {
    target: SshTarget,
    handle: Option<Session>,
}

impl SshSession {
    /// Create an unconnected session for `target`
    pub fn new(target: SshTarget) -> Self {
        Self {
            target,
            handle: None,
        }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    /// Open and authenticate the connection
    ///
    /// Fails with `Connect` when the host cannot be reached or the handshake
    /// fails, and with `Auth` when credentials are rejected. Neither is
    /// retried here.
    pub fn connect(&mut self) -> Result<()> {
        self.disconnect();

        let endpoint = self.target.endpoint();
        let tcp = open_tcp(&endpoint, Duration::from_secs(self.target.timeout_secs))?;

        let host = &self.target.host;
        let mut session = Session::new().map_err(|e| {
            RemoteError::connect(host, format!("Failed to create SSH session: {}", e))
        })?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(self.target.timeout_secs));
        session
            .handshake()
            .map_err(|e| RemoteError::connect(host, format!("Handshake failed: {}", e)))?;

        authenticate(&session, &self.target)?;

        if !session.authenticated() {
            return Err(RemoteError::auth(host, "Authentication failed"));
        }

        // Without this libssh2 treats keepalive_send as a no-op.
        if self.target.keepalive_secs > 0 {
            session.set_keepalive(true, self.target.keepalive_secs);
        }
        session.set_timeout(millis(self.target.command_timeout_secs));
        debug!(
            host = %self.target.host,
            user = %self.target.username,
            keepalive_secs = self.target.keepalive_secs,
            "ssh session established"
        );
        self.handle = Some(session);
        Ok(())
    }

    /// Close the connection if one is open
    pub fn disconnect(&mut self) {
        if let Some(session) = self.handle.take() {
            let _ = session.disconnect(None, "Closing connection", None);
            debug!(host = %self.target.host, "ssh session closed");
        }
    }

    pub(super) fn handle(&self) -> Result<&Session> {
        self.handle.as_ref().ok_or_else(|| {
            RemoteError::InvalidState(format!("not connected to {}", self.target.host))
        })
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn channel_error(e: impl std::fmt::Display) -> RemoteError {
    RemoteError::Channel(e.to_string())
}

/// Open and close a channel; any failure means the peer is gone
///
/// Bounded by `timeout` so a silently dropped connection cannot hang the
/// caller. The session's previous timeout is restored afterwards.
fn round_trip(session: &Session, timeout: Duration) -> bool {
    let previous = session.timeout();
    session.set_timeout(millis(timeout.as_secs().max(1)));
    let result = session.channel_session().and_then(|mut channel| channel.close());
    session.set_timeout(previous);
    match result {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "liveness round trip failed");
            false
        }
    }
}

fn millis(secs: u64) -> u32 {
    u32::try_from(secs.saturating_mul(1000)).unwrap_or(u32::MAX)
}

fn open_tcp(endpoint: &str, timeout: Duration) -> Result<TcpStream> {
    let host = endpoint.rsplit_once(':').map(|(h, _)| h).unwrap_or(endpoint);
    let addrs = endpoint
        .to_socket_addrs()
        .map_err(|e| RemoteError::connect(host, format!("Cannot resolve {}: {}", endpoint, e)))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(tcp) => {
                tcp.set_read_timeout(Some(timeout)).ok();
                tcp.set_write_timeout(Some(timeout)).ok();
                return Ok(tcp);
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(RemoteError::connect(
        host,
        match last_error {
            Some(e) => e.to_string(),
            None => format!("No addresses for {}", endpoint),
        },
    ))
}

fn authenticate(session: &Session, target: &SshTarget) -> Result<()> {
    let host = &target.host;
    let user = &target.username;
    let failed = |what: &str, e: ssh2::Error| RemoteError::auth(host, format!("{}: {}", what, e));

    match &target.auth {
        SshAuth::KeyFile {
            key_path,
            passphrase,
        } => {
            let pass: Option<&str> = passphrase.as_ref().map(|p| p.expose_secret());
            session
                .userauth_pubkey_file(user, None, key_path, pass)
                .map_err(|e| failed("Key file authentication failed", e))?;
        }
        SshAuth::Password(password) => {
            session
                .userauth_password(user, password.expose_secret())
                .map_err(|e| failed("Password authentication failed", e))?;
        }
        SshAuth::Agent => {
            let mut agent = session
                .agent()
                .map_err(|e| failed("Failed to connect to SSH agent", e))?;
            agent
                .connect()
                .map_err(|e| failed("Failed to connect to SSH agent", e))?;
            agent
                .list_identities()
                .map_err(|e| failed("Failed to list SSH agent identities", e))?;
            let identities = agent
                .identities()
                .map_err(|e| failed("Failed to get SSH agent identities", e))?;

            if !identities
                .iter()
                .any(|identity| agent.userauth(user, identity).is_ok())
            {
                return Err(RemoteError::auth(host, "No valid identity found in SSH agent"));
            }
        }
    }

    Ok(())
}

impl RemoteSession for SshSession {
    fn host(&self) -> &str {
        &self.target.host
    }

    fn execute(
        &mut self,
        command: &str,
        mut observer: Option<OutputObserver<'_>>,
    ) -> Result<CommandOutput> {
        let session = self.handle()?;

        let mut channel = session.channel_session().map_err(channel_error)?;
        channel
            .handle_extended_data(ExtendedData::Merge)
            .map_err(channel_error)?;
        channel.exec(command).map_err(channel_error)?;
        trace!(host = %self.target.host, command, "command started");

        // Blocking reads bounded by the session timeout; chunks are appended
        // in arrival order and EOF marks completion.
        let mut raw = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = channel.read(&mut chunk).map_err(channel_error)?;
            if n == 0 {
                break;
            }
            if let Some(observer) = observer.as_mut() {
                observer(&String::from_utf8_lossy(&chunk[..n]));
            }
            raw.extend_from_slice(&chunk[..n]);
        }

        channel.wait_close().map_err(channel_error)?;
        let exit_status = channel.exit_status().ok();
        debug!(host = %self.target.host, ?exit_status, bytes = raw.len(), "command finished");

        Ok(CommandOutput {
            text: String::from_utf8_lossy(&raw).into_owned(),
            exit_status,
        })
    }

    fn is_live(&mut self) -> bool {
        let timeout = Duration::from_secs(self.target.timeout_secs);
        match &self.handle {
            Some(session) => session.authenticated() && round_trip(session, timeout),
            None => false,
        }
    }

    fn keepalive(&mut self) -> Result<()> {
        let session = self.handle()?;
        if self.target.keepalive_secs == 0 {
            // Keep-alives were not configured on this connection; the
            // round trip is the only way to put traffic on the wire.
            return if round_trip(session, Duration::from_secs(self.target.timeout_secs)) {
                Ok(())
            } else {
                Err(RemoteError::Channel("Keep-alive failed: peer unreachable".to_string()))
            };
        }
        let next = session
            .keepalive_send()
            .map_err(|e| RemoteError::Channel(format!("Keep-alive failed: {}", e)))?;
        trace!(host = %self.target.host, next_in_secs = next, "keep-alive sent");
        Ok(())
    }

    fn push(&mut self, data: &[u8], remote_dir: &str, remote_name: &str) -> Result<()> {
        self.scp_push(data, remote_dir, remote_name)
    }

    fn pull(&mut self, remote_path: &str) -> Result<Vec<u8>> {
        self.scp_pull(remote_path)
    }

    fn close(&mut self) {
        self.disconnect();
    }
}

/// Opens `SshSession`s
#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

impl Connector for SshConnector {
    type Session = SshSession;

    fn open(&self, target: &SshTarget) -> Result<SshSession> {
        let mut session = SshSession::new(target.clone());
        session.connect()?;
        Ok(session)
    }
}
