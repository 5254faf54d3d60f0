//! File copy sub-channel (SCP) on an SSH session
//!
//! Transfers share the session's authentication but not its command
//! request/response cycle. Both directions buffer the whole file in memory.

use super::SshSession;
use crate::error::{RemoteError, Result};
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::debug;

const PUSH_MODE: i32 = 0o644;

impl SshSession {
    /// Copy `data` to `remote_dir/remote_name`
    ///
    /// The exact length is declared up front. Any failure during
    /// negotiation, the write, or the closing handshake is reported as a
    /// `Transfer` error; success is only returned once the remote side has
    /// acknowledged the end of the file.
    pub fn scp_push(&self, data: &[u8], remote_dir: &str, remote_name: &str) -> Result<()> {
        let remote_path = join_remote(remote_dir, remote_name);
        let fail = |stage: &str, e: String| {
            RemoteError::transfer(&remote_path, format!("{}: {}", stage, e))
        };

        let mut channel = self
            .handle()?
            .scp_send(Path::new(&remote_path), PUSH_MODE, data.len() as u64, None)
            .map_err(|e| fail("negotiation failed", e.to_string()))?;

        channel
            .write_all(data)
            .map_err(|e| fail("write failed", e.to_string()))?;
        channel.send_eof().map_err(|e| fail("send EOF failed", e.to_string()))?;
        channel.wait_eof().map_err(|e| fail("remote EOF not received", e.to_string()))?;
        channel.close().map_err(|e| fail("close failed", e.to_string()))?;
        channel.wait_close().map_err(|e| fail("close not acknowledged", e.to_string()))?;

        debug!(path = %remote_path, bytes = data.len(), "pushed file");
        Ok(())
    }

    /// Copy a remote file into memory
    ///
    /// The remote side must announce the file before any data flows; a
    /// missing file is `NotFound`, any other refusal is `Transfer`.
    pub fn scp_pull(&self, remote_path: &str) -> Result<Vec<u8>> {
        let (mut channel, stat) = self
            .handle()?
            .scp_recv(Path::new(remote_path))
            .map_err(|e| {
                if is_missing_file(e.message()) {
                    RemoteError::NotFound {
                        path: remote_path.to_string(),
                    }
                } else {
                    RemoteError::transfer(remote_path, format!("negotiation failed: {}", e))
                }
            })?;

        let data = read_declared(&mut channel, stat.size(), remote_path)?;

        // The payload is complete; trailing handshake errors do not taint it.
        channel.send_eof().ok();
        channel.wait_eof().ok();
        channel.close().ok();
        channel.wait_close().ok();

        debug!(path = %remote_path, bytes = data.len(), "pulled file");
        Ok(data)
    }
}

/// Read exactly `declared` bytes from `reader`
///
/// The buffer is sized to the declared length before reading. A zero-byte
/// read or a read error before it is full fails the transfer rather than
/// returning a short buffer.
pub fn read_declared<R: Read>(reader: &mut R, declared: u64, path: &str) -> Result<Vec<u8>> {
    let len = usize::try_from(declared).map_err(|_| {
        RemoteError::transfer(path, format!("declared size {} does not fit in memory", declared))
    })?;

    let mut buffer = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => {
                return Err(RemoteError::transfer(
                    path,
                    format!("short read: {} of {} bytes", filled, len),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(RemoteError::transfer(
                    path,
                    format!("read failed after {} of {} bytes: {}", filled, len, e),
                ))
            }
        }
    }

    Ok(buffer)
}

fn is_missing_file(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("no such file") || lower.contains("not found")
}

/// Join a remote directory and file name with exactly one `/`
pub(crate) fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}
