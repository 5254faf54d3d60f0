/*!
 * Error types for skyrun
 */

use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_DISCONNECTED: i32 = 3;

#[derive(Debug)]
pub enum RemoteError {
    /// Transport-level failure to reach a host
    Connect { host: String, message: String },

    /// Credentials rejected by the host
    Auth { host: String, message: String },

    /// Secure-copy negotiation, size, or short-read failure
    Transfer { path: String, message: String },

    /// Remote file does not exist
    NotFound { path: String },

    /// A channel read failed while a command was running
    Channel(String),

    /// Payload or tool output violated its expected structure
    Protocol(String),

    /// Helper program reported its own `ERROR:` line
    RemoteOperation { message: String },

    /// Liveness check failed while a session was expected
    InvoluntaryDisconnect { host: String },

    /// Operation not valid in the manager's current state
    InvalidState(String),

    /// Configuration error
    Config(String),

    /// Local I/O error
    Io(io::Error),
}

impl RemoteError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            RemoteError::Config(_) | RemoteError::Auth { .. } => EXIT_FATAL,
            RemoteError::InvoluntaryDisconnect { .. } => EXIT_DISCONNECTED,
            _ => EXIT_PARTIAL,
        }
    }

    /// Check if this error is fatal for the whole workflow
    pub fn is_fatal(&self) -> bool {
        match self {
            RemoteError::Config(_) => true,
            RemoteError::Auth { .. } => true,
            RemoteError::InvoluntaryDisconnect { .. } => true,

            RemoteError::Connect { .. } => false,
            RemoteError::Transfer { .. } => false,
            RemoteError::NotFound { .. } => false,
            RemoteError::Channel(_) => false,
            RemoteError::Protocol(_) => false,
            RemoteError::RemoteOperation { .. } => false,
            RemoteError::InvalidState(_) => false,
            RemoteError::Io(_) => false,
        }
    }

    /// Check if a caller-driven retry may succeed
    ///
    /// Nothing in this crate retries automatically except instance login
    /// and the explicit destroy retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            RemoteError::Connect { .. } | RemoteError::Channel(_) => true,
            RemoteError::Transfer { .. } => true,
            RemoteError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound { .. })
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, RemoteError::InvoluntaryDisconnect { .. })
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            RemoteError::Connect { .. } | RemoteError::Channel(_) => ErrorCategory::Network,
            RemoteError::Auth { .. } => ErrorCategory::Security,
            RemoteError::Transfer { .. } | RemoteError::NotFound { .. } => ErrorCategory::Transfer,
            RemoteError::Protocol(_) => ErrorCategory::Protocol,
            RemoteError::RemoteOperation { .. } => ErrorCategory::Remote,
            RemoteError::InvoluntaryDisconnect { .. } => ErrorCategory::Liveness,
            RemoteError::InvalidState(_) => ErrorCategory::Lifecycle,
            RemoteError::Config(_) => ErrorCategory::Configuration,
            RemoteError::Io(_) => ErrorCategory::IoError,
        }
    }

    pub fn connect(host: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteError::Connect {
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn auth(host: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteError::Auth {
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn transfer(path: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteError::Transfer {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Host unreachable or channel failure
    Network,
    /// Credential rejection
    Security,
    /// File copy failures
    Transfer,
    /// Malformed payloads or tool output
    Protocol,
    /// Helper program failures
    Remote,
    /// Lost sessions
    Liveness,
    /// State machine misuse
    Lifecycle,
    /// Configuration errors
    Configuration,
    /// Local I/O errors
    IoError,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Security => write!(f, "security"),
            ErrorCategory::Transfer => write!(f, "transfer"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Remote => write!(f, "remote"),
            ErrorCategory::Liveness => write!(f, "liveness"),
            ErrorCategory::Lifecycle => write!(f, "lifecycle"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::IoError => write!(f, "io"),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Connect { host, message } => {
                write!(f, "Connection to {} failed: {}", host, message)
            }
            RemoteError::Auth { host, message } => {
                write!(f, "Authentication to {} failed: {}", host, message)
            }
            RemoteError::Transfer { path, message } => {
                write!(f, "Transfer of {} failed: {}", path, message)
            }
            RemoteError::NotFound { path } => {
                write!(f, "Remote file not found: {}", path)
            }
            RemoteError::Channel(msg) => {
                write!(f, "Channel error: {}", msg)
            }
            RemoteError::Protocol(msg) => {
                write!(f, "Protocol error: {}", msg)
            }
            RemoteError::RemoteOperation { message } => {
                write!(f, "Remote operation failed: {}", message)
            }
            RemoteError::InvoluntaryDisconnect { host } => {
                write!(f, "Lost connection to {}", host)
            }
            RemoteError::InvalidState(msg) => {
                write!(f, "Invalid state: {}", msg)
            }
            RemoteError::Config(msg) => {
                write!(f, "Configuration error: {}", msg)
            }
            RemoteError::Io(err) => {
                write!(f, "I/O error: {}", err)
            }
        }
    }
}

impl std::error::Error for RemoteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RemoteError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for RemoteError {
    fn from(err: io::Error) -> Self {
        RemoteError::Io(err)
    }
}

impl From<skyrun_core_wire::Error> for RemoteError {
    fn from(err: skyrun_core_wire::Error) -> Self {
        RemoteError::Protocol(err.to_string())
    }
}

impl From<toml::de::Error> for RemoteError {
    fn from(err: toml::de::Error) -> Self {
        RemoteError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(RemoteError::auth("broker", "denied").is_fatal());
        assert!(RemoteError::Config("missing host".to_string()).is_fatal());
        assert!(RemoteError::InvoluntaryDisconnect {
            host: "10.0.0.1".to_string()
        }
        .is_fatal());

        assert!(!RemoteError::connect("broker", "refused").is_fatal());
        assert!(!RemoteError::Protocol("bad".to_string()).is_fatal());
    }

    #[test]
    fn test_retriable_errors() {
        assert!(RemoteError::connect("broker", "refused").is_retriable());
        assert!(RemoteError::transfer("/tmp/x", "short read").is_retriable());
        assert!(!RemoteError::auth("broker", "denied").is_retriable());
        assert!(!RemoteError::RemoteOperation {
            message: "disk full".to_string()
        }
        .is_retriable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RemoteError::auth("h", "m").exit_code(), EXIT_FATAL);
        assert_eq!(
            RemoteError::InvoluntaryDisconnect {
                host: "h".to_string()
            }
            .exit_code(),
            EXIT_DISCONNECTED
        );
        assert_eq!(RemoteError::Protocol("x".to_string()).exit_code(), EXIT_PARTIAL);
    }

    #[test]
    fn test_wire_error_becomes_protocol_error() {
        let wire = skyrun_core_wire::Error::CountMismatch {
            expected: 2,
            found: 1,
        };
        let err: RemoteError = wire.into();
        assert_eq!(err.category(), ErrorCategory::Protocol);
        assert!(err.to_string().starts_with("Protocol error: Series count mismatch"));
    }

    #[test]
    fn test_display() {
        let err = RemoteError::RemoteOperation {
            message: "disk full".to_string(),
        };
        assert_eq!(err.to_string(), "Remote operation failed: disk full");
        assert_eq!(ErrorCategory::Liveness.to_string(), "liveness");
    }
}
