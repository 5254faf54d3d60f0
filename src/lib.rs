/*!
 * Skyrun - remote model execution on ephemeral instances
 *
 * Provisions a compute instance through a broker host, keeps an SSH
 * session to it, and exchanges structure trees and time series with a
 * helper program on the instance:
 * - Broker login, instance discovery and creation, bounded login retry
 * - Keep-alive and involuntary-disconnect detection
 * - SCP push/pull with exact-length reads
 * - Binary structure and series formats (`skyrun-core-wire`)
 * - Best-effort and retrying teardown with a reconciliation sweep
 *
 * Author: Shane Wall <shaneawall@gmail.com>
 */

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod logging;
pub mod remote;
pub mod store;
pub mod testing;

// Re-export commonly used types
pub use config::SkyrunConfig;
pub use dispatcher::{classify_status, Dispatcher, HelperCommand};
pub use error::{RemoteError, Result};
pub use events::{EventSink, StatusEvent};
pub use lifecycle::{Instance, InstanceStatus, LifecycleManager, LifecycleState};
pub use remote::{Connector, RemoteSession, SshConnector, SshSession, SshTarget};
pub use store::{ParameterStore, RemoteStore};

pub use skyrun_core_wire as wire;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
