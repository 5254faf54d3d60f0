//! Broker login, instance discovery and creation, instance login,
//! keep-alive, and teardown

pub mod inventory;
mod keepalive;
mod manager;

pub use inventory::{InstanceStatus, ListedInstance, INVENTORY_FORMAT};
pub use keepalive::{KeepAlive, SharedSession};
pub use manager::{Instance, LifecycleManager, LifecycleState};
