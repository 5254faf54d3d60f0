//! Parsing of the provisioning tool's tabular output
//!
//! The tool prints human-oriented tables, so parsing is positional rather
//! than labelled. The assumptions are pinned in [`INVENTORY_FORMAT`] and
//! every deviation from them is a `Protocol` error rather than a guess.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{RemoteError, Result};

/// Output layout this parser was written against
///
/// Listing: a table whose cells are separated by whitespace and/or `|`/`│`
/// borders; the row for an instance contains its exact name, followed later
/// by its public IPv4 address and a state word.
///
/// Creation: a table that prints the internal address before the external
/// one; the second IPv4 token in the whole output is the external address.
pub const INVENTORY_FORMAT: &str = "provision-table/v1";

/// State of an instance as reported by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Running,
    Pending,
    Stopped,
    Terminated,
    /// Listed but no recognizable state word followed the name
    Unknown,
}

impl InstanceStatus {
    fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "running" => Some(InstanceStatus::Running),
            "pending" | "starting" | "creating" => Some(InstanceStatus::Pending),
            "stopped" | "stopping" => Some(InstanceStatus::Stopped),
            "terminated" | "destroyed" | "deleted" => Some(InstanceStatus::Terminated),
            _ => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, InstanceStatus::Terminated)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Pending => "pending",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Terminated => "terminated",
            InstanceStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One instance found in a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedInstance {
    pub name: String,
    pub ip: Ipv4Addr,
    pub status: InstanceStatus,
}

fn ip_shape() -> &'static Regex {
    static IP_SHAPE: OnceLock<Regex> = OnceLock::new();
    IP_SHAPE.get_or_init(|| {
        Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}$").expect("static regex is valid")
    })
}

/// Split table text into cell tokens
pub fn tokenize(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| c.is_whitespace() || c == '|' || c == '│' || c == ',')
        .filter(|t| !t.is_empty())
}

/// Parse a token that is shaped like an IPv4 address
pub fn ip_token(token: &str) -> Option<Ipv4Addr> {
    if ip_shape().is_match(token) {
        Ipv4Addr::from_str(token).ok()
    } else {
        None
    }
}

/// Look up `name` in a listing
///
/// The first IP-shaped token after the name is taken as its address, and
/// the first state word after the name as its status. A name with no
/// address after it means the format has drifted.
pub fn find_instance(listing: &str, name: &str) -> Result<Option<ListedInstance>> {
    let tokens: Vec<&str> = tokenize(listing).collect();
    let Some(start) = tokens.iter().position(|t| *t == name) else {
        return Ok(None);
    };
    let rest = &tokens[start + 1..];

    let ip = rest.iter().find_map(|t| ip_token(t)).ok_or_else(|| {
        RemoteError::Protocol(format!(
            "instance '{}' listed without an IPv4 address (expected {})",
            name, INVENTORY_FORMAT
        ))
    })?;

    let status = rest
        .iter()
        .find_map(|t| InstanceStatus::from_token(t))
        .unwrap_or(InstanceStatus::Unknown);

    Ok(Some(ListedInstance {
        name: name.to_string(),
        ip,
        status,
    }))
}

/// Extract the external address from creation output
///
/// The tool prints the internal address first and the external one second,
/// so the second IP-shaped token in the whole output is taken.
pub fn created_address(output: &str) -> Result<Ipv4Addr> {
    let ips: Vec<Ipv4Addr> = tokenize(output).filter_map(ip_token).collect();
    ips.get(1).copied().ok_or_else(|| {
        RemoteError::Protocol(format!(
            "creation output has {} IPv4 address(es), expected at least 2 ({})",
            ips.len(),
            INVENTORY_FORMAT
        ))
    })
}
