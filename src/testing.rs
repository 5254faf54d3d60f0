//! Scripted in-memory sessions and stores for tests
//!
//! `ScriptedConnector` stands in for SSH: each host gets canned command
//! responses, an in-memory filesystem, and switches for refusing or
//! rejecting logins and for failing liveness checks. Every call is recorded
//! in one journal shared by all sessions so tests can assert ordering
//! across hosts.
//!
//! ## Example
//!
//! ```
//! use skyrun::remote::{Connector, RemoteSession, SshTarget};
//! use skyrun::testing::ScriptedConnector;
//!
//! let connector = ScriptedConnector::new();
//! connector.respond("broker", "provision list", "NAME IP STATE\n");
//!
//! let mut session = connector.open(&SshTarget::with_key("broker", "ops", "/k")).unwrap();
//! let output = session.execute("provision list", None).unwrap();
//! assert!(output.text.starts_with("NAME"));
//! assert_eq!(connector.script().commands_on("broker"), vec!["provision list"]);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use skyrun_core_wire::{Series, SeriesBatch, StructureEntry};

use crate::error::{RemoteError, Result};
use crate::remote::{CommandOutput, Connector, OutputObserver, RemoteSession, SshTarget};
use crate::store::ParameterStore;

/// One recorded interaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open { host: String },
    Execute { host: String, command: String },
    Push { host: String, path: String },
    Pull { host: String, path: String },
    Keepalive { host: String },
    Close { host: String },
}

#[derive(Debug)]
struct HostScript {
    responses: Vec<(String, String)>,
    failures: Vec<(String, String)>,
    generated: Vec<(String, Vec<u8>)>,
    files: HashMap<String, Vec<u8>>,
    auth_failures: u32,
    refuse: bool,
    live: bool,
}

impl Default for HostScript {
    fn default() -> Self {
        Self {
            responses: Vec::new(),
            failures: Vec::new(),
            generated: Vec::new(),
            files: HashMap::new(),
            auth_failures: 0,
            refuse: false,
            live: true,
        }
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    hosts: HashMap<String, HostScript>,
    calls: Vec<Call>,
}

/// Shared script and journal behind every scripted session
#[derive(Debug, Clone, Default)]
pub struct Script {
    state: Arc<Mutex<ScriptState>>,
}

impl Script {
    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        // A panicking test thread must not hide the journal from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_host<T>(&self, host: &str, f: impl FnOnce(&mut HostScript) -> T) -> T {
        let mut state = self.lock();
        f(state.hosts.entry(host.to_string()).or_default())
    }

    fn record(&self, call: Call) {
        self.lock().calls.push(call);
    }

    /// Reply with `output` to commands on `host` containing `pattern`
    ///
    /// Later registrations take precedence over earlier ones.
    pub fn respond(&self, host: &str, pattern: &str, output: &str) {
        self.with_host(host, |h| h.responses.push((pattern.to_string(), output.to_string())));
    }

    /// Fail commands on `host` containing `pattern` with a channel error
    pub fn fail_command(&self, host: &str, pattern: &str, message: &str) {
        self.with_host(host, |h| h.failures.push((pattern.to_string(), message.to_string())));
    }

    /// Make helper commands containing `pattern` leave `data` in their out file
    ///
    /// The out file is the fourth token of the command line.
    pub fn file_from_command(&self, host: &str, pattern: &str, data: Vec<u8>) {
        self.with_host(host, |h| h.generated.push((pattern.to_string(), data)));
    }

    pub fn add_file(&self, host: &str, path: &str, data: &[u8]) {
        self.with_host(host, |h| {
            h.files.insert(path.to_string(), data.to_vec());
        });
    }

    pub fn files_on(&self, host: &str) -> HashMap<String, Vec<u8>> {
        self.with_host(host, |h| h.files.clone())
    }

    /// Reject the next `count` logins to `host` with an auth error
    pub fn reject_logins(&self, host: &str, count: u32) {
        self.with_host(host, |h| h.auth_failures = count);
    }

    /// Refuse every connection to `host`
    pub fn refuse(&self, host: &str) {
        self.with_host(host, |h| h.refuse = true);
    }

    /// Control what liveness checks and keep-alives on `host` report
    pub fn set_live(&self, host: &str, live: bool) {
        self.with_host(host, |h| h.live = live);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Execute { host: h, command } if h == host => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn opens_of(&self, host: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Open { host: h } if h == host))
            .count()
    }

    pub fn pulls(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Pull { .. }))
            .count()
    }

    /// Index of the first recorded call matching `pred`
    pub fn position(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.lock().calls.iter().position(pred)
    }
}

fn unquote(token: &str) -> String {
    token.trim_matches('\'').to_string()
}

/// In-memory session to one scripted host
#[derive(Debug)]
pub struct ScriptedSession {
    host: String,
    script: Script,
    closed: bool,
}

impl ScriptedSession {
    /// A standalone session with its own script
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            script: Script::default(),
            closed: false,
        }
    }

    pub fn script(&self) -> Script {
        self.script.clone()
    }

    pub fn respond(&self, pattern: &str, output: &str) {
        self.script.respond(&self.host, pattern, output);
    }

    pub fn fail_command(&self, pattern: &str, message: &str) {
        self.script.fail_command(&self.host, pattern, message);
    }

    pub fn file_from_command(&self, pattern: &str, data: Vec<u8>) {
        self.script.file_from_command(&self.host, pattern, data);
    }

    pub fn set_live(&self, live: bool) {
        self.script.set_live(&self.host, live);
    }

    pub fn commands(&self) -> Vec<String> {
        self.script.commands_on(&self.host)
    }

    pub fn files(&self) -> HashMap<String, Vec<u8>> {
        self.script.files_on(&self.host)
    }

    pub fn pulls(&self) -> usize {
        self.script.pulls()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(RemoteError::Channel(format!("session to {} is closed", self.host)))
        } else {
            Ok(())
        }
    }
}

impl RemoteSession for ScriptedSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn execute(
        &mut self,
        command: &str,
        observer: Option<OutputObserver<'_>>,
    ) -> Result<CommandOutput> {
        self.ensure_open()?;
        self.script.record(Call::Execute {
            host: self.host.clone(),
            command: command.to_string(),
        });

        let hit = |p: &String| command.contains(p.as_str());
        let text = self.script.with_host(&self.host, |h| {
            if let Some((_, message)) = h.failures.iter().rev().find(|(p, _)| hit(p)) {
                return Err(RemoteError::Channel(message.clone()));
            }

            if let Some(paths) = command.strip_prefix("rm -f ") {
                for path in paths.split_whitespace() {
                    h.files.remove(&unquote(path));
                }
            }

            if let Some((_, data)) = h.generated.iter().rev().find(|(p, _)| hit(p)) {
                if let Some(out_file) = command.split_whitespace().nth(3) {
                    h.files.insert(unquote(out_file), data.clone());
                }
            }

            Ok(h
                .responses
                .iter()
                .rev()
                .find(|(p, _)| hit(p))
                .map(|(_, output)| output.clone())
                .unwrap_or_default())
        })?;

        if let Some(observer) = observer {
            observer(&text);
        }
        Ok(CommandOutput {
            text,
            exit_status: Some(0),
        })
    }

    fn is_live(&mut self) -> bool {
        !self.closed && self.script.with_host(&self.host, |h| h.live)
    }

    fn keepalive(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.script.record(Call::Keepalive {
            host: self.host.clone(),
        });
        if self.script.with_host(&self.host, |h| h.live) {
            Ok(())
        } else {
            Err(RemoteError::Channel("keep-alive not acknowledged".to_string()))
        }
    }

    fn push(&mut self, data: &[u8], remote_dir: &str, remote_name: &str) -> Result<()> {
        self.ensure_open()?;
        let path = crate::remote::join_remote(remote_dir, remote_name);
        self.script.record(Call::Push {
            host: self.host.clone(),
            path: path.clone(),
        });
        self.script.add_file(&self.host, &path, data);
        Ok(())
    }

    fn pull(&mut self, remote_path: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.script.record(Call::Pull {
            host: self.host.clone(),
            path: remote_path.to_string(),
        });
        self.script
            .with_host(&self.host, |h| h.files.get(remote_path).cloned())
            .ok_or_else(|| RemoteError::NotFound {
                path: remote_path.to_string(),
            })
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.script.record(Call::Close {
                host: self.host.clone(),
            });
        }
    }
}

/// Opens `ScriptedSession`s that share one script
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    script: Script,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self) -> Script {
        self.script.clone()
    }

    pub fn respond(&self, host: &str, pattern: &str, output: &str) {
        self.script.respond(host, pattern, output);
    }

    pub fn add_file(&self, host: &str, path: &str, data: &[u8]) {
        self.script.add_file(host, path, data);
    }
}

impl Connector for ScriptedConnector {
    type Session = ScriptedSession;

    fn open(&self, target: &SshTarget) -> Result<ScriptedSession> {
        let host = target.host.clone();
        self.script.record(Call::Open { host: host.clone() });

        self.script.with_host(&host, |h| {
            if h.refuse {
                return Err(RemoteError::connect(&host, "Connection refused"));
            }
            if h.auth_failures > 0 {
                h.auth_failures -= 1;
                return Err(RemoteError::auth(&host, "Permission denied (publickey)"));
            }
            h.live = true;
            Ok(())
        })?;

        Ok(ScriptedSession {
            host,
            script: self.script.clone(),
            closed: false,
        })
    }
}

/// `ParameterStore` held entirely in memory
///
/// Stands in for the local relational store when exercising callers that
/// only depend on the trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub start_date: i64,
    pub structures: HashMap<String, Vec<StructureEntry>>,
    pub values: HashMap<(String, u32), Series>,
    pub runs: Vec<(String, String, String)>,
    pub parameter_stores: Vec<(String, String)>,
    pub exported_parameters: Vec<String>,
}

impl ParameterStore for MemoryStore {
    fn export_structure(&mut self, table: &str) -> Result<Vec<StructureEntry>> {
        self.structures
            .get(table)
            .cloned()
            .ok_or_else(|| RemoteError::RemoteOperation {
                message: format!("no such table: {}", table),
            })
    }

    fn export_values(&mut self, table: &str, ids: &[u32]) -> Result<SeriesBatch> {
        let series = ids
            .iter()
            .map(|id| {
                self.values
                    .get(&(table.to_string(), *id))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect();
        Ok(SeriesBatch::new(self.start_date, series))
    }

    fn create_parameter_store(&mut self, exe_name: &str, input_file: &str) -> Result<()> {
        self.parameter_stores
            .push((exe_name.to_string(), input_file.to_string()));
        Ok(())
    }

    fn export_parameters(&mut self, exe_name: &str) -> Result<()> {
        self.exported_parameters.push(exe_name.to_string());
        Ok(())
    }

    fn run_model(&mut self, exe_name: &str, input_file: &str, db_name: &str) -> Result<()> {
        self.runs.push((
            exe_name.to_string(),
            input_file.to_string(),
            db_name.to_string(),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str) -> SshTarget {
        SshTarget::with_key(host, "ops", "/keys/ops")
    }

    #[test]
    fn test_latest_response_wins() {
        let connector = ScriptedConnector::new();
        connector.respond("h", "status", "old");
        connector.respond("h", "status", "new");
        let mut session = connector.open(&target("h")).unwrap();
        assert_eq!(session.execute("status", None).unwrap().text, "new");
    }

    #[test]
    fn test_rejected_logins_count_down() {
        let connector = ScriptedConnector::new();
        connector.script().reject_logins("h", 2);
        assert!(matches!(connector.open(&target("h")), Err(RemoteError::Auth { .. })));
        assert!(matches!(connector.open(&target("h")), Err(RemoteError::Auth { .. })));
        assert!(connector.open(&target("h")).is_ok());
        assert_eq!(connector.script().opens_of("h"), 3);
    }

    #[test]
    fn test_closed_session_fails() {
        let connector = ScriptedConnector::new();
        let mut session = connector.open(&target("h")).unwrap();
        session.close();
        assert!(!session.is_live());
        assert!(session.execute("true", None).is_err());
    }

    #[test]
    fn test_push_then_pull() {
        let mut session = ScriptedSession::new("h");
        session.push(b"abc", "/tmp/", "x.bin").unwrap();
        assert_eq!(session.pull("/tmp/x.bin").unwrap(), b"abc");
        assert!(session.pull("/tmp/missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_observer_sees_output() {
        let mut session = ScriptedSession::new("h");
        session.respond("echo", "hello\n");
        let mut seen = String::new();
        let mut observer = |chunk: &str| seen.push_str(chunk);
        session.execute("echo hello", Some(&mut observer)).unwrap();
        assert_eq!(seen, "hello\n");
    }
}
