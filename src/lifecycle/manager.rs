/*!
 * Instance lifecycle state machine
 *
 * ```text
 *  NoSession ──login──▶ HubAuthenticated ──list/create──▶ InstanceDiscovering
 *      ▲                      ▲   │                             │
 *      │ liveness lost        │   └──────── destroy ────▶ TornDown
 *      │                      │                                 │
 *      └── InstanceAuthenticated ◀──── keys pulled, login ──────┘
 * ```
 *
 * The manager owns the only session. Broker and instance sessions are never
 * open at the same time; switching roles closes the current one first.
 */

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::inventory::{created_address, find_instance, InstanceStatus, ListedInstance};
use super::keepalive::{KeepAlive, SharedSession};
use crate::config::{render_command, render_template, SkyrunConfig};
use crate::error::{RemoteError, Result};
use crate::events::EventSink;
use crate::remote::{CommandOutput, Connector, RemoteSession, SshAuth, SshTarget};

/// Where the manager is in the login/provision cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NoSession,
    HubAuthenticated,
    InstanceDiscovering,
    InstanceAuthenticated,
    TornDown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::NoSession => "no session",
            LifecycleState::HubAuthenticated => "logged into broker",
            LifecycleState::InstanceDiscovering => "discovering instance",
            LifecycleState::InstanceAuthenticated => "logged into instance",
            LifecycleState::TornDown => "torn down",
        };
        f.write_str(s)
    }
}

/// The ephemeral compute resource this manager is responsible for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub name: String,
    /// Unknown until listed or created
    pub ip: Option<Ipv4Addr>,
    pub owner: String,
    pub exists: bool,
    pub authenticated: bool,
    pub status: Option<InstanceStatus>,
}

impl Instance {
    fn new(name: String, owner: &str) -> Self {
        Self {
            name,
            ip: None,
            owner: owner.to_string(),
            exists: false,
            authenticated: false,
            status: None,
        }
    }
}

pub struct LifecycleManager<C: Connector> {
    connector: C,
    config: SkyrunConfig,
    state: LifecycleState,
    session: SharedSession<C::Session>,
    instance: Option<Instance>,
    /// Names destroyed by this manager, kept until a sweep sees them gone
    destroyed: BTreeSet<String>,
    events: EventSink,
    keepalive: Option<KeepAlive>,
}

impl<C: Connector> LifecycleManager<C> {
    pub fn new(connector: C, config: SkyrunConfig, events: EventSink) -> Self {
        Self {
            connector,
            config,
            state: LifecycleState::NoSession,
            session: Arc::new(Mutex::new(None)),
            instance: None,
            destroyed: BTreeSet::new(),
            events,
            keepalive: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn instance(&self) -> Option<&Instance> {
        self.instance.as_ref()
    }

    pub fn config(&self) -> &SkyrunConfig {
        &self.config
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Names awaiting confirmation that their destroy took effect
    pub fn pending_destroy(&self) -> impl Iterator<Item = &str> {
        self.destroyed.iter().map(String::as_str)
    }

    /// Track `user`'s instance without contacting any host
    ///
    /// Lets a fresh process destroy an instance created by an earlier one.
    pub fn select_instance(&mut self, user: &str) -> Result<&Instance> {
        let name = self.config.instance_name(user)?;
        let mut instance = Instance::new(name, user);
        instance.exists = true;
        Ok(self.instance.insert(instance))
    }

    /// Queue `name` for the next [`reconcile`](Self::reconcile) sweep
    pub fn mark_destroyed(&mut self, name: &str) {
        self.destroyed.insert(name.to_string());
    }

    /// Make sure `user`'s instance exists and hold a session to it
    ///
    /// Logs into the broker, finds or creates the instance, pulls its key
    /// pair, then logs into the instance, retrying the login a bounded
    /// number of times while it boots. A listed but terminated instance is
    /// reported as `InvalidState` and left alone.
    pub fn ensure_instance(&mut self, user: &str) -> Result<Instance> {
        let name = self.config.instance_name(user)?;

        if self.state == LifecycleState::InstanceAuthenticated {
            if let Some(instance) = self.instance.as_ref().filter(|i| i.name == name) {
                return Ok(instance.clone());
            }
        }

        self.ensure_broker()?;
        self.state = LifecycleState::InstanceDiscovering;

        let discovered = self.discover(&name, user).and_then(|instance| {
            self.fetch_keys(&name)?;
            Ok(instance)
        });
        let mut instance = match discovered {
            Ok(instance) => instance,
            Err(e) => {
                self.state = LifecycleState::HubAuthenticated;
                return Err(e);
            }
        };

        // Broker and instance sessions are never held together.
        self.close_session();
        self.state = LifecycleState::NoSession;

        let ip = instance.ip.ok_or_else(|| {
            RemoteError::InvalidState(format!("no address for instance {}", name))
        })?;
        let key_path = self.key_path(&name);
        self.instance = Some(instance.clone());

        self.login_instance(ip, &key_path)?;

        instance.authenticated = true;
        instance.status = Some(InstanceStatus::Running);
        self.instance = Some(instance.clone());
        self.destroyed.remove(&name);
        self.state = LifecycleState::InstanceAuthenticated;
        self.events.log(format!("Logged into instance {} at {}", name, ip));
        Ok(instance)
    }

    /// Destroy the current instance with a single best-effort call
    ///
    /// The instance is marked absent whatever the destroy command reports.
    /// Only failing to reach the broker is returned as an error.
    pub fn destroy_instance(&mut self) -> Result<()> {
        let confirmed = self.destroy(1)?;
        if !confirmed {
            warn!("destroy not confirmed; instance may still exist");
        }
        Ok(())
    }

    /// Destroy the current instance, retrying until the broker confirms
    ///
    /// Fails with `RemoteOperation` when no attempt was confirmed. The
    /// instance is marked absent either way and stays queued for
    /// [`reconcile`](Self::reconcile).
    pub fn destroy_instance_with_retry(&mut self, attempts: u32) -> Result<()> {
        let attempts = attempts.max(1);
        if self.destroy(attempts)? {
            Ok(())
        } else {
            Err(RemoteError::RemoteOperation {
                message: format!("destroy not confirmed after {} attempt(s)", attempts),
            })
        }
    }

    /// Ask the broker how it currently lists `user`'s instance
    pub fn lookup(&mut self, user: &str) -> Result<Option<ListedInstance>> {
        if self.state == LifecycleState::InstanceAuthenticated {
            return Err(RemoteError::InvalidState(
                "cannot query the broker while logged into an instance".to_string(),
            ));
        }
        let name = self.config.instance_name(user)?;
        self.ensure_broker()?;
        let listing = self.broker_command(&self.config.provisioning.list_command)?;
        find_instance(&listing.text, &name)
    }

    /// Re-issue destroy for destroyed instances the broker still lists
    ///
    /// Names that are no longer listed, or listed as terminated, are
    /// dropped from the queue. Returns the names destroy was re-issued for.
    pub fn reconcile(&mut self) -> Result<Vec<String>> {
        if self.state == LifecycleState::InstanceAuthenticated {
            return Err(RemoteError::InvalidState(
                "cannot reconcile while logged into an instance".to_string(),
            ));
        }
        if self.destroyed.is_empty() {
            return Ok(Vec::new());
        }

        self.ensure_broker()?;
        let listing = self.broker_command(&self.config.provisioning.list_command)?;

        let mut reissued = Vec::new();
        for name in self.destroyed.clone() {
            match find_instance(&listing.text, &name)? {
                Some(listed) if !listed.status.is_terminated() => {
                    self.events
                        .log(format!("Instance {} still listed; destroying again", name));
                    let command = render_command(&self.config.provisioning.destroy_command, &name);
                    match self.broker_command(&command) {
                        Ok(output) if destroy_confirmed(&output) => {}
                        Ok(output) => warn!(
                            instance = %name,
                            exit_status = ?output.exit_status,
                            "destroy reported failure"
                        ),
                        Err(e) => self
                            .events
                            .log_error(format!("Destroy of {} failed: {}", name, e)),
                    }
                    reissued.push(name);
                }
                _ => {
                    debug!(instance = %name, "destroy confirmed by listing");
                    self.destroyed.remove(&name);
                }
            }
        }

        Ok(reissued)
    }

    /// Verify the session the manager believes it holds is still alive
    ///
    /// When it is not, the session is dropped, the state becomes
    /// `NoSession`, a disconnect and a structure invalidation are emitted,
    /// and `InvoluntaryDisconnect` is returned. Does nothing when no session
    /// is expected.
    pub fn check_liveness(&mut self) -> Result<()> {
        if !matches!(
            self.state,
            LifecycleState::HubAuthenticated | LifecycleState::InstanceAuthenticated
        ) {
            return Ok(());
        }

        let (live, host) = {
            let mut guard = self.lock_session()?;
            match guard.as_mut() {
                Some(session) => (session.is_live(), session.host().to_string()),
                None => (false, self.expected_host()),
            }
        };
        if live {
            return Ok(());
        }

        self.close_session();
        self.stop_keepalive();
        if let Some(instance) = self.instance.as_mut() {
            instance.authenticated = false;
        }
        self.state = LifecycleState::NoSession;
        self.events.disconnected(&host);
        Err(RemoteError::InvoluntaryDisconnect { host })
    }

    /// Run `f` on the instance session after a liveness check
    pub fn with_instance_session<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut C::Session) -> Result<T>,
    {
        if self.state != LifecycleState::InstanceAuthenticated {
            return Err(RemoteError::InvalidState(format!(
                "not logged into an instance ({})",
                self.state
            )));
        }
        self.check_liveness()?;

        let mut guard = self.lock_session()?;
        let session = guard
            .as_mut()
            .ok_or_else(|| RemoteError::InvalidState("session slot is empty".to_string()))?;
        f(session)
    }

    pub fn is_live(&self) -> bool {
        match self.session.lock() {
            Ok(mut guard) => guard.as_mut().is_some_and(|s| s.is_live()),
            Err(_) => false,
        }
    }

    /// Voluntarily close whatever session is open
    pub fn disconnect(&mut self) {
        self.close_session();
        self.stop_keepalive();
        if let Some(instance) = self.instance.as_mut() {
            instance.authenticated = false;
        }
        self.state = LifecycleState::NoSession;
    }

    fn destroy(&mut self, attempts: u32) -> Result<bool> {
        let name = match self.instance.as_ref() {
            Some(instance) => instance.name.clone(),
            None => return Err(RemoteError::InvalidState("no instance to destroy".to_string())),
        };

        if self.state == LifecycleState::InstanceAuthenticated {
            self.close_session();
            self.state = LifecycleState::NoSession;
        }
        if let Some(instance) = self.instance.as_mut() {
            instance.authenticated = false;
        }

        self.ensure_broker()?;
        self.events.log(format!("Destroying instance {}", name));

        let command = render_command(&self.config.provisioning.destroy_command, &name);
        let pause = Duration::from_secs(self.config.provisioning.destroy_pause_secs);
        let mut confirmed = false;
        for attempt in 1..=attempts {
            match self.broker_command(&command) {
                Ok(output) if destroy_confirmed(&output) => {
                    confirmed = true;
                    break;
                }
                Ok(output) => self.events.log_error(format!(
                    "Destroy of {} reported exit status {:?} (attempt {}/{})",
                    name, output.exit_status, attempt, attempts
                )),
                Err(e) => self.events.log_error(format!(
                    "Destroy of {} failed: {} (attempt {}/{})",
                    name, e, attempt, attempts
                )),
            }
            if attempt < attempts {
                thread::sleep(pause);
            }
        }

        if let Some(instance) = self.instance.as_mut() {
            instance.exists = false;
            instance.ip = None;
            instance.status = None;
        }
        self.destroyed.insert(name);

        self.close_session();
        self.stop_keepalive();
        self.state = LifecycleState::TornDown;
        Ok(confirmed)
    }

    /// Find `name` in the broker listing, creating it when absent
    fn discover(&mut self, name: &str, owner: &str) -> Result<Instance> {
        let mut instance = Instance::new(name.to_string(), owner);

        let listing = self.broker_command(&self.config.provisioning.list_command)?;
        match find_instance(&listing.text, name)? {
            Some(listed) if listed.status.is_terminated() => {
                self.events.log_error(format!(
                    "Instance {} is terminated and will not be restarted",
                    name
                ));
                return Err(RemoteError::InvalidState(format!(
                    "instance {} is terminated",
                    name
                )));
            }
            Some(listed) => {
                self.events.log(format!(
                    "Found instance {} at {} ({})",
                    name, listed.ip, listed.status
                ));
                instance.ip = Some(listed.ip);
                instance.status = Some(listed.status);
            }
            None => {
                self.events.log(format!("Creating instance {}", name));
                let command = render_command(&self.config.provisioning.create_command, name);
                let output = self.broker_command(&command)?;
                let ip = created_address(&output.text)?;
                self.events.log(format!("Created instance {} at {}", name, ip));
                instance.ip = Some(ip);
                instance.status = Some(InstanceStatus::Pending);
            }
        }

        instance.exists = true;
        self.instance = Some(instance.clone());
        Ok(instance)
    }

    /// Pull the instance key pair from the broker into the local key dir
    fn fetch_keys(&mut self, name: &str) -> Result<()> {
        let private_remote = render_template(&self.config.instance.remote_private_key, name);
        let public_remote = render_template(&self.config.instance.remote_public_key, name);

        let (private, public) = {
            let mut guard = self.lock_session()?;
            let session = guard
                .as_mut()
                .ok_or_else(|| RemoteError::InvalidState("no broker session".to_string()))?;
            (session.pull(&private_remote)?, session.pull(&public_remote)?)
        };

        let private_path = self.key_path(name);
        let mut public_path = private_path.clone().into_os_string();
        public_path.push(".pub");

        fs::create_dir_all(&self.config.instance.key_dir)?;
        write_key(&private_path, &private)?;
        write_key(Path::new(&public_path), &public)?;
        debug!(path = %private_path.display(), "stored instance key pair");
        Ok(())
    }

    fn login_instance(&mut self, ip: Ipv4Addr, key_path: &Path) -> Result<()> {
        let login_user = &self.config.instance.login_user;
        let target = SshTarget::with_key(ip.to_string(), login_user, key_path)
            .with_port(self.config.instance.port)
            .with_timeout(self.config.broker.connect_timeout_secs)
            .with_command_timeout(self.config.command_timeout_secs)
            .with_keepalive(self.config.keepalive_interval_secs);

        let attempts = self.config.instance.login_attempts.max(1);
        let pause = Duration::from_secs(self.config.instance.login_pause_secs);

        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.connector.open(&target) {
                Ok(session) => {
                    self.install(session)?;
                    return Ok(());
                }
                Err(e) => {
                    info!(host = %ip, attempt, attempts, error = %e, "instance login failed");
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                thread::sleep(pause);
            }
        }

        let error =
            last_error.unwrap_or_else(|| RemoteError::auth(ip.to_string(), "no login attempted"));
        self.events.log_error(format!(
            "Could not log into instance at {} after {} attempt(s): {}",
            ip, attempts, error
        ));
        Err(error)
    }

    fn ensure_broker(&mut self) -> Result<()> {
        if self.state == LifecycleState::HubAuthenticated && self.lock_session()?.is_some() {
            return Ok(());
        }

        self.close_session();
        if let Some(instance) = self.instance.as_mut() {
            instance.authenticated = false;
        }

        let broker = &self.config.broker;
        let target = SshTarget::new(
            broker.host.clone(),
            broker.username.clone(),
            SshAuth::KeyFile {
                key_path: broker.key_path.clone(),
                passphrase: broker.passphrase.clone(),
            },
        )
        .with_port(broker.port)
        .with_timeout(broker.connect_timeout_secs)
        .with_command_timeout(self.config.command_timeout_secs)
        .with_keepalive(self.config.keepalive_interval_secs);

        self.events.log(format!("Logging into broker {}", target.host));
        let session = match self.connector.open(&target) {
            Ok(session) => session,
            Err(e) => {
                self.state = LifecycleState::NoSession;
                self.events.log_error(format!("Broker login failed: {}", e));
                return Err(e);
            }
        };
        self.install(session)?;
        self.state = LifecycleState::HubAuthenticated;
        Ok(())
    }

    fn broker_command(&self, command: &str) -> Result<CommandOutput> {
        let mut guard = self.lock_session()?;
        let session = guard
            .as_mut()
            .ok_or_else(|| RemoteError::InvalidState("no broker session".to_string()))?;
        debug!(command, "broker command");
        session.execute(command, None)
    }

    /// Put `session` in the slot, closing any previous one
    fn install(&mut self, session: C::Session) -> Result<()> {
        {
            let mut guard = self.lock_session()?;
            if let Some(mut old) = guard.replace(session) {
                old.close();
            }
        }
        if self.keepalive.is_none() {
            let interval = Duration::from_secs(self.config.keepalive_interval_secs.max(1));
            self.keepalive = Some(KeepAlive::spawn(self.session.clone(), interval));
        }
        Ok(())
    }

    fn close_session(&mut self) {
        let taken = match self.session.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut session) = taken {
            session.close();
        }
    }

    fn stop_keepalive(&mut self) {
        if let Some(mut keepalive) = self.keepalive.take() {
            keepalive.stop();
        }
    }

    fn lock_session(&self) -> Result<MutexGuard<'_, Option<C::Session>>> {
        self.session
            .lock()
            .map_err(|_| RemoteError::InvalidState("session lock poisoned".to_string()))
    }

    fn expected_host(&self) -> String {
        match (self.state, self.instance.as_ref().and_then(|i| i.ip)) {
            (LifecycleState::InstanceAuthenticated, Some(ip)) => ip.to_string(),
            _ => self.config.broker.host.clone(),
        }
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.config.instance.key_dir.join(name)
    }
}

impl<C: Connector> Drop for LifecycleManager<C> {
    fn drop(&mut self) {
        self.stop_keepalive();
        self.close_session();
    }
}

/// A destroy counts as done unless the tool reported a non-zero status
fn destroy_confirmed(output: &CommandOutput) -> bool {
    matches!(output.exit_status, None | Some(0))
}

/// Write a key file readable only by its owner
fn write_key(path: &Path, data: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    Ok(())
}
