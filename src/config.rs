/*!
 * Configuration types for skyrun
 */

use regex::Regex;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::{RemoteError, Result};

/// Placeholder replaced by the instance name in command and path templates
pub const NAME_PLACEHOLDER: &str = "{name}";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkyrunConfig {
    /// Broker host used to list, create, and destroy instances
    #[serde(default)]
    pub broker: BrokerConfig,

    /// How instances are named and logged into
    #[serde(default)]
    pub instance: InstanceConfig,

    /// Provisioning tool command templates run on the broker
    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    /// Remote helper program layout
    #[serde(default)]
    pub helper: HelperConfig,

    /// Seconds between keep-alive messages on the active session
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Read deadline for a single remote command (0 = wait indefinitely)
    #[serde(default)]
    pub command_timeout_secs: u64,

    /// Log level for diagnostic output
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for log_level = debug)
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    /// Private key used to log into the broker
    #[serde(default = "default_broker_key")]
    pub key_path: PathBuf,

    /// Key passphrase; never written back out
    #[serde(default, skip_serializing)]
    pub passphrase: Option<SecretString>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Instance name template; `{name}` is the requesting user
    #[serde(default = "default_name_template")]
    pub name_template: String,

    /// Account used when logging into an instance
    #[serde(default = "default_login_user")]
    pub login_user: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Local directory receiving per-instance key pairs
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,

    /// Broker-side path of the generated private key
    #[serde(default = "default_remote_private_key")]
    pub remote_private_key: String,

    /// Broker-side path of the generated public key
    #[serde(default = "default_remote_public_key")]
    pub remote_public_key: String,

    /// Login attempts against a freshly created instance
    #[serde(default = "default_login_attempts")]
    pub login_attempts: u32,

    /// Pause between login attempts in seconds
    #[serde(default = "default_login_pause")]
    pub login_pause_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    #[serde(default = "default_list_command")]
    pub list_command: String,

    #[serde(default = "default_create_command")]
    pub create_command: String,

    #[serde(default = "default_destroy_command")]
    pub destroy_command: String,

    /// Pause between destroy attempts when retrying, in seconds
    #[serde(default = "default_destroy_pause")]
    pub destroy_pause_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperConfig {
    /// Absolute path of the helper executable on the instance
    #[serde(default = "default_helper_program")]
    pub program: String,

    /// Database the helper reads and writes
    #[serde(default = "default_helper_database")]
    pub database: String,

    /// Remote directory for temporary export files
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,

    /// Model output databases removed before each run
    #[serde(default = "default_run_outputs")]
    pub run_outputs: Vec<String>,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_keepalive_interval() -> u64 {
    60
}

fn default_broker_key() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".ssh")
        .join("id_rsa")
}

fn default_name_template() -> String {
    NAME_PLACEHOLDER.to_string()
}

fn default_login_user() -> String {
    "root".to_string()
}

fn default_key_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("skyrun").join("keys"))
        .unwrap_or_else(|| PathBuf::from("keys"))
}

fn default_remote_private_key() -> String {
    "keys/{name}".to_string()
}

fn default_remote_public_key() -> String {
    "keys/{name}.pub".to_string()
}

fn default_login_attempts() -> u32 {
    10
}

fn default_login_pause() -> u64 {
    5
}

fn default_list_command() -> String {
    "provision list".to_string()
}

fn default_create_command() -> String {
    "provision create {name}".to_string()
}

fn default_destroy_command() -> String {
    "provision destroy {name}".to_string()
}

fn default_destroy_pause() -> u64 {
    10
}

fn default_helper_program() -> String {
    "/opt/skyrun/bin/skyrun-helper".to_string()
}

fn default_helper_database() -> String {
    "/opt/skyrun/data/model.db".to_string()
}

fn default_temp_dir() -> String {
    "/tmp".to_string()
}

fn default_run_outputs() -> Vec<String> {
    vec![
        "/opt/skyrun/data/output.db".to_string(),
        "/opt/skyrun/data/output_series.db".to_string(),
    ]
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            key_path: default_broker_key(),
            passphrase: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name_template: default_name_template(),
            login_user: default_login_user(),
            port: default_port(),
            key_dir: default_key_dir(),
            remote_private_key: default_remote_private_key(),
            remote_public_key: default_remote_public_key(),
            login_attempts: default_login_attempts(),
            login_pause_secs: default_login_pause(),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            list_command: default_list_command(),
            create_command: default_create_command(),
            destroy_command: default_destroy_command(),
            destroy_pause_secs: default_destroy_pause(),
        }
    }
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            program: default_helper_program(),
            database: default_helper_database(),
            temp_dir: default_temp_dir(),
            run_outputs: default_run_outputs(),
        }
    }
}

impl Default for SkyrunConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            instance: InstanceConfig::default(),
            provisioning: ProvisioningConfig::default(),
            helper: HelperConfig::default(),
            keepalive_interval_secs: default_keepalive_interval(),
            command_timeout_secs: 0,
            log_level: LogLevel::Info,
            log_file: None,
            verbose: false,
        }
    }
}

/// Substitute `{name}` in a path template
pub fn render_template(template: &str, name: &str) -> String {
    template.replace(NAME_PLACEHOLDER, name)
}

/// Substitute `{name}` in a shell command template, quoted as one word
pub fn render_command(template: &str, name: &str) -> String {
    template.replace(NAME_PLACEHOLDER, &shell_escape::unix::escape(name.into()))
}

fn instance_name_shape() -> &'static Regex {
    static SHAPE: OnceLock<Regex> = OnceLock::new();
    SHAPE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("static regex is valid"))
}

impl SkyrunConfig {
    /// Default config location (`<config dir>/skyrun/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("skyrun").join("config.toml"))
    }

    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RemoteError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: SkyrunConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| RemoteError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check the settings every workflow depends on
    pub fn validate(&self) -> Result<()> {
        if self.broker.host.trim().is_empty() {
            return Err(RemoteError::Config("broker.host is required".to_string()));
        }
        if self.broker.username.trim().is_empty() {
            return Err(RemoteError::Config("broker.username is required".to_string()));
        }
        for (key, template) in [
            ("provisioning.create_command", &self.provisioning.create_command),
            ("provisioning.destroy_command", &self.provisioning.destroy_command),
            ("instance.name_template", &self.instance.name_template),
            ("instance.remote_private_key", &self.instance.remote_private_key),
        ] {
            if !template.contains(NAME_PLACEHOLDER) {
                return Err(RemoteError::Config(format!(
                    "{} must contain {}",
                    key, NAME_PLACEHOLDER
                )));
            }
        }
        if self.instance.login_attempts == 0 {
            return Err(RemoteError::Config(
                "instance.login_attempts must be at least 1".to_string(),
            ));
        }
        if self.keepalive_interval_secs == 0 {
            return Err(RemoteError::Config(
                "keepalive_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Instance name owned by `user`
    ///
    /// The name is a single token in broker listings and commands, so only
    /// letters, digits, `_`, `.` and `-` are accepted.
    pub fn instance_name(&self, user: &str) -> Result<String> {
        let name = render_template(&self.instance.name_template, user);
        if !instance_name_shape().is_match(&name) {
            return Err(RemoteError::Config(format!(
                "invalid instance name {:?}: use letters, digits, '_', '.' or '-'",
                name
            )));
        }
        Ok(name)
    }
}
