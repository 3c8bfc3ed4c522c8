//! Configuration file for the Quokka server.
//!
//! Every listener section is optional; leaving one out disables that
//! listener. Unknown keys and sections are rejected, so a misspelled
//! section name fails to load. [`Config::default`] is the file written by
//! `quokka config create`.

use quokka_smtp::{INMEMORY_PROVIDER, ServerConfig, StaticCredentials, Timeouts};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Errors raised while loading or checking a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("config file already exists at {}, use --force to overwrite", .0.display())]
    AlreadyExists(PathBuf),

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration structs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Host name announced to SMTP clients.
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Largest accepted message, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp_relay: Option<ListenerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp_submission: Option<ListenerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp_submissions: Option<ListenerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub imap: Option<ListenerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ListenerConfig>,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

/// PEM files holding the certificate chain and private key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// `host:port` to bind.
    pub address: String,
}

impl ListenerConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    pub provider: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct UserConfig {
    pub username: String,
    /// Argon2 PHC string of the password (`quokka config hash-password`).
    pub password_hash: String,
}

/// Timeouts in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct TimeoutsConfig {
    pub command: u64,
    pub data_block: u64,
}

// ============================================================================
// Default implementations
// ============================================================================

fn default_domain() -> String {
    "quokka.local".to_string()
}

fn default_max_message_size() -> usize {
    quokka_smtp::DEFAULT_MAX_MESSAGE_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            max_message_size: default_max_message_size(),
            tls: Some(TlsConfig {
                cert: PathBuf::from("cert.pem"),
                key: PathBuf::from("key.pem"),
            }),
            smtp_relay: Some(ListenerConfig::new("0.0.0.0:25")),
            smtp_submission: Some(ListenerConfig::new("0.0.0.0:587")),
            smtp_submissions: Some(ListenerConfig::new("0.0.0.0:465")),
            imap: Some(ListenerConfig::new("0.0.0.0:143")),
            metrics: None,
            queue: QueueConfig::default(),
            auth: AuthConfig::default(),
            timeouts: TimeoutsConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            provider: INMEMORY_PROVIDER.to_string(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        let defaults = Timeouts::default();
        Self {
            command: defaults.command.as_secs(),
            data_block: defaults.data_block.as_secs(),
        }
    }
}

impl From<TimeoutsConfig> for Timeouts {
    fn from(config: TimeoutsConfig) -> Self {
        Self {
            command: Duration::from_secs(config.command),
            data_block: Duration::from_secs(config.data_block),
        }
    }
}

// ============================================================================
// Loading and validation
// ============================================================================

impl Config {
    /// Reads, parses and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    /// Parses and validates configuration text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Writes this configuration to `path`, readable only by the owner.
    /// An existing file is kept unless `force` is set.
    pub fn write_to(&self, path: impl AsRef<Path>, force: bool) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if path.exists() && !force {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }

        let content = self.to_toml()?;
        let write_err = |source: std::io::Error| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path).map_err(write_err)?;
        file.write_all(content.as_bytes()).map_err(write_err)?;
        Ok(())
    }

    /// Rejects values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.trim().is_empty() {
            return Err(ConfigError::Invalid("domain must not be empty".into()));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "max-message-size must be greater than zero".into(),
            ));
        }
        if self.queue.provider != INMEMORY_PROVIDER {
            return Err(ConfigError::Invalid(format!(
                "unknown queue provider '{}'",
                self.queue.provider
            )));
        }
        if self.smtp_submissions.is_some() && self.tls.is_none() {
            return Err(ConfigError::Invalid(
                "smtp-submissions requires a [tls] section".into(),
            ));
        }
        if self.timeouts.command == 0 || self.timeouts.data_block == 0 {
            return Err(ConfigError::Invalid("timeouts must be greater than zero".into()));
        }

        for (name, listener) in self.listeners() {
            if listener.address.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{name} address must not be empty")));
            }
        }

        let mut seen = HashSet::new();
        for user in &self.auth.users {
            if user.username.is_empty() {
                return Err(ConfigError::Invalid("auth user with empty username".into()));
            }
            if !quokka_smtp::is_password_hash(&user.password_hash) {
                return Err(ConfigError::Invalid(format!(
                    "password-hash of user '{}' must be an argon2 PHC string",
                    user.username
                )));
            }
            if !seen.insert(user.username.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate auth user '{}'",
                    user.username
                )));
            }
        }

        Ok(())
    }

    /// Configured listeners with their section names.
    pub fn listeners(&self) -> impl Iterator<Item = (&'static str, &ListenerConfig)> {
        [
            ("smtp-relay", &self.smtp_relay),
            ("smtp-submission", &self.smtp_submission),
            ("smtp-submissions", &self.smtp_submissions),
            ("imap", &self.imap),
            ("metrics", &self.metrics),
        ]
        .into_iter()
        .filter_map(|(name, listener)| listener.as_ref().map(|l| (name, l)))
    }

    /// Credential table for SMTP AUTH.
    pub fn credentials(&self) -> StaticCredentials {
        let mut credentials = StaticCredentials::new();
        for user in &self.auth.users {
            credentials.insert_hashed(user.username.clone(), &user.password_hash);
        }
        credentials
    }

    fn server_config(&self, base: ServerConfig) -> ServerConfig {
        base.with_max_message_size(self.max_message_size)
            .with_timeouts(self.timeouts.into())
    }

    pub fn relay_server_config(&self) -> ServerConfig {
        self.server_config(ServerConfig::relay(&self.domain))
    }

    pub fn submission_server_config(&self) -> ServerConfig {
        self.server_config(ServerConfig::submission(&self.domain))
    }

    pub fn submissions_server_config(&self) -> ServerConfig {
        self.server_config(ServerConfig::submissions(&self.domain))
    }
}
