//! Configuration management

use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A listening endpoint
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Listen address, e.g. "0.0.0.0:25"
    #[serde(default = "default_address")]
    pub address: String,
    /// Start TLS immediately on connect (SMTPS, port 465)
    #[serde(default)]
    pub implicit_tls: bool,
    /// Refuse MAIL until the client has authenticated
    #[serde(default)]
    pub authentication_required: bool,
    /// Offer AUTH before the channel is encrypted
    #[serde(default)]
    pub allow_unsecure_authentication: bool,
    /// Expect a HAProxy v1 header as the first line
    #[serde(default)]
    pub proxy_protocol: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            implicit_tls: false,
            authentication_required: false,
            allow_unsecure_authentication: false,
            proxy_protocol: false,
        }
    }
}

impl EndpointConfig {
    /// Get socket address to bind to
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = self.address.parse()?;
        Ok(addr)
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Hostname announced in the greeting and EHLO reply
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Listening endpoints
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<EndpointConfig>,
    /// TLS certificate chain (PEM). STARTTLS needs both files.
    #[serde(default)]
    pub cert_file: Option<String>,
    /// TLS private key (PEM)
    #[serde(default)]
    pub key_file: Option<String>,
    /// Users file; enables AUTH when set
    #[serde(default)]
    pub users_file: Option<String>,
    /// Directory receiving one .eml file per message. Empty keeps
    /// messages in memory.
    #[serde(default = "default_mailbox_dir")]
    pub mailbox_dir: String,
    /// Largest accepted message in bytes, advertised as SIZE
    #[serde(default)]
    pub max_message_size: Option<usize>,
    /// Recipients per transaction
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,
    /// Consecutive unparseable commands before the session is dropped
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: usize,
    /// Failed AUTH attempts before the session is dropped
    #[serde(default = "default_max_authentication_attempts")]
    pub max_authentication_attempts: usize,
    /// Size of each network read
    #[serde(default = "default_network_buffer_size")]
    pub network_buffer_size: usize,
    /// Idle timeout while waiting for a command or DATA
    #[serde(default = "default_command_wait_timeout_secs")]
    pub command_wait_timeout_secs: u64,
    /// Recipient domains to accept mail for (empty = all)
    #[serde(default)]
    pub accepted_domains: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            endpoints: default_endpoints(),
            cert_file: None,
            key_file: None,
            users_file: None,
            mailbox_dir: default_mailbox_dir(),
            max_message_size: None,
            max_recipients: default_max_recipients(),
            max_retry_count: default_max_retry_count(),
            max_authentication_attempts: default_max_authentication_attempts(),
            network_buffer_size: default_network_buffer_size(),
            command_wait_timeout_secs: default_command_wait_timeout_secs(),
            accepted_domains: Vec::new(),
        }
    }
}

/// User configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserEntry {
    /// Salted password hash, see [`crate::crypto::hash_password`]
    pub password: String,
    /// IP whitelist (empty = allow all)
    #[serde(default)]
    pub whitelist: Vec<String>,
}

/// Users configuration file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UsersConfig {
    #[serde(default)]
    pub users: HashMap<String, UserEntry>,
}

/// Full configuration file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
}

// Default value functions
fn default_address() -> String {
    "0.0.0.0:25".to_string()
}
fn default_endpoints() -> Vec<EndpointConfig> {
    vec![EndpointConfig::default()]
}
fn default_hostname() -> String {
    "mail.example.com".to_string()
}
fn default_mailbox_dir() -> String {
    "mail".to_string()
}
fn default_max_recipients() -> usize {
    100
}
fn default_max_retry_count() -> usize {
    5
}
fn default_max_authentication_attempts() -> usize {
    3
}
fn default_network_buffer_size() -> usize {
    128
}
fn default_command_wait_timeout_secs() -> u64 {
    300
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Create default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl UsersConfig {
    /// Load users from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: UsersConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save users to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get user by name
    pub fn get_user(&self, username: &str) -> Option<&UserEntry> {
        self.users.get(username)
    }

    /// Add or update user
    pub fn set_user(&mut self, username: impl Into<String>, entry: UserEntry) {
        self.users.insert(username.into(), entry);
    }

    /// Remove user
    pub fn remove_user(&mut self, username: &str) -> Option<UserEntry> {
        self.users.remove(username)
    }

    /// Check if IP is whitelisted for user
    pub fn is_ip_whitelisted(&self, username: &str, ip: IpAddr) -> bool {
        let Some(user) = self.users.get(username) else {
            return false;
        };

        // Empty whitelist = allow all
        if user.whitelist.is_empty() {
            return true;
        }

        user.whitelist.iter().any(|entry| {
            if let Ok(addr) = entry.parse::<IpAddr>() {
                return addr == ip;
            }
            entry
                .parse::<ipnet::IpNet>()
                .is_ok_and(|network| network.contains(&ip))
        })
    }
}

impl ServerConfig {
    /// Both TLS files, when configured
    pub fn tls_files(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => Some((PathBuf::from(cert), PathBuf::from(key))),
            _ => None,
        }
    }

    pub fn command_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.command_wait_timeout_secs)
    }

    /// Reject combinations the server cannot honour. `users_available` is
    /// whether a users table will be supplied, from `users_file` or elsewhere.
    pub fn validate(&self, users_available: bool) -> crate::Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::InvalidConfig("no endpoints configured".into()));
        }
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(Error::InvalidConfig(
                "cert_file and key_file must be set together".into(),
            ));
        }
        if self.network_buffer_size == 0 {
            return Err(Error::InvalidConfig("network_buffer_size must be positive".into()));
        }
        if self.max_retry_count == 0 {
            return Err(Error::InvalidConfig("max_retry_count must be positive".into()));
        }

        for endpoint in &self.endpoints {
            endpoint.address.parse::<SocketAddr>().map_err(|e| {
                Error::InvalidConfig(format!("endpoint {}: {e}", endpoint.address))
            })?;
            if endpoint.implicit_tls && self.tls_files().is_none() {
                return Err(Error::InvalidConfig(format!(
                    "endpoint {} uses implicit TLS but no certificate is configured",
                    endpoint.address
                )));
            }
            if endpoint.authentication_required && !users_available {
                return Err(Error::InvalidConfig(format!(
                    "endpoint {} requires authentication but no users are configured",
                    endpoint.address
                )));
            }
        }
        Ok(())
    }
}

/// Generate example configuration
pub fn generate_example_config() -> String {
    r#"# smtpd configuration
# Copy this file and customize for your setup

server:
  # Hostname announced in the greeting and EHLO reply
  hostname: "mail.example.com"

  # Listening endpoints
  endpoints:
    # Plain SMTP relay port, STARTTLS offered when a certificate is set
    - address: "0.0.0.0:25"

    # Submission: clients must authenticate, and may only do so after STARTTLS
    - address: "0.0.0.0:587"
      authentication_required: true

    # SMTPS: TLS from the first byte
    - address: "0.0.0.0:465"
      implicit_tls: true
      authentication_required: true

    # Behind a load balancer sending HAProxy v1 headers
    # - address: "127.0.0.1:2525"
    #   proxy_protocol: true

  # TLS certificate and key files (see smtpd-gen-certs)
  cert_file: "server.crt"
  key_file: "server.key"

  # Users allowed to authenticate (see smtpd-adduser)
  users_file: "users.yaml"

  # One .eml file per accepted message lands here
  mailbox_dir: "mail"

  # Largest accepted message in bytes
  max_message_size: 10485760

  max_recipients: 100
  max_retry_count: 5
  max_authentication_attempts: 3
  network_buffer_size: 128
  command_wait_timeout_secs: 300

  # Recipient domains this server accepts mail for (empty = all)
  accepted_domains:
    - "example.com"
"#
    .to_string()
}

/// Generate example users file
pub fn generate_example_users() -> String {
    r#"# smtpd users
# Managed by smtpd-adduser

users:
  alice:
    password: "hmac-sha256$<salt>$<mac>"
    # whitelist:
    #   - 192.168.1.100
    #   - 10.0.0.0/8

  bob:
    password: "hmac-sha256$<salt>$<mac>"
    whitelist: []
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses_and_validates() {
        let config: Config = serde_yaml::from_str(&generate_example_config()).unwrap();
        let server = &config.server;
        assert_eq!(server.endpoints.len(), 3);
        assert!(server.endpoints[2].implicit_tls);
        assert_eq!(server.max_message_size, Some(10_485_760));
        assert_eq!(server.accepted_domains, vec!["example.com".to_string()]);
        server.validate(server.users_file.is_some()).unwrap();
    }

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str("server:\n  hostname: mx.test\n").unwrap();
        let server = config.server;
        assert_eq!(server.hostname, "mx.test");
        assert_eq!(server.endpoints, vec![EndpointConfig::default()]);
        assert_eq!(server.max_retry_count, 5);
        assert_eq!(server.max_authentication_attempts, 3);
        assert_eq!(server.network_buffer_size, 128);
        assert_eq!(server.command_wait_timeout(), Duration::from_secs(300));
        assert!(server.tls_files().is_none());
        server.validate(false).unwrap();
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ServerConfig {
            cert_file: Some("server.crt".into()),
            ..Default::default()
        };
        assert!(matches!(config.validate(false), Err(Error::InvalidConfig(_))));

        config.cert_file = None;
        config.endpoints[0].implicit_tls = true;
        assert!(matches!(config.validate(false), Err(Error::InvalidConfig(_))));

        config.endpoints[0].implicit_tls = false;
        config.endpoints[0].authentication_required = true;
        assert!(matches!(config.validate(false), Err(Error::InvalidConfig(_))));
        assert!(config.validate(true).is_ok());

        config.endpoints[0].authentication_required = false;
        config.endpoints[0].address = "not an address".into();
        assert!(matches!(config.validate(false), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_whitelist() {
        let mut users = UsersConfig::default();
        users.set_user(
            "alice",
            UserEntry {
                password: String::new(),
                whitelist: vec!["192.168.1.100".into(), "10.0.0.0/8".into()],
            },
        );
        users.set_user(
            "bob",
            UserEntry {
                password: String::new(),
                whitelist: Vec::new(),
            },
        );

        assert!(users.is_ip_whitelisted("alice", "192.168.1.100".parse().unwrap()));
        assert!(users.is_ip_whitelisted("alice", "10.20.30.40".parse().unwrap()));
        assert!(!users.is_ip_whitelisted("alice", "192.168.1.101".parse().unwrap()));
        assert!(users.is_ip_whitelisted("bob", "203.0.113.9".parse().unwrap()));
        assert!(!users.is_ip_whitelisted("carol", "127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_users_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.yaml");

        let mut users = UsersConfig::default();
        users.set_user(
            "alice",
            UserEntry {
                password: "hmac-sha256$00$00".into(),
                whitelist: vec!["::1".into()],
            },
        );
        users.save_to_file(&path).unwrap();

        let loaded = UsersConfig::from_file(&path).unwrap();
        assert_eq!(loaded.get_user("alice").unwrap().whitelist, vec!["::1".to_string()]);
    }
}
