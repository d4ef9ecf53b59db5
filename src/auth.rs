//! SASL credential decoding and user verification

use crate::config::UsersConfig;
use crate::crypto::verify_password;
use crate::session::SessionInfo;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Decoded AUTH credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Identity to act as, when different from `user` (PLAIN only)
    pub authorization_id: Option<String>,
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            authorization_id: None,
            user: user.into(),
            password: password.into(),
        }
    }

    /// Decode an RFC 4616 PLAIN message: `[authzid] NUL authcid NUL passwd`
    pub fn from_plain(encoded: &str) -> Option<Self> {
        let decoded = decode_text(encoded)?;
        let mut parts = decoded.split('\0');
        let (Some(authorization_id), Some(user), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return None;
        };
        if user.is_empty() {
            return None;
        }
        Some(Self {
            authorization_id: (!authorization_id.is_empty()).then(|| authorization_id.to_string()),
            user: user.to_string(),
            password: password.to_string(),
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("authorization_id", &self.authorization_id)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Decode a Base64 payload that must be UTF-8 text
pub fn decode_text(encoded: &str) -> Option<String> {
    let bytes = BASE64.decode(encoded.as_bytes()).ok()?;
    String::from_utf8(bytes).ok()
}

/// Encode a server challenge such as `Username:`
pub fn encode_challenge(challenge: &str) -> String {
    BASE64.encode(challenge.as_bytes())
}

/// Verifies decoded credentials
#[async_trait]
pub trait UserAuthenticator: Send + Sync {
    async fn authenticate(&self, session: &SessionInfo, credentials: &Credentials) -> bool;
}

/// Checks credentials against a users file: the salted password hash
/// first, then the user's IP whitelist.
#[derive(Debug, Clone)]
pub struct UsersFileAuthenticator {
    users: Arc<RwLock<UsersConfig>>,
}

impl UsersFileAuthenticator {
    pub fn new(users: UsersConfig) -> Self {
        Self {
            users: Arc::new(RwLock::new(users)),
        }
    }

    /// Reload users from file
    pub async fn reload<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let users = UsersConfig::from_file(path)?;
        let mut guard = self.users.write().await;
        *guard = users;
        info!("Reloaded users configuration");
        Ok(())
    }
}

#[async_trait]
impl UserAuthenticator for UsersFileAuthenticator {
    async fn authenticate(&self, session: &SessionInfo, credentials: &Credentials) -> bool {
        let users = self.users.read().await;

        let Some(user) = users.get_user(&credentials.user) else {
            warn!("[{}] Unknown user {}", session.id, credentials.user);
            return false;
        };
        if !verify_password(&credentials.password, &user.password) {
            warn!("[{}] Wrong password for user {}", session.id, credentials.user);
            return false;
        }
        if credentials
            .authorization_id
            .as_ref()
            .is_some_and(|id| *id != credentials.user)
        {
            warn!(
                "[{}] User {} may not act as another identity",
                session.id, credentials.user
            );
            return false;
        }

        let whitelisted = match session.remote_addr {
            Some(addr) => users.is_ip_whitelisted(&credentials.user, addr.ip()),
            None => user.whitelist.is_empty(),
        };
        if !whitelisted {
            warn!(
                "[{}] User {} not whitelisted from {}",
                session.id,
                credentials.user,
                session.remote_description()
            );
        }
        whitelisted
    }
}
