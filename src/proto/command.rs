//! Parsed SMTP commands

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

/// A mailbox as it appears in MAIL and RCPT paths.
///
/// The empty mailbox stands for the null reverse-path `<>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Mailbox {
    pub user: String,
    pub host: String,
}

impl Mailbox {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
        }
    }

    /// The null reverse-path
    pub fn empty() -> Self {
        Self::default()
    }

    /// The special `<Postmaster>` forward-path
    pub fn postmaster() -> Self {
        Self::new("Postmaster", "")
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.host.is_empty()
    }

    pub fn is_postmaster(&self) -> bool {
        self.host.is_empty() && self.user.eq_ignore_ascii_case("postmaster")
    }

    /// The address as it would appear between angle brackets
    pub fn as_address(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.is_empty() {
            write!(f, "{}", self.user)
        } else {
            write!(f, "{}@{}", self.user, self.host)
        }
    }
}

/// ESMTP parameters keyed by upper-cased keyword.
///
/// Parameters given without a value map to an empty string.
pub type EsmtpParameters = BTreeMap<String, String>;

/// SASL mechanisms offered by AUTH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationMethod {
    Plain,
    Login,
}

impl AuthenticationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

impl fmt::Display for AuthenticationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address family of a PROXY header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyProtocol {
    Tcp4,
    Tcp6,
    Unknown,
}

/// HAProxy v1 header contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCommand {
    pub protocol: ProxyProtocol,
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
}

/// A recognized command and the fields its grammar yields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Helo {
        domain: String,
    },
    Ehlo {
        domain: String,
    },
    Mail {
        from: Mailbox,
        parameters: EsmtpParameters,
    },
    Rcpt {
        to: Mailbox,
        parameters: EsmtpParameters,
    },
    Data,
    Rset,
    Noop,
    Quit,
    Auth {
        method: AuthenticationMethod,
        initial_response: Option<String>,
    },
    StartTls,
    Proxy(ProxyCommand),
}

impl SmtpCommand {
    /// The command verb
    pub fn name(&self) -> &'static str {
        match self {
            Self::Helo { .. } => "HELO",
            Self::Ehlo { .. } => "EHLO",
            Self::Mail { .. } => "MAIL",
            Self::Rcpt { .. } => "RCPT",
            Self::Data => "DATA",
            Self::Rset => "RSET",
            Self::Noop => "NOOP",
            Self::Quit => "QUIT",
            Self::Auth { .. } => "AUTH",
            Self::StartTls => "STARTTLS",
            Self::Proxy(_) => "PROXY",
        }
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo { domain } | Self::Ehlo { domain } => write!(f, "{} {domain}", self.name()),
            Self::Mail { from, .. } => write!(f, "MAIL FROM:<{from}>"),
            Self::Rcpt { to, .. } => write!(f, "RCPT TO:<{to}>"),
            // Never echo credentials into logs.
            Self::Auth { method, .. } => write!(f, "AUTH {method}"),
            _ => f.write_str(self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_display() {
        assert_eq!(Mailbox::new("user", "example.com").to_string(), "user@example.com");
        assert_eq!(Mailbox::empty().to_string(), "");
        assert!(Mailbox::empty().is_empty());
        assert!(Mailbox::postmaster().is_postmaster());
        assert!(!Mailbox::new("postmaster", "example.com").is_postmaster());
    }

    #[test]
    fn test_auth_display_hides_credentials() {
        let command = SmtpCommand::Auth {
            method: AuthenticationMethod::Plain,
            initial_response: Some("AHVzZXIAc2VjcmV0".into()),
        };
        assert_eq!(command.to_string(), "AUTH PLAIN");
    }
}
