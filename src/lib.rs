//! smtpd - SMTP receiving server
//!
//! Accepts mail over SMTP (RFC 5321) with STARTTLS (RFC 3207), AUTH PLAIN
//! and LOGIN (RFC 4954) and the HAProxy v1 PROXY header, and hands each
//! completed transaction to a pluggable [`MessageStore`].
//!
//! ## Architecture
//!
//! ```text
//!             ┌──────────────┐  line  ┌───────────┐ tokens ┌─────────────────┐
//! socket ───▶ │  SmtpStream  │──────▶│ Tokenizer │──────▶│ SmtpStateMachine │
//!             └──────────────┘        └───────────┘        └────────┬────────┘
//!                    ▲                                              │ SmtpCommand
//!                    │ reply        ┌────────────────┐              ▼
//!                    └──────────────│ session::execute│◀── MessageStore / MailboxFilter
//!                                   └────────────────┘     UserAuthenticator / CertificateFactory
//! ```

pub mod auth;
pub mod config;
pub mod crypto;
pub mod events;
pub mod filter;
pub mod proto;
pub mod server;
pub mod session;
pub mod store;
pub mod tls;

// Re-export commonly used items
pub use auth::{Credentials, UserAuthenticator, UsersFileAuthenticator};
pub use config::{Config, EndpointConfig, ServerConfig, UserEntry, UsersConfig};
pub use events::{SessionObserver, TracingObserver};
pub use filter::{AcceptAllFilter, DomainMailboxFilter, MailboxFilter, MailboxFilterResult};
pub use proto::{Mailbox, SmtpCommand, SmtpReplyCode, SmtpResponse, SmtpState};
pub use server::Server;
pub use session::{MessageTransaction, SessionInfo};
pub use store::{FileMessageStore, MemoryMessageStore, MessageStore};
pub use tls::{CertificateFactory, PemCertificateFactory};

use thiserror::Error;

/// Error types for smtpd
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out waiting for input")]
    Timeout,

    #[error("Session cancelled")]
    Cancelled,

    /// A command ended with a specific reply, and possibly the session too
    #[error("{response}")]
    Response { response: SmtpResponse, quit: bool },
}

impl Error {
    /// Reply and carry on with the session
    pub fn response(response: SmtpResponse) -> Self {
        Self::Response {
            response,
            quit: false,
        }
    }

    /// Reply and close the session
    pub fn quit(response: SmtpResponse) -> Self {
        Self::Response {
            response,
            quit: true,
        }
    }
}

impl From<tokio_rustls::rustls::Error> for Error {
    fn from(e: tokio_rustls::rustls::Error) -> Self {
        Self::Tls(e.to_string())
    }
}

/// Result type for smtpd
pub type Result<T> = std::result::Result<T, Error>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
