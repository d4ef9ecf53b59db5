//! SMTP replies

use std::borrow::Cow;
use std::fmt;

/// SMTP reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SmtpReplyCode {
    ServiceReady = 220,
    ServiceClosingTransmissionChannel = 221,
    AuthenticationSuccessful = 235,
    Ok = 250,
    ContinueWithAuth = 334,
    StartMailInput = 354,
    InsufficientStorage = 452,
    ClientNotPermitted = 454,
    CommandUnrecognized = 500,
    SyntaxError = 501,
    CommandNotImplemented = 502,
    BadSequence = 503,
    AuthenticationRequired = 530,
    AuthenticationFailed = 535,
    MailboxUnavailable = 550,
    SizeLimitExceeded = 552,
    MailboxNameNotAllowed = 553,
    TransactionFailed = 554,
}

impl SmtpReplyCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn is_positive(self) -> bool {
        self.as_u16() < 400
    }
}

impl fmt::Display for SmtpReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// A reply code with its human readable text.
///
/// Text containing newlines is sent as a multi-line reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    code: SmtpReplyCode,
    message: Cow<'static, str>,
}

impl SmtpResponse {
    pub const OK: Self = Self::fixed(SmtpReplyCode::Ok, "Ok");
    pub const SERVICE_CLOSING: Self =
        Self::fixed(SmtpReplyCode::ServiceClosingTransmissionChannel, "bye");
    pub const AUTHENTICATION_SUCCESSFUL: Self = Self::fixed(
        SmtpReplyCode::AuthenticationSuccessful,
        "2.7.0 Authentication successful",
    );
    pub const START_MAIL_INPUT: Self =
        Self::fixed(SmtpReplyCode::StartMailInput, "end message with <CRLF>.<CRLF>");
    pub const SYNTAX_ERROR: Self = Self::fixed(SmtpReplyCode::SyntaxError, "syntax error");
    pub const COMMAND_NOT_IMPLEMENTED: Self =
        Self::fixed(SmtpReplyCode::CommandNotImplemented, "command not implemented");
    pub const BAD_SEQUENCE: Self =
        Self::fixed(SmtpReplyCode::BadSequence, "bad sequence of commands");
    pub const TLS_NOT_AVAILABLE: Self =
        Self::fixed(SmtpReplyCode::ClientNotPermitted, "4.7.0 TLS not available");
    pub const AUTHENTICATION_REQUIRED: Self = Self::fixed(
        SmtpReplyCode::AuthenticationRequired,
        "5.7.0 Authentication required",
    );
    pub const AUTHENTICATION_FAILED: Self = Self::fixed(
        SmtpReplyCode::AuthenticationFailed,
        "5.7.8 Authentication credentials invalid",
    );
    pub const MAILBOX_UNAVAILABLE: Self =
        Self::fixed(SmtpReplyCode::MailboxUnavailable, "mailbox unavailable");
    pub const MAILBOX_TEMPORARILY_UNAVAILABLE: Self = Self::fixed(
        SmtpReplyCode::InsufficientStorage,
        "mailbox temporarily unavailable, try again later",
    );
    pub const TOO_MANY_RECIPIENTS: Self =
        Self::fixed(SmtpReplyCode::InsufficientStorage, "4.5.3 too many recipients");
    pub const SIZE_LIMIT_EXCEEDED: Self =
        Self::fixed(SmtpReplyCode::SizeLimitExceeded, "message size exceeds fixed maximum");
    pub const MAILBOX_NAME_NOT_ALLOWED: Self =
        Self::fixed(SmtpReplyCode::MailboxNameNotAllowed, "mailbox name not allowed");
    pub const TRANSACTION_FAILED: Self =
        Self::fixed(SmtpReplyCode::TransactionFailed, "transaction failed");

    const fn fixed(code: SmtpReplyCode, message: &'static str) -> Self {
        Self {
            code,
            message: Cow::Borrowed(message),
        }
    }

    /// Create a response
    pub fn new(code: SmtpReplyCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create a multi-line response (last line has space after code)
    pub fn multi_line<I, S>(code: SmtpReplyCode, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lines: Vec<String> = lines.into_iter().map(|l| l.as_ref().to_string()).collect();
        Self::new(code, lines.join("\n"))
    }

    pub fn code(&self) -> SmtpReplyCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Same code, different text
    pub fn with_message(&self, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(self.code, message)
    }

    /// Encode for the wire, one `NNN-text` line per continuation and a final
    /// `NNN text` line.
    pub fn to_wire(&self) -> String {
        let lines: Vec<&str> = if self.message.is_empty() {
            vec![""]
        } else {
            self.message.lines().collect()
        };

        let mut result = String::new();
        for (i, line) in lines.iter().enumerate() {
            let separator = if i + 1 < lines.len() { '-' } else { ' ' };
            result.push_str(&format!("{}{separator}{line}\r\n", self.code));
        }
        result
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}
