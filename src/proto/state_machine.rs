//! SMTP command sequencing
//!
//! Each session state owns an ordered table of verbs mapped to the parser
//! for that verb and the state a successful command leads to. The table is
//! built once per session from the endpoint's capabilities and changes
//! exactly once more, when the client authenticates.

use super::parser::{
    try_make_auth, try_make_data, try_make_ehlo, try_make_helo, try_make_mail, try_make_noop,
    try_make_quit, try_make_rcpt, try_make_rset, try_make_start_tls, ParseResult,
};
use super::response::{SmtpReplyCode, SmtpResponse};
use super::tokens::TokenEnumerator;
use std::fmt;

/// Parser bound to a verb
pub type ParseFn = fn(&mut TokenEnumerator<'_>) -> ParseResult;

/// Verbs this server knows but never implements
const UNIMPLEMENTED_VERBS: &[&str] = &["VRFY", "EXPN", "HELP", "TURN", "BDAT"];

/// Verbs that appear in some state's table
const KNOWN_VERBS: &[&str] = &[
    "HELO", "EHLO", "MAIL", "RCPT", "DATA", "RSET", "NOOP", "QUIT", "AUTH", "STARTTLS",
];

/// Session phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtpState {
    Initialized,
    WaitingForMail,
    WaitingForMailSecure,
    WithinTransaction,
    CanAcceptData,
}

impl SmtpState {
    fn index(self) -> usize {
        match self {
            Self::Initialized => 0,
            Self::WaitingForMail => 1,
            Self::WaitingForMailSecure => 2,
            Self::WithinTransaction => 3,
            Self::CanAcceptData => 4,
        }
    }
}

impl fmt::Display for SmtpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy)]
struct Action {
    parse: ParseFn,
    /// `None` keeps the current state
    transition: Option<SmtpState>,
}

#[derive(Clone, Default)]
struct State {
    actions: Vec<(&'static str, Action)>,
}

impl State {
    fn on(mut self, verb: &'static str, parse: ParseFn, transition: Option<SmtpState>) -> Self {
        self.actions.push((verb, Action { parse, transition }));
        self
    }

    fn on_if(self, condition: bool, verb: &'static str, parse: ParseFn, transition: Option<SmtpState>) -> Self {
        if condition {
            self.on(verb, parse, transition)
        } else {
            self
        }
    }

    fn action(&self, verb: &str) -> Option<Action> {
        self.actions
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(verb))
            .map(|(_, action)| *action)
    }

    fn replace(&mut self, verb: &str, parse: ParseFn) {
        for (name, action) in &mut self.actions {
            if *name == verb {
                action.parse = parse;
            }
        }
    }

    fn remove(&mut self, verb: &str) {
        self.actions.retain(|(name, _)| *name != verb);
    }

    fn verbs(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.actions.iter().map(|(name, _)| *name)
    }
}

/// Capabilities that shape the command table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateMachineOptions {
    /// A certificate can be supplied for STARTTLS
    pub certificate_available: bool,
    /// An authenticator is configured
    pub authentication_available: bool,
    /// MAIL is refused until the client authenticates
    pub authentication_required: bool,
    /// AUTH is offered over a plaintext channel
    pub allow_unsecure_authentication: bool,
    /// The channel is already encrypted (implicit TLS)
    pub secure: bool,
}

/// MAIL while authentication is still outstanding. Syntax errors take
/// precedence so the client learns about both problems in order.
fn try_make_mail_unauthenticated(tokens: &mut TokenEnumerator<'_>) -> ParseResult {
    try_make_mail(tokens)?;
    Err(SmtpResponse::AUTHENTICATION_REQUIRED)
}

/// The per-session command table and current state.
///
/// [`try_accept`](Self::try_accept) records the transition a command asks
/// for; the session applies it with [`commit`](Self::commit) once the
/// command has executed successfully, or drops it with
/// [`discard`](Self::discard).
pub struct SmtpStateMachine {
    states: [State; 5],
    state: SmtpState,
    pending: Option<SmtpState>,
    options: StateMachineOptions,
    secure: bool,
    authenticated: bool,
}

impl SmtpStateMachine {
    pub fn new(options: StateMachineOptions) -> Self {
        use SmtpState::*;

        let mail: ParseFn = if options.authentication_required {
            try_make_mail_unauthenticated
        } else {
            try_make_mail
        };
        let auth_available = options.authentication_available;

        let initialized = State::default()
            .on("NOOP", try_make_noop, None)
            .on("RSET", try_make_rset, None)
            .on("QUIT", try_make_quit, None)
            .on("HELO", try_make_helo, Some(WaitingForMail))
            .on("EHLO", try_make_ehlo, Some(WaitingForMail));

        let waiting_for_mail = State::default()
            .on("NOOP", try_make_noop, None)
            .on("RSET", try_make_rset, None)
            .on("QUIT", try_make_quit, None)
            .on("HELO", try_make_helo, Some(WaitingForMail))
            .on("EHLO", try_make_ehlo, Some(WaitingForMail))
            .on("MAIL", mail, Some(WithinTransaction))
            .on_if(
                options.certificate_available && !options.secure,
                "STARTTLS",
                try_make_start_tls,
                Some(WaitingForMailSecure),
            )
            .on_if(
                auth_available && options.allow_unsecure_authentication,
                "AUTH",
                try_make_auth,
                None,
            );

        let waiting_for_mail_secure = State::default()
            .on("NOOP", try_make_noop, None)
            .on("RSET", try_make_rset, None)
            .on("QUIT", try_make_quit, None)
            .on("HELO", try_make_helo, Some(WaitingForMailSecure))
            .on("EHLO", try_make_ehlo, Some(WaitingForMailSecure))
            .on("MAIL", mail, Some(WithinTransaction))
            .on_if(auth_available, "AUTH", try_make_auth, None);

        let within_transaction = State::default()
            .on("NOOP", try_make_noop, None)
            .on("RSET", try_make_rset, Some(WaitingForMail))
            .on("QUIT", try_make_quit, None)
            .on("RCPT", try_make_rcpt, Some(CanAcceptData));

        let can_accept_data = State::default()
            .on("NOOP", try_make_noop, None)
            .on("RSET", try_make_rset, Some(WaitingForMail))
            .on("QUIT", try_make_quit, None)
            .on("RCPT", try_make_rcpt, None)
            .on("DATA", try_make_data, Some(WaitingForMail));

        Self {
            states: [
                initialized,
                waiting_for_mail,
                waiting_for_mail_secure,
                within_transaction,
                can_accept_data,
            ],
            state: Initialized,
            pending: None,
            options,
            secure: options.secure,
            authenticated: false,
        }
    }

    pub fn state(&self) -> SmtpState {
        self.state
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Whether EHLO should advertise STARTTLS
    pub fn offers_start_tls(&self) -> bool {
        self.options.certificate_available && !self.secure
    }

    /// Whether EHLO should advertise AUTH
    pub fn offers_authentication(&self) -> bool {
        self.options.authentication_available
            && !self.authenticated
            && (self.secure || self.options.allow_unsecure_authentication)
    }

    /// Verbs legal in the current state, in table order
    pub fn expected(&self) -> Vec<&'static str> {
        self.current().verbs().collect()
    }

    fn current(&self) -> &State {
        &self.states[self.state.index()]
    }

    fn resolve(&self, destination: SmtpState) -> SmtpState {
        match destination {
            SmtpState::WaitingForMail if self.secure => SmtpState::WaitingForMailSecure,
            other => other,
        }
    }

    /// Parse the command on `tokens` if its verb is legal in the current
    /// state. A rejected or malformed command leaves the state untouched.
    pub fn try_accept(&mut self, tokens: &mut TokenEnumerator<'_>) -> ParseResult {
        self.pending = None;

        let verb = tokens.peek().text().into_owned();
        let Some(action) = self.current().action(&verb) else {
            return Err(self.reject_verb(&verb));
        };

        let command = (action.parse)(tokens)?;
        self.pending = Some(self.resolve(action.transition.unwrap_or(self.state)));
        Ok(command)
    }

    /// Apply the transition recorded by the last accepted command
    pub fn commit(&mut self) {
        if let Some(next) = self.pending.take() {
            self.state = next;
        }
    }

    /// Drop the transition recorded by the last accepted command
    pub fn discard(&mut self) {
        self.pending = None;
    }

    /// Authentication succeeded: AUTH is no longer offered and, where it
    /// was mandatory, MAIL is unlocked.
    pub fn on_authenticated(&mut self) {
        self.authenticated = true;
        for state in [SmtpState::WaitingForMail, SmtpState::WaitingForMailSecure] {
            let table = &mut self.states[state.index()];
            table.remove("AUTH");
            if self.options.authentication_required {
                table.replace("MAIL", try_make_mail);
            }
        }
    }

    /// The channel has been upgraded to TLS
    pub fn on_secured(&mut self) {
        self.secure = true;
        self.state = self.resolve(self.state);
    }

    fn reject_verb(&self, verb: &str) -> SmtpResponse {
        let verb = verb.to_ascii_uppercase();
        let expected = self.expected().join("/");

        let (code, reason) = if KNOWN_VERBS.contains(&verb.as_str()) {
            (SmtpReplyCode::BadSequence, "bad sequence of commands")
        } else if UNIMPLEMENTED_VERBS.contains(&verb.as_str()) {
            (SmtpReplyCode::CommandNotImplemented, "command not implemented")
        } else {
            (SmtpReplyCode::CommandUnrecognized, "command unrecognized")
        };
        SmtpResponse::new(code, format!("{reason}, expected {expected}"))
    }
}

impl fmt::Debug for SmtpStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpStateMachine")
            .field("state", &self.state)
            .field("expected", &self.expected())
            .field("secure", &self.secure)
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::buffer::ByteBuffer;
    use crate::proto::command::SmtpCommand;

    fn accept(machine: &mut SmtpStateMachine, line: &'static str) -> ParseResult {
        let buffer = ByteBuffer::from(line.as_bytes());
        let mut tokens = TokenEnumerator::from_buffer(&buffer);
        let result = machine.try_accept(&mut tokens);
        machine.commit();
        result
    }

    fn code(result: ParseResult) -> SmtpReplyCode {
        result.expect_err("command should be rejected").code()
    }

    #[test]
    fn test_initialized_accepts_only_greeting_verbs() {
        let mut machine = SmtpStateMachine::new(StateMachineOptions::default());
        assert_eq!(machine.expected(), vec!["NOOP", "RSET", "QUIT", "HELO", "EHLO"]);

        assert_eq!(code(accept(&mut machine, "MAIL FROM:<a@x.com>")), SmtpReplyCode::BadSequence);
        assert_eq!(machine.state(), SmtpState::Initialized);

        assert!(accept(&mut machine, "NOOP").is_ok());
        assert!(accept(&mut machine, "RSET").is_ok());
        assert_eq!(machine.state(), SmtpState::Initialized);

        assert!(accept(&mut machine, "HELO client.example.com").is_ok());
        assert_eq!(machine.state(), SmtpState::WaitingForMail);
        assert!(accept(&mut machine, "MAIL FROM:<a@x.com>").is_ok());
        assert_eq!(machine.state(), SmtpState::WithinTransaction);
    }

    #[test]
    fn test_transaction_sequence() {
        let mut machine = SmtpStateMachine::new(StateMachineOptions::default());
        accept(&mut machine, "EHLO client").unwrap();
        accept(&mut machine, "MAIL FROM:<a@x.com>").unwrap();
        assert_eq!(code(accept(&mut machine, "DATA")), SmtpReplyCode::BadSequence);

        accept(&mut machine, "RCPT TO:<b@y.com>").unwrap();
        assert_eq!(machine.state(), SmtpState::CanAcceptData);
        accept(&mut machine, "RCPT TO:<c@y.com>").unwrap();
        assert_eq!(machine.state(), SmtpState::CanAcceptData);

        assert_eq!(accept(&mut machine, "DATA").unwrap(), SmtpCommand::Data);
        assert_eq!(machine.state(), SmtpState::WaitingForMail);
    }

    #[test]
    fn test_rset_returns_to_mail_acceptable_state() {
        let mut machine = SmtpStateMachine::new(StateMachineOptions::default());
        accept(&mut machine, "EHLO client").unwrap();
        accept(&mut machine, "MAIL FROM:<a@x.com>").unwrap();
        accept(&mut machine, "RSET").unwrap();
        assert_eq!(machine.state(), SmtpState::WaitingForMail);

        accept(&mut machine, "MAIL FROM:<a@x.com>").unwrap();
        accept(&mut machine, "RCPT TO:<b@y.com>").unwrap();
        accept(&mut machine, "RSET").unwrap();
        assert_eq!(machine.state(), SmtpState::WaitingForMail);
    }

    #[test]
    fn test_unknown_and_unimplemented_verbs() {
        let mut machine = SmtpStateMachine::new(StateMachineOptions::default());
        let response = accept(&mut machine, "XYZZY").unwrap_err();
        assert_eq!(response.code(), SmtpReplyCode::CommandUnrecognized);
        assert_eq!(
            response.message(),
            "command unrecognized, expected NOOP/RSET/QUIT/HELO/EHLO"
        );

        assert_eq!(code(accept(&mut machine, "VRFY postmaster")), SmtpReplyCode::CommandNotImplemented);
        assert_eq!(code(accept(&mut machine, "bdat 100 LAST")), SmtpReplyCode::CommandNotImplemented);
        assert_eq!(code(accept(&mut machine, "")), SmtpReplyCode::CommandUnrecognized);
    }

    #[test]
    fn test_failed_parse_keeps_state() {
        let mut machine = SmtpStateMachine::new(StateMachineOptions::default());
        accept(&mut machine, "HELO client").unwrap();
        assert_eq!(code(accept(&mut machine, "MAIL FROM:cain")), SmtpReplyCode::SyntaxError);
        assert_eq!(machine.state(), SmtpState::WaitingForMail);
    }

    #[test]
    fn test_discard_drops_pending_transition() {
        let mut machine = SmtpStateMachine::new(StateMachineOptions::default());
        accept(&mut machine, "HELO client").unwrap();

        let buffer = ByteBuffer::from(&b"MAIL FROM:<a@x.com>"[..]);
        let mut tokens = TokenEnumerator::from_buffer(&buffer);
        machine.try_accept(&mut tokens).unwrap();
        machine.discard();
        machine.commit();
        assert_eq!(machine.state(), SmtpState::WaitingForMail);
    }

    #[test]
    fn test_authentication_required_unlocks_mail() {
        let mut machine = SmtpStateMachine::new(StateMachineOptions {
            authentication_available: true,
            authentication_required: true,
            allow_unsecure_authentication: true,
            ..Default::default()
        });
        accept(&mut machine, "EHLO client").unwrap();
        assert!(machine.offers_authentication());

        let response = accept(&mut machine, "MAIL FROM:<a@x.com>").unwrap_err();
        assert_eq!(response.code(), SmtpReplyCode::AuthenticationRequired);
        assert_eq!(code(accept(&mut machine, "MAIL FROM:cain")), SmtpReplyCode::SyntaxError);

        assert!(accept(&mut machine, "AUTH PLAIN").is_ok());
        machine.on_authenticated();
        assert!(!machine.offers_authentication());
        assert!(!machine.expected().contains(&"AUTH"));
        assert_eq!(code(accept(&mut machine, "AUTH PLAIN")), SmtpReplyCode::BadSequence);

        assert!(accept(&mut machine, "MAIL FROM:<a@x.com>").is_ok());
        assert_eq!(machine.state(), SmtpState::WithinTransaction);
    }

    #[test]
    fn test_auth_over_plaintext_needs_permission() {
        let mut machine = SmtpStateMachine::new(StateMachineOptions {
            authentication_available: true,
            certificate_available: true,
            ..Default::default()
        });
        accept(&mut machine, "EHLO client").unwrap();
        assert!(!machine.offers_authentication());
        assert!(machine.offers_start_tls());
        assert_eq!(code(accept(&mut machine, "AUTH LOGIN")), SmtpReplyCode::BadSequence);

        assert_eq!(accept(&mut machine, "STARTTLS").unwrap(), SmtpCommand::StartTls);
        machine.on_secured();
        assert_eq!(machine.state(), SmtpState::WaitingForMailSecure);
        assert!(machine.offers_authentication());
        assert!(!machine.offers_start_tls());
        assert!(accept(&mut machine, "AUTH LOGIN").is_ok());
    }

    #[test]
    fn test_secure_sessions_never_return_to_plain_state() {
        let mut machine = SmtpStateMachine::new(StateMachineOptions {
            certificate_available: true,
            secure: true,
            ..Default::default()
        });
        accept(&mut machine, "EHLO client").unwrap();
        assert_eq!(machine.state(), SmtpState::WaitingForMailSecure);
        assert_eq!(code(accept(&mut machine, "STARTTLS")), SmtpReplyCode::BadSequence);

        accept(&mut machine, "MAIL FROM:<a@x.com>").unwrap();
        accept(&mut machine, "RSET").unwrap();
        assert_eq!(machine.state(), SmtpState::WaitingForMailSecure);
    }

    #[test]
    fn test_starttls_requires_certificate() {
        let mut machine = SmtpStateMachine::new(StateMachineOptions::default());
        accept(&mut machine, "EHLO client").unwrap();
        assert!(!machine.offers_start_tls());
        assert_eq!(code(accept(&mut machine, "STARTTLS")), SmtpReplyCode::BadSequence);
    }
}
