//! Per-connection SMTP session
//!
//! A session reads one line at a time, lets the state machine turn it into
//! a command, executes the command and replies. Consecutive lines that do
//! not parse use up a retry budget; a command that parses refills it.

mod execute;

use crate::auth::UserAuthenticator;
use crate::config::{EndpointConfig, ServerConfig};
use crate::events::{SessionObserver, TracingObserver};
use crate::filter::{AcceptAllFilter, MailboxFilter};
use crate::proto::parser::try_make_proxy;
use crate::proto::{
    AsyncStream, Delimited, EsmtpParameters, Mailbox, SmtpCommand, SmtpReplyCode, SmtpResponse,
    SmtpStateMachine, SmtpStream, StateMachineOptions, TokenEnumerator,
};
use crate::store::MessageStore;
use crate::tls::CertificateFactory;
use crate::{Error, Result};
use bytes::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Longest wait for the closing reply and for the transport shutdown
const CLOSING_TIMEOUT: Duration = Duration::from_millis(500);

/// Settings a session runs under, merged from the server and endpoint
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub hostname: String,
    pub max_message_size: Option<usize>,
    pub max_recipients: usize,
    pub max_retry_count: usize,
    pub max_authentication_attempts: usize,
    pub network_buffer_size: usize,
    pub command_wait_timeout: Duration,
    pub implicit_tls: bool,
    pub authentication_required: bool,
    pub allow_unsecure_authentication: bool,
    pub proxy_protocol: bool,
}

impl SessionOptions {
    pub fn new(server: &ServerConfig, endpoint: &EndpointConfig) -> Self {
        Self {
            hostname: server.hostname.clone(),
            max_message_size: server.max_message_size,
            max_recipients: server.max_recipients,
            max_retry_count: server.max_retry_count,
            max_authentication_attempts: server.max_authentication_attempts,
            network_buffer_size: server.network_buffer_size,
            command_wait_timeout: server.command_wait_timeout(),
            implicit_tls: endpoint.implicit_tls,
            authentication_required: endpoint.authentication_required,
            allow_unsecure_authentication: endpoint.allow_unsecure_authentication,
            proxy_protocol: endpoint.proxy_protocol,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::new(&ServerConfig::default(), &EndpointConfig::default())
    }
}

/// Collaborators shared by every session of a server
#[derive(Clone)]
pub struct SessionServices {
    pub message_store: Arc<dyn MessageStore>,
    pub mailbox_filter: Arc<dyn MailboxFilter>,
    pub authenticator: Option<Arc<dyn UserAuthenticator>>,
    pub certificate_factory: Option<Arc<dyn CertificateFactory>>,
    pub observer: Arc<dyn SessionObserver>,
}

impl SessionServices {
    /// Accept-all filtering, no AUTH, no TLS, tracing observer
    pub fn new(message_store: Arc<dyn MessageStore>) -> Self {
        Self {
            message_store,
            mailbox_filter: Arc::new(AcceptAllFilter),
            authenticator: None,
            certificate_factory: None,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_mailbox_filter(mut self, filter: Arc<dyn MailboxFilter>) -> Self {
        self.mailbox_filter = filter;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn UserAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_certificate_factory(mut self, factory: Arc<dyn CertificateFactory>) -> Self {
        self.certificate_factory = Some(factory);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }
}

/// What is known about the peer
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub id: u64,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    /// Domain given with the last HELO/EHLO
    pub helo: Option<String>,
    /// The greeting was EHLO
    pub extended: bool,
    pub secure: bool,
    pub authenticated_user: Option<String>,
}

impl SessionInfo {
    pub fn new(id: u64, local_addr: Option<SocketAddr>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            id,
            local_addr,
            remote_addr,
            ..Default::default()
        }
    }

    /// Peer address for log lines
    pub fn remote_description(&self) -> String {
        self.remote_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".into())
    }
}

/// Envelope and content gathered between MAIL and the end of DATA
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageTransaction {
    pub from: Option<Mailbox>,
    pub to: Vec<Mailbox>,
    pub parameters: EsmtpParameters,
    pub body: Bytes,
}

impl MessageTransaction {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub(crate) struct SessionContext {
    stream: SmtpStream,
    transaction: MessageTransaction,
    state_machine: SmtpStateMachine,
    info: SessionInfo,
    quit: bool,
    authentication_attempts: usize,
    options: Arc<SessionOptions>,
    services: SessionServices,
    cancel: CancellationToken,
}

/// Run one SMTP session to completion over `stream`.
///
/// Returns `Ok` when the client quits, disconnects or runs out of retries.
/// Timeouts and cancellation are answered with a best-effort 221 and then
/// reported as errors.
pub async fn run_session(
    stream: impl AsyncStream + 'static,
    info: SessionInfo,
    options: Arc<SessionOptions>,
    services: SessionServices,
    cancel: CancellationToken,
) -> Result<()> {
    let mut context = SessionContext::new(stream, info, options, services, cancel);
    let result = context.run().await;

    let closing = match &result {
        Err(Error::Timeout) => Some("Timeout while waiting for input."),
        Err(Error::Cancelled) => Some("The session has been cancelled."),
        _ => None,
    };
    if let Some(message) = closing {
        let response = SmtpResponse::new(SmtpReplyCode::ServiceClosingTransmissionChannel, message);
        if let Err(e) = context.stream.write_final_reply(&response, CLOSING_TIMEOUT).await {
            debug!("[{}] Failed to send closing reply: {}", context.info.id, e);
        }
    }
    if let Err(e) = context.stream.shutdown(CLOSING_TIMEOUT).await {
        trace!("[{}] Shutdown: {}", context.info.id, e);
    }

    context.services.observer.on_session_completed(&context.info);
    result
}

/// Run a collaborator call unless the session is cancelled first
async fn cancellable<F: Future>(cancel: &CancellationToken, call: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        output = call => Ok(output),
    }
}

impl SessionContext {
    fn new(
        stream: impl AsyncStream + 'static,
        info: SessionInfo,
        options: Arc<SessionOptions>,
        services: SessionServices,
        cancel: CancellationToken,
    ) -> Self {
        let state_machine = SmtpStateMachine::new(StateMachineOptions {
            certificate_available: services.certificate_factory.is_some(),
            authentication_available: services.authenticator.is_some(),
            authentication_required: options.authentication_required,
            allow_unsecure_authentication: options.allow_unsecure_authentication,
            secure: options.implicit_tls,
        });
        let stream = SmtpStream::new(stream, options.network_buffer_size, cancel.clone())
            .with_timeout(options.command_wait_timeout);

        Self {
            stream,
            transaction: MessageTransaction::default(),
            state_machine,
            info,
            quit: false,
            authentication_attempts: 0,
            options,
            services,
            cancel,
        }
    }

    async fn run(&mut self) -> Result<()> {
        if self.options.proxy_protocol && !self.ingest_proxy_header().await? {
            return Ok(());
        }
        if self.options.implicit_tls {
            self.secure_channel().await?;
        }

        self.services.observer.on_session_created(&self.info);
        let greeting = SmtpResponse::new(
            SmtpReplyCode::ServiceReady,
            format!("{} ESMTP ready", self.options.hostname),
        );
        self.reply(&greeting).await?;

        let mut retries = self.options.max_retry_count;
        while retries > 0 && !self.quit {
            let line = match self.read_command_line().await {
                Ok(line) => line,
                Err(Error::Response {
                    response,
                    quit: false,
                }) => {
                    retries -= 1;
                    self.reply_with_retries(&response, retries).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !line.complete {
                debug!("[{}] Connection closed by client", self.info.id);
                return Ok(());
            }

            let mut tokens = TokenEnumerator::from_buffer(&line.buffer);
            let command = match self.state_machine.try_accept(&mut tokens) {
                Ok(command) => command,
                Err(response) => {
                    debug!(
                        "[{}] Rejected {:?}: {}",
                        self.info.id,
                        String::from_utf8_lossy(&line.buffer.to_contiguous()),
                        response
                    );
                    retries -= 1;
                    self.reply_with_retries(&response, retries).await?;
                    continue;
                }
            };

            retries = self.options.max_retry_count;
            self.services.observer.on_command_executing(&self.info, &command);

            match self.execute(command).await {
                Ok(true) => self.state_machine.commit(),
                Ok(false) => self.state_machine.discard(),
                Err(Error::Response { response, quit }) => {
                    self.state_machine.discard();
                    if quit {
                        // The peer may already be gone.
                        if let Err(e) = self.stream.write_reply(&response).await {
                            debug!("[{}] Failed to send final reply: {}", self.info.id, e);
                        }
                        self.quit = true;
                    } else {
                        self.reply(&response).await?;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if retries == 0 {
            debug!("[{}] Too many invalid commands", self.info.id);
        }
        Ok(())
    }

    /// Read one command line within the idle timeout
    async fn read_command_line(&mut self) -> Result<Delimited> {
        tokio::time::timeout(self.options.command_wait_timeout, self.stream.read_line())
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn reply(&mut self, response: &SmtpResponse) -> Result<()> {
        trace!("[{}] S: {}", self.info.id, response);
        self.stream.write_reply(response).await
    }

    async fn reply_with_retries(&mut self, response: &SmtpResponse, retries: usize) -> Result<()> {
        let annotated = response.with_message(format!(
            "{}, {} retry(ies) remaining.",
            response.message(),
            retries
        ));
        self.reply(&annotated).await
    }

    /// Consume the PROXY header. Returns `false` if the session must end.
    async fn ingest_proxy_header(&mut self) -> Result<bool> {
        let line = match self.read_command_line().await {
            Ok(line) => line,
            Err(Error::Response { .. }) => {
                warn!("[{}] Oversized PROXY header", self.info.id);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        if !line.complete {
            return Ok(false);
        }

        let mut tokens = TokenEnumerator::from_buffer(&line.buffer);
        match try_make_proxy(&mut tokens) {
            Ok(SmtpCommand::Proxy(proxy)) => {
                debug!("[{}] PROXY {:?}", self.info.id, proxy);
                if let Some(source) = proxy.source {
                    self.info.remote_addr = Some(source);
                }
                if let Some(destination) = proxy.destination {
                    self.info.local_addr = Some(destination);
                }
                Ok(true)
            }
            _ => {
                warn!(
                    "[{}] Missing or malformed PROXY header from {}",
                    self.info.id,
                    self.info.remote_description()
                );
                Ok(false)
            }
        }
    }

    /// Upgrade the transport to TLS and mark the session secure
    async fn secure_channel(&mut self) -> Result<()> {
        let Some(factory) = self.services.certificate_factory.clone() else {
            return Err(Error::Tls("no certificate available".into()));
        };
        let config = cancellable(&self.cancel, factory.server_config(&self.info)).await??;
        self.stream.start_tls(config).await?;
        self.info.secure = true;
        self.state_machine.on_secured();
        debug!("[{}] TLS established", self.info.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_reset() {
        let mut transaction = MessageTransaction {
            from: Some(Mailbox::new("a", "x.com")),
            to: vec![Mailbox::new("b", "y.com")],
            parameters: EsmtpParameters::from([("SIZE".to_string(), "10".to_string())]),
            body: Bytes::from_static(b"body"),
        };
        transaction.reset();
        assert_eq!(transaction, MessageTransaction::default());
        assert!(transaction.from.is_none());
        assert!(transaction.to.is_empty());
    }

    #[test]
    fn test_options_merge_endpoint() {
        let server = ServerConfig {
            hostname: "mx.test".into(),
            max_message_size: Some(1024),
            ..Default::default()
        };
        let endpoint = EndpointConfig {
            authentication_required: true,
            proxy_protocol: true,
            ..Default::default()
        };
        let options = SessionOptions::new(&server, &endpoint);
        assert_eq!(options.hostname, "mx.test");
        assert_eq!(options.max_message_size, Some(1024));
        assert!(options.authentication_required);
        assert!(options.proxy_protocol);
        assert!(!options.implicit_tls);
    }
}
