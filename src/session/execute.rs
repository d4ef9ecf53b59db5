//! Command execution
//!
//! Each executor returns `Ok(true)` when the state machine should move on,
//! `Ok(false)` when it should stay put, and `Err(Error::Response)` to answer
//! with a specific reply (optionally closing the session).

use super::{cancellable, SessionContext};
use crate::auth::{decode_text, encode_challenge, Credentials};
use crate::filter::MailboxFilterResult;
use crate::proto::parser::{try_make_base64, try_make_end};
use crate::proto::{
    AuthenticationMethod, EsmtpParameters, Mailbox, SmtpCommand, SmtpReplyCode, SmtpResponse,
    TokenEnumerator,
};
use crate::{Error, Result};
use tracing::{debug, warn};

impl SessionContext {
    pub(super) async fn execute(&mut self, command: SmtpCommand) -> Result<bool> {
        match command {
            SmtpCommand::Helo { domain } => self.execute_helo(domain, false).await,
            SmtpCommand::Ehlo { domain } => self.execute_helo(domain, true).await,
            SmtpCommand::Mail { from, parameters } => self.execute_mail(from, parameters).await,
            SmtpCommand::Rcpt { to, .. } => self.execute_rcpt(to).await,
            SmtpCommand::Data => self.execute_data().await,
            SmtpCommand::Rset => {
                self.transaction.reset();
                self.reply(&SmtpResponse::OK).await?;
                Ok(true)
            }
            SmtpCommand::Noop => {
                self.reply(&SmtpResponse::OK).await?;
                Ok(true)
            }
            SmtpCommand::Quit => {
                self.quit = true;
                Err(Error::quit(SmtpResponse::SERVICE_CLOSING))
            }
            SmtpCommand::Auth {
                method,
                initial_response,
            } => self.execute_auth(method, initial_response).await,
            SmtpCommand::StartTls => self.execute_start_tls().await,
            SmtpCommand::Proxy(_) => Err(Error::response(SmtpResponse::BAD_SEQUENCE)),
        }
    }

    async fn execute_helo(&mut self, domain: String, extended: bool) -> Result<bool> {
        self.transaction.reset();
        self.info.extended = extended;

        let greeting = format!("{} Hello {}", self.options.hostname, domain);
        let response = if extended {
            SmtpResponse::multi_line(
                SmtpReplyCode::Ok,
                std::iter::once(greeting).chain(self.capabilities()),
            )
        } else {
            SmtpResponse::new(SmtpReplyCode::Ok, greeting)
        };
        self.info.helo = Some(domain);

        self.reply(&response).await?;
        Ok(true)
    }

    /// EHLO keywords for the current session state
    fn capabilities(&self) -> Vec<String> {
        let mut capabilities = vec!["PIPELINING".to_string()];
        if self.state_machine.offers_start_tls() {
            capabilities.push("STARTTLS".into());
        }
        if let Some(max) = self.options.max_message_size {
            capabilities.push(format!("SIZE {max}"));
        }
        if self.state_machine.offers_authentication() {
            capabilities.push("AUTH PLAIN LOGIN".into());
        }
        capabilities.push("8BITMIME".into());
        capabilities.push("SMTPUTF8".into());
        capabilities
    }

    async fn execute_mail(&mut self, from: Mailbox, parameters: EsmtpParameters) -> Result<bool> {
        self.transaction.reset();

        let size = declared_size(&parameters).map_err(Error::response)?;
        if let (Some(size), Some(max)) = (size, self.options.max_message_size) {
            if size > max {
                return Err(Error::response(SmtpResponse::SIZE_LIMIT_EXCEEDED));
            }
        }

        let filter = self.services.mailbox_filter.clone();
        let verdict = cancellable(&self.cancel, filter.can_accept_from(&self.info, &from, size)).await?;
        match verdict {
            MailboxFilterResult::Accept => {}
            MailboxFilterResult::TemporaryReject => {
                return Err(Error::response(SmtpResponse::MAILBOX_TEMPORARILY_UNAVAILABLE))
            }
            MailboxFilterResult::PermanentReject => {
                return Err(Error::response(SmtpResponse::MAILBOX_NAME_NOT_ALLOWED))
            }
            MailboxFilterResult::SizeExceeded => {
                return Err(Error::response(SmtpResponse::SIZE_LIMIT_EXCEEDED))
            }
        }

        self.transaction.from = Some(from);
        self.transaction.parameters = parameters;
        self.reply(&SmtpResponse::OK).await?;
        Ok(true)
    }

    async fn execute_rcpt(&mut self, to: Mailbox) -> Result<bool> {
        if self.transaction.to.len() >= self.options.max_recipients {
            return Err(Error::response(SmtpResponse::TOO_MANY_RECIPIENTS));
        }

        let from = self.transaction.from.clone().unwrap_or_else(Mailbox::empty);
        let filter = self.services.mailbox_filter.clone();
        let verdict = cancellable(&self.cancel, filter.can_deliver_to(&self.info, &to, &from)).await?;
        let response = match verdict {
            MailboxFilterResult::Accept => None,
            MailboxFilterResult::TemporaryReject => Some(SmtpResponse::MAILBOX_TEMPORARILY_UNAVAILABLE),
            MailboxFilterResult::PermanentReject => Some(SmtpResponse::MAILBOX_UNAVAILABLE),
            MailboxFilterResult::SizeExceeded => Some(SmtpResponse::SIZE_LIMIT_EXCEEDED),
        };
        if let Some(response) = response {
            debug!("[{}] Recipient {} refused: {}", self.info.id, to, response);
            return Err(Error::response(response));
        }

        self.transaction.to.push(to);
        self.reply(&SmtpResponse::OK).await?;
        Ok(true)
    }

    async fn execute_data(&mut self) -> Result<bool> {
        self.reply(&SmtpResponse::START_MAIL_INPUT).await?;

        let block = match self.stream.read_dot_block(self.options.max_message_size).await {
            Ok(block) => block,
            Err(Error::Response { response, .. }) => {
                debug!("[{}] Message refused: {}", self.info.id, response);
                self.transaction.reset();
                self.reply(&response).await?;
                return Ok(true);
            }
            Err(e) => return Err(e),
        };
        if !block.complete {
            debug!("[{}] Connection closed during DATA", self.info.id);
            self.quit = true;
            return Ok(false);
        }
        self.transaction.body = block.buffer.freeze();

        let store = self.services.message_store.clone();
        let saved = cancellable(&self.cancel, store.save(&self.info, &self.transaction)).await?;
        let response = saved.unwrap_or_else(|e| {
            warn!("[{}] Failed to store message: {}", self.info.id, e);
            SmtpResponse::TRANSACTION_FAILED
        });

        self.services
            .observer
            .on_message_stored(&self.info, &self.transaction, &response);
        self.transaction.reset();
        self.reply(&response).await?;
        Ok(true)
    }

    async fn execute_start_tls(&mut self) -> Result<bool> {
        let Some(factory) = self.services.certificate_factory.clone() else {
            return Err(Error::response(SmtpResponse::TLS_NOT_AVAILABLE));
        };
        let config = match cancellable(&self.cancel, factory.server_config(&self.info)).await? {
            Ok(config) => config,
            Err(e) => {
                warn!("[{}] No certificate for STARTTLS: {}", self.info.id, e);
                return Err(Error::response(SmtpResponse::TLS_NOT_AVAILABLE));
            }
        };

        self.reply(&SmtpResponse::new(SmtpReplyCode::ServiceReady, "Ready to start TLS"))
            .await?;
        self.stream.start_tls(config).await?;

        self.info.secure = true;
        self.info.helo = None;
        self.info.extended = false;
        self.transaction.reset();
        self.state_machine.on_secured();
        debug!("[{}] STARTTLS completed", self.info.id);
        Ok(true)
    }

    async fn execute_auth(
        &mut self,
        method: AuthenticationMethod,
        initial_response: Option<String>,
    ) -> Result<bool> {
        let Some(authenticator) = self.services.authenticator.clone() else {
            return Err(Error::response(SmtpResponse::COMMAND_NOT_IMPLEMENTED));
        };

        let credentials = match method {
            AuthenticationMethod::Plain => {
                let encoded = match initial_response {
                    Some(encoded) => encoded,
                    None => self.challenge("").await?,
                };
                Credentials::from_plain(&encoded)
            }
            AuthenticationMethod::Login => {
                let user = self.challenge(&encode_challenge("Username:")).await?;
                let password = self.challenge(&encode_challenge("Password:")).await?;
                decode_text(&user)
                    .zip(decode_text(&password))
                    .filter(|(user, _)| !user.is_empty())
                    .map(|(user, password)| Credentials::new(user, password))
            }
        };
        let Some(credentials) = credentials else {
            return Err(Error::response(SmtpResponse::new(
                SmtpReplyCode::SyntaxError,
                "malformed credentials",
            )));
        };

        if cancellable(&self.cancel, authenticator.authenticate(&self.info, &credentials)).await? {
            self.authentication_attempts = 0;
            self.info.authenticated_user = Some(credentials.user.clone());
            self.state_machine.on_authenticated();
            self.services
                .observer
                .on_authenticated(&self.info, &credentials.user);
            self.reply(&SmtpResponse::AUTHENTICATION_SUCCESSFUL).await?;
            return Ok(true);
        }

        self.authentication_attempts += 1;
        if self.authentication_attempts >= self.options.max_authentication_attempts {
            warn!(
                "[{}] Too many failed authentication attempts from {}",
                self.info.id,
                self.info.remote_description()
            );
            return Err(Error::quit(SmtpResponse::AUTHENTICATION_FAILED));
        }
        Err(Error::response(SmtpResponse::AUTHENTICATION_FAILED))
    }

    /// Send a `334` challenge and read the client's Base64 answer
    async fn challenge(&mut self, challenge: &str) -> Result<String> {
        self.reply(&SmtpResponse::new(SmtpReplyCode::ContinueWithAuth, challenge.to_string()))
            .await?;

        let line = self.read_command_line().await?;
        if !line.complete {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }

        let mut tokens = TokenEnumerator::from_buffer(&line.buffer);
        if tokens.peek().is_char(b'*') {
            tokens.take();
            if try_make_end(&mut tokens) {
                return Err(Error::response(SmtpResponse::new(
                    SmtpReplyCode::SyntaxError,
                    "authentication cancelled",
                )));
            }
        }

        match try_make_base64(&mut tokens) {
            Some(encoded) if try_make_end(&mut tokens) => Ok(encoded),
            _ => Err(Error::response(SmtpResponse::new(
                SmtpReplyCode::SyntaxError,
                "invalid Base64 response",
            ))),
        }
    }
}

/// The `SIZE=` value of a MAIL command, if present
fn declared_size(parameters: &EsmtpParameters) -> std::result::Result<Option<usize>, SmtpResponse> {
    match parameters.get("SIZE") {
        None => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| {
            SmtpResponse::new(SmtpReplyCode::SyntaxError, "invalid SIZE parameter")
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_size() {
        let mut parameters = EsmtpParameters::new();
        assert_eq!(declared_size(&parameters), Ok(None));

        parameters.insert("SIZE".into(), "1024".into());
        assert_eq!(declared_size(&parameters), Ok(Some(1024)));

        parameters.insert("SIZE".into(), "lots".into());
        let err = declared_size(&parameters).unwrap_err();
        assert_eq!(err.code(), SmtpReplyCode::SyntaxError);
    }
}
