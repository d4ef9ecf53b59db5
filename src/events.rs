//! Session lifecycle hooks

use crate::proto::{SmtpCommand, SmtpResponse};
use crate::session::{MessageTransaction, SessionInfo};
use tracing::{debug, info, trace, warn};

/// Observer invoked synchronously at fixed points of every session.
/// All methods default to doing nothing.
pub trait SessionObserver: Send + Sync {
    /// The connection is accepted and about to be greeted
    fn on_session_created(&self, _session: &SessionInfo) {}

    /// A command parsed and is about to run
    fn on_command_executing(&self, _session: &SessionInfo, _command: &SmtpCommand) {}

    /// The client authenticated as `user`
    fn on_authenticated(&self, _session: &SessionInfo, _user: &str) {}

    /// The message store answered for a completed transaction
    fn on_message_stored(
        &self,
        _session: &SessionInfo,
        _transaction: &MessageTransaction,
        _response: &SmtpResponse,
    ) {
    }

    /// The session is over, whatever the reason
    fn on_session_completed(&self, _session: &SessionInfo) {}
}

/// Emits `tracing` events for each hook
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn on_session_created(&self, session: &SessionInfo) {
        debug!(
            "[{}] Session started from {}",
            session.id,
            session.remote_description()
        );
    }

    fn on_command_executing(&self, session: &SessionInfo, command: &SmtpCommand) {
        trace!("[{}] C: {}", session.id, command);
    }

    fn on_authenticated(&self, session: &SessionInfo, user: &str) {
        info!(
            "[{}] User {} authenticated from {}",
            session.id,
            user,
            session.remote_description()
        );
    }

    fn on_message_stored(
        &self,
        session: &SessionInfo,
        transaction: &MessageTransaction,
        response: &SmtpResponse,
    ) {
        let from = transaction.from.as_ref().map(ToString::to_string).unwrap_or_default();
        if response.code().is_positive() {
            info!(
                "[{}] Message from <{}> to {} recipient(s), {} bytes: {}",
                session.id,
                from,
                transaction.to.len(),
                transaction.body.len(),
                response
            );
        } else {
            warn!(
                "[{}] Message from <{}> not stored: {}",
                session.id, from, response
            );
        }
    }

    fn on_session_completed(&self, session: &SessionInfo) {
        debug!("[{}] Session ended", session.id);
    }
}
