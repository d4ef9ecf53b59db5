//! Sender and recipient policy

use crate::proto::Mailbox;
use crate::session::SessionInfo;
use async_trait::async_trait;

/// Verdict on a sender or recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxFilterResult {
    Accept,
    TemporaryReject,
    PermanentReject,
    SizeExceeded,
}

/// Decides which senders and recipients a session may use
#[async_trait]
pub trait MailboxFilter: Send + Sync {
    /// Check a MAIL reverse-path. `size` is the declared SIZE, if any.
    async fn can_accept_from(
        &self,
        session: &SessionInfo,
        from: &Mailbox,
        size: Option<usize>,
    ) -> MailboxFilterResult;

    /// Check a RCPT forward-path
    async fn can_deliver_to(
        &self,
        session: &SessionInfo,
        to: &Mailbox,
        from: &Mailbox,
    ) -> MailboxFilterResult;
}

/// Accepts everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllFilter;

#[async_trait]
impl MailboxFilter for AcceptAllFilter {
    async fn can_accept_from(&self, _: &SessionInfo, _: &Mailbox, _: Option<usize>) -> MailboxFilterResult {
        MailboxFilterResult::Accept
    }

    async fn can_deliver_to(&self, _: &SessionInfo, _: &Mailbox, _: &Mailbox) -> MailboxFilterResult {
        MailboxFilterResult::Accept
    }
}

/// Accepts recipients in a fixed set of domains and senders whose
/// declared size fits the limit. The postmaster is always deliverable.
#[derive(Debug, Clone, Default)]
pub struct DomainMailboxFilter {
    domains: Vec<String>,
    max_message_size: Option<usize>,
}

impl DomainMailboxFilter {
    /// An empty domain list accepts every recipient domain
    pub fn new<I, S>(domains: I, max_message_size: Option<usize>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.as_ref().to_ascii_lowercase())
                .collect(),
            max_message_size,
        }
    }

    fn accepts_domain(&self, host: &str) -> bool {
        self.domains.is_empty() || self.domains.iter().any(|d| d.eq_ignore_ascii_case(host))
    }
}

#[async_trait]
impl MailboxFilter for DomainMailboxFilter {
    async fn can_accept_from(
        &self,
        _session: &SessionInfo,
        _from: &Mailbox,
        size: Option<usize>,
    ) -> MailboxFilterResult {
        match (size, self.max_message_size) {
            (Some(size), Some(max)) if size > max => MailboxFilterResult::SizeExceeded,
            _ => MailboxFilterResult::Accept,
        }
    }

    async fn can_deliver_to(
        &self,
        _session: &SessionInfo,
        to: &Mailbox,
        _from: &Mailbox,
    ) -> MailboxFilterResult {
        if to.is_postmaster() || self.accepts_domain(&to.host) {
            MailboxFilterResult::Accept
        } else {
            MailboxFilterResult::PermanentReject
        }
    }
}
