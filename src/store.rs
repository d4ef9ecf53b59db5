//! Message persistence

use crate::proto::{SmtpReplyCode, SmtpResponse};
use crate::session::{MessageTransaction, SessionInfo};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::debug;

/// Receives each completed transaction.
///
/// The returned response is sent to the client as the answer to DATA.
/// An `Err` is reported to the client as `554 transaction failed`.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save(
        &self,
        session: &SessionInfo,
        transaction: &MessageTransaction,
    ) -> Result<SmtpResponse>;
}

/// Keeps every transaction in memory
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    messages: Mutex<Vec<MessageTransaction>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the stored transactions
    pub async fn messages(&self) -> Vec<MessageTransaction> {
        self.messages.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn save(
        &self,
        _session: &SessionInfo,
        transaction: &MessageTransaction,
    ) -> Result<SmtpResponse> {
        self.messages.lock().await.push(transaction.clone());
        Ok(SmtpResponse::OK)
    }
}

/// Writes one `.eml` file per transaction into a directory
#[derive(Debug, Clone)]
pub struct FileMessageStore {
    directory: PathBuf,
    hostname: String,
}

impl FileMessageStore {
    pub fn new(directory: impl Into<PathBuf>, hostname: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            hostname: hostname.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Trace and envelope headers prepended to the stored message
    fn headers(&self, session: &SessionInfo, transaction: &MessageTransaction) -> Result<String> {
        let date = OffsetDateTime::now_utc()
            .format(&Rfc2822)
            .map_err(|e| Error::Protocol(e.to_string()))?;

        let protocol = match (session.secure, session.authenticated_user.is_some()) {
            (false, false) => "ESMTP",
            (true, false) => "ESMTPS",
            (false, true) => "ESMTPA",
            (true, true) => "ESMTPSA",
        };
        let client = session.helo.as_deref().unwrap_or("unknown");
        let address = session
            .remote_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".into());

        let mut headers = format!(
            "Received: from {client} ([{address}])\r\n\tby {} with {protocol} id {}; {date}\r\n",
            self.hostname, session.id
        );
        let from = transaction
            .from
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        headers.push_str(&format!("X-Envelope-From: <{from}>\r\n"));
        for to in &transaction.to {
            headers.push_str(&format!("X-Envelope-To: <{to}>\r\n"));
        }
        Ok(headers)
    }

    fn file_name(session: &SessionInfo) -> String {
        let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let nonce = rand::random::<u32>();
        format!("{nanos}-{}-{nonce:08x}.eml", session.id)
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn save(
        &self,
        session: &SessionInfo,
        transaction: &MessageTransaction,
    ) -> Result<SmtpResponse> {
        tokio::fs::create_dir_all(&self.directory).await?;

        let mut content = self.headers(session, transaction)?.into_bytes();
        content.extend_from_slice(&transaction.body);
        content.extend_from_slice(b"\r\n");

        let name = Self::file_name(session);
        let partial = self.directory.join(format!(".{name}.tmp"));
        let path = self.directory.join(&name);

        // Readers of the directory only ever see complete messages.
        tokio::fs::write(&partial, &content).await?;
        tokio::fs::rename(&partial, &path).await?;
        debug!("[{}] Stored message in {}", session.id, path.display());

        Ok(SmtpResponse::new(
            SmtpReplyCode::Ok,
            format!("Ok: queued as {name}"),
        ))
    }
}
