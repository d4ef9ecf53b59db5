use async_trait::async_trait;
use smtpd::config::UserEntry;
use smtpd::crypto::hash_password;
use smtpd::session::{run_session, SessionOptions, SessionServices};
use smtpd::{
    DomainMailboxFilter, Error, Mailbox, MailboxFilter, MailboxFilterResult, MemoryMessageStore,
    MessageStore, MessageTransaction, PemCertificateFactory, SessionInfo, SmtpResponse, UsersConfig,
    UsersFileAuthenticator,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;
use tokio_rustls::rustls;
use tokio_util::sync::CancellationToken;

struct Client<S> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    async fn send(&mut self, line: &str) {
        self.stream.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    async fn send_raw(&mut self, data: &[u8]) {
        self.stream.write_all(data).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Read one complete reply, continuation lines joined with '\n'
    async fn reply(&mut self) -> String {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = self.stream.read_line(&mut line).await.unwrap();
            assert!(n > 0, "connection closed, got {lines:?}");
            let line = line.trim_end_matches("\r\n").to_string();
            let last = line.len() < 4 || line.as_bytes()[3] == b' ';
            lines.push(line);
            if last {
                return lines.join("\n");
            }
        }
    }

    async fn command(&mut self, line: &str) -> String {
        self.send(line).await;
        self.reply().await
    }

    async fn is_closed(&mut self) -> bool {
        let mut line = String::new();
        matches!(self.stream.read_line(&mut line).await, Ok(0) | Err(_))
    }
}

/// Remembers the session each message arrived on
#[derive(Default)]
struct RecordingStore {
    saved: Mutex<Vec<(SessionInfo, MessageTransaction)>>,
}

impl RecordingStore {
    fn saved(&self) -> Vec<(SessionInfo, MessageTransaction)> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageStore for RecordingStore {
    async fn save(
        &self,
        session: &SessionInfo,
        transaction: &MessageTransaction,
    ) -> smtpd::Result<SmtpResponse> {
        self.saved.lock().unwrap().push((session.clone(), transaction.clone()));
        Ok(SmtpResponse::OK)
    }
}

/// Never answers
struct StalledFilter;

#[async_trait]
impl MailboxFilter for StalledFilter {
    async fn can_accept_from(&self, _: &SessionInfo, _: &Mailbox, _: Option<usize>) -> MailboxFilterResult {
        std::future::pending().await
    }

    async fn can_deliver_to(&self, _: &SessionInfo, _: &Mailbox, _: &Mailbox) -> MailboxFilterResult {
        std::future::pending().await
    }
}

struct FailingStore;

#[async_trait]
impl MessageStore for FailingStore {
    async fn save(&self, _: &SessionInfo, _: &MessageTransaction) -> smtpd::Result<SmtpResponse> {
        Err(Error::Protocol("disk full".into()))
    }
}

fn options() -> SessionOptions {
    SessionOptions {
        hostname: "mx.test".into(),
        ..Default::default()
    }
}

fn users_authenticator() -> Arc<UsersFileAuthenticator> {
    let mut users = UsersConfig::default();
    users.set_user(
        "alice",
        UserEntry {
            password: hash_password("wonderland"),
            whitelist: Vec::new(),
        },
    );
    Arc::new(UsersFileAuthenticator::new(users))
}

fn start_with_cancel(
    options: SessionOptions,
    services: SessionServices,
    cancel: CancellationToken,
) -> (Client<DuplexStream>, JoinHandle<smtpd::Result<()>>) {
    let (client, server) = tokio::io::duplex(16 * 1024);
    let info = SessionInfo::new(1, None, None);
    let handle = tokio::spawn(run_session(server, info, Arc::new(options), services, cancel));
    (Client::new(client), handle)
}

fn start(
    options: SessionOptions,
    services: SessionServices,
) -> (Client<DuplexStream>, JoinHandle<smtpd::Result<()>>) {
    start_with_cancel(options, services, CancellationToken::new())
}

fn self_signed() -> (rcgen::Certificate, PemCertificateFactory) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let factory = PemCertificateFactory::from_pem(
        cert.serialize_pem().unwrap().as_bytes(),
        cert.serialize_private_key_pem().as_bytes(),
    )
    .unwrap();
    (cert, factory)
}

async fn tls_connect<S>(stream: S, cert: &rcgen::Certificate) -> Client<tokio_rustls::client::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(rustls::pki_types::CertificateDer::from(cert.serialize_der().unwrap()))
        .unwrap();
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let domain = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    Client::new(connector.connect(domain, stream).await.unwrap())
}

#[tokio::test]
async fn test_complete_transaction() {
    let store = Arc::new(MemoryMessageStore::new());
    let (mut client, handle) = start(options(), SessionServices::new(store.clone()));

    assert_eq!(client.reply().await, "220 mx.test ESMTP ready");

    let ehlo = client.command("EHLO client.test").await;
    assert!(ehlo.starts_with("250-mx.test Hello client.test\n"), "{ehlo}");
    assert!(ehlo.contains("250-PIPELINING"));
    assert!(ehlo.contains("250-8BITMIME"));
    assert!(ehlo.ends_with("250 SMTPUTF8"));
    assert!(!ehlo.contains("STARTTLS"));
    assert!(!ehlo.contains("AUTH"));

    assert_eq!(client.command("MAIL FROM:<a@x.com> SIZE=10").await, "250 Ok");
    assert_eq!(client.command("RCPT TO:<b@y.com>").await, "250 Ok");
    assert_eq!(client.command("RCPT TO:<Postmaster>").await, "250 Ok");
    assert!(client.command("DATA").await.starts_with("354 "));
    client.send_raw(b"Subject: hi\r\n\r\n..dot\r\n.\r\n").await;
    assert_eq!(client.reply().await, "250 Ok");
    assert!(client.command("QUIT").await.starts_with("221 "));

    assert!(handle.await.unwrap().is_ok());

    let messages = store.messages().await;
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert_eq!(message.from, Some(Mailbox::new("a", "x.com")));
    assert_eq!(message.to, vec![Mailbox::new("b", "y.com"), Mailbox::postmaster()]);
    assert_eq!(message.parameters.get("SIZE").map(String::as_str), Some("10"));
    assert_eq!(&message.body[..], b"Subject: hi\r\n\r\n.dot");
}

#[tokio::test]
async fn test_second_transaction_on_same_session() {
    let store = Arc::new(MemoryMessageStore::new());
    let (mut client, handle) = start(options(), SessionServices::new(store.clone()));
    client.reply().await;

    assert_eq!(client.command("HELO client.test").await, "250 mx.test Hello client.test");
    for n in 0..2 {
        assert_eq!(client.command("MAIL FROM:<>").await, "250 Ok");
        assert_eq!(client.command("RCPT TO:<b@y.com>").await, "250 Ok");
        assert!(client.command("DATA").await.starts_with("354 "));
        client.send_raw(format!("message {n}\r\n.\r\n").as_bytes()).await;
        assert_eq!(client.reply().await, "250 Ok");
    }
    client.command("QUIT").await;
    handle.await.unwrap().unwrap();

    let messages = store.messages().await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].from, Some(Mailbox::empty()));
    assert_eq!(&messages[1].body[..], b"message 1");
}

#[tokio::test]
async fn test_empty_message_body() {
    let store = Arc::new(MemoryMessageStore::new());
    let (mut client, _handle) = start(options(), SessionServices::new(store.clone()));
    client.reply().await;

    client.command("HELO client.test").await;
    client.command("MAIL FROM:<a@x.com>").await;
    client.command("RCPT TO:<b@y.com>").await;
    assert!(client.command("DATA").await.starts_with("354 "));
    client.send_raw(b".\r\n").await;
    assert_eq!(client.reply().await, "250 Ok");

    assert!(store.messages().await[0].body.is_empty());
}

#[tokio::test]
async fn test_sequencing_errors() {
    let store = Arc::new(MemoryMessageStore::new());
    let (mut client, _handle) = start(options(), SessionServices::new(store));
    client.reply().await;

    let reply = client.command("MAIL FROM:<a@x.com>").await;
    assert!(reply.starts_with("503 bad sequence of commands, expected NOOP/RSET/QUIT/HELO/EHLO"), "{reply}");
    assert!(reply.ends_with(", 4 retry(ies) remaining."), "{reply}");

    assert!(client.command("FOO bar").await.starts_with("500 "));
    assert!(client.command("VRFY alice").await.starts_with("502 "));

    // A command that parses refills the retry budget.
    assert_eq!(client.command("NOOP").await, "250 Ok");
    let reply = client.command("DATA").await;
    assert!(reply.starts_with("503 "), "{reply}");
    assert!(reply.ends_with(", 4 retry(ies) remaining."), "{reply}");
}

#[tokio::test]
async fn test_syntax_errors_keep_state() {
    let store = Arc::new(MemoryMessageStore::new());
    let (mut client, _handle) = start(options(), SessionServices::new(store));
    client.reply().await;
    client.command("HELO client.test").await;

    let reply = client.command("MAIL TO:<a@x.com>").await;
    assert!(reply.starts_with("501 missing the FROM:"), "{reply}");
    assert!(client.command("MAIL FROM:<not an address>").await.starts_with("501 "));

    // Still waiting for MAIL
    assert!(client.command("RCPT TO:<b@y.com>").await.starts_with("503 "));
    assert_eq!(client.command("MAIL FROM:<a@x.com>").await, "250 Ok");
}

#[tokio::test]
async fn test_rset_discards_transaction() {
    let store = Arc::new(MemoryMessageStore::new());
    let (mut client, _handle) = start(options(), SessionServices::new(store));
    client.reply().await;

    client.command("EHLO client.test").await;
    assert_eq!(client.command("MAIL FROM:<a@x.com>").await, "250 Ok");
    assert_eq!(client.command("RCPT TO:<b@y.com>").await, "250 Ok");
    assert_eq!(client.command("RSET").await, "250 Ok");
    assert!(client.command("RCPT TO:<b@y.com>").await.starts_with("503 "));
    assert!(client.command("DATA").await.starts_with("503 "));
}

#[tokio::test]
async fn test_retry_exhaustion_closes_session() {
    let store = Arc::new(MemoryMessageStore::new());
    let options = SessionOptions {
        max_retry_count: 2,
        ..options()
    };
    let (mut client, handle) = start(options, SessionServices::new(store));
    client.reply().await;

    assert!(client.command("FOO").await.ends_with("1 retry(ies) remaining."));
    assert!(client.command("BAR").await.ends_with("0 retry(ies) remaining."));
    assert!(client.is_closed().await);
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_overlong_line_is_refused() {
    let store = Arc::new(MemoryMessageStore::new());
    let (mut client, _handle) = start(options(), SessionServices::new(store));
    client.reply().await;

    let long = format!("HELO {}", "a".repeat(5000));
    let reply = client.command(&long).await;
    assert!(reply.starts_with("500 line too long"), "{reply}");
    assert_eq!(client.command("NOOP").await, "250 Ok");
}

#[tokio::test]
async fn test_authentication_required() {
    let store = Arc::new(MemoryMessageStore::new());
    let services = SessionServices::new(store.clone()).with_authenticator(users_authenticator());
    let options = SessionOptions {
        authentication_required: true,
        allow_unsecure_authentication: true,
        ..options()
    };
    let (mut client, _handle) = start(options, services);
    client.reply().await;

    let ehlo = client.command("EHLO client.test").await;
    assert!(ehlo.contains("250-AUTH PLAIN LOGIN"), "{ehlo}");

    assert!(client.command("MAIL FROM:<a@x.com>").await.starts_with("530 "));
    // Syntax errors are reported before the missing authentication.
    assert!(client.command("MAIL FROM:<oops").await.starts_with("501 "));

    // "\0alice\0wonderland"
    let reply = client.command("AUTH PLAIN AGFsaWNlAHdvbmRlcmxhbmQ=").await;
    assert!(reply.starts_with("235 "), "{reply}");

    let ehlo = client.command("EHLO client.test").await;
    assert!(!ehlo.contains("AUTH"), "{ehlo}");
    assert!(client.command("AUTH PLAIN AGFsaWNlAHdvbmRlcmxhbmQ=").await.starts_with("503 "));

    assert_eq!(client.command("MAIL FROM:<a@x.com>").await, "250 Ok");
}

#[tokio::test]
async fn test_auth_not_offered_over_plaintext() {
    let store = Arc::new(MemoryMessageStore::new());
    let services = SessionServices::new(store).with_authenticator(users_authenticator());
    let (mut client, _handle) = start(options(), services);
    client.reply().await;

    let ehlo = client.command("EHLO client.test").await;
    assert!(!ehlo.contains("AUTH"), "{ehlo}");
    assert!(client.command("AUTH PLAIN AGFsaWNlAHdvbmRlcmxhbmQ=").await.starts_with("503 "));
}

#[tokio::test]
async fn test_auth_plain_continuation() {
    let store = Arc::new(MemoryMessageStore::new());
    let services = SessionServices::new(store).with_authenticator(users_authenticator());
    let options = SessionOptions {
        allow_unsecure_authentication: true,
        ..options()
    };
    let (mut client, _handle) = start(options, services);
    client.reply().await;
    client.command("EHLO client.test").await;

    assert_eq!(client.command("AUTH PLAIN").await, "334 ");
    assert!(client.command("AGFsaWNlAHdvbmRlcmxhbmQ=").await.starts_with("235 "));
}

#[tokio::test]
async fn test_auth_login() {
    let store = Arc::new(MemoryMessageStore::new());
    let services = SessionServices::new(store).with_authenticator(users_authenticator());
    let options = SessionOptions {
        allow_unsecure_authentication: true,
        ..options()
    };
    let (mut client, _handle) = start(options, services);
    client.reply().await;
    client.command("EHLO client.test").await;

    assert_eq!(client.command("AUTH LOGIN").await, "334 VXNlcm5hbWU6");
    assert_eq!(client.command("YWxpY2U=").await, "334 UGFzc3dvcmQ6");
    let reply = client.command("d29uZGVybGFuZA==").await;
    assert!(reply.starts_with("235 "), "{reply}");
}

#[tokio::test]
async fn test_auth_cancelled_and_malformed() {
    let store = Arc::new(MemoryMessageStore::new());
    let services = SessionServices::new(store).with_authenticator(users_authenticator());
    let options = SessionOptions {
        allow_unsecure_authentication: true,
        ..options()
    };
    let (mut client, _handle) = start(options, services);
    client.reply().await;
    client.command("EHLO client.test").await;

    assert_eq!(client.command("AUTH LOGIN").await, "334 VXNlcm5hbWU6");
    assert_eq!(client.command("*").await, "501 authentication cancelled");

    assert_eq!(client.command("AUTH LOGIN").await, "334 VXNlcm5hbWU6");
    assert!(client.command("not base64!").await.starts_with("501 "));

    assert!(client.command("AUTH CRAM-MD5").await.starts_with("501 "));
}

#[tokio::test]
async fn test_auth_failures_end_session() {
    let store = Arc::new(MemoryMessageStore::new());
    let services = SessionServices::new(store).with_authenticator(users_authenticator());
    let options = SessionOptions {
        allow_unsecure_authentication: true,
        max_authentication_attempts: 2,
        ..options()
    };
    let (mut client, handle) = start(options, services);
    client.reply().await;
    client.command("EHLO client.test").await;

    // "\0alice\0wrong"
    assert!(client.command("AUTH PLAIN AGFsaWNlAHdyb25n").await.starts_with("535 "));
    assert!(client.command("AUTH PLAIN AGFsaWNlAHdyb25n").await.starts_with("535 "));
    assert!(client.is_closed().await);
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_size_limits() {
    let store = Arc::new(MemoryMessageStore::new());
    let options = SessionOptions {
        max_message_size: Some(16),
        ..options()
    };
    let (mut client, _handle) = start(options, SessionServices::new(store.clone()));
    client.reply().await;

    let ehlo = client.command("EHLO client.test").await;
    assert!(ehlo.contains("250-SIZE 16"), "{ehlo}");

    assert!(client.command("MAIL FROM:<a@x.com> SIZE=100").await.starts_with("552 "));
    assert!(client.command("MAIL FROM:<a@x.com> SIZE=lots").await.starts_with("501 "));
    assert_eq!(client.command("MAIL FROM:<a@x.com> SIZE=16").await, "250 Ok");
    assert_eq!(client.command("RCPT TO:<b@y.com>").await, "250 Ok");
    assert!(client.command("DATA").await.starts_with("354 "));
    client
        .send_raw(b"0123456789012345678901234567890123456789\r\n.\r\n")
        .await;
    assert!(client.reply().await.starts_with("552 "));

    // The transaction is gone but the session goes on.
    assert!(client.command("RCPT TO:<b@y.com>").await.starts_with("503 "));
    assert_eq!(client.command("MAIL FROM:<a@x.com>").await, "250 Ok");
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_recipient_limits_and_filter() {
    let store = Arc::new(MemoryMessageStore::new());
    let services = SessionServices::new(store)
        .with_mailbox_filter(Arc::new(DomainMailboxFilter::new(["y.com"], None)));
    let options = SessionOptions {
        max_recipients: 2,
        ..options()
    };
    let (mut client, _handle) = start(options, services);
    client.reply().await;
    client.command("HELO client.test").await;
    client.command("MAIL FROM:<a@x.com>").await;

    assert!(client.command("RCPT TO:<b@elsewhere.org>").await.starts_with("550 "));
    assert_eq!(client.command("RCPT TO:<b@y.com>").await, "250 Ok");
    assert_eq!(client.command("RCPT TO:<postmaster>").await, "250 Ok");
    assert!(client.command("RCPT TO:<c@y.com>").await.starts_with("452 "));
}

#[tokio::test]
async fn test_store_failure() {
    let (mut client, _handle) = start(options(), SessionServices::new(Arc::new(FailingStore)));
    client.reply().await;
    client.command("HELO client.test").await;
    client.command("MAIL FROM:<a@x.com>").await;
    client.command("RCPT TO:<b@y.com>").await;
    client.command("DATA").await;
    client.send_raw(b"hello\r\n.\r\n").await;
    assert_eq!(client.reply().await, "554 transaction failed");
    assert_eq!(client.command("MAIL FROM:<a@x.com>").await, "250 Ok");
}

#[tokio::test]
async fn test_proxy_header() {
    let store = Arc::new(RecordingStore::default());
    let options = SessionOptions {
        proxy_protocol: true,
        ..options()
    };
    let (mut client, handle) = start(options, SessionServices::new(store.clone()));

    client.send("PROXY TCP4 192.0.2.1 198.51.100.1 40000 25").await;
    assert_eq!(client.reply().await, "220 mx.test ESMTP ready");
    client.command("HELO client.test").await;
    client.command("MAIL FROM:<a@x.com>").await;
    client.command("RCPT TO:<b@y.com>").await;
    client.command("DATA").await;
    client.send_raw(b"hello\r\n.\r\n").await;
    assert_eq!(client.reply().await, "250 Ok");
    client.command("QUIT").await;
    handle.await.unwrap().unwrap();

    let saved = store.saved();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].0.remote_addr, Some("192.0.2.1:40000".parse().unwrap()));
    assert_eq!(saved[0].0.local_addr, Some("198.51.100.1:25".parse().unwrap()));
    assert_eq!(saved[0].0.helo.as_deref(), Some("client.test"));
}

#[tokio::test]
async fn test_missing_proxy_header_closes_session() {
    let store = Arc::new(MemoryMessageStore::new());
    let options = SessionOptions {
        proxy_protocol: true,
        ..options()
    };
    let (mut client, handle) = start(options, SessionServices::new(store));

    client.send("EHLO client.test").await;
    assert!(client.is_closed().await);
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_proxy_command_mid_session() {
    let store = Arc::new(MemoryMessageStore::new());
    let (mut client, _handle) = start(options(), SessionServices::new(store));
    client.reply().await;
    client.command("HELO client.test").await;
    assert!(client
        .command("PROXY TCP4 192.0.2.1 198.51.100.1 40000 25")
        .await
        .starts_with("500 "));
}

#[tokio::test]
async fn test_idle_timeout() {
    let store = Arc::new(MemoryMessageStore::new());
    let options = SessionOptions {
        command_wait_timeout: Duration::from_millis(50),
        ..options()
    };
    let (mut client, handle) = start(options, SessionServices::new(store));
    client.reply().await;

    assert_eq!(client.reply().await, "221 Timeout while waiting for input.");
    assert!(matches!(handle.await.unwrap(), Err(Error::Timeout)));
}

#[tokio::test]
async fn test_idle_timeout_during_data() {
    let store = Arc::new(MemoryMessageStore::new());
    let options = SessionOptions {
        command_wait_timeout: Duration::from_millis(100),
        ..options()
    };
    let (mut client, handle) = start(options, SessionServices::new(store.clone()));
    client.reply().await;
    client.command("HELO client.test").await;
    client.command("MAIL FROM:<a@x.com>").await;
    client.command("RCPT TO:<b@y.com>").await;
    assert!(client.command("DATA").await.starts_with("354 "));
    client.send_raw(b"part\r\n").await;

    assert_eq!(client.reply().await, "221 Timeout while waiting for input.");
    assert!(matches!(handle.await.unwrap(), Err(Error::Timeout)));
    assert_eq!(store.len().await, 0);
}

#[tokio::test]
async fn test_quit_then_disconnect() {
    let store = Arc::new(MemoryMessageStore::new());
    let (mut client, handle) = start(options(), SessionServices::new(store));
    client.reply().await;

    client.send("QUIT").await;
    drop(client);
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_cancellation_while_client_not_reading() {
    let store = Arc::new(MemoryMessageStore::new());
    let cancel = CancellationToken::new();
    // Too small for the greeting, and the client never drains it.
    let (_client, server) = tokio::io::duplex(8);
    let info = SessionInfo::new(1, None, None);
    let handle = tokio::spawn(run_session(
        server,
        info,
        Arc::new(options()),
        SessionServices::new(store),
        cancel.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("session did not stop after cancellation")
        .unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[tokio::test]
async fn test_cancellation_while_filter_stalls() {
    let store = Arc::new(MemoryMessageStore::new());
    let services = SessionServices::new(store).with_mailbox_filter(Arc::new(StalledFilter));
    let cancel = CancellationToken::new();
    let (mut client, handle) = start_with_cancel(options(), services, cancel.clone());
    client.reply().await;
    client.command("HELO client.test").await;
    client.send("MAIL FROM:<a@x.com>").await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    assert_eq!(client.reply().await, "221 The session has been cancelled.");
    assert!(matches!(handle.await.unwrap(), Err(Error::Cancelled)));
}

#[tokio::test]
async fn test_cancellation() {
    let store = Arc::new(MemoryMessageStore::new());
    let cancel = CancellationToken::new();
    let (mut client, handle) = start_with_cancel(options(), SessionServices::new(store), cancel.clone());
    client.reply().await;
    client.command("HELO client.test").await;

    cancel.cancel();
    assert_eq!(client.reply().await, "221 The session has been cancelled.");
    assert!(matches!(handle.await.unwrap(), Err(Error::Cancelled)));
}

#[tokio::test]
async fn test_start_tls() {
    let (cert, factory) = self_signed();
    let store = Arc::new(RecordingStore::default());
    let services = SessionServices::new(store.clone())
        .with_certificate_factory(Arc::new(factory))
        .with_authenticator(users_authenticator());
    let (mut client, handle) = start(options(), services);
    client.reply().await;

    let ehlo = client.command("EHLO client.test").await;
    assert!(ehlo.contains("250-STARTTLS"), "{ehlo}");
    assert!(!ehlo.contains("AUTH"), "{ehlo}");
    assert_eq!(client.command("STARTTLS").await, "220 Ready to start TLS");

    let mut client = tls_connect(client.stream.into_inner(), &cert).await;

    let ehlo = client.command("EHLO client.test").await;
    assert!(!ehlo.contains("STARTTLS"), "{ehlo}");
    assert!(ehlo.contains("250-AUTH PLAIN LOGIN"), "{ehlo}");
    assert!(client.command("STARTTLS").await.starts_with("503 "));

    client.command("MAIL FROM:<a@x.com>").await;
    client.command("RCPT TO:<b@y.com>").await;
    client.command("DATA").await;
    client.send_raw(b"secret\r\n.\r\n").await;
    assert_eq!(client.reply().await, "250 Ok");

    // RSET after the upgrade must not bring STARTTLS back.
    assert_eq!(client.command("RSET").await, "250 Ok");
    assert!(client.command("STARTTLS").await.starts_with("503 "));

    client.command("QUIT").await;
    handle.await.unwrap().unwrap();

    let saved = store.saved();
    assert_eq!(saved.len(), 1);
    assert!(saved[0].0.secure);
    assert_eq!(&saved[0].1.body[..], b"secret");
}

#[tokio::test]
async fn test_start_tls_unavailable() {
    let store = Arc::new(MemoryMessageStore::new());
    let (mut client, _handle) = start(options(), SessionServices::new(store));
    client.reply().await;
    client.command("EHLO client.test").await;
    assert!(client.command("STARTTLS").await.starts_with("503 "));
}

#[tokio::test]
async fn test_implicit_tls() {
    let (cert, factory) = self_signed();
    let store = Arc::new(RecordingStore::default());
    let services = SessionServices::new(store.clone())
        .with_certificate_factory(Arc::new(factory))
        .with_authenticator(users_authenticator());
    let options = SessionOptions {
        implicit_tls: true,
        ..options()
    };
    let (client, handle) = start(options, services);

    let mut client = tls_connect(client.stream.into_inner(), &cert).await;
    assert_eq!(client.reply().await, "220 mx.test ESMTP ready");

    let ehlo = client.command("EHLO client.test").await;
    assert!(!ehlo.contains("STARTTLS"), "{ehlo}");
    assert!(ehlo.contains("250-AUTH PLAIN LOGIN"), "{ehlo}");

    let reply = client.command("RCPT TO:<b@y.com>").await;
    assert!(
        reply.starts_with("503 bad sequence of commands, expected NOOP/RSET/QUIT/HELO/EHLO/MAIL/AUTH"),
        "{reply}"
    );

    client.command("MAIL FROM:<a@x.com>").await;
    client.command("RCPT TO:<b@y.com>").await;
    client.command("DATA").await;
    client.send_raw(b"sealed\r\n.\r\n").await;
    assert_eq!(client.reply().await, "250 Ok");

    client.command("QUIT").await;
    handle.await.unwrap().unwrap();

    let saved = store.saved();
    assert_eq!(saved.len(), 1);
    assert!(saved[0].0.secure);
    assert_eq!(&saved[0].1.body[..], b"sealed");
}
