//! SMTP Server
//!
//! Binds every configured endpoint and runs one session task per accepted
//! connection. Shutdown stops accepting and lets sessions finish; cancel
//! also ends the sessions still running.

use crate::auth::UsersFileAuthenticator;
use crate::config::{EndpointConfig, ServerConfig, UsersConfig};
use crate::filter::DomainMailboxFilter;
use crate::session::{run_session, SessionInfo, SessionOptions, SessionServices};
use crate::store::{FileMessageStore, MemoryMessageStore, MessageStore};
use crate::tls::PemCertificateFactory;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// Server state
pub struct Server {
    config: ServerConfig,
    services: SessionServices,
    next_session_id: Arc<AtomicU64>,
}

impl Server {
    /// Create a new server.
    ///
    /// `users` overrides the configured `users_file`. Without either, AUTH is
    /// not offered. Messages go to `mailbox_dir`, or stay in memory when it
    /// is empty.
    pub async fn new(config: ServerConfig, users: Option<UsersConfig>) -> anyhow::Result<Self> {
        let users = match (users, &config.users_file) {
            (Some(users), _) => Some(users),
            (None, Some(path)) => Some(UsersConfig::from_file(path)?),
            (None, None) => None,
        };
        config.validate(users.is_some())?;

        let message_store: Arc<dyn MessageStore> = if config.mailbox_dir.is_empty() {
            info!("Keeping messages in memory");
            Arc::new(MemoryMessageStore::new())
        } else {
            info!("Storing messages in {}", config.mailbox_dir);
            Arc::new(FileMessageStore::new(&config.mailbox_dir, &config.hostname))
        };

        let filter = DomainMailboxFilter::new(&config.accepted_domains, config.max_message_size);
        let mut services = SessionServices::new(message_store).with_mailbox_filter(Arc::new(filter));

        if let Some(users) = users {
            info!("Loaded {} users", users.users.len());
            services = services.with_authenticator(Arc::new(UsersFileAuthenticator::new(users)));
        }

        if let Some((cert_file, key_file)) = config.tls_files() {
            let factory = PemCertificateFactory::from_files(&cert_file, &key_file).await?;
            info!("Loaded certificate from {}", cert_file.display());
            services = services.with_certificate_factory(Arc::new(factory));
        }

        Ok(Self::with_services(config, services))
    }

    /// Create a server around prepared collaborators
    pub fn with_services(config: ServerConfig, services: SessionServices) -> Self {
        Self {
            config,
            services,
            next_session_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    /// Bind every endpoint, then serve until `shutdown` or `cancel` fires
    pub async fn run(&self, shutdown: CancellationToken, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut listeners = Vec::with_capacity(self.config.endpoints.len());
        for endpoint in &self.config.endpoints {
            let addr = endpoint.bind_addr()?;
            let listener = TcpListener::bind(&addr).await?;
            info!(
                "SMTP server listening on {}{}",
                addr,
                if endpoint.implicit_tls { " (implicit TLS)" } else { "" }
            );
            listeners.push((endpoint.clone(), listener));
        }
        info!("Hostname: {}", self.config.hostname);

        self.serve(listeners, shutdown, cancel).await;
        Ok(())
    }

    /// Accept on already bound listeners until `shutdown` or `cancel` fires,
    /// then wait for every session to finish.
    ///
    /// Sessions only see `cancel`, so after `shutdown` alone a message in
    /// flight is still received and stored.
    pub async fn serve(
        &self,
        listeners: Vec<(EndpointConfig, TcpListener)>,
        shutdown: CancellationToken,
        cancel: CancellationToken,
    ) {
        let tracker = TaskTracker::new();

        let accept_loops = TaskTracker::new();
        for (endpoint, listener) in listeners {
            let options = Arc::new(SessionOptions::new(&self.config, &endpoint));
            accept_loops.spawn(accept_loop(
                listener,
                options,
                self.services.clone(),
                Arc::clone(&self.next_session_id),
                tracker.clone(),
                shutdown.clone(),
                cancel.clone(),
            ));
        }
        accept_loops.close();
        accept_loops.wait().await;

        tracker.close();
        info!("Waiting for {} sessions to finish", tracker.len());
        tracker.wait().await;
        info!("Server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    options: Arc<SessionOptions>,
    services: SessionServices,
    next_session_id: Arc<AtomicU64>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, remote_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };
        trace!("Connection from {}", remote_addr);
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", remote_addr, e);
        }

        let id = next_session_id.fetch_add(1, Ordering::Relaxed);
        let info = SessionInfo::new(id, stream.local_addr().ok(), Some(remote_addr));
        let options = Arc::clone(&options);
        let services = services.clone();
        let session_cancel = cancel.child_token();

        tracker.spawn(async move {
            if let Err(e) = run_session(stream, info, options, services, session_cancel).await {
                debug!("[{}] Session from {} ended: {}", id, remote_addr, e);
            }
        });
    }
}
