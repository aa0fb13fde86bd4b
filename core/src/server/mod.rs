//! File exchange server. Accepts connections and runs one session per peer
//!
//! Each accepted connection gets its own tokio task; the accept loop never
//! waits on a session. Sessions share only the client registry and the
//! storage directory tree.

pub mod registry;
pub mod session;

pub use registry::{ClientInfo, ClientRegistry, ConnectionGuard, ConnectionId, RegistryStats};
pub use session::{Session, SessionEnd, SessionError, SessionState};

use crate::config::ServerConfig;
use crate::store::{FileStore, StorageError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Server error types
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Network error: {0}")]
    Network(#[from] io::Error),
}

/// The file exchange server
pub struct FileServer {
    config: ServerConfig,
    listener: TcpListener,
    store: Arc<FileStore>,
    registry: Arc<ClientRegistry>,
}

impl FileServer {
    /// Prepare the storage root and bind the listener
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let store = FileStore::new(&config.storage_root);
        store.ensure_root().await?;

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen_addr,
                source,
            })?;

        info!(
            addr = %listener.local_addr()?,
            root = %store.root().display(),
            "File exchange server listening"
        );

        Ok(Self {
            config,
            listener,
            store: Arc::new(store),
            registry: Arc::new(ClientRegistry::new()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Actual bound address (resolves port 0)
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn store(&self) -> Arc<FileStore> {
        Arc::clone(&self.store)
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Accept connections forever.
    ///
    /// Accept errors are logged and the loop keeps going.
    pub async fn run(self) -> Result<(), ServerError> {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => self.spawn_session(stream, addr),
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    fn spawn_session(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Could not disable Nagle");
        }

        let guard = self.registry.connect_guarded(addr);
        let id = guard.id();
        let mut session =
            Session::new(id, stream, Arc::clone(&self.store), Arc::clone(&self.registry));
        debug!(conn = id, peer = %addr, "Connection accepted");

        tokio::spawn(async move {
            match session.run().await {
                Ok(end) => debug!(conn = id, peer = %addr, ?end, "Session ended"),
                Err(e) => warn!(conn = id, peer = %addr, error = %e, "Session terminated"),
            }
            debug_assert_eq!(session.state(), &SessionState::Closed);
            drop(guard);
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================
