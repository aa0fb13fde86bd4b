//! Per-connection protocol state machine
//!
//! One session owns one accepted connection and runs a strictly sequential
//! opcode loop: an opcode is fully read, dispatched and answered before the
//! next one is read. Protocol violations end the session without any error
//! frame; the peer only sees the connection close.

use super::registry::{ClientRegistry, ConnectionId};
use crate::protocol::{self, Opcode, ProtocolError, Request, NOT_FOUND_SENTINEL, PONG};
use crate::store::{FileStore, StorageError};
use crate::transfer::{self, TransferError, DEFAULT_BUFFER_SIZE};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

/// Session state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Just accepted; only REGISTER, PING and BYE are allowed
    New,
    /// REGISTER succeeded for this identifier
    Registered(String),
    /// Terminal
    Closed,
}

/// How a session ended without a protocol violation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Peer sent BYE
    Bye,
    /// Peer closed the connection between requests
    Disconnected,
}

/// Reasons a session is torn down
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("{0} received before REGISTER")]
    NotRegistered(Opcode),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),
}

/// One accepted connection and its protocol state
pub struct Session<S> {
    id: ConnectionId,
    stream: BufReader<S>,
    state: SessionState,
    store: Arc<FileStore>,
    registry: Arc<ClientRegistry>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        id: ConnectionId,
        stream: S,
        store: Arc<FileStore>,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            id,
            stream: BufReader::new(stream),
            state: SessionState::New,
            store,
            registry,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Registered identifier, if any
    pub fn uid(&self) -> Option<&str> {
        match &self.state {
            SessionState::Registered(uid) => Some(uid),
            _ => None,
        }
    }

    /// Run the opcode loop until BYE, disconnect, or a protocol violation,
    /// then close the connection. The session is `Closed` afterwards and
    /// running it again returns immediately.
    pub async fn run(&mut self) -> Result<SessionEnd, SessionError> {
        if self.state == SessionState::Closed {
            return Ok(SessionEnd::Disconnected);
        }
        let result = self.serve().await;
        self.state = SessionState::Closed;
        if let Err(e) = self.stream.shutdown().await {
            debug!(error = %e, "Connection shutdown failed");
        }
        result
    }

    async fn serve(&mut self) -> Result<SessionEnd, SessionError> {
        loop {
            let opcode = match protocol::read_opcode(&mut self.stream).await {
                Ok(opcode) => opcode,
                Err(ProtocolError::ConnectionClosed) => return Ok(SessionEnd::Disconnected),
                Err(e) => return Err(e.into()),
            };

            if opcode.requires_registration() && self.uid().is_none() {
                return Err(SessionError::NotRegistered(opcode));
            }

            let request = protocol::read_request(opcode, &mut self.stream).await?;
            debug!(%opcode, "Dispatching request");

            match request {
                Request::Register { uid } => self.handle_register(uid).await?,
                Request::Ping => self.respond(PONG).await?,
                Request::Bye => return Ok(SessionEnd::Bye),
                Request::PutFile {
                    filename,
                    size,
                    buffer_hint,
                } => {
                    let owner = self.registered_uid(opcode)?;
                    let buffer_size = transfer::buffer_size_from_hint(buffer_hint);
                    self.receive_upload(&owner, &filename, size, buffer_size)
                        .await?;
                }
                Request::ListFiles => {
                    let owner = self.registered_uid(opcode)?;
                    self.handle_list(&owner).await?;
                }
                Request::StreamFile { filename } => {
                    let owner = self.registered_uid(opcode)?;
                    self.handle_stream(&owner, &filename).await?;
                }
                Request::SendToUid {
                    target,
                    filename,
                    size,
                } => {
                    let sender = self.registered_uid(opcode)?;
                    self.handle_send(&sender, &target, &filename, size).await?;
                }
            }
        }
    }

    fn registered_uid(&self, opcode: Opcode) -> Result<String, SessionError> {
        self.uid()
            .map(str::to_string)
            .ok_or(SessionError::NotRegistered(opcode))
    }

    async fn respond(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(ProtocolError::from)?;
        self.stream.flush().await.map_err(ProtocolError::from)?;
        Ok(())
    }

    async fn handle_register(&mut self, uid: String) -> Result<(), SessionError> {
        // An empty identifier names no partition; the session stays unregistered
        if uid.is_empty() {
            warn!("Ignoring REGISTER with empty identifier");
            return Ok(());
        }

        self.store.ensure_directory(&uid).await?;
        self.registry.register(self.id, &uid);
        info!(conn = self.id, uid = %uid, "Client registered");
        self.state = SessionState::Registered(uid);
        Ok(())
    }

    /// Store an upload body into `owner`'s directory.
    ///
    /// Local storage failures abort only this operation: whatever is left of
    /// the declared body is drained so the next opcode stays aligned. A
    /// failure reading from the peer ends the session.
    async fn receive_upload(
        &mut self,
        owner: &str,
        filename: &str,
        size: u64,
        buffer_size: usize,
    ) -> Result<(), SessionError> {
        match self
            .store
            .save(owner, filename, size, &mut self.stream, buffer_size)
            .await
        {
            Ok(written) => {
                info!(uid = %owner, filename, bytes = written, "Saved file");
                Ok(())
            }
            Err(StorageError::Transfer(e)) if e.is_source_failure() => Err(e.into()),
            Err(e) => {
                let consumed = match &e {
                    StorageError::Transfer(TransferError::Write { consumed, .. }) => *consumed,
                    _ => 0,
                };
                warn!(uid = %owner, filename, error = %e, "Upload failed, discarding body");
                transfer::discard_exact(&mut self.stream, size - consumed).await?;
                Ok(())
            }
        }
    }

    async fn handle_list(&mut self, owner: &str) -> Result<(), SessionError> {
        let names = match self.store.list(owner).await {
            Ok(names) => names,
            Err(e) => {
                warn!(uid = %owner, error = %e, "Listing failed, reporting no files");
                Vec::new()
            }
        };
        self.respond(&protocol::encode_file_list(&names)).await?;
        debug!(uid = %owner, count = names.len(), "Sent file list");
        Ok(())
    }

    async fn handle_stream(&mut self, owner: &str, filename: &str) -> Result<(), SessionError> {
        match self.store.stream(owner, filename, &mut self.stream).await {
            Ok(streamed) => {
                info!(
                    uid = %owner,
                    filename,
                    bytes = streamed.size,
                    removed = streamed.removed,
                    "Streamed file"
                );
                Ok(())
            }
            Err(e) if e.nothing_written() => {
                debug!(uid = %owner, filename, error = %e, "Stream request not served");
                protocol::write_file_size(&mut self.stream, NOT_FOUND_SENTINEL).await?;
                self.stream.flush().await.map_err(ProtocolError::from)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Push a file into another identifier's directory.
    ///
    /// The registry is not consulted; delivery is to disk whether or not the
    /// target is connected.
    async fn handle_send(
        &mut self,
        sender: &str,
        target: &str,
        filename: &str,
        size: u64,
    ) -> Result<(), SessionError> {
        let ready = if target.is_empty() {
            warn!(from = %sender, filename, "Push with empty target identifier");
            false
        } else {
            match self.store.ensure_directory(target).await {
                Ok(_) => true,
                Err(e) => {
                    warn!(to = %target, error = %e, "Could not prepare target directory");
                    false
                }
            }
        };

        if !ready {
            transfer::discard_exact(&mut self.stream, size).await?;
            return Ok(());
        }

        debug!(from = %sender, to = %target, filename, bytes = size, "Receiving push");
        self.receive_upload(target, filename, size, DEFAULT_BUFFER_SIZE)
            .await
    }
}

// ============================================================================
// TESTS
// ============================================================================
