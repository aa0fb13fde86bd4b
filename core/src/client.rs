//! Protocol client, driving the exchange from the peer side
//!
//! Every request header is encoded, and its string lengths validated,
//! before a single byte is written, so an oversized filename or identifier
//! never reaches the wire.

use crate::protocol::{self, ProtocolError, Request};
use crate::transfer::{self, TransferError, DEFAULT_BUFFER_SIZE};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// File client error types
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not connected to server")]
    NotConnected,
    #[error("Not registered with server")]
    NotRegistered,
    #[error("File not found on server: {0}")]
    NotFound(String),
    #[error("Invalid file path: {}", .0.display())]
    InvalidPath(PathBuf),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Client side of one server connection
pub struct FileClient<S = TcpStream> {
    stream: Option<BufReader<S>>,
    uid: Option<String>,
}

impl FileClient<TcpStream> {
    /// Open a TCP connection to the server
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S> FileClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already-open stream
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(BufReader::new(stream)),
            uid: None,
        }
    }

    /// Identifier this connection registered, if any
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn stream(&mut self) -> Result<&mut BufReader<S>, ClientError> {
        self.stream.as_mut().ok_or(ClientError::NotConnected)
    }

    fn require_registered(&self) -> Result<(), ClientError> {
        if self.uid.is_none() {
            return Err(ClientError::NotRegistered);
        }
        Ok(())
    }

    async fn send_header(&mut self, request: &Request) -> Result<(), ClientError> {
        let header = request.encode_header()?;
        let stream = self.stream()?;
        stream.write_all(&header).await?;
        Ok(())
    }

    /// Send `size` body bytes after a header.
    ///
    /// A failure here leaves the server mid-frame, so the connection is
    /// dropped rather than reused.
    async fn send_body<R>(&mut self, reader: &mut R, size: u64) -> Result<u64, ClientError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let stream = self.stream()?;
        match transfer::copy_exact(reader, stream, size, DEFAULT_BUFFER_SIZE).await {
            Ok(sent) => Ok(sent),
            Err(e) => {
                self.stream = None;
                Err(e.into())
            }
        }
    }

    /// Claim an identifier for this connection.
    ///
    /// The server sends no acknowledgement.
    pub async fn register(&mut self, uid: &str) -> Result<(), ClientError> {
        self.send_header(&Request::Register {
            uid: uid.to_string(),
        })
        .await?;
        self.stream()?.flush().await?;
        self.uid = Some(uid.to_string());
        debug!(uid, "Registered");
        Ok(())
    }

    /// Round-trip a PING
    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.send_header(&Request::Ping).await?;
        let stream = self.stream()?;
        stream.flush().await?;
        protocol::read_pong(stream).await?;
        Ok(())
    }

    /// Upload `size` bytes from `reader` as `name` into our own storage
    pub async fn put_reader<R>(
        &mut self,
        name: &str,
        size: u64,
        reader: &mut R,
        buffer_hint: u32,
    ) -> Result<u64, ClientError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.require_registered()?;
        self.send_header(&Request::PutFile {
            filename: name.to_string(),
            size,
            buffer_hint,
        })
        .await?;
        let sent = self.send_body(reader, size).await?;
        debug!(file = name, bytes = sent, "Uploaded");
        Ok(sent)
    }

    /// Upload a local file under its basename
    pub async fn put_file(
        &mut self,
        path: impl AsRef<Path>,
        buffer_hint: u32,
    ) -> Result<u64, ClientError> {
        let (name, size, mut file) = open_upload(path.as_ref()).await?;
        self.put_reader(&name, size, &mut file, buffer_hint).await
    }

    /// Names of the files stored for our identifier, in server order
    pub async fn list_files(&mut self) -> Result<Vec<String>, ClientError> {
        self.require_registered()?;
        self.send_header(&Request::ListFiles).await?;
        let stream = self.stream()?;
        stream.flush().await?;
        Ok(protocol::read_file_list(stream).await?)
    }

    /// Download `name` into `writer`; the server deletes it afterwards.
    ///
    /// A zero size from the server is reported as `NotFound`.
    pub async fn download_to<W>(&mut self, name: &str, writer: &mut W) -> Result<u64, ClientError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let size = self.request_stream(name).await?;
        self.receive_body(writer, size).await
    }

    /// Download `name` into a local file at `save_path`.
    ///
    /// The local file is only created once the server has confirmed the
    /// download.
    pub async fn download(
        &mut self,
        name: &str,
        save_path: impl AsRef<Path>,
    ) -> Result<u64, ClientError> {
        let size = self.request_stream(name).await?;

        let mut file = match File::create(save_path.as_ref()).await {
            Ok(file) => file,
            Err(e) => {
                self.discard_body(size).await;
                return Err(e.into());
            }
        };
        self.receive_body(&mut file, size).await
    }

    /// Copy a download body of `size` bytes into `writer`.
    ///
    /// If the local writer fails, the rest of the body is drained so the
    /// next response lines up. If the connection fails, it is dropped.
    async fn receive_body<W>(&mut self, writer: &mut W, size: u64) -> Result<u64, ClientError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let stream = self.stream()?;
        match transfer::copy_exact(stream, writer, size, DEFAULT_BUFFER_SIZE).await {
            Ok(received) => Ok(received),
            Err(TransferError::Write { consumed, source }) => {
                self.discard_body(size - consumed).await;
                Err(TransferError::Write { consumed, source }.into())
            }
            Err(e) => {
                self.stream = None;
                Err(e.into())
            }
        }
    }

    async fn discard_body(&mut self, remaining: u64) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        if let Err(e) = transfer::discard_exact(stream, remaining).await {
            debug!(error = %e, "Dropping connection after unread download body");
            self.stream = None;
        }
    }

    async fn request_stream(&mut self, name: &str) -> Result<u64, ClientError> {
        self.require_registered()?;
        self.send_header(&Request::StreamFile {
            filename: name.to_string(),
        })
        .await?;
        let stream = self.stream()?;
        stream.flush().await?;

        let size = protocol::read_file_size(stream).await?;
        if size == protocol::NOT_FOUND_SENTINEL {
            return Err(ClientError::NotFound(name.to_string()));
        }
        Ok(size)
    }

    /// Push `size` bytes from `reader` as `name` into `target`'s storage
    pub async fn send_reader<R>(
        &mut self,
        target: &str,
        name: &str,
        size: u64,
        reader: &mut R,
    ) -> Result<u64, ClientError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.require_registered()?;
        self.send_header(&Request::SendToUid {
            target: target.to_string(),
            filename: name.to_string(),
            size,
        })
        .await?;
        let sent = self.send_body(reader, size).await?;
        debug!(to = target, file = name, bytes = sent, "Pushed");
        Ok(sent)
    }

    /// Push a local file, under its basename, into `target`'s storage
    pub async fn send_file(
        &mut self,
        target: &str,
        path: impl AsRef<Path>,
    ) -> Result<u64, ClientError> {
        let (name, size, mut file) = open_upload(path.as_ref()).await?;
        self.send_reader(target, &name, size, &mut file).await
    }

    /// Say BYE and close our side of the connection
    pub async fn bye(&mut self) -> Result<(), ClientError> {
        self.send_header(&Request::Bye).await?;
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        self.uid = None;
        Ok(())
    }
}

/// Open a local file for upload, returning its basename and size
async fn open_upload(path: &Path) -> Result<(String, u64, File), ClientError> {
    let metadata = tokio::fs::metadata(path).await?;
    if metadata.is_dir() {
        return Err(ClientError::InvalidPath(path.to_path_buf()));
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ClientError::InvalidPath(path.to_path_buf()))?
        .to_string();
    protocol::validate_field("filename", &name)?;

    let file = File::open(path).await?;
    Ok((name, metadata.len(), file))
}

// ============================================================================
// TESTS
// ============================================================================
