// Per-identifier storage directories on the local filesystem
//
// Layout: <root>/<uid>/<filename>. Names are joined verbatim; nothing here
// serialises concurrent writers to the same path.

use crate::protocol::{self, ProtocolError};
use crate::transfer::{self, TransferError, DEFAULT_BUFFER_SIZE};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Storage I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// True if the failure left nothing on the outgoing stream
    pub fn nothing_written(&self) -> bool {
        matches!(self, StorageError::NotFound(_) | StorageError::Io { .. })
    }
}

/// Result of a consume-on-read download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamedFile {
    /// Bytes sent after the size field
    pub size: u64,
    /// Whether the file was deleted afterwards
    pub removed: bool,
}

/// Filesystem-backed storage partitioned by identifier
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every file for `uid`
    pub fn uid_dir(&self, uid: &str) -> PathBuf {
        self.root.join(uid)
    }

    /// Path of `name` inside the storage directory of `uid`.
    ///
    /// Names are not sanitised. Ones that could escape the directory are
    /// logged so they show up in operations.
    pub fn file_path(&self, uid: &str, name: &str) -> PathBuf {
        if is_suspicious_name(uid) || is_suspicious_name(name) {
            warn!(uid, file = name, "Path component may escape its storage directory");
        }
        self.uid_dir(uid).join(name)
    }

    /// Create the storage root
    pub async fn ensure_root(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StorageError::io(&self.root, e))
    }

    /// Idempotently create the storage directory for `uid`
    pub async fn ensure_directory(&self, uid: &str) -> Result<PathBuf, StorageError> {
        let dir = self.uid_dir(uid);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;
        Ok(dir)
    }

    /// Names of the stored files for `uid`, in directory order.
    ///
    /// A directory that does not exist yet simply has no files.
    pub async fn list(&self, uid: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.uid_dir(uid);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&dir, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StorageError::io(&entry.path(), e))?;
            if file_type.is_dir() {
                continue;
            }
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    /// Create or overwrite `name` for `uid` with exactly `len` bytes from `reader`.
    ///
    /// Last write wins. On error the file may be left partially written.
    pub async fn save<R>(
        &self,
        uid: &str,
        name: &str,
        len: u64,
        reader: &mut R,
        buffer_size: usize,
    ) -> Result<u64, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let path = self.file_path(uid, name);
        let mut file = File::create(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;

        let written = transfer::copy_exact(reader, &mut file, len, buffer_size).await?;
        debug!(uid, file = name, bytes = written, "Stored file");
        Ok(written)
    }

    /// Send `name` for `uid` to `writer` and delete it.
    ///
    /// Writes the 8-byte size field followed by the content. A missing file
    /// is `NotFound` with nothing written. Failing to delete afterwards is
    /// logged and reported through `StreamedFile::removed`; the download
    /// itself still succeeded.
    pub async fn stream<W>(
        &self,
        uid: &str,
        name: &str,
        writer: &mut W,
    ) -> Result<StreamedFile, StorageError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let path = self.file_path(uid, name);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(name.to_string()))
            }
            Err(e) => return Err(StorageError::io(&path, e)),
        };
        let metadata = file
            .metadata()
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound(name.to_string()));
        }

        let size = metadata.len();
        protocol::write_file_size(writer, size).await?;

        // Never send more than announced, even if the file grew meanwhile
        let mut body = file.take(size);
        let sent = transfer::copy_to_end(&mut body, writer, DEFAULT_BUFFER_SIZE).await?;
        if sent != size {
            return Err(TransferError::UnexpectedEof {
                expected: size,
                received: sent,
            }
            .into());
        }
        drop(body);

        let removed = match fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) => {
                warn!(uid, file = name, error = %e, "Failed to remove streamed file");
                false
            }
        };

        Ok(StreamedFile { size, removed })
    }
}

fn is_suspicious_name(name: &str) -> bool {
    name.is_empty() || name == "." || name == ".." || name.contains(|c: char| c == '/' || c == '\\')
}

// ============================================================================
// TESTS
// ============================================================================
