//! Bounded, chunked byte copies
//!
//! Uploads move an exact declared byte count from the connection into a
//! file; reading past that count would eat the next opcode. Downloads move
//! a whole file onto the connection after its size has been announced.
//! Both reuse one fixed-size buffer per copy.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Copy buffer used when the client hint is 0
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Upper bound on a client-requested copy buffer
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Stream ended after {received} of {expected} bytes")]
    UnexpectedEof { expected: u64, received: u64 },
    #[error("Read failed after {received} bytes: {source}")]
    Read {
        received: u64,
        #[source]
        source: io::Error,
    },
    #[error("Write failed after {consumed} bytes were consumed: {source}")]
    Write {
        /// Bytes already taken from the source when the sink failed
        consumed: u64,
        #[source]
        source: io::Error,
    },
}

impl TransferError {
    /// True when the failure happened on the source side.
    ///
    /// A failed source cannot be drained back into frame alignment; a failed
    /// sink can.
    pub fn is_source_failure(&self) -> bool {
        !matches!(self, TransferError::Write { .. })
    }
}

/// Resolve a client buffer hint into a concrete buffer size
pub fn buffer_size_from_hint(hint: u32) -> usize {
    match hint {
        0 => DEFAULT_BUFFER_SIZE,
        n => (n as usize).min(MAX_BUFFER_SIZE),
    }
}

/// Copy exactly `len` bytes from `reader` to `writer`.
///
/// Never requests more than the bytes still owed, however the data is
/// chunked on arrival.
pub async fn copy_exact<R, W>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    buffer_size: usize,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    if len == 0 {
        return Ok(0);
    }

    let cap = (buffer_size.max(1) as u64).min(len) as usize;
    let mut buf = vec![0u8; cap];
    let mut received = 0u64;

    while received < len {
        let want = (len - received).min(cap as u64) as usize;
        let n = reader
            .read(&mut buf[..want])
            .await
            .map_err(|source| TransferError::Read { received, source })?;
        if n == 0 {
            return Err(TransferError::UnexpectedEof {
                expected: len,
                received,
            });
        }
        received += n as u64;

        writer
            .write_all(&buf[..n])
            .await
            .map_err(|source| TransferError::Write {
                consumed: received,
                source,
            })?;
    }

    writer
        .flush()
        .await
        .map_err(|source| TransferError::Write {
            consumed: received,
            source,
        })?;

    Ok(received)
}

/// Read and throw away exactly `len` bytes
pub async fn discard_exact<R>(reader: &mut R, len: u64) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    copy_exact(reader, &mut tokio::io::sink(), len, DEFAULT_BUFFER_SIZE).await
}

/// Copy from `reader` until end-of-file
pub async fn copy_to_end<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut copied = 0u64;

    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|source| TransferError::Read {
                received: copied,
                source,
            })?;
        if n == 0 {
            break;
        }
        copied += n as u64;

        writer
            .write_all(&buf[..n])
            .await
            .map_err(|source| TransferError::Write {
                consumed: copied,
                source,
            })?;
    }

    writer
        .flush()
        .await
        .map_err(|source| TransferError::Write {
            consumed: copied,
            source,
        })?;

    Ok(copied)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[test]
    fn test_buffer_size_from_hint() {
        assert_eq!(buffer_size_from_hint(0), DEFAULT_BUFFER_SIZE);
        assert_eq!(buffer_size_from_hint(4096), 4096);
        assert_eq!(buffer_size_from_hint(u32::MAX), MAX_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_copy_exact_across_chunks_stops_at_boundary() {
        // Body arrives in three pieces and the next frame is already queued
        let mut reader = Builder::new()
            .read(b"he")
            .read(b"l")
            .read(b"lo")
            .read(&[3u8])
            .build();
        let mut sink = Vec::new();

        let copied = copy_exact(&mut reader, &mut sink, 5, 2).await.unwrap();
        assert_eq!(copied, 5);
        assert_eq!(sink, b"hello");

        // The next opcode must still be there
        let next = reader.read_u8().await.unwrap();
        assert_eq!(next, 3);
    }

    #[tokio::test]
    async fn test_copy_exact_does_not_overread_single_chunk() {
        let mut reader: &[u8] = b"abcdefNEXT";
        let mut sink = Vec::new();

        copy_exact(&mut reader, &mut sink, 6, DEFAULT_BUFFER_SIZE)
            .await
            .unwrap();
        assert_eq!(sink, b"abcdef");
        assert_eq!(reader, b"NEXT");
    }

    #[tokio::test]
    async fn test_copy_exact_zero_length() {
        let mut reader: &[u8] = b"untouched";
        let mut sink = Vec::new();

        assert_eq!(copy_exact(&mut reader, &mut sink, 0, 16).await.unwrap(), 0);
        assert!(sink.is_empty());
        assert_eq!(reader, b"untouched");
    }

    #[tokio::test]
    async fn test_copy_exact_short_source() {
        let mut reader: &[u8] = b"abc";
        let mut sink = Vec::new();

        match copy_exact(&mut reader, &mut sink, 5, 16).await {
            Err(TransferError::UnexpectedEof { expected, received }) => {
                assert_eq!(expected, 5);
                assert_eq!(received, 3);
            }
            other => panic!("Expected UnexpectedEof, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_copy_exact_write_failure_reports_consumed() {
        let mut reader: &[u8] = b"0123456789";
        let mut writer = Builder::new()
            .write(b"0123")
            .write_error(io::Error::new(io::ErrorKind::Other, "disk full"))
            .build();

        let err = copy_exact(&mut reader, &mut writer, 10, 4)
            .await
            .unwrap_err();
        assert!(!err.is_source_failure());
        match err {
            TransferError::Write { consumed, .. } => assert_eq!(consumed, 8),
            other => panic!("Expected Write error, got {:?}", other),
        }

        // The caller can drain what is still owed
        discard_exact(&mut reader, 2).await.unwrap();
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_copy_to_end() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = &data[..];
        let mut sink = Vec::new();

        let copied = copy_to_end(&mut reader, &mut sink, 1024).await.unwrap();
        assert_eq!(copied, data.len() as u64);
        assert_eq!(sink, data);
    }

    #[tokio::test]
    async fn test_discard_exact() {
        let mut reader: &[u8] = b"xxxxxKEEP";
        assert_eq!(discard_exact(&mut reader, 5).await.unwrap(), 5);
        assert_eq!(reader, b"KEEP");
    }
}
