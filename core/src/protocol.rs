//! Wire protocol: opcodes, request headers and response framing
//!
//! Every message starts with a single opcode byte. Multi-byte integers are
//! little-endian and strings carry a one-byte length prefix, which caps
//! filenames and identifiers at 255 bytes. File bodies never pass through
//! this module: they follow the header on the wire and are moved by the
//! transfer engine.

use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Longest string a single length byte can describe
pub const MAX_FIELD_LEN: usize = u8::MAX as usize;

/// Literal reply to PING
pub const PONG: &[u8; 4] = b"pong";

/// Size sent in place of a real file size when STREAM_FILE finds nothing
pub const NOT_FOUND_SENTINEL: u64 = 0;

/// Operation selector carried in the first byte of every request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    PutFile = 0,
    ListFiles = 1,
    StreamFile = 2,
    Ping = 3,
    Bye = 4,
    Register = 5,
    SendToUid = 6,
}

impl Opcode {
    /// Whether the session must have sent REGISTER before this opcode
    pub fn requires_registration(self) -> bool {
        matches!(
            self,
            Opcode::PutFile | Opcode::ListFiles | Opcode::StreamFile | Opcode::SendToUid
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::PutFile => "PUT_FILE",
            Opcode::ListFiles => "LIST_FILES",
            Opcode::StreamFile => "STREAM_FILE",
            Opcode::Ping => "PING",
            Opcode::Bye => "BYE",
            Opcode::Register => "REGISTER",
            Opcode::SendToUid => "SEND_TO_UUID",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(Opcode::PutFile),
            1 => Ok(Opcode::ListFiles),
            2 => Ok(Opcode::StreamFile),
            3 => Ok(Opcode::Ping),
            4 => Ok(Opcode::Bye),
            5 => Ok(Opcode::Register),
            6 => Ok(Opcode::SendToUid),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// Protocol framing errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("Unknown opcode: {0}")]
    UnknownOpcode(u8),
    #[error("{field} too long: {len} bytes (max 255)")]
    FieldTooLong { field: &'static str, len: usize },
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A fully decoded request header
///
/// For PUT_FILE and SEND_TO_UUID exactly `size` raw bytes follow the header
/// on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    PutFile {
        filename: String,
        size: u64,
        /// Copy buffer size the client would like the server to use (0 = default)
        buffer_hint: u32,
    },
    ListFiles,
    StreamFile {
        filename: String,
    },
    Ping,
    Bye,
    Register {
        uid: String,
    },
    SendToUid {
        target: String,
        filename: String,
        size: u64,
    },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::PutFile { .. } => Opcode::PutFile,
            Request::ListFiles => Opcode::ListFiles,
            Request::StreamFile { .. } => Opcode::StreamFile,
            Request::Ping => Opcode::Ping,
            Request::Bye => Opcode::Bye,
            Request::Register { .. } => Opcode::Register,
            Request::SendToUid { .. } => Opcode::SendToUid,
        }
    }

    /// Number of raw body bytes that follow this header
    pub fn body_len(&self) -> u64 {
        match self {
            Request::PutFile { size, .. } | Request::SendToUid { size, .. } => *size,
            _ => 0,
        }
    }

    /// Encode the opcode byte and header fields.
    ///
    /// Oversized strings are rejected here, before anything is framed.
    pub fn encode_header(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = vec![self.opcode() as u8];
        match self {
            Request::PutFile {
                filename,
                size,
                buffer_hint,
            } => {
                put_string(&mut buf, "filename", filename)?;
                buf.extend_from_slice(&size.to_le_bytes());
                buf.extend_from_slice(&buffer_hint.to_le_bytes());
            }
            Request::StreamFile { filename } => {
                put_string(&mut buf, "filename", filename)?;
            }
            Request::Register { uid } => {
                put_string(&mut buf, "identifier", uid)?;
            }
            Request::SendToUid {
                target,
                filename,
                size,
            } => {
                put_string(&mut buf, "target identifier", target)?;
                put_string(&mut buf, "filename", filename)?;
                buf.extend_from_slice(&size.to_le_bytes());
            }
            Request::ListFiles | Request::Ping | Request::Bye => {}
        }
        Ok(buf)
    }
}

/// Check that `value` fits behind a single length byte
pub fn validate_field(field: &'static str, value: &str) -> Result<(), ProtocolError> {
    if value.len() > MAX_FIELD_LEN {
        return Err(ProtocolError::FieldTooLong {
            field,
            len: value.len(),
        });
    }
    Ok(())
}

fn put_string(buf: &mut Vec<u8>, field: &'static str, value: &str) -> Result<(), ProtocolError> {
    validate_field(field, value)?;
    buf.push(value.len() as u8);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

async fn read_string<R>(reader: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u8().await? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Read the next opcode byte.
///
/// End-of-stream before the byte is `ConnectionClosed`; that is how an
/// orderly disconnect without BYE looks.
pub async fn read_opcode<R>(reader: &mut R) -> Result<Opcode, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut byte = [0u8; 1];
    if reader.read(&mut byte).await? == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }
    Opcode::try_from(byte[0])
}

/// Read the header fields that follow `opcode`
pub async fn read_request<R>(opcode: Opcode, reader: &mut R) -> Result<Request, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let request = match opcode {
        Opcode::PutFile => {
            let filename = read_string(reader).await?;
            let size = reader.read_u64_le().await?;
            let buffer_hint = reader.read_u32_le().await?;
            Request::PutFile {
                filename,
                size,
                buffer_hint,
            }
        }
        Opcode::ListFiles => Request::ListFiles,
        Opcode::StreamFile => Request::StreamFile {
            filename: read_string(reader).await?,
        },
        Opcode::Ping => Request::Ping,
        Opcode::Bye => Request::Bye,
        Opcode::Register => Request::Register {
            uid: read_string(reader).await?,
        },
        Opcode::SendToUid => {
            let target = read_string(reader).await?;
            let filename = read_string(reader).await?;
            let size = reader.read_u64_le().await?;
            Request::SendToUid {
                target,
                filename,
                size,
            }
        }
    };
    Ok(request)
}

// ============================================================================
// RESPONSES
// ============================================================================

/// Encode a LIST_FILES response.
///
/// Names that cannot be length-prefixed are left out rather than truncated,
/// so the count always matches the entries that follow.
pub fn encode_file_list(names: &[String]) -> Vec<u8> {
    let listed: Vec<&String> = names
        .iter()
        .filter(|name| {
            if name.len() > MAX_FIELD_LEN {
                warn!(name = %name, len = name.len(), "Skipping unlistable filename");
                false
            } else {
                true
            }
        })
        .collect();

    let mut buf = Vec::with_capacity(4 + listed.iter().map(|n| n.len() + 1).sum::<usize>());
    buf.extend_from_slice(&(listed.len() as u32).to_le_bytes());
    for name in listed {
        buf.push(name.len() as u8);
        buf.extend_from_slice(name.as_bytes());
    }
    buf
}

/// Read a LIST_FILES response
pub async fn read_file_list<R>(reader: &mut R) -> Result<Vec<String>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let count = reader.read_u32_le().await?;
    let mut names = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        names.push(read_string(reader).await?);
    }
    Ok(names)
}

/// Write the 8-byte size field that opens a STREAM_FILE response
pub async fn write_file_size<W>(writer: &mut W, size: u64) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_u64_le(size).await?;
    Ok(())
}

pub async fn read_file_size<R>(reader: &mut R) -> Result<u64, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    Ok(reader.read_u64_le().await?)
}

/// Read and check the reply to PING
pub async fn read_pong<R>(reader: &mut R) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut reply = [0u8; 4];
    reader.read_exact(&mut reply).await?;
    if &reply != PONG {
        return Err(ProtocolError::UnexpectedResponse(
            String::from_utf8_lossy(&reply).into_owned(),
        ));
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_from_byte() {
        assert_eq!(Opcode::try_from(0).unwrap(), Opcode::PutFile);
        assert_eq!(Opcode::try_from(3).unwrap(), Opcode::Ping);
        assert_eq!(Opcode::try_from(6).unwrap(), Opcode::SendToUid);
        assert!(matches!(
            Opcode::try_from(7),
            Err(ProtocolError::UnknownOpcode(7))
        ));
        assert!(matches!(
            Opcode::try_from(0xff),
            Err(ProtocolError::UnknownOpcode(0xff))
        ));
    }

    #[test]
    fn test_registration_gating() {
        assert!(!Opcode::Register.requires_registration());
        assert!(!Opcode::Ping.requires_registration());
        assert!(!Opcode::Bye.requires_registration());
        assert!(Opcode::PutFile.requires_registration());
        assert!(Opcode::ListFiles.requires_registration());
        assert!(Opcode::StreamFile.requires_registration());
        assert!(Opcode::SendToUid.requires_registration());
    }

    #[test]
    fn test_encode_put_file_header() {
        let request = Request::PutFile {
            filename: "hello.txt".to_string(),
            size: 5,
            buffer_hint: 0,
        };
        let bytes = request.encode_header().unwrap();

        let mut expected = vec![0u8, 9];
        expected.extend_from_slice(b"hello.txt");
        expected.extend_from_slice(&5u64.to_le_bytes());
        expected.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(bytes, expected);
        assert_eq!(request.body_len(), 5);
    }

    #[test]
    fn test_encode_send_to_uid_header() {
        let request = Request::SendToUid {
            target: "b1".to_string(),
            filename: "r.pdf".to_string(),
            size: 0x0102,
        };
        let bytes = request.encode_header().unwrap();
        assert_eq!(bytes[0], 6);
        assert_eq!(&bytes[1..4], &[2, b'b', b'1']);
        assert_eq!(&bytes[4..10], &[5, b'r', b'.', b'p', b'd', b'f']);
        assert_eq!(&bytes[10..], &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_bare_opcodes_encode_to_one_byte() {
        assert_eq!(Request::ListFiles.encode_header().unwrap(), vec![1]);
        assert_eq!(Request::Ping.encode_header().unwrap(), vec![3]);
        assert_eq!(Request::Bye.encode_header().unwrap(), vec![4]);
    }

    #[test]
    fn test_field_length_boundary() {
        let max = "a".repeat(255);
        let request = Request::Register { uid: max.clone() };
        let bytes = request.encode_header().unwrap();
        assert_eq!(bytes[1], 255);
        assert_eq!(bytes.len(), 2 + 255);

        let too_long = Request::StreamFile {
            filename: "a".repeat(256),
        };
        match too_long.encode_header() {
            Err(ProtocolError::FieldTooLong { field, len }) => {
                assert_eq!(field, "filename");
                assert_eq!(len, 256);
            }
            other => panic!("Expected FieldTooLong, got {:?}", other),
        }
    }

    #[test]
    fn test_length_counts_bytes_not_chars() {
        // 128 two-byte characters = 256 bytes
        let name = "é".repeat(128);
        assert!(validate_field("filename", &name).is_err());
        assert!(validate_field("filename", &"é".repeat(127)).is_ok());
    }

    #[tokio::test]
    async fn test_read_request_matches_encoding() {
        let request = Request::SendToUid {
            target: "target-uid".to_string(),
            filename: "report.pdf".to_string(),
            size: 1 << 40,
        };
        let bytes = request.encode_header().unwrap();
        let mut reader = &bytes[..];

        let opcode = read_opcode(&mut reader).await.unwrap();
        assert_eq!(opcode, Opcode::SendToUid);
        let decoded = read_request(opcode, &mut reader).await.unwrap();
        assert_eq!(decoded, request);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_read_opcode_at_end_of_stream() {
        let mut reader: &[u8] = &[];
        assert!(matches!(
            read_opcode(&mut reader).await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_truncated_header_is_io_error() {
        // filename claims 10 bytes but only 3 arrive
        let bytes = [10u8, b'a', b'b', b'c'];
        let mut reader = &bytes[..];
        match read_request(Opcode::StreamFile, &mut reader).await {
            Err(ProtocolError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("Expected Io error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_decoded_lossily() {
        let bytes = [2u8, 0xff, b'x'];
        let mut reader = &bytes[..];
        let request = read_request(Opcode::Register, &mut reader).await.unwrap();
        assert_eq!(
            request,
            Request::Register {
                uid: "\u{fffd}x".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_file_list_framing() {
        let names = vec!["a.txt".to_string(), "b".to_string()];
        let bytes = encode_file_list(&names);
        assert_eq!(&bytes[..4], &2u32.to_le_bytes());

        let mut reader = &bytes[..];
        let decoded = read_file_list(&mut reader).await.unwrap();
        assert_eq!(decoded, names);
    }

    #[test]
    fn test_file_list_skips_unlistable_names() {
        let names = vec!["ok".to_string(), "x".repeat(300)];
        let bytes = encode_file_list(&names);
        assert_eq!(&bytes[..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..], &[2, b'o', b'k']);
    }

    #[test]
    fn test_empty_file_list() {
        assert_eq!(encode_file_list(&[]), 0u32.to_le_bytes().to_vec());
    }

    #[tokio::test]
    async fn test_pong() {
        let mut ok: &[u8] = b"pong";
        assert!(read_pong(&mut ok).await.is_ok());

        let mut bad: &[u8] = b"ping";
        assert!(matches!(
            read_pong(&mut bad).await,
            Err(ProtocolError::UnexpectedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_file_size_field() {
        let mut out = Vec::new();
        write_file_size(&mut out, 5).await.unwrap();
        assert_eq!(out, vec![5, 0, 0, 0, 0, 0, 0, 0]);

        let mut reader = &out[..];
        assert_eq!(read_file_size(&mut reader).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_codec_over_trait_objects() {
        let mut out = Vec::new();
        {
            let writer: &mut (dyn AsyncWrite + Unpin) = &mut out;
            write_file_size(writer, 9).await.unwrap();
        }
        out.extend(encode_file_list(&["x".to_string()]));
        out.extend_from_slice(PONG);
        out.push(Opcode::Register as u8);
        out.extend_from_slice(&[2, b'i', b'd']);

        let mut bytes = &out[..];
        let reader: &mut (dyn AsyncRead + Unpin) = &mut bytes;
        assert_eq!(read_file_size(reader).await.unwrap(), 9);
        assert_eq!(read_file_list(reader).await.unwrap(), vec!["x"]);
        read_pong(reader).await.unwrap();
        let opcode = read_opcode(reader).await.unwrap();
        assert_eq!(
            read_request(opcode, reader).await.unwrap(),
            Request::Register { uid: "id".into() }
        );
    }
}
