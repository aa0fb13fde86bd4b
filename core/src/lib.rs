// fsend-core: peer-addressed file exchange
//
// Clients hold one TCP connection, claim an identifier, and upload, list,
// download-and-remove, or push files into another identifier's storage
// whether or not that peer is online.

pub mod client;
pub mod config;
pub mod protocol;
pub mod server;
pub mod store;
pub mod transfer;

pub use client::{ClientError, FileClient};
pub use config::{ServerConfig, DEFAULT_PORT, DEFAULT_STORAGE_ROOT};
pub use protocol::{Opcode, ProtocolError, Request, MAX_FIELD_LEN};
pub use server::{
    ClientInfo, ClientRegistry, FileServer, RegistryStats, ServerError, Session, SessionEnd,
    SessionError,
};
pub use store::{FileStore, StorageError, StreamedFile};
pub use transfer::{TransferError, DEFAULT_BUFFER_SIZE};
