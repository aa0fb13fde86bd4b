// Identifier-partitioned file storage

pub mod files;

pub use files::{FileStore, StorageError, StreamedFile};
