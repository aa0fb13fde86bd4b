// Server configuration

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;

/// TCP port the server listens on unless configured otherwise
pub const DEFAULT_PORT: u16 = 3002;

/// Storage root, relative to the working directory
pub const DEFAULT_STORAGE_ROOT: &str = "files";

/// File exchange server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub listen_addr: SocketAddr,
    /// Directory holding one subdirectory per identifier
    pub storage_root: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            storage_root: PathBuf::from(DEFAULT_STORAGE_ROOT),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr,
            storage_root: storage_root.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr.port(), 3002);
        assert!(config.listen_addr.ip().is_unspecified());
        assert_eq!(config.storage_root, PathBuf::from("files"));
    }
}
