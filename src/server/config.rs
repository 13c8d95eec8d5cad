//! Server configuration

use std::net::SocketAddr;
use std::path::PathBuf;

/// Limits and socket options for the TLS front end.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// PEM certificate chain
    pub cert_path: PathBuf,

    /// PEM private key
    pub key_path: PathBuf,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Maximum size of the first plaintext request head
    pub max_request_head: usize,

    /// Maximum inbound WebSocket message size
    pub max_message_size: usize,
}

impl ServerConfig {
    pub fn new(
        bind_addr: SocketAddr,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bind_addr,
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            tcp_nodelay: true, // Important for input latency
            max_request_head: 8 * 1024,
            max_message_size: 64 * 1024,
        }
    }

    /// Set TCP_NODELAY behavior
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Set the inbound WebSocket message cap
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ServerConfig {
        ServerConfig::new("0.0.0.0:8443".parse().unwrap(), "/tmp/cert.pem", "/tmp/key.pem")
    }

    #[test]
    fn test_defaults() {
        let config = base();
        assert_eq!(config.bind_addr.port(), 8443);
        assert!(config.tcp_nodelay);
        assert_eq!(config.max_request_head, 8 * 1024);
        assert_eq!(config.max_message_size, 64 * 1024);
    }

    #[test]
    fn test_builder_chaining() {
        let config = base().tcp_nodelay(false).max_message_size(16 * 1024);
        assert!(!config.tcp_nodelay);
        assert_eq!(config.max_message_size, 16 * 1024);
    }
}
