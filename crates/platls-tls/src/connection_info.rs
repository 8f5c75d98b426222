//! Negotiated parameters of an established session.

use platls_pki::x509::Certificate;

use crate::provider::{ContextAttributes, StreamSizes};
use crate::{CipherSuite, TlsVersion};

/// Parameters captured when the handshake reaches `Done`.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub protocol_version: TlsVersion,
    pub cipher_suite: CipherSuite,
    /// Negotiated application protocol (ALPN), if any.
    pub alpn_protocol: Option<Vec<u8>>,
    pub stream_sizes: StreamSizes,
    pub granted_attributes: ContextAttributes,
    /// Peer chain as sent, leaf first.
    pub peer_certificates: Vec<Certificate>,
    /// Name the client addressed; `None` on the server.
    pub target_name: Option<String>,
}

impl SessionInfo {
    /// Largest plaintext a single record carries.
    pub fn max_fragment_len(&self) -> usize {
        self.stream_sizes.max_message
    }

    /// Header plus trailer capacity added to each record.
    pub fn record_overhead(&self) -> usize {
        self.stream_sizes.header + self.stream_sizes.trailer
    }

    pub fn alpn_str(&self) -> Option<&str> {
        self.alpn_protocol
            .as_deref()
            .and_then(|p| std::str::from_utf8(p).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> SessionInfo {
        SessionInfo {
            protocol_version: TlsVersion::Tls13,
            cipher_suite: CipherSuite::TLS_AES_128_GCM_SHA256,
            alpn_protocol: Some(b"h2".to_vec()),
            stream_sizes: StreamSizes {
                header: 5,
                trailer: 16,
                max_message: 16384,
            },
            granted_attributes: ContextAttributes::REQUIRED,
            peer_certificates: Vec::new(),
            target_name: Some("example.com".into()),
        }
    }

    #[test]
    fn test_session_info_accessors() {
        let info = info();
        assert_eq!(info.max_fragment_len(), 16384);
        assert_eq!(info.record_overhead(), 21);
        assert_eq!(info.alpn_str(), Some("h2"));
    }

    #[test]
    fn test_non_utf8_alpn() {
        let info = SessionInfo {
            alpn_protocol: Some(vec![0xFF, 0xFE]),
            ..info()
        };
        assert_eq!(info.alpn_str(), None);
    }
}
