/// Kinds of certificate trust findings raised while validating a peer chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum CertErrorKind {
    // Validity window
    #[error("the certificate is not yet valid")]
    CertificateNotYetValid,
    #[error("the certificate has expired")]
    CertificateExpired,

    // Revocation and distrust
    #[error("the certificate has been revoked")]
    CertificateRevoked,
    #[error("the certificate is blacklisted")]
    CertificateBlacklisted,

    // Signature and purpose
    #[error("the certificate signature is invalid")]
    CertificateSignatureFailed,
    #[error("the certificate is invalid for this purpose")]
    InvalidPurpose,

    // Chain shape
    #[error("the certificate is self-signed and untrusted")]
    SelfSignedCertificate,
    #[error("a self-signed certificate in the chain is untrusted")]
    SelfSignedCertificateInChain,
    #[error("the root CA certificate is not trusted")]
    CertificateUntrusted,
    #[error("the issuer certificate could not be found")]
    UnableToGetIssuerCertificate,
    #[error("an intermediate certificate is not a valid CA certificate")]
    InvalidCaCertificate,
    #[error("the basicConstraints path length was exceeded")]
    PathLengthExceeded,
    #[error("the certificate chain is longer than the verify depth")]
    ChainTooLong,

    // Peer identity
    #[error("the host name did not match any of the valid hosts")]
    HostNameMismatch,
    #[error("the peer did not present any certificate")]
    NoPeerCertificate,
}

impl CertErrorKind {
    /// Whether this finding marks an explicitly distrusted certificate.
    ///
    /// Such findings are only continued when overridden one by one.
    pub fn is_distrust(&self) -> bool {
        matches!(self, CertErrorKind::CertificateBlacklisted)
    }
}

/// TLS session errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("configuration error: {0}")]
    ConfigurationError(String),
    #[error("credential error: {0}")]
    CredentialError(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("certificate trust error: {kind}")]
    TrustError {
        kind: CertErrorKind,
        /// Position of the offending certificate in the chain (0 = leaf).
        depth: Option<usize>,
    },
    #[error("connection closed by peer")]
    PeerClosed,
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("resource error: {0}")]
    ResourceError(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Certificate handling errors raised by chain engines and codecs.
#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    #[error("invalid certificate: {0}")]
    InvalidCert(String),
    #[error("certificate chain could not be built: {0}")]
    ChainBuildFailed(String),
    #[error("trust store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<PkiError> for TlsError {
    fn from(e: PkiError) -> Self {
        TlsError::ResourceError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trust_error_display_names_kind() {
        let err = TlsError::TrustError {
            kind: CertErrorKind::CertificateExpired,
            depth: Some(0),
        };
        assert_eq!(
            err.to_string(),
            "certificate trust error: the certificate has expired"
        );
    }

    #[test]
    fn test_only_blacklisted_is_distrust() {
        assert!(CertErrorKind::CertificateBlacklisted.is_distrust());
        assert!(!CertErrorKind::CertificateRevoked.is_distrust());
        assert!(!CertErrorKind::HostNameMismatch.is_distrust());
    }

    #[test]
    fn test_pki_error_maps_to_resource_error() {
        let err: TlsError = PkiError::StoreUnavailable("root store locked".into()).into();
        match err {
            TlsError::ResourceError(msg) => assert!(msg.contains("root store locked")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: TlsError = io.into();
        assert!(matches!(err, TlsError::IoError(_)));
    }
}
