//! TLS configuration with builder pattern.

use std::fmt;
use std::sync::Arc;

use platls_pki::x509::Certificate;
use platls_pki::{CertError, ChainSelection, VerifyDecision};
use platls_types::{CertErrorKind, TlsError};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CipherSuite, TlsRole, TlsVersion};

/// Private key bytes for the local certificate, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey(Vec<u8>);

impl PrivateKey {
    pub fn new(der: Vec<u8>) -> Self {
        Self(der)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([{} bytes])", self.0.len())
    }
}

/// How the peer certificate is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerVerifyMode {
    /// No certificate is requested or checked.
    None,
    /// The chain is evaluated and findings reported, but they never abort.
    Query,
    /// The chain must validate; a missing peer certificate is an error.
    Verify,
    /// `Verify` for clients, `Query` for servers.
    #[default]
    AutoVerify,
}

impl PeerVerifyMode {
    /// Resolve `AutoVerify` for `role`.
    pub fn effective(self, role: TlsRole) -> PeerVerifyMode {
        match (self, role) {
            (PeerVerifyMode::AutoVerify, TlsRole::Client) => PeerVerifyMode::Verify,
            (PeerVerifyMode::AutoVerify, TlsRole::Server) => PeerVerifyMode::Query,
            (mode, _) => mode,
        }
    }
}

/// A finding the caller accepts in advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoredError {
    pub kind: CertErrorKind,
    /// Restrict the exemption to one certificate; `None` matches any.
    pub certificate: Option<Certificate>,
}

impl IgnoredError {
    pub fn matches(&self, error: &CertError) -> bool {
        self.kind == error.kind
            && match &self.certificate {
                None => true,
                Some(cert) => error.certificate.as_ref() == Some(cert),
            }
    }
}

/// Per-finding callback: decides whether validation continues.
pub type CertErrorCallback = Arc<dyn Fn(&CertError) -> VerifyDecision + Send + Sync>;

/// TLS configuration.
#[derive(Clone)]
pub struct TlsConfig {
    /// Minimum supported TLS version.
    pub min_version: TlsVersion,
    /// Maximum supported TLS version.
    pub max_version: TlsVersion,
    /// Enabled cipher suites; empty means the process defaults.
    pub cipher_suites: Vec<CipherSuite>,
    pub verify_mode: PeerVerifyMode,
    /// Trust anchors in addition to the system roots.
    pub trusted_certs: Vec<Certificate>,
    /// Local certificate chain, leaf first.
    pub certificate_chain: Vec<Certificate>,
    pub private_key: Option<PrivateKey>,
    /// ALPN protocols (in preference order).
    pub alpn_protocols: Vec<Vec<u8>>,
    /// Maximum chain elements inspected; 0 means unlimited.
    pub verify_depth: usize,
    /// Offer the system trust store to the chain engine.
    pub load_system_roots_on_demand: bool,
    /// Name checked against the server certificate instead of the target name.
    pub peer_verify_name: Option<String>,
    pub chain_selection: ChainSelection,
    pub ignored_errors: Vec<IgnoredError>,
    /// Continue past every finding except explicit distrust.
    pub ignore_all_errors: bool,
    pub cert_error_callback: Option<CertErrorCallback>,
    /// Provider calls allowed for one step that keeps asking for credentials.
    pub max_credential_attempts: usize,
    /// Stop reading once this many decrypted bytes are queued; 0 means unlimited.
    pub read_buffer_limit: usize,
    /// Maximum undecoded input held between provider calls; 0 means unlimited.
    pub max_pending: usize,
    /// Validation time (UNIX seconds); `None` uses the current time.
    pub verification_time: Option<i64>,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("min_version", &self.min_version)
            .field("max_version", &self.max_version)
            .field("cipher_suites", &self.cipher_suites)
            .field("verify_mode", &self.verify_mode)
            .field("trusted_certs", &self.trusted_certs.len())
            .field("certificate_chain", &self.certificate_chain.len())
            .field("alpn_protocols", &self.alpn_protocols)
            .field(
                "cert_error_callback",
                &self.cert_error_callback.as_ref().map(|_| "<callback>"),
            )
            .finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Create a builder for TLS configuration.
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }

    /// Reject settings no handshake could succeed with.
    pub fn validate(&self) -> Result<(), TlsError> {
        if self.min_version > self.max_version {
            return Err(TlsError::ConfigurationError(format!(
                "minimum version {} is above maximum version {}",
                self.min_version, self.max_version
            )));
        }
        if !self.certificate_chain.is_empty() && self.private_key.is_none() {
            return Err(TlsError::ConfigurationError(
                "local certificate configured without a private key".into(),
            ));
        }
        if self.certificate_chain.is_empty() && self.private_key.is_some() {
            return Err(TlsError::ConfigurationError(
                "private key configured without a local certificate".into(),
            ));
        }
        if self.max_credential_attempts == 0 {
            return Err(TlsError::ConfigurationError(
                "max_credential_attempts must be at least 1".into(),
            ));
        }
        if self.alpn_protocols.iter().any(|p| p.is_empty() || p.len() > 255) {
            return Err(TlsError::ConfigurationError(
                "application protocol names must be 1..=255 bytes".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for `TlsConfig`.
pub struct TlsConfigBuilder {
    config: TlsConfig,
}

impl Default for TlsConfigBuilder {
    fn default() -> Self {
        Self {
            config: TlsConfig {
                min_version: TlsVersion::Tls12,
                max_version: TlsVersion::Tls13,
                cipher_suites: Vec::new(),
                verify_mode: PeerVerifyMode::AutoVerify,
                trusted_certs: Vec::new(),
                certificate_chain: Vec::new(),
                private_key: None,
                alpn_protocols: Vec::new(),
                verify_depth: 0,
                load_system_roots_on_demand: true,
                peer_verify_name: None,
                chain_selection: ChainSelection::MostTrusted,
                ignored_errors: Vec::new(),
                ignore_all_errors: false,
                cert_error_callback: None,
                max_credential_attempts: 2,
                read_buffer_limit: 0,
                max_pending: 0,
                verification_time: None,
            },
        }
    }
}

impl fmt::Debug for TlsConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl TlsConfigBuilder {
    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.config.min_version = version;
        self
    }

    pub fn max_version(mut self, version: TlsVersion) -> Self {
        self.config.max_version = version;
        self
    }

    pub fn cipher_suites(mut self, suites: &[CipherSuite]) -> Self {
        self.config.cipher_suites = suites.to_vec();
        self
    }

    pub fn verify_mode(mut self, mode: PeerVerifyMode) -> Self {
        self.config.verify_mode = mode;
        self
    }

    pub fn trusted_cert(mut self, cert: Certificate) -> Self {
        self.config.trusted_certs.push(cert);
        self
    }

    pub fn certificate_chain(mut self, certs: Vec<Certificate>) -> Self {
        self.config.certificate_chain = certs;
        self
    }

    pub fn private_key(mut self, key: PrivateKey) -> Self {
        self.config.private_key = Some(key);
        self
    }

    pub fn alpn(mut self, protocols: &[&[u8]]) -> Self {
        self.config.alpn_protocols = protocols.iter().map(|p| p.to_vec()).collect();
        self
    }

    pub fn verify_depth(mut self, depth: usize) -> Self {
        self.config.verify_depth = depth;
        self
    }

    pub fn load_system_roots_on_demand(mut self, enabled: bool) -> Self {
        self.config.load_system_roots_on_demand = enabled;
        self
    }

    pub fn peer_verify_name(mut self, name: &str) -> Self {
        self.config.peer_verify_name = Some(name.to_string());
        self
    }

    pub fn chain_selection(mut self, selection: ChainSelection) -> Self {
        self.config.chain_selection = selection;
        self
    }

    pub fn ignore_error(mut self, kind: CertErrorKind, certificate: Option<Certificate>) -> Self {
        self.config
            .ignored_errors
            .push(IgnoredError { kind, certificate });
        self
    }

    pub fn ignore_all_errors(mut self, enabled: bool) -> Self {
        self.config.ignore_all_errors = enabled;
        self
    }

    pub fn cert_error_callback(mut self, cb: CertErrorCallback) -> Self {
        self.config.cert_error_callback = Some(cb);
        self
    }

    pub fn max_credential_attempts(mut self, attempts: usize) -> Self {
        self.config.max_credential_attempts = attempts;
        self
    }

    pub fn read_buffer_limit(mut self, limit: usize) -> Self {
        self.config.read_buffer_limit = limit;
        self
    }

    pub fn max_pending(mut self, limit: usize) -> Self {
        self.config.max_pending = limit;
        self
    }

    pub fn verification_time(mut self, time: i64) -> Self {
        self.config.verification_time = Some(time);
        self
    }

    pub fn build(self) -> TlsConfig {
        self.config
    }
}
