//! Platform security provider seam.
//!
//! The provider owns every cryptographic step and the wire format of
//! handshake and application records. The session only moves bytes between
//! the transport and the provider and interprets the provider's status codes.

pub mod loopback;

use std::fmt;

use platls_pki::x509::Certificate;
use platls_pki::ChainEngine;
use platls_types::PkiError;

use crate::config::PrivateKey;
use crate::{CipherSuite, TlsRole, TlsVersion};

/// Credential handle issued by [`PlatformSecurityContext::acquire_credentials`].
///
/// Not `Clone`: a handle is released exactly once by passing it back by value.
#[derive(Debug, PartialEq, Eq)]
pub struct CredentialHandle(pub u64);

/// Security context handle for one handshake/session.
#[derive(Debug, PartialEq, Eq)]
pub struct ContextHandle(pub u64);

/// A handle being returned to the provider.
#[derive(Debug, PartialEq, Eq)]
pub enum ProviderHandle {
    Credentials(CredentialHandle),
    Context(ContextHandle),
}

/// Tag of a [`SecureBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    /// Handshake bytes, inbound or outbound.
    Token,
    /// An alert the provider wants sent to the peer.
    Alert,
    /// Application data (plaintext before encrypt, after decrypt).
    Data,
    StreamHeader,
    StreamTrailer,
    /// Application protocol list offered by the local side.
    ApplicationProtocols,
    /// Input suffix the provider did not consume.
    Extra,
    Empty,
}

/// A tagged byte span passed to and from the provider.
#[derive(Clone, PartialEq, Eq)]
pub struct SecureBuffer {
    pub kind: BufferType,
    pub data: Vec<u8>,
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBuffer({:?}, {} bytes)", self.kind, self.data.len())
    }
}

impl SecureBuffer {
    pub fn new(kind: BufferType, data: Vec<u8>) -> Self {
        Self { kind, data }
    }

    pub fn token(data: Vec<u8>) -> Self {
        Self::new(BufferType::Token, data)
    }

    pub fn empty() -> Self {
        Self::new(BufferType::Empty, Vec::new())
    }

    /// Encode a protocol list as length-prefixed entries.
    pub fn application_protocols(protocols: &[Vec<u8>]) -> Self {
        let mut data = Vec::new();
        for p in protocols {
            // Protocol identifiers are at most 255 bytes.
            data.push(p.len().min(255) as u8);
            data.extend_from_slice(&p[..p.len().min(255)]);
        }
        Self::new(BufferType::ApplicationProtocols, data)
    }

    /// Decode an [`BufferType::ApplicationProtocols`] payload.
    pub fn parse_application_protocols(data: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut rest = data;
        while let Some((&len, tail)) = rest.split_first() {
            let len = len as usize;
            if tail.len() < len {
                break;
            }
            out.push(tail[..len].to_vec());
            rest = &tail[len..];
        }
        out
    }
}

/// Status returned by provider calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Ok,
    /// Send the output token and feed the next peer message.
    ContinueNeeded,
    /// The input does not yet hold a complete record.
    IncompleteMessage { missing: usize },
    /// The peer asked for a client certificate the credentials do not carry.
    IncompleteCredentials,
    MessageAltered,
    OutOfSequence,
    /// The peer started a new handshake on an established context.
    Renegotiate,
    /// The peer closed the context.
    ContextExpired,
    /// No protocol version or cipher suite in common.
    AlgorithmMismatch,
    UnknownCredentials,
    InternalError(String),
}

impl ProviderStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ProviderStatus::Ok)
    }
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderStatus::Ok => f.write_str("ok"),
            ProviderStatus::ContinueNeeded => f.write_str("continue needed"),
            ProviderStatus::IncompleteMessage { missing } => {
                write!(f, "incomplete message ({missing} bytes missing)")
            }
            ProviderStatus::IncompleteCredentials => f.write_str("incomplete credentials"),
            ProviderStatus::MessageAltered => f.write_str("message altered"),
            ProviderStatus::OutOfSequence => f.write_str("message out of sequence"),
            ProviderStatus::Renegotiate => f.write_str("renegotiate"),
            ProviderStatus::ContextExpired => f.write_str("context expired"),
            ProviderStatus::AlgorithmMismatch => f.write_str("algorithm mismatch"),
            ProviderStatus::UnknownCredentials => f.write_str("unknown credentials"),
            ProviderStatus::InternalError(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

/// Status plus the buffers produced by a `step` or `decrypt` call.
#[derive(Debug, Clone)]
pub struct ProviderOutput {
    pub status: ProviderStatus,
    pub buffers: Vec<SecureBuffer>,
}

impl ProviderOutput {
    pub fn new(status: ProviderStatus) -> Self {
        Self {
            status,
            buffers: Vec::new(),
        }
    }

    pub fn with_buffer(mut self, kind: BufferType, data: Vec<u8>) -> Self {
        self.buffers.push(SecureBuffer::new(kind, data));
        self
    }

    /// Bytes to send to the peer, in order (tokens and alerts).
    pub fn outgoing(&self) -> impl Iterator<Item = &[u8]> {
        self.buffers
            .iter()
            .filter(|b| matches!(b.kind, BufferType::Token | BufferType::Alert))
            .map(|b| b.data.as_slice())
    }

    /// Decrypted application bytes.
    pub fn plaintext(&self) -> impl Iterator<Item = &[u8]> {
        self.buffers
            .iter()
            .filter(|b| b.kind == BufferType::Data)
            .map(|b| b.data.as_slice())
    }

    /// Length of the input suffix the provider left unconsumed.
    pub fn extra_len(&self) -> usize {
        self.buffers
            .iter()
            .filter(|b| b.kind == BufferType::Extra)
            .map(|b| b.data.len())
            .sum()
    }
}

/// Context attribute flags requested by the session and granted by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextAttributes(pub u32);

impl ContextAttributes {
    pub const CONFIDENTIALITY: u32 = 0x0001;
    pub const REPLAY_DETECT: u32 = 0x0002;
    pub const SEQUENCE_DETECT: u32 = 0x0004;
    pub const STREAM: u32 = 0x0008;
    pub const MUTUAL_AUTH: u32 = 0x0010;
    /// Output buffers are allocated by the provider.
    pub const ALLOCATE_MEMORY: u32 = 0x0020;

    /// Attributes every session requires.
    pub const REQUIRED: ContextAttributes = ContextAttributes(
        Self::CONFIDENTIALITY | Self::REPLAY_DETECT | Self::SEQUENCE_DETECT | Self::STREAM,
    );

    pub fn has(&self, flags: u32) -> bool {
        self.0 & flags == flags
    }

    pub fn contains(&self, other: ContextAttributes) -> bool {
        self.has(other.0)
    }

    pub fn with(self, flags: u32) -> Self {
        Self(self.0 | flags)
    }
}

/// Per-record framing sizes of an established context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSizes {
    pub header: usize,
    pub trailer: usize,
    pub max_message: usize,
}

/// Attributes the session can query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextAttribute {
    StreamSizes,
    ConnectionInfo,
    ApplicationProtocol,
    RemoteCertificates,
    GrantedAttributes,
}

/// Value of a queried attribute.
#[derive(Debug, Clone)]
pub enum AttributeValue {
    StreamSizes(StreamSizes),
    ConnectionInfo {
        version: TlsVersion,
        cipher_suite: CipherSuite,
    },
    ApplicationProtocol(Option<Vec<u8>>),
    /// Peer chain as decoded by the platform codec, leaf first.
    RemoteCertificates(Vec<Certificate>),
    GrantedAttributes(ContextAttributes),
}

/// Control tokens applied to an established context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    /// Prepare a shutdown notification; the next `step` emits it.
    Shutdown,
}

/// Local identity and protocol limits for credential acquisition.
#[derive(Debug, Clone, Copy)]
pub struct CredentialRequest<'a> {
    pub role: TlsRole,
    pub min_version: TlsVersion,
    pub max_version: TlsVersion,
    pub cipher_suites: &'a [CipherSuite],
    pub certificate_chain: &'a [Certificate],
    pub private_key: Option<&'a PrivateKey>,
}

/// Parameters for creating a security context.
#[derive(Debug, Clone)]
pub struct ContextRequest {
    /// Name the client addresses (SNI); `None` on the server.
    pub target_name: Option<String>,
    pub attributes: ContextAttributes,
    /// Holds a [`BufferType::ApplicationProtocols`] buffer when ALPN is configured.
    pub input: Vec<SecureBuffer>,
}

/// Platform security provider.
///
/// Output buffers are returned as owned values, so they are released on
/// every exit path by ordinary drops.
pub trait PlatformSecurityContext {
    fn acquire_credentials(
        &mut self,
        request: &CredentialRequest<'_>,
    ) -> Result<CredentialHandle, ProviderStatus>;

    /// Client: create the context and produce the first handshake token.
    fn initialize_context(
        &mut self,
        credentials: &CredentialHandle,
        request: &ContextRequest,
    ) -> Result<(ContextHandle, ProviderOutput), ProviderStatus>;

    /// Server: create a context that waits for the client's first flight.
    fn accept_context(
        &mut self,
        credentials: &CredentialHandle,
        request: &ContextRequest,
    ) -> Result<ContextHandle, ProviderStatus>;

    /// Feed peer handshake bytes (a [`BufferType::Token`] buffer) to the context.
    fn step(&mut self, context: &ContextHandle, input: &[SecureBuffer]) -> ProviderOutput;

    fn query_attribute(
        &self,
        context: &ContextHandle,
        attribute: ContextAttribute,
    ) -> Result<AttributeValue, ProviderStatus>;

    /// Encrypt `message` in place.
    ///
    /// `message` holds a header, a data and a trailer buffer sized from
    /// [`StreamSizes`]; the provider may shrink them to their actual length.
    fn encrypt(&mut self, context: &ContextHandle, message: &mut [SecureBuffer]) -> ProviderStatus;

    /// Decrypt one record from the front of `input`.
    fn decrypt(&mut self, context: &ContextHandle, input: &[u8]) -> ProviderOutput;

    fn apply_control_token(&mut self, context: &ContextHandle, token: ControlToken)
        -> ProviderStatus;

    fn release(&mut self, handle: ProviderHandle);

    /// The platform chain engine used to evaluate peer certificates.
    fn chain_engine(&self) -> &dyn ChainEngine;

    /// Snapshot of the system trust store.
    fn system_roots(&self) -> Result<Vec<Certificate>, PkiError>;

    fn default_cipher_suites(&self) -> Vec<CipherSuite>;

    fn supported_versions(&self) -> Vec<TlsVersion>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_protocols_roundtrip_list() {
        let protos = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        let buf = SecureBuffer::application_protocols(&protos);
        assert_eq!(buf.kind, BufferType::ApplicationProtocols);
        assert_eq!(SecureBuffer::parse_application_protocols(&buf.data), protos);
    }

    #[test]
    fn test_truncated_protocol_list_stops() {
        assert_eq!(
            SecureBuffer::parse_application_protocols(&[2, b'h', b'2', 5, b'x']),
            vec![b"h2".to_vec()]
        );
    }

    #[test]
    fn test_output_accessors() {
        let out = ProviderOutput::new(ProviderStatus::Ok)
            .with_buffer(BufferType::Token, vec![1, 2])
            .with_buffer(BufferType::Data, vec![3])
            .with_buffer(BufferType::Alert, vec![4])
            .with_buffer(BufferType::Extra, vec![0; 7]);
        let outgoing: Vec<&[u8]> = out.outgoing().collect();
        assert_eq!(outgoing, vec![&[1u8, 2][..], &[4u8][..]]);
        assert_eq!(out.plaintext().collect::<Vec<_>>(), vec![&[3u8][..]]);
        assert_eq!(out.extra_len(), 7);
    }

    #[test]
    fn test_required_attributes() {
        let granted = ContextAttributes::REQUIRED.with(ContextAttributes::MUTUAL_AUTH);
        assert!(granted.contains(ContextAttributes::REQUIRED));
        let partial = ContextAttributes(ContextAttributes::CONFIDENTIALITY);
        assert!(!partial.contains(ContextAttributes::REQUIRED));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(
            ProviderStatus::IncompleteMessage { missing: 3 }.to_string(),
            "incomplete message (3 bytes missing)"
        );
    }
}
