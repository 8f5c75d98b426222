//! Loopback provider.
//!
//! A self-contained [`PlatformSecurityContext`] speaking a small record
//! protocol without any cryptography. Two sessions backed by loopback
//! providers complete a two-flight handshake with each other, exchange
//! checksummed application records and can renegotiate.
//!
//! Record layout: `[content type][length u16][body]`. Application bodies
//! carry `[sequence u16][payload][checksum u32]`.

use std::cell::RefCell;
use std::rc::Rc;

use platls_pki::x509::Certificate;
use platls_pki::{ChainEngine, IssuerChainEngine};
use platls_types::PkiError;
use tracing::trace;

use super::{
    AttributeValue, BufferType, ContextAttribute, ContextAttributes, ContextHandle, ContextRequest,
    ControlToken, CredentialHandle, CredentialRequest, PlatformSecurityContext, ProviderHandle,
    ProviderOutput, ProviderStatus, SecureBuffer, StreamSizes,
};
use crate::{CipherSuite, TlsRole, TlsVersion};

const CONTENT_ALERT: u8 = 0x15;
const CONTENT_HANDSHAKE: u8 = 0x16;
const CONTENT_APPLICATION_DATA: u8 = 0x17;

const HELLO_REQUEST: u8 = 0;
const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;
const FINISHED: u8 = 20;

const ALERT_WARNING: u8 = 1;
const ALERT_FATAL: u8 = 2;
const ALERT_CLOSE_NOTIFY: u8 = 0;
const ALERT_HANDSHAKE_FAILURE: u8 = 40;

const RECORD_HEADER_LEN: usize = 3;
const SEQ_LEN: usize = 2;
const CHECKSUM_LEN: usize = 4;
/// Trailer space advertised to the session; only `CHECKSUM_LEN` is used.
const TRAILER_CAPACITY: usize = 8;
const DEFAULT_MAX_MESSAGE: usize = 16 * 1024;

fn record(content_type: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + body.len());
    out.push(content_type);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn handshake_record(msg_type: u8, body: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(1 + body.len());
    msg.push(msg_type);
    msg.extend_from_slice(body);
    record(CONTENT_HANDSHAKE, &msg)
}

/// A server's request to renegotiate.
pub fn hello_request_record() -> Vec<u8> {
    handshake_record(HELLO_REQUEST, &[])
}

/// The shutdown notification a loopback context emits.
pub fn close_notify_record() -> Vec<u8> {
    record(CONTENT_ALERT, &[ALERT_WARNING, ALERT_CLOSE_NOTIFY])
}

/// Split the first record off `input`: content type, body and total length.
fn split_record(input: &[u8]) -> Result<(u8, &[u8], usize), ProviderStatus> {
    if input.len() < RECORD_HEADER_LEN {
        return Err(ProviderStatus::IncompleteMessage {
            missing: RECORD_HEADER_LEN - input.len(),
        });
    }
    let len = u16::from_be_bytes([input[1], input[2]]) as usize;
    let total = RECORD_HEADER_LEN + len;
    if input.len() < total {
        return Err(ProviderStatus::IncompleteMessage {
            missing: total - input.len(),
        });
    }
    Ok((input[0], &input[RECORD_HEADER_LEN..total], total))
}

fn checksum(seq: u16, payload: &[u8]) -> u32 {
    payload
        .iter()
        .fold(u32::from(seq) ^ 0x9E37_79B9, |acc, &b| acc.rotate_left(5) ^ u32::from(b))
}

/// Cursor over a handshake message body.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Option<u8> {
        let (&b, rest) = self.buf.split_first()?;
        self.buf = rest;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.bytes(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Some(head)
    }
}

/// Counters of handles issued and returned.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HandleLog {
    pub credentials_acquired: usize,
    pub credentials_released: usize,
    pub contexts_created: usize,
    pub contexts_released: usize,
}

#[derive(Debug, Default)]
struct Hooks {
    force_version: Option<TlsVersion>,
    force_alpn: Option<Vec<u8>>,
    withheld_attributes: u32,
    incomplete_credentials_replies: usize,
    fail_encrypt_at: Option<usize>,
}

#[derive(Debug)]
struct LoopbackCredentials {
    handle: u64,
    role: TlsRole,
    min_version: TlsVersion,
    max_version: TlsVersion,
    cipher_suites: Vec<CipherSuite>,
    has_certificate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Server waiting for a ClientHello.
    AwaitHello,
    /// Client sent its hello, waiting for the server's.
    SentHello,
    /// Client sent Finished, waiting for the server's.
    SentFinished,
    /// Server sent its hello, waiting for the client's Finished.
    AwaitFinished,
    Established,
    Closed,
}

#[derive(Debug, Clone)]
struct Negotiated {
    version: TlsVersion,
    cipher_suite: CipherSuite,
    alpn: Option<Vec<u8>>,
}

#[derive(Debug)]
struct LoopbackContext {
    handle: u64,
    phase: Phase,
    requested: ContextAttributes,
    alpn: Vec<Vec<u8>>,
    target_name: Option<String>,
    negotiated: Option<Negotiated>,
    send_seq: u16,
    recv_seq: u16,
    shutdown_pending: bool,
    credential_prompts: usize,
}

impl LoopbackContext {
    fn new(handle: u64, phase: Phase, request: &ContextRequest) -> Self {
        let alpn = request
            .input
            .iter()
            .filter(|b| b.kind == BufferType::ApplicationProtocols)
            .flat_map(|b| SecureBuffer::parse_application_protocols(&b.data))
            .collect();
        Self {
            handle,
            phase,
            requested: request.attributes,
            alpn,
            target_name: request.target_name.clone(),
            negotiated: None,
            send_seq: 0,
            recv_seq: 0,
            shutdown_pending: false,
            credential_prompts: 0,
        }
    }

    fn client_hello(&self, creds: &LoopbackCredentials) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&creds.max_version.wire_value().to_be_bytes());
        body.extend_from_slice(&creds.min_version.wire_value().to_be_bytes());
        body.push(creds.cipher_suites.len().min(255) as u8);
        for suite in creds.cipher_suites.iter().take(255) {
            body.extend_from_slice(&suite.0.to_be_bytes());
        }
        let alpn = SecureBuffer::application_protocols(&self.alpn).data;
        body.extend_from_slice(&(alpn.len() as u16).to_be_bytes());
        body.extend_from_slice(&alpn);
        let name = self.target_name.as_deref().unwrap_or("").as_bytes();
        body.push(name.len().min(255) as u8);
        body.extend_from_slice(&name[..name.len().min(255)]);
        handshake_record(CLIENT_HELLO, &body)
    }

    fn client_step(
        &mut self,
        creds: &LoopbackCredentials,
        hooks: &Hooks,
        msg_type: u8,
        body: &[u8],
    ) -> ProviderOutput {
        match (self.phase, msg_type) {
            (Phase::SentHello, SERVER_HELLO) => {
                let mut r = Reader { buf: body };
                let parsed = (|| {
                    let version = TlsVersion::from_wire(r.u16()?)?;
                    let suite = CipherSuite(r.u16()?);
                    let cert_request = r.u8()? != 0;
                    let alpn_len = r.u8()? as usize;
                    let alpn = r.bytes(alpn_len)?.to_vec();
                    Some((version, suite, cert_request, alpn))
                })();
                let Some((version, cipher_suite, cert_request, alpn)) = parsed else {
                    return ProviderOutput::new(ProviderStatus::MessageAltered);
                };
                if cert_request
                    && !creds.has_certificate
                    && self.credential_prompts < hooks.incomplete_credentials_replies
                {
                    self.credential_prompts += 1;
                    return ProviderOutput::new(ProviderStatus::IncompleteCredentials);
                }
                self.credential_prompts = 0;
                self.negotiated = Some(Negotiated {
                    version,
                    cipher_suite,
                    alpn: (!alpn.is_empty()).then_some(alpn),
                });
                self.phase = Phase::SentFinished;
                ProviderOutput::new(ProviderStatus::ContinueNeeded)
                    .with_buffer(BufferType::Token, handshake_record(FINISHED, &[]))
            }
            (Phase::SentFinished, FINISHED) => {
                self.phase = Phase::Established;
                ProviderOutput::new(ProviderStatus::Ok)
            }
            (Phase::Established, HELLO_REQUEST) => {
                self.phase = Phase::SentHello;
                ProviderOutput::new(ProviderStatus::ContinueNeeded)
                    .with_buffer(BufferType::Token, self.client_hello(creds))
            }
            _ => ProviderOutput::new(ProviderStatus::OutOfSequence),
        }
    }

    fn server_step(
        &mut self,
        creds: &LoopbackCredentials,
        hooks: &Hooks,
        msg_type: u8,
        body: &[u8],
    ) -> ProviderOutput {
        match (self.phase, msg_type) {
            (Phase::AwaitHello | Phase::Established, CLIENT_HELLO) => {
                match self.negotiate(creds, hooks, body) {
                    Ok(hello) => {
                        self.phase = Phase::AwaitFinished;
                        ProviderOutput::new(ProviderStatus::ContinueNeeded)
                            .with_buffer(BufferType::Token, hello)
                    }
                    Err(ProviderStatus::AlgorithmMismatch) => {
                        ProviderOutput::new(ProviderStatus::AlgorithmMismatch).with_buffer(
                            BufferType::Alert,
                            record(CONTENT_ALERT, &[ALERT_FATAL, ALERT_HANDSHAKE_FAILURE]),
                        )
                    }
                    Err(status) => ProviderOutput::new(status),
                }
            }
            (Phase::AwaitFinished, FINISHED) => {
                self.phase = Phase::Established;
                ProviderOutput::new(ProviderStatus::Ok)
                    .with_buffer(BufferType::Token, handshake_record(FINISHED, &[]))
            }
            _ => ProviderOutput::new(ProviderStatus::OutOfSequence),
        }
    }

    /// Parse a ClientHello and build the ServerHello record.
    fn negotiate(
        &mut self,
        creds: &LoopbackCredentials,
        hooks: &Hooks,
        body: &[u8],
    ) -> Result<Vec<u8>, ProviderStatus> {
        let mut r = Reader { buf: body };
        let parsed = (|| {
            let max = TlsVersion::from_wire(r.u16()?)?;
            let min = TlsVersion::from_wire(r.u16()?)?;
            let n = r.u8()? as usize;
            let mut suites = Vec::with_capacity(n);
            for _ in 0..n {
                suites.push(CipherSuite(r.u16()?));
            }
            let alpn_len = r.u16()? as usize;
            let alpn = SecureBuffer::parse_application_protocols(r.bytes(alpn_len)?);
            let name_len = r.u8()? as usize;
            let name = String::from_utf8_lossy(r.bytes(name_len)?).into_owned();
            Some((max, min, suites, alpn, name))
        })();
        let (client_max, client_min, client_suites, client_alpn, name) =
            parsed.ok_or(ProviderStatus::MessageAltered)?;

        let version = match hooks.force_version {
            Some(v) => v,
            None => {
                let chosen = client_max.min(creds.max_version);
                if chosen < client_min.max(creds.min_version) {
                    return Err(ProviderStatus::AlgorithmMismatch);
                }
                chosen
            }
        };
        let cipher_suite = client_suites
            .iter()
            .copied()
            .find(|s| creds.cipher_suites.contains(s))
            .ok_or(ProviderStatus::AlgorithmMismatch)?;
        let alpn = match &hooks.force_alpn {
            Some(forced) => Some(forced.clone()),
            None => self.alpn.iter().find(|p| client_alpn.contains(p)).cloned(),
        };
        trace!(%version, %cipher_suite, sni = %name, "loopback server negotiated");

        let cert_request = self.requested.has(ContextAttributes::MUTUAL_AUTH);
        let mut hello = Vec::new();
        hello.extend_from_slice(&version.wire_value().to_be_bytes());
        hello.extend_from_slice(&cipher_suite.0.to_be_bytes());
        hello.push(u8::from(cert_request));
        let alpn_bytes = alpn.clone().unwrap_or_default();
        hello.push(alpn_bytes.len().min(255) as u8);
        hello.extend_from_slice(&alpn_bytes[..alpn_bytes.len().min(255)]);

        self.negotiated = Some(Negotiated {
            version,
            cipher_suite,
            alpn,
        });
        self.target_name = (!name.is_empty()).then_some(name);
        Ok(handshake_record(SERVER_HELLO, &hello))
    }
}

/// In-process provider for tests and embedding.
pub struct LoopbackProvider {
    versions: Vec<TlsVersion>,
    cipher_suites: Vec<CipherSuite>,
    peer_certificates: Vec<Certificate>,
    system_roots: Vec<Certificate>,
    engine: Box<dyn ChainEngine>,
    max_message: usize,
    hooks: Hooks,
    next_handle: u64,
    credentials: Option<LoopbackCredentials>,
    context: Option<LoopbackContext>,
    encrypt_calls: usize,
    log: Rc<RefCell<HandleLog>>,
}

impl std::fmt::Debug for LoopbackProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackProvider")
            .field("versions", &self.versions)
            .field("cipher_suites", &self.cipher_suites)
            .field("max_message", &self.max_message)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl Default for LoopbackProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self {
            versions: vec![
                TlsVersion::Tls10,
                TlsVersion::Tls11,
                TlsVersion::Tls12,
                TlsVersion::Tls13,
            ],
            cipher_suites: vec![
                CipherSuite::TLS_AES_256_GCM_SHA384,
                CipherSuite::TLS_AES_128_GCM_SHA256,
                CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            ],
            peer_certificates: Vec::new(),
            system_roots: Vec::new(),
            engine: Box::new(IssuerChainEngine::new(Box::new(
                |_: &Certificate, _: &Certificate| true,
            ))),
            max_message: DEFAULT_MAX_MESSAGE,
            hooks: Hooks {
                incomplete_credentials_replies: 1,
                ..Hooks::default()
            },
            next_handle: 1,
            credentials: None,
            context: None,
            encrypt_calls: 0,
            log: Rc::new(RefCell::new(HandleLog::default())),
        }
    }

    pub fn with_versions(mut self, versions: &[TlsVersion]) -> Self {
        self.versions = versions.to_vec();
        self
    }

    pub fn with_cipher_suites(mut self, suites: &[CipherSuite]) -> Self {
        self.cipher_suites = suites.to_vec();
        self
    }

    /// Chain reported as the peer's once the handshake completes.
    pub fn with_peer_certificates(mut self, chain: Vec<Certificate>) -> Self {
        self.peer_certificates = chain;
        self
    }

    pub fn with_system_roots(mut self, roots: Vec<Certificate>) -> Self {
        self.system_roots = roots;
        self
    }

    pub fn with_chain_engine(mut self, engine: Box<dyn ChainEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_max_message(mut self, max_message: usize) -> Self {
        self.max_message = max_message.max(1);
        self
    }

    /// Server: negotiate `version` regardless of either side's range.
    pub fn force_version(mut self, version: TlsVersion) -> Self {
        self.hooks.force_version = Some(version);
        self
    }

    /// Server: select `protocol` whatever the client offered.
    pub fn force_alpn(mut self, protocol: &[u8]) -> Self {
        self.hooks.force_alpn = Some(protocol.to_vec());
        self
    }

    /// Do not grant these requested context attributes.
    pub fn withhold_attributes(mut self, flags: u32) -> Self {
        self.hooks.withheld_attributes = flags;
        self
    }

    /// Client: answer a certificate request this many times with
    /// `IncompleteCredentials` before continuing without a certificate.
    pub fn with_incomplete_credentials_replies(mut self, replies: usize) -> Self {
        self.hooks.incomplete_credentials_replies = replies;
        self
    }

    /// Fail the `n`th encrypt call (1-based).
    pub fn fail_encrypt_at(mut self, n: usize) -> Self {
        self.hooks.fail_encrypt_at = Some(n);
        self
    }

    pub fn handle_log(&self) -> Rc<RefCell<HandleLog>> {
        Rc::clone(&self.log)
    }

    pub fn encrypt_calls(&self) -> usize {
        self.encrypt_calls
    }

    fn issue_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn context_for(&self, handle: &ContextHandle) -> Result<&LoopbackContext, ProviderStatus> {
        self.context
            .as_ref()
            .filter(|c| c.handle == handle.0)
            .ok_or_else(|| ProviderStatus::InternalError("unknown context handle".into()))
    }

    fn negotiated(&self, handle: &ContextHandle) -> Result<&Negotiated, ProviderStatus> {
        self.context_for(handle)?
            .negotiated
            .as_ref()
            .ok_or_else(|| ProviderStatus::InternalError("context not established".into()))
    }

    fn create_context(
        &mut self,
        credentials: &CredentialHandle,
        role: TlsRole,
        request: &ContextRequest,
    ) -> Result<u64, ProviderStatus> {
        match &self.credentials {
            Some(c) if c.handle == credentials.0 && c.role == role => {}
            _ => return Err(ProviderStatus::UnknownCredentials),
        }
        let handle = self.issue_handle();
        let phase = match role {
            TlsRole::Client => Phase::SentHello,
            TlsRole::Server => Phase::AwaitHello,
        };
        self.context = Some(LoopbackContext::new(handle, phase, request));
        self.log.borrow_mut().contexts_created += 1;
        Ok(handle)
    }
}

impl PlatformSecurityContext for LoopbackProvider {
    fn acquire_credentials(
        &mut self,
        request: &CredentialRequest<'_>,
    ) -> Result<CredentialHandle, ProviderStatus> {
        let has_certificate = !request.certificate_chain.is_empty() && request.private_key.is_some();
        if request.role == TlsRole::Server && !has_certificate {
            return Err(ProviderStatus::UnknownCredentials);
        }
        let min_version = self
            .versions
            .iter()
            .copied()
            .filter(|v| *v >= request.min_version && *v <= request.max_version)
            .min()
            .ok_or(ProviderStatus::AlgorithmMismatch)?;
        let max_version = self
            .versions
            .iter()
            .copied()
            .filter(|v| *v >= request.min_version && *v <= request.max_version)
            .max()
            .ok_or(ProviderStatus::AlgorithmMismatch)?;
        let cipher_suites: Vec<CipherSuite> = request
            .cipher_suites
            .iter()
            .copied()
            .filter(|s| self.cipher_suites.contains(s))
            .collect();
        if cipher_suites.is_empty() {
            return Err(ProviderStatus::AlgorithmMismatch);
        }

        let handle = self.issue_handle();
        self.credentials = Some(LoopbackCredentials {
            handle,
            role: request.role,
            min_version,
            max_version,
            cipher_suites,
            has_certificate,
        });
        self.log.borrow_mut().credentials_acquired += 1;
        Ok(CredentialHandle(handle))
    }

    fn initialize_context(
        &mut self,
        credentials: &CredentialHandle,
        request: &ContextRequest,
    ) -> Result<(ContextHandle, ProviderOutput), ProviderStatus> {
        let handle = self.create_context(credentials, TlsRole::Client, request)?;
        let (Some(ctx), Some(creds)) = (self.context.as_ref(), self.credentials.as_ref()) else {
            return Err(ProviderStatus::InternalError("context vanished".into()));
        };
        let hello = ctx.client_hello(creds);
        Ok((
            ContextHandle(handle),
            ProviderOutput::new(ProviderStatus::ContinueNeeded)
                .with_buffer(BufferType::Token, hello),
        ))
    }

    fn accept_context(
        &mut self,
        credentials: &CredentialHandle,
        request: &ContextRequest,
    ) -> Result<ContextHandle, ProviderStatus> {
        self.create_context(credentials, TlsRole::Server, request)
            .map(ContextHandle)
    }

    fn step(&mut self, context: &ContextHandle, input: &[SecureBuffer]) -> ProviderOutput {
        let (Some(ctx), Some(creds)) = (self.context.as_mut(), self.credentials.as_ref()) else {
            return ProviderOutput::new(ProviderStatus::InternalError("no context".into()));
        };
        if ctx.handle != context.0 {
            return ProviderOutput::new(ProviderStatus::InternalError(
                "unknown context handle".into(),
            ));
        }

        if ctx.shutdown_pending {
            ctx.shutdown_pending = false;
            ctx.phase = Phase::Closed;
            return ProviderOutput::new(ProviderStatus::Ok)
                .with_buffer(BufferType::Alert, close_notify_record());
        }

        let token = input
            .iter()
            .find(|b| b.kind == BufferType::Token)
            .map(|b| b.data.as_slice())
            .unwrap_or(&[]);
        let (content_type, body, total) = match split_record(token) {
            Ok(parts) => parts,
            Err(status) => return ProviderOutput::new(status),
        };
        let extra = &token[total..];

        let mut out = match content_type {
            CONTENT_HANDSHAKE => match body.split_first() {
                Some((&msg_type, msg)) => match creds.role {
                    TlsRole::Client => ctx.client_step(creds, &self.hooks, msg_type, msg),
                    TlsRole::Server => ctx.server_step(creds, &self.hooks, msg_type, msg),
                },
                None => ProviderOutput::new(ProviderStatus::MessageAltered),
            },
            CONTENT_ALERT => match body {
                [_, ALERT_CLOSE_NOTIFY] => ProviderOutput::new(ProviderStatus::ContextExpired),
                _ => ProviderOutput::new(ProviderStatus::AlgorithmMismatch),
            },
            _ => ProviderOutput::new(ProviderStatus::OutOfSequence),
        };
        trace!(content_type, status = %out.status, extra = extra.len(), "loopback step");

        if !extra.is_empty() {
            out = out.with_buffer(BufferType::Extra, extra.to_vec());
        }
        out
    }

    fn query_attribute(
        &self,
        context: &ContextHandle,
        attribute: ContextAttribute,
    ) -> Result<AttributeValue, ProviderStatus> {
        let value = match attribute {
            ContextAttribute::StreamSizes => {
                self.negotiated(context)?;
                AttributeValue::StreamSizes(StreamSizes {
                    header: RECORD_HEADER_LEN + SEQ_LEN,
                    trailer: TRAILER_CAPACITY,
                    max_message: self.max_message,
                })
            }
            ContextAttribute::ConnectionInfo => {
                let n = self.negotiated(context)?;
                AttributeValue::ConnectionInfo {
                    version: n.version,
                    cipher_suite: n.cipher_suite,
                }
            }
            ContextAttribute::ApplicationProtocol => {
                AttributeValue::ApplicationProtocol(self.negotiated(context)?.alpn.clone())
            }
            ContextAttribute::RemoteCertificates => {
                self.context_for(context)?;
                AttributeValue::RemoteCertificates(self.peer_certificates.clone())
            }
            ContextAttribute::GrantedAttributes => {
                let ctx = self.context_for(context)?;
                AttributeValue::GrantedAttributes(ContextAttributes(
                    ctx.requested.0 & !self.hooks.withheld_attributes,
                ))
            }
        };
        Ok(value)
    }

    fn encrypt(&mut self, context: &ContextHandle, message: &mut [SecureBuffer]) -> ProviderStatus {
        let max_message = self.max_message;
        let Some(ctx) = self.context.as_mut().filter(|c| c.handle == context.0) else {
            return ProviderStatus::InternalError("unknown context handle".into());
        };
        if ctx.phase == Phase::Closed || ctx.negotiated.is_none() {
            return ProviderStatus::InternalError("context not established".into());
        }

        self.encrypt_calls += 1;
        if self.hooks.fail_encrypt_at == Some(self.encrypt_calls) {
            return ProviderStatus::InternalError("simulated encrypt failure".into());
        }

        let find = |kind: BufferType| message.iter().position(|b| b.kind == kind);
        let (Some(h), Some(d), Some(t)) = (
            find(BufferType::StreamHeader),
            find(BufferType::Data),
            find(BufferType::StreamTrailer),
        ) else {
            return ProviderStatus::InternalError("missing stream buffer".into());
        };
        let payload_len = message[d].data.len();
        if message[h].data.len() < RECORD_HEADER_LEN + SEQ_LEN
            || message[t].data.len() < CHECKSUM_LEN
            || payload_len > max_message
        {
            return ProviderStatus::InternalError("stream buffer too small".into());
        }

        let seq = ctx.send_seq;
        ctx.send_seq = ctx.send_seq.wrapping_add(1);
        let body_len = SEQ_LEN + payload_len + CHECKSUM_LEN;

        let mut header = vec![CONTENT_APPLICATION_DATA];
        header.extend_from_slice(&(body_len as u16).to_be_bytes());
        header.extend_from_slice(&seq.to_be_bytes());
        message[h].data = header;
        message[t].data = checksum(seq, &message[d].data).to_be_bytes().to_vec();
        ProviderStatus::Ok
    }

    fn decrypt(&mut self, context: &ContextHandle, input: &[u8]) -> ProviderOutput {
        let Some(ctx) = self.context.as_mut().filter(|c| c.handle == context.0) else {
            return ProviderOutput::new(ProviderStatus::InternalError(
                "unknown context handle".into(),
            ));
        };
        let (content_type, body, total) = match split_record(input) {
            Ok(parts) => parts,
            Err(status) => return ProviderOutput::new(status),
        };
        let extra = input[total..].to_vec();

        let out = match content_type {
            CONTENT_APPLICATION_DATA => {
                if body.len() < SEQ_LEN + CHECKSUM_LEN {
                    return ProviderOutput::new(ProviderStatus::MessageAltered);
                }
                let seq = u16::from_be_bytes([body[0], body[1]]);
                let payload = &body[SEQ_LEN..body.len() - CHECKSUM_LEN];
                let trailer = &body[body.len() - CHECKSUM_LEN..];
                if seq != ctx.recv_seq {
                    return ProviderOutput::new(ProviderStatus::OutOfSequence);
                }
                if trailer != checksum(seq, payload).to_be_bytes() {
                    return ProviderOutput::new(ProviderStatus::MessageAltered);
                }
                ctx.recv_seq = ctx.recv_seq.wrapping_add(1);
                ProviderOutput::new(ProviderStatus::Ok)
                    .with_buffer(
                        BufferType::StreamHeader,
                        input[..RECORD_HEADER_LEN + SEQ_LEN].to_vec(),
                    )
                    .with_buffer(BufferType::Data, payload.to_vec())
                    .with_buffer(BufferType::StreamTrailer, trailer.to_vec())
            }
            CONTENT_ALERT if body == [ALERT_WARNING, ALERT_CLOSE_NOTIFY] => {
                ctx.phase = Phase::Closed;
                ProviderOutput::new(ProviderStatus::ContextExpired)
            }
            // The handshake record stays in the input for the next step.
            CONTENT_HANDSHAKE => {
                return ProviderOutput::new(ProviderStatus::Renegotiate)
                    .with_buffer(BufferType::Extra, input.to_vec());
            }
            _ => return ProviderOutput::new(ProviderStatus::MessageAltered),
        };

        if extra.is_empty() {
            out
        } else {
            out.with_buffer(BufferType::Extra, extra)
        }
    }

    fn apply_control_token(
        &mut self,
        context: &ContextHandle,
        token: ControlToken,
    ) -> ProviderStatus {
        match self.context.as_mut().filter(|c| c.handle == context.0) {
            Some(ctx) => {
                match token {
                    ControlToken::Shutdown => ctx.shutdown_pending = true,
                }
                ProviderStatus::Ok
            }
            None => ProviderStatus::InternalError("unknown context handle".into()),
        }
    }

    fn release(&mut self, handle: ProviderHandle) {
        let mut log = self.log.borrow_mut();
        match handle {
            ProviderHandle::Credentials(h) => {
                log.credentials_released += 1;
                if self.credentials.as_ref().is_some_and(|c| c.handle == h.0) {
                    self.credentials = None;
                }
            }
            ProviderHandle::Context(h) => {
                log.contexts_released += 1;
                if self.context.as_ref().is_some_and(|c| c.handle == h.0) {
                    self.context = None;
                }
            }
        }
    }

    fn chain_engine(&self) -> &dyn ChainEngine {
        self.engine.as_ref()
    }

    fn system_roots(&self) -> Result<Vec<Certificate>, PkiError> {
        Ok(self.system_roots.clone())
    }

    fn default_cipher_suites(&self) -> Vec<CipherSuite> {
        self.cipher_suites.clone()
    }

    fn supported_versions(&self) -> Vec<TlsVersion> {
        self.versions.clone()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn seal(p: &mut LoopbackProvider, ctx: &ContextHandle, data: &[u8]) -> Vec<u8> {
        let mut msg = [
            SecureBuffer::new(BufferType::StreamHeader, vec![0; 5]),
            SecureBuffer::new(BufferType::Data, data.to_vec()),
            SecureBuffer::new(BufferType::StreamTrailer, vec![0; TRAILER_CAPACITY]),
        ];
        assert_eq!(p.encrypt(ctx, &mut msg), ProviderStatus::Ok);
        msg.iter().flat_map(|b| b.data.iter().copied()).collect()
    }

    #[test]
    fn test_two_flight_handshake_negotiates() {
        let (client, cctx, server, sctx) = established_pair();
        for (p, ctx) in [(&client, &cctx), (&server, &sctx)] {
            match p.query_attribute(ctx, ContextAttribute::ConnectionInfo).unwrap() {
                AttributeValue::ConnectionInfo {
                    version,
                    cipher_suite,
                } => {
                    assert_eq!(version, TlsVersion::Tls13);
                    assert_eq!(cipher_suite, CipherSuite::TLS_AES_128_GCM_SHA256);
                }
                other => panic!("unexpected attribute {other:?}"),
            }
            match p.query_attribute(ctx, ContextAttribute::ApplicationProtocol).unwrap() {
                AttributeValue::ApplicationProtocol(alpn) => {
                    assert_eq!(alpn.as_deref(), Some(&b"h2"[..]))
                }
                other => panic!("unexpected attribute {other:?}"),
            }
        }
    }

    #[test]
    fn test_encrypt_reports_actual_trailer_length() {
        let (mut client, cctx, _, _) = established_pair();
        let wire = seal(&mut client, &cctx, b"hello");
        assert_eq!(wire.len(), 5 + 5 + CHECKSUM_LEN);
    }

    #[test]
    fn test_decrypt_roundtrip_with_extra() {
        let (mut client, cctx, mut server, sctx) = established_pair();
        let mut wire = seal(&mut client, &cctx, b"one");
        wire.extend(seal(&mut client, &cctx, b"two"));
        let out = server.decrypt(&sctx, &wire);
        assert_eq!(out.status, ProviderStatus::Ok);
        assert_eq!(out.plaintext().collect::<Vec<_>>(), vec![&b"one"[..]]);
        assert_eq!(out.extra_len(), 12);
    }

    #[test]
    fn test_decrypt_partial_record_reports_missing() {
        let (mut client, cctx, mut server, sctx) = established_pair();
        let wire = seal(&mut client, &cctx, b"abcdef");
        let out = server.decrypt(&sctx, &wire[..4]);
        assert_eq!(
            out.status,
            ProviderStatus::IncompleteMessage {
                missing: wire.len() - 4
            }
        );
        let out = server.decrypt(&sctx, &wire[..1]);
        assert_eq!(out.status, ProviderStatus::IncompleteMessage { missing: 2 });
    }

    #[test]
    fn test_tampered_record_is_altered() {
        let (mut client, cctx, mut server, sctx) = established_pair();
        let mut wire = seal(&mut client, &cctx, b"payload");
        wire[6] ^= 0xFF;
        let out = server.decrypt(&sctx, &wire);
        assert_eq!(out.status, ProviderStatus::MessageAltered);
    }

    #[test]
    fn test_replayed_record_is_out_of_sequence() {
        let (mut client, cctx, mut server, sctx) = established_pair();
        let wire = seal(&mut client, &cctx, b"once");
        assert_eq!(server.decrypt(&sctx, &wire).status, ProviderStatus::Ok);
        assert_eq!(
            server.decrypt(&sctx, &wire).status,
            ProviderStatus::OutOfSequence
        );
    }

    #[test]
    fn test_handshake_record_after_established_is_renegotiate() {
        let (mut client, cctx, _, _) = established_pair();
        let hello_request = hello_request_record();
        let out = client.decrypt(&cctx, &hello_request);
        assert_eq!(out.status, ProviderStatus::Renegotiate);
        assert_eq!(out.extra_len(), hello_request.len());

        let out = client.step(&cctx, &[SecureBuffer::token(hello_request)]);
        assert_eq!(out.status, ProviderStatus::ContinueNeeded);
        assert!(out.outgoing().next().is_some());
    }

    #[test]
    fn test_shutdown_emits_close_notify() {
        let (mut client, cctx, mut server, sctx) = established_pair();
        assert_eq!(
            client.apply_control_token(&cctx, ControlToken::Shutdown),
            ProviderStatus::Ok
        );
        let out = client.step(&cctx, &[SecureBuffer::empty()]);
        assert_eq!(tokens(&out), close_notify_record());
        let out = server.decrypt(&sctx, &close_notify_record());
        assert_eq!(out.status, ProviderStatus::ContextExpired);
    }

    #[test]
    fn test_server_requires_certificate() {
        let mut server = LoopbackProvider::new();
        let err = server
            .acquire_credentials(&request(TlsRole::Server, &[], None))
            .unwrap_err();
        assert_eq!(err, ProviderStatus::UnknownCredentials);
    }

    #[test]
    fn test_no_common_suite_rejected_at_acquire() {
        let mut p = LoopbackProvider::new().with_cipher_suites(&[CipherSuite::TLS_AES_256_GCM_SHA384]);
        let err = p
            .acquire_credentials(&request(TlsRole::Client, &[], None))
            .unwrap_err();
        assert_eq!(err, ProviderStatus::AlgorithmMismatch);
    }

    #[test]
    fn test_release_is_logged() {
        let mut p = LoopbackProvider::new();
        let log = p.handle_log();
        let cred = p.acquire_credentials(&request(TlsRole::Client, &[], None)).unwrap();
        p.release(ProviderHandle::Credentials(cred));
        assert_eq!(log.borrow().credentials_acquired, 1);
        assert_eq!(log.borrow().credentials_released, 1);
    }
}
