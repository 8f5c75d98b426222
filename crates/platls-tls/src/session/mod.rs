//! TLS session facade.
//!
//! A [`TlsSession`] owns one provider, one transport and the handshake and
//! stream state between them. It is sans-IO: nothing blocks, and
//! [`TlsSession::transmit`] is the single driver the owner calls whenever the
//! transport has new bytes or the application queued data.

mod handshake;

use std::collections::VecDeque;

use platls_pki::x509::Certificate;
use platls_pki::{CertError, TrustEvaluation};
use platls_types::TlsError;
use tracing::{debug, warn};

use crate::config::TlsConfig;
use crate::connection_info::SessionInfo;
use crate::defaults::{DefaultsCell, PROCESS_DEFAULTS};
use crate::handshake::{Abort, HandshakeMachine, HandshakeState};
use crate::provider::{
    ContextHandle, ControlToken, CredentialHandle, PlatformSecurityContext, ProviderHandle,
    ProviderOutput, SecureBuffer,
};
use crate::record::RecordAssembler;
use crate::stream::{DecodeOutcome, EncryptedStreamCodec};
use crate::transport::{send_all, Transport};
use crate::{CipherSuite, TlsRole};

/// Size of one transport read.
const READ_CHUNK: usize = 16 * 1024;

/// Notifications for the owner of a session, drained with [`TlsSession::poll_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The handshake completed and application data may flow.
    Encrypted,
    /// Trust findings the policy allowed to continue.
    CertificateErrors(Vec<CertError>),
    /// The peer closed the session.
    PeerClosed,
    /// The session was torn down.
    Disconnected,
    /// The peer started a renegotiation; call `transmit` again.
    FollowUpRequested,
}

/// One TLS endpoint over a platform provider and a transport.
pub struct TlsSession<P: PlatformSecurityContext, T: Transport> {
    role: TlsRole,
    config: TlsConfig,
    provider: P,
    transport: T,
    defaults: &'static DefaultsCell,
    machine: HandshakeMachine,
    credentials: Option<CredentialHandle>,
    context: Option<ContextHandle>,
    assembler: RecordAssembler,
    codec: EncryptedStreamCodec,
    /// Transport read scratch, reused across reads.
    read_buf: Vec<u8>,
    info: Option<SessionInfo>,
    peer_chain: Vec<Certificate>,
    evaluation: TrustEvaluation,
    target_name: Option<String>,
    /// A handshake was started and the session not torn down since.
    active: bool,
    closed: bool,
    renegotiating: bool,
    follow_up: bool,
    credential_attempts: usize,
    events: VecDeque<SessionEvent>,
}

impl<P: PlatformSecurityContext, T: Transport> std::fmt::Debug for TlsSession<P, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("role", &self.role)
            .field("state", &self.machine.state())
            .field("active", &self.active)
            .field("closed", &self.closed)
            .field("pending", &self.assembler.len())
            .finish_non_exhaustive()
    }
}

impl<P: PlatformSecurityContext, T: Transport> TlsSession<P, T> {
    pub fn new(role: TlsRole, config: TlsConfig, provider: P, transport: T) -> Self {
        Self {
            role,
            assembler: RecordAssembler::with_limit(config.max_pending),
            config,
            provider,
            transport,
            defaults: &PROCESS_DEFAULTS,
            machine: HandshakeMachine::new(),
            credentials: None,
            context: None,
            codec: EncryptedStreamCodec::new(),
            read_buf: vec![0u8; READ_CHUNK],
            info: None,
            peer_chain: Vec::new(),
            evaluation: TrustEvaluation::default(),
            target_name: None,
            active: false,
            closed: false,
            renegotiating: false,
            follow_up: false,
            credential_attempts: 0,
            events: VecDeque::new(),
        }
    }

    pub fn client(config: TlsConfig, provider: P, transport: T) -> Self {
        Self::new(TlsRole::Client, config, provider, transport)
    }

    pub fn server(config: TlsConfig, provider: P, transport: T) -> Self {
        Self::new(TlsRole::Server, config, provider, transport)
    }

    /// Take process defaults from `cell` instead of the process-wide one.
    pub fn with_defaults(mut self, cell: &'static DefaultsCell) -> Self {
        self.defaults = cell;
        self
    }

    /// Start a client handshake addressed to `target_name`.
    pub fn start_client_handshake(&mut self, target_name: &str) -> Result<(), TlsError> {
        if self.role != TlsRole::Client {
            return Err(TlsError::InvalidState(
                "client handshake requested on a server session".into(),
            ));
        }
        self.begin(Some(target_name.to_string()))
    }

    /// Start a server handshake; the session waits for the client's first flight.
    pub fn start_server_handshake(&mut self) -> Result<(), TlsError> {
        if self.role != TlsRole::Server {
            return Err(TlsError::InvalidState(
                "server handshake requested on a client session".into(),
            ));
        }
        self.begin(None)
    }

    fn begin(&mut self, target_name: Option<String>) -> Result<(), TlsError> {
        if self.active {
            return Err(TlsError::InvalidState(
                "a handshake was already started on this session".into(),
            ));
        }
        self.config.validate()?;

        self.release_handles();
        self.machine.reset();
        self.assembler = RecordAssembler::with_limit(self.config.max_pending);
        self.codec.reset();
        self.info = None;
        self.peer_chain.clear();
        self.evaluation = TrustEvaluation::default();
        self.target_name = target_name;
        self.active = true;
        self.closed = false;
        self.renegotiating = false;
        self.follow_up = false;
        self.credential_attempts = 0;
        debug!(role = ?self.role, target = ?self.target_name, "handshake started");

        self.transmit()
    }

    /// Drive the session as far as the available input allows.
    ///
    /// Before `Done` this advances the handshake; once `Done` it sends queued
    /// plaintext and decrypts whatever arrived. With nothing to do it is a
    /// no-op. A fatal error tears the session down and is returned.
    pub fn transmit(&mut self) -> Result<(), TlsError> {
        if !self.active {
            return Ok(());
        }
        self.follow_up = false;
        match self.drive() {
            Ok(()) => Ok(()),
            Err(abort) => Err(self.fail(abort)),
        }
    }

    fn drive(&mut self) -> Result<(), Abort> {
        loop {
            match self.machine.state() {
                HandshakeState::InitializeHandshake => self.initialize()?,
                HandshakeState::PerformHandshake => {
                    if !self.perform()? {
                        return Ok(());
                    }
                }
                HandshakeState::VerifyHandshake => self.verify()?,
                HandshakeState::Done => return self.pump(),
                HandshakeState::Renegotiate => {
                    self.machine.advance(HandshakeState::PerformHandshake)?;
                }
            }
        }
    }

    /// Send queued plaintext, then decrypt until input or read capacity runs out.
    fn pump(&mut self) -> Result<(), Abort> {
        if let Some(context) = self.context.as_ref() {
            self.codec
                .encode(&mut self.provider, context, &mut self.transport)?;
        }

        loop {
            loop {
                if self.read_limit_reached() {
                    return Ok(());
                }
                let Some(context) = self.context.as_ref() else {
                    return Ok(());
                };
                match self
                    .codec
                    .decode(&mut self.provider, context, &mut self.assembler)
                {
                    DecodeOutcome::Plaintext(_) => {}
                    DecodeOutcome::NeedMoreData => break,
                    DecodeOutcome::Renegotiate => {
                        self.machine.advance(HandshakeState::Renegotiate)?;
                        self.renegotiating = true;
                        self.follow_up = true;
                        self.events.push_back(SessionEvent::FollowUpRequested);
                        debug!(role = ?self.role, "peer requested renegotiation");
                        return Ok(());
                    }
                    DecodeOutcome::PeerClosed => {
                        debug!(role = ?self.role, "peer closed the session");
                        self.teardown(true);
                        self.events.push_back(SessionEvent::PeerClosed);
                        self.events.push_back(SessionEvent::Disconnected);
                        return Ok(());
                    }
                    DecodeOutcome::Failed(status) => return Err(Abort::from_status(&status)),
                }
            }
            if self.fill_once()? == 0 {
                return Ok(());
            }
        }
    }

    fn read_limit_reached(&self) -> bool {
        self.config.read_buffer_limit != 0
            && self.codec.readable() >= self.config.read_buffer_limit
    }

    /// Read once from the transport into the assembler.
    fn fill_once(&mut self) -> Result<usize, Abort> {
        let n = self
            .transport
            .read(&mut self.read_buf)
            .map_err(TlsError::from)?;
        self.assembler.append(&self.read_buf[..n])?;
        Ok(n)
    }

    /// Read everything the transport has right now.
    fn fill(&mut self) -> Result<(), Abort> {
        while self.fill_once()? > 0 {}
        Ok(())
    }

    fn send_outgoing(&mut self, out: &ProviderOutput) -> Result<(), TlsError> {
        for token in out.outgoing() {
            send_all(&mut self.transport, token)?;
        }
        Ok(())
    }

    fn fail(&mut self, abort: Abort) -> TlsError {
        warn!(
            role = ?self.role,
            state = ?self.machine.state(),
            error = %abort.error,
            "session aborted"
        );
        self.teardown(abort.send_shutdown);
        self.events.push_back(SessionEvent::Disconnected);
        abort.error
    }

    /// Best-effort shutdown token, close the transport, release the handles.
    fn teardown(&mut self, send_shutdown: bool) {
        if let (true, Some(context)) = (send_shutdown, self.context.as_ref()) {
            let status = self
                .provider
                .apply_control_token(context, ControlToken::Shutdown);
            if status.is_ok() {
                let out = self.provider.step(context, &[SecureBuffer::empty()]);
                for token in out.outgoing() {
                    if let Err(e) = send_all(&mut self.transport, token) {
                        debug!(error = %e, "shutdown token not sent");
                        break;
                    }
                }
            } else {
                debug!(%status, "shutdown token rejected");
            }
        }
        if let Err(e) = self.transport.close() {
            debug!(error = %e, "transport close failed");
        }
        self.release_handles();
        self.assembler.clear();
        self.codec.reset();
        self.info = None;
        self.active = false;
        self.closed = true;
        self.follow_up = false;
    }

    fn release_handles(&mut self) {
        if let Some(context) = self.context.take() {
            self.provider.release(ProviderHandle::Context(context));
        }
        if let Some(credentials) = self.credentials.take() {
            self.provider.release(ProviderHandle::Credentials(credentials));
        }
    }

    /// Close the session, sending a shutdown token when possible. Idempotent.
    pub fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        debug!(role = ?self.role, "disconnecting");
        self.teardown(true);
        self.events.push_back(SessionEvent::Disconnected);
    }

    /// Queue plaintext; it is sent by `transmit` once the handshake is done.
    ///
    /// Fails with `InvalidState` before a handshake is started or after the
    /// session is closed.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, TlsError> {
        if self.closed {
            return Err(TlsError::InvalidState("session is closed".into()));
        }
        if !self.active {
            return Err(TlsError::InvalidState("no handshake started".into()));
        }
        self.codec.queue_write(data);
        Ok(data.len())
    }

    /// Take up to `max` decrypted bytes.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        self.codec.take_readable(max)
    }

    pub fn bytes_available(&self) -> usize {
        self.codec.readable()
    }

    pub fn bytes_to_write(&self) -> usize {
        self.codec.pending_write()
    }

    /// Negotiated parameters; `None` unless the handshake is done.
    pub fn session_info(&self) -> Option<&SessionInfo> {
        match self.machine.state() {
            HandshakeState::Done => self.info.as_ref(),
            _ => None,
        }
    }

    /// Display name of the negotiated protocol version, e.g. `"TLSv1.3"`.
    pub fn negotiated_protocol_name(&self) -> Option<&'static str> {
        self.session_info().map(|i| i.protocol_version.name())
    }

    pub fn negotiated_cipher_suite(&self) -> Option<CipherSuite> {
        self.session_info().map(|i| i.cipher_suite)
    }

    /// Peer chain from the latest verification, leaf first.
    pub fn peer_certificate_chain(&self) -> &[Certificate] {
        &self.peer_chain
    }

    pub fn trust_evaluation(&self) -> &TrustEvaluation {
        &self.evaluation
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Whether the owner must call `transmit` again without waiting for input.
    pub fn needs_follow_up(&self) -> bool {
        self.follow_up
    }

    pub fn state(&self) -> HandshakeState {
        self.machine.state()
    }

    pub fn is_encrypted(&self) -> bool {
        self.active && !self.machine.state().is_handshaking()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn role(&self) -> TlsRole {
        self.role
    }

    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

impl<P: PlatformSecurityContext, T: Transport> Drop for TlsSession<P, T> {
    fn drop(&mut self) {
        self.release_handles();
    }
}
