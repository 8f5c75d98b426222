//! Handshake state machine.
//!
//! States only move along the edges listed in [`HandshakeState::can_advance_to`];
//! everything else is rejected. Provider statuses are folded into a small
//! set of [`StepOutcome`]s that decide how the session reacts.

use platls_types::TlsError;
use tracing::debug;

use crate::provider::ProviderStatus;

/// Handshake state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Acquire credentials and create the security context.
    InitializeHandshake,
    /// Exchange handshake tokens with the peer.
    PerformHandshake,
    /// Check negotiated parameters and the peer certificate chain.
    VerifyHandshake,
    /// Handshake complete; application data flows.
    Done,
    /// The peer asked for a new handshake on the established context.
    Renegotiate,
}

impl HandshakeState {
    pub fn can_advance_to(self, next: HandshakeState) -> bool {
        use HandshakeState::*;
        matches!(
            (self, next),
            (InitializeHandshake, PerformHandshake)
                | (PerformHandshake, PerformHandshake)
                | (PerformHandshake, VerifyHandshake)
                | (VerifyHandshake, Done)
                | (Done, Renegotiate)
                | (Renegotiate, PerformHandshake)
        )
    }

    /// Whether a handshake attempt is in progress.
    pub fn is_handshaking(self) -> bool {
        !matches!(self, HandshakeState::Done)
    }
}

/// Tracks the current state and guards transitions.
#[derive(Debug)]
pub struct HandshakeMachine {
    state: HandshakeState,
    /// Every state entered since the last reset, the starting state included.
    #[cfg(test)]
    trail: Vec<HandshakeState>,
}

impl Default for HandshakeMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeMachine {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::InitializeHandshake,
            #[cfg(test)]
            trail: vec![HandshakeState::InitializeHandshake],
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Move to `next`, or fail with `InvalidState` if that edge does not exist.
    pub fn advance(&mut self, next: HandshakeState) -> Result<(), TlsError> {
        if !self.state.can_advance_to(next) {
            return Err(TlsError::InvalidState(format!(
                "illegal handshake transition {:?} -> {next:?}",
                self.state
            )));
        }
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "handshake transition");
        }
        self.state = next;
        #[cfg(test)]
        self.trail.push(next);
        Ok(())
    }

    /// Start over for a new handshake attempt.
    pub fn reset(&mut self) {
        self.state = HandshakeState::InitializeHandshake;
        #[cfg(test)]
        {
            self.trail.clear();
            self.trail.push(HandshakeState::InitializeHandshake);
        }
    }

    #[cfg(test)]
    pub(crate) fn trail(&self) -> &[HandshakeState] {
        &self.trail
    }
}

/// Why a provider step ended the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalReason {
    MessageAltered,
    OutOfSequence,
    /// Credentials unusable or still incomplete after the allowed retries.
    Credentials(String),
    Provider(String),
}

impl FatalReason {
    /// Whether the channel is still trustworthy enough to send a shutdown token.
    pub fn allows_shutdown(&self) -> bool {
        !matches!(self, FatalReason::MessageAltered | FatalReason::OutOfSequence)
    }
}

/// Session-level meaning of a provider status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    NeedMoreData { missing: usize },
    Fatal(FatalReason),
    PeerClosed,
    AlgorithmMismatch,
}

impl StepOutcome {
    pub fn from_status(status: &ProviderStatus) -> Self {
        match status {
            ProviderStatus::Ok | ProviderStatus::ContinueNeeded | ProviderStatus::Renegotiate => {
                StepOutcome::Continue
            }
            ProviderStatus::IncompleteMessage { missing } => {
                StepOutcome::NeedMoreData { missing: *missing }
            }
            ProviderStatus::ContextExpired => StepOutcome::PeerClosed,
            ProviderStatus::AlgorithmMismatch => StepOutcome::AlgorithmMismatch,
            ProviderStatus::MessageAltered => StepOutcome::Fatal(FatalReason::MessageAltered),
            ProviderStatus::OutOfSequence => StepOutcome::Fatal(FatalReason::OutOfSequence),
            ProviderStatus::IncompleteCredentials | ProviderStatus::UnknownCredentials => {
                StepOutcome::Fatal(FatalReason::Credentials(status.to_string()))
            }
            ProviderStatus::InternalError(msg) => {
                StepOutcome::Fatal(FatalReason::Provider(msg.clone()))
            }
        }
    }
}

/// A fatal session error and whether a shutdown token may still be sent.
#[derive(Debug)]
pub(crate) struct Abort {
    pub error: TlsError,
    pub send_shutdown: bool,
}

impl Abort {
    /// Abort without attempting a shutdown token.
    pub fn silent(error: TlsError) -> Self {
        Self {
            error,
            send_shutdown: false,
        }
    }

    /// Abort for a status that is not a success or wait signal.
    pub fn from_status(status: &ProviderStatus) -> Self {
        match StepOutcome::from_status(status) {
            StepOutcome::Fatal(reason) => {
                let send_shutdown = reason.allows_shutdown();
                let error = match reason {
                    FatalReason::MessageAltered => {
                        TlsError::ProtocolViolation("message altered".into())
                    }
                    FatalReason::OutOfSequence => {
                        TlsError::ProtocolViolation("message out of sequence".into())
                    }
                    FatalReason::Credentials(msg) => TlsError::CredentialError(msg),
                    FatalReason::Provider(msg) => TlsError::ResourceError(msg),
                };
                Self {
                    error,
                    send_shutdown,
                }
            }
            StepOutcome::PeerClosed => TlsError::PeerClosed.into(),
            StepOutcome::AlgorithmMismatch => {
                TlsError::ProtocolViolation("no protocol version or cipher suite in common".into())
                    .into()
            }
            StepOutcome::Continue | StepOutcome::NeedMoreData { .. } => {
                TlsError::InvalidState(format!("unexpected provider status: {status}")).into()
            }
        }
    }
}

impl From<TlsError> for Abort {
    fn from(error: TlsError) -> Self {
        Self {
            error,
            send_shutdown: true,
        }
    }
}
