//! Handshake stages of [`TlsSession`].

use platls_types::TlsError;
use tracing::{debug, trace};

use super::{SessionEvent, TlsSession};
use crate::cert_verify::{trust_error, verify_peer_certificate, PeerVerifyRequest};
use crate::config::PeerVerifyMode;
use crate::connection_info::SessionInfo;
use crate::handshake::{Abort, HandshakeState};
use crate::provider::{
    AttributeValue, ContextAttribute, ContextAttributes, ContextRequest, CredentialRequest,
    PlatformSecurityContext, ProviderStatus, SecureBuffer,
};
use crate::record::Consumption;
use crate::transport::Transport;
use crate::{TlsRole, TlsVersion};

impl<P: PlatformSecurityContext, T: Transport> TlsSession<P, T> {
    /// Acquire credentials, create the context and send the client's first token.
    pub(super) fn initialize(&mut self) -> Result<(), Abort> {
        let defaults = self.defaults.get_or_init(&self.provider);
        let cipher_suites = if self.config.cipher_suites.is_empty() {
            defaults.cipher_suites.clone()
        } else {
            self.config.cipher_suites.clone()
        };
        let (min_version, max_version) = self.version_range()?;

        let request = CredentialRequest {
            role: self.role,
            min_version,
            max_version,
            cipher_suites: &cipher_suites,
            certificate_chain: &self.config.certificate_chain,
            private_key: self.config.private_key.as_ref(),
        };
        let credentials = self.provider.acquire_credentials(&request).map_err(|status| {
            Abort::silent(TlsError::CredentialError(format!(
                "cannot acquire credentials: {status}"
            )))
        })?;
        self.credentials = Some(credentials);
        trace!(%min_version, %max_version, suites = cipher_suites.len(), "credentials acquired");

        let mut attributes = ContextAttributes::REQUIRED;
        if self.role == TlsRole::Server
            && self.config.verify_mode.effective(self.role) != PeerVerifyMode::None
        {
            attributes = attributes.with(ContextAttributes::MUTUAL_AUTH);
        }
        let mut input = Vec::new();
        if !self.config.alpn_protocols.is_empty() {
            input.push(SecureBuffer::application_protocols(
                &self.config.alpn_protocols,
            ));
        }
        let request = ContextRequest {
            target_name: match self.role {
                TlsRole::Client => self.target_name.clone(),
                TlsRole::Server => None,
            },
            attributes,
            input,
        };

        let Some(credentials) = self.credentials.as_ref() else {
            return Err(TlsError::InvalidState("credentials missing".into()).into());
        };
        match self.role {
            TlsRole::Client => {
                let (context, out) = self
                    .provider
                    .initialize_context(credentials, &request)
                    .map_err(|status| Abort::from_status(&status))?;
                self.context = Some(context);
                match out.status {
                    ProviderStatus::ContinueNeeded | ProviderStatus::Ok => {
                        self.send_outgoing(&out)?
                    }
                    ref status => return Err(Abort::from_status(status)),
                }
            }
            TlsRole::Server => {
                let context = self
                    .provider
                    .accept_context(credentials, &request)
                    .map_err(|status| Abort::from_status(&status))?;
                self.context = Some(context);
            }
        }
        self.machine.advance(HandshakeState::PerformHandshake)?;
        Ok(())
    }

    /// Configured range narrowed to what the provider supports.
    fn version_range(&self) -> Result<(TlsVersion, TlsVersion), TlsError> {
        let supported = self.provider.supported_versions();
        let usable: Vec<TlsVersion> = TlsVersion::ALL
            .into_iter()
            .filter(|v| {
                *v >= self.config.min_version
                    && *v <= self.config.max_version
                    && supported.contains(v)
            })
            .collect();
        match (usable.first(), usable.last()) {
            (Some(&min), Some(&max)) => Ok((min, max)),
            _ => Err(TlsError::ConfigurationError(format!(
                "provider supports no version between {} and {}",
                self.config.min_version, self.config.max_version
            ))),
        }
    }

    /// Feed buffered peer bytes to the provider.
    ///
    /// Returns `true` once the provider reports the exchange complete.
    pub(super) fn perform(&mut self) -> Result<bool, Abort> {
        self.fill()?;
        loop {
            let Some(context) = self.context.as_ref() else {
                return Err(TlsError::InvalidState("no security context".into()).into());
            };
            let provider = &mut self.provider;
            let stepped = self.assembler.consume_for_step(|input| {
                let out = provider.step(
                    context,
                    &[SecureBuffer::token(input.to_vec()), SecureBuffer::empty()],
                );
                let consumption = match &out.status {
                    ProviderStatus::IncompleteMessage { missing } => Consumption::Incomplete {
                        missing: *missing,
                    },
                    // The same input is offered again on retry.
                    ProviderStatus::IncompleteCredentials => Consumption::Extra(input.len()),
                    _ if out.extra_len() > 0 => Consumption::Extra(out.extra_len()),
                    _ => Consumption::All,
                };
                (consumption, out)
            });
            let Some(out) = stepped else {
                return Ok(false);
            };
            trace!(status = %out.status, "handshake step");

            match out.status {
                ProviderStatus::ContinueNeeded => {
                    self.credential_attempts = 0;
                    self.send_outgoing(&out)?;
                    self.machine.advance(HandshakeState::PerformHandshake)?;
                }
                ProviderStatus::Ok => {
                    self.credential_attempts = 0;
                    self.send_outgoing(&out)?;
                    self.machine.advance(HandshakeState::VerifyHandshake)?;
                    return Ok(true);
                }
                ProviderStatus::IncompleteMessage { missing } => {
                    trace!(missing, "handshake record incomplete");
                    return Ok(false);
                }
                ProviderStatus::IncompleteCredentials => {
                    self.credential_attempts += 1;
                    if self.credential_attempts >= self.config.max_credential_attempts {
                        return Err(TlsError::ProtocolViolation(format!(
                            "peer still requires credentials after {} attempts",
                            self.credential_attempts
                        ))
                        .into());
                    }
                    debug!(
                        attempt = self.credential_attempts,
                        "peer requested credentials, retrying step"
                    );
                }
                ref status => {
                    // Best effort: the provider may have produced an alert.
                    if let Err(e) = self.send_outgoing(&out) {
                        debug!(error = %e, "alert not sent");
                    }
                    return Err(Abort::from_status(status));
                }
            }
        }
    }

    fn query(&self, attribute: ContextAttribute) -> Result<AttributeValue, Abort> {
        let Some(context) = self.context.as_ref() else {
            return Err(TlsError::InvalidState("no security context".into()).into());
        };
        self.provider
            .query_attribute(context, attribute)
            .map_err(|status| Abort::from_status(&status))
    }

    /// Check the negotiated parameters and the peer chain, then enter `Done`.
    pub(super) fn verify(&mut self) -> Result<(), Abort> {
        let mismatch =
            |what: &str| Abort::from(TlsError::InvalidState(format!("provider returned no {what}")));

        let AttributeValue::GrantedAttributes(granted) =
            self.query(ContextAttribute::GrantedAttributes)?
        else {
            return Err(mismatch("granted attributes"));
        };
        if !granted.contains(ContextAttributes::REQUIRED) {
            return Err(TlsError::ProtocolViolation(format!(
                "provider granted context attributes {:#x}, required {:#x}",
                granted.0,
                ContextAttributes::REQUIRED.0
            ))
            .into());
        }

        let AttributeValue::ConnectionInfo {
            version,
            cipher_suite,
        } = self.query(ContextAttribute::ConnectionInfo)?
        else {
            return Err(mismatch("connection info"));
        };
        if version < self.config.min_version || version > self.config.max_version {
            return Err(TlsError::ProtocolViolation(format!(
                "negotiated {version} outside the configured range {}..={}",
                self.config.min_version, self.config.max_version
            ))
            .into());
        }

        let AttributeValue::ApplicationProtocol(alpn_protocol) =
            self.query(ContextAttribute::ApplicationProtocol)?
        else {
            return Err(mismatch("application protocol"));
        };
        if let Some(protocol) = &alpn_protocol {
            if !self.config.alpn_protocols.contains(protocol) {
                return Err(TlsError::UnsupportedFeature(format!(
                    "negotiated application protocol {:?} was not offered",
                    String::from_utf8_lossy(protocol)
                ))
                .into());
            }
        }

        let AttributeValue::StreamSizes(stream_sizes) =
            self.query(ContextAttribute::StreamSizes)?
        else {
            return Err(mismatch("stream sizes"));
        };
        let AttributeValue::RemoteCertificates(peer_chain) =
            self.query(ContextAttribute::RemoteCertificates)?
        else {
            return Err(mismatch("remote certificates"));
        };

        let defaults = self.defaults.get_or_init(&self.provider);
        let request = PeerVerifyRequest {
            role: self.role,
            target_name: self.target_name.as_deref(),
            peer_chain: &peer_chain,
            system_roots: &defaults.system_roots,
        };
        let validated =
            verify_peer_certificate(&self.config, self.provider.chain_engine(), &request)?;
        self.evaluation = validated.evaluation;
        self.peer_chain = validated.chain;
        if let Some(error) = trust_error(&self.evaluation) {
            return Err(error.into());
        }
        if !self.evaluation.is_clean() {
            self.events.push_back(SessionEvent::CertificateErrors(
                self.evaluation.errors.clone(),
            ));
        }

        self.codec.set_sizes(stream_sizes);
        self.info = Some(SessionInfo {
            protocol_version: version,
            cipher_suite,
            alpn_protocol,
            stream_sizes,
            granted_attributes: granted,
            peer_certificates: self.peer_chain.clone(),
            target_name: self.target_name.clone(),
        });
        self.machine.advance(HandshakeState::Done)?;
        debug!(
            role = ?self.role,
            %version,
            %cipher_suite,
            renegotiated = self.renegotiating,
            "handshake complete"
        );

        self.events.push_back(SessionEvent::Encrypted);
        self.renegotiating = false;
        Ok(())
    }
}
