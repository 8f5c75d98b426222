//! Peer certificate chain validation.
//!
//! The validator asks a [`ChainEngine`] for candidate chains, picks one
//! according to [`ChainSelection`], then walks it leaf-to-root. Every
//! failed check produces one [`CertError`] which is offered to the caller's
//! handler; the handler decides whether validation keeps going.

use platls_types::{CertErrorKind, PkiError};
use tracing::{debug, trace};

use crate::chain::{CandidateChain, ChainEngine, ChainSelection, TrustStatus, TrustStores};
use crate::x509::hostname::matches_peer_name;
use crate::x509::{oid, Certificate, KeyUsage, NetscapeCertType};

/// The role the peer certificate must be good for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyPurpose {
    /// Peer is a server (we are the client).
    ServerAuth,
    /// Peer is a client (we are the server).
    ClientAuth,
}

impl VerifyPurpose {
    fn eku_oid(self) -> &'static str {
        match self {
            VerifyPurpose::ServerAuth => oid::KP_SERVER_AUTH,
            VerifyPurpose::ClientAuth => oid::KP_CLIENT_AUTH,
        }
    }

    fn netscape_bit(self) -> u8 {
        match self {
            VerifyPurpose::ServerAuth => NetscapeCertType::SSL_SERVER,
            VerifyPurpose::ClientAuth => NetscapeCertType::SSL_CLIENT,
        }
    }
}

/// Inputs that shape one validation run.
#[derive(Debug, Clone)]
pub struct ValidationParams {
    pub purpose: VerifyPurpose,
    /// Name the leaf must match. Only checked for [`VerifyPurpose::ServerAuth`].
    pub expected_name: Option<String>,
    /// Maximum number of chain elements to inspect; 0 means unlimited.
    pub verify_depth: usize,
    /// Validation time as a UNIX timestamp; `None` skips validity checks.
    pub time: Option<i64>,
    pub selection: ChainSelection,
}

impl Default for ValidationParams {
    fn default() -> Self {
        Self {
            purpose: VerifyPurpose::ServerAuth,
            expected_name: None,
            verify_depth: 0,
            time: None,
            selection: ChainSelection::default(),
        }
    }
}

/// One trust finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertError {
    pub kind: CertErrorKind,
    /// Chain position of the offending certificate (0 = leaf).
    pub depth: usize,
    pub certificate: Option<Certificate>,
}

impl CertError {
    pub fn new(kind: CertErrorKind, depth: usize, certificate: Option<Certificate>) -> Self {
        Self {
            kind,
            depth,
            certificate,
        }
    }
}

/// The handler's answer for a single finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyDecision {
    Continue,
    Abort,
}

/// Findings raised during one validation run, in the order they were raised.
#[derive(Debug, Clone, Default)]
pub struct TrustEvaluation {
    pub errors: Vec<CertError>,
    /// Set when the handler aborted; `errors` is then partial.
    pub stopped: bool,
}

impl TrustEvaluation {
    /// No findings at all.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Every finding was continued by the handler.
    pub fn is_accepted(&self) -> bool {
        !self.stopped
    }

    pub fn contains(&self, kind: CertErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }

    /// The finding that stopped validation, if any.
    pub fn fatal_error(&self) -> Option<&CertError> {
        if self.stopped {
            self.errors.last()
        } else {
            None
        }
    }
}

/// Result of [`ChainValidator::validate`].
#[derive(Debug, Clone, Default)]
pub struct ValidatedChain {
    /// The selected chain, leaf first.
    pub chain: Vec<Certificate>,
    pub evaluation: TrustEvaluation,
}

/// Collects findings and consults the handler; returns `false` once aborted.
struct Reporter<'h> {
    handler: &'h mut dyn FnMut(&CertError) -> VerifyDecision,
    evaluation: TrustEvaluation,
}

impl Reporter<'_> {
    fn raise(&mut self, kind: CertErrorKind, depth: usize, cert: Option<&Certificate>) -> bool {
        let error = CertError::new(kind, depth, cert.cloned());
        let decision = (self.handler)(&error);
        debug!(?kind, depth, ?decision, "certificate trust finding");
        self.evaluation.errors.push(error);
        if decision == VerifyDecision::Abort {
            self.evaluation.stopped = true;
            return false;
        }
        true
    }
}

/// Chain validator bound to a platform chain engine.
pub struct ChainValidator<'e> {
    engine: &'e dyn ChainEngine,
    params: ValidationParams,
}

impl<'e> ChainValidator<'e> {
    pub fn new(engine: &'e dyn ChainEngine, params: ValidationParams) -> Self {
        Self { engine, params }
    }

    pub fn params(&self) -> &ValidationParams {
        &self.params
    }

    /// Validate `leaf` against `stores`.
    ///
    /// `stores.peer_store` should carry the certificates the peer sent after
    /// its leaf. Engine failures are returned as errors; trust findings are
    /// reported through `handler` and recorded in the evaluation.
    pub fn validate(
        &self,
        leaf: &Certificate,
        stores: &TrustStores<'_>,
        handler: &mut dyn FnMut(&CertError) -> VerifyDecision,
    ) -> Result<ValidatedChain, PkiError> {
        let candidates = self.engine.build_chains(leaf, stores)?;
        trace!(candidates = candidates.len(), "chain engine returned");
        let selected = self
            .params
            .selection
            .select(candidates)
            .ok_or_else(|| PkiError::ChainBuildFailed("engine returned no chains".into()))?;

        let mut reporter = Reporter {
            handler,
            evaluation: TrustEvaluation::default(),
        };
        self.walk(&selected, &mut reporter);

        Ok(ValidatedChain {
            chain: selected.certificates(),
            evaluation: reporter.evaluation,
        })
    }

    fn walk(&self, chain: &CandidateChain, reporter: &mut Reporter<'_>) {
        let len = chain.len();
        let limit = match self.params.verify_depth {
            0 => len,
            depth => depth.min(len),
        };

        for (depth, element) in chain.elements.iter().take(limit).enumerate() {
            if !self.check_element(chain, depth, reporter) {
                return;
            }
            trace!(depth, subject = %element.certificate.subject, "element checked");
        }

        if limit < len {
            let cert = &chain.elements[limit].certificate;
            if !reporter.raise(CertErrorKind::ChainTooLong, limit, Some(cert)) {
                return;
            }
        }

        if self.params.purpose == VerifyPurpose::ServerAuth {
            if let (Some(name), Some(leaf)) = (&self.params.expected_name, chain.elements.first()) {
                if !matches_peer_name(&leaf.certificate, name) {
                    reporter.raise(CertErrorKind::HostNameMismatch, 0, Some(&leaf.certificate));
                }
            }
        }
    }

    /// Run every check for the element at `depth`; `false` means stop.
    fn check_element(&self, chain: &CandidateChain, depth: usize, reporter: &mut Reporter<'_>) -> bool {
        let element = &chain.elements[depth];
        let cert = &element.certificate;
        let is_last = depth + 1 == chain.len();

        let mut findings: Vec<CertErrorKind> = Vec::new();

        if let Some(time) = self.params.time {
            if time < cert.not_before {
                findings.push(CertErrorKind::CertificateNotYetValid);
            } else if time > cert.not_after {
                findings.push(CertErrorKind::CertificateExpired);
            }
        }

        if element.status.has(TrustStatus::REVOCATION_UNKNOWN) {
            trace!(depth, "revocation status unknown");
        } else if element.status.has(TrustStatus::REVOKED) {
            findings.push(CertErrorKind::CertificateRevoked);
        }
        if element.status.has(TrustStatus::EXPLICIT_DISTRUST) {
            findings.push(CertErrorKind::CertificateBlacklisted);
        }
        if element.status.has(TrustStatus::NOT_SIGNATURE_VALID) {
            findings.push(CertErrorKind::CertificateSignatureFailed);
        }

        if !self.purpose_ok(cert, depth) {
            findings.push(CertErrorKind::InvalidPurpose);
        }

        if !is_last && cert.is_self_signed() {
            findings.push(CertErrorKind::SelfSignedCertificateInChain);
        }

        if depth > 0 {
            findings.extend(ca_findings(cert, depth));
        }

        if is_last && !element.is_trust_anchor {
            findings.push(termination_finding(chain, element.status));
        }

        findings
            .into_iter()
            .all(|kind| reporter.raise(kind, depth, Some(cert)))
    }

    fn purpose_ok(&self, cert: &Certificate, depth: usize) -> bool {
        if depth == 0 {
            if let Some(purposes) = cert.extended_key_usage() {
                let wanted = self.params.purpose.eku_oid();
                if !purposes
                    .iter()
                    .any(|p| p == wanted || p == oid::ANY_EXTENDED_KEY_USAGE)
                {
                    return false;
                }
            }
            if let Some(ct) = cert.netscape_cert_type() {
                return ct.has(self.params.purpose.netscape_bit());
            }
            true
        } else {
            cert.netscape_cert_type()
                .map_or(true, |ct| ct.has(NetscapeCertType::SSL_CA))
        }
    }
}

/// CA-position checks: CA flag, keyCertSign and path length.
fn ca_findings(cert: &Certificate, depth: usize) -> Vec<CertErrorKind> {
    let mut out = Vec::new();
    let ku_ok = cert
        .key_usage()
        .map_or(true, |ku| ku.has(KeyUsage::KEY_CERT_SIGN));
    if !cert.is_ca() || !ku_ok {
        out.push(CertErrorKind::InvalidCaCertificate);
    }
    // Number of intermediate CAs between the leaf and this certificate.
    let below = (depth - 1) as u64;
    if let Some(path_len) = cert.basic_constraints().and_then(|bc| bc.path_len_constraint) {
        if below > u64::from(path_len) {
            out.push(CertErrorKind::PathLengthExceeded);
        }
    }
    out
}

/// Why the last element of an unanchored chain is not trusted.
fn termination_finding(chain: &CandidateChain, status: TrustStatus) -> CertErrorKind {
    if status.has(TrustStatus::PARTIAL_CHAIN) {
        CertErrorKind::UnableToGetIssuerCertificate
    } else if chain.len() == 1 {
        CertErrorKind::SelfSignedCertificate
    } else if status.has(TrustStatus::UNTRUSTED_ROOT) {
        CertErrorKind::SelfSignedCertificateInChain
    } else {
        CertErrorKind::CertificateUntrusted
    }
}
