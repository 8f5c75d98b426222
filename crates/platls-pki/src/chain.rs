//! Candidate chain construction.
//!
//! Building a chain is the platform's job: it knows the system stores, the
//! disallowed store and the revocation state. [`ChainEngine`] is that seam.
//! [`IssuerChainEngine`] is a portable engine that links certificates by
//! issuer/subject name and delegates signature checks to the caller.

use platls_types::PkiError;
use tracing::debug;

use crate::x509::Certificate;

/// Per-element facts only the platform can establish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrustStatus(pub u32);

impl TrustStatus {
    pub const REVOKED: u32 = 0x0001;
    pub const NOT_SIGNATURE_VALID: u32 = 0x0002;
    pub const EXPLICIT_DISTRUST: u32 = 0x0004;
    /// Chain ends in a self-signed certificate that is not a trust anchor.
    pub const UNTRUSTED_ROOT: u32 = 0x0008;
    /// Chain could not be completed up to a self-signed certificate.
    pub const PARTIAL_CHAIN: u32 = 0x0010;
    /// Revocation could not be checked; `REVOKED` on the same element is not reported.
    pub const REVOCATION_UNKNOWN: u32 = 0x0020;

    pub fn has(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }
}

/// One certificate in a candidate chain plus its platform status.
#[derive(Debug, Clone)]
pub struct ChainElement {
    pub certificate: Certificate,
    pub status: TrustStatus,
    /// Whether the certificate came from a trust store.
    pub is_trust_anchor: bool,
}

/// A leaf-to-root candidate chain.
#[derive(Debug, Clone, Default)]
pub struct CandidateChain {
    pub elements: Vec<ChainElement>,
}

impl CandidateChain {
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Whether the chain terminates at a trust anchor.
    pub fn is_anchored(&self) -> bool {
        self.elements.last().is_some_and(|e| e.is_trust_anchor)
    }

    pub fn certificates(&self) -> Vec<Certificate> {
        self.elements.iter().map(|e| e.certificate.clone()).collect()
    }
}

/// The certificate collections offered to the chain engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustStores<'a> {
    /// Process-wide system roots (empty unless on-demand loading is enabled).
    pub system_roots: &'a [Certificate],
    /// Caller-configured trust anchors.
    pub anchors: &'a [Certificate],
    /// Certificates sent by the peer alongside its leaf.
    pub peer_store: &'a [Certificate],
}

impl TrustStores<'_> {
    /// Whether `cert` is one of the trusted roots (by DER identity).
    pub fn is_trusted(&self, cert: &Certificate) -> bool {
        self.system_roots
            .iter()
            .chain(self.anchors.iter())
            .any(|t| t.raw == cert.raw)
    }
}

/// Which candidate to validate when the engine returns several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainSelection {
    /// The last candidate returned; engines order candidates by increasing trust.
    #[default]
    MostTrusted,
    /// The candidate with the fewest elements (first one on ties).
    Shortest,
    /// The first candidate returned.
    First,
}

impl ChainSelection {
    /// Pick one candidate, or `None` if `candidates` is empty.
    pub fn select(self, mut candidates: Vec<CandidateChain>) -> Option<CandidateChain> {
        match self {
            ChainSelection::MostTrusted => candidates.pop(),
            ChainSelection::First => candidates.into_iter().next(),
            ChainSelection::Shortest => {
                let idx = candidates
                    .iter()
                    .enumerate()
                    .min_by_key(|(i, c)| (c.len(), *i))
                    .map(|(i, _)| i)?;
                Some(candidates.swap_remove(idx))
            }
        }
    }
}

/// Platform chain engine.
pub trait ChainEngine {
    /// Build every candidate chain for `leaf`, ordered by increasing trust.
    ///
    /// An engine that cannot find any issuer returns a single chain holding
    /// just the leaf, flagged `PARTIAL_CHAIN` or `UNTRUSTED_ROOT`.
    fn build_chains(
        &self,
        leaf: &Certificate,
        stores: &TrustStores<'_>,
    ) -> Result<Vec<CandidateChain>, PkiError>;
}

/// Signature predicate: does `issuer` vouch for `subject`?
pub type SignatureCheck = Box<dyn Fn(&Certificate, &Certificate) -> bool + Send + Sync>;

/// Upper bound on chain length, guards against issuer cycles.
const MAX_CHAIN_LEN: usize = 32;
/// Issuers followed per element; further same-name issuers are ignored.
const MAX_ISSUERS_PER_LEVEL: usize = 8;
/// Candidates produced per build.
pub const MAX_CANDIDATES: usize = 64;
/// Elements visited per build.
const MAX_SEARCH_STEPS: usize = 1024;

/// Bounded depth-first search state for one `build_chains` call.
#[derive(Default)]
struct Search {
    out: Vec<CandidateChain>,
    steps: usize,
}

impl Search {
    fn exhausted(&self) -> bool {
        self.out.len() >= MAX_CANDIDATES || self.steps >= MAX_SEARCH_STEPS
    }
}

/// Chain engine linking certificates by issuer/subject name.
pub struct IssuerChainEngine {
    verify_signature: SignatureCheck,
    distrusted: Vec<Vec<u8>>,
    revoked_serials: Vec<Vec<u8>>,
    revocation_checked: bool,
}

impl std::fmt::Debug for IssuerChainEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuerChainEngine")
            .field("distrusted", &self.distrusted.len())
            .field("revoked_serials", &self.revoked_serials.len())
            .field("revocation_checked", &self.revocation_checked)
            .finish_non_exhaustive()
    }
}

impl IssuerChainEngine {
    pub fn new(verify_signature: SignatureCheck) -> Self {
        Self {
            verify_signature,
            distrusted: Vec::new(),
            revoked_serials: Vec::new(),
            revocation_checked: false,
        }
    }

    /// Add a certificate to the disallowed store.
    pub fn distrust(&mut self, cert: &Certificate) -> &mut Self {
        self.distrusted.push(cert.raw.clone());
        self
    }

    /// Mark a serial number as revoked and enable revocation status reporting.
    pub fn revoke_serial(&mut self, serial: &[u8]) -> &mut Self {
        self.revoked_serials.push(serial.to_vec());
        self.revocation_checked = true;
        self
    }

    fn element(&self, cert: &Certificate, stores: &TrustStores<'_>) -> ChainElement {
        let mut status = TrustStatus::default();
        if self.distrusted.iter().any(|d| *d == cert.raw) {
            status.set(TrustStatus::EXPLICIT_DISTRUST);
        }
        if !self.revocation_checked {
            status.set(TrustStatus::REVOCATION_UNKNOWN);
        } else if self.revoked_serials.iter().any(|s| *s == cert.serial_number) {
            status.set(TrustStatus::REVOKED);
        }
        ChainElement {
            certificate: cert.clone(),
            status,
            is_trust_anchor: stores.is_trusted(cert),
        }
    }

    /// Issuers of `cert`: peer store first, then anchors, then system roots.
    fn issuers_of<'s>(cert: &Certificate, stores: &TrustStores<'s>) -> Vec<&'s Certificate> {
        let mut found: Vec<&Certificate> = Vec::new();
        for candidate in stores
            .peer_store
            .iter()
            .chain(stores.anchors.iter())
            .chain(stores.system_roots.iter())
        {
            if candidate.subject == cert.issuer
                && candidate.raw != cert.raw
                && !found.iter().any(|f| f.raw == candidate.raw)
            {
                found.push(candidate);
            }
        }
        found
    }

    fn extend(&self, chain: Vec<ChainElement>, stores: &TrustStores<'_>, search: &mut Search) {
        search.steps += 1;
        let Some(current) = chain.last() else {
            return;
        };

        if current.is_trust_anchor {
            search.out.push(CandidateChain { elements: chain });
            return;
        }

        if current.certificate.is_self_signed() {
            let mut chain = chain;
            if let Some(last) = chain.last_mut() {
                last.status.set(TrustStatus::UNTRUSTED_ROOT);
            }
            search.out.push(CandidateChain { elements: chain });
            return;
        }

        let issuers: Vec<&Certificate> = Self::issuers_of(&current.certificate, stores)
            .into_iter()
            .filter(|i| !chain.iter().any(|e| e.certificate.raw == i.raw))
            .take(MAX_ISSUERS_PER_LEVEL)
            .collect();

        if issuers.is_empty() || chain.len() >= MAX_CHAIN_LEN {
            let mut chain = chain;
            if let Some(last) = chain.last_mut() {
                last.status.set(TrustStatus::PARTIAL_CHAIN);
            }
            search.out.push(CandidateChain { elements: chain });
            return;
        }

        for issuer in issuers {
            if search.exhausted() {
                break;
            }
            let mut next = chain.clone();
            if !(self.verify_signature)(&current.certificate, issuer) {
                if let Some(last) = next.last_mut() {
                    last.status.set(TrustStatus::NOT_SIGNATURE_VALID);
                }
            }
            next.push(self.element(issuer, stores));
            self.extend(next, stores, search);
        }
    }
}

impl ChainEngine for IssuerChainEngine {
    fn build_chains(
        &self,
        leaf: &Certificate,
        stores: &TrustStores<'_>,
    ) -> Result<Vec<CandidateChain>, PkiError> {
        let mut search = Search::default();
        self.extend(vec![self.element(leaf, stores)], stores, &mut search);
        if search.exhausted() {
            debug!(
                candidates = search.out.len(),
                steps = search.steps,
                "chain search stopped at its bound"
            );
        }
        let mut out = search.out;
        // Anchored candidates last, longer before shorter within each group.
        out.sort_by_key(|c| (c.is_anchored(), std::cmp::Reverse(c.len())));
        if out.is_empty() {
            return Err(PkiError::ChainBuildFailed(
                "no candidate chain produced".into(),
            ));
        }
        Ok(out)
    }
}
