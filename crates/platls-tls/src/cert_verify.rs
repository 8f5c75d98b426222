//! Peer certificate verification orchestration.
//!
//! Runs once per completed handshake exchange:
//!
//! 1. Resolve the verify mode for the role; `None` skips everything.
//! 2. An empty peer chain is a `NoPeerCertificate` finding under `Verify`.
//! 3. Otherwise the platform chain engine builds candidates from the system
//!    roots (when on-demand loading is enabled), the configured anchors and
//!    the certificates the peer sent, and the validator walks the selection.
//! 4. Every finding is resolved by [`resolve`].

use std::time::{SystemTime, UNIX_EPOCH};

use platls_pki::x509::Certificate;
use platls_pki::{
    CertError, ChainEngine, ChainValidator, TrustEvaluation, TrustStores, ValidatedChain,
    ValidationParams, VerifyDecision, VerifyPurpose,
};
use platls_types::{CertErrorKind, TlsError};
use tracing::debug;

use crate::config::{PeerVerifyMode, TlsConfig};
use crate::TlsRole;

/// The peer's side of a verification run.
#[derive(Debug, Clone, Copy)]
pub struct PeerVerifyRequest<'a> {
    pub role: TlsRole,
    /// Name the client addressed; ignored on the server.
    pub target_name: Option<&'a str>,
    /// Chain as sent by the peer, leaf first.
    pub peer_chain: &'a [Certificate],
    pub system_roots: &'a [Certificate],
}

/// Decide whether validation continues past `error`.
///
/// Order: explicitly ignored, then the callback, then the relaxed modes.
/// `ignore_all_errors` does not cover explicit distrust.
pub fn resolve(config: &TlsConfig, mode: PeerVerifyMode, error: &CertError) -> VerifyDecision {
    if config.ignored_errors.iter().any(|ignored| ignored.matches(error)) {
        return VerifyDecision::Continue;
    }
    if let Some(cb) = &config.cert_error_callback {
        return cb(error);
    }
    if mode == PeerVerifyMode::Query {
        return VerifyDecision::Continue;
    }
    if config.ignore_all_errors && !error.kind.is_distrust() {
        return VerifyDecision::Continue;
    }
    VerifyDecision::Abort
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Evaluate the peer certificate chain under `config`.
///
/// Trust findings are returned in the evaluation; only chain engine
/// failures are errors.
pub fn verify_peer_certificate(
    config: &TlsConfig,
    engine: &dyn ChainEngine,
    request: &PeerVerifyRequest<'_>,
) -> Result<ValidatedChain, TlsError> {
    let mode = config.verify_mode.effective(request.role);
    if mode == PeerVerifyMode::None {
        return Ok(ValidatedChain {
            chain: request.peer_chain.to_vec(),
            evaluation: TrustEvaluation::default(),
        });
    }

    let mut handler = |e: &CertError| resolve(config, mode, e);

    let Some((leaf, intermediates)) = request.peer_chain.split_first() else {
        let mut evaluation = TrustEvaluation::default();
        if mode == PeerVerifyMode::Verify {
            let error = CertError::new(CertErrorKind::NoPeerCertificate, 0, None);
            evaluation.stopped = handler(&error) == VerifyDecision::Abort;
            evaluation.errors.push(error);
        }
        debug!(?mode, "peer sent no certificate");
        return Ok(ValidatedChain {
            chain: Vec::new(),
            evaluation,
        });
    };

    let (purpose, expected_name) = match request.role {
        TlsRole::Client => (
            VerifyPurpose::ServerAuth,
            config
                .peer_verify_name
                .clone()
                .or_else(|| request.target_name.map(str::to_string)),
        ),
        TlsRole::Server => (VerifyPurpose::ClientAuth, None),
    };
    let params = ValidationParams {
        purpose,
        expected_name,
        verify_depth: config.verify_depth,
        time: Some(config.verification_time.unwrap_or_else(now)),
        selection: config.chain_selection,
    };
    let stores = TrustStores {
        system_roots: if config.load_system_roots_on_demand {
            request.system_roots
        } else {
            &[]
        },
        anchors: &config.trusted_certs,
        peer_store: intermediates,
    };

    let validated = ChainValidator::new(engine, params).validate(leaf, &stores, &mut handler)?;
    debug!(
        chain = validated.chain.len(),
        findings = validated.evaluation.errors.len(),
        stopped = validated.evaluation.stopped,
        "peer certificate evaluated"
    );
    Ok(validated)
}

/// The error that ends the session when the handler aborted.
pub fn trust_error(evaluation: &TrustEvaluation) -> Option<TlsError> {
    evaluation.fatal_error().map(|e| TlsError::TrustError {
        kind: e.kind,
        depth: Some(e.depth),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CertErrorCallback;
    use platls_pki::x509::CertificateBuilder;
    use platls_pki::IssuerChainEngine;
    use std::sync::Arc;

    const NOW: i64 = 1_700_000_000;

    fn engine() -> IssuerChainEngine {
        IssuerChainEngine::new(Box::new(|_: &Certificate, _: &Certificate| true))
    }

    /// Root -> leaf for `name`, with the root configured as an anchor.
    fn pki(name: &str) -> (Certificate, Certificate) {
        let root = CertificateBuilder::new("Test Root")
            .add_basic_constraints(true, None)
            .build();
        let leaf = CertificateBuilder::new(name)
            .issuer("Test Root")
            .add_subject_alt_name_dns(&[name])
            .build();
        (root, leaf)
    }

    fn client_request<'a>(target: &'a str, chain: &'a [Certificate]) -> PeerVerifyRequest<'a> {
        PeerVerifyRequest {
            role: TlsRole::Client,
            target_name: Some(target),
            peer_chain: chain,
            system_roots: &[],
        }
    }

    fn error(kind: CertErrorKind) -> CertError {
        CertError::new(kind, 0, None)
    }

    // ------------------------------------------------------------------
    // resolve
    // ------------------------------------------------------------------

    #[test]
    fn test_resolve_default_aborts() {
        let config = TlsConfig::builder().build();
        assert_eq!(
            resolve(&config, PeerVerifyMode::Verify, &error(CertErrorKind::CertificateExpired)),
            VerifyDecision::Abort
        );
    }

    #[test]
    fn test_resolve_query_continues() {
        let config = TlsConfig::builder().build();
        assert_eq!(
            resolve(&config, PeerVerifyMode::Query, &error(CertErrorKind::CertificateUntrusted)),
            VerifyDecision::Continue
        );
    }

    #[test]
    fn test_ignore_all_does_not_cover_blacklisted() {
        let config = TlsConfig::builder().ignore_all_errors(true).build();
        assert_eq!(
            resolve(&config, PeerVerifyMode::Verify, &error(CertErrorKind::HostNameMismatch)),
            VerifyDecision::Continue
        );
        assert_eq!(
            resolve(
                &config,
                PeerVerifyMode::Verify,
                &error(CertErrorKind::CertificateBlacklisted)
            ),
            VerifyDecision::Abort
        );
    }

    #[test]
    fn test_blacklisted_continues_when_listed_explicitly() {
        let config = TlsConfig::builder()
            .ignore_all_errors(true)
            .ignore_error(CertErrorKind::CertificateBlacklisted, None)
            .build();
        assert_eq!(
            resolve(
                &config,
                PeerVerifyMode::Verify,
                &error(CertErrorKind::CertificateBlacklisted)
            ),
            VerifyDecision::Continue
        );
    }

    #[test]
    fn test_ignored_error_scoped_to_certificate() {
        let pinned = CertificateBuilder::new("pinned").build();
        let other = CertificateBuilder::new("other").build();
        let config = TlsConfig::builder()
            .ignore_error(CertErrorKind::SelfSignedCertificate, Some(pinned.clone()))
            .build();
        let on_pinned = CertError::new(CertErrorKind::SelfSignedCertificate, 0, Some(pinned));
        let on_other = CertError::new(CertErrorKind::SelfSignedCertificate, 0, Some(other));
        assert_eq!(
            resolve(&config, PeerVerifyMode::Verify, &on_pinned),
            VerifyDecision::Continue
        );
        assert_eq!(
            resolve(&config, PeerVerifyMode::Verify, &on_other),
            VerifyDecision::Abort
        );
    }

    #[test]
    fn test_callback_overrides_mode() {
        let cb: CertErrorCallback = Arc::new(|e: &CertError| {
            if e.kind == CertErrorKind::CertificateBlacklisted {
                VerifyDecision::Continue
            } else {
                VerifyDecision::Abort
            }
        });
        let config = TlsConfig::builder().cert_error_callback(cb).build();
        assert_eq!(
            resolve(
                &config,
                PeerVerifyMode::Verify,
                &error(CertErrorKind::CertificateBlacklisted)
            ),
            VerifyDecision::Continue
        );
        assert_eq!(
            resolve(&config, PeerVerifyMode::Query, &error(CertErrorKind::ChainTooLong)),
            VerifyDecision::Abort
        );
    }

    // ------------------------------------------------------------------
    // verify_peer_certificate
    // ------------------------------------------------------------------

    #[test]
    fn test_anchored_chain_is_clean() {
        let (root, leaf) = pki("example.com");
        let config = TlsConfig::builder()
            .trusted_cert(root)
            .verification_time(NOW)
            .build();
        let chain = [leaf];
        let v = verify_peer_certificate(&config, &engine(), &client_request("example.com", &chain))
            .unwrap();
        assert!(v.evaluation.is_clean());
        assert_eq!(v.chain.len(), 2);
    }

    #[test]
    fn test_target_name_mismatch_aborts() {
        let (root, leaf) = pki("example.com");
        let config = TlsConfig::builder()
            .trusted_cert(root)
            .verification_time(NOW)
            .build();
        let chain = [leaf];
        let v = verify_peer_certificate(&config, &engine(), &client_request("evil.test", &chain))
            .unwrap();
        assert!(v.evaluation.stopped);
        match trust_error(&v.evaluation) {
            Some(TlsError::TrustError { kind, depth }) => {
                assert_eq!(kind, CertErrorKind::HostNameMismatch);
                assert_eq!(depth, Some(0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_peer_verify_name_overrides_target() {
        let (root, leaf) = pki("internal.example");
        let config = TlsConfig::builder()
            .trusted_cert(root)
            .verification_time(NOW)
            .peer_verify_name("internal.example")
            .build();
        let chain = [leaf];
        let v = verify_peer_certificate(&config, &engine(), &client_request("10.0.0.1", &chain))
            .unwrap();
        assert!(v.evaluation.is_clean());
    }

    #[test]
    fn test_system_roots_only_when_enabled() {
        let (root, leaf) = pki("example.com");
        let chain = [leaf];
        let roots = [root];
        let request = PeerVerifyRequest {
            system_roots: &roots,
            ..client_request("example.com", &chain)
        };

        let on = TlsConfig::builder().verification_time(NOW).build();
        let v = verify_peer_certificate(&on, &engine(), &request).unwrap();
        assert!(v.evaluation.is_clean());

        let off = TlsConfig::builder()
            .verification_time(NOW)
            .load_system_roots_on_demand(false)
            .build();
        let v = verify_peer_certificate(&off, &engine(), &request).unwrap();
        assert_eq!(
            v.evaluation.errors[0].kind,
            CertErrorKind::UnableToGetIssuerCertificate
        );
    }

    #[test]
    fn test_empty_chain_under_verify() {
        let config = TlsConfig::builder().verify_mode(PeerVerifyMode::Verify).build();
        let v = verify_peer_certificate(&config, &engine(), &client_request("x", &[])).unwrap();
        assert!(v.evaluation.stopped);
        assert!(v.evaluation.contains(CertErrorKind::NoPeerCertificate));
    }

    #[test]
    fn test_server_auto_verify_tolerates_missing_client_certificate() {
        let config = TlsConfig::builder().build();
        let request = PeerVerifyRequest {
            role: TlsRole::Server,
            target_name: None,
            peer_chain: &[],
            system_roots: &[],
        };
        let v = verify_peer_certificate(&config, &engine(), &request).unwrap();
        assert!(v.evaluation.is_clean());
        assert!(trust_error(&v.evaluation).is_none());
    }

    #[test]
    fn test_verify_none_skips_evaluation() {
        let leaf = CertificateBuilder::new("self").build();
        let config = TlsConfig::builder().verify_mode(PeerVerifyMode::None).build();
        let chain = [leaf];
        let v = verify_peer_certificate(&config, &engine(), &client_request("other", &chain))
            .unwrap();
        assert!(v.evaluation.is_clean());
        assert_eq!(v.chain.len(), 1);
    }

    #[test]
    fn test_query_mode_reports_every_finding() {
        let leaf = CertificateBuilder::new("self").validity(0, 10).build();
        let config = TlsConfig::builder()
            .verify_mode(PeerVerifyMode::Query)
            .verification_time(NOW)
            .build();
        let chain = [leaf];
        let v = verify_peer_certificate(&config, &engine(), &client_request("other", &chain))
            .unwrap();
        assert!(!v.evaluation.stopped);
        let kinds: Vec<_> = v.evaluation.errors.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CertErrorKind::CertificateExpired,
                CertErrorKind::SelfSignedCertificate,
                CertErrorKind::HostNameMismatch,
            ]
        );
    }
}
