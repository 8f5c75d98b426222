//! Process-wide provider defaults.
//!
//! The first session to need them snapshots the provider's protocol list,
//! cipher suites and system trust store. Every later caller sees that same
//! snapshot, whichever provider it passes.

use std::sync::OnceLock;

use platls_pki::x509::Certificate;
use tracing::{debug, warn};

use crate::provider::PlatformSecurityContext;
use crate::{CipherSuite, TlsVersion};

/// Snapshot of the provider's defaults.
#[derive(Debug, Clone, Default)]
pub struct ProcessDefaults {
    pub protocols: Vec<TlsVersion>,
    pub cipher_suites: Vec<CipherSuite>,
    pub system_roots: Vec<Certificate>,
}

impl ProcessDefaults {
    fn snapshot<P: PlatformSecurityContext + ?Sized>(provider: &P) -> Self {
        let system_roots = provider.system_roots().unwrap_or_else(|e| {
            warn!(error = %e, "system trust store unavailable, continuing without it");
            Vec::new()
        });
        let defaults = Self {
            protocols: provider.supported_versions(),
            cipher_suites: provider.default_cipher_suites(),
            system_roots,
        };
        debug!(
            protocols = defaults.protocols.len(),
            cipher_suites = defaults.cipher_suites.len(),
            system_roots = defaults.system_roots.len(),
            "process defaults initialized"
        );
        defaults
    }
}

/// A lazily initialized [`ProcessDefaults`].
#[derive(Debug)]
pub struct DefaultsCell(OnceLock<ProcessDefaults>);

impl Default for DefaultsCell {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultsCell {
    pub const fn new() -> Self {
        Self(OnceLock::new())
    }

    /// Return the snapshot, taking it from `provider` on first use.
    pub fn get_or_init<P: PlatformSecurityContext + ?Sized>(&self, provider: &P) -> &ProcessDefaults {
        self.0.get_or_init(|| ProcessDefaults::snapshot(provider))
    }

    pub fn get(&self) -> Option<&ProcessDefaults> {
        self.0.get()
    }
}

/// The defaults shared by every session in the process.
pub static PROCESS_DEFAULTS: DefaultsCell = DefaultsCell::new();

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::loopback::LoopbackProvider;
    use platls_pki::x509::CertificateBuilder;

    #[test]
    fn test_first_snapshot_wins() {
        let cell = DefaultsCell::new();
        assert!(cell.get().is_none());

        let first = LoopbackProvider::new()
            .with_cipher_suites(&[CipherSuite::TLS_AES_128_GCM_SHA256])
            .with_system_roots(vec![CertificateBuilder::new("Root").build()]);
        let second = LoopbackProvider::new()
            .with_cipher_suites(&[CipherSuite::TLS_AES_256_GCM_SHA384])
            .with_versions(&[TlsVersion::Tls12]);

        let a = cell.get_or_init(&first);
        assert_eq!(a.cipher_suites, vec![CipherSuite::TLS_AES_128_GCM_SHA256]);
        assert_eq!(a.system_roots.len(), 1);

        let b = cell.get_or_init(&second);
        assert!(std::ptr::eq(a, b));
        assert_eq!(b.cipher_suites, vec![CipherSuite::TLS_AES_128_GCM_SHA256]);
        assert_eq!(b.protocols.len(), 4);
    }

    #[test]
    fn test_concurrent_initialization_observes_one_snapshot() {
        static CELL: DefaultsCell = DefaultsCell::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                std::thread::spawn(move || {
                    let suite = if i % 2 == 0 {
                        CipherSuite::TLS_AES_128_GCM_SHA256
                    } else {
                        CipherSuite::TLS_AES_256_GCM_SHA384
                    };
                    let provider = LoopbackProvider::new().with_cipher_suites(&[suite]);
                    CELL.get_or_init(&provider).cipher_suites.clone()
                })
            })
            .collect();
        let seen: Vec<Vec<CipherSuite>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(seen.windows(2).all(|w| w[0] == w[1]));
    }
}
