//! Peer-name matching against the leaf certificate.
//!
//! The expected name is compared with the subject common name and with every
//! SAN dNSName entry; any match is accepted. IP literals only match SAN
//! iPAddress entries.

use std::net::IpAddr;

use super::Certificate;

/// Returns true if `cert` is valid for `peer_name`.
pub fn matches_peer_name(cert: &Certificate, peer_name: &str) -> bool {
    let peer_name = peer_name.trim();
    if peer_name.is_empty() {
        return false;
    }

    if let Ok(ip) = peer_name.parse::<IpAddr>() {
        return matches_ip(cert, &ip);
    }

    if let Some(cn) = cert.common_name() {
        if matches_dns(cn, peer_name) {
            return true;
        }
    }

    cert.subject_alt_name()
        .is_some_and(|san| san.dns_names.iter().any(|n| matches_dns(n, peer_name)))
}

fn matches_ip(cert: &Certificate, ip: &IpAddr) -> bool {
    let octets = match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    cert.subject_alt_name()
        .is_some_and(|san| san.ip_addresses.iter().any(|a| *a == octets))
}

/// Check if a certificate DNS name pattern matches a hostname.
///
/// Wildcard rules:
/// - `*` only as the complete leftmost label (`f*o.bar.com` rejected)
/// - at least two labels after the wildcard (`*.com` rejected)
/// - matches exactly one label (`*.example.com` != `a.b.example.com`)
/// - never matches an IDNA A-label (`xn--…`) in the wildcard position
pub fn matches_dns(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();

    if !pattern.contains('*') {
        return pattern == hostname;
    }

    let labels: Vec<&str> = pattern.split('.').collect();
    if labels[0] != "*" || labels[1..].iter().any(|l| l.contains('*')) {
        return false;
    }
    if labels.len() < 3 {
        return false;
    }

    let host_labels: Vec<&str> = hostname.split('.').collect();
    if host_labels.len() != labels.len() {
        return false;
    }
    if host_labels[0].is_empty() || host_labels[0].starts_with("xn--") {
        return false;
    }

    labels[1..]
        .iter()
        .zip(host_labels[1..].iter())
        .all(|(p, h)| p == h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x509::CertificateBuilder;

    fn cert_with_dns(cn: &str, names: &[&str]) -> Certificate {
        CertificateBuilder::new(cn)
            .add_subject_alt_name_dns(names)
            .build()
    }

    #[test]
    fn test_exact_dns_match() {
        let cert = cert_with_dns("unrelated", &["www.example.com"]);
        assert!(matches_peer_name(&cert, "www.example.com"));
    }

    #[test]
    fn test_cn_match_without_san() {
        let cert = CertificateBuilder::new("www.example.com").build();
        assert!(matches_peer_name(&cert, "www.example.com"));
        assert!(!matches_peer_name(&cert, "other.example.com"));
    }

    #[test]
    fn test_cn_and_san_both_consulted() {
        let cert = cert_with_dns("www.example.com", &["other.example.com"]);
        assert!(matches_peer_name(&cert, "www.example.com"));
        assert!(matches_peer_name(&cert, "other.example.com"));
        assert!(!matches_peer_name(&cert, "third.example.com"));
    }

    #[test]
    fn test_wildcard_single_level() {
        let cert = cert_with_dns("x", &["*.example.com"]);
        assert!(matches_peer_name(&cert, "foo.example.com"));
        assert!(!matches_peer_name(&cert, "example.com"));
        assert!(!matches_peer_name(&cert, "a.b.example.com"));
    }

    #[test]
    fn test_wildcard_in_common_name() {
        let cert = CertificateBuilder::new("*.example.com").build();
        assert!(matches_peer_name(&cert, "mail.example.com"));
    }

    #[test]
    fn test_wildcard_minimum_labels() {
        assert!(!matches_dns("*.com", "example.com"));
    }

    #[test]
    fn test_partial_wildcard_rejected() {
        assert!(!matches_dns("f*o.example.com", "foo.example.com"));
        assert!(!matches_dns("www.*.com", "www.example.com"));
    }

    #[test]
    fn test_wildcard_skips_idna_label() {
        assert!(!matches_dns("*.example.com", "xn--bcher-kva.example.com"));
    }

    #[test]
    fn test_case_insensitive() {
        let cert = cert_with_dns("x", &["WWW.Example.com"]);
        assert!(matches_peer_name(&cert, "www.EXAMPLE.com"));
        assert!(matches_dns("*.EXAMPLE.com", "Mail.example.COM"));
    }

    #[test]
    fn test_trailing_dot_ignored() {
        assert!(matches_dns("www.example.com.", "www.example.com"));
    }

    #[test]
    fn test_ipv4_matches_only_ip_san() {
        let cert = CertificateBuilder::new("192.168.1.1")
            .add_subject_alt_name_dns(&["192.168.1.1"])
            .build();
        assert!(!matches_peer_name(&cert, "192.168.1.1"));

        let cert = CertificateBuilder::new("host")
            .add_subject_alt_name_ip(&[192, 168, 1, 1])
            .build();
        assert!(matches_peer_name(&cert, "192.168.1.1"));
        assert!(!matches_peer_name(&cert, "192.168.1.2"));
    }

    #[test]
    fn test_ipv6_match() {
        let mut loopback = [0u8; 16];
        loopback[15] = 1;
        let cert = CertificateBuilder::new("host")
            .add_subject_alt_name_ip(&loopback)
            .build();
        assert!(matches_peer_name(&cert, "::1"));
        assert!(!matches_peer_name(&cert, "::2"));
    }

    #[test]
    fn test_empty_name_never_matches() {
        let cert = CertificateBuilder::new("").build();
        assert!(!matches_peer_name(&cert, ""));
        assert!(!matches_peer_name(&cert, "   "));
    }
}
