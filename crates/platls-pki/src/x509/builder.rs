//! Builder for [`Certificate`] model values.
//!
//! Platform adapters use it to hand decoded certificates to the validator;
//! tests use it to describe chains without a DER codec.

use super::{
    oid, BasicConstraints, Certificate, DistinguishedName, ExtensionValue, KeyUsage,
    NetscapeCertType, SubjectAltName, X509Extension,
};

/// 2100-01-01T00:00:00Z.
const DEFAULT_NOT_AFTER: i64 = 4_102_444_800;

/// Builder for certificate models.
#[derive(Debug, Clone)]
pub struct CertificateBuilder {
    raw: Option<Vec<u8>>,
    serial_number: Vec<u8>,
    subject: DistinguishedName,
    issuer: Option<DistinguishedName>,
    not_before: i64,
    not_after: i64,
    extensions: Vec<X509Extension>,
}

impl CertificateBuilder {
    /// Start a certificate whose subject is `CN=<common_name>`.
    ///
    /// Without an explicit issuer the certificate is self-issued.
    pub fn new(common_name: &str) -> Self {
        Self::with_subject(DistinguishedName::common_name(common_name))
    }

    pub fn with_subject(subject: DistinguishedName) -> Self {
        Self {
            raw: None,
            serial_number: vec![0x01],
            subject,
            issuer: None,
            not_before: 0,
            not_after: DEFAULT_NOT_AFTER,
            extensions: Vec::new(),
        }
    }

    pub fn issuer(self, common_name: &str) -> Self {
        self.issuer_dn(DistinguishedName::common_name(common_name))
    }

    pub fn issuer_dn(mut self, dn: DistinguishedName) -> Self {
        self.issuer = Some(dn);
        self
    }

    pub fn serial_number(mut self, serial: &[u8]) -> Self {
        self.serial_number = serial.to_vec();
        self
    }

    pub fn validity(mut self, not_before: i64, not_after: i64) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    /// Use the given DER bytes instead of the synthesized identity encoding.
    pub fn raw(mut self, der: Vec<u8>) -> Self {
        self.raw = Some(der);
        self
    }

    pub fn add_extension(mut self, oid: &str, critical: bool, value: ExtensionValue) -> Self {
        self.extensions.retain(|e| e.oid != oid);
        self.extensions.push(X509Extension {
            oid: oid.to_string(),
            critical,
            value,
        });
        self
    }

    pub fn add_basic_constraints(self, is_ca: bool, path_len: Option<u32>) -> Self {
        self.add_extension(
            oid::BASIC_CONSTRAINTS,
            true,
            ExtensionValue::BasicConstraints(BasicConstraints {
                is_ca,
                path_len_constraint: path_len,
            }),
        )
    }

    pub fn add_key_usage(self, usage: u16) -> Self {
        self.add_extension(oid::KEY_USAGE, true, ExtensionValue::KeyUsage(KeyUsage(usage)))
    }

    pub fn add_extended_key_usage(self, purposes: &[&str]) -> Self {
        let purposes = purposes.iter().map(|p| p.to_string()).collect();
        self.add_extension(
            oid::EXT_KEY_USAGE,
            false,
            ExtensionValue::ExtendedKeyUsage(purposes),
        )
    }

    pub fn add_subject_alt_name_dns(self, dns_names: &[&str]) -> Self {
        let mut san = self.current_san();
        san.dns_names
            .extend(dns_names.iter().map(|n| n.to_string()));
        self.add_extension(oid::SUBJECT_ALT_NAME, false, ExtensionValue::SubjectAltName(san))
    }

    pub fn add_subject_alt_name_ip(self, ip: &[u8]) -> Self {
        let mut san = self.current_san();
        san.ip_addresses.push(ip.to_vec());
        self.add_extension(oid::SUBJECT_ALT_NAME, false, ExtensionValue::SubjectAltName(san))
    }

    pub fn add_netscape_cert_type(self, bits: u8) -> Self {
        self.add_extension(
            oid::NETSCAPE_CERT_TYPE,
            false,
            ExtensionValue::NetscapeCertType(NetscapeCertType(bits)),
        )
    }

    fn current_san(&self) -> SubjectAltName {
        self.extensions
            .iter()
            .find_map(|e| match &e.value {
                ExtensionValue::SubjectAltName(san) => Some(san.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn build(self) -> Certificate {
        let issuer = self.issuer.unwrap_or_else(|| self.subject.clone());
        let raw = self.raw.unwrap_or_else(|| {
            // Unique per (subject, issuer, serial); stands in for DER identity.
            let mut raw = Vec::new();
            raw.extend_from_slice(self.subject.to_string().as_bytes());
            raw.push(0);
            raw.extend_from_slice(issuer.to_string().as_bytes());
            raw.push(0);
            raw.extend_from_slice(&self.serial_number);
            raw
        });
        Certificate {
            raw,
            serial_number: self.serial_number,
            issuer,
            subject: self.subject,
            not_before: self.not_before,
            not_after: self.not_after,
            extensions: self.extensions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_san_entries_accumulate() {
        let cert = CertificateBuilder::new("host")
            .add_subject_alt_name_dns(&["a.example.com"])
            .add_subject_alt_name_ip(&[127, 0, 0, 1])
            .add_subject_alt_name_dns(&["b.example.com"])
            .build();
        let san = cert.subject_alt_name().unwrap();
        assert_eq!(san.dns_names, vec!["a.example.com", "b.example.com"]);
        assert_eq!(san.ip_addresses, vec![vec![127, 0, 0, 1]]);
        assert_eq!(cert.extensions.len(), 1);
    }

    #[test]
    fn test_explicit_raw_overrides_identity() {
        let cert = CertificateBuilder::new("host").raw(vec![0x30, 0x00]).build();
        assert_eq!(cert.raw, vec![0x30, 0x00]);
    }

    #[test]
    fn test_default_issuer_is_subject() {
        let cert = CertificateBuilder::new("Root CA").build();
        assert_eq!(cert.issuer.get("CN"), Some("Root CA"));
        assert!(cert.is_self_signed());
    }
}
