//! Portable X.509 certificate model.
//!
//! Certificates reach this crate already decoded by the platform codec: the
//! raw DER is kept for identity comparisons, and the extensions the chain
//! validator needs are exposed as an OID → decoded value mapping.

mod builder;
pub mod hostname;

pub use builder::CertificateBuilder;

/// Well-known extension and key-purpose identifiers (dotted form).
pub mod oid {
    pub const BASIC_CONSTRAINTS: &str = "2.5.29.19";
    pub const KEY_USAGE: &str = "2.5.29.15";
    pub const EXT_KEY_USAGE: &str = "2.5.29.37";
    pub const SUBJECT_ALT_NAME: &str = "2.5.29.17";
    /// Legacy Netscape certificate type extension.
    pub const NETSCAPE_CERT_TYPE: &str = "2.16.840.1.113730.1.1";

    pub const KP_SERVER_AUTH: &str = "1.3.6.1.5.5.7.3.1";
    pub const KP_CLIENT_AUTH: &str = "1.3.6.1.5.5.7.3.2";
    pub const ANY_EXTENDED_KEY_USAGE: &str = "2.5.29.37.0";
}

/// An X.509 certificate as handed over by the platform codec.
#[derive(Debug, Clone)]
pub struct Certificate {
    /// DER-encoded certificate data.
    pub raw: Vec<u8>,
    /// Serial number.
    pub serial_number: Vec<u8>,
    /// Issuer distinguished name.
    pub issuer: DistinguishedName,
    /// Subject distinguished name.
    pub subject: DistinguishedName,
    /// Not-before validity time (UNIX timestamp).
    pub not_before: i64,
    /// Not-after validity time (UNIX timestamp).
    pub not_after: i64,
    /// Decoded extensions.
    pub extensions: Vec<X509Extension>,
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Certificate {}

/// A distinguished name (DN).
#[derive(Debug, Clone, Default)]
pub struct DistinguishedName {
    pub entries: Vec<(String, String)>,
}

impl DistinguishedName {
    /// Build a DN holding a single common name.
    pub fn common_name(cn: &str) -> Self {
        Self {
            entries: vec![("CN".into(), cn.into())],
        }
    }

    /// Get the value for a given attribute short name (e.g., "CN").
    pub fn get(&self, attr: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == attr)
            .map(|(_, v)| v.as_str())
    }
}

impl PartialEq for DistinguishedName {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for DistinguishedName {}

impl std::fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.entries.iter().map(|(k, v)| format!("{k}={v}")).collect();
        f.write_str(&parts.join(", "))
    }
}

/// An X.509 extension with its decoded value.
#[derive(Debug, Clone)]
pub struct X509Extension {
    pub oid: String,
    pub critical: bool,
    pub value: ExtensionValue,
}

/// Decoded extension payloads the validator understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionValue {
    BasicConstraints(BasicConstraints),
    KeyUsage(KeyUsage),
    ExtendedKeyUsage(Vec<String>),
    SubjectAltName(SubjectAltName),
    NetscapeCertType(NetscapeCertType),
    /// Extension the codec did not decode; raw DER value.
    Opaque(Vec<u8>),
}

/// Parsed BasicConstraints extension (RFC 5280 §4.2.1.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicConstraints {
    pub is_ca: bool,
    pub path_len_constraint: Option<u32>,
}

/// Parsed Subject Alternative Name extension (RFC 5280 §4.2.1.6).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectAltName {
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<Vec<u8>>,
}

/// Parsed KeyUsage extension (RFC 5280 §4.2.1.3) as a bit-flag mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyUsage(pub u16);

impl KeyUsage {
    // BIT STRING bit numbering: bit 0 = MSB of first byte (0x80).
    pub const DIGITAL_SIGNATURE: u16 = 0x0080;
    pub const KEY_ENCIPHERMENT: u16 = 0x0020;
    pub const KEY_AGREEMENT: u16 = 0x0008;
    pub const KEY_CERT_SIGN: u16 = 0x0004;
    pub const CRL_SIGN: u16 = 0x0002;

    pub fn has(&self, flag: u16) -> bool {
        self.0 & flag != 0
    }
}

/// Netscape certificate type bits. Predates EKU and is still honoured
/// when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetscapeCertType(pub u8);

impl NetscapeCertType {
    pub const SSL_CLIENT: u8 = 0x80;
    pub const SSL_SERVER: u8 = 0x40;
    pub const SSL_CA: u8 = 0x04;

    pub fn has(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }
}

impl Certificate {
    /// Look up a decoded extension by OID.
    pub fn extension(&self, oid: &str) -> Option<&ExtensionValue> {
        self.extensions
            .iter()
            .find(|e| e.oid == oid)
            .map(|e| &e.value)
    }

    pub fn basic_constraints(&self) -> Option<BasicConstraints> {
        match self.extension(oid::BASIC_CONSTRAINTS)? {
            ExtensionValue::BasicConstraints(bc) => Some(*bc),
            _ => None,
        }
    }

    pub fn key_usage(&self) -> Option<KeyUsage> {
        match self.extension(oid::KEY_USAGE)? {
            ExtensionValue::KeyUsage(ku) => Some(*ku),
            _ => None,
        }
    }

    pub fn extended_key_usage(&self) -> Option<&[String]> {
        match self.extension(oid::EXT_KEY_USAGE)? {
            ExtensionValue::ExtendedKeyUsage(purposes) => Some(purposes),
            _ => None,
        }
    }

    pub fn subject_alt_name(&self) -> Option<&SubjectAltName> {
        match self.extension(oid::SUBJECT_ALT_NAME)? {
            ExtensionValue::SubjectAltName(san) => Some(san),
            _ => None,
        }
    }

    pub fn netscape_cert_type(&self) -> Option<NetscapeCertType> {
        match self.extension(oid::NETSCAPE_CERT_TYPE)? {
            ExtensionValue::NetscapeCertType(ct) => Some(*ct),
            _ => None,
        }
    }

    /// Returns true if this certificate is a CA (BasicConstraints present with isCA=true).
    pub fn is_ca(&self) -> bool {
        self.basic_constraints().is_some_and(|bc| bc.is_ca)
    }

    /// Returns true if issuer and subject are the same name.
    pub fn is_self_signed(&self) -> bool {
        self.issuer == self.subject
    }

    /// Subject common name, if any.
    pub fn common_name(&self) -> Option<&str> {
        self.subject.get("CN")
    }

    /// Whether `time` (UNIX seconds) falls inside the validity window.
    pub fn is_valid_at(&self, time: i64) -> bool {
        time >= self.not_before && time <= self.not_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_lookup_by_oid() {
        let cert = CertificateBuilder::new("leaf.example.com")
            .issuer("Example CA")
            .add_basic_constraints(false, None)
            .add_key_usage(KeyUsage::DIGITAL_SIGNATURE)
            .build();
        assert!(cert.basic_constraints().is_some());
        assert!(!cert.is_ca());
        assert!(cert.key_usage().unwrap().has(KeyUsage::DIGITAL_SIGNATURE));
        assert!(cert.extended_key_usage().is_none());
        assert!(matches!(
            cert.extension(oid::KEY_USAGE),
            Some(ExtensionValue::KeyUsage(_))
        ));
    }

    #[test]
    fn test_self_signed_detection() {
        let root = CertificateBuilder::new("Root").build();
        let leaf = CertificateBuilder::new("leaf").issuer("Root").build();
        assert!(root.is_self_signed());
        assert!(!leaf.is_self_signed());
    }

    #[test]
    fn test_validity_window_is_inclusive() {
        let cert = CertificateBuilder::new("a").validity(100, 200).build();
        assert!(!cert.is_valid_at(99));
        assert!(cert.is_valid_at(100));
        assert!(cert.is_valid_at(200));
        assert!(!cert.is_valid_at(201));
    }

    #[test]
    fn test_certificate_equality_uses_raw_der() {
        let a = CertificateBuilder::new("same").serial_number(&[1]).build();
        let b = CertificateBuilder::new("same").serial_number(&[2]).build();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_dn_display() {
        let dn = DistinguishedName {
            entries: vec![("CN".into(), "host".into()), ("O".into(), "Org".into())],
        };
        assert_eq!(dn.to_string(), "CN=host, O=Org");
    }
}
