//! PKCS#12 certificate decoding and identity attributes.
//!
//! The operator's A1 certificate arrives as a passphrase-protected PKCS#12
//! bundle. Decoding unwraps the bundle, selects the leaf certificate and
//! private key, and exposes the identity attributes the rest of the client
//! needs. Nothing is stored; the caller owns the returned identity.

use chrono::{DateTime, TimeZone, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509NameRef, X509Ref};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;

use crate::error::{OperationResult, SefazError};

/// Decoded certificate identity.
///
/// Immutable after creation. Carries the original PKCS#12 DER and
/// passphrase because the TLS layer consumes the bundle whole when it
/// builds the client identity; the passphrase is held in a [`SecretString`]
/// and never appears in logs or `Debug` output.
#[derive(Clone)]
pub struct CertificateIdentity {
    subject: String,
    issuer: String,
    serial_number: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    private_key: PKey<Private>,
    chain_der: Vec<Vec<u8>>,
    pkcs12_der: Vec<u8>,
    passphrase: SecretString,
}

impl CertificateIdentity {
    /// Subject distinguished name, rendered as `K=V, ...` pairs.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Issuer distinguished name.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Certificate serial number in uppercase hex.
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    /// Start of the validity window.
    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// End of the validity window.
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Leaf private key.
    pub fn private_key(&self) -> &PKey<Private> {
        &self.private_key
    }

    /// DER certificates, leaf first. Never empty.
    pub fn certificate_chain(&self) -> &[Vec<u8>] {
        &self.chain_der
    }

    /// The original PKCS#12 bundle, for TLS identity construction.
    pub fn pkcs12_der(&self) -> &[u8] {
        &self.pkcs12_der
    }

    /// The bundle passphrase.
    pub fn passphrase(&self) -> &SecretString {
        &self.passphrase
    }

    /// Whether the certificate has expired as of the given instant.
    pub fn is_expired(&self, as_of: DateTime<Utc>) -> bool {
        as_of > self.not_after
    }

    /// Whole days until expiry as of the given instant; negative once the
    /// certificate has expired.
    pub fn days_until_expiry(&self, as_of: DateTime<Utc>) -> i64 {
        (self.not_after - as_of).num_days()
    }
}

impl fmt::Debug for CertificateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateIdentity")
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .field("serial_number", &self.serial_number)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("chain_len", &self.chain_der.len())
            .finish_non_exhaustive()
    }
}

/// PKCS#12 decoder.
pub struct CertificateStore;

impl CertificateStore {
    /// Decode a PKCS#12 bundle into a [`CertificateIdentity`].
    ///
    /// The first certificate bag is selected as the leaf; any CA
    /// certificates in the bundle follow it in the chain.
    ///
    /// # Errors
    ///
    /// - [`SefazError::InvalidFormat`] if the bytes are not a PKCS#12
    ///   ASN.1 structure, the key bag is missing, or the validity window
    ///   is inverted
    /// - [`SefazError::WrongPassphrase`] if MAC verification or key
    ///   decryption fails
    /// - [`SefazError::NoCertificateFound`] if no certificate bag is
    ///   present
    pub fn decode(
        pkcs12_der: &[u8],
        passphrase: &SecretString,
    ) -> OperationResult<CertificateIdentity> {
        let bundle = Pkcs12::from_der(pkcs12_der).map_err(|e| {
            SefazError::InvalidFormat(format!("not a PKCS#12 ASN.1 structure: {e}"))
        })?;

        // A parse failure on a structurally valid bundle means the MAC or
        // key decryption rejected the passphrase.
        let parsed = bundle
            .parse2(passphrase.expose_secret())
            .map_err(|_| SefazError::WrongPassphrase)?;

        let cert = parsed.cert.ok_or(SefazError::NoCertificateFound)?;
        let private_key = parsed.pkey.ok_or_else(|| {
            SefazError::InvalidFormat("PKCS#12 bundle contains no private key bag".to_string())
        })?;

        let not_before = asn1_time_to_utc(cert.not_before())?;
        let not_after = asn1_time_to_utc(cert.not_after())?;
        if not_before > not_after {
            return Err(SefazError::InvalidFormat(
                "certificate validity window is inverted".to_string(),
            ));
        }

        let mut chain_der = vec![cert_der(&cert)?];
        if let Some(ca) = parsed.ca {
            for extra in &ca {
                chain_der.push(cert_der(extra)?);
            }
        }

        Ok(CertificateIdentity {
            subject: name_to_string(cert.subject_name()),
            issuer: name_to_string(cert.issuer_name()),
            serial_number: serial_hex(&cert)?,
            not_before,
            not_after,
            private_key,
            chain_der,
            pkcs12_der: pkcs12_der.to_vec(),
            passphrase: passphrase.clone(),
        })
    }
}

fn cert_der(cert: &X509Ref) -> OperationResult<Vec<u8>> {
    cert.to_der()
        .map_err(|e| SefazError::InvalidFormat(format!("certificate re-encoding failed: {e}")))
}

/// Render a distinguished name as `K=V, ...`, skipping entries with
/// non-printable values.
fn name_to_string(name: &X509NameRef) -> String {
    name.entries()
        .filter_map(|entry| {
            let key = entry.object().nid().short_name().ok()?;
            let value = entry.data().as_utf8().ok()?;
            Some(format!("{key}={value}"))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn serial_hex(cert: &X509Ref) -> OperationResult<String> {
    let bn = cert
        .serial_number()
        .to_bn()
        .map_err(|e| SefazError::InvalidFormat(format!("unreadable serial number: {e}")))?;
    let hex = bn
        .to_hex_str()
        .map_err(|e| SefazError::InvalidFormat(format!("unreadable serial number: {e}")))?;
    Ok(hex.to_string())
}

fn asn1_time_to_utc(time: &Asn1TimeRef) -> OperationResult<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)
        .map_err(|e| SefazError::InvalidFormat(format!("time conversion failed: {e}")))?;
    let diff = epoch
        .diff(time)
        .map_err(|e| SefazError::InvalidFormat(format!("unreadable validity timestamp: {e}")))?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| SefazError::InvalidFormat("validity timestamp out of range".to_string()))
}


#[cfg(test)]
mod tests {
    use super::test_support::generate_bundle;
    use super::*;
    use crate::error::ErrorKind;

    fn secret(s: &str) -> SecretString {
        SecretString::new(s.to_string())
    }

    #[test]
    fn test_decode_valid_bundle() {
        let der = generate_bundle("senha123", -1, 364);
        let identity = CertificateStore::decode(&der, &secret("senha123")).unwrap();

        assert!(identity.not_before() <= identity.not_after());
        assert!(identity.subject().contains("EMPRESA TESTE LTDA"));
        assert!(identity.subject().contains("O=ICP-Brasil"));
        // Self-signed, so issuer mirrors subject.
        assert_eq!(identity.subject(), identity.issuer());
        assert!(!identity.serial_number().is_empty());
        assert_eq!(identity.certificate_chain().len(), 1);
        assert!(!identity.certificate_chain()[0].is_empty());
    }

    #[test]
    fn test_decode_wrong_passphrase_is_never_invalid_format() {
        let der = generate_bundle("correta", -1, 364);
        let err = CertificateStore::decode(&der, &secret("errada")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongPassphrase);
    }

    #[test]
    fn test_decode_garbage_is_invalid_format_regardless_of_passphrase() {
        let garbage = b"this is definitely not ASN.1 DER";
        for pass in ["", "anything", "senha123"] {
            let err = CertificateStore::decode(garbage, &secret(pass)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidFormat);
        }
    }

    #[test]
    fn test_decode_empty_input() {
        let err = CertificateStore::decode(&[], &secret("x")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);
    }

    #[test]
    fn test_expiry_helpers() {
        let der = generate_bundle("p", -10, 90);
        let identity = CertificateStore::decode(&der, &secret("p")).unwrap();
        let now = Utc::now();

        assert!(!identity.is_expired(now));
        let days = identity.days_until_expiry(now);
        assert!((88..=90).contains(&days), "days = {days}");
    }

    #[test]
    fn test_expired_certificate_reports_negative_days() {
        let der = generate_bundle("p", -100, -30);
        let identity = CertificateStore::decode(&der, &secret("p")).unwrap();
        let now = Utc::now();

        assert!(identity.is_expired(now));
        let days = identity.days_until_expiry(now);
        assert!((-31..=-29).contains(&days), "days = {days}");
    }

    #[test]
    fn test_debug_output_has_no_key_material() {
        let der = generate_bundle("segredo-nunca-logado", -1, 30);
        let identity = CertificateStore::decode(&der, &secret("segredo-nunca-logado")).unwrap();
        let rendered = format!("{identity:?}");
        assert!(!rendered.contains("segredo-nunca-logado"));
        assert!(rendered.contains("EMPRESA TESTE LTDA"));
    }
}
