//! Integration tests for the sefaz-nfe crate.
//!
//! These tests exercise the public API surface end-to-end, combining
//! envelope building, response parsing, certificate decoding, and the
//! client session state machine. Everything runs offline: the network is
//! replaced at the `Transport` seam.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use secrecy::SecretString;
use sefaz_nfe::error::{ErrorKind, OperationResult};
use sefaz_nfe::parser::{parse_download_response, parse_list_response, DocumentStatus};
use sefaz_nfe::{
    CertificateStore, DocumentQuery, EnvelopeBuilder, SefazClient, SefazConfig, SefazError,
    Transport,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn secret(s: &str) -> SecretString {
    SecretString::new(s.to_string())
}

/// Generate a throwaway PKCS#12 bundle: RSA key, self-signed X.509v3 leaf.
fn generate_bundle(passphrase: &str, not_before_days: i64, not_after_days: i64) -> Vec<u8> {
    use openssl::asn1::Asn1Time;
    use openssl::bn::{BigNum, MsbOption};
    use openssl::hash::MessageDigest;
    use openssl::pkcs12::Pkcs12;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509, X509NameBuilder};

    let now = chrono::Utc::now().timestamp();
    let rsa = Rsa::generate(2048).unwrap();
    let pkey = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("C", "BR").unwrap();
    name.append_entry_by_text("O", "ICP-Brasil").unwrap();
    name.append_entry_by_text("CN", "EMPRESA TESTE LTDA:12345678000195")
        .unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&pkey).unwrap();
    let not_before = Asn1Time::from_unix(now + not_before_days * 86_400).unwrap();
    let not_after = Asn1Time::from_unix(now + not_after_days * 86_400).unwrap();
    builder.set_not_before(&not_before).unwrap();
    builder.set_not_after(&not_after).unwrap();
    let mut serial = BigNum::new().unwrap();
    serial.rand(159, MsbOption::MAYBE_ZERO, false).unwrap();
    let serial = serial.to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.sign(&pkey, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    Pkcs12::builder()
        .name("integration test identity")
        .pkey(&pkey)
        .cert(&cert)
        .build2(passphrase)
        .unwrap()
        .to_der()
        .unwrap()
}

/// Transport answering from a scripted queue of outcomes.
struct ScriptedTransport {
    responses: Mutex<VecDeque<OperationResult<String>>>,
    calls: AtomicU64,
}

impl ScriptedTransport {
    fn new(responses: Vec<OperationResult<String>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        _body: &str,
        _soap_action: &str,
        _timeout: Duration,
    ) -> OperationResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()))
    }
}

fn client_with(transport: Arc<dyn Transport>) -> SefazClient {
    let slot = Mutex::new(Some(transport));
    SefazClient::with_transport_factory(
        SefazConfig::default(),
        Box::new(move |_identity, _config| {
            slot.lock()
                .unwrap()
                .take()
                .ok_or(SefazError::NotAuthenticated)
        }),
    )
}

// ============================================================================
// Fixture responses
// ============================================================================

fn listing_fixture(entries: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
  <soap:Body>
    <nfe:nfeDistDFeInteresseResponse xmlns:nfe="http://www.portalfiscal.inf.br/nfe/wsdl/NfeDownload">
      <nfe:nfeDistDFeInteresseResult>
        <retDistDFeInt xmlns="http://www.portalfiscal.inf.br/nfe" versao="1.01">
          <tpAmb>1</tpAmb>
          <cStat>138</cStat>
          <xMotivo>Documento localizado</xMotivo>
          <loteDistDFeInt>{entries}</loteDistDFeInt>
        </retDistDFeInt>
      </nfe:nfeDistDFeInteresseResult>
    </nfe:nfeDistDFeInteresseResponse>
  </soap:Body>
</soap:Envelope>"#
    )
}

const KEY_ONE: &str = "35240112345678000195550010000000011234567890";
const KEY_TWO: &str = "35240198765432000188550010000000021234567891";

fn two_document_fixture() -> String {
    listing_fixture(&format!(
        "<resNFe>\
           <chNFe>{KEY_ONE}</chNFe>\
           <xNome>EMPRESA XYZ LTDA</xNome>\
           <dhEmi>2024-01-15T10:30:00-03:00</dhEmi>\
           <vNF>1250.50</vNF>\
           <serie>1</serie>\
           <nNF>101</nNF>\
           <cSitNFe>1</cSitNFe>\
         </resNFe>\
         <resNFe>\
           <chNFe>{KEY_TWO}</chNFe>\
           <xNome>CLIENTE TESTE S/A</xNome>\
           <dhEmi>2024-01-16T09:00:00-03:00</dhEmi>\
           <vNF>2300.50</vNF>\
           <serie>1</serie>\
           <nNF>102</nNF>\
           <cSitNFe>1</cSitNFe>\
         </resNFe>"
    ))
}

// ============================================================================
// End-to-end: envelope -> parser round trips
// ============================================================================

#[test]
fn test_e2e_listing_round_trip_two_documents() {
    let records = parse_list_response(&two_document_fixture()).unwrap();
    assert_eq!(records.len(), 2);

    assert_eq!(records[0].access_key, KEY_ONE);
    assert_eq!(records[0].counterparty_name, "EMPRESA XYZ LTDA");
    assert_eq!(records[0].issue_date, date("2024-01-15"));
    assert_eq!(records[0].amount, "1250.50".parse::<Decimal>().unwrap());
    assert_eq!(records[0].series, "1");
    assert_eq!(records[0].number, "101");
    assert_eq!(records[0].status, DocumentStatus::Authorized);

    assert_eq!(records[1].access_key, KEY_TWO);
    assert_eq!(records[1].amount, "2300.50".parse::<Decimal>().unwrap());
}

#[test]
fn test_e2e_listing_round_trip_zero_documents() {
    let records = parse_list_response(&listing_fixture("")).unwrap();
    assert!(records.is_empty());
}

#[test]
fn test_e2e_download_round_trip() {
    let inner = format!(
        r#"<nfeProc xmlns="http://www.portalfiscal.inf.br/nfe" versao="4.00"><NFe><infNFe Id="NFe{KEY_ONE}" versao="4.00"><emit><xNome>EMPRESA XYZ LTDA</xNome></emit></infNFe></NFe></nfeProc>"#
    );
    let escaped = inner.replace('<', "&lt;").replace('>', "&gt;");
    let response = format!(
        r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
  <soap:Body>
    <nfe:nfeDownloadNFResponse xmlns:nfe="http://www.portalfiscal.inf.br/nfe/wsdl/NfeDownload">
      <nfe:nfeDownloadNFResult>{escaped}</nfe:nfeDownloadNFResult>
    </nfe:nfeDownloadNFResponse>
  </soap:Body>
</soap:Envelope>"#
    );

    let document = parse_download_response(&response).unwrap();
    assert_eq!(document.access_key, KEY_ONE);
    assert_eq!(document.raw_xml, inner);
}

// ============================================================================
// Envelope construction
// ============================================================================

#[test]
fn test_formatted_cnpj_is_normalized_into_envelope() {
    let builder = EnvelopeBuilder::new(
        sefaz_nfe::config::Environment::Production,
        35,
    );
    let query =
        DocumentQuery::new("12.345.678/0001-95", date("2024-01-01"), date("2024-01-31")).unwrap();
    let xml = builder.build_list_query(&query);
    assert!(xml.contains("<CNPJ>12345678000195</CNPJ>"));
    assert!(xml.contains("<ultNSU>000000000000000</ultNSU>"));
}

#[test]
fn test_download_query_access_key_validation() {
    let builder = EnvelopeBuilder::new(sefaz_nfe::config::Environment::Production, 35);

    assert!(builder.build_download_query(KEY_ONE).is_ok());
    for bad in [
        "1234",
        "999999999999999999999999999999999999999999999", // 45 digits
        "3524011234567800019555001000000001123456789X",  // non-digit
    ] {
        let err = builder.build_download_query(bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput, "input {bad:?}");
    }
}

// ============================================================================
// Certificate decoding properties
// ============================================================================

#[test]
fn test_decode_with_correct_passphrase() {
    let bundle = generate_bundle("minha-senha", -1, 365);
    let identity = CertificateStore::decode(&bundle, &secret("minha-senha")).unwrap();

    assert!(identity.not_before() <= identity.not_after());
    assert!(!identity.certificate_chain().is_empty());
    assert!(identity.subject().contains("EMPRESA TESTE LTDA"));
}

#[test]
fn test_decode_with_wrong_passphrase() {
    let bundle = generate_bundle("minha-senha", -1, 365);
    let err = CertificateStore::decode(&bundle, &secret("senha-errada")).unwrap_err();
    // Wrong passphrase on a valid bundle must never read as a format error.
    assert_eq!(err.kind(), ErrorKind::WrongPassphrase);
}

#[test]
fn test_decode_non_asn1_bytes() {
    for pass in ["", "qualquer"] {
        let err = CertificateStore::decode(b"<html>not a bundle</html>", &secret(pass)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);
    }
}

// ============================================================================
// Client state machine over a scripted transport
// ============================================================================

const PROBE_FAULT: &str = r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
  <soap:Body>
    <soap:Fault>
      <soap:Code><soap:Value>soap:Sender</soap:Value></soap:Code>
      <soap:Reason><soap:Text xml:lang="pt">Chave inexistente</soap:Text></soap:Reason>
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#;

#[tokio::test]
async fn test_probe_without_certificate_is_not_authenticated() {
    let transport = ScriptedTransport::new(vec![]);
    let calls = Arc::clone(&transport);
    let client = client_with(transport);

    let err = client.test_connection().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAuthenticated);
    assert_eq!(calls.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_full_session_flow() {
    let transport = ScriptedTransport::new(vec![
        Ok(PROBE_FAULT.to_string()),
        Ok(two_document_fixture()),
    ]);
    let client = client_with(transport);
    let bundle = generate_bundle("senha", -1, 365);

    client
        .set_certificate(&bundle, secret("senha"))
        .await
        .unwrap();

    // Business rejection of the probe key still proves connectivity.
    client.test_connection().await.unwrap();

    let query =
        DocumentQuery::new("12345678000195", date("2024-01-01"), date("2024-01-31")).unwrap();
    let records = client.list_documents(&query).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().any(|r| r.access_key == KEY_ONE));
    assert!(records.iter().any(|r| r.access_key == KEY_TWO));
}

#[tokio::test]
async fn test_listing_unrecognized_response_is_unexpected_shape() {
    let transport = ScriptedTransport::new(vec![Ok(
        r#"<Envelope xmlns="http://www.w3.org/2003/05/soap-envelope"><Body><unrelated/></Body></Envelope>"#
            .to_string(),
    )]);
    let client = client_with(transport);
    let bundle = generate_bundle("senha", -1, 365);

    client
        .set_certificate(&bundle, secret("senha"))
        .await
        .unwrap();
    let query =
        DocumentQuery::new("12345678000195", date("2024-01-01"), date("2024-01-31")).unwrap();
    let err = client.list_documents(&query).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnexpectedShape);
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_config_defaults_are_strict_and_bounded() {
    let config = SefazConfig::default();
    assert!(!config.tls.accept_invalid_server_certs);
    assert_eq!(config.timeouts.probe_secs, 10);
    assert_eq!(config.timeouts.query_secs, 30);
    assert_eq!(config.retry.max_retries, 2);
}

#[test]
fn test_config_yaml_round_trip() {
    let config = SefazConfig::default();
    let yaml = serde_yaml::to_string(&config).unwrap();
    let parsed: SefazConfig = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(parsed.endpoint.url, config.endpoint.url);
}
