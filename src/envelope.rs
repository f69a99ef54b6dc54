//! SOAP 1.2 request envelope builders.
//!
//! Fixed templates matching the SEFAZ NFe download/distribution service.
//! Builders are pure: every dynamic value is validated and normalized
//! before it is placed in the XML.

use chrono::NaiveDate;

use crate::config::Environment;
use crate::error::{OperationResult, SefazError};

/// Payload namespace for NFe protocol elements.
pub const PORTAL_NS: &str = "http://www.portalfiscal.inf.br/nfe";
/// WSDL namespace of the download service.
pub const WSDL_NS: &str = "http://www.portalfiscal.inf.br/nfe/wsdl/NfeDownload";
/// SOAP 1.2 envelope namespace.
pub const SOAP_12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";

/// SOAPAction for the single-document download operation (also used by the
/// connectivity probe, which is a download of a non-existent key).
pub const SOAP_ACTION_DOWNLOAD: &str =
    "http://www.portalfiscal.inf.br/nfe/wsdl/NfeDownload/nfeDownloadNF";
/// SOAPAction for the document-listing query.
pub const SOAP_ACTION_DISTRIBUTION: &str =
    "http://www.portalfiscal.inf.br/nfe/wsdl/NfeDownload/nfeDistDFeInteresse";

/// Zero distribution cursor; every listing restarts the distribution from
/// the beginning. Cursor persistence lives outside this crate.
pub const ZERO_NSU_CURSOR: &str = "000000000000000";

/// Syntactically valid access key that names no real document. Probing
/// with it forces a full handshake and server round trip without expecting
/// a meaningful business result.
const PROBE_ACCESS_KEY: &str = "99999999999999999999999999999999999999999999";
/// Taxpayer id placed in download envelopes. The download service keys on
/// the access key; the requester is identified by the TLS certificate.
const PLACEHOLDER_TAXPAYER_ID: &str = "12345678000195";

/// A validated listing query.
///
/// Construction normalizes the taxpayer id (stripping punctuation from
/// formatted CNPJ input) and enforces the period ordering invariant, so a
/// value of this type is always safe to place in an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentQuery {
    taxpayer_id: String,
    period_start: NaiveDate,
    period_end: NaiveDate,
}

impl DocumentQuery {
    /// Validate and normalize query parameters.
    ///
    /// # Errors
    ///
    /// [`SefazError::InvalidInput`] if the taxpayer id does not normalize
    /// to exactly 14 digits or the period is inverted.
    pub fn new(
        taxpayer_id: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> OperationResult<Self> {
        let normalized = normalize_taxpayer_id(taxpayer_id);
        if normalized.len() != 14 {
            return Err(SefazError::InvalidInput {
                field: "taxpayer_id".to_string(),
                reason: format!(
                    "expected 14 digits after normalization, got {} from {taxpayer_id:?}",
                    normalized.len()
                ),
            });
        }
        if period_start > period_end {
            return Err(SefazError::InvalidInput {
                field: "period".to_string(),
                reason: format!("start {period_start} is after end {period_end}"),
            });
        }
        Ok(Self {
            taxpayer_id: normalized,
            period_start,
            period_end,
        })
    }

    /// Digits-only taxpayer id.
    pub fn taxpayer_id(&self) -> &str {
        &self.taxpayer_id
    }

    pub fn period_start(&self) -> NaiveDate {
        self.period_start
    }

    pub fn period_end(&self) -> NaiveDate {
        self.period_end
    }
}

/// Strip everything but ASCII digits from a formatted taxpayer id.
pub fn normalize_taxpayer_id(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

/// Check that an access key is exactly 44 ASCII digits.
pub fn validate_access_key(access_key: &str) -> OperationResult<()> {
    if access_key.len() != 44 || !access_key.chars().all(|c| c.is_ascii_digit()) {
        return Err(SefazError::InvalidInput {
            field: "access_key".to_string(),
            reason: format!(
                "expected exactly 44 digits, got {} characters",
                access_key.len()
            ),
        });
    }
    Ok(())
}

/// Builder for the three request envelopes.
///
/// Environment and authoring-state code are fixed at construction; they
/// come from configuration, not per-call input.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    environment: Environment,
    uf_code: u8,
}

impl EnvelopeBuilder {
    pub fn new(environment: Environment, uf_code: u8) -> Self {
        Self {
            environment,
            uf_code,
        }
    }

    /// Connectivity probe: a download request for a key that cannot exist.
    pub fn build_probe(&self) -> String {
        self.download_envelope(PLACEHOLDER_TAXPAYER_ID, PROBE_ACCESS_KEY)
    }

    /// Document-listing query starting from the zero distribution cursor.
    pub fn build_list_query(&self, query: &DocumentQuery) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="{SOAP_12_NS}" xmlns:nfe="{WSDL_NS}">
  <soap:Header />
  <soap:Body>
    <nfe:nfeDistDFeInteresse>
      <nfe:nfeDadosMsg>
        <distDFeInt xmlns="{PORTAL_NS}" versao="1.01">
          <tpAmb>{tp_amb}</tpAmb>
          <cUFAutor>{uf}</cUFAutor>
          <CNPJ>{cnpj}</CNPJ>
          <distNSU>
            <ultNSU>{ZERO_NSU_CURSOR}</ultNSU>
          </distNSU>
        </distDFeInt>
      </nfe:nfeDadosMsg>
    </nfe:nfeDistDFeInteresse>
  </soap:Body>
</soap:Envelope>"#,
            tp_amb = self.environment.code(),
            uf = self.uf_code,
            cnpj = query.taxpayer_id(),
        )
    }

    /// Single-document download request.
    ///
    /// # Errors
    ///
    /// [`SefazError::InvalidInput`] if the access key is not exactly 44
    /// digits.
    pub fn build_download_query(&self, access_key: &str) -> OperationResult<String> {
        validate_access_key(access_key)?;
        Ok(self.download_envelope(PLACEHOLDER_TAXPAYER_ID, access_key))
    }

    fn download_envelope(&self, taxpayer_id: &str, access_key: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="{SOAP_12_NS}" xmlns:nfe="{WSDL_NS}">
  <soap:Header />
  <soap:Body>
    <nfe:nfeDownloadNF>
      <nfe:nfeDadosMsg>
        <downloadNFe xmlns="{PORTAL_NS}" versao="1.00">
          <tpAmb>{tp_amb}</tpAmb>
          <xServ>DOWNLOAD NFE</xServ>
          <CNPJ>{taxpayer_id}</CNPJ>
          <chNFe>{access_key}</chNFe>
        </downloadNFe>
      </nfe:nfeDadosMsg>
    </nfe:nfeDownloadNF>
  </soap:Body>
</soap:Envelope>"#,
            tp_amb = self.environment.code(),
        )
    }
}
