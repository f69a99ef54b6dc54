//! SOAP response parsing.
//!
//! Uses quick-xml which is safe against XXE by default (doesn't expand
//! entities). All element matching is by LOCAL name: the same semantic
//! element appears under different namespace prefixes across SEFAZ server
//! versions, and the envelope may use `soap:` or a default namespace.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, NaiveDate};
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::Reader;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{OperationResult, SefazError};

/// Result elements of the listing operation, by local name.
const LIST_RESULT_ELEMENTS: &[&str] = &["nfeDistDFeInteresseResult", "retDistDFeInt"];
/// Result elements of the download operation, by local name.
const DOWNLOAD_RESULT_ELEMENTS: &[&str] = &["nfeDownloadNFResult", "retDownloadNFe"];
/// Elements that carry one document summary each.
const DOCUMENT_ELEMENTS: &[&str] = &["resNFe", "docNFe"];

/// One document summary from a listing response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// 44-digit access key
    pub access_key: String,
    /// Fiscal series
    pub series: String,
    /// Document number
    pub number: String,
    /// Issue date
    pub issue_date: NaiveDate,
    /// Total amount
    pub amount: Decimal,
    /// Counterparty (issuer) name
    pub counterparty_name: String,
    /// Authorization status
    pub status: DocumentStatus,
}

/// Document authorization status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentStatus {
    Authorized,
    Pending,
    Error,
}

impl DocumentStatus {
    /// Map the service's situation code (or a spelled-out status) onto the
    /// three-state model. Unknown codes are reported as `Error` so they
    /// are never mistaken for an authorized document.
    pub fn from_code(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "1" | "autorizada" | "autorizado" => Self::Authorized,
            "2" | "pendente" => Self::Pending,
            _ => Self::Error,
        }
    }
}

/// A fetched document payload.
///
/// `raw_xml` is checked for well-formedness only; schema validation
/// against the national layout is out of scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentXml {
    pub access_key: String,
    pub raw_xml: String,
}

/// Parse a listing response into document records.
///
/// A present result element with zero document nodes is a valid empty
/// listing. An absent result element in otherwise valid XML is
/// [`SefazError::UnexpectedShape`]; input that is not XML at all is
/// [`SefazError::MalformedXml`].
pub fn parse_list_response(xml: &str) -> OperationResult<Vec<DocumentRecord>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut saw_element = false;
    let mut result_seen = false;
    let mut in_result = false;
    let mut records = Vec::new();
    let mut current: Option<RecordDraft> = None;
    let mut field: Option<String> = None;
    let mut service_status: Option<String> = None;
    let mut service_reason: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                saw_element = true;
                let local = local_name_str(e);
                if LIST_RESULT_ELEMENTS.contains(&local.as_str()) {
                    in_result = true;
                    result_seen = true;
                } else if in_result && current.is_none()
                    && DOCUMENT_ELEMENTS.contains(&local.as_str())
                {
                    current = Some(RecordDraft::default());
                } else {
                    field = Some(local);
                }
            }
            Ok(Event::Empty(ref e)) => {
                saw_element = true;
                let local = local_name_str(e);
                if in_result && current.is_none() && DOCUMENT_ELEMENTS.contains(&local.as_str()) {
                    // Self-closing document node carries no fields; nothing
                    // usable to record.
                    warn!("document element without content in listing response");
                }
            }
            Ok(Event::Text(ref t)) => {
                let value = t
                    .unescape()
                    .map(|c| c.trim().to_string())
                    .unwrap_or_default();
                if value.is_empty() {
                    continue;
                }
                if let Some(draft) = current.as_mut() {
                    draft.set_field(field.as_deref(), &value);
                } else if in_result {
                    match field.as_deref() {
                        Some("cStat") => service_status = Some(value),
                        Some("xMotivo") => service_reason = Some(value),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                let local = end_local_name_str(e);
                if DOCUMENT_ELEMENTS.contains(&local.as_str()) {
                    if let Some(draft) = current.take() {
                        match draft.finalize() {
                            Some(record) => records.push(record),
                            None => warn!("skipping listing entry with missing access key or issue date"),
                        }
                    }
                } else if LIST_RESULT_ELEMENTS.contains(&local.as_str()) {
                    in_result = false;
                } else {
                    field = None;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SefazError::MalformedXml(e.to_string())),
            _ => {}
        }
    }

    if !saw_element {
        return Err(SefazError::MalformedXml(
            "response contains no XML element".to_string(),
        ));
    }
    if !result_seen {
        return Err(SefazError::UnexpectedShape {
            missing: "nfeDistDFeInteresseResult".to_string(),
        });
    }

    debug!(
        records = records.len(),
        service_status = service_status.as_deref().unwrap_or("-"),
        service_reason = service_reason.as_deref().unwrap_or("-"),
        "parsed listing response"
    );

    Ok(records)
}

/// Parse a download response into the embedded document XML.
///
/// The payload may be inline XML (possibly entity-escaped) or
/// base64-encoded, depending on server behavior; both are handled. The
/// decoded payload must itself be well-formed XML.
pub fn parse_download_response(xml: &str) -> OperationResult<DocumentXml> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut saw_element = false;
    let mut payload: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                saw_element = true;
                let local = local_name_str(e);
                if DOWNLOAD_RESULT_ELEMENTS.contains(&local.as_str()) {
                    let name = e.name();
                    let inner = reader
                        .read_text(name)
                        .map_err(|e| SefazError::MalformedXml(e.to_string()))?;
                    payload = Some(inner.into_owned());
                    break;
                }
            }
            Ok(Event::Empty(ref e)) => {
                saw_element = true;
                let local = local_name_str(e);
                if DOWNLOAD_RESULT_ELEMENTS.contains(&local.as_str()) {
                    payload = Some(String::new());
                    break;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SefazError::MalformedXml(e.to_string())),
            _ => {}
        }
    }

    if !saw_element {
        return Err(SefazError::MalformedXml(
            "response contains no XML element".to_string(),
        ));
    }
    let payload = payload.ok_or_else(|| SefazError::UnexpectedShape {
        missing: "nfeDownloadNFResult".to_string(),
    })?;

    let raw_xml = decode_document_payload(&payload)?;
    check_well_formed(&raw_xml)?;
    let access_key = extract_access_key(&raw_xml).unwrap_or_default();

    Ok(DocumentXml {
        access_key,
        raw_xml,
    })
}

/// Accept any parseable SOAP envelope, including faults and business
/// rejections. Used by the connectivity probe, where a rejection of the
/// probe key still proves the round trip.
pub fn validate_soap_envelope(xml: &str) -> OperationResult<()> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut saw_element = false;
    let mut envelope_seen = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                saw_element = true;
                if local_name_str(e) == "Envelope" {
                    envelope_seen = true;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SefazError::MalformedXml(e.to_string())),
            _ => {}
        }
    }

    if !saw_element {
        return Err(SefazError::MalformedXml(
            "response contains no XML element".to_string(),
        ));
    }
    if !envelope_seen {
        return Err(SefazError::UnexpectedShape {
            missing: "Envelope".to_string(),
        });
    }
    Ok(())
}

/// Turn a result-element payload into an XML string: inline markup passes
/// through, escaped markup is unescaped, anything else must be base64.
fn decode_document_payload(payload: &str) -> OperationResult<String> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Err(SefazError::UnexpectedShape {
            missing: "document payload".to_string(),
        });
    }

    if trimmed.starts_with('<') {
        return Ok(trimmed.to_string());
    }

    if trimmed.starts_with("&lt;") {
        let unescaped = quick_xml::escape::unescape(trimmed)
            .map_err(|e| SefazError::MalformedXml(e.to_string()))?;
        return Ok(unescaped.into_owned());
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    let decoded = STANDARD
        .decode(compact.as_bytes())
        .map_err(|_| SefazError::UnexpectedShape {
            missing: "inline or base64 document payload".to_string(),
        })?;
    String::from_utf8(decoded).map_err(|_| {
        SefazError::MalformedXml("base64 payload is not UTF-8 text".to_string())
    })
}

/// Well-formedness check for an extracted document payload.
fn check_well_formed(xml: &str) -> OperationResult<()> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut saw_element = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) | Ok(Event::Empty(_)) => saw_element = true,
            Ok(Event::Eof) => break,
            Err(e) => return Err(SefazError::MalformedXml(e.to_string())),
            _ => {}
        }
    }
    if saw_element {
        Ok(())
    } else {
        Err(SefazError::MalformedXml(
            "document payload contains no XML element".to_string(),
        ))
    }
}

/// Pull the access key out of a document: a `chNFe` element, or the
/// `Id="NFe..."` attribute on `infNFe`.
fn extract_access_key(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut in_key = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let local = local_name_str(e);
                if local == "chNFe" {
                    in_key = true;
                } else if local == "infNFe" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"Id" {
                            let value = String::from_utf8_lossy(&attr.value);
                            let digits: String =
                                value.chars().filter(char::is_ascii_digit).collect();
                            if digits.len() == 44 {
                                return Some(digits);
                            }
                        }
                    }
                }
            }
            Ok(Event::Text(ref t)) if in_key => {
                let value = t
                    .unescape()
                    .map(|c| c.trim().to_string())
                    .unwrap_or_default();
                if value.len() == 44 {
                    return Some(value);
                }
                in_key = false;
            }
            Ok(Event::End(_)) => in_key = false,
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Accumulator for one document node's child fields.
#[derive(Default)]
struct RecordDraft {
    access_key: Option<String>,
    series: Option<String>,
    number: Option<String>,
    issue_date: Option<NaiveDate>,
    amount: Option<Decimal>,
    counterparty_name: Option<String>,
    status: Option<DocumentStatus>,
}

impl RecordDraft {
    fn set_field(&mut self, field: Option<&str>, value: &str) {
        match field {
            Some("chNFe") => self.access_key = Some(value.to_string()),
            Some("serie") => self.series = Some(value.to_string()),
            Some("nNF") => self.number = Some(value.to_string()),
            Some("dhEmi") => self.issue_date = parse_issue_date(value),
            // vPrest is the transport-service counterpart of vNF; either
            // may appear, never both.
            Some("vNF") | Some("vPrest") => self.amount = value.parse().ok(),
            Some("xNome") => self.counterparty_name = Some(value.to_string()),
            Some("cSitNFe") | Some("status") => {
                self.status = Some(DocumentStatus::from_code(value));
            }
            _ => {}
        }
    }

    /// A record needs at least its access key and issue date; everything
    /// else degrades to a neutral default.
    fn finalize(self) -> Option<DocumentRecord> {
        Some(DocumentRecord {
            access_key: self.access_key?,
            series: self.series.unwrap_or_default(),
            number: self.number.unwrap_or_default(),
            issue_date: self.issue_date?,
            amount: self.amount.unwrap_or(Decimal::ZERO),
            counterparty_name: self.counterparty_name.unwrap_or_default(),
            status: self.status.unwrap_or(DocumentStatus::Error),
        })
    }
}

/// Issue timestamps arrive as RFC 3339 with offset, or date-only.
fn parse_issue_date(raw: &str) -> Option<NaiveDate> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

fn local_name_str(e: &BytesStart) -> String {
    let name = e.local_name();
    std::str::from_utf8(name.as_ref()).unwrap_or("").to_string()
}

fn end_local_name_str(e: &BytesEnd) -> String {
    let name = e.local_name();
    std::str::from_utf8(name.as_ref()).unwrap_or("").to_string()
}
