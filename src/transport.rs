//! Mutual-TLS HTTP transport for SOAP exchanges.
//!
//! The server authenticates the taxpayer by the client certificate on the
//! TLS handshake, so a completed handshake is meaningful on its own: any
//! HTTP status with a readable body is handed back to the caller for
//! business-level interpretation. Only handshake failure, connection
//! refusal, and timeout surface as transport errors.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use secrecy::ExposeSecret;
use std::error::Error as _;
use std::time::Duration;
use tracing::{debug, warn};

use crate::certificate::CertificateIdentity;
use crate::config::SefazConfig;
use crate::error::{OperationResult, SefazError};

/// Content type mandated by the SOAP 1.2 binding.
pub const SOAP_CONTENT_TYPE: &str = "application/soap+xml; charset=utf-8";

/// One-shot SOAP dispatch. The orchestrator and tests depend on this seam
/// rather than on a concrete HTTP client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST one SOAP envelope and return the raw response body.
    async fn send(
        &self,
        body: &str,
        soap_action: &str,
        timeout: Duration,
    ) -> OperationResult<String>;
}

/// HTTPS transport presenting the loaded certificate on the handshake.
pub struct MutualTlsTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl MutualTlsTransport {
    /// Build a reusable transport bound to the given identity.
    ///
    /// Server certificate verification follows the default trust store
    /// unless `tls.accept_invalid_server_certs` is set, in which case a
    /// warning is logged naming the endpoint.
    pub fn build(
        identity: &CertificateIdentity,
        config: &SefazConfig,
    ) -> OperationResult<Self> {
        let tls_identity = reqwest::Identity::from_pkcs12_der(
            identity.pkcs12_der(),
            identity.passphrase().expose_secret(),
        )
        .map_err(|e| SefazError::InvalidFormat(format!("TLS identity rejected bundle: {e}")))?;

        let mut builder = reqwest::Client::builder()
            .use_native_tls()
            .identity(tls_identity)
            .connect_timeout(Duration::from_secs(config.tls.connect_timeout_secs));

        if config.tls.accept_invalid_server_certs {
            warn!(
                endpoint = %config.endpoint.url,
                "server certificate verification disabled by configuration"
            );
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().map_err(|e| SefazError::HandshakeFailed {
            endpoint: config.endpoint.url.clone(),
            reason: format!("TLS client construction failed: {e}"),
        })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.url.clone(),
        })
    }

    /// The endpoint this transport posts to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for MutualTlsTransport {
    async fn send(
        &self,
        body: &str,
        soap_action: &str,
        timeout: Duration,
    ) -> OperationResult<String> {
        debug!(
            endpoint = %self.endpoint,
            soap_action,
            timeout_ms = timeout.as_millis() as u64,
            body_len = body.len(),
            "dispatching SOAP request"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .header("SOAPAction", soap_action)
            .timeout(timeout)
            .body(body.to_owned())
            .send()
            .await
            .map_err(|e| classify_request_error(e, &self.endpoint, timeout))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| classify_request_error(e, &self.endpoint, timeout))?;

        if !status.is_success() {
            // The handshake completed, so mutual-TLS auth is confirmed; the
            // business layer decides what the status means.
            debug!(
                status = status.as_u16(),
                body_len = text.len(),
                "non-success HTTP status; body handed to caller"
            );
        }

        Ok(text)
    }
}

/// Map a reqwest error onto the transport taxonomy.
fn classify_request_error(error: reqwest::Error, endpoint: &str, timeout: Duration) -> SefazError {
    if error.is_timeout() {
        return SefazError::Timeout {
            endpoint: endpoint.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
    }

    let reason = source_chain(&error);
    let lowered = reason.to_lowercase();
    if lowered.contains("certificate")
        || lowered.contains("handshake")
        || lowered.contains("alert")
        || lowered.contains("tls")
        || lowered.contains("ssl")
    {
        SefazError::HandshakeFailed {
            endpoint: endpoint.to_string(),
            reason,
        }
    } else {
        SefazError::ConnectionRefused {
            endpoint: endpoint.to_string(),
            reason,
        }
    }
}

/// Flatten an error's source chain; reqwest's `Display` alone hides the
/// underlying TLS/io cause.
fn source_chain(error: &reqwest::Error) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::test_support::generate_bundle;
    use crate::certificate::CertificateStore;
    use secrecy::SecretString;

    #[test]
    fn test_build_transport_from_decoded_identity() {
        let der = generate_bundle("senha", -1, 365);
        let identity =
            CertificateStore::decode(&der, &SecretString::new("senha".to_string())).unwrap();
        let config = SefazConfig::default();

        let transport = MutualTlsTransport::build(&identity, &config).unwrap();
        assert_eq!(
            transport.endpoint(),
            "https://nfe.fazenda.sp.gov.br/ws/nfedownload.asmx"
        );
    }

    #[test]
    fn test_build_transport_with_relaxed_verification() {
        let der = generate_bundle("senha", -1, 365);
        let identity =
            CertificateStore::decode(&der, &SecretString::new("senha".to_string())).unwrap();
        let mut config = SefazConfig::default();
        config.tls.accept_invalid_server_certs = true;

        // Still builds; the relaxation only changes verification policy.
        assert!(MutualTlsTransport::build(&identity, &config).is_ok());
    }

    #[test]
    fn test_soap_content_type() {
        assert_eq!(SOAP_CONTENT_TYPE, "application/soap+xml; charset=utf-8");
    }
}
