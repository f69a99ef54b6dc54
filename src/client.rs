//! SEFAZ client orchestration.
//!
//! Composes certificate decoding, the mutual-TLS transport, envelope
//! building, and response parsing behind the four operations the rest of
//! the application uses. Each client owns its session; there is no
//! process-wide certificate state, so independent clients (multi-tenant
//! use) are just multiple instances.

use secrecy::SecretString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::certificate::{CertificateIdentity, CertificateStore};
use crate::config::SefazConfig;
use crate::envelope::{self, DocumentQuery, EnvelopeBuilder};
use crate::error::{OperationResult, SefazError};
use crate::parser::{self, DocumentRecord, DocumentXml};
use crate::transport::{MutualTlsTransport, Transport};

/// Builds a transport for a freshly decoded identity. Pluggable so tests
/// and alternate deployments can substitute the mutual-TLS transport.
pub type TransportFactory =
    Box<dyn Fn(&CertificateIdentity, &SefazConfig) -> OperationResult<Arc<dyn Transport>> + Send + Sync>;

/// The single active certificate session.
struct ActiveSession {
    identity: Arc<CertificateIdentity>,
    transport: Arc<dyn Transport>,
    generation: u64,
}

/// Client for the SEFAZ NFe web service.
///
/// State machine over one variable: no certificate, or certificate loaded.
/// `set_certificate` is the sole mutator; requests dispatched before a
/// certificate swap run to completion against their original transport but
/// their results come back as [`SefazError::StaleSession`], never touching
/// the new session's state.
pub struct SefazClient {
    config: SefazConfig,
    envelope: EnvelopeBuilder,
    session: RwLock<Option<ActiveSession>>,
    next_generation: AtomicU64,
    transport_factory: TransportFactory,
    /// Metrics tracking
    requests_dispatched: AtomicU64,
    stale_results_discarded: AtomicU64,
}

impl SefazClient {
    /// Create a client that dispatches over [`MutualTlsTransport`].
    pub fn new(config: SefazConfig) -> Self {
        Self::with_transport_factory(
            config,
            Box::new(|identity, config| {
                MutualTlsTransport::build(identity, config)
                    .map(|transport| Arc::new(transport) as Arc<dyn Transport>)
            }),
        )
    }

    /// Create a client with a custom transport factory.
    pub fn with_transport_factory(config: SefazConfig, transport_factory: TransportFactory) -> Self {
        let envelope = EnvelopeBuilder::new(config.endpoint.environment, config.endpoint.uf_code);
        Self {
            config,
            envelope,
            session: RwLock::new(None),
            next_generation: AtomicU64::new(0),
            transport_factory,
            requests_dispatched: AtomicU64::new(0),
            stale_results_discarded: AtomicU64::new(0),
        }
    }

    /// Decode a PKCS#12 bundle and install it as the active session,
    /// replacing any previous one.
    ///
    /// On any failure the client holds no certificate afterwards; the
    /// caller sees the specific decode or transport-construction error.
    pub async fn set_certificate(
        &self,
        pkcs12_der: &[u8],
        passphrase: SecretString,
    ) -> OperationResult<CertificateIdentity> {
        // The write lock serializes certificate replacement against itself
        // and against readers picking up a session for dispatch.
        let mut slot = self.session.write().await;

        let identity = match CertificateStore::decode(pkcs12_der, &passphrase) {
            Ok(identity) => identity,
            Err(e) => {
                *slot = None;
                warn!(error = %e, "certificate decode failed; no session active");
                return Err(e);
            }
        };

        let transport = match (self.transport_factory)(&identity, &self.config) {
            Ok(transport) => transport,
            Err(e) => {
                *slot = None;
                warn!(error = %e, "transport construction failed; no session active");
                return Err(e);
            }
        };

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            subject = identity.subject(),
            serial = identity.serial_number(),
            not_after = %identity.not_after(),
            generation,
            "certificate session installed"
        );

        *slot = Some(ActiveSession {
            identity: Arc::new(identity.clone()),
            transport,
            generation,
        });
        Ok(identity)
    }

    /// Drop the active session, returning to the no-certificate state.
    pub async fn clear_certificate(&self) {
        let mut slot = self.session.write().await;
        if slot.take().is_some() {
            info!("certificate session cleared");
        }
    }

    /// The identity of the active session, if any.
    pub async fn active_identity(&self) -> Option<Arc<CertificateIdentity>> {
        let slot = self.session.read().await;
        slot.as_ref().map(|s| Arc::clone(&s.identity))
    }

    /// Force a TLS handshake and server round trip.
    ///
    /// Success is defined by the handshake completing and *any* parseable
    /// SOAP response arriving; the service rejecting the probe's
    /// non-existent access key is expected and still counts.
    pub async fn test_connection(&self) -> OperationResult<()> {
        let (transport, generation) = self.session_for_dispatch().await?;
        let body = self.envelope.build_probe();
        let timeout = Duration::from_secs(self.config.timeouts.probe_secs);

        self.requests_dispatched.fetch_add(1, Ordering::Relaxed);
        let response = transport
            .send(&body, envelope::SOAP_ACTION_DOWNLOAD, timeout)
            .await?;
        parser::validate_soap_envelope(&response)?;

        self.confirm_generation(generation).await?;
        info!("connectivity probe succeeded");
        Ok(())
    }

    /// List documents for the query's taxpayer and period.
    ///
    /// The distribution always restarts from the zero cursor; records whose
    /// issue date falls outside the query period are dropped client-side.
    pub async fn list_documents(
        &self,
        query: &DocumentQuery,
    ) -> OperationResult<Vec<DocumentRecord>> {
        let (transport, generation) = self.session_for_dispatch().await?;
        let body = self.envelope.build_list_query(query);
        let timeout = Duration::from_secs(self.config.timeouts.query_secs);

        let response = self
            .send_with_retry(&transport, &body, envelope::SOAP_ACTION_DISTRIBUTION, timeout)
            .await?;
        let records = parser::parse_list_response(&response)?;

        let total = records.len();
        let records: Vec<DocumentRecord> = records
            .into_iter()
            .filter(|r| r.issue_date >= query.period_start() && r.issue_date <= query.period_end())
            .collect();
        if records.len() != total {
            debug!(
                dropped = total - records.len(),
                "documents outside the query period dropped"
            );
        }

        self.confirm_generation(generation).await?;
        info!(
            taxpayer = query.taxpayer_id(),
            records = records.len(),
            "listing completed"
        );
        Ok(records)
    }

    /// Fetch one document's XML by access key.
    pub async fn fetch_document(&self, access_key: &str) -> OperationResult<DocumentXml> {
        let (transport, generation) = self.session_for_dispatch().await?;
        let body = self.envelope.build_download_query(access_key)?;
        let timeout = Duration::from_secs(self.config.timeouts.query_secs);

        let response = self
            .send_with_retry(&transport, &body, envelope::SOAP_ACTION_DOWNLOAD, timeout)
            .await?;
        let mut document = parser::parse_download_response(&response)?;
        if document.access_key.is_empty() {
            document.access_key = access_key.to_string();
        }

        self.confirm_generation(generation).await?;
        debug!(access_key, bytes = document.raw_xml.len(), "document fetched");
        Ok(document)
    }

    /// Fetch several documents concurrently, bounded by
    /// `downloads.max_concurrent`. Result order is not guaranteed; each
    /// outcome is paired with its requested access key.
    pub async fn fetch_documents(
        self: &Arc<Self>,
        access_keys: Vec<String>,
    ) -> Vec<(String, OperationResult<DocumentXml>)> {
        let limit = self.config.downloads.max_concurrent.max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut set = JoinSet::new();

        for key in access_keys {
            let client = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = client.fetch_document(&key).await;
                (key, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(pair) = joined {
                results.push(pair);
            }
        }
        results
    }

    /// Total transport dispatches, including retries.
    pub fn requests_dispatched(&self) -> u64 {
        self.requests_dispatched.load(Ordering::Relaxed)
    }

    /// Results discarded because their session was superseded.
    pub fn stale_results_discarded(&self) -> u64 {
        self.stale_results_discarded.load(Ordering::Relaxed)
    }

    /// Snapshot the transport and generation for one dispatch.
    async fn session_for_dispatch(&self) -> OperationResult<(Arc<dyn Transport>, u64)> {
        let slot = self.session.read().await;
        slot.as_ref()
            .map(|s| (Arc::clone(&s.transport), s.generation))
            .ok_or(SefazError::NotAuthenticated)
    }

    /// Reject a completed dispatch whose session has been replaced, so a
    /// stale result never overwrites state belonging to the new session.
    async fn confirm_generation(&self, issued: u64) -> OperationResult<()> {
        let slot = self.session.read().await;
        match slot.as_ref() {
            Some(s) if s.generation == issued => Ok(()),
            _ => {
                self.stale_results_discarded.fetch_add(1, Ordering::Relaxed);
                debug!(generation = issued, "discarding result from superseded session");
                Err(SefazError::StaleSession)
            }
        }
    }

    /// Dispatch with bounded retry on transient transport failures.
    /// Decode and parse failures never reach this path.
    async fn send_with_retry(
        &self,
        transport: &Arc<dyn Transport>,
        body: &str,
        soap_action: &str,
        timeout: Duration,
    ) -> OperationResult<String> {
        let max_retries = self.config.retry.max_retries;
        let mut attempt: u32 = 0;
        loop {
            self.requests_dispatched.fetch_add(1, Ordering::Relaxed);
            match transport.send(body, soap_action, timeout).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    attempt += 1;
                    let backoff =
                        Duration::from_millis(self.config.retry.backoff_ms * u64::from(attempt));
                    warn!(
                        attempt,
                        max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient transport failure; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
