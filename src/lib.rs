//! Mutual-TLS SOAP client for the SEFAZ NFe web services.
//!
//! Authenticates with the operator's PKCS#12 (A1) certificate and exchanges
//! SOAP 1.2 envelopes with the tax-document service over mutual TLS.
//!
//! # Features
//!
//! - PKCS#12 decoding with identity attributes (subject, issuer, serial,
//!   validity window)
//! - Mutual-TLS HTTP transport with per-operation timeouts
//! - Pure SOAP envelope builders (connectivity probe, document listing,
//!   single-document download)
//! - Namespace-tolerant response parsing, handling inline and
//!   base64-encoded document payloads
//! - Session-owning client with generation-tagged dispatch and bounded
//!   retry
//!
//! # Example
//!
//! ```ignore
//! use sefaz_nfe::{DocumentQuery, SefazClient, SefazConfig};
//! use secrecy::SecretString;
//!
//! let client = SefazClient::new(SefazConfig::default());
//! client.set_certificate(&pfx_bytes, SecretString::new(passphrase)).await?;
//! client.test_connection().await?;
//! let records = client.list_documents(&query).await?;
//! ```

pub mod certificate;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod parser;
pub mod transport;

pub use certificate::{CertificateIdentity, CertificateStore};
pub use client::SefazClient;
pub use config::SefazConfig;
pub use envelope::{DocumentQuery, EnvelopeBuilder};
pub use error::{ErrorKind, OperationResult, SefazError};
pub use parser::{DocumentRecord, DocumentStatus, DocumentXml};
pub use transport::{MutualTlsTransport, Transport};
