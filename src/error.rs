//! Error types for the SEFAZ NFe client.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias returned by every public operation of this crate.
///
/// No public entry point panics or propagates an unhandled fault; callers
/// always receive either the value or a [`SefazError`] carrying a kind and a
/// human-readable message.
pub type OperationResult<T> = Result<T, SefazError>;

/// Errors produced by certificate decoding, transport, parsing, and the
/// client session state machine.
#[derive(Error, Debug)]
pub enum SefazError {
    #[error("certificate bundle is not valid PKCS#12 data: {0}")]
    InvalidFormat(String),

    #[error("certificate passphrase does not match the bundle; check the password and upload again")]
    WrongPassphrase,

    #[error("PKCS#12 bundle contains no certificate")]
    NoCertificateFound,

    #[error("request to {endpoint} timed out after {timeout_ms} ms; the service may be unreachable")]
    Timeout { endpoint: String, timeout_ms: u64 },

    #[error("connection to {endpoint} refused: {reason}")]
    ConnectionRefused { endpoint: String, reason: String },

    #[error("TLS handshake with {endpoint} failed: {reason}")]
    HandshakeFailed { endpoint: String, reason: String },

    #[error("service response is not well-formed XML: {0}")]
    MalformedXml(String),

    #[error("service response parsed but {missing} was not found in it")]
    UnexpectedShape { missing: String },

    #[error("invalid {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("no certificate is loaded; upload a certificate before calling the service")]
    NotAuthenticated,

    #[error("result belongs to a certificate session that has since been replaced")]
    StaleSession,
}

impl SefazError {
    /// The kind of this error, for programmatic dispatch at the
    /// application boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidFormat(_) => ErrorKind::InvalidFormat,
            Self::WrongPassphrase => ErrorKind::WrongPassphrase,
            Self::NoCertificateFound => ErrorKind::NoCertificateFound,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ConnectionRefused { .. } => ErrorKind::ConnectionRefused,
            Self::HandshakeFailed { .. } => ErrorKind::HandshakeFailed,
            Self::MalformedXml(_) => ErrorKind::MalformedXml,
            Self::UnexpectedShape { .. } => ErrorKind::UnexpectedShape,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::NotAuthenticated => ErrorKind::NotAuthenticated,
            Self::StaleSession => ErrorKind::StaleSession,
        }
    }

    /// Whether the orchestrator may retry the operation that produced this
    /// error. Only transient transport outcomes qualify; decode and parse
    /// failures are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ConnectionRefused { .. })
    }
}

/// Stable error kinds crossing the application boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Byte stream is not a PKCS#12 ASN.1 structure
    InvalidFormat,
    /// MAC verification / key decryption failed
    WrongPassphrase,
    /// No certificate bag in the bundle
    NoCertificateFound,
    /// Network round trip exceeded its deadline
    Timeout,
    /// TCP connection could not be established
    ConnectionRefused,
    /// TLS negotiation failed
    HandshakeFailed,
    /// Response body did not parse as XML
    MalformedXml,
    /// Response parsed but the expected result element is absent
    UnexpectedShape,
    /// Caller-supplied query or access key is malformed
    InvalidInput,
    /// Operation attempted with no active certificate session
    NotAuthenticated,
    /// Result from a superseded session, to be discarded by the caller
    StaleSession,
}

impl ErrorKind {
    /// Get the string code for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidFormat => "INVALID_FORMAT",
            Self::WrongPassphrase => "WRONG_PASSPHRASE",
            Self::NoCertificateFound => "NO_CERTIFICATE_FOUND",
            Self::Timeout => "TIMEOUT",
            Self::ConnectionRefused => "CONNECTION_REFUSED",
            Self::HandshakeFailed => "HANDSHAKE_FAILED",
            Self::MalformedXml => "MALFORMED_XML",
            Self::UnexpectedShape => "UNEXPECTED_SHAPE",
            Self::InvalidInput => "INVALID_INPUT",
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::StaleSession => "STALE_SESSION",
        }
    }
}
