//! Configuration types for the SEFAZ NFe client.

use serde::{Deserialize, Serialize};

/// Main configuration for the SEFAZ client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SefazConfig {
    /// Config version
    pub version: String,

    /// Service endpoint configuration
    pub endpoint: EndpointConfig,

    /// TLS policy
    pub tls: TlsConfig,

    /// Per-operation network timeouts
    pub timeouts: TimeoutConfig,

    /// Retry policy for transient transport failures
    pub retry: RetryConfig,

    /// Batch document download limits
    pub downloads: DownloadConfig,
}

impl Default for SefazConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            endpoint: EndpointConfig::default(),
            tls: TlsConfig::default(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            downloads: DownloadConfig::default(),
        }
    }
}

/// Service endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// SEFAZ web service URL
    pub url: String,

    /// Target environment (`tpAmb` in the protocol)
    pub environment: Environment,

    /// IBGE code of the authoring state (`cUFAutor`)
    pub uf_code: u8,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: "https://nfe.fazenda.sp.gov.br/ws/nfedownload.asmx".to_string(),
            environment: Environment::Production,
            uf_code: 35, // São Paulo
        }
    }
}

/// SEFAZ environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Production (`tpAmb` 1)
    Production,
    /// Homologation / test (`tpAmb` 2)
    Homologation,
}

impl Environment {
    /// Protocol code placed in the `tpAmb` element.
    pub fn code(&self) -> u8 {
        match self {
            Self::Production => 1,
            Self::Homologation => 2,
        }
    }
}

/// TLS policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Accept a server certificate chain the default trust store rejects.
    ///
    /// Disabling verification defeats protection against a spoofed
    /// endpoint; leave this off unless the government endpoint's chain is
    /// missing from the local trust store and the URL is pinned. The
    /// transport logs a warning whenever this is enabled.
    pub accept_invalid_server_certs: bool,

    /// TCP connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            accept_invalid_server_certs: false,
            connect_timeout_secs: 15,
        }
    }
}

/// Per-operation timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connectivity probe timeout in seconds
    pub probe_secs: u64,

    /// Listing and download timeout in seconds
    pub query_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe_secs: 10,
            query_secs: 30,
        }
    }
}

/// Retry policy for listing and download operations.
///
/// Applies only to timeouts and connection refusals; certificate decoding
/// and response parsing are never retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum retries after the first attempt
    pub max_retries: u32,

    /// Linear backoff step in milliseconds (attempt n sleeps n * step)
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 500,
        }
    }
}

/// Batch download limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Maximum concurrent document downloads
    pub max_concurrent: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}
