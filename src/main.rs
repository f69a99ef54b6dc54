//! SEFAZ NFe client binary.
//!
//! Run with: `sefaz-nfe --certificate cert.pfx probe`
//!
//! The certificate passphrase is read from an environment variable (default
//! `SEFAZ_CERT_PASSPHRASE`), never from the command line, so it stays out
//! of shell history and process listings.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use sefaz_nfe::{DocumentQuery, SefazClient, SefazConfig};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Query and download NFe documents from the SEFAZ web service using a
/// PKCS#12 client certificate over mutual TLS.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to the PKCS#12 certificate (.pfx/.p12, raw DER or base64 text)
    #[arg(short = 'C', long)]
    certificate: PathBuf,

    /// Environment variable holding the certificate passphrase
    #[arg(long, default_value = "SEFAZ_CERT_PASSPHRASE")]
    passphrase_env: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Test connectivity: force a TLS handshake and a service round trip
    Probe,
    /// List documents for a taxpayer and period
    List {
        /// Taxpayer CNPJ (formatted or digits-only)
        #[arg(long)]
        cnpj: String,
        /// Period start (YYYY-MM-DD)
        #[arg(long)]
        from: NaiveDate,
        /// Period end (YYYY-MM-DD)
        #[arg(long)]
        to: NaiveDate,
    },
    /// Download one document's XML by its 44-digit access key
    Fetch {
        /// Access key (chave de acesso)
        access_key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = if args.config.exists() {
        let content = tokio::fs::read_to_string(&args.config)
            .await
            .context("Failed to read config file")?;
        serde_yaml::from_str(&content).context("Failed to parse config file")?
    } else {
        info!("Config file not found, using defaults");
        SefazConfig::default()
    };

    let passphrase = std::env::var(&args.passphrase_env).with_context(|| {
        format!(
            "certificate passphrase not found in environment variable {}",
            args.passphrase_env
        )
    })?;
    let passphrase = SecretString::new(passphrase);

    let raw = tokio::fs::read(&args.certificate)
        .await
        .with_context(|| format!("Failed to read certificate {}", args.certificate.display()))?;
    let pkcs12_der = certificate_bytes(&raw);

    let client = SefazClient::new(config);
    let identity = client
        .set_certificate(&pkcs12_der, passphrase)
        .await
        .context("Certificate could not be loaded")?;

    info!(
        subject = identity.subject(),
        not_after = %identity.not_after(),
        days_until_expiry = identity.days_until_expiry(Utc::now()),
        "certificate loaded"
    );
    if identity.is_expired(Utc::now()) {
        anyhow::bail!("certificate expired on {}", identity.not_after());
    }

    match args.command {
        Command::Probe => {
            client
                .test_connection()
                .await
                .context("Connectivity probe failed")?;
            println!("connectivity confirmed: handshake and service round trip completed");
        }
        Command::List { cnpj, from, to } => {
            let query = DocumentQuery::new(&cnpj, from, to).context("Invalid query")?;
            let records = client
                .list_documents(&query)
                .await
                .context("Listing failed")?;
            if records.is_empty() {
                println!("no documents found in the period");
            }
            for record in records {
                println!(
                    "{}\t{}\t{}/{}\t{}\t{:?}\t{}",
                    record.access_key,
                    record.issue_date,
                    record.series,
                    record.number,
                    record.amount,
                    record.status,
                    record.counterparty_name,
                );
            }
        }
        Command::Fetch { access_key } => {
            let document = client
                .fetch_document(&access_key)
                .await
                .context("Download failed")?;
            println!("{}", document.raw_xml);
        }
    }

    Ok(())
}

/// Accept a raw DER bundle or a base64 text file (the certificate often
/// crosses application boundaries base64-encoded).
fn certificate_bytes(raw: &[u8]) -> Vec<u8> {
    // DER always opens with an ASN.1 SEQUENCE tag.
    if raw.first() == Some(&0x30) {
        return raw.to_vec();
    }
    let compact: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|b| !b" \t\r\n".contains(b))
        .collect();
    match STANDARD.decode(&compact) {
        Ok(der) => der,
        Err(_) => raw.to_vec(),
    }
}
