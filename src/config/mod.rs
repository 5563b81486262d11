use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::pki::{DistinguishedName, ThumbprintAlgorithm, TrustPolicy};

/// Header the hosting edge uses to forward the client certificate
pub const DEFAULT_CERTIFICATE_HEADER: &str = "X-ARR-ClientCert";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Certificate issuance settings
    pub issuer: IssuerConfig,

    /// Request-time validation settings
    pub validator: ValidatorConfig,

    /// HTTP service settings
    pub server: ServerConfig,

    /// Console client settings
    #[serde(default)]
    pub client: ClientConfig,
}

/// Certificate issuance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerConfig {
    /// Subject common name
    pub common_name: String,

    /// Two-letter country code
    #[serde(default)]
    pub country: Option<String>,

    /// Organization name
    #[serde(default)]
    pub organization: Option<String>,

    /// DNS name placed in the subject alternative name extension
    pub dns_name: String,

    /// Label stored in the PKCS#12 bundle
    #[serde(default)]
    pub friendly_name: Option<String>,

    /// Certificate lifetime in years, starting at issuance
    pub validity_years: u16,

    /// Output path of the PKCS#12 bundle
    pub pfx_path: PathBuf,

    /// Output path of the public certificate
    pub pem_path: PathBuf,
}

/// Validator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Digest used for the thumbprints below
    #[serde(default)]
    pub thumbprint_algorithm: ThumbprintAlgorithm,

    /// Hex thumbprints of trusted client certificates
    #[serde(default)]
    pub trusted_thumbprints: Vec<String>,

    /// Header carrying the forwarded client certificate.
    /// Only safe behind an edge that strips this header from untrusted clients.
    #[serde(default = "default_certificate_header")]
    pub certificate_header: String,
}

/// HTTP service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the HTTP service
    pub listen_address: SocketAddr,
}

/// Console client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// URL of the protected endpoint
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// PKCS#12 bundle presented by the client
    #[serde(default = "default_client_pfx_path")]
    pub pfx_path: PathBuf,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Also send the certificate in the forwarded header. Needed whenever the server
    /// sits behind plain HTTP, as the bundled local server does.
    #[serde(default = "default_forward_certificate_header")]
    pub forward_certificate_header: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            pfx_path: default_client_pfx_path(),
            timeout_secs: default_timeout_secs(),
            forward_certificate_header: default_forward_certificate_header(),
        }
    }
}

fn default_certificate_header() -> String { DEFAULT_CERTIFICATE_HEADER.to_string() }
fn default_server_url() -> String { "http://127.0.0.1:7071/api/random-string".to_string() }
fn default_client_pfx_path() -> PathBuf { PathBuf::from("functionsCertAuth.pfx") }
fn default_timeout_secs() -> u64 { 30 }
fn default_forward_certificate_header() -> bool { true } // default URL is the plain-http local server

impl Default for Config {
    fn default() -> Self {
        Self {
            issuer: IssuerConfig {
                common_name: "functionsCertAuth".to_string(),
                country: Some("BR".to_string()),
                organization: Some("it".to_string()),
                dns_name: "FunctionCertificate".to_string(),
                friendly_name: Some("functionsCertAuth".to_string()),
                validity_years: 10,
                pfx_path: PathBuf::from("functionsCertAuth.pfx"),
                pem_path: PathBuf::from("functionsCertAuth.pem"),
            },
            validator: ValidatorConfig {
                thumbprint_algorithm: ThumbprintAlgorithm::Sha256,
                trusted_thumbprints: Vec::new(), // filled in after gen-cert
                certificate_header: default_certificate_header(),
            },
            server: ServerConfig {
                listen_address: "127.0.0.1:7071".parse().unwrap(),
            },
            client: ClientConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path.as_ref(), content)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Create a default config file
    pub fn create_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Self::default();
        config.to_file(path)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.distinguished_name()?;

        if self.issuer.dns_name.trim().is_empty() {
            anyhow::bail!("Issuer DNS name cannot be empty");
        }

        if self.issuer.validity_years == 0 {
            anyhow::bail!("Certificate validity must be at least one year");
        }

        self.trust_policy()?;

        axum::http::HeaderName::try_from(self.validator.certificate_header.as_str())
            .context("Invalid certificate header name")?;

        if self.client.timeout_secs == 0 {
            anyhow::bail!("Client timeout must be greater than 0");
        }

        Ok(())
    }

    /// Distinguished name described by the issuer section
    pub fn distinguished_name(&self) -> Result<DistinguishedName> {
        let mut name = DistinguishedName::new(self.issuer.common_name.clone())?;

        if let Some(country) = &self.issuer.country {
            name = name.with_country(country)?;
        }

        if let Some(organization) = &self.issuer.organization {
            name = name.with_organization(organization.clone());
        }

        Ok(name)
    }

    /// Trust policy described by the validator section
    pub fn trust_policy(&self) -> Result<TrustPolicy> {
        let policy = TrustPolicy::new(
            self.validator.thumbprint_algorithm,
            &self.validator.trusted_thumbprints,
        )
        .context("Invalid trusted thumbprint in config")?;

        Ok(policy)
    }
}
