use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{error, info, warn};

use mtls_gate::config::Config;
use mtls_gate::network::{CertAuthClient, CertAuthServer};
use mtls_gate::pki::{
    certificate_der_from_file_contents, export_pkcs12, export_public_pem, load_pkcs12, validate,
    CertificateIssuer, CertificateValidator, Thumbprint, ThumbprintAlgorithm, ValidationDecision,
    ValidityPeriod,
};

const PASSWORD_ENV: &str = "MTLS_GATE_PFX_PASSWORD";

/// Get system config file path
fn get_system_config_path() -> PathBuf {
    PathBuf::from("/etc/mtls-gate/config.toml")
}

/// Get development config file path (fallback)
fn get_dev_config_path() -> PathBuf {
    PathBuf::from("config.toml")
}

/// Discover config file with priority order
fn discover_config(cli_path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = cli_path {
        warn!("Using custom config path: {}", path.display());
        return Some(path);
    }

    let system_config = get_system_config_path();
    if system_config.exists() {
        return Some(system_config);
    }

    let dev_config = get_dev_config_path();
    if dev_config.exists() {
        warn!("Using development config: {}", dev_config.display());
        return Some(dev_config);
    }

    None
}

fn load_config(cli_path: Option<PathBuf>) -> Result<Config> {
    let path = discover_config(cli_path)
        .context("No config file found. Run 'mtls-gate init-config' first")?;
    let config = Config::from_file(&path)?;
    config.validate()?;
    Ok(config)
}

#[derive(Parser)]
#[command(name = "mtls-gate")]
#[command(about = "Self-signed client certificates and thumbprint-based mutual TLS validation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue a self-signed certificate and export it as PKCS#12 and PEM
    GenCert {
        /// Subject common name (overrides config)
        #[arg(long)]
        common_name: Option<String>,

        /// Subject alternative DNS name (overrides config)
        #[arg(long)]
        dns_name: Option<String>,

        /// Validity in years from now (overrides config)
        #[arg(long)]
        years: Option<u16>,

        /// Password protecting the PKCS#12 bundle
        #[arg(short, long, env = PASSWORD_ENV, hide_env_values = true)]
        password: String,

        /// Output PKCS#12 file (overrides config)
        #[arg(long)]
        pfx_out: Option<PathBuf>,

        /// Output PEM file (overrides config)
        #[arg(long)]
        pem_out: Option<PathBuf>,
    },

    /// Print the thumbprint of a PEM or DER certificate
    Thumbprint {
        /// Certificate file
        #[arg(long)]
        cert: PathBuf,

        /// Digest algorithm
        #[arg(long, default_value = "sha256", value_parser = parse_algorithm)]
        algorithm: ThumbprintAlgorithm,
    },

    /// Validate a PEM or DER certificate against the configured trust policy
    Validate {
        /// Certificate file
        #[arg(long)]
        cert: PathBuf,
    },

    /// Open a PKCS#12 bundle and print its thumbprint
    InspectPfx {
        /// PKCS#12 file
        #[arg(long)]
        pfx: PathBuf,

        /// Bundle password
        #[arg(short, long, env = PASSWORD_ENV, hide_env_values = true)]
        password: String,
    },

    /// Start the certificate-protected HTTP service
    Serve,

    /// Call the protected endpoint presenting the client bundle
    Call {
        /// Endpoint URL (overrides config)
        #[arg(long)]
        url: Option<String>,

        /// Bundle password
        #[arg(short, long, env = PASSWORD_ENV, hide_env_values = true)]
        password: String,
    },

    /// Write a default configuration file
    InitConfig {
        /// Destination path
        #[arg(long, default_value = "config.toml")]
        path: PathBuf,
    },

    /// Show version information
    Version,
}

fn parse_algorithm(value: &str) -> std::result::Result<ThumbprintAlgorithm, String> {
    match value.to_ascii_lowercase().as_str() {
        "sha1" => Ok(ThumbprintAlgorithm::Sha1),
        "sha256" => Ok(ThumbprintAlgorithm::Sha256),
        other => Err(format!("unknown thumbprint algorithm '{}'", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match cli.command {
        Some(Commands::GenCert {
            common_name,
            dns_name,
            years,
            password,
            pfx_out,
            pem_out,
        }) => {
            let mut config = match discover_config(cli.config) {
                Some(path) => Config::from_file(&path)?,
                None => Config::default(),
            };
            if let Some(common_name) = common_name {
                config.issuer.common_name = common_name;
                config.issuer.friendly_name = None;
            }
            if let Some(dns_name) = dns_name {
                config.issuer.dns_name = dns_name;
            }
            if let Some(years) = years {
                config.issuer.validity_years = years;
            }
            if let Some(pfx_out) = pfx_out {
                config.issuer.pfx_path = pfx_out;
            }
            if let Some(pem_out) = pem_out {
                config.issuer.pem_path = pem_out;
            }
            config.validate()?;

            generate_certificate(&config, &password).await?;
        }

        Some(Commands::Thumbprint { cert, algorithm }) => {
            let der = read_certificate(&cert).await?;
            println!("{}", Thumbprint::compute(algorithm, &der));
        }

        Some(Commands::Validate { cert }) => {
            let config = load_config(cli.config)?;
            let policy = config.trust_policy()?;
            let der = read_certificate(&cert).await?;

            match validate(Some(&der), &policy, OffsetDateTime::now_utc()) {
                ValidationDecision::Accept => println!("ACCEPT"),
                ValidationDecision::Reject(reason) => {
                    println!("REJECT({}): {}", reason, reason.message());
                    std::process::exit(2);
                }
            }
        }

        Some(Commands::InspectPfx { pfx, password }) => {
            let bytes = tokio::fs::read(&pfx)
                .await
                .with_context(|| format!("Failed to read {}", pfx.display()))?;
            let bundle = load_pkcs12(&bytes, &password)
                .with_context(|| format!("Failed to open {}", pfx.display()))?;

            println!("SHA-256 thumbprint: {}", bundle.thumbprint());
            println!(
                "SHA-1 thumbprint:   {}",
                bundle.thumbprint_with(ThumbprintAlgorithm::Sha1)
            );
        }

        Some(Commands::Serve) => {
            let config = load_config(cli.config)?;
            run_server(config).await?;
        }

        Some(Commands::Call { url, password }) => {
            let config = load_config(cli.config)?;
            let url = url.unwrap_or_else(|| config.client.server_url.clone());
            call_api(&config, &url, &password).await?;
        }

        Some(Commands::InitConfig { path }) => {
            if path.exists() {
                anyhow::bail!("{} already exists", path.display());
            }
            Config::create_default(&path)?;
            info!("Default configuration written to {}", path.display());
        }

        Some(Commands::Version) => {
            show_version();
        }

        None => {
            error!("No command provided. Use --help for usage information.");
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn read_certificate(path: &Path) -> Result<Vec<u8>> {
    let contents = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(certificate_der_from_file_contents(&contents)?)
}

async fn generate_certificate(config: &Config, password: &str) -> Result<()> {
    let issuer_config = &config.issuer;
    info!(
        "Generating certificate for '{}' valid for {} years",
        issuer_config.common_name, issuer_config.validity_years
    );

    let name = config.distinguished_name()?;
    let validity =
        ValidityPeriod::years_from(OffsetDateTime::now_utc(), issuer_config.validity_years)?;

    let mut identity = CertificateIssuer::new()
        .issue_self_signed(&name, &validity, &issuer_config.dns_name)
        .context("Certificate issuance failed")?;
    if let Some(friendly_name) = &issuer_config.friendly_name {
        identity = identity.with_friendly_name(friendly_name.clone());
    }

    // Export both artifacts before touching the filesystem
    let pfx = export_pkcs12(&identity, password)?;
    let pem = export_public_pem(&identity);

    write_artifacts(&issuer_config.pfx_path, &pfx, &issuer_config.pem_path, pem.as_bytes()).await?;
    info!("PKCS#12 bundle written to {}", issuer_config.pfx_path.display());
    info!("Public certificate written to {}", issuer_config.pem_path.display());

    println!("SHA-256 thumbprint: {}", identity.thumbprint());
    println!(
        "SHA-1 thumbprint:   {}",
        identity.thumbprint_with(ThumbprintAlgorithm::Sha1)
    );
    println!("Add the thumbprint to [validator].trusted_thumbprints to trust this client.");

    Ok(())
}

/// Write the bundle and the public certificate. If the second write fails, the
/// bundle is removed again so no half-issued identity is left on disk.
async fn write_artifacts(pfx_path: &Path, pfx: &[u8], pem_path: &Path, pem: &[u8]) -> Result<()> {
    tokio::fs::write(pfx_path, pfx)
        .await
        .with_context(|| format!("Failed to write {}", pfx_path.display()))?;

    if let Err(e) = tokio::fs::write(pem_path, pem).await {
        if let Err(cleanup) = tokio::fs::remove_file(pfx_path).await {
            warn!("Failed to remove {}: {}", pfx_path.display(), cleanup);
        }
        return Err(e).with_context(|| format!("Failed to write {}", pem_path.display()));
    }

    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    let policy = config.trust_policy()?;
    if policy.is_empty() {
        warn!("Trust policy is empty; every client certificate will be rejected");
    }

    let validator = CertificateValidator::new(policy);
    let server = CertAuthServer::new(
        config.server.listen_address,
        validator,
        &config.validator.certificate_header,
    )?;

    server.start().await
}

async fn call_api(config: &Config, url: &str, password: &str) -> Result<()> {
    let pfx_path = &config.client.pfx_path;
    let bytes = tokio::fs::read(pfx_path)
        .await
        .with_context(|| format!("Failed to read {}", pfx_path.display()))?;
    let bundle = load_pkcs12(&bytes, password)
        .with_context(|| format!("Failed to open {}", pfx_path.display()))?;

    let client =
        CertAuthClient::new(&bundle, &config.client, &config.validator.certificate_header)?;
    let result = client.fetch(url).await?;

    println!("{}", result);
    Ok(())
}

fn show_version() {
    println!("mtls-gate {}", env!("CARGO_PKG_VERSION"));

    for (i, path) in [get_system_config_path(), get_dev_config_path()].iter().enumerate() {
        let status = if path.exists() { "found" } else { "missing" };
        println!("  {}. Config: {} ({})", i + 1, path.display(), status);
    }
}
