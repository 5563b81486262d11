use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, Identity};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::pki::Pkcs12Bundle;

/// Console client that presents a client certificate to the protected endpoint
pub struct CertAuthClient {
    http: Client,
    forwarded_certificate: Option<(String, String)>,
}

impl CertAuthClient {
    /// Create a client presenting `bundle` during the TLS handshake
    ///
    /// When `forward_certificate_header` is set, the certificate is also sent in
    /// `certificate_header`, which is how a local server without TLS termination sees it.
    pub fn new(
        bundle: &Pkcs12Bundle,
        config: &ClientConfig,
        certificate_header: &str,
    ) -> Result<Self> {
        let identity = Identity::from_pem(bundle.identity_pem().as_bytes())
            .context("Failed to load client identity")?;

        let http = Client::builder()
            .identity(identity)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        let forwarded_certificate = config.forward_certificate_header.then(|| {
            (
                certificate_header.to_string(),
                STANDARD.encode(bundle.certificate_der()),
            )
        });

        debug!(thumbprint = %bundle.thumbprint(), "Client identity loaded");

        Ok(Self {
            http,
            forwarded_certificate,
        })
    }

    /// Call the endpoint once. Authentication failures are not retried.
    pub async fn fetch(&self, url: &str) -> Result<String> {
        info!("Calling {}", url);

        let mut request = self.http.get(url);
        if let Some((header, value)) = &self.forwarded_certificate {
            request = request.header(header.as_str(), value.as_str());
        }

        let response = request.send().await.context("Request failed")?;
        let status = response.status();
        let body = response.text().await.context("Failed to read response body")?;

        if !status.is_success() {
            anyhow::bail!("Status code: {}, Error: {}", status, body);
        }

        Ok(body)
    }
}
