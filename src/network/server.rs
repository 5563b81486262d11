use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::rand::{SecureRandom, SystemRandom};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::pki::{decode_forwarded_certificate, CertificateValidator, ValidationDecision};

/// Route of the certificate-protected endpoint
pub const RANDOM_STRING_ROUTE: &str = "/api/random-string";

/// Response header carrying the machine-readable rejection kind
pub const REJECT_REASON_HEADER: &str = "x-reject-reason";

const RANDOM_PAYLOAD_LEN: usize = 100;

#[derive(Clone)]
struct AppState {
    validator: CertificateValidator,
    certificate_header: HeaderName,
    rng: SystemRandom,
}

/// HTTP service gated by client certificate validation
///
/// The certificate is read from a header set by the edge that terminated TLS, so the
/// edge must strip that header from untrusted clients.
pub struct CertAuthServer {
    listen_address: SocketAddr,
    state: AppState,
}

impl CertAuthServer {
    pub fn new(
        listen_address: SocketAddr,
        validator: CertificateValidator,
        certificate_header: &str,
    ) -> Result<Self> {
        let certificate_header = HeaderName::try_from(certificate_header)
            .context("Invalid certificate header name")?;

        Ok(Self {
            listen_address,
            state: AppState {
                validator,
                certificate_header,
                rng: SystemRandom::new(),
            },
        })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(RANDOM_STRING_ROUTE, get(random_string))
            .with_state(self.state.clone())
    }

    /// Start the server
    pub async fn start(self) -> Result<()> {
        let listener = TcpListener::bind(self.listen_address)
            .await
            .with_context(|| format!("Failed to bind {}", self.listen_address))?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local_address = listener.local_addr().context("Failed to read listen address")?;

        info!("Starting HTTP server on {}", local_address);
        warn!(
            header = %self.state.certificate_header,
            "Client certificates are taken from a forwarded header; the edge proxy must strip it from untrusted requests"
        );

        axum::serve(listener, self.router())
            .await
            .context("Server error")?;

        Ok(())
    }
}

async fn random_string(State(state): State<AppState>, headers: HeaderMap) -> Response {
    info!("Random string requested");

    let raw_certificate = headers
        .get(&state.certificate_header)
        .and_then(|value| value.to_str().ok())
        .and_then(decode_forwarded_certificate);

    match state.validator.validate_now(raw_certificate.as_deref()) {
        ValidationDecision::Accept => match encoded_random_string(&state.rng) {
            Ok(payload) => (StatusCode::OK, payload).into_response(),
            Err(e) => {
                error!("Failed to generate random payload: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        ValidationDecision::Reject(reason) => (
            StatusCode::BAD_REQUEST,
            [(REJECT_REASON_HEADER, HeaderValue::from_static(reason.as_str()))],
            reason.message(),
        )
            .into_response(),
    }
}

fn encoded_random_string(rng: &SystemRandom) -> Result<String> {
    let mut bytes = [0u8; RANDOM_PAYLOAD_LEN];
    rng.fill(&mut bytes)
        .map_err(|_| anyhow::anyhow!("System random source unavailable"))?;
    Ok(STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CERTIFICATE_HEADER;
    use crate::pki::{
        CertificateIdentity, CertificateIssuer, DistinguishedName, TrustPolicy, ValidityPeriod,
    };
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use time::{Duration, OffsetDateTime};
    use tower::ServiceExt;

    fn issue(start: OffsetDateTime, years: u16) -> CertificateIdentity {
        let name = DistinguishedName::new("functionsCertAuth").unwrap();
        let period = ValidityPeriod::years_from(start, years).unwrap();
        CertificateIssuer::new()
            .issue_self_signed(&name, &period, "FunctionCertificate")
            .unwrap()
    }

    fn server_trusting(identity: &CertificateIdentity) -> CertAuthServer {
        let validator =
            CertificateValidator::new(TrustPolicy::single(identity.thumbprint().clone()));
        CertAuthServer::new("127.0.0.1:0".parse().unwrap(), validator, DEFAULT_CERTIFICATE_HEADER)
            .unwrap()
    }

    fn request(certificate: Option<&[u8]>) -> Request<Body> {
        let mut builder = Request::builder().uri(RANDOM_STRING_ROUTE);
        if let Some(der) = certificate {
            builder = builder.header(DEFAULT_CERTIFICATE_HEADER, STANDARD.encode(der));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_trusted_certificate_gets_payload() {
        let identity = issue(OffsetDateTime::now_utc() - Duration::days(1), 10);
        let app = server_trusting(&identity).router();

        let response = app.oneshot(request(Some(identity.certificate_der()))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let payload = STANDARD.decode(body_text(response).await).unwrap();
        assert_eq!(payload.len(), RANDOM_PAYLOAD_LEN);
    }

    #[tokio::test]
    async fn test_missing_header_is_bad_request() {
        let identity = issue(OffsetDateTime::now_utc() - Duration::days(1), 10);
        let app = server_trusting(&identity).router();

        let response = app.oneshot(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[REJECT_REASON_HEADER], "missing-certificate");
    }

    #[tokio::test]
    async fn test_untrusted_certificate_is_bad_request() {
        let trusted = issue(OffsetDateTime::now_utc() - Duration::days(1), 10);
        let intruder = issue(OffsetDateTime::now_utc() - Duration::days(1), 10);
        let app = server_trusting(&trusted).router();

        let response = app.oneshot(request(Some(intruder.certificate_der()))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[REJECT_REASON_HEADER], "thumbprint-mismatch");
        assert_eq!(body_text(response).await, "A valid client certificate is not used");
    }

    #[tokio::test]
    async fn test_expired_certificate_is_bad_request() {
        let identity = issue(OffsetDateTime::now_utc() - Duration::days(800), 1);
        let app = server_trusting(&identity).router();

        let response = app.oneshot(request(Some(identity.certificate_der()))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[REJECT_REASON_HEADER], "expired");
    }
}
