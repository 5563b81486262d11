pub mod certificate;
pub mod error;
pub mod thumbprint;
pub mod validator;

pub use certificate::{
    export_pkcs12, export_public_pem, load_pkcs12, CertificateIdentity, CertificateIssuer,
    DistinguishedName, Pkcs12Bundle, ValidityPeriod, MIN_PFX_PASSWORD_LEN,
};
pub use error::{PkiError, Result};
pub use thumbprint::{Thumbprint, ThumbprintAlgorithm};
pub use validator::{validate, CertificateValidator, RejectReason, TrustPolicy, ValidationDecision};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;
use x509_parser::certificate::X509Certificate;

/// Decode a DER certificate. Trailing bytes after the certificate are rejected so the
/// thumbprint always covers exactly what was parsed.
pub fn parse_certificate(raw: &[u8]) -> Result<X509Certificate<'_>> {
    let (rest, cert) = x509_parser::parse_x509_certificate(raw)
        .map_err(|e| PkiError::CertificateDecode(e.to_string()))?;

    if !rest.is_empty() {
        return Err(PkiError::CertificateDecode(format!(
            "{} trailing bytes after certificate",
            rest.len()
        )));
    }

    Ok(cert)
}

/// Read either a PEM `CERTIFICATE` block or raw DER
pub fn certificate_der_from_file_contents(contents: &[u8]) -> Result<Vec<u8>> {
    if contents.trim_ascii_start().starts_with(b"-----BEGIN") {
        let block = pem::parse(contents)
            .map_err(|e| PkiError::CertificateDecode(format!("invalid PEM: {}", e)))?;
        if block.tag() != "CERTIFICATE" {
            return Err(PkiError::CertificateDecode(format!(
                "expected a CERTIFICATE block, found {}",
                block.tag()
            )));
        }
        return Ok(block.into_contents());
    }
    Ok(contents.to_vec())
}

/// Decode a certificate forwarded by an edge proxy in a request header
///
/// Accepts base64 DER (as sent in `X-ARR-ClientCert`) or a URL-encoded PEM block.
/// Returns `None` when nothing usable was sent; the caller treats that as no certificate.
/// Only trust this header when the edge strips it from untrusted clients.
pub fn decode_forwarded_certificate(header_value: &str) -> Option<Vec<u8>> {
    let value = header_value.trim();
    if value.is_empty() {
        return None;
    }

    if value.starts_with("-----BEGIN") || value.starts_with("%2D") || value.starts_with("%2d")
    {
        let text = urlencoding::decode(value).ok()?;
        return match pem::parse(text.as_bytes()) {
            Ok(block) if block.tag() == "CERTIFICATE" => Some(block.into_contents()),
            Ok(block) => {
                debug!(tag = block.tag(), "Forwarded PEM is not a certificate");
                None
            }
            Err(e) => {
                debug!(error = %e, "Forwarded PEM could not be decoded");
                None
            }
        };
    }

    match STANDARD.decode(value) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            debug!(error = %e, "Forwarded certificate is not valid base64");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn sample_der() -> Vec<u8> {
        let name = DistinguishedName::new("header-client").unwrap();
        let period = ValidityPeriod::years_from(OffsetDateTime::now_utc(), 1).unwrap();
        CertificateIssuer::new()
            .issue_self_signed(&name, &period, "header-client")
            .unwrap()
            .certificate_der()
            .to_vec()
    }

    #[test]
    fn test_decode_base64_header() {
        let der = sample_der();
        let header = STANDARD.encode(&der);
        assert_eq!(decode_forwarded_certificate(&header), Some(der));
    }

    #[test]
    fn test_decode_url_encoded_pem_header() {
        let der = sample_der();
        let pem_text = pem::encode(&pem::Pem::new("CERTIFICATE", der.clone()));
        let header = urlencoding::encode(&pem_text).into_owned();
        assert_eq!(decode_forwarded_certificate(&header), Some(der));
    }

    #[test]
    fn test_decode_rejects_garbage_header() {
        assert_eq!(decode_forwarded_certificate(""), None);
        assert_eq!(decode_forwarded_certificate("   "), None);
        assert_eq!(decode_forwarded_certificate("!!not base64!!"), None);
    }

    #[test]
    fn test_parse_rejects_trailing_bytes() {
        let mut der = sample_der();
        assert!(parse_certificate(&der).is_ok());
        der.push(0);
        assert!(matches!(parse_certificate(&der), Err(PkiError::CertificateDecode(_))));
    }

    #[test]
    fn test_file_contents_accepts_pem_and_der() {
        let der = sample_der();
        let pem_text = pem::encode(&pem::Pem::new("CERTIFICATE", der.clone()));

        assert_eq!(certificate_der_from_file_contents(pem_text.as_bytes()).unwrap(), der);
        assert_eq!(certificate_der_from_file_contents(&der).unwrap(), der);

        let key_pem = pem::encode(&pem::Pem::new("PRIVATE KEY", vec![1, 2, 3]));
        assert!(certificate_der_from_file_contents(key_pem.as_bytes()).is_err());
    }
}
