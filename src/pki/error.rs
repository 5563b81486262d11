use thiserror::Error;

/// Result type for certificate issuance, export and parsing
pub type Result<T> = std::result::Result<T, PkiError>;

/// Errors raised by the certificate layer
///
/// Validation rejections are not errors; see [`super::ValidationDecision`].
#[derive(Debug, Error)]
pub enum PkiError {
    /// The random source or key encoding failed. Fatal for the issuance run.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Exporting a bundle failed, usually because of the password policy
    #[error("export failed: {0}")]
    Export(String),

    /// The PKCS#12 integrity check failed for the supplied password
    #[error("invalid password for PKCS#12 bundle")]
    InvalidPassword,

    /// Bytes could not be decoded as a certificate or bundle
    #[error("certificate decode failed: {0}")]
    CertificateDecode(String),

    #[error("invalid distinguished name: {0}")]
    InvalidDistinguishedName(String),

    #[error("invalid validity period: {0}")]
    InvalidValidityPeriod(String),

    #[error("invalid thumbprint: {0}")]
    InvalidThumbprint(String),

    /// Certificate assembly or signing failed
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),
}
