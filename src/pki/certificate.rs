use rand_core::{OsRng, TryCryptoRng};
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use std::fmt;
use time::{Month, OffsetDateTime, UtcOffset};
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::error::{PkiError, Result};
use super::thumbprint::{Thumbprint, ThumbprintAlgorithm};

/// Shortest password accepted when exporting a PKCS#12 bundle
pub const MIN_PFX_PASSWORD_LEN: usize = 8;

/// PKCS#8 v1 header for an Ed25519 private key, followed by the 32-byte seed (RFC 8410)
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04,
    0x20,
];

/// Subject identity bound into a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistinguishedName {
    common_name: String,
    country: Option<String>,
    organization: Option<String>,
}

impl DistinguishedName {
    /// Create a name with only a common name; it must not be blank
    pub fn new(common_name: impl Into<String>) -> Result<Self> {
        let common_name = common_name.into();
        if common_name.trim().is_empty() {
            return Err(PkiError::InvalidDistinguishedName(
                "common name cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            common_name,
            country: None,
            organization: None,
        })
    }

    /// Two-letter country code, stored upper-case
    pub fn with_country(mut self, country: &str) -> Result<Self> {
        if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(PkiError::InvalidDistinguishedName(format!(
                "country must be a two-letter code, got {:?}",
                country
            )));
        }
        self.country = Some(country.to_ascii_uppercase());
        Ok(self)
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        let organization = organization.into();
        self.organization = (!organization.trim().is_empty()).then_some(organization);
        self
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn country(&self) -> Option<&str> {
        self.country.as_deref()
    }

    pub fn organization(&self) -> Option<&str> {
        self.organization.as_deref()
    }

    fn to_rcgen(&self) -> rcgen::DistinguishedName {
        let mut name = rcgen::DistinguishedName::new();
        name.push(DnType::CommonName, self.common_name.as_str());
        if let Some(country) = &self.country {
            name.push(DnType::CountryName, country.as_str());
        }
        if let Some(organization) = &self.organization {
            name.push(DnType::OrganizationName, organization.as_str());
        }
        name
    }
}

/// UTC trust window of a certificate, at the one-second resolution X.509 encodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityPeriod {
    valid_from: OffsetDateTime,
    valid_to: OffsetDateTime,
}

impl ValidityPeriod {
    pub fn new(valid_from: OffsetDateTime, valid_to: OffsetDateTime) -> Result<Self> {
        let valid_from = truncate_to_utc_second(valid_from);
        let valid_to = truncate_to_utc_second(valid_to);

        if valid_from >= valid_to {
            return Err(PkiError::InvalidValidityPeriod(format!(
                "valid_from ({}) must be before valid_to ({})",
                valid_from, valid_to
            )));
        }

        Ok(Self {
            valid_from,
            valid_to,
        })
    }

    /// Window starting at `start` and ending the same calendar day `years` later.
    /// A February 29 start ends on February 28 when the target year is not a leap year.
    pub fn years_from(start: OffsetDateTime, years: u16) -> Result<Self> {
        let start = truncate_to_utc_second(start);
        let target_year = start.year() + i32::from(years);

        let end = start.replace_year(target_year).or_else(|_| {
            start
                .replace_day(28)
                .and_then(|d| d.replace_month(Month::February))
                .and_then(|d| d.replace_year(target_year))
        });
        let end = end.map_err(|e| PkiError::InvalidValidityPeriod(e.to_string()))?;

        Self::new(start, end)
    }

    pub fn valid_from(&self) -> OffsetDateTime {
        self.valid_from
    }

    pub fn valid_to(&self) -> OffsetDateTime {
        self.valid_to
    }

    /// Inclusive on both bounds
    pub fn contains(&self, instant: OffsetDateTime) -> bool {
        self.valid_from <= instant && instant <= self.valid_to
    }
}

fn truncate_to_utc_second(instant: OffsetDateTime) -> OffsetDateTime {
    let utc = instant.to_offset(UtcOffset::UTC);
    utc - time::Duration::nanoseconds(i64::from(utc.nanosecond()))
}

/// A freshly issued self-signed certificate together with its private key
#[derive(Clone)]
pub struct CertificateIdentity {
    distinguished_name: DistinguishedName,
    validity: ValidityPeriod,
    dns_name: String,
    friendly_name: Option<String>,
    certificate_der: Vec<u8>,
    private_key_der: Zeroizing<Vec<u8>>,
    thumbprint: Thumbprint,
}

impl CertificateIdentity {
    /// Label stored in exported bundles
    pub fn with_friendly_name(mut self, friendly_name: impl Into<String>) -> Self {
        self.friendly_name = Some(friendly_name.into());
        self
    }

    pub fn distinguished_name(&self) -> &DistinguishedName {
        &self.distinguished_name
    }

    pub fn validity(&self) -> &ValidityPeriod {
        &self.validity
    }

    pub fn dns_name(&self) -> &str {
        &self.dns_name
    }

    pub fn friendly_name(&self) -> Option<&str> {
        self.friendly_name.as_deref()
    }

    /// DER-encoded public certificate
    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    /// SHA-256 thumbprint computed at issuance
    pub fn thumbprint(&self) -> &Thumbprint {
        &self.thumbprint
    }

    pub fn thumbprint_with(&self, algorithm: ThumbprintAlgorithm) -> Thumbprint {
        Thumbprint::compute(algorithm, &self.certificate_der)
    }
}

impl fmt::Debug for CertificateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateIdentity")
            .field("distinguished_name", &self.distinguished_name)
            .field("validity", &self.validity)
            .field("dns_name", &self.dns_name)
            .field("friendly_name", &self.friendly_name)
            .field("thumbprint", &self.thumbprint.to_string())
            .finish_non_exhaustive()
    }
}

/// Issues self-signed certificates usable for both TLS client and server authentication
///
/// Key material is derived from the injected random source, so a failing source can be
/// substituted in tests.
pub struct CertificateIssuer<R = OsRng> {
    rng: R,
}

impl CertificateIssuer<OsRng> {
    /// Issuer backed by the operating system random source
    pub fn new() -> Self {
        Self { rng: OsRng }
    }
}

impl Default for CertificateIssuer<OsRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: TryCryptoRng> CertificateIssuer<R> {
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }

    /// Generate a fresh key pair and a certificate signed by it
    ///
    /// The DN is both issuer and subject, the validity is encoded exactly as given, and
    /// `subject_alt_dns_name` becomes the SAN DNS entry.
    pub fn issue_self_signed(
        &mut self,
        distinguished_name: &DistinguishedName,
        validity: &ValidityPeriod,
        subject_alt_dns_name: &str,
    ) -> Result<CertificateIdentity> {
        if subject_alt_dns_name.trim().is_empty() {
            return Err(PkiError::InvalidDistinguishedName(
                "subject alternative DNS name cannot be empty".to_string(),
            ));
        }

        // Generate Ed25519 key pair
        let key_pair = self.generate_key_pair()?;

        // DNS name goes into the Subject Alternative Names
        let mut params = CertificateParams::new(vec![subject_alt_dns_name.to_string()])?;
        params.distinguished_name = distinguished_name.to_rcgen();

        // Stored bounds are already whole UTC seconds
        params.not_before = validity.valid_from();
        params.not_after = validity.valid_to();

        // End-entity certificate usable on either side of the handshake
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        // Self-sign
        let cert = params.self_signed(&key_pair)?;
        let certificate_der = cert.der().to_vec();
        let thumbprint = Thumbprint::compute(ThumbprintAlgorithm::Sha256, &certificate_der);

        info!(
            common_name = distinguished_name.common_name(),
            thumbprint = %thumbprint,
            not_before = %validity.valid_from(),
            not_after = %validity.valid_to(),
            "Issued self-signed certificate"
        );

        Ok(CertificateIdentity {
            distinguished_name: distinguished_name.clone(),
            validity: *validity,
            dns_name: subject_alt_dns_name.to_string(),
            friendly_name: None,
            certificate_der,
            private_key_der: Zeroizing::new(key_pair.serialize_der()),
            thumbprint,
        })
    }

    /// Ed25519 key pair from a 32-byte seed drawn from the injected source
    fn generate_key_pair(&mut self) -> Result<KeyPair> {
        let mut seed = Zeroizing::new([0u8; 32]);
        self.rng
            .try_fill_bytes(seed.as_mut())
            .map_err(|e| PkiError::KeyGeneration(format!("random source failed: {}", e)))?;

        // Wrap the seed as a PKCS#8 v1 document (RFC 8410)
        let mut pkcs8 = Zeroizing::new(Vec::with_capacity(ED25519_PKCS8_PREFIX.len() + 32));
        pkcs8.extend_from_slice(&ED25519_PKCS8_PREFIX);
        pkcs8.extend_from_slice(seed.as_ref());

        KeyPair::try_from(pkcs8.as_slice())
            .map_err(|e| PkiError::KeyGeneration(format!("key pair rejected: {}", e)))
    }
}

/// Serialize key and certificate into a password-protected PKCS#12 bundle
pub fn export_pkcs12(identity: &CertificateIdentity, password: &str) -> Result<Vec<u8>> {
    check_password_policy(password)?;

    let friendly_name = identity
        .friendly_name()
        .unwrap_or(identity.distinguished_name.common_name());

    // Shrouded key bag and certificate bag under one password, plus a SHA-1 MAC
    let pfx = p12::PFX::new(
        &identity.certificate_der,
        &identity.private_key_der,
        None,
        password,
        friendly_name,
    )
    .ok_or_else(|| PkiError::Export("failed to build PKCS#12 structure".to_string()))?;

    debug!(thumbprint = %identity.thumbprint, "Exported PKCS#12 bundle");
    Ok(pfx.to_der())
}

fn check_password_policy(password: &str) -> Result<()> {
    if password.trim().is_empty() {
        return Err(PkiError::Export("password cannot be empty".to_string()));
    }
    if password.chars().count() < MIN_PFX_PASSWORD_LEN {
        return Err(PkiError::Export(format!(
            "password must be at least {} characters",
            MIN_PFX_PASSWORD_LEN
        )));
    }
    Ok(())
}

/// PEM text holding only the public certificate
pub fn export_public_pem(identity: &CertificateIdentity) -> String {
    certificate_pem(&identity.certificate_der)
}

fn certificate_pem(certificate_der: &[u8]) -> String {
    pem::encode(&pem::Pem::new("CERTIFICATE", certificate_der.to_vec()))
}

/// Key and certificate recovered from a PKCS#12 bundle
#[derive(Clone)]
pub struct Pkcs12Bundle {
    certificate_der: Vec<u8>,
    private_key_der: Zeroizing<Vec<u8>>,
    thumbprint: Thumbprint,
}

impl Pkcs12Bundle {
    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    /// SHA-256 thumbprint of the bundled certificate
    pub fn thumbprint(&self) -> &Thumbprint {
        &self.thumbprint
    }

    pub fn thumbprint_with(&self, algorithm: ThumbprintAlgorithm) -> Thumbprint {
        Thumbprint::compute(algorithm, &self.certificate_der)
    }

    pub fn public_pem(&self) -> String {
        certificate_pem(&self.certificate_der)
    }

    /// Certificate followed by its PKCS#8 private key, the form TLS clients load
    pub fn identity_pem(&self) -> Zeroizing<String> {
        let key = pem::Pem::new("PRIVATE KEY", self.private_key_der.to_vec());
        let mut out = Zeroizing::new(self.public_pem());
        out.push_str(&pem::encode(&key));
        out
    }
}

impl fmt::Debug for Pkcs12Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs12Bundle")
            .field("thumbprint", &self.thumbprint.to_string())
            .finish_non_exhaustive()
    }
}

/// Open a PKCS#12 bundle. A wrong password fails with [`PkiError::InvalidPassword`].
pub fn load_pkcs12(bytes: &[u8], password: &str) -> Result<Pkcs12Bundle> {
    let pfx = p12::PFX::parse(bytes)
        .map_err(|e| PkiError::CertificateDecode(format!("malformed PKCS#12: {:?}", e)))?;

    // Check integrity with the password before decrypting any bag
    if !pfx.verify_mac(password) {
        return Err(PkiError::InvalidPassword);
    }

    // First certificate and first key; bundles written here carry exactly one of each
    let certificate_der = pfx
        .cert_x509_bags(password)
        .map_err(|e| PkiError::CertificateDecode(format!("certificate bag: {:?}", e)))?
        .into_iter()
        .next()
        .ok_or_else(|| PkiError::CertificateDecode("bundle has no certificate".to_string()))?;

    let private_key_der = pfx
        .key_bags(password)
        .map_err(|e| PkiError::CertificateDecode(format!("key bag: {:?}", e)))?
        .into_iter()
        .next()
        .map(Zeroizing::new)
        .ok_or_else(|| PkiError::CertificateDecode("bundle has no private key".to_string()))?;

    let thumbprint = Thumbprint::compute(ThumbprintAlgorithm::Sha256, &certificate_der);

    Ok(Pkcs12Bundle {
        certificate_der,
        private_key_der,
        thumbprint,
    })
}
