use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::error::Result;
use super::parse_certificate;
use super::thumbprint::{Thumbprint, ThumbprintAlgorithm};

/// Why a presented certificate was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Nothing was presented, or it could not be decoded
    MissingCertificate,
    ThumbprintMismatch,
    NotYetValid,
    Expired,
}

impl RejectReason {
    /// Stable machine-readable kind
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingCertificate => "missing-certificate",
            Self::ThumbprintMismatch => "thumbprint-mismatch",
            Self::NotYetValid => "not-yet-valid",
            Self::Expired => "expired",
        }
    }

    /// Human-readable text returned to the caller
    pub fn message(self) -> &'static str {
        match self {
            Self::MissingCertificate => "A valid client certificate is not found",
            Self::ThumbprintMismatch => "A valid client certificate is not used",
            Self::NotYetValid => "Client certificate is not valid yet",
            Self::Expired => "Client certificate has expired",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of validating one presented certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationDecision {
    Accept,
    Reject(RejectReason),
}

impl ValidationDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accept)
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Accept => None,
            Self::Reject(reason) => Some(*reason),
        }
    }
}

/// Thumbprints a validator accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustPolicy {
    algorithm: ThumbprintAlgorithm,
    trusted: HashSet<Thumbprint>,
}

impl TrustPolicy {
    /// Build a policy from hex thumbprints computed with `algorithm`
    pub fn new<I, S>(algorithm: ThumbprintAlgorithm, thumbprints: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let trusted = thumbprints
            .into_iter()
            .map(|t| Thumbprint::parse(algorithm, t.as_ref()))
            .collect::<Result<HashSet<_>>>()?;

        Ok(Self { algorithm, trusted })
    }

    /// Policy trusting exactly one thumbprint
    pub fn single(thumbprint: Thumbprint) -> Self {
        Self {
            algorithm: thumbprint.algorithm(),
            trusted: HashSet::from([thumbprint]),
        }
    }

    pub fn algorithm(&self) -> ThumbprintAlgorithm {
        self.algorithm
    }

    pub fn trusts(&self, thumbprint: &Thumbprint) -> bool {
        self.trusted.contains(thumbprint)
    }

    pub fn len(&self) -> usize {
        self.trusted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trusted.is_empty()
    }
}

/// Decide whether a presented certificate is accepted
///
/// Checks run in a fixed order: decode, thumbprint identity, then the validity window
/// against the single instant `now` (both bounds inclusive). No chain or signature
/// verification is performed; trust comes from the pinned thumbprint alone.
pub fn validate(
    raw_certificate: Option<&[u8]>,
    policy: &TrustPolicy,
    now: OffsetDateTime,
) -> ValidationDecision {
    let Some(raw) = raw_certificate else {
        return reject(RejectReason::MissingCertificate, None);
    };

    let cert = match parse_certificate(raw) {
        Ok(cert) => cert,
        Err(e) => {
            debug!(error = %e, len = raw.len(), "Presented certificate could not be decoded");
            return reject(RejectReason::MissingCertificate, None);
        }
    };

    let thumbprint = Thumbprint::compute(policy.algorithm(), raw);
    if !policy.trusts(&thumbprint) {
        return reject(RejectReason::ThumbprintMismatch, Some(&thumbprint));
    }

    let validity = cert.validity();
    if now < validity.not_before.to_datetime() {
        return reject(RejectReason::NotYetValid, Some(&thumbprint));
    }
    if now > validity.not_after.to_datetime() {
        return reject(RejectReason::Expired, Some(&thumbprint));
    }

    debug!(thumbprint = %thumbprint, "Client certificate accepted");
    ValidationDecision::Accept
}

fn reject(reason: RejectReason, thumbprint: Option<&Thumbprint>) -> ValidationDecision {
    match thumbprint {
        Some(thumbprint) => {
            warn!(reason = %reason, thumbprint = %thumbprint, "Client certificate rejected")
        }
        None => warn!(reason = %reason, "Client certificate rejected"),
    }
    ValidationDecision::Reject(reason)
}

/// Request-time validator over a swappable, immutable policy snapshot
///
/// Clones share the same policy slot. Each call reads one snapshot, so a concurrent
/// [`CertificateValidator::replace_policy`] never exposes a partially updated policy.
#[derive(Clone)]
pub struct CertificateValidator {
    policy: Arc<ArcSwap<TrustPolicy>>,
}

impl CertificateValidator {
    pub fn new(policy: TrustPolicy) -> Self {
        Self {
            policy: Arc::new(ArcSwap::from_pointee(policy)),
        }
    }

    /// Current policy snapshot
    pub fn policy(&self) -> Arc<TrustPolicy> {
        self.policy.load_full()
    }

    /// Atomically install a new policy
    pub fn replace_policy(&self, policy: TrustPolicy) {
        debug!(trusted = policy.len(), "Replacing trust policy");
        self.policy.store(Arc::new(policy));
    }

    /// Validate at the current UTC time
    pub fn validate_now(&self, raw_certificate: Option<&[u8]>) -> ValidationDecision {
        self.validate_at(raw_certificate, OffsetDateTime::now_utc())
    }

    pub fn validate_at(
        &self,
        raw_certificate: Option<&[u8]>,
        now: OffsetDateTime,
    ) -> ValidationDecision {
        let policy = self.policy.load();
        validate(raw_certificate, &policy, now)
    }
}

impl fmt::Debug for CertificateValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateValidator")
            .field("policy", &*self.policy.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::certificate::{
        CertificateIdentity, CertificateIssuer, DistinguishedName, ValidityPeriod,
    };
    use time::macros::datetime;
    use time::Duration;

    const T: OffsetDateTime = datetime!(2024-06-01 09:00:00 UTC);

    fn issue_at(start: OffsetDateTime) -> CertificateIdentity {
        let name = DistinguishedName::new("functionsCertAuth").unwrap();
        let period = ValidityPeriod::years_from(start, 10).unwrap();
        CertificateIssuer::new()
            .issue_self_signed(&name, &period, "FunctionCertificate")
            .unwrap()
    }

    fn policy_for(identity: &CertificateIdentity) -> TrustPolicy {
        TrustPolicy::single(identity.thumbprint().clone())
    }

    #[test]
    fn test_missing_certificate() {
        let identity = issue_at(T);
        let policy = policy_for(&identity);
        for now in [T, T - Duration::days(1), T + Duration::days(4000)] {
            assert_eq!(
                validate(None, &policy, now),
                ValidationDecision::Reject(RejectReason::MissingCertificate)
            );
        }

        let empty = TrustPolicy::new(ThumbprintAlgorithm::Sha1, Vec::<String>::new()).unwrap();
        assert_eq!(
            validate(None, &empty, T).reject_reason(),
            Some(RejectReason::MissingCertificate)
        );
    }

    #[test]
    fn test_undecodable_bytes_are_missing_certificate() {
        let identity = issue_at(T);
        let policy = policy_for(&identity);

        let decision = validate(Some(b"\x30\x82garbage"), &policy, T + Duration::days(1));
        assert_eq!(decision, ValidationDecision::Reject(RejectReason::MissingCertificate));

        let mut truncated = identity.certificate_der().to_vec();
        truncated.truncate(truncated.len() / 2);
        assert_eq!(
            validate(Some(&truncated), &policy, T + Duration::days(1)).reject_reason(),
            Some(RejectReason::MissingCertificate)
        );
    }

    #[test]
    fn test_issued_certificate_lifecycle() {
        let identity = issue_at(T);
        let der = Some(identity.certificate_der());
        let policy = policy_for(&identity);

        assert_eq!(validate(der, &policy, T + Duration::days(1)), ValidationDecision::Accept);
        assert_eq!(
            validate(der, &policy, T - Duration::days(1)),
            ValidationDecision::Reject(RejectReason::NotYetValid)
        );
        assert_eq!(
            validate(der, &policy, T + Duration::days(365 * 11 + 3)),
            ValidationDecision::Reject(RejectReason::Expired)
        );

        let other = issue_at(T);
        assert_eq!(
            validate(der, &policy_for(&other), T + Duration::days(1)),
            ValidationDecision::Reject(RejectReason::ThumbprintMismatch)
        );
    }

    #[test]
    fn test_identity_checked_before_validity_window() {
        let identity = issue_at(T);
        let other = issue_at(T);
        let expired_instant = T + Duration::days(365 * 11 + 3);

        assert_eq!(
            validate(Some(identity.certificate_der()), &policy_for(&identity), expired_instant)
                .reject_reason(),
            Some(RejectReason::Expired)
        );
        assert_eq!(
            validate(Some(identity.certificate_der()), &policy_for(&other), expired_instant)
                .reject_reason(),
            Some(RejectReason::ThumbprintMismatch)
        );
    }

    #[test]
    fn test_window_bounds_are_inclusive() {
        let identity = issue_at(T);
        let der = Some(identity.certificate_der());
        let policy = policy_for(&identity);
        let period = identity.validity();

        assert!(validate(der, &policy, period.valid_from()).is_accepted());
        assert!(validate(der, &policy, period.valid_to()).is_accepted());
        assert_eq!(
            validate(der, &policy, period.valid_from() - Duration::seconds(1)).reject_reason(),
            Some(RejectReason::NotYetValid)
        );
        assert_eq!(
            validate(der, &policy, period.valid_to() + Duration::seconds(1)).reject_reason(),
            Some(RejectReason::Expired)
        );
    }

    #[test]
    fn test_issued_window_matches_validator_window() {
        let identity = issue_at(T);
        let der = Some(identity.certificate_der());
        let policy = policy_for(&identity);
        let period = identity.validity();

        let one_second = Duration::seconds(1);
        for instant in [
            period.valid_from() - one_second,
            period.valid_from(),
            period.valid_from() + one_second,
            T + Duration::days(365),
            period.valid_to() - one_second,
            period.valid_to(),
            period.valid_to() + one_second,
        ] {
            assert_eq!(
                period.contains(instant),
                validate(der, &policy, instant).is_accepted(),
                "disagreement at {}",
                instant
            );
        }
    }

    #[test]
    fn test_policy_thumbprints_compare_case_insensitively() {
        let identity = issue_at(T);
        let sha1 = identity.thumbprint_with(ThumbprintAlgorithm::Sha1).to_string();
        let policy = TrustPolicy::new(
            ThumbprintAlgorithm::Sha1,
            ["0000000000000000000000000000000000000000".to_string(), sha1.to_lowercase()],
        )
        .unwrap();

        assert_eq!(policy.len(), 2);
        assert!(validate(Some(identity.certificate_der()), &policy, T + Duration::days(1))
            .is_accepted());
    }

    #[test]
    fn test_invalid_policy_entry_is_error() {
        assert!(TrustPolicy::new(ThumbprintAlgorithm::Sha256, ["abc"]).is_err());
    }

    #[test]
    fn test_replace_policy_is_seen_by_clones() {
        let first = issue_at(T);
        let second = issue_at(T);
        let validator = CertificateValidator::new(policy_for(&first));
        let shared = validator.clone();
        let now = T + Duration::days(1);

        assert!(shared.validate_at(Some(first.certificate_der()), now).is_accepted());

        validator.replace_policy(policy_for(&second));
        assert_eq!(
            shared.validate_at(Some(first.certificate_der()), now).reject_reason(),
            Some(RejectReason::ThumbprintMismatch)
        );
        assert!(shared.validate_at(Some(second.certificate_der()), now).is_accepted());
        assert!(shared.policy().trusts(second.thumbprint()));
    }

    #[test]
    fn test_concurrent_validation() {
        let identity = issue_at(OffsetDateTime::now_utc() - Duration::days(1));
        let validator = CertificateValidator::new(policy_for(&identity));
        let der = identity.certificate_der().to_vec();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let validator = validator.clone();
                let der = der.clone();
                std::thread::spawn(move || {
                    (0..50).all(|_| validator.validate_now(Some(&der)).is_accepted())
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }

    #[test]
    fn test_reason_kinds() {
        assert_eq!(RejectReason::MissingCertificate.as_str(), "missing-certificate");
        assert_eq!(RejectReason::ThumbprintMismatch.as_str(), "thumbprint-mismatch");
        assert_eq!(RejectReason::NotYetValid.as_str(), "not-yet-valid");
        assert_eq!(RejectReason::Expired.to_string(), "expired");
    }
}
