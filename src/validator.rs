use std::sync::Arc;

use time::{macros::time, Date, Duration, OffsetDateTime};
use tracing::debug;

use crate::{
    assertion::ParsedAssertion, config::EngineSettings, config::TrustedIdpConfig,
    replay::ReplayStore, response::ParsedResponse, SamlError, CONFIRMATION_METHOD_BEARER,
};

/// What a response must satisfy to be accepted from one IdP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationPolicy {
    pub idp_entity_id: String,
    pub sp_entity_id: String,
    pub acs_url: String,
    pub clock_skew: Duration,
    pub check_destination: bool,
}

impl ValidationPolicy {
    pub fn new(idp: &TrustedIdpConfig, settings: &EngineSettings) -> Self {
        Self {
            idp_entity_id: idp.idp_entity_id.clone(),
            sp_entity_id: idp.sp_entity_id.clone(),
            acs_url: idp.acs_url.clone(),
            clock_skew: idp.clock_skew,
            check_destination: settings.check_destination,
        }
    }
}

/// Semantic checks on a response whose signature has already been verified.
#[derive(Clone)]
pub struct AssertionValidator {
    replay: Arc<dyn ReplayStore>,
}

impl AssertionValidator {
    pub fn new(replay: Arc<dyn ReplayStore>) -> Self {
        Self { replay }
    }

    /// Runs every check and, only if all pass, consumes the assertion ID.
    pub fn validate(
        &self,
        response: &ParsedResponse,
        policy: &ValidationPolicy,
        now: OffsetDateTime,
    ) -> Result<(), SamlError> {
        let assertion = &response.assertion;

        check_issuer(&policy.idp_entity_id, &assertion.issuer)?;
        if let Some(issuer) = &response.issuer {
            check_issuer(&policy.idp_entity_id, issuer)?;
        }
        check_time_window(assertion, policy.clock_skew, now)?;
        check_audience(assertion, &policy.sp_entity_id)?;
        check_bearer_confirmations(assertion, policy, now)?;
        if policy.check_destination {
            if let Some(destination) = &response.destination {
                check_destination(&policy.acs_url, destination)?;
            }
        }

        let expires_at = replay_expiry(assertion, policy.clock_skew);
        if !self.replay.insert_if_absent(&assertion.id, expires_at, now) {
            return Err(SamlError::ReplayDetected {
                id: assertion.id.clone(),
            });
        }
        debug!(assertion_id = %assertion.id, %expires_at, "assertion validated");
        Ok(())
    }
}

fn check_issuer(expected: &str, actual: &str) -> Result<(), SamlError> {
    if actual == expected {
        Ok(())
    } else {
        Err(SamlError::IssuerMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

/// The last representable instant; bounds that overflow saturate here.
const FOREVER: OffsetDateTime = Date::MAX.with_time(time!(23:59:59.999_999_999)).assume_utc();

fn check_expiry(
    not_on_or_after: OffsetDateTime,
    skew: Duration,
    now: OffsetDateTime,
) -> Result<(), SamlError> {
    // An upper bound past the representable range never expires.
    match not_on_or_after.checked_add(skew) {
        Some(deadline) if now > deadline => Err(SamlError::AssertionExpired { not_on_or_after }),
        _ => Ok(()),
    }
}

// Accepts the closed interval [NotBefore - skew, NotOnOrAfter + skew].
fn check_time_window(
    assertion: &ParsedAssertion,
    skew: Duration,
    now: OffsetDateTime,
) -> Result<(), SamlError> {
    let conditions = &assertion.conditions;
    if let Some(not_before) = conditions.not_before {
        match not_before.checked_sub(skew) {
            Some(earliest) if now < earliest => {
                return Err(SamlError::AssertionNotYetValid { not_before });
            }
            _ => {}
        }
    }
    if let Some(not_on_or_after) = conditions.not_on_or_after {
        check_expiry(not_on_or_after, skew, now)?;
    }
    Ok(())
}

/// When the ID may leave the replay cache: the earliest `NotOnOrAfter` of the
/// conditions and bearer confirmations, plus skew. An assertion without any
/// of them stays acceptable indefinitely, so its ID is kept for good.
fn replay_expiry(assertion: &ParsedAssertion, skew: Duration) -> OffsetDateTime {
    let bearer_deadlines = assertion
        .subject
        .confirmations
        .iter()
        .filter(|confirmation| confirmation.method == CONFIRMATION_METHOD_BEARER)
        .filter_map(|confirmation| confirmation.data.as_ref()?.not_on_or_after);

    assertion
        .conditions
        .not_on_or_after
        .into_iter()
        .chain(bearer_deadlines)
        .min()
        .and_then(|not_on_or_after| not_on_or_after.checked_add(skew))
        .unwrap_or(FOREVER)
}

fn check_audience(assertion: &ParsedAssertion, sp_entity_id: &str) -> Result<(), SamlError> {
    let restrictions = &assertion.conditions.audience_restrictions;
    let satisfied = !restrictions.is_empty()
        && restrictions
            .iter()
            .all(|audiences| audiences.iter().any(|audience| audience == sp_entity_id));
    if satisfied {
        Ok(())
    } else {
        Err(SamlError::AudienceMismatch {
            expected: sp_entity_id.to_string(),
            audiences: assertion.conditions.audiences(),
        })
    }
}

fn check_destination(acs_url: &str, actual: &str) -> Result<(), SamlError> {
    if actual == acs_url {
        Ok(())
    } else {
        Err(SamlError::DestinationMismatch {
            expected: acs_url.to_string(),
            actual: actual.to_string(),
        })
    }
}

fn check_bearer_confirmations(
    assertion: &ParsedAssertion,
    policy: &ValidationPolicy,
    now: OffsetDateTime,
) -> Result<(), SamlError> {
    let bearer_data = assertion
        .subject
        .confirmations
        .iter()
        .filter(|confirmation| confirmation.method == CONFIRMATION_METHOD_BEARER)
        .filter_map(|confirmation| confirmation.data.as_ref());

    for data in bearer_data {
        if let Some(not_on_or_after) = data.not_on_or_after {
            check_expiry(not_on_or_after, policy.clock_skew, now)?;
        }
        if policy.check_destination {
            if let Some(recipient) = &data.recipient {
                check_destination(&policy.acs_url, recipient)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::{
        replay::InMemoryReplayCache,
        response::parse_response,
        testutil::{self, ResponseTemplate, NOW},
        FailureKind,
    };

    fn policy() -> ValidationPolicy {
        ValidationPolicy {
            idp_entity_id: testutil::IDP_ENTITY_ID.into(),
            sp_entity_id: testutil::SP_ENTITY_ID.into(),
            acs_url: testutil::ACS_URL.into(),
            clock_skew: Duration::seconds(120),
            check_destination: true,
        }
    }

    fn validate_at(template: &ResponseTemplate, now: OffsetDateTime) -> Result<(), SamlError> {
        let validator = AssertionValidator::new(Arc::new(InMemoryReplayCache::new()));
        let response = parse_response(&template.encoded()).unwrap();
        validator.validate(&response, &policy(), now)
    }

    fn kind(template: &ResponseTemplate, now: OffsetDateTime) -> Option<FailureKind> {
        validate_at(template, now).err().map(|e| e.kind())
    }

    #[test]
    fn accepts_a_conforming_assertion() {
        assert!(validate_at(&ResponseTemplate::default(), NOW).is_ok());
    }

    #[test]
    fn time_window_includes_both_skewed_edges() {
        let template = ResponseTemplate::default();
        // NotBefore 09:59:00, NotOnOrAfter 10:05:00, skew 2 minutes.
        let earliest = datetime!(2026-01-15 09:57:00 UTC);
        let latest = datetime!(2026-01-15 10:07:00 UTC);
        let tick = Duration::microseconds(1);

        assert!(validate_at(&template, earliest).is_ok());
        assert_eq!(kind(&template, earliest - tick), Some(FailureKind::AssertionNotYetValid));
        assert!(validate_at(&template, latest).is_ok());
        assert_eq!(kind(&template, latest + tick), Some(FailureKind::AssertionExpired));
    }

    #[test]
    fn bearer_expiry_is_enforced_on_its_own() {
        let mut response = parse_response(&ResponseTemplate::default().encoded()).unwrap();
        response.assertion.conditions.not_on_or_after = None;
        let validator = AssertionValidator::new(Arc::new(InMemoryReplayCache::new()));
        let result = validator.validate(&response, &policy(), datetime!(2026-01-15 10:07:01 UTC));
        assert_eq!(result.err().map(|e| e.kind()), Some(FailureKind::AssertionExpired));
    }

    #[test]
    fn bounds_at_the_edge_of_time_do_not_overflow() {
        let template = ResponseTemplate::default().not_on_or_after(Some("9999-12-31T23:59:59Z"));
        assert!(validate_at(&template, NOW).is_ok());

        let mut response = parse_response(&ResponseTemplate::default().encoded()).unwrap();
        response.assertion.conditions.not_before = Some(Date::MIN.midnight().assume_utc());
        let validator = AssertionValidator::new(Arc::new(InMemoryReplayCache::new()));
        assert!(validator.validate(&response, &policy(), NOW).is_ok());

        let skew = Duration::seconds(120);
        assert!(check_expiry(FOREVER, skew, FOREVER).is_ok());
        let far_future = datetime!(9999-12-31 23:59:59 UTC);
        assert_eq!(
            replay_expiry(&response.assertion, Duration::days(1)),
            datetime!(2026-01-16 10:05:00 UTC)
        );
        response.assertion.conditions.not_on_or_after = Some(far_future);
        response.assertion.subject.confirmations.clear();
        assert_eq!(replay_expiry(&response.assertion, skew), FOREVER);
    }

    #[test]
    fn audience_rules() {
        let mismatched = ResponseTemplate::default().audiences(&["https://other.example.com"]);
        assert_eq!(kind(&mismatched, NOW), Some(FailureKind::AudienceMismatch));

        let missing = ResponseTemplate::default().audiences(&[]);
        assert_eq!(kind(&missing, NOW), Some(FailureKind::AudienceMismatch));

        let several = ResponseTemplate::default()
            .audiences(&["https://other.example.com", testutil::SP_ENTITY_ID]);
        assert!(validate_at(&several, NOW).is_ok());
    }

    #[test]
    fn issuer_must_match() {
        let template = ResponseTemplate::default().issuer("https://evil.example.com");
        assert_eq!(kind(&template, NOW), Some(FailureKind::IssuerMismatch));
    }

    #[test]
    fn response_issuer_must_match_too() {
        let template =
            ResponseTemplate::default().response_issuer(Some("https://evil.example.com"));
        assert_eq!(kind(&template, NOW), Some(FailureKind::IssuerMismatch));

        let absent = ResponseTemplate::default().response_issuer(None);
        assert!(validate_at(&absent, NOW).is_ok());
    }

    #[test]
    fn destination_and_recipient_must_match() {
        let template =
            ResponseTemplate::default().destination(Some("https://sp.example.com/other"));
        assert_eq!(kind(&template, NOW), Some(FailureKind::DestinationMismatch));

        let template = ResponseTemplate::default().recipient("https://sp.example.com/other");
        assert_eq!(kind(&template, NOW), Some(FailureKind::DestinationMismatch));

        let template = ResponseTemplate::default().destination(None);
        assert!(validate_at(&template, NOW).is_ok());

        let lenient = ValidationPolicy {
            check_destination: false,
            ..policy()
        };
        let response = parse_response(
            &ResponseTemplate::default()
                .destination(Some("https://sp.example.com/other"))
                .encoded(),
        )
        .unwrap();
        let validator = AssertionValidator::new(Arc::new(InMemoryReplayCache::new()));
        assert!(validator.validate(&response, &lenient, NOW).is_ok());
    }

    #[test]
    fn replays_are_detected_after_all_other_checks() {
        let cache = Arc::new(InMemoryReplayCache::new());
        let validator = AssertionValidator::new(cache.clone());
        let response = parse_response(&ResponseTemplate::default().encoded()).unwrap();

        // A rejected attempt must not burn the ID.
        let expired = datetime!(2026-01-15 11:00:00 UTC);
        assert!(validator.validate(&response, &policy(), expired).is_err());
        assert!(cache.is_empty());

        assert!(validator.validate(&response, &policy(), NOW).is_ok());
        let replay = validator.validate(&response, &policy(), NOW).unwrap_err();
        assert_eq!(replay.kind(), FailureKind::ReplayDetected);
    }

    #[test]
    fn replay_entries_outlive_the_acceptance_window() {
        let cache = Arc::new(InMemoryReplayCache::new());
        let validator = AssertionValidator::new(cache.clone());
        let response = parse_response(&ResponseTemplate::default().encoded()).unwrap();
        assert!(validator.validate(&response, &policy(), NOW).is_ok());

        // Still remembered at the last acceptable instant.
        let last = datetime!(2026-01-15 10:07:00 UTC);
        assert_eq!(cache.prune_expired(last), 0);
        assert_eq!(
            validator.validate(&response, &policy(), last).unwrap_err().kind(),
            FailureKind::ReplayDetected
        );
        assert_eq!(cache.prune_expired(last + Duration::microseconds(1)), 1);
    }

    #[test]
    fn replay_entries_follow_the_bearer_deadline() {
        let cache = Arc::new(InMemoryReplayCache::new());
        let validator = AssertionValidator::new(cache.clone());
        let mut response = parse_response(&ResponseTemplate::default().encoded()).unwrap();
        response.assertion.conditions.not_on_or_after = None;
        assert!(validator.validate(&response, &policy(), NOW).is_ok());

        // The confirmation data still says 10:05:00.
        let last = datetime!(2026-01-15 10:07:00 UTC);
        assert_eq!(cache.prune_expired(last), 0);
        assert_eq!(cache.prune_expired(last + Duration::microseconds(1)), 1);
    }

    #[test]
    fn assertions_without_any_expiry_are_remembered_for_good() {
        let cache = Arc::new(InMemoryReplayCache::new());
        let validator = AssertionValidator::new(cache.clone());
        let response =
            parse_response(&ResponseTemplate::default().not_on_or_after(None).encoded()).unwrap();

        assert!(validator.validate(&response, &policy(), NOW).is_ok());
        let much_later = datetime!(2027-01-15 10:00:00 UTC);
        assert_eq!(cache.prune_expired(much_later), 0);
        let replay = validator.validate(&response, &policy(), much_later).unwrap_err();
        assert_eq!(replay.kind(), FailureKind::ReplayDetected);
    }
}
