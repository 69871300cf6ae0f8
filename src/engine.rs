//! The assertion consumer pipeline.
//!
//! parse -> trust lookup -> signature -> validation -> mapping -> outcome.
//! Every step short-circuits; only the failure kind leaves the engine.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    config::{EngineSettings, MetadataProvider, TrustedIdpConfig},
    dsig::{has_signature, verify_signature},
    mapper::{AttributeMapper, Identity},
    outcome::{AcsOutcome, Stage},
    replay::ReplayStore,
    response::{parse_response, ParsedResponse, RawResponse},
    validator::{AssertionValidator, ValidationPolicy},
    ConfigError, SamlError,
};

/// A SAML Service Provider's assertion consumer service. Shareable across
/// request threads.
#[derive(Clone)]
pub struct ServiceProvider {
    settings: EngineSettings,
    mapper: AttributeMapper,
    metadata: Arc<dyn MetadataProvider>,
    validator: AssertionValidator,
}

impl ServiceProvider {
    pub fn new(
        settings: EngineSettings,
        metadata: Arc<dyn MetadataProvider>,
        replay: Arc<dyn ReplayStore>,
    ) -> Result<Self, ConfigError> {
        let mapper = AttributeMapper::from_settings(&settings)?;
        Ok(Self {
            settings,
            mapper,
            metadata,
            validator: AssertionValidator::new(replay),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn consume(&self, raw: RawResponse) -> AcsOutcome {
        self.consume_at(raw, OffsetDateTime::now_utc())
    }

    /// Reads an HTTP-POST binding body and consumes it.
    pub fn consume_form(&self, body: &str) -> AcsOutcome {
        self.consume(RawResponse::from_form(body))
    }

    pub fn consume_at(&self, raw: RawResponse, now: OffsetDateTime) -> AcsOutcome {
        let RawResponse {
            saml_response,
            relay_state,
        } = raw;

        match self.process(&saml_response, now) {
            Ok(identity) => {
                info!(
                    username = %identity.username,
                    issuer = %identity.issuer,
                    stage = %Stage::Emitted,
                    "SAML login accepted"
                );
                AcsOutcome::success(identity, relay_state)
            }
            Err((stage, error)) => {
                warn!(
                    stage = %stage,
                    kind = %error.kind(),
                    error = %error,
                    "SAML response rejected"
                );
                AcsOutcome::failure(error.kind(), relay_state)
            }
        }
    }

    /// On failure, also reports the last stage that completed.
    fn process(
        &self,
        saml_response: &str,
        now: OffsetDateTime,
    ) -> Result<Identity, (Stage, SamlError)> {
        let response = parse_response(saml_response).map_err(|e| (Stage::Received, e))?;
        debug!(response_id = %response.id, stage = %Stage::Parsed, "SAML response parsed");

        let idp = self.trusted_idp(&response).map_err(|e| (Stage::Parsed, e))?;
        self.verify_signatures(&response, &idp)
            .map_err(|e| (Stage::Parsed, e))?;
        debug!(
            issuer = %idp.idp_entity_id,
            stage = %Stage::SignatureVerified,
            "SAML response signature verified"
        );

        let policy = ValidationPolicy::new(&idp, &self.settings);
        self.validator
            .validate(&response, &policy, now)
            .map_err(|e| (Stage::SignatureVerified, e))?;

        let identity = self
            .mapper
            .map(&response.assertion)
            .map_err(|e| (Stage::Validated, e))?;
        debug!(username = %identity.username, stage = %Stage::Mapped, "assertion mapped");
        Ok(identity)
    }

    fn trusted_idp(&self, response: &ParsedResponse) -> Result<Arc<TrustedIdpConfig>, SamlError> {
        let issuer = &response.assertion.issuer;
        self.metadata
            .trusted_idp(issuer)
            .ok_or_else(|| SamlError::IssuerMismatch {
                expected: "a configured IdP".to_string(),
                actual: issuer.clone(),
            })
    }

    fn verify_signatures(
        &self,
        response: &ParsedResponse,
        idp: &TrustedIdpConfig,
    ) -> Result<(), SamlError> {
        let document = response.document();
        let response_element = response.response_element();
        let assertion_element = response.assertion_element().ok_or_else(|| {
            SamlError::MalformedAssertion("assertion element vanished".to_string())
        })?;

        let response_signed = has_signature(response_element);
        let assertion_signed = has_signature(assertion_element);
        if !assertion_signed && (self.settings.require_signed_assertion || !response_signed) {
            return Err(SamlError::SignatureAbsent);
        }

        if response_signed {
            verify_signature(document, response_element, &idp.signing_certificates)?;
        }
        if assertion_signed {
            verify_signature(document, assertion_element, &idp.signing_certificates)?;
        }
        Ok(())
    }
}
