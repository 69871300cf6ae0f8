//! Trust and engine configuration.
//!
//! Loading is the caller's business; these types only describe the values
//! and turn the serializable settings into their runtime form.

use std::{collections::HashMap, sync::Arc};

use serde::Deserialize;
use time::Duration;

use crate::{certificate::TrustedCertificate, idp_metadata::IdpMetadata, ConfigError};

const DEFAULT_CLOCK_SKEW_SECS: u64 = 120;
const DEFAULT_CLOCK_SKEW: Duration = Duration::minutes(2);
/// One day. Anything larger is a misconfiguration, not clock drift.
const MAX_CLOCK_SKEW_SECS: u64 = 86_400;

/// Everything the SP trusts about one IdP, plus its own identity towards it.
/// Immutable and shared across concurrent requests.
#[derive(Debug, Clone)]
pub struct TrustedIdpConfig {
    pub idp_entity_id: String,
    /// Tried in order; any of them may validate a signature.
    pub signing_certificates: Vec<TrustedCertificate>,
    pub sp_entity_id: String,
    pub acs_url: String,
    pub clock_skew: Duration,
}

impl TrustedIdpConfig {
    pub fn new(
        idp_entity_id: impl Into<String>,
        signing_certificates: Vec<TrustedCertificate>,
        sp_entity_id: impl Into<String>,
        acs_url: impl Into<String>,
    ) -> Self {
        Self {
            idp_entity_id: idp_entity_id.into(),
            signing_certificates,
            sp_entity_id: sp_entity_id.into(),
            acs_url: acs_url.into(),
            clock_skew: DEFAULT_CLOCK_SKEW,
        }
    }

    pub fn with_clock_skew(self, clock_skew: Duration) -> Self {
        Self { clock_skew, ..self }
    }

    pub fn from_metadata(
        metadata: IdpMetadata,
        sp_entity_id: impl Into<String>,
        acs_url: impl Into<String>,
    ) -> Self {
        Self::new(
            metadata.entity_id,
            metadata.signing_certificates,
            sp_entity_id,
            acs_url,
        )
    }
}

fn default_clock_skew_secs() -> u64 {
    DEFAULT_CLOCK_SKEW_SECS
}

fn default_true() -> bool {
    true
}

fn default_username_source() -> String {
    "nameid".to_string()
}

/// Serializable form of [`TrustedIdpConfig`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdpSettings {
    pub idp_entity_id: String,
    /// PEM (or bare Base64 DER) signing certificates, in trust order.
    pub signing_certificates: Vec<String>,
    pub sp_entity_id: String,
    pub acs_url: String,
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,
}

impl TryFrom<IdpSettings> for TrustedIdpConfig {
    type Error = ConfigError;

    fn try_from(settings: IdpSettings) -> Result<Self, Self::Error> {
        if settings.signing_certificates.is_empty() {
            return Err(ConfigError::MissingField("signing_certificates"));
        }
        let clock_skew = clock_skew(settings.clock_skew_secs)?;
        let certificates = settings
            .signing_certificates
            .iter()
            .map(|pem| TrustedCertificate::from_pem(pem))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TrustedIdpConfig::new(
            settings.idp_entity_id,
            certificates,
            settings.sp_entity_id,
            settings.acs_url,
        )
        .with_clock_skew(clock_skew))
    }
}

fn clock_skew(secs: u64) -> Result<Duration, ConfigError> {
    i64::try_from(secs)
        .ok()
        .filter(|_| secs <= MAX_CLOCK_SKEW_SECS)
        .map(Duration::seconds)
        .ok_or_else(|| ConfigError::InvalidSetting {
            field: "clock_skew_secs",
            reason: format!("{secs} exceeds the maximum of {MAX_CLOCK_SKEW_SECS} seconds"),
        })
}

/// Engine-wide behavior, independent of any particular IdP.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    /// `nameid`, `attributes` or `attribute:<name>`; see
    /// [`UsernameSource`](crate::UsernameSource).
    #[serde(default = "default_username_source")]
    pub username_source: String,
    /// SAML attribute name -> normalized field name.
    #[serde(default)]
    pub attribute_mapping: HashMap<String, String>,
    /// Compare Response `Destination` and bearer `Recipient` with the ACS URL.
    #[serde(default = "default_true")]
    pub check_destination: bool,
    /// Demand a signature on the assertion itself, not just the Response.
    #[serde(default)]
    pub require_signed_assertion: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            username_source: default_username_source(),
            attribute_mapping: HashMap::new(),
            check_destination: true,
            require_signed_assertion: false,
        }
    }
}

/// Supplies trust configuration for the IdP that issued a response.
pub trait MetadataProvider: Send + Sync {
    fn trusted_idp(&self, issuer: &str) -> Option<Arc<TrustedIdpConfig>>;
}

/// Pre-loaded IdP configurations.
#[derive(Debug, Clone)]
pub enum StaticMetadataProvider {
    /// One IdP answers for every issuer; the validator still checks the name.
    Single(Arc<TrustedIdpConfig>),
    ByEntityId(HashMap<String, Arc<TrustedIdpConfig>>),
}

impl StaticMetadataProvider {
    pub fn single(config: TrustedIdpConfig) -> Self {
        Self::Single(Arc::new(config))
    }

    pub fn from_configs(configs: impl IntoIterator<Item = TrustedIdpConfig>) -> Self {
        Self::ByEntityId(
            configs
                .into_iter()
                .map(|config| (config.idp_entity_id.clone(), Arc::new(config)))
                .collect(),
        )
    }
}

impl MetadataProvider for StaticMetadataProvider {
    fn trusted_idp(&self, issuer: &str) -> Option<Arc<TrustedIdpConfig>> {
        match self {
            Self::Single(config) => Some(Arc::clone(config)),
            Self::ByEntityId(configs) => configs.get(issuer).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn builds_trust_from_settings() {
        let settings: IdpSettings = serde_json::from_value(serde_json::json!({
            "idp_entity_id": testutil::IDP_ENTITY_ID,
            "signing_certificates": [testutil::IDP_CERT_PEM, testutil::ROTATED_CERT_PEM],
            "sp_entity_id": testutil::SP_ENTITY_ID,
            "acs_url": testutil::ACS_URL,
        }))
        .unwrap();
        let config = TrustedIdpConfig::try_from(settings).unwrap();
        assert_eq!(config.signing_certificates.len(), 2);
        assert_eq!(config.clock_skew, Duration::seconds(120));
    }

    #[test]
    fn rejects_settings_without_usable_certificates() {
        let base = serde_json::json!({
            "idp_entity_id": testutil::IDP_ENTITY_ID,
            "signing_certificates": [],
            "sp_entity_id": testutil::SP_ENTITY_ID,
            "acs_url": testutil::ACS_URL,
        });
        let settings: IdpSettings = serde_json::from_value(base.clone()).unwrap();
        assert!(matches!(
            TrustedIdpConfig::try_from(settings),
            Err(ConfigError::MissingField(_))
        ));

        let mut bad = base;
        bad["signing_certificates"] = serde_json::json!(["bm9wZQ=="]);
        let settings: IdpSettings = serde_json::from_value(bad).unwrap();
        assert!(matches!(
            TrustedIdpConfig::try_from(settings),
            Err(ConfigError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn engine_settings_have_defaults() {
        let settings: EngineSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.username_source, "nameid");
        assert!(settings.check_destination);
        assert!(!settings.require_signed_assertion);

        let settings: EngineSettings = serde_json::from_str(
            r#"{"username_source": "NameID", "attribute_mapping": {"mail": "email"}}"#,
        )
        .unwrap();
        assert_eq!(settings.attribute_mapping["mail"], "email");
        assert!(serde_json::from_str::<EngineSettings>(r#"{"bogus": 1}"#).is_err());
    }

    #[test]
    fn clock_skew_is_bounded() {
        let settings_with = |secs: u64| -> IdpSettings {
            serde_json::from_value(serde_json::json!({
                "idp_entity_id": testutil::IDP_ENTITY_ID,
                "signing_certificates": [testutil::IDP_CERT_PEM],
                "sp_entity_id": testutil::SP_ENTITY_ID,
                "acs_url": testutil::ACS_URL,
                "clock_skew_secs": secs,
            }))
            .unwrap()
        };

        let config = TrustedIdpConfig::try_from(settings_with(86_400)).unwrap();
        assert_eq!(config.clock_skew, Duration::days(1));
        assert_eq!(
            TrustedIdpConfig::try_from(settings_with(0)).unwrap().clock_skew,
            Duration::ZERO
        );

        for secs in [86_401, i64::MAX as u64 + 1, u64::MAX] {
            assert!(matches!(
                TrustedIdpConfig::try_from(settings_with(secs)),
                Err(ConfigError::InvalidSetting {
                    field: "clock_skew_secs",
                    ..
                })
            ));
        }
    }

    #[test]
    fn static_provider_lookup() {
        let cert = TrustedCertificate::from_pem(testutil::IDP_CERT_PEM).unwrap();
        let config = TrustedIdpConfig::new(
            testutil::IDP_ENTITY_ID,
            vec![cert],
            testutil::SP_ENTITY_ID,
            testutil::ACS_URL,
        );

        let single = StaticMetadataProvider::single(config.clone());
        assert!(single.trusted_idp("https://anyone.example.com").is_some());

        let keyed = StaticMetadataProvider::from_configs([config]);
        assert!(keyed.trusted_idp(testutil::IDP_ENTITY_ID).is_some());
        assert!(keyed.trusted_idp("https://anyone.example.com").is_none());
    }
}
