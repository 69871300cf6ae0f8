use yaserde::YaSerialize;

use crate::{authn_request::ProtocolBinding, ConfigError, NS_PROTOCOL};

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "md" = "urn:oasis:names:tc:SAML:2.0:metadata",
  },
  prefix = "md"
)]
struct EntityDescriptor {
    #[yaserde(attribute = true, rename = "entityID")]
    entity_id: String,
    #[yaserde(rename = "SPSSODescriptor", prefix = "md")]
    sp_sso_descriptor: SPSSODescriptor,
}

#[derive(YaSerialize)]
struct SPSSODescriptor {
    #[yaserde(attribute = true, rename = "AuthnRequestsSigned")]
    authn_requests_signed: bool,
    #[yaserde(attribute = true, rename = "WantAssertionsSigned")]
    want_assertions_signed: bool,
    #[yaserde(attribute = true, rename = "protocolSupportEnumeration")]
    protocol_support_enumeration: String,
    #[yaserde(rename = "NameIDFormat", prefix = "md")]
    name_id_format: NameIdFormat,
    #[yaserde(rename = "AssertionConsumerService", prefix = "md")]
    assertion_consumer_service: AssertionConsumerService,
}

#[derive(YaSerialize)]
struct NameIdFormat {
    #[yaserde(text = true)]
    content: String,
}

#[derive(YaSerialize)]
struct AssertionConsumerService {
    #[yaserde(attribute = true, rename = "Binding")]
    binding: String,
    #[yaserde(attribute = true, rename = "Location")]
    location: String,
    #[yaserde(attribute = true)]
    index: u32,
}

/// Describes this SP to an IdP: who it is and where assertions go.
pub struct SpMetadataBuilder {
    entity_id: Option<String>,
    acs_url: Option<String>,
    name_id_format: Option<String>,
    want_assertions_signed: bool,
}

impl Default for SpMetadataBuilder {
    fn default() -> Self {
        Self {
            entity_id: None,
            acs_url: None,
            name_id_format: None,
            want_assertions_signed: true,
        }
    }
}

impl SpMetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_id(self, entity_id: &str) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            ..self
        }
    }

    pub fn acs_url(self, acs_url: &str) -> Self {
        Self {
            acs_url: Some(acs_url.into()),
            ..self
        }
    }

    pub fn name_id_format(self, name_id_format: &str) -> Self {
        Self {
            name_id_format: Some(name_id_format.into()),
            ..self
        }
    }

    pub fn want_assertions_signed(self, want: bool) -> Self {
        Self {
            want_assertions_signed: want,
            ..self
        }
    }

    pub fn build(self) -> Result<String, ConfigError> {
        let metadata = EntityDescriptor {
            entity_id: self.entity_id.ok_or(ConfigError::MissingField("entity_id"))?,
            sp_sso_descriptor: SPSSODescriptor {
                authn_requests_signed: false,
                want_assertions_signed: self.want_assertions_signed,
                protocol_support_enumeration: NS_PROTOCOL.into(),
                name_id_format: NameIdFormat {
                    content: self
                        .name_id_format
                        .ok_or(ConfigError::MissingField("name_id_format"))?,
                },
                assertion_consumer_service: AssertionConsumerService {
                    binding: ProtocolBinding::Post.to_string(),
                    location: self.acs_url.ok_or(ConfigError::MissingField("acs_url"))?,
                    index: 0,
                },
            },
        };
        yaserde::ser::to_string(&metadata).map_err(ConfigError::Serialization)
    }
}
