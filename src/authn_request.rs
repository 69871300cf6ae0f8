use std::{fmt::Display, str::FromStr};

use base64::{prelude::BASE64_STANDARD, Engine};
use time::OffsetDateTime;
use yaserde::YaSerialize;

use crate::{
    utils::{deflate_and_encode, random_string, redirect_url},
    ConfigError, DATE_TIME_FORMAT,
};

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
  },
  prefix = "samlp"
)]
struct AuthnRequest {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: String,
    #[yaserde(attribute = true, rename = "ProtocolBinding")]
    protocol_binding: String,
    #[yaserde(attribute = true, rename = "AssertionConsumerServiceURL")]
    assertion_consumer_service_url: String,
    #[yaserde(attribute = true, rename = "ForceAuthn")]
    force_authn: bool,
    #[yaserde(attribute = true, rename = "IsPassive")]
    is_passive: bool,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: Issuer,
    #[yaserde(rename = "NameIDPolicy", prefix = "samlp")]
    name_id_policy: NameIdPolicy,
    #[yaserde(rename = "Subject", prefix = "saml")]
    subject: Option<Subject>,
}

#[derive(YaSerialize)]
pub(crate) struct Issuer {
    #[yaserde(attribute = true, rename = "Format")]
    pub(crate) format: String,
    #[yaserde(text = true)]
    pub(crate) content: String,
}

impl Issuer {
    pub(crate) fn entity(entity_id: String) -> Self {
        Issuer {
            format: NAME_ID_FORMAT_ENTITY.to_string(),
            content: entity_id,
        }
    }
}

const NAME_ID_FORMAT_ENTITY: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:entity";

#[derive(YaSerialize)]
struct NameIdPolicy {
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
    #[yaserde(attribute = true, rename = "AllowCreate")]
    allow_create: bool,
}

#[derive(YaSerialize)]
struct Subject {
    #[yaserde(rename = "NameID", prefix = "saml")]
    name_id: NameId,
}

#[derive(YaSerialize)]
struct NameId {
    #[yaserde(attribute = true, rename = "Format")]
    format: String,
    #[yaserde(text = true)]
    content: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolBinding {
    Post,
    #[default]
    Redirect,
}

impl Display for ProtocolBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProtocolBinding::Post => write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"),
            ProtocolBinding::Redirect => {
                write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect")
            }
        }
    }
}

impl FromStr for ProtocolBinding {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" => Ok(ProtocolBinding::Post),
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" => Ok(ProtocolBinding::Redirect),
            _ => Err(()),
        }
    }
}

#[derive(Default)]
pub struct AuthnRequestBuilder {
    id: Option<String>,
    issue_instant: Option<OffsetDateTime>,
    issuer: Option<String>,
    destination: Option<String>,
    consumer_url: Option<String>,
    name_format: Option<String>,
    deny_create: bool,
    force_authn: bool,
    passive: bool,
    subject: Option<String>,
}

impl AuthnRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(self, id: &str) -> Self {
        AuthnRequestBuilder {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn auto_id(self) -> Self {
        AuthnRequestBuilder {
            id: Some(format!("_id{}", random_string(32))),
            ..self
        }
    }

    pub fn issue_instant(self, instant: OffsetDateTime) -> Self {
        AuthnRequestBuilder {
            issue_instant: Some(instant),
            ..self
        }
    }

    pub fn issued_now(self) -> Self {
        AuthnRequestBuilder {
            issue_instant: Some(OffsetDateTime::now_utc()),
            ..self
        }
    }

    pub fn issuer(self, issuer: &str) -> Self {
        AuthnRequestBuilder {
            issuer: Some(issuer.into()),
            ..self
        }
    }

    pub fn destination(self, destination: &str) -> Self {
        AuthnRequestBuilder {
            destination: Some(destination.into()),
            ..self
        }
    }

    pub fn consumer_url(self, url: &str) -> Self {
        AuthnRequestBuilder {
            consumer_url: Some(url.into()),
            ..self
        }
    }

    pub fn name_format(self, format: &str) -> Self {
        AuthnRequestBuilder {
            name_format: Some(format.into()),
            ..self
        }
    }

    pub fn allow_create(self, allow: bool) -> Self {
        AuthnRequestBuilder {
            deny_create: !allow,
            ..self
        }
    }

    /// Asks the IdP to re-authenticate even with a live IdP session.
    pub fn force_authn(self, force: bool) -> Self {
        AuthnRequestBuilder {
            force_authn: force,
            ..self
        }
    }

    /// Asks the IdP not to interact with the user.
    pub fn passive(self, passive: bool) -> Self {
        AuthnRequestBuilder { passive, ..self }
    }

    pub fn subject(self, subject: &str) -> Self {
        AuthnRequestBuilder {
            subject: Some(subject.into()),
            ..self
        }
    }

    pub fn build(self) -> Result<String, ConfigError> {
        let name_format = self.name_format.ok_or(ConfigError::MissingField("name_format"))?;
        let issue_instant = self
            .issue_instant
            .ok_or(ConfigError::MissingField("issue_instant"))?
            .format(&DATE_TIME_FORMAT)
            .map_err(|e| ConfigError::Serialization(e.to_string()))?;
        let req = AuthnRequest {
            id: self.id.ok_or(ConfigError::MissingField("id"))?,
            version: "2.0".to_string(),
            issue_instant,
            destination: self.destination.ok_or(ConfigError::MissingField("destination"))?,
            // The binding the IdP should answer with; the ACS only speaks POST.
            protocol_binding: ProtocolBinding::Post.to_string(),
            assertion_consumer_service_url: self
                .consumer_url
                .ok_or(ConfigError::MissingField("consumer_url"))?,
            force_authn: self.force_authn,
            is_passive: self.passive,
            issuer: Issuer::entity(self.issuer.ok_or(ConfigError::MissingField("issuer"))?),
            name_id_policy: NameIdPolicy {
                format: name_format.clone(),
                allow_create: !self.deny_create,
            },
            subject: self.subject.map(|subject| Subject {
                name_id: NameId {
                    format: name_format,
                    content: subject,
                },
            }),
        };
        yaserde::ser::to_string(&req).map_err(ConfigError::Serialization)
    }

    /// `SAMLRequest` value for the HTTP-Redirect binding: raw DEFLATE, then
    /// Base64.
    pub fn build_and_encode(self) -> Result<String, ConfigError> {
        Ok(deflate_and_encode(&self.build()?))
    }

    /// `SAMLRequest` value for the HTTP-POST binding.
    pub fn build_for_post(self) -> Result<String, ConfigError> {
        Ok(BASE64_STANDARD.encode(self.build()?))
    }

    /// The IdP URL to send the browser to, carrying the request and the
    /// relay state the ACS will hand back.
    pub fn redirect_url(
        self,
        sso_url: &str,
        relay_state: Option<&str>,
    ) -> Result<String, ConfigError> {
        let request = self.build_and_encode()?;
        redirect_url(sso_url, "SAMLRequest", &request, relay_state)
    }
}
