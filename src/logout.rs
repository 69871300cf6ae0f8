//! SP-initiated single logout over the HTTP-Redirect binding.
//!
//! The SP sends a `LogoutRequest` naming the principal and session it got
//! from the login, and reads back the IdP's `LogoutResponse` status.

use time::OffsetDateTime;
use tracing::debug;
use yaserde::YaSerialize;

use crate::{
    authn_request::{Issuer, ProtocolBinding},
    mapper::Identity,
    response::{check_status, check_version, malformed, optional_child, required_attribute},
    utils::{
        decode_and_inflate, decode_xml_base64, deflate_and_encode, random_string, redirect_url,
    },
    xml::Document,
    ConfigError, SamlError, DATE_TIME_FORMAT, NS_ASSERTION, NS_PROTOCOL,
};

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "samlp" = "urn:oasis:names:tc:SAML:2.0:protocol",
    "saml" = "urn:oasis:names:tc:SAML:2.0:assertion",
  },
  prefix = "samlp"
)]
struct LogoutRequest {
    #[yaserde(attribute = true, rename = "ID")]
    id: String,
    #[yaserde(attribute = true, rename = "Version")]
    version: String,
    #[yaserde(attribute = true, rename = "IssueInstant")]
    issue_instant: String,
    #[yaserde(attribute = true, rename = "Destination")]
    destination: String,
    #[yaserde(rename = "Issuer", prefix = "saml")]
    issuer: Issuer,
    #[yaserde(rename = "NameID", prefix = "saml")]
    name_id: NameId,
    #[yaserde(rename = "SessionIndex", prefix = "samlp")]
    session_index: Option<String>,
}

#[derive(YaSerialize)]
struct NameId {
    #[yaserde(attribute = true, rename = "Format")]
    format: Option<String>,
    #[yaserde(text = true)]
    content: String,
}

#[derive(Default)]
pub struct LogoutRequestBuilder {
    id: Option<String>,
    issue_instant: Option<OffsetDateTime>,
    issuer: Option<String>,
    destination: Option<String>,
    name_id: Option<String>,
    name_id_format: Option<String>,
    session_index: Option<String>,
}

impl LogoutRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the NameID, its format and the session index from a login.
    pub fn for_identity(identity: &Identity) -> Self {
        LogoutRequestBuilder {
            name_id: identity.name_id.clone(),
            name_id_format: identity.name_id_format.clone(),
            session_index: identity.session_index.clone(),
            ..Self::default()
        }
    }

    pub fn id(self, id: &str) -> Self {
        LogoutRequestBuilder {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn auto_id(self) -> Self {
        LogoutRequestBuilder {
            id: Some(format!("_id{}", random_string(32))),
            ..self
        }
    }

    /// Compare with `InResponseTo` on the answer.
    pub fn request_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn issue_instant(self, instant: OffsetDateTime) -> Self {
        LogoutRequestBuilder {
            issue_instant: Some(instant),
            ..self
        }
    }

    pub fn issued_now(self) -> Self {
        LogoutRequestBuilder {
            issue_instant: Some(OffsetDateTime::now_utc()),
            ..self
        }
    }

    pub fn issuer(self, issuer: &str) -> Self {
        LogoutRequestBuilder {
            issuer: Some(issuer.into()),
            ..self
        }
    }

    pub fn destination(self, destination: &str) -> Self {
        LogoutRequestBuilder {
            destination: Some(destination.into()),
            ..self
        }
    }

    pub fn name_id(self, name_id: &str, format: Option<&str>) -> Self {
        LogoutRequestBuilder {
            name_id: Some(name_id.into()),
            name_id_format: format.map(str::to_string),
            ..self
        }
    }

    pub fn session_index(self, session_index: &str) -> Self {
        LogoutRequestBuilder {
            session_index: Some(session_index.into()),
            ..self
        }
    }

    pub fn build(self) -> Result<String, ConfigError> {
        let issue_instant = self
            .issue_instant
            .ok_or(ConfigError::MissingField("issue_instant"))?
            .format(&DATE_TIME_FORMAT)
            .map_err(|e| ConfigError::Serialization(e.to_string()))?;
        let req = LogoutRequest {
            id: self.id.ok_or(ConfigError::MissingField("id"))?,
            version: "2.0".to_string(),
            issue_instant,
            destination: self.destination.ok_or(ConfigError::MissingField("destination"))?,
            issuer: Issuer::entity(self.issuer.ok_or(ConfigError::MissingField("issuer"))?),
            name_id: NameId {
                format: self.name_id_format,
                content: self.name_id.ok_or(ConfigError::MissingField("name_id"))?,
            },
            session_index: self.session_index,
        };
        yaserde::ser::to_string(&req).map_err(ConfigError::Serialization)
    }

    /// `SAMLRequest` value for the HTTP-Redirect binding.
    pub fn build_and_encode(self) -> Result<String, ConfigError> {
        Ok(deflate_and_encode(&self.build()?))
    }

    /// The IdP single logout URL to send the browser to.
    pub fn redirect_url(
        self,
        slo_url: &str,
        relay_state: Option<&str>,
    ) -> Result<String, ConfigError> {
        let request = self.build_and_encode()?;
        redirect_url(slo_url, "SAMLRequest", &request, relay_state)
    }
}

/// A `samlp:LogoutResponse` whose status was Success.
///
/// Nothing here is signature-checked; it only tells the SP that the IdP
/// finished its side of the logout.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct LogoutResponse {
    pub id: String,
    pub in_response_to: Option<String>,
    pub issuer: Option<String>,
    pub destination: Option<String>,
}

/// Decodes a `SAMLResponse` value that arrived on the given binding and checks
/// its status. A non-Success status is `UnsuccessfulStatus`.
pub fn parse_logout_response(
    input: &str,
    binding: ProtocolBinding,
) -> Result<LogoutResponse, SamlError> {
    if input.trim().is_empty() {
        return Err(malformed("empty SAMLResponse"));
    }
    let xml = match binding {
        ProtocolBinding::Redirect => decode_and_inflate(input)?,
        ProtocolBinding::Post => {
            decode_xml_base64(input).map_err(|e| malformed(format!("bad base64: {e}")))?
        }
    };
    let document = Document::parse(&xml)?;
    let root = &document.root;

    if !root.is(NS_PROTOCOL, "LogoutResponse") {
        return Err(malformed(format!(
            "expected samlp:LogoutResponse, found {}",
            root.qualified_name()
        )));
    }
    check_version(root)?;
    check_status(root)?;

    let response = LogoutResponse {
        id: required_attribute(root, "ID")?.to_string(),
        in_response_to: root.attribute("InResponseTo").map(str::to_string),
        issuer: optional_child(root, NS_ASSERTION, "Issuer")?
            .map(|issuer| issuer.text().trim().to_string()),
        destination: root.attribute("Destination").map(str::to_string),
    };
    debug!(response_id = %response.id, "parsed SAML logout response");
    Ok(response)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use base64::{prelude::BASE64_STANDARD, Engine};
    use time::macros::datetime;
    use url::Url;

    use super::*;
    use crate::{
        testutil::ResponseTemplate, FailureKind, NAME_ID_FORMAT_EMAIL_ADDRESS, STATUS_SUCCESS,
    };

    fn identity() -> Identity {
        Identity {
            username: "alice".into(),
            issuer: "https://idp.example.com".into(),
            name_id: Some("alice@example.com".into()),
            name_id_format: Some(NAME_ID_FORMAT_EMAIL_ADDRESS.into()),
            session_index: Some("_session-9".into()),
            attributes: BTreeMap::new(),
        }
    }

    fn builder() -> LogoutRequestBuilder {
        LogoutRequestBuilder::for_identity(&identity())
            .id("_logout-1")
            .issue_instant(datetime!(2026-01-15 11:00:00 UTC))
            .issuer("https://sp.example.com")
            .destination("https://idp.example.com/slo")
    }

    fn logout_response(status: &str) -> String {
        format!(
            "<samlp:LogoutResponse xmlns:samlp=\"{NS_PROTOCOL}\" xmlns:saml=\"{NS_ASSERTION}\" \
             ID=\"_lr-1\" InResponseTo=\"_logout-1\" Version=\"2.0\" \
             IssueInstant=\"2026-01-15T11:00:01Z\" Destination=\"https://sp.example.com/saml/slo\">\
             <saml:Issuer>https://idp.example.com</saml:Issuer>\
             <samlp:Status><samlp:StatusCode Value=\"{status}\"/></samlp:Status>\
             </samlp:LogoutResponse>"
        )
    }

    #[test]
    fn can_build_logout_request_for_a_login() {
        let xml = builder().build().unwrap();
        let document = Document::parse(xml.as_bytes()).unwrap();
        let root = &document.root;

        assert!(root.is(NS_PROTOCOL, "LogoutRequest"));
        assert_eq!(root.attribute("ID"), Some("_logout-1"));
        assert_eq!(root.attribute("IssueInstant"), Some("2026-01-15T11:00:00Z"));
        assert_eq!(root.attribute("Destination"), Some("https://idp.example.com/slo"));
        let name_id = root.first_child(NS_ASSERTION, "NameID").unwrap();
        assert_eq!(name_id.text(), "alice@example.com");
        assert_eq!(name_id.attribute("Format"), Some(NAME_ID_FORMAT_EMAIL_ADDRESS));
        assert_eq!(
            root.first_child(NS_PROTOCOL, "SessionIndex").map(|index| index.text()),
            Some("_session-9".to_string())
        );
    }

    #[test]
    fn logins_without_name_id_cannot_log_out() {
        let identity = Identity {
            name_id: None,
            ..identity()
        };
        let builder = LogoutRequestBuilder::for_identity(&identity)
            .auto_id()
            .issued_now()
            .issuer("https://sp.example.com")
            .destination("https://idp.example.com/slo");
        assert!(builder.request_id().is_some_and(|id| id.starts_with("_id")));
        assert!(matches!(builder.build(), Err(ConfigError::MissingField("name_id"))));
    }

    #[test]
    fn redirect_url_carries_request_and_relay_state() {
        let url = builder()
            .redirect_url("https://idp.example.com/slo", Some("/goodbye"))
            .unwrap();
        let url = Url::parse(&url).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();

        assert_eq!(pairs[0].0, "SAMLRequest");
        let xml = decode_and_inflate(&pairs[0].1).unwrap();
        let document = Document::parse(&xml).unwrap();
        assert_eq!(document.root.attribute("ID"), Some("_logout-1"));
        assert_eq!(pairs[1], ("RelayState".to_string(), "/goodbye".to_string()));
    }

    #[test]
    fn reads_successful_logout_responses_on_both_bindings() {
        let xml = logout_response(STATUS_SUCCESS);

        let redirected = deflate_and_encode(&xml);
        let response = parse_logout_response(&redirected, ProtocolBinding::Redirect).unwrap();
        assert_eq!(response.id, "_lr-1");
        assert_eq!(response.in_response_to.as_deref(), Some("_logout-1"));
        assert_eq!(response.issuer.as_deref(), Some("https://idp.example.com"));

        let posted = BASE64_STANDARD.encode(&xml);
        assert_eq!(parse_logout_response(&posted, ProtocolBinding::Post).unwrap(), response);
    }

    #[test]
    fn surfaces_failed_logouts() {
        let xml = logout_response("urn:oasis:names:tc:SAML:2.0:status:Responder");
        let error = parse_logout_response(&deflate_and_encode(&xml), ProtocolBinding::Redirect)
            .unwrap_err();
        assert_eq!(error.kind(), FailureKind::UnsuccessfulStatus);
    }

    #[test]
    fn rejects_other_messages() {
        let login = BASE64_STANDARD.encode(ResponseTemplate::default().build());
        assert_eq!(
            parse_logout_response(&login, ProtocolBinding::Post).unwrap_err().kind(),
            FailureKind::MalformedAssertion
        );
        assert!(parse_logout_response("", ProtocolBinding::Redirect).is_err());
        // Not DEFLATE-compressed.
        let plain = BASE64_STANDARD.encode(logout_response(STATUS_SUCCESS));
        assert!(parse_logout_response(&plain, ProtocolBinding::Redirect).is_err());
    }
}
