use tracing::debug;
use url::form_urlencoded;

use crate::{
    assertion::{
        AuthnStatement, Conditions, NameId, ParsedAssertion, SamlAttribute, Subject,
        SubjectConfirmation, SubjectConfirmationData,
    },
    utils::{decode_xml_base64, parse_instant},
    xml::{Document, Element},
    SamlError, NS_ASSERTION, NS_PROTOCOL, NS_XSI, STATUS_SUCCESS,
};

/// What the HTTP layer received on the ACS endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    /// Base64 `SAMLResponse` form value.
    pub saml_response: String,
    pub relay_state: Option<String>,
}

impl RawResponse {
    pub fn new(saml_response: impl Into<String>, relay_state: Option<String>) -> Self {
        Self {
            saml_response: saml_response.into(),
            relay_state,
        }
    }

    /// Reads an `application/x-www-form-urlencoded` HTTP-POST binding body.
    /// A missing `SAMLResponse` is left empty so that the failure still
    /// travels with the relay state.
    pub fn from_form(body: &str) -> Self {
        let mut raw = Self::default();
        for (key, value) in form_urlencoded::parse(body.as_bytes()) {
            match key.as_ref() {
                "SAMLResponse" => raw.saml_response = value.into_owned(),
                "RelayState" => raw.relay_state = Some(value.into_owned()),
                _ => {}
            }
        }
        raw
    }
}

/// A decoded `samlp:Response` holding exactly one assertion.
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    document: Document,
    pub id: String,
    pub destination: Option<String>,
    pub in_response_to: Option<String>,
    pub issuer: Option<String>,
    pub assertion: ParsedAssertion,
}

impl ParsedResponse {
    pub(crate) fn document(&self) -> &Document {
        &self.document
    }

    pub(crate) fn response_element(&self) -> &Element {
        &self.document.root
    }

    pub(crate) fn assertion_element(&self) -> Option<&Element> {
        self.document.root.first_child(NS_ASSERTION, "Assertion")
    }
}

pub fn decode_response(input: &str) -> Result<Vec<u8>, SamlError> {
    if input.trim().is_empty() {
        return Err(malformed("empty SAMLResponse"));
    }
    decode_xml_base64(input).map_err(|e| malformed(format!("bad base64: {e}")))
}

/// Decodes and parses a Base64 `SAMLResponse`. Nothing is verified here.
pub fn parse_response(input: &str) -> Result<ParsedResponse, SamlError> {
    let xml = decode_response(input)?;
    let document = Document::parse(&xml)?;
    let root = &document.root;

    if !root.is(NS_PROTOCOL, "Response") {
        return Err(malformed(format!(
            "expected samlp:Response, found {}",
            root.qualified_name()
        )));
    }
    check_version(root)?;
    check_status(root)?;

    if root.first_child(NS_ASSERTION, "EncryptedAssertion").is_some() {
        return Err(malformed("encrypted assertions are not supported"));
    }
    let assertion = single_child(root, NS_ASSERTION, "Assertion")?;
    let assertion = parse_assertion(assertion)?;

    let issuer = optional_child(root, NS_ASSERTION, "Issuer")?
        .map(|issuer| issuer.text().trim().to_string());
    let id = required_attribute(root, "ID")?.to_string();
    let destination = root.attribute("Destination").map(str::to_string);
    let in_response_to = root.attribute("InResponseTo").map(str::to_string);

    debug!(response_id = %id, assertion_id = %assertion.id, "parsed SAML response");

    Ok(ParsedResponse {
        document,
        id,
        destination,
        in_response_to,
        issuer,
        assertion,
    })
}

pub(crate) fn malformed(detail: impl Into<String>) -> SamlError {
    SamlError::MalformedAssertion(detail.into())
}

pub(crate) fn required_attribute<'a>(
    element: &'a Element,
    name: &str,
) -> Result<&'a str, SamlError> {
    element
        .attribute(name)
        .ok_or_else(|| malformed(format!("{} lacks {name}", element.qualified_name())))
}

fn optional_instant(
    element: &Element,
    name: &str,
) -> Result<Option<time::OffsetDateTime>, SamlError> {
    element.attribute(name).map(parse_instant).transpose()
}

pub(crate) fn optional_child<'a>(
    parent: &'a Element,
    namespace: &str,
    name: &str,
) -> Result<Option<&'a Element>, SamlError> {
    let mut children = parent.children_named(namespace, name);
    let first = children.next();
    if children.next().is_some() {
        return Err(malformed(format!(
            "{} has more than one {name}",
            parent.qualified_name()
        )));
    }
    Ok(first)
}

pub(crate) fn single_child<'a>(
    parent: &'a Element,
    namespace: &str,
    name: &str,
) -> Result<&'a Element, SamlError> {
    optional_child(parent, namespace, name)?.ok_or_else(|| {
        malformed(format!("{} lacks {name}", parent.qualified_name()))
    })
}

pub(crate) fn check_version(element: &Element) -> Result<(), SamlError> {
    match required_attribute(element, "Version")? {
        "2.0" => Ok(()),
        other => Err(malformed(format!("unsupported SAML version {other}"))),
    }
}

pub(crate) fn check_status(response: &Element) -> Result<(), SamlError> {
    let status = single_child(response, NS_PROTOCOL, "Status")?;
    let code = single_child(status, NS_PROTOCOL, "StatusCode")?;
    let value = required_attribute(code, "Value")?;
    if value == STATUS_SUCCESS {
        return Ok(());
    }

    let status = match code
        .first_child(NS_PROTOCOL, "StatusCode")
        .and_then(|nested| nested.attribute("Value"))
    {
        Some(nested) => format!("{value} ({nested})"),
        None => value.to_string(),
    };
    let message = status_message(response);
    Err(SamlError::UnsuccessfulStatus { status, message })
}

fn status_message(response: &Element) -> Option<String> {
    response
        .first_child(NS_PROTOCOL, "Status")?
        .first_child(NS_PROTOCOL, "StatusMessage")
        .map(|message| message.text().trim().to_string())
}

fn parse_assertion(element: &Element) -> Result<ParsedAssertion, SamlError> {
    check_version(element)?;
    let id = required_attribute(element, "ID")?.to_string();
    let issue_instant = parse_instant(required_attribute(element, "IssueInstant")?)?;

    let issuer = single_child(element, NS_ASSERTION, "Issuer")?.text().trim().to_string();
    if issuer.is_empty() {
        return Err(malformed("assertion issuer is empty"));
    }

    let subject = parse_subject(single_child(element, NS_ASSERTION, "Subject")?)?;
    let conditions = parse_conditions(single_child(element, NS_ASSERTION, "Conditions")?)?;
    let authn_statement = element
        .first_child(NS_ASSERTION, "AuthnStatement")
        .map(parse_authn_statement)
        .transpose()?;

    let mut attributes = Vec::new();
    for statement in element.children_named(NS_ASSERTION, "AttributeStatement") {
        for attribute in statement.children_named(NS_ASSERTION, "Attribute") {
            attributes.push(parse_attribute(attribute)?);
        }
    }

    Ok(ParsedAssertion {
        id,
        issue_instant,
        issuer,
        subject,
        conditions,
        authn_statement,
        attributes,
    })
}

fn parse_subject(element: &Element) -> Result<Subject, SamlError> {
    let name_id = optional_child(element, NS_ASSERTION, "NameID")?.map(|name_id| NameId {
        value: name_id.text().trim().to_string(),
        format: name_id.attribute("Format").map(str::to_string),
        name_qualifier: name_id.attribute("NameQualifier").map(str::to_string),
        sp_name_qualifier: name_id.attribute("SPNameQualifier").map(str::to_string),
    });

    let mut confirmations = Vec::new();
    for confirmation in element.children_named(NS_ASSERTION, "SubjectConfirmation") {
        let data = optional_child(confirmation, NS_ASSERTION, "SubjectConfirmationData")?
            .map(|data| -> Result<_, SamlError> {
                Ok(SubjectConfirmationData {
                    not_before: optional_instant(data, "NotBefore")?,
                    not_on_or_after: optional_instant(data, "NotOnOrAfter")?,
                    recipient: data.attribute("Recipient").map(str::to_string),
                    in_response_to: data.attribute("InResponseTo").map(str::to_string),
                })
            })
            .transpose()?;
        confirmations.push(SubjectConfirmation {
            method: required_attribute(confirmation, "Method")?.to_string(),
            data,
        });
    }

    Ok(Subject {
        name_id,
        confirmations,
    })
}

fn parse_conditions(element: &Element) -> Result<Conditions, SamlError> {
    let audience_restrictions = element
        .children_named(NS_ASSERTION, "AudienceRestriction")
        .map(|restriction| {
            restriction
                .children_named(NS_ASSERTION, "Audience")
                .map(|audience| audience.text().trim().to_string())
                .collect()
        })
        .collect();

    Ok(Conditions {
        not_before: optional_instant(element, "NotBefore")?,
        not_on_or_after: optional_instant(element, "NotOnOrAfter")?,
        audience_restrictions,
        one_time_use: element.first_child(NS_ASSERTION, "OneTimeUse").is_some(),
    })
}

fn parse_authn_statement(element: &Element) -> Result<AuthnStatement, SamlError> {
    Ok(AuthnStatement {
        authn_instant: parse_instant(required_attribute(element, "AuthnInstant")?)?,
        session_index: element.attribute("SessionIndex").map(str::to_string),
        session_not_on_or_after: optional_instant(element, "SessionNotOnOrAfter")?,
        context_class: element
            .first_child(NS_ASSERTION, "AuthnContext")
            .and_then(|context| context.first_child(NS_ASSERTION, "AuthnContextClassRef"))
            .map(|class| class.text().trim().to_string()),
    })
}

fn parse_attribute(element: &Element) -> Result<SamlAttribute, SamlError> {
    let values = element
        .children_named(NS_ASSERTION, "AttributeValue")
        .filter(|value| {
            !matches!(value.attribute_ns(NS_XSI, "nil"), Some("true") | Some("1"))
        })
        // Structured values such as an eduPersonTargetedID NameID have no
        // string form here.
        .filter(|value| value.child_elements().next().is_none())
        .map(Element::text)
        .collect();

    Ok(SamlAttribute {
        name: required_attribute(element, "Name")?.to_string(),
        name_format: element.attribute("NameFormat").map(str::to_string),
        friendly_name: element.attribute("FriendlyName").map(str::to_string),
        values,
    })
}
