//! Fixtures and a response minter for unit tests.
//!
//! `ResponseTemplate` writes XML that is already in exclusive canonical form,
//! so digests and signatures are computed straight from the literal text and
//! never depend on the canonicalizer under test.

use base64::{prelude::BASE64_STANDARD, Engine};
use rsa::{pkcs8::DecodePrivateKey, Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256};
use time::{macros::datetime, OffsetDateTime};

use crate::{NS_ASSERTION, NS_DSIG, NS_PROTOCOL};

pub const IDP_CERT_PEM: &str = include_str!("../static/idp.cert");
pub const ROTATED_CERT_PEM: &str = include_str!("../static/rotated.cert");
pub const IDP_KEY_PEM: &str = include_str!("../static/idp.key");
pub const SIGNED_RESPONSE: &[u8] = include_bytes!("../static/signed_response.xml");
pub const IDP_METADATA: &[u8] = include_bytes!("../static/idp_metadata.xml");

pub const IDP_ENTITY_ID: &str = "https://idp.example.com";
pub const SP_ENTITY_ID: &str = "https://sp.example.com";
pub const ACS_URL: &str = "https://sp.example.com/saml/acs";

/// Inside the default template's validity window.
pub const NOW: OffsetDateTime = datetime!(2026-01-15 10:01:00 UTC);

pub fn sign(message: &[u8]) -> Vec<u8> {
    let key = RsaPrivateKey::from_pkcs8_pem(IDP_KEY_PEM).unwrap();
    key.sign(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(message))
        .unwrap()
}

// Canonical escaping: text and attribute values differ on `>` and `"`.
fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('"', "&quot;")
}

fn signature_for(id: &str, canonical: &str) -> String {
    let digest = BASE64_STANDARD.encode(Sha256::digest(canonical.as_bytes()));
    let inner = format!(
        "<ds:CanonicalizationMethod Algorithm=\"http://www.w3.org/2001/10/xml-exc-c14n#\"></ds:CanonicalizationMethod>\
         <ds:SignatureMethod Algorithm=\"http://www.w3.org/2001/04/xmldsig-more#rsa-sha256\"></ds:SignatureMethod>\
         <ds:Reference URI=\"#{id}\">\
         <ds:Transforms>\
         <ds:Transform Algorithm=\"http://www.w3.org/2000/09/xmldsig#enveloped-signature\"></ds:Transform>\
         <ds:Transform Algorithm=\"http://www.w3.org/2001/10/xml-exc-c14n#\"></ds:Transform>\
         </ds:Transforms>\
         <ds:DigestMethod Algorithm=\"http://www.w3.org/2001/04/xmlenc#sha256\"></ds:DigestMethod>\
         <ds:DigestValue>{digest}</ds:DigestValue>\
         </ds:Reference>"
    );
    let canonical_signed_info =
        format!("<ds:SignedInfo xmlns:ds=\"{NS_DSIG}\">{inner}</ds:SignedInfo>");
    let value = BASE64_STANDARD.encode(sign(canonical_signed_info.as_bytes()));
    format!(
        "<ds:Signature xmlns:ds=\"{NS_DSIG}\"><ds:SignedInfo>{inner}</ds:SignedInfo>\
         <ds:SignatureValue>{value}</ds:SignatureValue></ds:Signature>"
    )
}

#[derive(Debug, Clone)]
pub struct ResponseTemplate {
    response_id: String,
    assertion_id: String,
    issuer: String,
    /// `None` leaves the Response without an Issuer.
    response_issuer: Option<String>,
    name_id: Option<String>,
    audiences: Vec<String>,
    not_before: Option<String>,
    not_on_or_after: Option<String>,
    destination: Option<String>,
    recipient: String,
    attributes: Vec<(String, Vec<String>)>,
    sign_assertion: bool,
    sign_response: bool,
}

impl Default for ResponseTemplate {
    fn default() -> Self {
        Self {
            response_id: "_resp-1".into(),
            assertion_id: "_assert-1".into(),
            issuer: IDP_ENTITY_ID.into(),
            response_issuer: Some(IDP_ENTITY_ID.into()),
            name_id: Some("alice".into()),
            audiences: vec![SP_ENTITY_ID.into()],
            not_before: Some("2026-01-15T09:59:00Z".into()),
            not_on_or_after: Some("2026-01-15T10:05:00Z".into()),
            destination: Some(ACS_URL.into()),
            recipient: ACS_URL.into(),
            attributes: vec![("mail".into(), vec!["alice@example.com".into()])],
            sign_assertion: false,
            sign_response: false,
        }
    }
}

impl ResponseTemplate {
    pub fn assertion_id(mut self, id: &str) -> Self {
        self.assertion_id = id.into();
        self
    }

    /// Sets the issuer of both the assertion and the Response.
    pub fn issuer(mut self, issuer: &str) -> Self {
        self.issuer = issuer.into();
        self.response_issuer = Some(issuer.into());
        self
    }

    pub fn response_issuer(mut self, issuer: Option<&str>) -> Self {
        self.response_issuer = issuer.map(str::to_string);
        self
    }

    pub fn name_id(mut self, name_id: Option<&str>) -> Self {
        self.name_id = name_id.map(str::to_string);
        self
    }

    pub fn audiences(mut self, audiences: &[&str]) -> Self {
        self.audiences = audiences.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn not_before(mut self, instant: Option<&str>) -> Self {
        self.not_before = instant.map(str::to_string);
        self
    }

    pub fn not_on_or_after(mut self, instant: Option<&str>) -> Self {
        self.not_on_or_after = instant.map(str::to_string);
        self
    }

    pub fn destination(mut self, destination: Option<&str>) -> Self {
        self.destination = destination.map(str::to_string);
        self
    }

    pub fn recipient(mut self, recipient: &str) -> Self {
        self.recipient = recipient.into();
        self
    }

    pub fn attribute(mut self, name: &str, values: &[&str]) -> Self {
        self.attributes
            .push((name.into(), values.iter().map(|v| v.to_string()).collect()));
        self
    }

    pub fn sign_assertion(mut self) -> Self {
        self.sign_assertion = true;
        self
    }

    pub fn sign_response(mut self) -> Self {
        self.sign_response = true;
        self
    }

    fn assertion(&self, signature: &str) -> String {
        let mut xml = format!(
            "<saml:Assertion xmlns:saml=\"{NS_ASSERTION}\" ID=\"{}\" IssueInstant=\"2026-01-15T10:00:00Z\" Version=\"2.0\">\
             <saml:Issuer>{}</saml:Issuer>{signature}<saml:Subject>",
            self.assertion_id,
            escape(&self.issuer)
        );
        if let Some(name_id) = &self.name_id {
            xml.push_str(&format!(
                "<saml:NameID Format=\"urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified\">{}</saml:NameID>",
                escape(name_id)
            ));
        }
        xml.push_str("<saml:SubjectConfirmation Method=\"urn:oasis:names:tc:SAML:2.0:cm:bearer\"><saml:SubjectConfirmationData");
        if let Some(not_on_or_after) = &self.not_on_or_after {
            xml.push_str(&format!(" NotOnOrAfter=\"{not_on_or_after}\""));
        }
        xml.push_str(&format!(
            " Recipient=\"{}\"></saml:SubjectConfirmationData></saml:SubjectConfirmation></saml:Subject><saml:Conditions",
            escape_attr(&self.recipient)
        ));
        if let Some(not_before) = &self.not_before {
            xml.push_str(&format!(" NotBefore=\"{not_before}\""));
        }
        if let Some(not_on_or_after) = &self.not_on_or_after {
            xml.push_str(&format!(" NotOnOrAfter=\"{not_on_or_after}\""));
        }
        xml.push('>');
        if !self.audiences.is_empty() {
            xml.push_str("<saml:AudienceRestriction>");
            for audience in &self.audiences {
                xml.push_str(&format!("<saml:Audience>{}</saml:Audience>", escape(audience)));
            }
            xml.push_str("</saml:AudienceRestriction>");
        }
        xml.push_str(&format!(
            "</saml:Conditions><saml:AuthnStatement AuthnInstant=\"2026-01-15T10:00:00Z\" SessionIndex=\"_session{}\">\
             <saml:AuthnContext><saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport</saml:AuthnContextClassRef></saml:AuthnContext>\
             </saml:AuthnStatement>",
            self.assertion_id
        ));
        if !self.attributes.is_empty() {
            xml.push_str("<saml:AttributeStatement>");
            for (name, values) in &self.attributes {
                xml.push_str(&format!("<saml:Attribute Name=\"{}\">", escape_attr(name)));
                for value in values {
                    xml.push_str(&format!(
                        "<saml:AttributeValue>{}</saml:AttributeValue>",
                        escape(value)
                    ));
                }
                xml.push_str("</saml:Attribute>");
            }
            xml.push_str("</saml:AttributeStatement>");
        }
        xml.push_str("</saml:Assertion>");
        xml
    }

    fn response(&self, assertion: &str, signature: &str) -> String {
        let destination = self
            .destination
            .as_ref()
            .map(|d| format!(" Destination=\"{}\"", escape_attr(d)))
            .unwrap_or_default();
        let issuer = self
            .response_issuer
            .as_ref()
            .map(|issuer| {
                format!(
                    "<saml:Issuer xmlns:saml=\"{NS_ASSERTION}\">{}</saml:Issuer>",
                    escape(issuer)
                )
            })
            .unwrap_or_default();
        format!(
            "<samlp:Response xmlns:samlp=\"{NS_PROTOCOL}\"{destination} ID=\"{}\" IssueInstant=\"2026-01-15T10:00:00Z\" Version=\"2.0\">\
             {issuer}{signature}\
             <samlp:Status><samlp:StatusCode Value=\"urn:oasis:names:tc:SAML:2.0:status:Success\"></samlp:StatusCode></samlp:Status>\
             {assertion}</samlp:Response>",
            self.response_id,
        )
    }

    pub fn build(&self) -> String {
        let assertion = if self.sign_assertion {
            let signature = signature_for(&self.assertion_id, &self.assertion(""));
            self.assertion(&signature)
        } else {
            self.assertion("")
        };
        if self.sign_response {
            let signature = signature_for(&self.response_id, &self.response(&assertion, ""));
            self.response(&assertion, &signature)
        } else {
            self.response(&assertion, "")
        }
    }

    /// The `SAMLResponse` form value.
    pub fn encoded(&self) -> String {
        BASE64_STANDARD.encode(self.build())
    }
}
