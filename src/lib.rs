//! SAML 2.0 Service Provider assertion consumer.
//!
//! The engine takes a POSTed `SAMLResponse`, verifies its XML signature
//! against the IdP's trusted certificates, validates the assertion, maps its
//! attributes to an [`Identity`] and reports an [`AcsOutcome`] back to the
//! session layer. HTTP routing, sessions and configuration loading stay with
//! the caller.

use std::fmt;

use thiserror::Error;
use time::{
    format_description::well_known::iso8601::{self, TimePrecision},
    OffsetDateTime,
};

mod assertion;
mod authn_request;
mod c14n;
mod certificate;
mod config;
mod dsig;
mod engine;
mod idp_metadata;
mod logout;
mod mapper;
mod outcome;
mod replay;
mod response;
mod sp_metadata;
mod utils;
mod validator;
mod xml;

#[cfg(test)]
mod testutil;

pub use assertion::{
    AuthnStatement, Conditions, NameId, ParsedAssertion, SamlAttribute, Subject,
    SubjectConfirmation, SubjectConfirmationData,
};
pub use authn_request::{AuthnRequestBuilder, ProtocolBinding};
pub use c14n::{canonicalize_document, canonicalize_element, CanonicalizationMethod};
pub use certificate::TrustedCertificate;
pub use config::{
    EngineSettings, IdpSettings, MetadataProvider, StaticMetadataProvider, TrustedIdpConfig,
};
pub use dsig::verify_signature;
pub use engine::ServiceProvider;
pub use idp_metadata::{parse_idp_metadata, IdpMetadata};
pub use logout::{parse_logout_response, LogoutRequestBuilder, LogoutResponse};
pub use mapper::{AttributeMapper, Identity, UsernameSource};
pub use outcome::{AcsOutcome, Stage};
pub use replay::{InMemoryReplayCache, PrunerHandle, ReplayStore};
pub use response::{decode_response, parse_response, ParsedResponse, RawResponse};
pub use sp_metadata::SpMetadataBuilder;
pub use validator::{AssertionValidator, ValidationPolicy};
pub use xml::{Document, Element, Node};

pub const NS_ASSERTION: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const NS_PROTOCOL: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const NS_METADATA: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
pub const NS_DSIG: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const NS_XSI: &str = "http://www.w3.org/2001/XMLSchema-instance";

pub const NAME_ID_FORMAT_EMAIL_ADDRESS: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";
pub const NAME_ID_FORMAT_UNSPECIFIED: &str =
    "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";
pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
pub const CONFIRMATION_METHOD_BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";

// xs:dateTime isn't actually ISO8601, because implementors often don't support higher precisions.
pub const DATE_TIME_FORMAT: iso8601::Iso8601<
    {
        iso8601::Config::DEFAULT
            .set_year_is_six_digits(false)
            .set_time_precision(TimePrecision::Second {
                decimal_digits: None,
            })
            .encode()
    },
> = iso8601::Iso8601;

/// Why a SAML response was rejected.
///
/// This is what the session layer sees; the detail lives in [`SamlError`] and
/// only reaches the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    MalformedAssertion,
    SignatureAbsent,
    SignatureInvalid,
    IssuerMismatch,
    AssertionExpired,
    AssertionNotYetValid,
    AudienceMismatch,
    ReplayDetected,
    UsernameUnresolvable,
    DestinationMismatch,
    UnsuccessfulStatus,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MalformedAssertion => "malformed_assertion",
            Self::SignatureAbsent => "signature_absent",
            Self::SignatureInvalid => "signature_invalid",
            Self::IssuerMismatch => "issuer_mismatch",
            Self::AssertionExpired => "assertion_expired",
            Self::AssertionNotYetValid => "assertion_not_yet_valid",
            Self::AudienceMismatch => "audience_mismatch",
            Self::ReplayDetected => "replay_detected",
            Self::UsernameUnresolvable => "username_unresolvable",
            Self::DestinationMismatch => "destination_mismatch",
            Self::UnsuccessfulStatus => "unsuccessful_status",
        };
        f.write_str(name)
    }
}

/// A request-level rejection with the detail needed for server-side logs.
#[derive(Debug, Error)]
pub enum SamlError {
    #[error("malformed SAML response: {0}")]
    MalformedAssertion(String),
    #[error("required signature is absent")]
    SignatureAbsent,
    #[error("signature is invalid: {0}")]
    SignatureInvalid(String),
    #[error("issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch { expected: String, actual: String },
    #[error("assertion expired at {not_on_or_after}")]
    AssertionExpired { not_on_or_after: OffsetDateTime },
    #[error("assertion not valid before {not_before}")]
    AssertionNotYetValid { not_before: OffsetDateTime },
    #[error("audience mismatch: {expected} not in {audiences:?}")]
    AudienceMismatch {
        expected: String,
        audiences: Vec<String>,
    },
    #[error("assertion {id} has already been consumed")]
    ReplayDetected { id: String },
    #[error("username source {source_name} yielded no value")]
    UsernameUnresolvable { source_name: String },
    #[error("destination mismatch: expected {expected}, got {actual}")]
    DestinationMismatch { expected: String, actual: String },
    #[error("IdP returned status {status}")]
    UnsuccessfulStatus {
        status: String,
        message: Option<String>,
    },
}

impl SamlError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::MalformedAssertion(_) => FailureKind::MalformedAssertion,
            Self::SignatureAbsent => FailureKind::SignatureAbsent,
            Self::SignatureInvalid(_) => FailureKind::SignatureInvalid,
            Self::IssuerMismatch { .. } => FailureKind::IssuerMismatch,
            Self::AssertionExpired { .. } => FailureKind::AssertionExpired,
            Self::AssertionNotYetValid { .. } => FailureKind::AssertionNotYetValid,
            Self::AudienceMismatch { .. } => FailureKind::AudienceMismatch,
            Self::ReplayDetected { .. } => FailureKind::ReplayDetected,
            Self::UsernameUnresolvable { .. } => FailureKind::UsernameUnresolvable,
            Self::DestinationMismatch { .. } => FailureKind::DestinationMismatch,
            Self::UnsuccessfulStatus { .. } => FailureKind::UnsuccessfulStatus,
        }
    }
}

/// Problems found while building the engine's configuration, metadata or
/// outbound messages.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error("unknown username source {0:?}")]
    InvalidUsernameSource(String),
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("XML serialization failed: {0}")]
    Serialization(String),
    #[error("invalid {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}
