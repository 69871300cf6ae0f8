use std::io::Read;

use base64::{prelude::BASE64_STANDARD, Engine};
use deflate::deflate_bytes;
use flate2::read::DeflateDecoder;
use rand::distributions::{Alphanumeric, DistString};
use time::{format_description::well_known::Iso8601, OffsetDateTime};
use url::Url;

use crate::{ConfigError, SamlError};

/// Upper bound on an inflated HTTP-Redirect message.
const MAX_INFLATED_SIZE: u64 = 256 * 1024;

pub fn random_string(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

pub fn decode_xml_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let stripped = input.replace([' ', '\n', '\r', '\t'], "");
    BASE64_STANDARD.decode(stripped)
}

/// HTTP-Redirect binding encoding: raw DEFLATE, then Base64.
pub fn deflate_and_encode(xml: &str) -> String {
    BASE64_STANDARD.encode(deflate_bytes(xml.as_bytes()))
}

/// Reverses [`deflate_and_encode`], refusing output past a fixed size.
pub fn decode_and_inflate(input: &str) -> Result<Vec<u8>, SamlError> {
    let compressed = decode_xml_base64(input)
        .map_err(|e| SamlError::MalformedAssertion(format!("bad base64: {e}")))?;
    let mut xml = Vec::new();
    DeflateDecoder::new(compressed.as_slice())
        .take(MAX_INFLATED_SIZE + 1)
        .read_to_end(&mut xml)
        .map_err(|e| SamlError::MalformedAssertion(format!("bad DEFLATE stream: {e}")))?;
    if xml.len() as u64 > MAX_INFLATED_SIZE {
        return Err(SamlError::MalformedAssertion(
            "inflated message is too large".to_string(),
        ));
    }
    Ok(xml)
}

/// Appends a Redirect-binding message, and the relay state if any, to an IdP
/// endpoint that may already carry a query string.
pub fn redirect_url(
    endpoint: &str,
    parameter: &str,
    encoded: &str,
    relay_state: Option<&str>,
) -> Result<String, ConfigError> {
    let mut url = Url::parse(endpoint).map_err(|e| ConfigError::InvalidUrl {
        url: endpoint.to_string(),
        reason: e.to_string(),
    })?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair(parameter, encoded);
        if let Some(relay_state) = relay_state {
            query.append_pair("RelayState", relay_state);
        }
    }
    Ok(url.into())
}

/// Parses an `xs:dateTime` attribute value.
pub fn parse_instant(value: &str) -> Result<OffsetDateTime, SamlError> {
    OffsetDateTime::parse(value.trim(), &Iso8601::DEFAULT)
        .map_err(|e| SamlError::MalformedAssertion(format!("bad dateTime {value:?}: {e}")))
}

/// Strips the PEM armour from a certificate, if there is any, and decodes it.
pub fn decode_pem_or_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let body: String = input
        .lines()
        .filter(|line| !line.trim_start().starts_with("-----"))
        .collect();
    decode_xml_base64(&body)
}
