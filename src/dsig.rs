//! Enveloped XML-DSig verification for SAML messages.
//!
//! Only the shape SAML uses is accepted: the `Signature` is a direct child of
//! the element it signs and holds exactly one `Reference` to that element's
//! `ID`. Keys embedded in `KeyInfo` are ignored; the signature must verify
//! against one of the caller's trusted certificates.

use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::debug;

use crate::{
    c14n::{canonicalize_element, CanonicalizationMethod},
    certificate::{SignatureAlgorithm, TrustedCertificate},
    utils::decode_xml_base64,
    xml::{Document, Element},
    SamlError, NS_DSIG,
};

const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
const NS_EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            "http://www.w3.org/2000/09/xmldsig#sha1" => Some(Self::Sha1),
            "http://www.w3.org/2001/04/xmlenc#sha256" => Some(Self::Sha256),
            "http://www.w3.org/2001/04/xmldsig-more#sha384" => Some(Self::Sha384),
            "http://www.w3.org/2001/04/xmlenc#sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

fn invalid(detail: impl Into<String>) -> SamlError {
    SamlError::SignatureInvalid(detail.into())
}

fn required_child<'a>(parent: &'a Element, name: &str) -> Result<&'a Element, SamlError> {
    let mut matches = parent.children_named(NS_DSIG, name);
    let child = matches
        .next()
        .ok_or_else(|| invalid(format!("missing ds:{name}")))?;
    if matches.next().is_some() {
        return Err(invalid(format!("repeated ds:{name}")));
    }
    Ok(child)
}

fn algorithm(element: &Element) -> Result<&str, SamlError> {
    element
        .attribute("Algorithm")
        .ok_or_else(|| invalid(format!("ds:{} without Algorithm", element.name)))
}

fn canonicalization_method(element: &Element) -> Result<CanonicalizationMethod, SamlError> {
    let uri = algorithm(element)?;
    let method = CanonicalizationMethod::from_uri(uri)
        .ok_or_else(|| invalid(format!("unsupported canonicalization {uri}")))?;
    Ok(
        match element
            .first_child(NS_EXC_C14N, "InclusiveNamespaces")
            .and_then(|inclusive| inclusive.attribute("PrefixList"))
        {
            Some(prefix_list) => method.with_inclusive_prefixes(prefix_list),
            None => method,
        },
    )
}

/// Returns whether `signed` carries its own `ds:Signature` child.
pub fn has_signature(signed: &Element) -> bool {
    signed.first_child(NS_DSIG, "Signature").is_some()
}

/// Verifies the enveloped signature of `signed`, which must live in
/// `document`. Returns the index of the certificate that validated it.
pub fn verify_signature(
    document: &Document,
    signed: &Element,
    certificates: &[TrustedCertificate],
) -> Result<usize, SamlError> {
    let signature = {
        let mut signatures = signed.children_named(NS_DSIG, "Signature");
        let signature = signatures.next().ok_or(SamlError::SignatureAbsent)?;
        if signatures.next().is_some() {
            return Err(invalid("more than one signature on the element"));
        }
        signature
    };

    let signed_info = required_child(signature, "SignedInfo")?;
    let c14n_method =
        canonicalization_method(required_child(signed_info, "CanonicalizationMethod")?)?;
    let signature_uri = algorithm(required_child(signed_info, "SignatureMethod")?)?;
    let signature_algorithm = SignatureAlgorithm::from_uri(signature_uri)
        .ok_or_else(|| invalid(format!("unsupported signature method {signature_uri}")))?;

    let reference = required_child(signed_info, "Reference")?;
    check_reference_target(document, signed, reference)?;
    verify_digest(signed, signature, reference)?;

    let canonical_signed_info = canonicalize_element(signed_info, &c14n_method, None);
    let signature_value = decode_xml_base64(&required_child(signature, "SignatureValue")?.text())
        .map_err(|e| invalid(format!("bad SignatureValue encoding: {e}")))?;

    let index = certificates
        .iter()
        .position(|cert| {
            cert.verify(
                signature_algorithm,
                canonical_signed_info.as_bytes(),
                &signature_value,
            )
        })
        .ok_or_else(|| invalid("no trusted certificate validates the signature"))?;
    debug!(
        element = %signed.qualified_name(),
        certificate = %certificates[index].fingerprint(),
        "XML signature verified"
    );
    Ok(index)
}

fn check_reference_target(
    document: &Document,
    signed: &Element,
    reference: &Element,
) -> Result<(), SamlError> {
    let id = signed
        .attribute("ID")
        .ok_or_else(|| invalid("signed element has no ID"))?;
    let uri = reference.attribute("URI").unwrap_or_default();
    if uri.strip_prefix('#') != Some(id) {
        return Err(invalid(format!(
            "reference {uri:?} does not point at the signed element {id:?}"
        )));
    }
    // Duplicate IDs are how signature-wrapping attacks hide a second element.
    let targets = document.elements_with_id(id);
    if targets.len() != 1 || !std::ptr::eq(targets[0], signed) {
        return Err(invalid(format!("ID {id:?} is not unique in the document")));
    }
    Ok(())
}

fn verify_digest(
    signed: &Element,
    signature: &Element,
    reference: &Element,
) -> Result<(), SamlError> {
    let mut enveloped = false;
    let mut method = None;
    if let Some(transforms) = reference.first_child(NS_DSIG, "Transforms") {
        for transform in transforms.children_named(NS_DSIG, "Transform") {
            let uri = algorithm(transform)?;
            if uri == ENVELOPED_SIGNATURE {
                enveloped = true;
            } else if method.is_none() {
                method = Some(canonicalization_method(transform)?);
            } else {
                return Err(invalid(format!("unexpected transform {uri}")));
            }
        }
    }
    if !enveloped {
        return Err(invalid("reference lacks the enveloped-signature transform"));
    }
    let method = method
        .unwrap_or(CanonicalizationMethod::Inclusive {
            with_comments: false,
        })
        .without_comments();

    let digest_uri = algorithm(required_child(reference, "DigestMethod")?)?;
    let digest_algorithm = DigestAlgorithm::from_uri(digest_uri)
        .ok_or_else(|| invalid(format!("unsupported digest method {digest_uri}")))?;
    let expected = decode_xml_base64(&required_child(reference, "DigestValue")?.text())
        .map_err(|e| invalid(format!("bad DigestValue encoding: {e}")))?;

    let canonical = canonicalize_element(signed, &method, Some(signature));
    let actual = digest_algorithm.digest(canonical.as_bytes());
    if actual != expected {
        return Err(invalid(format!(
            "digest mismatch for {}",
            signed.qualified_name()
        )));
    }
    Ok(())
}
