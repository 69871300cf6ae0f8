use std::collections::HashMap;

use crate::{
    authn_request::ProtocolBinding, certificate::TrustedCertificate, xml::Document, ConfigError,
    NS_DSIG, NS_METADATA,
};

#[derive(Debug)]
#[non_exhaustive]
pub struct IdpMetadata {
    pub entity_id: String,
    /// Every key usable for signing, in document order. Keys without a `use`
    /// attribute count as signing keys.
    pub signing_certificates: Vec<TrustedCertificate>,
    pub sso_bindings: HashMap<ProtocolBinding, String>,
    pub name_id_formats: Vec<String>,
}

fn invalid(detail: impl Into<String>) -> ConfigError {
    ConfigError::InvalidMetadata(detail.into())
}

pub fn parse_idp_metadata(input: &[u8]) -> Result<IdpMetadata, ConfigError> {
    let document = Document::parse(input).map_err(|e| invalid(e.to_string()))?;
    let root = &document.root;
    if !root.is(NS_METADATA, "EntityDescriptor") {
        return Err(invalid(format!(
            "expected md:EntityDescriptor, found {}",
            root.qualified_name()
        )));
    }

    let entity_id = root
        .attribute("entityID")
        .ok_or_else(|| invalid("EntityDescriptor lacks entityID"))?
        .to_string();
    let descriptor = root
        .first_child(NS_METADATA, "IDPSSODescriptor")
        .ok_or_else(|| invalid("no IDPSSODescriptor"))?;

    let mut signing_certificates = Vec::new();
    for key in descriptor.children_named(NS_METADATA, "KeyDescriptor") {
        if !matches!(key.attribute("use"), None | Some("signing")) {
            continue;
        }
        let encoded = key
            .first_child(NS_DSIG, "KeyInfo")
            .and_then(|info| info.first_child(NS_DSIG, "X509Data"))
            .and_then(|data| data.first_child(NS_DSIG, "X509Certificate"))
            .map(|cert| cert.text())
            .ok_or_else(|| invalid("KeyDescriptor without an X509Certificate"))?;
        signing_certificates.push(TrustedCertificate::from_pem(&encoded)?);
    }
    if signing_certificates.is_empty() {
        return Err(invalid("no signing certificate"));
    }

    let mut sso_bindings = HashMap::new();
    for sso_node in descriptor.children_named(NS_METADATA, "SingleSignOnService") {
        let binding = sso_node
            .attribute("Binding")
            .ok_or_else(|| invalid("SingleSignOnService lacks Binding"))?;
        // Bindings the SP cannot speak (SOAP, Artifact) are skipped.
        if let Ok(binding) = binding.parse::<ProtocolBinding>() {
            let location = sso_node
                .attribute("Location")
                .ok_or_else(|| invalid("SingleSignOnService lacks Location"))?;
            sso_bindings.insert(binding, location.to_string());
        }
    }

    let name_id_formats = descriptor
        .children_named(NS_METADATA, "NameIDFormat")
        .map(|format| format.text().trim().to_string())
        .collect();

    Ok(IdpMetadata {
        entity_id,
        signing_certificates,
        sso_bindings,
        name_id_formats,
    })
}
