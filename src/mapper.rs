use std::{
    collections::{BTreeMap, HashMap},
    fmt::{self, Display},
    str::FromStr,
};

use serde::Serialize;

use crate::{assertion::ParsedAssertion, config::EngineSettings, ConfigError, SamlError};

/// Where the local username comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsernameSource {
    NameId,
    /// A field of the mapped attribute set.
    Attribute(String),
}

impl FromStr for UsernameSource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("nameid") {
            return Ok(Self::NameId);
        }
        if trimmed.eq_ignore_ascii_case("attributes") {
            return Ok(Self::Attribute("username".to_string()));
        }
        match trimmed.split_once(':') {
            Some((keyword, name))
                if keyword.eq_ignore_ascii_case("attribute") && !name.trim().is_empty() =>
            {
                Ok(Self::Attribute(name.trim().to_string()))
            }
            _ => Err(ConfigError::InvalidUsernameSource(s.to_string())),
        }
    }
}

impl Display for UsernameSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UsernameSource::NameId => write!(f, "nameid"),
            UsernameSource::Attribute(name) => write!(f, "attribute:{name}"),
        }
    }
}

/// The authenticated principal handed to the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub username: String,
    pub issuer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_id_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_index: Option<String>,
    pub attributes: BTreeMap<String, Vec<String>>,
}

/// Renames SAML attributes to local field names and picks the username.
#[derive(Debug, Clone)]
pub struct AttributeMapper {
    mapping: HashMap<String, String>,
    username_source: UsernameSource,
}

impl AttributeMapper {
    pub fn new(mapping: HashMap<String, String>, username_source: UsernameSource) -> Self {
        Self {
            mapping,
            username_source,
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Result<Self, ConfigError> {
        Ok(Self::new(
            settings.attribute_mapping.clone(),
            settings.username_source.parse()?,
        ))
    }

    pub fn username_source(&self) -> &UsernameSource {
        &self.username_source
    }

    /// Attribute names are matched exactly. Attributes without a mapping
    /// keep their SAML name; several attributes landing on one field have
    /// their values appended in document order.
    pub fn map_attributes(&self, assertion: &ParsedAssertion) -> BTreeMap<String, Vec<String>> {
        let mut mapped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for attribute in &assertion.attributes {
            let field = self.mapping.get(&attribute.name).unwrap_or(&attribute.name);
            mapped
                .entry(field.clone())
                .or_default()
                .extend(attribute.values.iter().cloned());
        }
        mapped
    }

    pub fn map(&self, assertion: &ParsedAssertion) -> Result<Identity, SamlError> {
        let attributes = self.map_attributes(assertion);
        let name_id = assertion.subject.name_id.as_ref();

        let username = match &self.username_source {
            UsernameSource::NameId => name_id.map(|name_id| name_id.value.trim()),
            UsernameSource::Attribute(field) => attributes
                .get(field)
                .and_then(|values| values.iter().map(|v| v.trim()).find(|v| !v.is_empty())),
        }
        .filter(|username| !username.is_empty())
        .ok_or_else(|| SamlError::UsernameUnresolvable {
            source_name: self.username_source.to_string(),
        })?
        .to_string();

        Ok(Identity {
            username,
            issuer: assertion.issuer.clone(),
            name_id: name_id.map(|name_id| name_id.value.clone()),
            name_id_format: name_id.and_then(|name_id| name_id.format.clone()),
            session_index: assertion
                .authn_statement
                .as_ref()
                .and_then(|statement| statement.session_index.clone()),
            attributes,
        })
    }
}
