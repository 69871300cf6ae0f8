use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameId {
    pub value: String,
    pub format: Option<String>,
    pub name_qualifier: Option<String>,
    pub sp_name_qualifier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectConfirmationData {
    pub not_before: Option<OffsetDateTime>,
    pub not_on_or_after: Option<OffsetDateTime>,
    pub recipient: Option<String>,
    pub in_response_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectConfirmation {
    pub method: String,
    pub data: Option<SubjectConfirmationData>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub name_id: Option<NameId>,
    pub confirmations: Vec<SubjectConfirmation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditions {
    pub not_before: Option<OffsetDateTime>,
    pub not_on_or_after: Option<OffsetDateTime>,
    /// One entry per `AudienceRestriction`, each listing its audiences.
    pub audience_restrictions: Vec<Vec<String>>,
    pub one_time_use: bool,
}

impl Conditions {
    /// Every audience named by any restriction.
    pub fn audiences(&self) -> Vec<String> {
        self.audience_restrictions.iter().flatten().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthnStatement {
    pub authn_instant: OffsetDateTime,
    pub session_index: Option<String>,
    pub session_not_on_or_after: Option<OffsetDateTime>,
    pub context_class: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamlAttribute {
    pub name: String,
    pub name_format: Option<String>,
    pub friendly_name: Option<String>,
    pub values: Vec<String>,
}

/// The parts of a `saml:Assertion` the SP acts on. Nothing in here is
/// trustworthy until the signature and the validator have passed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAssertion {
    pub id: String,
    pub issue_instant: OffsetDateTime,
    pub issuer: String,
    pub subject: Subject,
    pub conditions: Conditions,
    pub authn_statement: Option<AuthnStatement>,
    /// Attributes of every `AttributeStatement`, in document order.
    pub attributes: Vec<SamlAttribute>,
}

impl ParsedAssertion {
    /// Values of the named attribute, merged across repeated `Attribute`
    /// elements.
    pub fn attribute_values(&self, name: &str) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|attr| attr.name == name)
            .flat_map(|attr| attr.values.iter().map(String::as_str))
            .collect()
    }
}
