//! Canonical XML 1.0 and Exclusive XML Canonicalization 1.0.
//!
//! Canonicalization always runs over a whole element subtree (or the whole
//! document), optionally leaving out one element so that the
//! enveloped-signature transform can drop the `Signature` it sits in.

use std::collections::BTreeMap;

use crate::xml::{Attribute, Document, Element, Node};

pub const C14N: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub const C14N_WITH_COMMENTS: &str =
    "http://www.w3.org/TR/2001/REC-xml-c14n-20010315#WithComments";
pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const EXC_C14N_WITH_COMMENTS: &str = "http://www.w3.org/2001/10/xml-exc-c14n#WithComments";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalizationMethod {
    Inclusive {
        with_comments: bool,
    },
    Exclusive {
        with_comments: bool,
        /// Prefixes from `InclusiveNamespaces/@PrefixList`; `#default` is
        /// stored as the empty prefix.
        inclusive_prefixes: Vec<String>,
    },
}

impl CanonicalizationMethod {
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            C14N => Some(Self::Inclusive {
                with_comments: false,
            }),
            C14N_WITH_COMMENTS => Some(Self::Inclusive {
                with_comments: true,
            }),
            EXC_C14N => Some(Self::Exclusive {
                with_comments: false,
                inclusive_prefixes: Vec::new(),
            }),
            EXC_C14N_WITH_COMMENTS => Some(Self::Exclusive {
                with_comments: true,
                inclusive_prefixes: Vec::new(),
            }),
            _ => None,
        }
    }

    pub fn with_inclusive_prefixes(self, prefix_list: &str) -> Self {
        match self {
            Self::Exclusive { with_comments, .. } => Self::Exclusive {
                with_comments,
                inclusive_prefixes: prefix_list
                    .split_whitespace()
                    .map(|p| if p == "#default" { String::new() } else { p.to_string() })
                    .collect(),
            },
            inclusive => inclusive,
        }
    }

    /// Same-document references never carry comment nodes into the digest.
    pub fn without_comments(self) -> Self {
        match self {
            Self::Inclusive { .. } => Self::Inclusive {
                with_comments: false,
            },
            Self::Exclusive {
                inclusive_prefixes, ..
            } => Self::Exclusive {
                with_comments: false,
                inclusive_prefixes,
            },
        }
    }

    fn with_comments(&self) -> bool {
        match self {
            Self::Inclusive { with_comments } | Self::Exclusive { with_comments, .. } => {
                *with_comments
            }
        }
    }
}

/// Canonicalizes `element` and its descendants, skipping `excluded` (compared
/// by identity) wherever it occurs.
pub fn canonicalize_element(
    element: &Element,
    method: &CanonicalizationMethod,
    excluded: Option<&Element>,
) -> String {
    let mut writer = Writer {
        method,
        excluded,
        out: String::new(),
    };
    writer.element(element, &BTreeMap::new(), true);
    writer.out
}

pub fn canonicalize_document(
    document: &Document,
    method: &CanonicalizationMethod,
    excluded: Option<&Element>,
) -> String {
    let mut writer = Writer {
        method,
        excluded,
        out: String::new(),
    };
    for node in &document.prolog {
        if writer.misc(node) {
            writer.out.push('\n');
        }
    }
    writer.element(&document.root, &BTreeMap::new(), true);
    for node in &document.epilog {
        let mark = writer.out.len();
        writer.out.push('\n');
        if !writer.misc(node) {
            writer.out.truncate(mark);
        }
    }
    writer.out
}

struct Writer<'a> {
    method: &'a CanonicalizationMethod,
    excluded: Option<&'a Element>,
    out: String,
}

impl Writer<'_> {
    fn element(&mut self, element: &Element, rendered: &BTreeMap<String, String>, apex: bool) {
        let declarations = match self.method {
            CanonicalizationMethod::Inclusive { .. } => inclusive_namespaces(element, rendered),
            CanonicalizationMethod::Exclusive {
                inclusive_prefixes, ..
            } => exclusive_namespaces(element, rendered, inclusive_prefixes),
        };

        let mut attributes: Vec<&Attribute> = element.attributes.iter().collect();
        if apex && matches!(self.method, CanonicalizationMethod::Inclusive { .. }) {
            attributes.extend(element.inherited_xml_attributes.iter().filter(|inherited| {
                !element
                    .attributes
                    .iter()
                    .any(|own| own.namespace == inherited.namespace && own.name == inherited.name)
            }));
        }
        attributes.sort_by(|a, b| {
            let a_key = (a.namespace.as_deref().unwrap_or(""), a.name.as_str());
            let b_key = (b.namespace.as_deref().unwrap_or(""), b.name.as_str());
            a_key.cmp(&b_key)
        });

        let qname = element.qualified_name();
        self.out.push('<');
        self.out.push_str(&qname);
        for (prefix, uri) in &declarations {
            if prefix.is_empty() {
                self.out.push_str(" xmlns=\"");
            } else {
                self.out.push_str(" xmlns:");
                self.out.push_str(prefix);
                self.out.push_str("=\"");
            }
            escape_attribute(uri, &mut self.out);
            self.out.push('"');
        }
        for attr in attributes {
            self.out.push(' ');
            self.out.push_str(&attr.qualified_name());
            self.out.push_str("=\"");
            escape_attribute(&attr.value, &mut self.out);
            self.out.push('"');
        }
        self.out.push('>');

        let mut now_rendered = rendered.clone();
        for (prefix, uri) in declarations {
            now_rendered.insert(prefix, uri);
        }

        for child in &element.children {
            match child {
                Node::Element(child) => {
                    if self.excluded.is_some_and(|excluded| std::ptr::eq(excluded, child)) {
                        continue;
                    }
                    self.element(child, &now_rendered, false);
                }
                Node::Text(text) => escape_text(text, &mut self.out),
                other => {
                    self.misc(other);
                }
            }
        }

        self.out.push_str("</");
        self.out.push_str(&qname);
        self.out.push('>');
    }

    /// Writes a comment or processing instruction; returns whether anything
    /// was emitted.
    fn misc(&mut self, node: &Node) -> bool {
        match node {
            Node::Comment(comment) if self.method.with_comments() => {
                self.out.push_str("<!--");
                self.out.push_str(comment);
                self.out.push_str("-->");
                true
            }
            Node::ProcessingInstruction { target, data } => {
                self.out.push_str("<?");
                self.out.push_str(target);
                if !data.is_empty() {
                    self.out.push(' ');
                    self.out.push_str(data);
                }
                self.out.push_str("?>");
                true
            }
            _ => false,
        }
    }
}

// Every in-scope binding whose value differs from what the output ancestors
// already rendered.
fn inclusive_namespaces(
    element: &Element,
    rendered: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut declarations: Vec<(String, String)> = element
        .in_scope
        .iter()
        .filter(|(prefix, uri)| prefix.as_str() != "xml" && rendered.get(*prefix) != Some(*uri))
        .map(|(prefix, uri)| (prefix.clone(), uri.clone()))
        .collect();
    if !element.in_scope.contains_key("") && rendered.get("").is_some_and(|uri| !uri.is_empty()) {
        declarations.push((String::new(), String::new()));
    }
    declarations.sort();
    declarations
}

// Only the prefixes the element and its attributes visibly use, plus the
// PrefixList ones, when not already rendered with the same value.
fn exclusive_namespaces(
    element: &Element,
    rendered: &BTreeMap<String, String>,
    inclusive_prefixes: &[String],
) -> Vec<(String, String)> {
    let mut utilized: Vec<String> = vec![element.prefix.clone().unwrap_or_default()];
    utilized.extend(element.attributes.iter().filter_map(|attr| attr.prefix.clone()));
    utilized.extend(
        inclusive_prefixes
            .iter()
            .filter(|prefix| element.in_scope.contains_key(prefix.as_str()))
            .cloned(),
    );
    utilized.sort();
    utilized.dedup();

    let mut declarations = Vec::new();
    for prefix in utilized {
        if prefix == "xml" {
            continue;
        }
        let uri = element.in_scope.get(&prefix).cloned().unwrap_or_default();
        let already = rendered.get(&prefix).cloned().unwrap_or_default();
        if uri == already {
            continue;
        }
        if uri.is_empty() && !prefix.is_empty() {
            continue;
        }
        declarations.push((prefix, uri));
    }
    declarations
}

fn escape_text(text: &str, out: &mut String) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            other => out.push(other),
        }
    }
}

fn escape_attribute(value: &str, out: &mut String) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            other => out.push(other),
        }
    }
}
