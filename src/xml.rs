//! A small namespace-aware element tree.
//!
//! SAML processing needs the exact prefixes, declarations and attribute
//! namespaces of the received document so it can be canonicalized later, which
//! rules out readers that resolve and forget them.

use std::collections::BTreeMap;

use quick_xml::{
    escape::unescape,
    events::{BytesStart, Event},
    Reader,
};

use crate::SamlError;

pub const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub prefix: Option<String>,
    pub name: String,
    pub namespace: Option<String>,
    pub value: String,
}

impl Attribute {
    pub fn qualified_name(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{}", self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Element(Element),
    Text(String),
    Comment(String),
    ProcessingInstruction { target: String, data: String },
}

#[derive(Debug, Clone)]
pub struct Element {
    pub prefix: Option<String>,
    pub name: String,
    pub namespace: Option<String>,
    /// Declarations written on this element, in document order. The default
    /// namespace uses the empty prefix; an empty URI undeclares it.
    pub declarations: Vec<(String, String)>,
    /// Every binding visible at this element, its own declarations included.
    pub in_scope: BTreeMap<String, String>,
    /// `xml:*` attributes set on ancestors and not overridden here.
    pub inherited_xml_attributes: Vec<Attribute>,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn is(&self, namespace: &str, name: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(namespace)
    }

    pub fn qualified_name(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{}", self.name),
            None => self.name.clone(),
        }
    }

    /// Looks up an attribute that carries no namespace.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.namespace.is_none() && attr.name == name)
            .map(|attr| attr.value.as_str())
    }

    pub fn attribute_ns(&self, namespace: &str, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.namespace.as_deref() == Some(namespace) && attr.name == name)
            .map(|attr| attr.value.as_str())
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            _ => None,
        })
    }

    pub fn children_named<'a, 'n>(
        &'a self,
        namespace: &'n str,
        name: &'n str,
    ) -> impl Iterator<Item = &'a Element> + 'n
    where
        'a: 'n,
    {
        self.child_elements()
            .filter(move |child| child.is(namespace, name))
    }

    pub fn first_child(&self, namespace: &str, name: &str) -> Option<&Element> {
        self.children_named(namespace, name).next()
    }

    /// Concatenated text of the direct text children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Visits this element and every descendant element in document order.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Element)) {
        visit(self);
        for child in self.child_elements() {
            child.walk(visit);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Document {
    /// Comments and processing instructions ahead of the document element.
    pub prolog: Vec<Node>,
    pub root: Element,
    pub epilog: Vec<Node>,
}

impl Document {
    pub fn parse(input: &[u8]) -> Result<Document, SamlError> {
        let text = std::str::from_utf8(input)
            .map_err(|_| SamlError::MalformedAssertion("document is not UTF-8".into()))?;
        TreeBuilder::default().build(text)
    }

    /// All elements whose `ID` or `Id` attribute equals `id`.
    pub fn elements_with_id(&self, id: &str) -> Vec<&Element> {
        let mut found = Vec::new();
        self.root.walk(&mut |element| {
            if element.attribute("ID") == Some(id) || element.attribute("Id") == Some(id) {
                found.push(element);
            }
        });
        found
    }
}

#[derive(Default)]
struct TreeBuilder {
    open: Vec<Element>,
    prolog: Vec<Node>,
    epilog: Vec<Node>,
    root: Option<Element>,
}

fn malformed(detail: impl Into<String>) -> SamlError {
    SamlError::MalformedAssertion(detail.into())
}

fn utf8(bytes: &[u8]) -> Result<&str, SamlError> {
    std::str::from_utf8(bytes).map_err(|_| malformed("invalid UTF-8 in markup"))
}

// An XML processor turns literal CR/CRLF into LF everywhere.
fn normalize_line_endings(raw: &str) -> String {
    raw.replace("\r\n", "\n").replace('\r', "\n")
}

fn split_qname(qname: &str) -> (Option<&str>, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    }
}

impl TreeBuilder {
    fn build(mut self, text: &str) -> Result<Document, SamlError> {
        let mut reader = Reader::from_str(text);

        loop {
            let event = reader
                .read_event()
                .map_err(|e| malformed(format!("XML syntax error: {e}")))?;
            match event {
                Event::Start(start) => {
                    let element = self.open_element(&start)?;
                    if self.open.len() >= MAX_DEPTH {
                        return Err(malformed("document nesting is too deep"));
                    }
                    self.open.push(element);
                }
                Event::Empty(start) => {
                    let element = self.open_element(&start)?;
                    self.close_element(element)?;
                }
                Event::End(_) => {
                    let element = self
                        .open
                        .pop()
                        .ok_or_else(|| malformed("unbalanced end tag"))?;
                    self.close_element(element)?;
                }
                Event::Text(text) => {
                    let raw = normalize_line_endings(utf8(&text)?);
                    let value = unescape(&raw)
                        .map_err(|e| malformed(format!("bad character reference: {e}")))?;
                    self.push_text(value.into_owned())?;
                }
                Event::CData(data) => {
                    let raw = normalize_line_endings(utf8(&data.into_inner())?);
                    self.push_text(raw)?;
                }
                Event::Comment(comment) => {
                    let value = normalize_line_endings(utf8(&comment)?);
                    self.push_misc(Node::Comment(value));
                }
                Event::PI(pi) => {
                    let raw = normalize_line_endings(utf8(&pi)?);
                    let (target, data) = match raw.split_once(char::is_whitespace) {
                        Some((target, data)) => (target.to_string(), data.trim_start().to_string()),
                        None => (raw.clone(), String::new()),
                    };
                    self.push_misc(Node::ProcessingInstruction { target, data });
                }
                Event::DocType(_) => return Err(malformed("DOCTYPE is not allowed")),
                Event::Decl(_) => {}
                Event::Eof => break,
            }
        }

        if !self.open.is_empty() {
            return Err(malformed("unexpected end of document"));
        }
        let root = self.root.ok_or_else(|| malformed("no document element"))?;
        Ok(Document {
            prolog: self.prolog,
            root,
            epilog: self.epilog,
        })
    }

    fn open_element(&self, start: &BytesStart) -> Result<Element, SamlError> {
        if self.open.is_empty() && self.root.is_some() {
            return Err(malformed("more than one document element"));
        }
        let parent = self.open.last();
        let mut in_scope = parent.map(|p| p.in_scope.clone()).unwrap_or_default();
        let mut declarations = Vec::new();
        let mut raw_attributes = Vec::new();

        for attr in start.attributes() {
            let attr = attr.map_err(|e| malformed(format!("bad attribute: {e}")))?;
            let key = utf8(attr.key.as_ref())?.to_string();
            // Attribute-value normalization: line endings first, then each
            // literal whitespace character becomes a space.
            let raw = normalize_line_endings(utf8(&attr.value)?).replace(['\t', '\n'], " ");
            let value = unescape(&raw)
                .map_err(|e| malformed(format!("bad character reference: {e}")))?
                .into_owned();

            if key == "xmlns" {
                declarations.push((String::new(), value));
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                if value.is_empty() {
                    return Err(malformed(format!("prefix {prefix} undeclared")));
                }
                declarations.push((prefix.to_string(), value));
            } else {
                raw_attributes.push((key, value));
            }
        }

        for (prefix, uri) in &declarations {
            if uri.is_empty() {
                in_scope.remove(prefix);
            } else {
                in_scope.insert(prefix.clone(), uri.clone());
            }
        }

        let qname = utf8(start.name().as_ref())?.to_string();
        let (prefix, name) = split_qname(&qname);
        let namespace = match prefix {
            Some("xml") => Some(XML_NS.to_string()),
            Some(prefix) => Some(
                in_scope
                    .get(prefix)
                    .cloned()
                    .ok_or_else(|| malformed(format!("unbound prefix {prefix}")))?,
            ),
            None => in_scope.get("").cloned(),
        };

        let mut attributes = Vec::with_capacity(raw_attributes.len());
        for (key, value) in raw_attributes {
            let (attr_prefix, attr_name) = split_qname(&key);
            let attr_namespace = match attr_prefix {
                Some("xml") => Some(XML_NS.to_string()),
                Some(p) => Some(
                    in_scope
                        .get(p)
                        .cloned()
                        .ok_or_else(|| malformed(format!("unbound prefix {p}")))?,
                ),
                None => None,
            };
            if attributes.iter().any(|a: &Attribute| {
                a.name == attr_name && a.namespace == attr_namespace
            }) {
                return Err(malformed(format!("duplicate attribute {key}")));
            }
            attributes.push(Attribute {
                prefix: attr_prefix.map(str::to_string),
                name: attr_name.to_string(),
                namespace: attr_namespace,
                value,
            });
        }

        let inherited_xml_attributes = match parent {
            Some(parent) => {
                let mut inherited: Vec<Attribute> = parent
                    .inherited_xml_attributes
                    .iter()
                    .filter(|a| {
                        !parent
                            .attributes
                            .iter()
                            .any(|own| own.namespace == a.namespace && own.name == a.name)
                    })
                    .cloned()
                    .collect();
                inherited.extend(
                    parent
                        .attributes
                        .iter()
                        .filter(|a| a.namespace.as_deref() == Some(XML_NS))
                        .cloned(),
                );
                inherited
            }
            None => Vec::new(),
        };

        Ok(Element {
            prefix: prefix.map(str::to_string),
            name: name.to_string(),
            namespace,
            declarations,
            in_scope,
            inherited_xml_attributes,
            attributes,
            children: Vec::new(),
        })
    }

    fn close_element(&mut self, element: Element) -> Result<(), SamlError> {
        match self.open.last_mut() {
            Some(parent) => parent.children.push(Node::Element(element)),
            None => {
                if self.root.is_some() {
                    return Err(malformed("more than one document element"));
                }
                self.root = Some(element);
            }
        }
        Ok(())
    }

    fn push_text(&mut self, text: String) -> Result<(), SamlError> {
        match self.open.last_mut() {
            Some(parent) => {
                // Merge adjacent runs (text + CDATA) into one node.
                if let Some(Node::Text(previous)) = parent.children.last_mut() {
                    previous.push_str(&text);
                } else {
                    parent.children.push(Node::Text(text));
                }
                Ok(())
            }
            None if text.trim().is_empty() => Ok(()),
            None => Err(malformed("text outside the document element")),
        }
    }

    fn push_misc(&mut self, node: Node) {
        match self.open.last_mut() {
            Some(parent) => parent.children.push(node),
            None if self.root.is_none() => self.prolog.push(node),
            None => self.epilog.push(node),
        }
    }
}
