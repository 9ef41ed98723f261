//! XML parsing utilities.
//!
//! Uses quick-xml which is safe against XXE by default (doesn't expand
//! entities). Documents are read into a small element tree that remembers the
//! byte range of every element in the source, so header blocks and payloads
//! can be handed on byte-for-byte (signature digests depend on it).

use crate::error::As4Error;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;
use std::ops::Range;

/// Namespace URIs used across the crate.
pub const SOAP_11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const SOAP_12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const EBMS_NS: &str = "http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/core/200704/";
pub const WSSE_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
pub const WSU_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
pub const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const XENC_NS: &str = "http://www.w3.org/2001/04/xmlenc#";
pub const EBBP_NS: &str = "http://docs.oasis-open.org/ebxml-bp/ebbp-signals-2.0";

/// Parsed XML attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub namespace: Option<String>,
    pub local_name: String,
    pub value: String,
}

/// Parsed XML element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub namespace: Option<String>,
    pub local_name: String,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Element>,
    /// Concatenated direct text content (unescaped)
    pub text: String,
    /// Byte range of the whole element in the source
    pub span: Range<usize>,
    /// Byte range of the element content (between start and end tag)
    pub inner: Range<usize>,
}

impl Element {
    /// Whether this element has the given namespace and local name.
    pub fn is(&self, namespace: &str, local_name: &str) -> bool {
        self.local_name == local_name && self.namespace.as_deref() == Some(namespace)
    }

    /// First child with the given namespace and local name.
    pub fn child(&self, namespace: &str, local_name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.is(namespace, local_name))
    }

    /// All children with the given namespace and local name.
    pub fn children_named<'a>(
        &'a self,
        namespace: &'a str,
        local_name: &'a str,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.is(namespace, local_name))
    }

    /// Trimmed text of the first matching child.
    pub fn child_text(&self, namespace: &str, local_name: &str) -> Option<String> {
        self.child(namespace, local_name).map(|c| c.text.trim().to_string())
    }

    /// Attribute value by local name, ignoring its namespace.
    pub fn attr(&self, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.local_name == local_name)
            .map(|a| a.value.as_str())
    }

    /// Attribute value by namespace and local name.
    pub fn attr_ns(&self, namespace: &str, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.local_name == local_name && a.namespace.as_deref() == Some(namespace))
            .map(|a| a.value.as_str())
    }

    /// Depth-first search for an element carrying `wsu:Id` = `id`.
    pub fn find_by_wsu_id(&self, id: &str) -> Option<&Element> {
        if self.attr_ns(WSU_NS, "Id") == Some(id) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_by_wsu_id(id))
    }
}

/// A parsed document: the source text and its root element.
#[derive(Debug, Clone)]
pub struct Document {
    pub source: String,
    pub root: Element,
}

impl Document {
    /// Source text of an element.
    pub fn raw(&self, element: &Element) -> &str {
        &self.source[element.span.clone()]
    }

    /// Source text of an element's content.
    pub fn inner_raw(&self, element: &Element) -> &str {
        &self.source[element.inner.clone()]
    }
}

/// Parse raw bytes as an XML document.
pub fn parse_document(data: &[u8]) -> Result<Document, As4Error> {
    let xml_str = std::str::from_utf8(data)
        .map_err(|e| As4Error::XmlParse(format!("Invalid UTF-8: {}", e)))?;

    // Pre-scan for XXE patterns (belt-and-suspenders with quick-xml's safety)
    check_xxe_patterns(xml_str)?;

    let root = parse_tree(xml_str)?;
    Ok(Document {
        source: xml_str.to_string(),
        root,
    })
}

fn parse_tree(xml: &str) -> Result<Element, As4Error> {
    let mut reader = NsReader::from_str(xml);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let before = reader.buffer_position() as usize;
        let event = reader
            .read_event()
            .map_err(|e| As4Error::XmlParse(format!("XML parse error: {}", e)))?;
        let after = reader.buffer_position() as usize;

        match event {
            Event::Start(ref e) => {
                let mut element = open_element(&reader, e)?;
                element.span = before..before;
                element.inner = after..after;
                stack.push(element);
            }
            Event::Empty(ref e) => {
                let mut element = open_element(&reader, e)?;
                element.span = before..after;
                element.inner = after..after;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let mut element = stack
                    .pop()
                    .ok_or_else(|| As4Error::XmlParse("Unbalanced end tag".to_string()))?;
                element.inner.end = before;
                element.span.end = after;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(ref t) => {
                if let Some(current) = stack.last_mut() {
                    let text = t
                        .unescape()
                        .map_err(|e| As4Error::XmlParse(format!("Invalid text: {}", e)))?;
                    current.text.push_str(&text);
                }
            }
            Event::CData(ref c) => {
                if let Some(current) = stack.last_mut() {
                    let text = std::str::from_utf8(c)
                        .map_err(|e| As4Error::XmlParse(format!("Invalid CDATA: {}", e)))?;
                    current.text.push_str(text);
                }
            }
            Event::DocType(_) => {
                return Err(As4Error::XmlParse(
                    "DOCTYPE declarations are not allowed".to_string(),
                ));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(As4Error::XmlParse("Unexpected end of document".to_string()));
    }
    root.ok_or_else(|| As4Error::XmlParse("Document has no root element".to_string()))
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), As4Error> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            if root.is_some() {
                return Err(As4Error::XmlParse(
                    "Document has more than one root element".to_string(),
                ));
            }
            *root = Some(element);
        }
    }
    Ok(())
}

fn open_element(reader: &NsReader<&[u8]>, e: &BytesStart) -> Result<Element, As4Error> {
    let (ns, local) = reader.resolve_element(e.name());
    let namespace = namespace_of(ns)?;
    let local_name = utf8(local.as_ref())?;

    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| As4Error::XmlParse(format!("Invalid attribute: {}", e)))?;
        let key = attr.key;
        if key.as_ref() == b"xmlns" || key.as_ref().starts_with(b"xmlns:") {
            continue;
        }
        let (ns, local) = reader.resolve_attribute(key);
        let value = attr
            .unescape_value()
            .map_err(|e| As4Error::XmlParse(format!("Invalid attribute value: {}", e)))?;
        attributes.push(Attribute {
            namespace: namespace_of(ns)?,
            local_name: utf8(local.as_ref())?,
            value: value.into_owned(),
        });
    }

    Ok(Element {
        namespace,
        local_name,
        attributes,
        children: Vec::new(),
        text: String::new(),
        span: 0..0,
        inner: 0..0,
    })
}

fn namespace_of(result: ResolveResult) -> Result<Option<String>, As4Error> {
    match result {
        ResolveResult::Bound(ns) => Ok(Some(utf8(ns.as_ref())?)),
        ResolveResult::Unbound => Ok(None),
        ResolveResult::Unknown(prefix) => Err(As4Error::XmlParse(format!(
            "Unbound namespace prefix '{}'",
            String::from_utf8_lossy(&prefix)
        ))),
    }
}

fn utf8(bytes: &[u8]) -> Result<String, As4Error> {
    std::str::from_utf8(bytes)
        .map(String::from)
        .map_err(|e| As4Error::XmlParse(format!("Invalid UTF-8 in name: {}", e)))
}

/// Check for XXE attack patterns.
fn check_xxe_patterns(xml: &str) -> Result<(), As4Error> {
    if xml.contains("<!DOCTYPE") || xml.contains("<!doctype") {
        return Err(As4Error::XmlParse(
            "DOCTYPE declarations are not allowed".to_string(),
        ));
    }

    if xml.contains("<!ENTITY") || xml.contains("<!entity") {
        return Err(As4Error::XmlParse(
            "Entity declarations are not allowed".to_string(),
        ));
    }

    Ok(())
}

/// Escape text for use in element content and attribute values.
pub fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
