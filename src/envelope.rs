//! SOAP envelope adapter.
//!
//! The only place that knows the shape of SOAP 1.1 and SOAP 1.2 envelopes.
//! Header blocks are kept as their exact source text next to their parsed
//! element tree, so whatever was digested by the sender is digested again by
//! the receiver without canonicalization.

use crate::config::SoapVersion;
use crate::error::As4Error;
use crate::message::As4Message;
use crate::xml::{parse_document, Document, Element, EBMS_NS, WSSE_NS, WSU_NS};
use uuid::Uuid;

/// One SOAP header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBlock {
    /// Exact source text of the block
    pub raw: String,
    /// Parsed block; spans are relative to `raw`
    pub element: Element,
}

impl HeaderBlock {
    /// Parse a self-contained block (all prefixes declared inside it).
    pub fn parse(raw: String) -> Result<Self, As4Error> {
        let document = parse_document(raw.as_bytes())?;
        Ok(Self {
            raw,
            element: document.root,
        })
    }

    fn from_document(document: &Document, element: &Element) -> Self {
        let raw = document.raw(element).to_string();
        let mut element = element.clone();
        let offset = element.span.start;
        rebase(&mut element, offset);
        Self { raw, element }
    }

    /// Whether this block has the given qualified name.
    pub fn is(&self, namespace: &str, local_name: &str) -> bool {
        self.element.is(namespace, local_name)
    }

    /// Source text of an element inside this block.
    pub fn raw_of(&self, element: &Element) -> &str {
        &self.raw[element.span.clone()]
    }

    /// Source text of the content of an element inside this block.
    pub fn inner_raw_of(&self, element: &Element) -> &str {
        &self.raw[element.inner.clone()]
    }
}

fn rebase(element: &mut Element, offset: usize) {
    element.span = (element.span.start - offset)..(element.span.end - offset);
    element.inner = (element.inner.start - offset)..(element.inner.end - offset);
    for child in &mut element.children {
        rebase(child, offset);
    }
}

/// A SOAP envelope: header blocks plus the body content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeDocument {
    pub version: SoapVersion,
    pub header_blocks: Vec<HeaderBlock>,
    /// `wsu:Id` of the body, the signature reference anchor
    pub body_id: Option<String>,
    /// Body content (XML fragment)
    pub body: Option<String>,
}

impl EnvelopeDocument {
    /// Empty envelope with a fresh body id.
    pub fn new(version: SoapVersion) -> Self {
        Self {
            version,
            header_blocks: Vec::new(),
            body_id: Some(format!("body-{}", Uuid::new_v4())),
            body: None,
        }
    }

    /// First header block with the given qualified name.
    pub fn header(&self, namespace: &str, local_name: &str) -> Option<&HeaderBlock> {
        self.header_blocks.iter().find(|b| b.is(namespace, local_name))
    }

    /// Replace (or add) the `wsse:Security` header, which goes first.
    pub fn set_security_header(&mut self, block: HeaderBlock) {
        self.header_blocks.retain(|b| !b.is(WSSE_NS, "Security"));
        self.header_blocks.insert(0, block);
    }

    /// Remove the `wsse:Security` header.
    pub fn take_security_header(&mut self) -> Option<HeaderBlock> {
        let index = self
            .header_blocks
            .iter()
            .position(|b| b.is(WSSE_NS, "Security"))?;
        Some(self.header_blocks.remove(index))
    }

    /// Serialize the envelope.
    pub fn to_xml(&self) -> String {
        let prefix = self.version.prefix();
        let mut out = String::with_capacity(2048);
        out.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        out.push_str(&format!(
            r#"<{p}:Envelope xmlns:{p}="{ns}"><{p}:Header>"#,
            p = prefix,
            ns = self.version.namespace()
        ));
        for block in &self.header_blocks {
            out.push_str(&block.raw);
        }
        out.push_str(&format!("</{}:Header>", prefix));
        match &self.body_id {
            Some(id) => out.push_str(&format!(
                r#"<{p}:Body xmlns:wsu="{wsu}" wsu:Id="{id}">"#,
                p = prefix,
                wsu = WSU_NS,
                id = crate::xml::escape(id)
            )),
            None => out.push_str(&format!("<{}:Body>", prefix)),
        }
        if let Some(body) = &self.body {
            out.push_str(body);
        }
        out.push_str(&format!("</{p}:Body></{p}:Envelope>", p = prefix));
        out
    }

    /// Parse an envelope, detecting its SOAP version.
    pub fn parse(data: &[u8]) -> Result<Self, As4Error> {
        let document = parse_document(data)?;
        let root = &document.root;

        if root.local_name != "Envelope" {
            return Err(As4Error::MalformedEnvelope(format!(
                "Root element is '{}', not a SOAP Envelope",
                root.local_name
            )));
        }
        let version = root
            .namespace
            .as_deref()
            .and_then(SoapVersion::from_namespace)
            .ok_or_else(|| {
                As4Error::MalformedEnvelope(format!(
                    "Unsupported SOAP envelope namespace: {}",
                    root.namespace.as_deref().unwrap_or("<none>")
                ))
            })?;
        let ns = version.namespace();

        let header_blocks = root
            .child(ns, "Header")
            .map(|header| {
                header
                    .children
                    .iter()
                    .map(|block| HeaderBlock::from_document(&document, block))
                    .collect()
            })
            .unwrap_or_default();

        let body = root
            .child(ns, "Body")
            .ok_or_else(|| As4Error::MalformedEnvelope("SOAP Body is missing".to_string()))?;
        let content = document.inner_raw(body);

        Ok(Self {
            version,
            header_blocks,
            body_id: body.attr_ns(WSU_NS, "Id").map(String::from),
            body: if content.trim().is_empty() {
                None
            } else {
                Some(content.to_string())
            },
        })
    }
}

/// Wrap a message and an optional body payload into an envelope.
pub fn wrap(message: &As4Message, payload: Option<&str>) -> Result<EnvelopeDocument, As4Error> {
    let block = HeaderBlock::parse(message.messaging_xml()).map_err(|e| {
        As4Error::Internal(format!("Serialized eb:Messaging does not parse: {}", e))
    })?;
    let mut document = EnvelopeDocument::new(message.soap_version());
    document.header_blocks.push(block);
    document.body = payload.map(String::from);
    Ok(document)
}

/// Split an envelope into its `eb:Messaging` block and body payload.
pub fn unwrap(document: &EnvelopeDocument) -> Result<(&HeaderBlock, Option<&str>), As4Error> {
    let messaging = document.header(EBMS_NS, "Messaging").ok_or_else(|| {
        As4Error::MalformedEnvelope("eb:Messaging header is missing".to_string())
    })?;

    // Any other header the sender insists on must be one we process
    for block in &document.header_blocks {
        let must_understand = block
            .element
            .attr_ns(document.version.namespace(), "mustUnderstand")
            .map(|v| v == "1" || v == "true")
            .unwrap_or(false);
        if must_understand && !block.is(EBMS_NS, "Messaging") && !block.is(WSSE_NS, "Security") {
            return Err(As4Error::MalformedEnvelope(format!(
                "Header '{}' must be understood but is not supported",
                block.element.local_name
            )));
        }
    }

    Ok((messaging, document.body.as_deref()))
}

/// Parse the message carried by an envelope.
pub fn read_message(document: &EnvelopeDocument) -> Result<As4Message, As4Error> {
    let (messaging, _) = unwrap(document)?;
    As4Message::from_header_block(messaging, document.version)
}
