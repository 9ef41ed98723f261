//! AS4 message domain model.
//!
//! An [`As4Message`] is one `eb:Messaging` header block: a user message
//! carrying business payloads, or a signal message carrying a receipt or
//! errors. The model is SOAP-version agnostic; only the `mustUnderstand`
//! attribute placement depends on the version, and the envelope adapter owns
//! everything else.

use crate::compression::CompressionType;
use crate::config::SoapVersion;
use crate::envelope::HeaderBlock;
use crate::error::{As4Error, ErrorCategory, ErrorCode, Severity};
use crate::pmode::PMode;
use crate::xml::{escape, Element, DS_NS, EBBP_NS, EBMS_NS, WSU_NS};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Part property carrying the original MIME type of a payload.
pub const PROPERTY_MIME_TYPE: &str = "MimeType";
/// Part property carrying the compression applied to a payload.
pub const PROPERTY_COMPRESSION_TYPE: &str = "CompressionType";
/// Digest algorithm URI used in non-repudiation information.
pub const SHA256_URI: &str = "http://www.w3.org/2001/04/xmlenc#sha256";

/// Generate a random messaging id.
///
/// The id is used as `wsu:Id` (an `xs:ID`, derived from `xs:NCName`), so it
/// must not start with a digit.
pub fn new_messaging_id() -> String {
    format!("as4-{}", Uuid::new_v4())
}

/// Generate a wire `MessageId`.
pub fn new_message_id() -> String {
    format!("{}@as4-msh", Uuid::new_v4())
}

/// Kind of message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    User,
    Signal,
}

/// `eb:MessageInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    pub timestamp: DateTime<Utc>,
    pub message_id: String,
    pub ref_to_message_id: Option<String>,
}

impl MessageInfo {
    /// Fresh message info with a new message id.
    pub fn new(ref_to_message_id: Option<String>) -> Self {
        Self {
            // The wire format carries milliseconds
            timestamp: Utc::now().trunc_subsecs(3),
            message_id: new_message_id(),
            ref_to_message_id,
        }
    }
}

/// `eb:PartyId`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyId {
    pub value: String,
    pub party_type: Option<String>,
}

/// `eb:From` / `eb:To`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Party {
    pub party_id: PartyId,
    pub role: String,
}

/// `eb:PartyInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyInfo {
    pub from: Party,
    pub to: Party,
}

impl PartyInfo {
    /// Initiator to responder, as agreed in the PMode.
    pub fn from_pmode(pmode: &PMode) -> Self {
        let party = |p: &crate::pmode::PModeParty| Party {
            party_id: PartyId {
                value: p.party_id.clone(),
                party_type: p.party_id_type.clone(),
            },
            role: p.role.clone(),
        };
        Self {
            from: party(&pmode.initiator),
            to: party(&pmode.responder),
        }
    }
}

/// `eb:Service`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub value: String,
    pub service_type: Option<String>,
}

/// `eb:CollaborationInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaborationInfo {
    pub agreement_ref: Option<String>,
    pub service: Service,
    pub action: String,
    pub conversation_id: String,
}

impl CollaborationInfo {
    pub fn from_pmode(pmode: &PMode, conversation_id: impl Into<String>) -> Self {
        Self {
            agreement_ref: pmode.agreement_ref.clone(),
            service: Service {
                value: pmode.service.clone(),
                service_type: pmode.service_type.clone(),
            },
            action: pmode.action.clone(),
            conversation_id: conversation_id.into(),
        }
    }
}

/// Name/value property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub value: String,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// `eb:PartInfo`: reference to one payload part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    /// `cid:<content-id>` for attachments, `None` or `#id` for the SOAP body
    pub href: Option<String>,
    pub mime_type: Option<String>,
    pub compression: Option<CompressionType>,
    pub properties: Vec<Property>,
}

impl PartInfo {
    /// Reference to a MIME attachment.
    pub fn attachment(content_id: &str, mime_type: &str) -> Self {
        Self {
            href: Some(format!("cid:{}", content_id)),
            mime_type: Some(mime_type.to_string()),
            compression: None,
            properties: Vec::new(),
        }
    }

    /// Reference to the SOAP body payload.
    pub fn body() -> Self {
        Self {
            href: None,
            mime_type: None,
            compression: None,
            properties: Vec::new(),
        }
    }

    /// Content-ID referenced by this part, if it points to an attachment.
    pub fn content_id(&self) -> Option<&str> {
        self.href.as_deref().and_then(|h| h.strip_prefix("cid:"))
    }
}

/// Binary payload transported as a MIME part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub content_id: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(content_id: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            content_id: content_id.into(),
            mime_type: mime_type.into(),
            data,
        }
    }
}

/// `eb:UserMessage` plus its payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub message_info: MessageInfo,
    pub party_info: PartyInfo,
    pub collaboration_info: CollaborationInfo,
    pub message_properties: Vec<Property>,
    pub payload_info: Vec<PartInfo>,
    /// SOAP body payload (XML fragment)
    pub body: Option<String>,
    /// MIME attachments
    pub attachments: Vec<Attachment>,
}

impl UserMessage {
    /// Build a user message, checking that payload info and payloads agree.
    pub fn build(
        collaboration_info: CollaborationInfo,
        party_info: PartyInfo,
        payload_info: Vec<PartInfo>,
        body: Option<String>,
        attachments: Vec<Attachment>,
    ) -> Result<Self, As4Error> {
        check_payload_references(&payload_info, body.is_some(), &attachments, false)
            .map_err(As4Error::Validation)?;

        Ok(Self {
            message_info: MessageInfo::new(None),
            party_info,
            collaboration_info,
            message_properties: Vec::new(),
            payload_info,
            body,
            attachments,
        })
    }

    /// Replace the generated message id (e.g. one supplied by the submitter).
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_info.message_id = message_id.into();
        self
    }

    /// Add message properties.
    pub fn with_properties(mut self, properties: Vec<Property>) -> Self {
        self.message_properties = properties;
        self
    }

    /// Attach payloads received separately from the header.
    pub fn attach_payloads(
        &mut self,
        body: Option<String>,
        attachments: Vec<Attachment>,
        allow_unreferenced: bool,
    ) -> Result<(), As4Error> {
        check_payload_references(&self.payload_info, body.is_some(), &attachments, allow_unreferenced)
            .map_err(As4Error::MimeInconsistency)?;
        self.body = body;
        self.attachments = attachments;
        Ok(())
    }

    /// Part info describing an attachment.
    pub fn part_for(&self, content_id: &str) -> Option<&PartInfo> {
        self.payload_info
            .iter()
            .find(|p| p.content_id() == Some(content_id))
    }
}

/// Check that every part reference resolves to exactly one payload.
///
/// Attachments nobody references are an error unless `allow_unreferenced`.
pub fn check_payload_references(
    payload_info: &[PartInfo],
    has_body: bool,
    attachments: &[Attachment],
    allow_unreferenced: bool,
) -> Result<(), String> {
    let mut content_ids = HashSet::new();
    for attachment in attachments {
        if !content_ids.insert(attachment.content_id.as_str()) {
            return Err(format!(
                "Attachment content-id '{}' is used more than once",
                attachment.content_id
            ));
        }
    }

    let mut referenced = HashSet::new();
    for part in payload_info {
        match part.content_id() {
            Some(cid) => {
                if !content_ids.contains(cid) {
                    return Err(format!("No attachment for part reference 'cid:{}'", cid));
                }
                if !referenced.insert(cid) {
                    return Err(format!("Part 'cid:{}' is referenced more than once", cid));
                }
            }
            None => {
                if let Some(href) = part.href.as_deref() {
                    if !href.starts_with('#') {
                        return Err(format!("Unsupported part reference '{}'", href));
                    }
                }
                if !has_body {
                    return Err("Part references the SOAP body but the body is empty".to_string());
                }
            }
        }
    }

    if !allow_unreferenced {
        if let Some(extra) = attachments
            .iter()
            .find(|a| !referenced.contains(a.content_id.as_str()))
        {
            return Err(format!(
                "Attachment '{}' is not referenced by the payload info",
                extra.content_id
            ));
        }
    }

    Ok(())
}

/// Digest of one message part, as carried in non-repudiation information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartDigest {
    pub uri: String,
    /// Base64 SHA-256 digest
    pub digest_value: String,
}

/// What a receipt proves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptContent {
    /// Digests of the received parts
    NonRepudiation(Vec<PartDigest>),
    /// The received `eb:UserMessage` element, verbatim
    UserMessageEcho(String),
}

/// Receipt signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub message_info: MessageInfo,
    pub content: ReceiptContent,
}

impl Receipt {
    pub fn build(ref_to_message_id: impl Into<String>, content: ReceiptContent) -> Self {
        Self {
            message_info: MessageInfo::new(Some(ref_to_message_id.into())),
            content,
        }
    }

    /// The acknowledged message id.
    pub fn ref_to_message_id(&self) -> Option<&str> {
        self.message_info.ref_to_message_id.as_deref()
    }
}

/// Which part of the processing raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorOrigin {
    Content,
    Processing,
}

impl ErrorOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Processing => "processing",
        }
    }
}

/// One `eb:Error` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub short_description: String,
    pub long_description: String,
    pub ref_to_message_id: Option<String>,
    pub origin: ErrorOrigin,
    /// Diagnostic text (`eb:ErrorDetail`)
    pub detail: Option<String>,
}

impl ErrorDetail {
    /// Error entry described by the taxonomy.
    pub fn new(code: ErrorCode, ref_to_message_id: Option<&str>) -> Self {
        let description = code.describe();
        let origin = match description.category {
            ErrorCategory::Content => ErrorOrigin::Content,
            _ => ErrorOrigin::Processing,
        };
        Self {
            code,
            category: description.category,
            severity: description.severity,
            short_description: description.short_text.to_string(),
            long_description: description.long_text.to_string(),
            ref_to_message_id: ref_to_message_id.map(String::from),
            origin,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Error signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorSignal {
    pub message_info: MessageInfo,
    pub errors: Vec<ErrorDetail>,
}

impl ErrorSignal {
    /// Build an error signal; at least one detail is required.
    ///
    /// `ref_to_message_id` is `None` only when the faulty message id could not
    /// be read at all.
    pub fn build(
        ref_to_message_id: Option<String>,
        errors: Vec<ErrorDetail>,
    ) -> Result<Self, As4Error> {
        if errors.is_empty() {
            return Err(As4Error::Validation(
                "An error signal needs at least one error".to_string(),
            ));
        }
        Ok(Self {
            message_info: MessageInfo::new(ref_to_message_id),
            errors,
        })
    }

    /// Whether any entry has failure severity.
    pub fn is_failure(&self) -> bool {
        self.errors.iter().any(|e| e.severity == Severity::Failure)
    }
}

/// Message variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    User(UserMessage),
    Receipt(Receipt),
    Error(ErrorSignal),
}

/// One AS4 message, i.e. the content of an `eb:Messaging` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct As4Message {
    soap_version: SoapVersion,
    messaging_id: String,
    must_understand: bool,
    kind: MessageKind,
}

impl As4Message {
    pub fn new(soap_version: SoapVersion, kind: MessageKind) -> Self {
        Self {
            soap_version,
            messaging_id: new_messaging_id(),
            must_understand: true,
            kind,
        }
    }

    pub fn user(soap_version: SoapVersion, message: UserMessage) -> Self {
        Self::new(soap_version, MessageKind::User(message))
    }

    pub fn receipt(soap_version: SoapVersion, receipt: Receipt) -> Self {
        Self::new(soap_version, MessageKind::Receipt(receipt))
    }

    pub fn error(soap_version: SoapVersion, signal: ErrorSignal) -> Self {
        Self::new(soap_version, MessageKind::Error(signal))
    }

    pub fn soap_version(&self) -> SoapVersion {
        self.soap_version
    }

    pub fn messaging_id(&self) -> &str {
        &self.messaging_id
    }

    pub fn must_understand(&self) -> bool {
        self.must_understand
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn into_kind(self) -> MessageKind {
        self.kind
    }

    pub fn message_type(&self) -> MessageType {
        match self.kind {
            MessageKind::User(_) => MessageType::User,
            MessageKind::Receipt(_) | MessageKind::Error(_) => MessageType::Signal,
        }
    }

    /// Set the `mustUnderstand` flag of the `eb:Messaging` header.
    pub fn set_must_understand(mut self, must_understand: bool) -> Self {
        self.must_understand = must_understand;
        self
    }

    pub fn message_info(&self) -> &MessageInfo {
        match &self.kind {
            MessageKind::User(m) => &m.message_info,
            MessageKind::Receipt(r) => &r.message_info,
            MessageKind::Error(e) => &e.message_info,
        }
    }

    /// Wire `MessageId`.
    pub fn message_id(&self) -> &str {
        &self.message_info().message_id
    }

    /// Serialize the `eb:Messaging` header block.
    pub fn messaging_xml(&self) -> String {
        let mut out = String::with_capacity(1024);
        out.push_str(&format!(
            r#"<eb:Messaging xmlns:eb="{}" xmlns:wsu="{}""#,
            EBMS_NS, WSU_NS
        ));
        if self.must_understand {
            let v = self.soap_version;
            out.push_str(&format!(
                r#" xmlns:{p}="{ns}" {p}:mustUnderstand="{val}""#,
                p = v.prefix(),
                ns = v.namespace(),
                val = v.must_understand_true()
            ));
        }
        out.push_str(&format!(r#" wsu:Id="{}">"#, escape(&self.messaging_id)));

        match &self.kind {
            MessageKind::User(m) => write_user_message(&mut out, m),
            MessageKind::Receipt(r) => {
                out.push_str("<eb:SignalMessage>");
                write_message_info(&mut out, &r.message_info);
                out.push_str("<eb:Receipt>");
                match &r.content {
                    ReceiptContent::NonRepudiation(digests) => {
                        out.push_str(&format!(
                            r#"<ebbp:NonRepudiationInformation xmlns:ebbp="{}" xmlns:ds="{}">"#,
                            EBBP_NS, DS_NS
                        ));
                        for digest in digests {
                            out.push_str(&format!(
                                r#"<ebbp:MessagePartNRInformation><ds:Reference URI="{}"><ds:DigestMethod Algorithm="{}"/><ds:DigestValue>{}</ds:DigestValue></ds:Reference></ebbp:MessagePartNRInformation>"#,
                                escape(&digest.uri),
                                SHA256_URI,
                                escape(&digest.digest_value)
                            ));
                        }
                        out.push_str("</ebbp:NonRepudiationInformation>");
                    }
                    ReceiptContent::UserMessageEcho(echo) => out.push_str(echo),
                }
                out.push_str("</eb:Receipt></eb:SignalMessage>");
            }
            MessageKind::Error(e) => {
                out.push_str("<eb:SignalMessage>");
                write_message_info(&mut out, &e.message_info);
                for error in &e.errors {
                    write_error(&mut out, error);
                }
                out.push_str("</eb:SignalMessage>");
            }
        }

        out.push_str("</eb:Messaging>");
        out
    }

    /// Read an `eb:Messaging` header block.
    pub fn from_header_block(block: &HeaderBlock, soap_version: SoapVersion) -> Result<Self, As4Error> {
        let element = &block.element;
        if !element.is(EBMS_NS, "Messaging") {
            return Err(As4Error::Validation(format!(
                "Expected eb:Messaging, found '{}'",
                element.local_name
            )));
        }

        let messaging_id = element
            .attr_ns(WSU_NS, "Id")
            .map(String::from)
            .unwrap_or_else(new_messaging_id);
        let must_understand = element
            .attr_ns(soap_version.namespace(), "mustUnderstand")
            .map(|v| v == "1" || v == "true")
            .unwrap_or(false);

        let kind = if let Some(user) = element.child(EBMS_NS, "UserMessage") {
            MessageKind::User(parse_user_message(user)?)
        } else if let Some(signal) = element.child(EBMS_NS, "SignalMessage") {
            parse_signal_message(block, signal)?
        } else {
            return Err(As4Error::Validation(
                "eb:Messaging contains neither a UserMessage nor a SignalMessage".to_string(),
            ));
        };

        Ok(Self {
            soap_version,
            messaging_id,
            must_understand,
            kind,
        })
    }
}

fn write_message_info(out: &mut String, info: &MessageInfo) {
    out.push_str("<eb:MessageInfo>");
    out.push_str(&format!(
        "<eb:Timestamp>{}</eb:Timestamp><eb:MessageId>{}</eb:MessageId>",
        info.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        escape(&info.message_id)
    ));
    if let Some(ref_to) = &info.ref_to_message_id {
        out.push_str(&format!("<eb:RefToMessageId>{}</eb:RefToMessageId>", escape(ref_to)));
    }
    out.push_str("</eb:MessageInfo>");
}

fn write_party(out: &mut String, tag: &str, party: &Party) {
    out.push_str(&format!("<eb:{}>", tag));
    match &party.party_id.party_type {
        Some(t) => out.push_str(&format!(
            r#"<eb:PartyId type="{}">{}</eb:PartyId>"#,
            escape(t),
            escape(&party.party_id.value)
        )),
        None => out.push_str(&format!(
            "<eb:PartyId>{}</eb:PartyId>",
            escape(&party.party_id.value)
        )),
    }
    out.push_str(&format!("<eb:Role>{}</eb:Role></eb:{}>", escape(&party.role), tag));
}

fn write_properties(out: &mut String, properties: &[Property]) {
    for p in properties {
        out.push_str(&format!(
            r#"<eb:Property name="{}">{}</eb:Property>"#,
            escape(&p.name),
            escape(&p.value)
        ));
    }
}

/// Serialize an `eb:UserMessage` element (used for receipts echoing it).
pub fn user_message_xml(message: &UserMessage) -> String {
    let mut out = String::new();
    write_user_message(&mut out, message);
    out
}

fn write_user_message(out: &mut String, m: &UserMessage) {
    out.push_str("<eb:UserMessage>");
    write_message_info(out, &m.message_info);

    out.push_str("<eb:PartyInfo>");
    write_party(out, "From", &m.party_info.from);
    write_party(out, "To", &m.party_info.to);
    out.push_str("</eb:PartyInfo>");

    let c = &m.collaboration_info;
    out.push_str("<eb:CollaborationInfo>");
    if let Some(agreement) = &c.agreement_ref {
        out.push_str(&format!("<eb:AgreementRef>{}</eb:AgreementRef>", escape(agreement)));
    }
    match &c.service.service_type {
        Some(t) => out.push_str(&format!(
            r#"<eb:Service type="{}">{}</eb:Service>"#,
            escape(t),
            escape(&c.service.value)
        )),
        None => out.push_str(&format!("<eb:Service>{}</eb:Service>", escape(&c.service.value))),
    }
    out.push_str(&format!(
        "<eb:Action>{}</eb:Action><eb:ConversationId>{}</eb:ConversationId>",
        escape(&c.action),
        escape(&c.conversation_id)
    ));
    out.push_str("</eb:CollaborationInfo>");

    if !m.message_properties.is_empty() {
        out.push_str("<eb:MessageProperties>");
        write_properties(out, &m.message_properties);
        out.push_str("</eb:MessageProperties>");
    }

    if !m.payload_info.is_empty() {
        out.push_str("<eb:PayloadInfo>");
        for part in &m.payload_info {
            match &part.href {
                Some(href) => out.push_str(&format!(r#"<eb:PartInfo href="{}">"#, escape(href))),
                None => out.push_str("<eb:PartInfo>"),
            }
            let mut properties = Vec::new();
            if let Some(mime) = &part.mime_type {
                properties.push(Property::new(PROPERTY_MIME_TYPE, mime.clone()));
            }
            if let Some(compression) = part.compression {
                properties.push(Property::new(PROPERTY_COMPRESSION_TYPE, compression.mime_type()));
            }
            properties.extend(part.properties.iter().cloned());
            if !properties.is_empty() {
                out.push_str("<eb:PartProperties>");
                write_properties(out, &properties);
                out.push_str("</eb:PartProperties>");
            }
            out.push_str("</eb:PartInfo>");
        }
        out.push_str("</eb:PayloadInfo>");
    }

    out.push_str("</eb:UserMessage>");
}

fn write_error(out: &mut String, e: &ErrorDetail) {
    out.push_str(&format!(
        r#"<eb:Error category="{}" errorCode="{}" origin="{}" severity="{}" shortDescription="{}""#,
        e.category.as_str(),
        e.code.wire_code(),
        e.origin.as_str(),
        e.severity.as_str(),
        escape(&e.short_description)
    ));
    if let Some(ref_to) = &e.ref_to_message_id {
        out.push_str(&format!(r#" refToMessageInError="{}""#, escape(ref_to)));
    }
    out.push('>');
    if !e.long_description.is_empty() {
        out.push_str(&format!(
            r#"<eb:Description xml:lang="en">{}</eb:Description>"#,
            escape(&e.long_description)
        ));
    }
    if let Some(detail) = &e.detail {
        out.push_str(&format!("<eb:ErrorDetail>{}</eb:ErrorDetail>", escape(detail)));
    }
    out.push_str("</eb:Error>");
}

fn required_text(parent: &Element, name: &str) -> Result<String, As4Error> {
    parent
        .child_text(EBMS_NS, name)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            As4Error::Validation(format!("eb:{} is missing in eb:{}", name, parent.local_name))
        })
}

fn required_child<'a>(parent: &'a Element, name: &str) -> Result<&'a Element, As4Error> {
    parent.child(EBMS_NS, name).ok_or_else(|| {
        As4Error::Validation(format!("eb:{} is missing in eb:{}", name, parent.local_name))
    })
}

fn parse_message_info(parent: &Element) -> Result<MessageInfo, As4Error> {
    let info = required_child(parent, "MessageInfo")?;
    let timestamp_text = required_text(info, "Timestamp")?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp_text)
        .map_err(|_| As4Error::Validation(format!("Invalid timestamp '{}'", timestamp_text)))?
        .with_timezone(&Utc);
    Ok(MessageInfo {
        timestamp,
        message_id: required_text(info, "MessageId")?,
        ref_to_message_id: info.child_text(EBMS_NS, "RefToMessageId"),
    })
}

fn parse_party(parent: &Element, name: &str) -> Result<Party, As4Error> {
    let party = required_child(parent, name)?;
    let party_id = required_child(party, "PartyId")?;
    Ok(Party {
        party_id: PartyId {
            value: party_id.text.trim().to_string(),
            party_type: party_id.attr("type").map(String::from),
        },
        role: required_text(party, "Role")?,
    })
}

fn parse_properties(parent: &Element) -> Vec<Property> {
    parent
        .children_named(EBMS_NS, "Property")
        .map(|p| Property::new(p.attr("name").unwrap_or_default(), p.text.trim()))
        .collect()
}

fn parse_user_message(user: &Element) -> Result<UserMessage, As4Error> {
    let message_info = parse_message_info(user)?;

    let party_info_el = required_child(user, "PartyInfo")?;
    let party_info = PartyInfo {
        from: parse_party(party_info_el, "From")?,
        to: parse_party(party_info_el, "To")?,
    };

    let collab = required_child(user, "CollaborationInfo")?;
    let service = required_child(collab, "Service")?;
    let collaboration_info = CollaborationInfo {
        agreement_ref: collab.child_text(EBMS_NS, "AgreementRef"),
        service: Service {
            value: service.text.trim().to_string(),
            service_type: service.attr("type").map(String::from),
        },
        action: required_text(collab, "Action")?,
        conversation_id: required_text(collab, "ConversationId")?,
    };

    let message_properties = user
        .child(EBMS_NS, "MessageProperties")
        .map(parse_properties)
        .unwrap_or_default();

    let mut payload_info = Vec::new();
    if let Some(payload) = user.child(EBMS_NS, "PayloadInfo") {
        for part in payload.children_named(EBMS_NS, "PartInfo") {
            let mut mime_type = None;
            let mut compression = None;
            let mut properties = Vec::new();
            if let Some(props) = part.child(EBMS_NS, "PartProperties") {
                for p in parse_properties(props) {
                    if p.name == PROPERTY_MIME_TYPE {
                        mime_type = Some(p.value);
                    } else if p.name == PROPERTY_COMPRESSION_TYPE {
                        compression = Some(CompressionType::from_mime_type(&p.value).ok_or_else(
                            || {
                                As4Error::Validation(format!(
                                    "Unsupported compression type '{}'",
                                    p.value
                                ))
                            },
                        )?);
                    } else {
                        properties.push(p);
                    }
                }
            }
            payload_info.push(PartInfo {
                href: part.attr("href").map(String::from),
                mime_type,
                compression,
                properties,
            });
        }
    }

    Ok(UserMessage {
        message_info,
        party_info,
        collaboration_info,
        message_properties,
        payload_info,
        body: None,
        attachments: Vec::new(),
    })
}

fn parse_signal_message(block: &HeaderBlock, signal: &Element) -> Result<MessageKind, As4Error> {
    let message_info = parse_message_info(signal)?;

    if let Some(receipt) = signal.child(EBMS_NS, "Receipt") {
        let content = match receipt.child(EBBP_NS, "NonRepudiationInformation") {
            Some(nri) => {
                let mut digests = Vec::new();
                for part in nri.children_named(EBBP_NS, "MessagePartNRInformation") {
                    if let Some(reference) = part.child(DS_NS, "Reference") {
                        digests.push(PartDigest {
                            uri: reference.attr("URI").unwrap_or_default().to_string(),
                            digest_value: reference
                                .child_text(DS_NS, "DigestValue")
                                .unwrap_or_default(),
                        });
                    }
                }
                ReceiptContent::NonRepudiation(digests)
            }
            None => ReceiptContent::UserMessageEcho(block.inner_raw_of(receipt).to_string()),
        };
        return Ok(MessageKind::Receipt(Receipt {
            message_info,
            content,
        }));
    }

    let mut errors = Vec::new();
    for error in signal.children_named(EBMS_NS, "Error") {
        let wire = error.attr("errorCode").unwrap_or_default();
        let code = ErrorCode::from_wire_code(wire)
            .ok_or_else(|| As4Error::Validation(format!("Unknown error code '{}'", wire)))?;
        let mut detail = ErrorDetail::new(code, error.attr("refToMessageInError"));
        if let Some(category) = error.attr("category").and_then(ErrorCategory::from_str_opt) {
            detail.category = category;
        }
        if let Some(severity) = error.attr("severity").and_then(Severity::from_str_opt) {
            detail.severity = severity;
        }
        if let Some(short) = error.attr("shortDescription") {
            detail.short_description = short.to_string();
        }
        if let Some(origin) = error.attr("origin") {
            detail.origin = match origin {
                "content" => ErrorOrigin::Content,
                _ => ErrorOrigin::Processing,
            };
        }
        if let Some(description) = error.child_text(EBMS_NS, "Description") {
            detail.long_description = description;
        }
        detail.detail = error.child_text(EBMS_NS, "ErrorDetail");
        errors.push(detail);
    }

    if errors.is_empty() {
        return Err(As4Error::Validation(
            "eb:SignalMessage contains neither a Receipt nor an Error".to_string(),
        ));
    }

    Ok(MessageKind::Error(ErrorSignal {
        message_info,
        errors,
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pmode::tests::sample_pmode;

    pub(crate) fn invoice_message() -> UserMessage {
        let pmode = sample_pmode();
        UserMessage::build(
            CollaborationInfo::from_pmode(&pmode, "c1"),
            PartyInfo::from_pmode(&pmode),
            vec![PartInfo::attachment("invoice.xml", "application/xml")],
            None,
            vec![Attachment::new(
                "invoice.xml",
                "application/xml",
                b"<Invoice><ID>42</ID></Invoice>".to_vec(),
            )],
        )
        .unwrap()
    }

    fn reparse(message: &As4Message) -> As4Message {
        let block = HeaderBlock::parse(message.messaging_xml()).unwrap();
        As4Message::from_header_block(&block, message.soap_version()).unwrap()
    }

    #[test]
    fn test_messaging_id_is_ncname() {
        let id = new_messaging_id();
        assert!(!id.chars().next().unwrap().is_ascii_digit());
        assert_ne!(id, new_messaging_id());
    }

    #[test]
    fn test_user_message_round_trip() {
        let mut user = invoice_message();
        user.message_properties = vec![
            Property::new("originalSender", "urn:oasis:names:tc:ebcore:partyid-type:unregistered:C1"),
            Property::new("finalRecipient", "urn:oasis:names:tc:ebcore:partyid-type:unregistered:C4"),
        ];
        user.payload_info[0].compression = Some(CompressionType::Gzip);
        let message = As4Message::user(SoapVersion::Soap12, user.clone());

        let parsed = reparse(&message);
        assert_eq!(parsed.messaging_id(), message.messaging_id());
        assert!(parsed.must_understand());
        match parsed.into_kind() {
            MessageKind::User(parsed_user) => {
                // Payloads travel outside the header
                let mut expected = user;
                expected.attachments.clear();
                assert_eq!(parsed_user, expected);
            }
            other => panic!("Expected user message, got {:?}", other),
        }
    }

    #[test]
    fn test_must_understand_placement() {
        let message = As4Message::user(SoapVersion::Soap11, invoice_message());
        let xml = message.messaging_xml();
        assert!(xml.contains(r#"S11:mustUnderstand="1""#));

        let message = As4Message::user(SoapVersion::Soap12, invoice_message());
        assert!(message.messaging_xml().contains(r#"S12:mustUnderstand="true""#));

        let message = message.set_must_understand(false);
        assert!(!message.messaging_xml().contains("mustUnderstand"));
        assert!(!reparse(&message).must_understand());
    }

    #[test]
    fn test_build_rejects_missing_attachment() {
        let pmode = sample_pmode();
        let result = UserMessage::build(
            CollaborationInfo::from_pmode(&pmode, "c1"),
            PartyInfo::from_pmode(&pmode),
            vec![PartInfo::attachment("doc1", "application/xml")],
            None,
            Vec::new(),
        );
        assert!(matches!(result, Err(As4Error::Validation(_))));
    }

    #[test]
    fn test_build_rejects_unreferenced_attachment() {
        let pmode = sample_pmode();
        let result = UserMessage::build(
            CollaborationInfo::from_pmode(&pmode, "c1"),
            PartyInfo::from_pmode(&pmode),
            Vec::new(),
            None,
            vec![Attachment::new("doc1", "application/xml", vec![1])],
        );
        assert!(matches!(result, Err(As4Error::Validation(_))));
    }

    #[test]
    fn test_body_part_reference() {
        let pmode = sample_pmode();
        let build = |body: Option<String>| {
            UserMessage::build(
                CollaborationInfo::from_pmode(&pmode, "c1"),
                PartyInfo::from_pmode(&pmode),
                vec![PartInfo::body()],
                body,
                Vec::new(),
            )
        };
        assert!(build(Some("<a/>".to_string())).is_ok());
        assert!(build(None).is_err());
    }

    #[test]
    fn test_attach_payloads_allows_unreferenced_when_configured() {
        let mut user = invoice_message();
        let mut attachments = user.attachments.clone();
        attachments.push(Attachment::new("extra", "text/plain", b"x".to_vec()));

        assert!(matches!(
            user.attach_payloads(None, attachments.clone(), false),
            Err(As4Error::MimeInconsistency(_))
        ));
        assert!(user.attach_payloads(None, attachments, true).is_ok());
    }

    #[test]
    fn test_receipt_round_trip() {
        let nrr = Receipt::build(
            "msg-1@as4",
            ReceiptContent::NonRepudiation(vec![PartDigest {
                uri: "cid:invoice.xml".to_string(),
                digest_value: "abc=".to_string(),
            }]),
        );
        let message = As4Message::receipt(SoapVersion::Soap12, nrr.clone());
        assert_eq!(message.message_type(), MessageType::Signal);
        assert_eq!(reparse(&message).kind(), &MessageKind::Receipt(nrr));

        let echo = Receipt::build(
            "msg-2@as4",
            ReceiptContent::UserMessageEcho(user_message_xml(&invoice_message())),
        );
        let message = As4Message::receipt(SoapVersion::Soap11, echo.clone());
        assert_eq!(reparse(&message).kind(), &MessageKind::Receipt(echo));
    }

    #[test]
    fn test_error_signal() {
        assert!(ErrorSignal::build(Some("m".to_string()), Vec::new()).is_err());

        let signal = ErrorSignal::build(
            Some("msg-1@as4".to_string()),
            vec![
                ErrorDetail::new(ErrorCode::InvalidHeader, Some("msg-1@as4"))
                    .with_detail("eb:Action is missing"),
                ErrorDetail::new(ErrorCode::Other, Some("msg-1@as4")),
            ],
        )
        .unwrap();
        assert!(signal.is_failure());

        let message = As4Message::error(SoapVersion::Soap12, signal.clone());
        assert_eq!(reparse(&message).kind(), &MessageKind::Error(signal));
    }

    #[test]
    fn test_warning_only_error_is_not_failure() {
        let signal = ErrorSignal::build(
            None,
            vec![ErrorDetail::new(ErrorCode::FeatureNotSupported, None)],
        )
        .unwrap();
        assert!(!signal.is_failure());
    }
}
