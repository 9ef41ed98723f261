//! ebMS header validation.
//!
//! The `eb:Messaging` block is checked against the ebMS3 packaging rules on
//! its element tree, before it is turned into an [`As4Message`]. All
//! violations are collected so a peer gets every problem in one error signal.
//!
//! [`As4Message`]: crate::message::As4Message

use crate::envelope::HeaderBlock;
use crate::error::ErrorCode;
use crate::xml::{Element, EBMS_NS};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Allowed clock skew for message timestamps in the future.
const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Error code to report
    pub code: ErrorCode,
    /// Human-readable description
    pub message: String,
}

impl Violation {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn header(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidHeader, message)
    }
}

/// Result of header validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Violations found
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    /// Check if any violations were found.
    pub fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }

    /// Add a violation.
    pub fn add_violation(&mut self, violation: Violation) {
        self.violations.push(violation);
    }
}

/// The "validate against schema" capability for the `eb:Messaging` block.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, messaging: &HeaderBlock) -> ValidationResult;
}

/// Built-in validator enforcing the ebMS3 core packaging rules.
#[derive(Debug, Clone, Default)]
pub struct EbmsHeaderValidator;

impl EbmsHeaderValidator {
    pub fn new() -> Self {
        Self
    }

    fn validate_message_info(&self, parent: &Element, result: &mut ValidationResult) {
        let Some(info) = parent.child(EBMS_NS, "MessageInfo") else {
            result.add_violation(Violation::header(format!(
                "eb:MessageInfo is missing in eb:{}",
                parent.local_name
            )));
            return;
        };

        match info.child_text(EBMS_NS, "Timestamp") {
            Some(ts) if !ts.is_empty() => {
                if let Err(v) = validate_timestamp(&ts) {
                    result.add_violation(v);
                }
            }
            _ => result.add_violation(Violation::header("eb:Timestamp is missing")),
        }

        match info.child_text(EBMS_NS, "MessageId") {
            Some(id) if !id.is_empty() => {
                if let Err(v) = validate_message_id(&id, "eb:MessageId") {
                    result.add_violation(v);
                }
            }
            _ => result.add_violation(Violation::header("eb:MessageId is missing")),
        }

        if let Some(ref_to) = info.child_text(EBMS_NS, "RefToMessageId") {
            if let Err(v) = validate_message_id(&ref_to, "eb:RefToMessageId") {
                result.add_violation(v);
            }
        }
    }

    fn validate_party(&self, party_info: &Element, name: &str, result: &mut ValidationResult) {
        let Some(party) = party_info.child(EBMS_NS, name) else {
            result.add_violation(Violation::header(format!("eb:{} is missing", name)));
            return;
        };

        let ids: Vec<_> = party.children_named(EBMS_NS, "PartyId").collect();
        if ids.is_empty() {
            result.add_violation(Violation::header(format!("eb:{} has no eb:PartyId", name)));
        }
        for id in ids {
            if id.text.trim().is_empty() {
                result.add_violation(Violation::header(format!("eb:{}/eb:PartyId is empty", name)));
            }
        }
        if party.child_text(EBMS_NS, "Role").map_or(true, |r| r.is_empty()) {
            result.add_violation(Violation::header(format!("eb:{}/eb:Role is missing", name)));
        }
    }

    fn validate_user_message(&self, user: &Element, result: &mut ValidationResult) {
        self.validate_message_info(user, result);

        match user.child(EBMS_NS, "PartyInfo") {
            Some(party_info) => {
                self.validate_party(party_info, "From", result);
                self.validate_party(party_info, "To", result);
            }
            None => result.add_violation(Violation::header("eb:PartyInfo is missing")),
        }

        match user.child(EBMS_NS, "CollaborationInfo") {
            Some(collab) => {
                for name in ["Service", "Action", "ConversationId"] {
                    if collab.child_text(EBMS_NS, name).map_or(true, |v| v.is_empty()) {
                        result.add_violation(Violation::header(format!(
                            "eb:CollaborationInfo/eb:{} is missing",
                            name
                        )));
                    }
                }
            }
            None => result.add_violation(Violation::header("eb:CollaborationInfo is missing")),
        }

        if let Some(properties) = user.child(EBMS_NS, "MessageProperties") {
            validate_properties(properties, "eb:MessageProperties", result);
        }

        if let Some(payload) = user.child(EBMS_NS, "PayloadInfo") {
            for part in payload.children_named(EBMS_NS, "PartInfo") {
                if let Some(href) = part.attr("href") {
                    let valid = href.strip_prefix("cid:").is_some_and(|cid| !cid.is_empty())
                        || href.starts_with('#');
                    if !valid {
                        result.add_violation(Violation::new(
                            ErrorCode::ExternalPayloadError,
                            format!("Part reference '{}' cannot be resolved inside the message", href),
                        ));
                    }
                }
                if let Some(properties) = part.child(EBMS_NS, "PartProperties") {
                    validate_properties(properties, "eb:PartProperties", result);
                }
            }
        }
    }

    fn validate_signal_message(&self, signal: &Element, result: &mut ValidationResult) {
        self.validate_message_info(signal, result);

        let receipt = signal.child(EBMS_NS, "Receipt");
        let errors: Vec<_> = signal.children_named(EBMS_NS, "Error").collect();

        if receipt.is_none() && errors.is_empty() {
            result.add_violation(Violation::header(
                "eb:SignalMessage contains neither eb:Receipt nor eb:Error",
            ));
        }

        if receipt.is_some() {
            let has_ref = signal
                .child(EBMS_NS, "MessageInfo")
                .and_then(|i| i.child_text(EBMS_NS, "RefToMessageId"))
                .is_some_and(|r| !r.is_empty());
            if !has_ref {
                result.add_violation(Violation::header("A receipt needs eb:RefToMessageId"));
            }
        }

        for error in errors {
            match error.attr("errorCode") {
                Some(code) if ErrorCode::from_wire_code(code).is_some() => {}
                Some(code) => result.add_violation(Violation::new(
                    ErrorCode::ValueNotRecognized,
                    format!("Unknown error code '{}'", code),
                )),
                None => result.add_violation(Violation::header("eb:Error without errorCode")),
            }
            if error.attr("severity").is_none() {
                result.add_violation(Violation::header("eb:Error without severity"));
            }
        }
    }
}

impl SchemaValidator for EbmsHeaderValidator {
    fn validate(&self, messaging: &HeaderBlock) -> ValidationResult {
        let mut result = ValidationResult::default();
        let element = &messaging.element;

        if !element.is(EBMS_NS, "Messaging") {
            result.add_violation(Violation::header(format!(
                "Expected eb:Messaging, found '{}'",
                element.local_name
            )));
            return result;
        }

        let users: Vec<_> = element.children_named(EBMS_NS, "UserMessage").collect();
        let signals: Vec<_> = element.children_named(EBMS_NS, "SignalMessage").collect();

        match (users.len(), signals.len()) {
            (1, 0) => self.validate_user_message(users[0], &mut result),
            (0, 1) => self.validate_signal_message(signals[0], &mut result),
            (0, 0) => result.add_violation(Violation::header(
                "eb:Messaging contains neither eb:UserMessage nor eb:SignalMessage",
            )),
            (u, s) => result.add_violation(Violation::new(
                ErrorCode::FeatureNotSupportedInconsistent,
                format!(
                    "Message bundling is not supported ({} user and {} signal messages)",
                    u, s
                ),
            )),
        }

        debug!(violations = result.violations.len(), "eb:Messaging validated");
        result
    }
}

fn validate_properties(parent: &Element, context: &str, result: &mut ValidationResult) {
    for property in parent.children_named(EBMS_NS, "Property") {
        if property.attr("name").map_or(true, str::is_empty) {
            result.add_violation(Violation::header(format!(
                "{}/eb:Property without name",
                context
            )));
        }
    }
}

/// MessageIds follow RFC 2822 msg-id without the angle brackets.
fn validate_message_id(id: &str, field: &str) -> Result<(), Violation> {
    if id.starts_with('<') || id.ends_with('>') {
        return Err(Violation::header(format!(
            "{} '{}' must not be enclosed in angle brackets",
            field, id
        )));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(Violation::header(format!("{} '{}' contains whitespace", field, id)));
    }
    Ok(())
}

fn validate_timestamp(value: &str) -> Result<(), Violation> {
    let timestamp = DateTime::parse_from_rfc3339(value)
        .map_err(|_| Violation::header(format!("Invalid timestamp format: {}", value)))?
        .with_timezone(&Utc);

    let skew = timestamp.signed_duration_since(Utc::now());
    if skew > chrono::Duration::seconds(MAX_CLOCK_SKEW_SECS) {
        return Err(Violation::header(format!(
            "Timestamp {} is in the future",
            value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SoapVersion;
    use crate::message::tests::invoice_message;
    use crate::message::{As4Message, ErrorDetail, ErrorSignal, Receipt, ReceiptContent};

    fn block(xml: &str) -> HeaderBlock {
        HeaderBlock::parse(xml.to_string()).unwrap()
    }

    fn messaging(inner: &str) -> HeaderBlock {
        block(&format!(r#"<eb:Messaging xmlns:eb="{}">{}</eb:Messaging>"#, EBMS_NS, inner))
    }

    // --- Valid messages ---

    #[test]
    fn test_valid_user_message() {
        let message = As4Message::user(SoapVersion::Soap12, invoice_message());
        let result = EbmsHeaderValidator::new().validate(&block(&message.messaging_xml()));
        assert!(!result.has_violations(), "{:?}", result.violations);
    }

    #[test]
    fn test_valid_signals() {
        let receipt = As4Message::receipt(
            SoapVersion::Soap11,
            Receipt::build("m1@as4", ReceiptContent::NonRepudiation(Vec::new())),
        );
        let result = EbmsHeaderValidator::new().validate(&block(&receipt.messaging_xml()));
        assert!(!result.has_violations());

        let error = As4Message::error(
            SoapVersion::Soap12,
            ErrorSignal::build(
                Some("m1@as4".to_string()),
                vec![ErrorDetail::new(ErrorCode::Other, Some("m1@as4"))],
            )
            .unwrap(),
        );
        let result = EbmsHeaderValidator::new().validate(&block(&error.messaging_xml()));
        assert!(!result.has_violations());
    }

    // --- Violations ---

    #[test]
    fn test_violations_are_batched() {
        let header = messaging(
            r#"<eb:UserMessage>
  <eb:MessageInfo><eb:Timestamp>yesterday</eb:Timestamp></eb:MessageInfo>
  <eb:PartyInfo><eb:From><eb:PartyId>a</eb:PartyId><eb:Role>r</eb:Role></eb:From></eb:PartyInfo>
  <eb:CollaborationInfo><eb:Service>s</eb:Service></eb:CollaborationInfo>
</eb:UserMessage>"#,
        );
        let result = EbmsHeaderValidator::new().validate(&header);

        let messages: Vec<_> = result.violations.iter().map(|v| v.message.as_str()).collect();
        assert!(messages.iter().any(|m| m.contains("Invalid timestamp")));
        assert!(messages.iter().any(|m| m.contains("eb:MessageId is missing")));
        assert!(messages.iter().any(|m| m.contains("eb:To is missing")));
        assert!(messages.iter().any(|m| m.contains("eb:Action is missing")));
        assert!(messages.iter().any(|m| m.contains("eb:ConversationId is missing")));
        assert!(result.violations.iter().all(|v| v.code == ErrorCode::InvalidHeader));
    }

    #[test]
    fn test_empty_messaging() {
        let result = EbmsHeaderValidator::new().validate(&messaging(""));
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].code, ErrorCode::InvalidHeader);
    }

    #[test]
    fn test_bundling_not_supported() {
        let user = As4Message::user(SoapVersion::Soap12, invoice_message());
        let xml = user.messaging_xml();
        let start = xml.find("<eb:UserMessage>").unwrap();
        let end = xml.find("</eb:Messaging>").unwrap();
        let inner = &xml[start..end];
        let result = EbmsHeaderValidator::new().validate(&messaging(&format!("{}{}", inner, inner)));
        assert_eq!(result.violations[0].code, ErrorCode::FeatureNotSupportedInconsistent);
    }

    #[test]
    fn test_message_id_rules() {
        assert!(validate_message_id("abc@example.org", "id").is_ok());
        assert!(validate_message_id("<abc@example.org>", "id").is_err());
        assert!(validate_message_id("abc def", "id").is_err());
    }

    #[test]
    fn test_future_timestamp() {
        let future = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        assert!(validate_timestamp(&future).is_err());
        let now = Utc::now().to_rfc3339();
        assert!(validate_timestamp(&now).is_ok());
    }

    #[test]
    fn test_external_payload_reference() {
        let header = messaging(
            r#"<eb:UserMessage><eb:PayloadInfo><eb:PartInfo href="http://example.org/doc"/></eb:PayloadInfo></eb:UserMessage>"#,
        );
        let result = EbmsHeaderValidator::new().validate(&header);
        assert!(result
            .violations
            .iter()
            .any(|v| v.code == ErrorCode::ExternalPayloadError));
    }

    #[test]
    fn test_receipt_without_reference() {
        let header = messaging(
            r#"<eb:SignalMessage><eb:MessageInfo><eb:Timestamp>2024-01-01T00:00:00Z</eb:Timestamp><eb:MessageId>r1@x</eb:MessageId></eb:MessageInfo><eb:Receipt/></eb:SignalMessage>"#,
        );
        let result = EbmsHeaderValidator::new().validate(&header);
        assert_eq!(result.violations.len(), 1);
        assert!(result.violations[0].message.contains("RefToMessageId"));
    }

    #[test]
    fn test_unknown_error_code() {
        let header = messaging(
            r#"<eb:SignalMessage><eb:MessageInfo><eb:Timestamp>2024-01-01T00:00:00Z</eb:Timestamp><eb:MessageId>e1@x</eb:MessageId></eb:MessageInfo><eb:Error errorCode="EBMS:9999" severity="failure"/></eb:SignalMessage>"#,
        );
        let result = EbmsHeaderValidator::new().validate(&header);
        assert_eq!(result.violations[0].code, ErrorCode::ValueNotRecognized);
    }
}
