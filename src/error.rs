//! Error types and the ebMS3 error taxonomy.
//!
//! [`ErrorCode`] is the fixed catalog of interoperability errors defined by
//! ebMS3 Core section 6.7 and the AS4 profile. Every error a pipeline reports
//! to a peer is selected from this table; free text only ever travels in the
//! optional `detail` of an [`ErrorDetail`](crate::message::ErrorDetail).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// AS4 message handler errors.
#[derive(Error, Debug)]
pub enum As4Error {
    #[error("XML parsing error: {0}")]
    XmlParse(String),

    #[error("Malformed SOAP envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("MIME inconsistency: {0}")]
    MimeInconsistency(String),

    #[error("Security error ({code}): {message}")]
    Security { code: ErrorCode, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("No PMode found for '{0}'")]
    PModeNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal consistency error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl As4Error {
    /// Create a security error carrying the taxonomy code to report.
    pub fn security(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Security {
            code,
            message: message.into(),
        }
    }

    /// The ebMS error code a peer should see for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::XmlParse(_) | Self::MalformedEnvelope(_) | Self::Validation(_) => {
                ErrorCode::InvalidHeader
            }
            Self::MimeInconsistency(_) => ErrorCode::MimeInconsistency,
            Self::Security { code, .. } => *code,
            Self::Transport(_) => ErrorCode::ConnectionFailure,
            Self::Compression(_) => ErrorCode::DecompressionFailure,
            Self::PModeNotFound(_) => ErrorCode::ProcessingModeMismatch,
            Self::Config(_) | Self::Internal(_) | Self::Io(_) => ErrorCode::Other,
        }
    }
}

/// Error category as defined by ebMS3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    Content,
    Packaging,
    Unpackaging,
    Communication,
    Processing,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Content => "Content",
            Self::Packaging => "Packaging",
            Self::Unpackaging => "UnPackaging",
            Self::Communication => "Communication",
            Self::Processing => "Processing",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "Content" => Some(Self::Content),
            "Packaging" => Some(Self::Packaging),
            "UnPackaging" | "Unpackaging" => Some(Self::Unpackaging),
            "Communication" => Some(Self::Communication),
            "Processing" => Some(Self::Processing),
            _ => None,
        }
    }
}

/// Error severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Failure,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Failure => "failure",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "warning" => Some(Self::Warning),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

/// Static description of an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorDescription {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub short_text: &'static str,
    pub long_text: &'static str,
}

/// ebMS3 / AS4 error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// EBMS:0001
    ValueNotRecognized,
    /// EBMS:0002
    FeatureNotSupported,
    /// EBMS:0003
    ValueInconsistent,
    /// EBMS:0004
    Other,
    /// EBMS:0005
    ConnectionFailure,
    /// EBMS:0006
    EmptyMessagePartitionChannel,
    /// EBMS:0007
    MimeInconsistency,
    /// EBMS:0008
    FeatureNotSupportedInconsistent,
    /// EBMS:0009
    InvalidHeader,
    /// EBMS:0010
    ProcessingModeMismatch,
    /// EBMS:0011
    ExternalPayloadError,
    /// EBMS:0101
    FailedAuthentication,
    /// EBMS:0102
    FailedDecryption,
    /// EBMS:0103
    PolicyNoncompliance,
    /// EBMS:0201
    DysfunctionalReliability,
    /// EBMS:0202
    DeliveryFailure,
    /// EBMS:0301
    MissingReceipt,
    /// EBMS:0302
    InvalidReceipt,
    /// EBMS:0303
    DecompressionFailure,
}

impl ErrorCode {
    /// Every code of the taxonomy, in wire-code order.
    pub const ALL: [ErrorCode; 19] = [
        Self::ValueNotRecognized,
        Self::FeatureNotSupported,
        Self::ValueInconsistent,
        Self::Other,
        Self::ConnectionFailure,
        Self::EmptyMessagePartitionChannel,
        Self::MimeInconsistency,
        Self::FeatureNotSupportedInconsistent,
        Self::InvalidHeader,
        Self::ProcessingModeMismatch,
        Self::ExternalPayloadError,
        Self::FailedAuthentication,
        Self::FailedDecryption,
        Self::PolicyNoncompliance,
        Self::DysfunctionalReliability,
        Self::DeliveryFailure,
        Self::MissingReceipt,
        Self::InvalidReceipt,
        Self::DecompressionFailure,
    ];

    /// Get the string code for this error.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValueNotRecognized => "VALUE_NOT_RECOGNIZED",
            Self::FeatureNotSupported => "FEATURE_NOT_SUPPORTED",
            Self::ValueInconsistent => "VALUE_INCONSISTENT",
            Self::Other => "OTHER",
            Self::ConnectionFailure => "CONNECTION_FAILURE",
            Self::EmptyMessagePartitionChannel => "EMPTY_MESSAGE_PARTITION_CHANNEL",
            Self::MimeInconsistency => "MIME_INCONSISTENCY",
            Self::FeatureNotSupportedInconsistent => "FEATURE_NOT_SUPPORTED_INCONSISTENT",
            Self::InvalidHeader => "INVALID_HEADER",
            Self::ProcessingModeMismatch => "PROCESSING_MODE_MISMATCH",
            Self::ExternalPayloadError => "EXTERNAL_PAYLOAD_ERROR",
            Self::FailedAuthentication => "FAILED_AUTHENTICATION",
            Self::FailedDecryption => "FAILED_DECRYPTION",
            Self::PolicyNoncompliance => "POLICY_NONCOMPLIANCE",
            Self::DysfunctionalReliability => "DYSFUNCTIONAL_RELIABILITY",
            Self::DeliveryFailure => "DELIVERY_FAILURE",
            Self::MissingReceipt => "MISSING_RECEIPT",
            Self::InvalidReceipt => "INVALID_RECEIPT",
            Self::DecompressionFailure => "DECOMPRESSION_FAILURE",
        }
    }

    /// The `errorCode` attribute value used on the wire.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::ValueNotRecognized => "EBMS:0001",
            Self::FeatureNotSupported => "EBMS:0002",
            Self::ValueInconsistent => "EBMS:0003",
            Self::Other => "EBMS:0004",
            Self::ConnectionFailure => "EBMS:0005",
            Self::EmptyMessagePartitionChannel => "EBMS:0006",
            Self::MimeInconsistency => "EBMS:0007",
            Self::FeatureNotSupportedInconsistent => "EBMS:0008",
            Self::InvalidHeader => "EBMS:0009",
            Self::ProcessingModeMismatch => "EBMS:0010",
            Self::ExternalPayloadError => "EBMS:0011",
            Self::FailedAuthentication => "EBMS:0101",
            Self::FailedDecryption => "EBMS:0102",
            Self::PolicyNoncompliance => "EBMS:0103",
            Self::DysfunctionalReliability => "EBMS:0201",
            Self::DeliveryFailure => "EBMS:0202",
            Self::MissingReceipt => "EBMS:0301",
            Self::InvalidReceipt => "EBMS:0302",
            Self::DecompressionFailure => "EBMS:0303",
        }
    }

    /// Look a code up by its wire representation (`EBMS:0009`).
    pub fn from_wire_code(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.wire_code() == code)
    }

    /// Describe this code.
    pub fn describe(&self) -> ErrorDescription {
        use ErrorCategory::*;
        use Severity::*;

        let (category, severity, short_text, long_text) = match self {
            Self::ValueNotRecognized => (
                Content,
                Failure,
                "ValueNotRecognized",
                "Although the message document is well formed and schema valid, some element/attribute contains a value that could not be recognized and therefore could not be used by the MSH.",
            ),
            Self::FeatureNotSupported => (
                Content,
                Warning,
                "FeatureNotSupported",
                "Although the message document is well formed and schema valid, some element/attribute value cannot be processed as expected because the related feature is not supported by the MSH.",
            ),
            Self::ValueInconsistent => (
                Content,
                Failure,
                "ValueInconsistent",
                "Although the message document is well formed and schema valid, some element/attribute value is inconsistent either with the content of other element/attribute, or with the processing mode of the MSH, or with the normative requirements of the ebMS specification.",
            ),
            Self::Other => (Content, Failure, "Other", ""),
            Self::ConnectionFailure => (
                Communication,
                Failure,
                "ConnectionFailure",
                "The MSH is experiencing temporary or permanent failure in trying to open a transport connection with a remote MSH.",
            ),
            Self::EmptyMessagePartitionChannel => (
                Communication,
                Warning,
                "EmptyMessagePartitionChannel",
                "There is no message available for pulling from this MPC at this moment.",
            ),
            Self::MimeInconsistency => (
                Unpackaging,
                Failure,
                "MimeInconsistency",
                "The use of MIME is not consistent with the required usage in this specification.",
            ),
            Self::FeatureNotSupportedInconsistent => (
                Unpackaging,
                Failure,
                "FeatureNotSupported",
                "Although the message document is well formed and schema valid, the presence or absence of some element/attribute is not consistent with the capability of the MSH, with respect to supported features.",
            ),
            Self::InvalidHeader => (
                Unpackaging,
                Failure,
                "InvalidHeader",
                "The ebMS header is either not well formed as an XML document, or does not conform to the ebMS packaging rules.",
            ),
            Self::ProcessingModeMismatch => (
                Processing,
                Failure,
                "ProcessingModeMismatch",
                "The ebMS header or another header (e.g. reliability, security) expected by the MSH is not compatible with the expected content, based on the associated P-Mode.",
            ),
            Self::ExternalPayloadError => (
                Content,
                Failure,
                "ExternalPayloadError",
                "The MSH is unable to resolve an external payload reference (i.e. a Part that is not contained within the ebMS Message, as identified by a PartInfo/href URI).",
            ),
            Self::FailedAuthentication => (
                Processing,
                Failure,
                "FailedAuthentication",
                "The signature in the Security header intended for the \"ebms\" SOAP actor, could not be validated by the Security module.",
            ),
            Self::FailedDecryption => (
                Processing,
                Failure,
                "FailedDecryption",
                "The encrypted data reference the Security header intended for the \"ebms\" SOAP actor could not be decrypted by the Security Module.",
            ),
            Self::PolicyNoncompliance => (
                Processing,
                Failure,
                "PolicyNoncompliance",
                "The processor determined that the message's security methods, parameters, scope or other security policy-level requirements or agreements were not satisfied.",
            ),
            Self::DysfunctionalReliability => (
                Processing,
                Failure,
                "DysfunctionalReliability",
                "Some reliability function as implemented by the Reliability module, is not operational, or the reliability state associated with this message sequence is not valid.",
            ),
            Self::DeliveryFailure => (
                Communication,
                Failure,
                "DeliveryFailure",
                "Although the message was sent under Guaranteed delivery requirement, the Reliability module could not get assurance that the message was properly delivered, in spite of resending efforts.",
            ),
            Self::MissingReceipt => (
                Communication,
                Failure,
                "MissingReceipt",
                "A Receipt has not been received for a message that was previously sent by the MSH generating this error.",
            ),
            Self::InvalidReceipt => (
                Communication,
                Failure,
                "InvalidReceipt",
                "A Receipt has been received for a message that was previously sent by the MSH generating this error, but the content does not match the message content (e.g. some part has not been acknowledged, or the digest associated does not match the signature digest, for NRR).",
            ),
            Self::DecompressionFailure => (
                Content,
                Failure,
                "DecompressionFailure",
                "An error occurred during the decompression.",
            ),
        };

        ErrorDescription {
            category,
            severity,
            short_text,
            long_text,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
