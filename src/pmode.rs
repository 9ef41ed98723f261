//! Processing modes (PModes).
//!
//! A PMode is the agreement between two MSHs for one kind of exchange: who
//! talks to whom, for which service/action, with which security and
//! reliability. PModes are read-only input to both pipelines.

use crate::config::SoapVersion;
use crate::error::As4Error;
use crate::message::UserMessage;
use crate::security::Certificate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default ebMS role URIs.
pub const DEFAULT_INITIATOR_ROLE: &str =
    "http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/core/200704/initiator";
pub const DEFAULT_RESPONDER_ROLE: &str =
    "http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/core/200704/responder";

/// Processing mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PMode {
    /// Unique PMode id
    pub id: String,

    /// AgreementRef value carried in CollaborationInfo
    #[serde(default)]
    pub agreement_ref: Option<String>,

    /// SOAP version for messages under this PMode
    #[serde(default)]
    pub soap_version: SoapVersion,

    /// Sending party
    pub initiator: PModeParty,

    /// Receiving party
    pub responder: PModeParty,

    /// Service value
    pub service: String,

    /// Service type attribute
    #[serde(default)]
    pub service_type: Option<String>,

    /// Action value
    pub action: String,

    /// Recipient endpoint; resolved through the directory when absent
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Security requirements
    #[serde(default)]
    pub security: PModeSecurity,

    /// Reliability requirements; `None` means no receipt is expected
    #[serde(default)]
    pub reliability: Option<ReliabilityConfig>,

    /// Compress attachments with gzip before sending
    #[serde(default)]
    pub compress: bool,
}

/// A party of a PMode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PModeParty {
    pub party_id: String,
    #[serde(default)]
    pub party_id_type: Option<String>,
    pub role: String,
}

/// Security requirements of a PMode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PModeSecurity {
    /// Sign outgoing messages and require signed incoming messages
    pub sign: bool,

    /// Encrypt outgoing attachments and require encrypted incoming attachments
    pub encrypt: bool,

    /// Signature algorithm
    pub algorithm: SignatureAlgorithm,

    /// Base64 certificate (public key) of the peer, trusted for signature verification
    pub peer_certificate: Option<String>,
}

/// Signature algorithms understood by the built-in provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureAlgorithm {
    #[default]
    Ed25519,
}

impl SignatureAlgorithm {
    /// XML-DSig algorithm URI.
    pub fn uri(&self) -> &'static str {
        match self {
            Self::Ed25519 => "http://www.w3.org/2021/04/xmldsig-more#eddsa-ed25519",
        }
    }
}

/// Reliability parameters.
///
/// Retry policy has no defaults: it is part of the agreement and must be
/// stated explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Total send attempts including the first one
    pub max_attempts: u32,

    /// Delay between attempts in milliseconds
    pub retry_interval_ms: u64,

    /// Reply with non-repudiation receipts instead of a user message echo
    #[serde(default)]
    pub non_repudiation: bool,
}

impl PMode {
    /// Check field constraints.
    pub fn validate(&self) -> Result<(), As4Error> {
        if self.id.trim().is_empty() {
            return Err(As4Error::Config("PMode id must not be empty".to_string()));
        }
        if self.service.trim().is_empty() || self.action.trim().is_empty() {
            return Err(As4Error::Config(format!(
                "PMode '{}' needs a service and an action",
                self.id
            )));
        }
        if let Some(reliability) = &self.reliability {
            if reliability.max_attempts == 0 {
                return Err(As4Error::Config(format!(
                    "PMode '{}': max_attempts must be at least 1",
                    self.id
                )));
            }
        }
        if self.security.peer_certificate.is_some() {
            self.trusted_certificate()?;
        }
        Ok(())
    }

    /// Whether the peer must answer with a receipt.
    pub fn receipt_required(&self) -> bool {
        self.reliability.is_some()
    }

    /// Decoded trusted peer certificate.
    pub fn trusted_certificate(&self) -> Result<Option<Certificate>, As4Error> {
        self.security
            .peer_certificate
            .as_deref()
            .map(Certificate::from_base64)
            .transpose()
    }

    /// Compare an incoming user message header with this agreement.
    ///
    /// Returns one description per mismatching field.
    pub fn mismatches(&self, message: &UserMessage) -> Vec<String> {
        let mut found = Vec::new();
        let collaboration = &message.collaboration_info;

        if collaboration.service.value != self.service {
            found.push(format!(
                "Service '{}' does not match '{}'",
                collaboration.service.value, self.service
            ));
        }
        if collaboration.action != self.action {
            found.push(format!(
                "Action '{}' does not match '{}'",
                collaboration.action, self.action
            ));
        }
        if let (Some(expected), Some(actual)) =
            (&self.agreement_ref, &collaboration.agreement_ref)
        {
            if expected != actual {
                found.push(format!("AgreementRef '{}' does not match '{}'", actual, expected));
            }
        }
        if message.party_info.from.party_id.value != self.initiator.party_id {
            found.push(format!(
                "From party '{}' does not match '{}'",
                message.party_info.from.party_id.value, self.initiator.party_id
            ));
        }
        if message.party_info.to.party_id.value != self.responder.party_id {
            found.push(format!(
                "To party '{}' does not match '{}'",
                message.party_info.to.party_id.value, self.responder.party_id
            ));
        }
        found
    }
}

/// Looks PModes up for both pipelines.
pub trait PModeResolver: Send + Sync {
    /// Resolve by agreement reference.
    fn resolve(&self, agreement_ref: &str) -> Option<Arc<PMode>>;

    /// Resolve by PMode id.
    fn resolve_by_id(&self, id: &str) -> Option<Arc<PMode>>;

    /// Resolve the PMode governing an incoming user message.
    fn resolve_for_message(&self, message: &UserMessage) -> Option<Arc<PMode>> {
        message
            .collaboration_info
            .agreement_ref
            .as_deref()
            .and_then(|r| self.resolve(r))
    }
}

/// Resolver over a fixed set of PModes, usually from configuration.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPModeResolver {
    pmodes: Vec<Arc<PMode>>,
}

impl InMemoryPModeResolver {
    pub fn new(pmodes: impl IntoIterator<Item = PMode>) -> Self {
        Self {
            pmodes: pmodes.into_iter().map(Arc::new).collect(),
        }
    }
}

impl PModeResolver for InMemoryPModeResolver {
    fn resolve(&self, agreement_ref: &str) -> Option<Arc<PMode>> {
        self.pmodes
            .iter()
            .find(|p| p.agreement_ref.as_deref() == Some(agreement_ref))
            .cloned()
    }

    fn resolve_by_id(&self, id: &str) -> Option<Arc<PMode>> {
        self.pmodes.iter().find(|p| p.id == id).cloned()
    }

    /// Agreement reference first, then the party/service/action combination.
    fn resolve_for_message(&self, message: &UserMessage) -> Option<Arc<PMode>> {
        if let Some(agreement_ref) = message.collaboration_info.agreement_ref.as_deref() {
            return self.resolve(agreement_ref);
        }
        let collaboration = &message.collaboration_info;
        self.pmodes
            .iter()
            .find(|p| {
                p.service == collaboration.service.value
                    && p.action == collaboration.action
                    && p.initiator.party_id == message.party_info.from.party_id.value
                    && p.responder.party_id == message.party_info.to.party_id.value
            })
            .cloned()
    }
}
