//! Configuration types for the AS4 message service handler.

use crate::error::As4Error;
use crate::pmode::PMode;
use crate::xml::{SOAP_11_NS, SOAP_12_NS};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration of the MSH.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MshConfig {
    /// Config version
    pub version: String,

    /// General settings
    pub settings: SettingsConfig,

    /// Key material for the built-in security provider
    pub security: SecurityKeysConfig,

    /// Message dumping
    pub dump: DumpConfig,

    /// Receiver checks on incoming messages
    pub receiver_check: ReceiverCheckConfig,

    /// Processing modes known to this MSH
    pub pmodes: Vec<PMode>,
}

impl Default for MshConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            settings: SettingsConfig::default(),
            security: SecurityKeysConfig::default(),
            dump: DumpConfig::default(),
            receiver_check: ReceiverCheckConfig::default(),
            pmodes: Vec::new(),
        }
    }
}

impl MshConfig {
    /// Parse a YAML configuration and check it for consistency.
    pub fn from_yaml(yaml: &str) -> Result<Self, As4Error> {
        let config: MshConfig =
            serde_yaml::from_str(yaml).map_err(|e| As4Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), As4Error> {
        let mut seen = std::collections::HashSet::new();
        for pmode in &self.pmodes {
            if !seen.insert(pmode.id.as_str()) {
                return Err(As4Error::Config(format!("Duplicate PMode id '{}'", pmode.id)));
            }
            pmode.validate()?;
        }
        if self.settings.max_decompressed_size == 0 {
            return Err(As4Error::Config(
                "max_decompressed_size must be positive".to_string(),
            ));
        }
        if self.settings.http_timeout_ms == 0 {
            return Err(As4Error::Config("http_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Public AS4 endpoint URL of this MSH (used by receiver checks)
    pub endpoint_url: Option<String>,

    /// SOAP version used for replies when the request version is unknown
    pub default_soap_version: SoapVersion,

    /// Per-attempt HTTP timeout in milliseconds
    pub http_timeout_ms: u64,

    /// Allowed Content-Type headers for incoming requests
    pub allowed_content_types: Vec<String>,

    /// Accept MIME parts that no PartInfo references
    pub allow_unreferenced_parts: bool,

    /// Largest accepted size of one decompressed attachment, in bytes
    pub max_decompressed_size: u64,

    /// How long processed message ids are remembered for duplicate detection
    pub duplicate_retention_minutes: u64,
}

impl SettingsConfig {
    pub fn duplicate_retention(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.duplicate_retention_minutes.saturating_mul(60))
    }
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            default_soap_version: SoapVersion::Soap12,
            http_timeout_ms: 30_000,
            allowed_content_types: vec![
                "application/soap+xml".to_string(),
                "text/xml".to_string(),
                "multipart/related".to_string(),
            ],
            allow_unreferenced_parts: false,
            max_decompressed_size: 100 * 1024 * 1024,
            duplicate_retention_minutes: 10,
        }
    }
}

/// SOAP versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SoapVersion {
    /// SOAP 1.1 (namespace: http://schemas.xmlsoap.org/soap/envelope/)
    #[serde(rename = "1.1")]
    Soap11,
    /// SOAP 1.2 (namespace: http://www.w3.org/2003/05/soap-envelope)
    #[default]
    #[serde(rename = "1.2")]
    Soap12,
}

impl SoapVersion {
    /// Envelope namespace URI.
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Soap11 => SOAP_11_NS,
            Self::Soap12 => SOAP_12_NS,
        }
    }

    /// Conventional namespace prefix.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Soap11 => "S11",
            Self::Soap12 => "S12",
        }
    }

    /// MIME type of a bare envelope.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Soap11 => "text/xml",
            Self::Soap12 => "application/soap+xml",
        }
    }

    /// Lexical value of a true `mustUnderstand` attribute.
    pub fn must_understand_true(&self) -> &'static str {
        match self {
            Self::Soap11 => "1",
            Self::Soap12 => "true",
        }
    }

    /// Detect the version from an envelope namespace URI.
    pub fn from_namespace(ns: &str) -> Option<Self> {
        match ns {
            SOAP_11_NS => Some(Self::Soap11),
            SOAP_12_NS => Some(Self::Soap12),
            _ => None,
        }
    }
}

/// Key material for the built-in security provider.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecurityKeysConfig {
    /// Base64 encoded 32 byte Ed25519 signing key seed
    pub signing_key: Option<String>,

    /// Base64 encoded 32 byte AES-256 key shared with peers for attachment encryption
    pub encryption_key: Option<String>,
}

impl SecurityKeysConfig {
    /// Decoded signing key seed.
    pub fn signing_key_bytes(&self) -> Result<Option<[u8; 32]>, As4Error> {
        decode_key(self.signing_key.as_deref(), "signing_key")
    }

    /// Decoded encryption key.
    pub fn encryption_key_bytes(&self) -> Result<Option<[u8; 32]>, As4Error> {
        decode_key(self.encryption_key.as_deref(), "encryption_key")
    }
}

fn decode_key(value: Option<&str>, name: &str) -> Result<Option<[u8; 32]>, As4Error> {
    let Some(value) = value else {
        return Ok(None);
    };
    let bytes = STANDARD
        .decode(value.trim())
        .map_err(|e| As4Error::Config(format!("{} is not valid base64: {}", name, e)))?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| As4Error::Config(format!("{} must be exactly 32 bytes", name)))?;
    Ok(Some(key))
}

/// Message dump configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DumpConfig {
    /// Enable dumping of exchanged messages
    pub enabled: bool,

    /// Base directory for dump files
    pub directory: Option<PathBuf>,
}

/// Receiver check configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReceiverCheckConfig {
    /// Check that incoming messages are addressed to this endpoint
    pub enabled: bool,

    /// Check certificate revocation in the trust checker
    pub check_revocation: bool,

    /// Directory of the receiving parties
    pub directory: Vec<DirectoryEntryConfig>,

    /// Base64 certificates accepted by the trust checker
    pub trusted_certificates: Vec<String>,

    /// Base64 certificates rejected when revocation is checked
    pub revoked_certificates: Vec<String>,
}

/// One receiving party registered in the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryEntryConfig {
    pub party_id: String,

    /// AS4 endpoint serving the party
    pub url: String,

    /// Base64 certificate of the access point serving the party
    #[serde(default)]
    pub certificate: Option<String>,
}
