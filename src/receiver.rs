//! Receiver checks.
//!
//! Before an incoming message is delivered, the recipient is looked up in the
//! directory ([`EndpointResolver`]): the message must be addressed to this
//! MSH's own endpoint and certificate, and the certificate registered for it
//! must pass the [`TrustChecker`]. The outbound pipeline uses the same
//! resolver to find the endpoint of a PMode without a configured URL.

use crate::config::{DirectoryEntryConfig, MshConfig, ReceiverCheckConfig};
use crate::error::{As4Error, ErrorCode};
use crate::message::{PartyId, Service, UserMessage};
use crate::security::Certificate;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub certificate: Option<Certificate>,
}

/// Directory lookup (e.g. SMP).
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    /// Find the endpoint of `receiver` for a service/action, `None` if unregistered.
    async fn resolve(
        &self,
        receiver: &PartyId,
        service: &Service,
        action: &str,
    ) -> Result<Option<Endpoint>, As4Error>;
}

/// Directory held in memory, keyed by party id.
#[derive(Debug, Clone, Default)]
pub struct StaticEndpointResolver {
    entries: HashMap<String, Endpoint>,
}

impl StaticEndpointResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, party_id: impl Into<String>, endpoint: Endpoint) -> Self {
        self.entries.insert(party_id.into(), endpoint);
        self
    }

    /// Directory from configured entries.
    pub fn from_config(entries: &[DirectoryEntryConfig]) -> Result<Self, As4Error> {
        entries.iter().try_fold(Self::new(), |directory, entry| -> Result<Self, As4Error> {
            let certificate = entry
                .certificate
                .as_deref()
                .map(Certificate::from_base64)
                .transpose()?;
            Ok(directory.with_endpoint(
                entry.party_id.clone(),
                Endpoint {
                    url: entry.url.clone(),
                    certificate,
                },
            ))
        })
    }
}

#[async_trait]
impl EndpointResolver for StaticEndpointResolver {
    async fn resolve(
        &self,
        receiver: &PartyId,
        _service: &Service,
        _action: &str,
    ) -> Result<Option<Endpoint>, As4Error> {
        Ok(self.entries.get(&receiver.value).cloned())
    }
}

/// Verdict of a trust check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckVerdict {
    Valid,
    Invalid,
    /// The checker could not decide (e.g. revocation source unreachable)
    Undetermined,
}

/// Options passed to the trust checker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckFlags {
    pub check_revocation: bool,
}

/// Certificate trust policy.
pub trait TrustChecker: Send + Sync {
    fn check(&self, certificate: &Certificate, as_of: DateTime<Utc>, flags: CheckFlags) -> CheckVerdict;
}

/// Trusts an explicit set of certificates.
#[derive(Debug, Clone, Default)]
pub struct AllowListTrustChecker {
    trusted: Vec<Certificate>,
    revoked: Vec<Certificate>,
}

impl AllowListTrustChecker {
    pub fn new(trusted: Vec<Certificate>) -> Self {
        Self {
            trusted,
            revoked: Vec::new(),
        }
    }

    pub fn with_revoked(mut self, revoked: Vec<Certificate>) -> Self {
        self.revoked = revoked;
        self
    }

    /// Allow list from the `receiver_check` section.
    pub fn from_config(config: &ReceiverCheckConfig) -> Result<Self, As4Error> {
        let decode = |certificates: &[String]| {
            certificates
                .iter()
                .map(|c| Certificate::from_base64(c))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self::new(decode(&config.trusted_certificates)?)
            .with_revoked(decode(&config.revoked_certificates)?))
    }
}

impl TrustChecker for AllowListTrustChecker {
    fn check(&self, certificate: &Certificate, _as_of: DateTime<Utc>, flags: CheckFlags) -> CheckVerdict {
        if flags.check_revocation && self.revoked.contains(certificate) {
            return CheckVerdict::Invalid;
        }
        if self.trusted.contains(certificate) {
            CheckVerdict::Valid
        } else {
            CheckVerdict::Invalid
        }
    }
}

/// Outcome of checking the recipient of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverVerdict {
    Accepted,
    /// The directory does not know the recipient
    NotRegistered,
    /// The recipient is served by another endpoint
    OtherEndpoint,
    /// The directory names another access point certificate than ours
    CertificateMismatch,
    /// The recipient's certificate failed the trust check
    UntrustedCertificate,
}

impl ReceiverVerdict {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::NotRegistered => "not registered in the directory",
            Self::OtherEndpoint => "served by another endpoint",
            Self::CertificateMismatch => "registered with another access point certificate",
            Self::UntrustedCertificate => "registered with an untrusted certificate",
        }
    }
}

/// Combined receiver check.
pub struct ReceiverCheck {
    resolver: Arc<dyn EndpointResolver>,
    trust: Arc<dyn TrustChecker>,
    own_endpoint_url: String,
    own_certificate: Option<Certificate>,
    flags: CheckFlags,
}

impl ReceiverCheck {
    pub fn new(
        resolver: Arc<dyn EndpointResolver>,
        trust: Arc<dyn TrustChecker>,
        own_endpoint_url: impl Into<String>,
        flags: CheckFlags,
    ) -> Self {
        Self {
            resolver,
            trust,
            own_endpoint_url: own_endpoint_url.into(),
            own_certificate: None,
            flags,
        }
    }

    /// Require the directory to name this certificate for every recipient.
    pub fn with_own_certificate(mut self, certificate: Certificate) -> Self {
        self.own_certificate = Some(certificate);
        self
    }

    /// Build the check configured in `receiver_check`, `None` when disabled.
    ///
    /// Fails when the configuration is incomplete or when `own_certificate`
    /// does not pass the configured trust checker.
    pub fn from_config(
        config: &MshConfig,
        own_certificate: Option<Certificate>,
    ) -> Result<Option<Self>, As4Error> {
        let section = &config.receiver_check;
        if !section.enabled {
            return Ok(None);
        }
        let own_url = config.settings.endpoint_url.clone().ok_or_else(|| {
            As4Error::Config("Receiver check requires settings.endpoint_url".to_string())
        })?;
        let own_certificate = own_certificate.ok_or_else(|| {
            As4Error::Config("Receiver check requires a signing key".to_string())
        })?;

        let check = Self::new(
            Arc::new(StaticEndpointResolver::from_config(&section.directory)?),
            Arc::new(AllowListTrustChecker::from_config(section)?),
            own_url,
            CheckFlags {
                check_revocation: section.check_revocation,
            },
        )
        .with_own_certificate(own_certificate);
        check.verify_own_certificate()?;
        Ok(Some(check))
    }

    /// The own certificate must be trusted before any message is accepted.
    pub fn verify_own_certificate(&self) -> Result<(), As4Error> {
        let Some(certificate) = &self.own_certificate else {
            return Ok(());
        };
        match self.trust.check(certificate, Utc::now(), self.flags) {
            CheckVerdict::Valid => {
                debug!(certificate = %certificate.fingerprint(), "Own certificate is trusted");
                Ok(())
            }
            verdict => Err(As4Error::Config(format!(
                "Own certificate {} is not trusted ({:?})",
                certificate.fingerprint(),
                verdict
            ))),
        }
    }

    /// Decide whether `message` is meant for this endpoint and its recipient is trusted.
    pub async fn evaluate(&self, message: &UserMessage) -> Result<ReceiverVerdict, As4Error> {
        let receiver = &message.party_info.to.party_id;
        let collaboration = &message.collaboration_info;

        let Some(endpoint) = self
            .resolver
            .resolve(receiver, &collaboration.service, &collaboration.action)
            .await?
        else {
            return Ok(ReceiverVerdict::NotRegistered);
        };

        if normalize_url(&endpoint.url) != normalize_url(&self.own_endpoint_url) {
            debug!(receiver = %receiver.value, url = %endpoint.url, "Receiver served elsewhere");
            return Ok(ReceiverVerdict::OtherEndpoint);
        }

        if let Some(own) = &self.own_certificate {
            if endpoint.certificate.as_ref() != Some(own) {
                debug!(
                    receiver = %receiver.value,
                    registered = ?endpoint.certificate.as_ref().map(|c| c.fingerprint()),
                    own = %own.fingerprint(),
                    "Receiver registered with another certificate"
                );
                return Ok(ReceiverVerdict::CertificateMismatch);
            }
        }

        if let Some(certificate) = &endpoint.certificate {
            match self.trust.check(certificate, Utc::now(), self.flags) {
                CheckVerdict::Valid => {
                    debug!(receiver = %receiver.value, "Receiver certificate is valid");
                }
                CheckVerdict::Invalid => return Ok(ReceiverVerdict::UntrustedCertificate),
                CheckVerdict::Undetermined => {
                    warn!(
                        receiver = %receiver.value,
                        certificate = %certificate.fingerprint(),
                        "Receiver certificate check undetermined, accepting"
                    );
                }
            }
        }

        Ok(ReceiverVerdict::Accepted)
    }

    /// Like [`evaluate`](Self::evaluate), failing with `POLICY_NONCOMPLIANCE`
    /// unless the recipient is accepted.
    pub async fn check(&self, message: &UserMessage) -> Result<(), As4Error> {
        match self.evaluate(message).await? {
            ReceiverVerdict::Accepted => Ok(()),
            verdict => Err(As4Error::security(
                ErrorCode::PolicyNoncompliance,
                format!(
                    "Receiver '{}' is {}",
                    message.party_info.to.party_id.value,
                    verdict.describe()
                ),
            )),
        }
    }
}

fn normalize_url(url: &str) -> &str {
    url.trim().trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::tests::invoice_message;

    const OWN_URL: &str = "https://ap.example.org/as4";

    struct Fixed(CheckVerdict);

    impl TrustChecker for Fixed {
        fn check(&self, _: &Certificate, _: DateTime<Utc>, _: CheckFlags) -> CheckVerdict {
            self.0
        }
    }

    fn check_with(url: &str, verdict: CheckVerdict) -> ReceiverCheck {
        let resolver = StaticEndpointResolver::new().with_endpoint(
            "receiver",
            Endpoint {
                url: url.to_string(),
                certificate: Some(Certificate::from_bytes(vec![1; 32])),
            },
        );
        ReceiverCheck::new(
            Arc::new(resolver),
            Arc::new(Fixed(verdict)),
            OWN_URL,
            CheckFlags::default(),
        )
    }

    #[tokio::test]
    async fn test_valid_receiver() {
        let check = check_with("https://ap.example.org/as4/", CheckVerdict::Valid);
        assert!(check.check(&invoice_message()).await.is_ok());
    }

    #[tokio::test]
    async fn test_undetermined_is_accepted() {
        let check = check_with(OWN_URL, CheckVerdict::Undetermined);
        assert!(check.check(&invoice_message()).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_certificate() {
        let check = check_with(OWN_URL, CheckVerdict::Invalid);
        let err = check.check(&invoice_message()).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::PolicyNoncompliance);
    }

    #[tokio::test]
    async fn test_other_endpoint() {
        let check = check_with("https://other.example.org/as4", CheckVerdict::Valid);
        let err = check.check(&invoice_message()).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::PolicyNoncompliance);
    }

    #[tokio::test]
    async fn test_unregistered_receiver() {
        let mut message = invoice_message();
        message.party_info.to.party_id.value = "nobody".to_string();
        let check = check_with(OWN_URL, CheckVerdict::Valid);
        assert_eq!(check.evaluate(&message).await.unwrap(), ReceiverVerdict::NotRegistered);
        assert!(check.check(&message).await.is_err());
    }

    #[tokio::test]
    async fn test_own_certificate_must_match_directory() {
        let check = check_with(OWN_URL, CheckVerdict::Valid)
            .with_own_certificate(Certificate::from_bytes(vec![1; 32]));
        assert_eq!(
            check.evaluate(&invoice_message()).await.unwrap(),
            ReceiverVerdict::Accepted
        );

        let check = check_with(OWN_URL, CheckVerdict::Valid)
            .with_own_certificate(Certificate::from_bytes(vec![2; 32]));
        assert_eq!(
            check.evaluate(&invoice_message()).await.unwrap(),
            ReceiverVerdict::CertificateMismatch
        );
        let err = check.check(&invoice_message()).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::PolicyNoncompliance);
        assert!(err.to_string().contains("another access point certificate"));
    }

    #[tokio::test]
    async fn test_directory_without_certificate_is_mismatch() {
        let resolver = StaticEndpointResolver::new().with_endpoint(
            "receiver",
            Endpoint {
                url: OWN_URL.to_string(),
                certificate: None,
            },
        );
        let check = ReceiverCheck::new(
            Arc::new(resolver),
            Arc::new(Fixed(CheckVerdict::Valid)),
            OWN_URL,
            CheckFlags::default(),
        )
        .with_own_certificate(Certificate::from_bytes(vec![1; 32]));
        assert_eq!(
            check.evaluate(&invoice_message()).await.unwrap(),
            ReceiverVerdict::CertificateMismatch
        );
    }

    #[test]
    fn test_untrusted_own_certificate() {
        let own = Certificate::from_bytes(vec![1; 32]);
        for verdict in [CheckVerdict::Invalid, CheckVerdict::Undetermined] {
            let check = check_with(OWN_URL, verdict).with_own_certificate(own.clone());
            assert!(matches!(check.verify_own_certificate(), Err(As4Error::Config(_))));
        }
        let check = check_with(OWN_URL, CheckVerdict::Valid).with_own_certificate(own);
        assert!(check.verify_own_certificate().is_ok());
    }

    fn configured(trusted: &[u8], directory_certificate: &[u8]) -> MshConfig {
        let mut config = MshConfig::default();
        config.settings.endpoint_url = Some(OWN_URL.to_string());
        config.receiver_check = ReceiverCheckConfig {
            enabled: true,
            directory: vec![DirectoryEntryConfig {
                party_id: "receiver".to_string(),
                url: OWN_URL.to_string(),
                certificate: Some(Certificate::from_bytes(directory_certificate.to_vec()).to_base64()),
            }],
            trusted_certificates: vec![Certificate::from_bytes(trusted.to_vec()).to_base64()],
            ..Default::default()
        };
        config
    }

    #[tokio::test]
    async fn test_from_config() {
        let own = Certificate::from_bytes(vec![1; 32]);

        let check = ReceiverCheck::from_config(&configured(&[1; 32], &[1; 32]), Some(own.clone()))
            .unwrap()
            .unwrap();
        assert!(check.check(&invoice_message()).await.is_ok());

        // The directory names another access point
        let check = ReceiverCheck::from_config(&configured(&[1; 32], &[3; 32]), Some(own.clone()))
            .unwrap()
            .unwrap();
        assert_eq!(
            check.evaluate(&invoice_message()).await.unwrap(),
            ReceiverVerdict::CertificateMismatch
        );

        // Own certificate not in the trust list: refuse to start
        let err = ReceiverCheck::from_config(&configured(&[9; 32], &[1; 32]), Some(own.clone()))
            .err()
            .unwrap();
        assert!(err.to_string().contains("not trusted"));

        assert!(ReceiverCheck::from_config(&configured(&[1; 32], &[1; 32]), None).is_err());
        assert!(ReceiverCheck::from_config(&MshConfig::default(), Some(own))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_allow_list_checker() {
        let good = Certificate::from_bytes(vec![1; 32]);
        let bad = Certificate::from_bytes(vec![2; 32]);
        let checker = AllowListTrustChecker::new(vec![good.clone()]).with_revoked(vec![good.clone()]);

        let now = Utc::now();
        assert_eq!(checker.check(&good, now, CheckFlags::default()), CheckVerdict::Valid);
        assert_eq!(checker.check(&bad, now, CheckFlags::default()), CheckVerdict::Invalid);
        assert_eq!(
            checker.check(&good, now, CheckFlags { check_revocation: true }),
            CheckVerdict::Invalid
        );
    }
}
