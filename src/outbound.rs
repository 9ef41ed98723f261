//! Outbound pipeline.
//!
//! One logical user message goes through
//! `PENDING -> AWAITING_RECEIPT -> {DELIVERED | RECEIPT_MISSING -> PENDING | FAILED}`.
//! Every attempt rebuilds the transmission (new `messaging_id`, new
//! signature) around the same wire `MessageId`, dumps it and posts it under a
//! per-attempt timeout.

use crate::compression::CompressionType;
use crate::config::SettingsConfig;
use crate::dump::DumpManager;
use crate::envelope::{read_message, wrap, EnvelopeDocument};
use crate::error::{As4Error, ErrorCode};
use crate::message::{
    As4Message, Attachment, CollaborationInfo, MessageKind, PartDigest, PartInfo, PartyInfo,
    PartyId, Property, Receipt, ReceiptContent, Service, UserMessage,
};
use crate::mime::{pack, split_entity, TransmissibleEntity};
use crate::pmode::{PMode, PModeResolver};
use crate::receiver::EndpointResolver;
use crate::security::{part_digests, secure_outgoing, SecurityHeader, SecurityProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// HTTP response as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Message transmission.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, url: &str, entity: &TransmissibleEntity)
        -> Result<TransportResponse, As4Error>;
}

/// HTTP(S) transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, As4Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| As4Error::Transport(format!("Cannot create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        entity: &TransmissibleEntity,
    ) -> Result<TransportResponse, As4Error> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, entity.content_type.as_str())
            .body(entity.body.clone())
            .send()
            .await
            .map_err(|e| As4Error::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response
            .bytes()
            .await
            .map_err(|e| As4Error::Transport(e.to_string()))?
            .to_vec();

        Ok(TransportResponse {
            status,
            content_type,
            body,
        })
    }
}

/// A business document handed to the pipeline.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    /// PMode governing the exchange
    pub pmode_id: String,
    /// Generated when absent
    pub conversation_id: Option<String>,
    /// Overrides the PMode action
    pub action: Option<String>,
    /// Wire MessageId; generated when absent
    pub message_id: Option<String>,
    pub properties: Vec<Property>,
    /// SOAP body payload
    pub body: Option<String>,
    pub attachments: Vec<Attachment>,
}

/// Delivery state of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    Pending,
    AwaitingReceipt,
    Delivered,
    ReceiptMissing,
    Failed,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    fn can_become(&self, next: DeliveryState) -> bool {
        use DeliveryState::*;
        matches!(
            (self, next),
            (Pending, AwaitingReceipt)
                | (AwaitingReceipt, Delivered)
                | (AwaitingReceipt, ReceiptMissing)
                | (AwaitingReceipt, Failed)
                | (ReceiptMissing, Pending)
                | (ReceiptMissing, Failed)
        )
    }
}

/// Retry bookkeeping of one logical message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub state: DeliveryState,
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt_count: 0,
            max_attempts,
            next_retry_at: None,
            state: DeliveryState::Pending,
        }
    }

    /// Move to `next`, refusing transitions the state machine does not have.
    pub fn transition(&mut self, next: DeliveryState) -> Result<(), As4Error> {
        if !self.state.can_become(next) {
            return Err(As4Error::Internal(format!(
                "Illegal delivery state transition {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Start the next attempt.
    pub fn begin_attempt(&mut self) -> Result<u32, As4Error> {
        self.transition(DeliveryState::AwaitingReceipt)?;
        self.attempt_count += 1;
        self.next_retry_at = None;
        Ok(self.attempt_count)
    }

    pub fn attempts_left(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}

/// Final result of sending one logical message.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message_id: String,
    pub state: DeliveryState,
    pub attempts: u32,
    /// Receipt acknowledging the message, when one was required
    pub receipt: Option<Receipt>,
    /// Codes explaining a failure
    pub errors: Vec<ErrorCode>,
    /// Last failure description
    pub detail: Option<String>,
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        self.state == DeliveryState::Delivered
    }
}

/// How one attempt ended.
enum AttemptResult {
    Delivered(Option<Receipt>),
    Failed(ErrorCode, String),
}

/// Sends user messages according to their PMode.
pub struct OutboundPipeline {
    pmodes: Arc<dyn PModeResolver>,
    security: Arc<dyn SecurityProvider>,
    transport: Arc<dyn Transport>,
    endpoints: Option<Arc<dyn EndpointResolver>>,
    dump: DumpManager,
    attempt_timeout: Duration,
}

impl OutboundPipeline {
    pub fn new(
        pmodes: Arc<dyn PModeResolver>,
        security: Arc<dyn SecurityProvider>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            pmodes,
            security,
            transport,
            endpoints: None,
            dump: DumpManager::default(),
            attempt_timeout: Duration::from_millis(SettingsConfig::default().http_timeout_ms),
        }
    }

    /// Look endpoints up for PModes without an endpoint URL.
    pub fn with_endpoint_resolver(mut self, endpoints: Arc<dyn EndpointResolver>) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    pub fn with_dump_manager(mut self, dump: DumpManager) -> Self {
        self.dump = dump;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Run the delivery state machine in its own task.
    pub fn submit(self: &Arc<Self>, submission: Submission) -> JoinHandle<Result<SendOutcome, As4Error>> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move { pipeline.send(submission).await })
    }

    /// Send a message and wait for the delivery outcome.
    ///
    /// Errors are returned only when nothing could be sent at all (unknown
    /// PMode, invalid submission, no endpoint); delivery failures are
    /// reported in the outcome.
    pub async fn send(&self, submission: Submission) -> Result<SendOutcome, As4Error> {
        let pmode = self
            .pmodes
            .resolve_by_id(&submission.pmode_id)
            .ok_or_else(|| As4Error::PModeNotFound(submission.pmode_id.clone()))?;
        let url = self.endpoint_url(&pmode).await?;
        let message = build_user_message(&pmode, submission)?;
        let message_id = message.message_info.message_id.clone();

        let max_attempts = pmode.reliability.as_ref().map_or(1, |r| r.max_attempts);
        let retry_interval = Duration::from_millis(
            pmode.reliability.as_ref().map_or(0, |r| r.retry_interval_ms),
        );
        let mut retry = RetryState::new(max_attempts);

        info!(
            message_id = %message_id,
            pmode = %pmode.id,
            url = %url,
            max_attempts,
            "Sending user message"
        );

        loop {
            // A finished message is never sent again
            if retry.state.is_terminal() {
                break;
            }
            let attempt = retry.begin_attempt()?;

            let (entity, sent_digests) = self.prepare(&pmode, &message)?;
            self.dump.outgoing(&message_id, attempt, &entity).await;

            let result =
                match tokio::time::timeout(self.attempt_timeout, self.transport.post(&url, &entity))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(As4Error::Transport(format!(
                        "No response within {} ms",
                        self.attempt_timeout.as_millis()
                    ))),
                };

            match self.evaluate(&pmode, &message_id, &sent_digests, result) {
                AttemptResult::Delivered(receipt) => {
                    retry.transition(DeliveryState::Delivered)?;
                    info!(message_id = %message_id, attempt, "Message delivered");
                    return Ok(SendOutcome {
                        message_id,
                        state: retry.state,
                        attempts: retry.attempt_count,
                        receipt,
                        errors: Vec::new(),
                        detail: None,
                    });
                }
                AttemptResult::Failed(code, detail) => {
                    warn!(
                        message_id = %message_id,
                        attempt,
                        code = %code.as_str(),
                        detail = %detail,
                        "Send attempt failed"
                    );

                    if !pmode.receipt_required() {
                        retry.transition(DeliveryState::Failed)?;
                        return Ok(SendOutcome {
                            message_id,
                            state: retry.state,
                            attempts: retry.attempt_count,
                            receipt: None,
                            errors: vec![code],
                            detail: Some(detail),
                        });
                    }

                    retry.transition(DeliveryState::ReceiptMissing)?;
                    if !retry.attempts_left() {
                        retry.transition(DeliveryState::Failed)?;
                        warn!(
                            message_id = %message_id,
                            attempts = retry.attempt_count,
                            code = %ErrorCode::MissingReceipt.as_str(),
                            "Giving up, no receipt received"
                        );
                        return Ok(SendOutcome {
                            message_id,
                            state: retry.state,
                            attempts: retry.attempt_count,
                            receipt: None,
                            errors: vec![ErrorCode::MissingReceipt],
                            detail: Some(detail),
                        });
                    }

                    retry.transition(DeliveryState::Pending)?;
                    retry.next_retry_at = chrono::Duration::from_std(retry_interval)
                        .ok()
                        .map(|d| Utc::now() + d);
                    debug!(
                        message_id = %message_id,
                        next_retry_at = ?retry.next_retry_at,
                        "Retry scheduled"
                    );
                    tokio::time::sleep(retry_interval).await;
                }
            }
        }

        Err(As4Error::Internal(format!(
            "Delivery of '{}' ended in state {:?}",
            message_id, retry.state
        )))
    }

    async fn endpoint_url(&self, pmode: &PMode) -> Result<String, As4Error> {
        if let Some(url) = &pmode.endpoint_url {
            return Ok(url.clone());
        }
        let resolver = self.endpoints.as_ref().ok_or_else(|| {
            As4Error::Config(format!(
                "PMode '{}' has no endpoint URL and no endpoint resolver is configured",
                pmode.id
            ))
        })?;
        let receiver = PartyId {
            value: pmode.responder.party_id.clone(),
            party_type: pmode.responder.party_id_type.clone(),
        };
        let service = Service {
            value: pmode.service.clone(),
            service_type: pmode.service_type.clone(),
        };
        let endpoint = resolver
            .resolve(&receiver, &service, &pmode.action)
            .await?
            .ok_or_else(|| {
                As4Error::Config(format!("No endpoint registered for '{}'", receiver.value))
            })?;
        Ok(endpoint.url)
    }

    /// Build the transmission of one attempt, with the digests of the parts
    /// as the receiver sees them once decrypted.
    fn prepare(
        &self,
        pmode: &PMode,
        message: &UserMessage,
    ) -> Result<(TransmissibleEntity, Vec<PartDigest>), As4Error> {
        let attachments = message.attachments.clone();
        let as4 = As4Message::user(pmode.soap_version, message.clone());
        let document = wrap(&as4, message.body.as_deref())?;
        let digests = part_digests(&document, &attachments)?;
        let (document, attachments) =
            secure_outgoing(self.security.as_ref(), pmode, document, attachments)?;
        Ok((pack(&document, &attachments), digests))
    }

    fn evaluate(
        &self,
        pmode: &PMode,
        message_id: &str,
        sent_digests: &[PartDigest],
        result: Result<TransportResponse, As4Error>,
    ) -> AttemptResult {
        let response = match result {
            Ok(response) => response,
            Err(e) => return AttemptResult::Failed(ErrorCode::ConnectionFailure, e.to_string()),
        };
        if !response.is_success() {
            return AttemptResult::Failed(
                ErrorCode::DeliveryFailure,
                format!("HTTP status {}", response.status),
            );
        }
        if !pmode.receipt_required() {
            return AttemptResult::Delivered(None);
        }

        let (document, signal) = match parse_response(&response) {
            Ok(parsed) => parsed,
            Err(e) => {
                return AttemptResult::Failed(
                    ErrorCode::InvalidReceipt,
                    format!("Unusable response: {}", e),
                )
            }
        };

        match signal.into_kind() {
            MessageKind::Receipt(receipt) => {
                if let Err(e) = self.check_receipt_signature(pmode, &document) {
                    return AttemptResult::Failed(ErrorCode::InvalidReceipt, e.to_string());
                }
                if receipt.ref_to_message_id() == Some(message_id) {
                    if let ReceiptContent::NonRepudiation(digests) = &receipt.content {
                        if let Err(detail) = compare_digests(sent_digests, digests) {
                            return AttemptResult::Failed(ErrorCode::InvalidReceipt, detail);
                        }
                    }
                    AttemptResult::Delivered(Some(receipt))
                } else {
                    warn!(
                        message_id = %message_id,
                        ref_to = ?receipt.ref_to_message_id(),
                        "Ignoring receipt for another message"
                    );
                    AttemptResult::Failed(
                        ErrorCode::MissingReceipt,
                        "Receipt references another message".to_string(),
                    )
                }
            }
            MessageKind::Error(signal) => {
                for error in &signal.errors {
                    warn!(
                        message_id = %message_id,
                        code = %error.code.as_str(),
                        detail = ?error.detail,
                        "Peer reported error"
                    );
                }
                let code = signal.errors.first().map_or(ErrorCode::Other, |e| e.code);
                AttemptResult::Failed(code, "Peer answered with an error signal".to_string())
            }
            MessageKind::User(_) => AttemptResult::Failed(
                ErrorCode::InvalidReceipt,
                "Peer answered with a user message".to_string(),
            ),
        }
    }

    /// Under a signing PMode the receipt must be signed, and must verify
    /// when a peer certificate is configured. Error signals are never signed.
    fn check_receipt_signature(&self, pmode: &PMode, document: &EnvelopeDocument) -> Result<(), As4Error> {
        if !pmode.security.sign {
            return Ok(());
        }
        if SecurityHeader::from_document(document).signature.is_none() {
            return Err(As4Error::security(
                ErrorCode::InvalidReceipt,
                "Receipt is not signed",
            ));
        }
        let Some(certificate) = pmode.trusted_certificate()? else {
            warn!(pmode = %pmode.id, "Signed response but no trusted certificate, signature not checked");
            return Ok(());
        };
        let result = self.security.verify(document, &[], &certificate);
        if result.valid {
            Ok(())
        } else {
            Err(As4Error::security(
                ErrorCode::FailedAuthentication,
                result
                    .failure_reason
                    .unwrap_or_else(|| "Receipt signature does not verify".to_string()),
            ))
        }
    }
}

/// Check that a non-repudiation receipt covers exactly the parts that were sent.
fn compare_digests(sent: &[PartDigest], received: &[PartDigest]) -> Result<(), String> {
    for part in sent {
        match received.iter().find(|d| d.uri == part.uri) {
            Some(d) if d.digest_value == part.digest_value => {}
            Some(_) => return Err(format!("Receipt digest of '{}' does not match", part.uri)),
            None => return Err(format!("Receipt has no digest for '{}'", part.uri)),
        }
    }
    if let Some(extra) = received.iter().find(|d| !sent.iter().any(|p| p.uri == d.uri)) {
        return Err(format!("Receipt references unknown part '{}'", extra.uri));
    }
    Ok(())
}

/// Parse a response entity into its envelope and signal message.
pub fn parse_response(response: &TransportResponse) -> Result<(EnvelopeDocument, As4Message), As4Error> {
    let content_type = response.content_type.as_deref().unwrap_or("application/soap+xml");
    let (root, _) = split_entity(content_type, &response.body)?;
    let document = EnvelopeDocument::parse(&root)?;
    let message = read_message(&document)?;
    Ok((document, message))
}

/// Build the user message of a submission, compressing attachments if the PMode says so.
fn build_user_message(pmode: &PMode, submission: Submission) -> Result<UserMessage, As4Error> {
    let mut collaboration = CollaborationInfo::from_pmode(
        pmode,
        submission
            .conversation_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    );
    if let Some(action) = submission.action {
        collaboration.action = action;
    }

    let mut payload_info = Vec::new();
    if submission.body.is_some() {
        payload_info.push(PartInfo::body());
    }

    let mut attachments = Vec::with_capacity(submission.attachments.len());
    for attachment in submission.attachments {
        let mut part = PartInfo::attachment(&attachment.content_id, &attachment.mime_type);
        if pmode.compress {
            let compression = CompressionType::Gzip;
            part.compression = Some(compression);
            attachments.push(Attachment {
                data: compression.compress(&attachment.data)?,
                mime_type: compression.mime_type().to_string(),
                content_id: attachment.content_id,
            });
        } else {
            attachments.push(attachment);
        }
        payload_info.push(part);
    }

    let message = UserMessage::build(
        collaboration,
        PartyInfo::from_pmode(pmode),
        payload_info,
        submission.body,
        attachments,
    )?
    .with_properties(submission.properties);

    Ok(match submission.message_id {
        Some(id) => message.with_message_id(id),
        None => message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SoapVersion;
    use crate::mime::unpack;
    use crate::pmode::tests::sample_pmode;
    use crate::pmode::InMemoryPModeResolver;
    use crate::receiver::{Endpoint, StaticEndpointResolver};
    use crate::security::Ed25519SecurityProvider;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Answers every request with a canned behaviour and records it.
    struct MockTransport {
        calls: AtomicU32,
        urls: Mutex<Vec<String>>,
        message_ids: Mutex<Vec<String>>,
        messaging_ids: Mutex<Vec<String>>,
        behaviour: Behaviour,
    }

    enum Behaviour {
        ConnectionRefused,
        Status(u16),
        Receipt,
        /// Receipt whose attachment digest is wrong
        ReceiptWithBadDigest,
        /// Receipt signed with the given seed
        SignedReceipt([u8; 32]),
        ReceiptFor(&'static str),
        ReceiptOnAttempt(u32),
        ErrorSignal,
        Hang,
    }

    impl MockTransport {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                urls: Mutex::new(Vec::new()),
                message_ids: Mutex::new(Vec::new()),
                messaging_ids: Mutex::new(Vec::new()),
                behaviour,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn signal_response(message: As4Message) -> TransportResponse {
        let document = wrap(&message, None).unwrap();
        let entity = pack(&document, &[]);
        TransportResponse {
            status: 200,
            content_type: Some(entity.content_type),
            body: entity.body,
        }
    }

    fn receipt_for(ref_to: &str, digests: Vec<PartDigest>) -> TransportResponse {
        signal_response(As4Message::receipt(
            SoapVersion::Soap12,
            Receipt::build(ref_to, ReceiptContent::NonRepudiation(digests)),
        ))
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn post(
            &self,
            url: &str,
            entity: &TransmissibleEntity,
        ) -> Result<TransportResponse, As4Error> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.urls.lock().push(url.to_string());

            let (document, attachments) = unpack(entity).unwrap();
            let message = read_message(&document).unwrap();
            let digests = part_digests(&document, &attachments).unwrap();
            let message_id = message.message_id().to_string();
            self.message_ids.lock().push(message_id.clone());
            self.messaging_ids.lock().push(message.messaging_id().to_string());

            match self.behaviour {
                Behaviour::ConnectionRefused => {
                    Err(As4Error::Transport("Connection refused".to_string()))
                }
                Behaviour::Status(status) => Ok(TransportResponse {
                    status,
                    content_type: None,
                    body: Vec::new(),
                }),
                Behaviour::Receipt => Ok(receipt_for(&message_id, digests)),
                Behaviour::ReceiptWithBadDigest => {
                    let mut digests = digests;
                    if let Some(d) = digests.iter_mut().find(|d| d.uri.starts_with("cid:")) {
                        d.digest_value = "AAAA".to_string();
                    }
                    Ok(receipt_for(&message_id, digests))
                }
                Behaviour::SignedReceipt(seed) => {
                    let receipt = As4Message::receipt(
                        SoapVersion::Soap12,
                        Receipt::build(&message_id, ReceiptContent::NonRepudiation(digests)),
                    );
                    let document = Ed25519SecurityProvider::new(Some(seed), None)
                        .sign(wrap(&receipt, None).unwrap(), &[], crate::pmode::SignatureAlgorithm::Ed25519)
                        .unwrap();
                    let entity = pack(&document, &[]);
                    Ok(TransportResponse {
                        status: 200,
                        content_type: Some(entity.content_type),
                        body: entity.body,
                    })
                }
                Behaviour::ReceiptFor(other) => Ok(receipt_for(other, digests)),
                Behaviour::ReceiptOnAttempt(n) if call >= n => Ok(receipt_for(&message_id, digests)),
                Behaviour::ReceiptOnAttempt(_) => Ok(TransportResponse {
                    status: 503,
                    content_type: None,
                    body: Vec::new(),
                }),
                Behaviour::ErrorSignal => Ok(signal_response(As4Message::error(
                    SoapVersion::Soap12,
                    crate::message::ErrorSignal::build(
                        Some(message_id.clone()),
                        vec![crate::message::ErrorDetail::new(
                            ErrorCode::ProcessingModeMismatch,
                            Some(&message_id),
                        )],
                    )
                    .unwrap(),
                ))),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(receipt_for(&message_id, digests))
                }
            }
        }
    }

    fn pipeline(pmode: PMode, transport: Arc<MockTransport>) -> OutboundPipeline {
        OutboundPipeline::new(
            Arc::new(InMemoryPModeResolver::new([pmode])),
            Arc::new(Ed25519SecurityProvider::new(Some([3u8; 32]), None)),
            transport,
        )
    }

    fn submission() -> Submission {
        Submission {
            pmode_id: "invoice".to_string(),
            conversation_id: Some("c1".to_string()),
            attachments: vec![Attachment::new(
                "invoice.xml",
                "application/xml",
                b"<Invoice/>".to_vec(),
            )],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_delivered_on_matching_receipt() {
        let transport = MockTransport::new(Behaviour::Receipt);
        let outcome = pipeline(sample_pmode(), transport.clone())
            .send(submission())
            .await
            .unwrap();

        assert!(outcome.is_delivered());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(
            outcome.receipt.unwrap().ref_to_message_id(),
            Some(outcome.message_id.as_str())
        );
        assert_eq!(transport.urls.lock()[0], "http://localhost:8080/as4");
    }

    #[tokio::test]
    async fn test_receipt_digest_mismatch() {
        let transport = MockTransport::new(Behaviour::ReceiptWithBadDigest);
        let outcome = pipeline(sample_pmode(), transport.clone())
            .send(submission())
            .await
            .unwrap();

        assert_eq!(outcome.state, DeliveryState::Failed);
        assert_eq!(transport.calls(), 3);
        assert!(outcome.detail.unwrap().contains("cid:invoice.xml"));
    }

    #[test]
    fn test_compare_digests() {
        let part = |uri: &str, value: &str| PartDigest {
            uri: uri.to_string(),
            digest_value: value.to_string(),
        };
        let sent = vec![part("#m", "a"), part("cid:x", "b")];

        assert!(compare_digests(&sent, &[part("cid:x", "b"), part("#m", "a")]).is_ok());
        assert!(compare_digests(&sent, &[part("#m", "a")]).is_err());
        assert!(compare_digests(&sent, &[part("#m", "a"), part("cid:x", "c")]).is_err());
        assert!(compare_digests(&sent, &[part("#m", "a"), part("cid:x", "b"), part("cid:y", "d")]).is_err());
    }

    fn signing_pmode(peer_seed: [u8; 32]) -> PMode {
        let mut pmode = sample_pmode();
        pmode.security.sign = true;
        pmode.security.peer_certificate = Ed25519SecurityProvider::new(Some(peer_seed), None)
            .certificate()
            .map(|c| c.to_base64());
        pmode
    }

    #[tokio::test]
    async fn test_unsigned_receipt_rejected_when_signing() {
        let transport = MockTransport::new(Behaviour::Receipt);
        let outcome = pipeline(signing_pmode([4u8; 32]), transport.clone())
            .send(submission())
            .await
            .unwrap();

        assert_eq!(outcome.state, DeliveryState::Failed);
        assert_eq!(outcome.errors, vec![ErrorCode::MissingReceipt]);
        assert!(outcome.detail.unwrap().contains("not signed"));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_unsigned_error_signal_keeps_peer_code() {
        let transport = MockTransport::new(Behaviour::ErrorSignal);
        let outcome = pipeline(signing_pmode([4u8; 32]), transport)
            .send(submission())
            .await
            .unwrap();
        assert_eq!(outcome.state, DeliveryState::Failed);
        assert!(outcome.detail.unwrap().contains("error signal"));
    }

    #[tokio::test]
    async fn test_signed_receipt_accepted_when_signing() {
        let transport = MockTransport::new(Behaviour::SignedReceipt([4u8; 32]));
        let outcome = pipeline(signing_pmode([4u8; 32]), transport.clone())
            .send(submission())
            .await
            .unwrap();
        assert!(outcome.is_delivered());

        // Signed by someone else
        let transport = MockTransport::new(Behaviour::SignedReceipt([8u8; 32]));
        let outcome = pipeline(signing_pmode([4u8; 32]), transport)
            .send(submission())
            .await
            .unwrap();
        assert_eq!(outcome.state, DeliveryState::Failed);
    }

    #[tokio::test]
    async fn test_retry_until_max_attempts() {
        let transport = MockTransport::new(Behaviour::ConnectionRefused);
        let outcome = pipeline(sample_pmode(), transport.clone())
            .send(submission())
            .await
            .unwrap();

        assert_eq!(outcome.state, DeliveryState::Failed);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.errors, vec![ErrorCode::MissingReceipt]);
        assert_eq!(transport.calls(), 3);

        // Same wire MessageId, fresh messaging id per attempt
        let message_ids = transport.message_ids.lock().clone();
        assert!(message_ids.iter().all(|id| *id == outcome.message_id));
        let messaging_ids = transport.messaging_ids.lock().clone();
        assert_ne!(messaging_ids[0], messaging_ids[1]);
        assert_ne!(messaging_ids[1], messaging_ids[2]);
    }

    #[tokio::test]
    async fn test_retry_then_delivered() {
        let transport = MockTransport::new(Behaviour::ReceiptOnAttempt(2));
        let outcome = pipeline(sample_pmode(), transport.clone())
            .send(submission())
            .await
            .unwrap();
        assert!(outcome.is_delivered());
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn test_unrelated_receipt_is_ignored() {
        let transport = MockTransport::new(Behaviour::ReceiptFor("someone-else@as4"));
        let outcome = pipeline(sample_pmode(), transport.clone())
            .send(submission())
            .await
            .unwrap();
        assert_eq!(outcome.state, DeliveryState::Failed);
        assert_eq!(outcome.errors, vec![ErrorCode::MissingReceipt]);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_error_signal_counts_as_failed_attempt() {
        let transport = MockTransport::new(Behaviour::ErrorSignal);
        let outcome = pipeline(sample_pmode(), transport.clone())
            .send(submission())
            .await
            .unwrap();
        assert_eq!(outcome.state, DeliveryState::Failed);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_timeout_is_a_transport_failure() {
        let transport = MockTransport::new(Behaviour::Hang);
        let outcome = pipeline(sample_pmode(), transport.clone())
            .with_attempt_timeout(Duration::from_millis(20))
            .send(submission())
            .await
            .unwrap();
        assert_eq!(outcome.state, DeliveryState::Failed);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.detail.unwrap().contains("No response"));
    }

    #[tokio::test]
    async fn test_without_reliability_single_attempt() {
        let mut pmode = sample_pmode();
        pmode.reliability = None;

        let transport = MockTransport::new(Behaviour::Status(202));
        let outcome = pipeline(pmode.clone(), transport.clone())
            .send(submission())
            .await
            .unwrap();
        assert!(outcome.is_delivered());
        assert!(outcome.receipt.is_none());

        let transport = MockTransport::new(Behaviour::Status(500));
        let outcome = pipeline(pmode.clone(), transport.clone())
            .send(submission())
            .await
            .unwrap();
        assert_eq!(outcome.state, DeliveryState::Failed);
        assert_eq!(outcome.errors, vec![ErrorCode::DeliveryFailure]);
        assert_eq!(transport.calls(), 1);

        let transport = MockTransport::new(Behaviour::ConnectionRefused);
        let outcome = pipeline(pmode, transport.clone()).send(submission()).await.unwrap();
        assert_eq!(outcome.errors, vec![ErrorCode::ConnectionFailure]);
    }

    #[tokio::test]
    async fn test_endpoint_from_resolver() {
        let mut pmode = sample_pmode();
        pmode.endpoint_url = None;

        let transport = MockTransport::new(Behaviour::Receipt);
        let resolver = StaticEndpointResolver::new().with_endpoint(
            "receiver",
            Endpoint {
                url: "https://receiver.example.org/as4".to_string(),
                certificate: None,
            },
        );
        let outcome = pipeline(pmode.clone(), transport.clone())
            .with_endpoint_resolver(Arc::new(resolver))
            .send(submission())
            .await
            .unwrap();
        assert!(outcome.is_delivered());
        assert_eq!(transport.urls.lock()[0], "https://receiver.example.org/as4");

        // Neither URL nor resolver
        let err = pipeline(pmode, MockTransport::new(Behaviour::Receipt))
            .send(submission())
            .await
            .unwrap_err();
        assert!(matches!(err, As4Error::Config(_)));
    }

    #[tokio::test]
    async fn test_unknown_pmode() {
        let mut submission = submission();
        submission.pmode_id = "missing".to_string();
        let err = pipeline(sample_pmode(), MockTransport::new(Behaviour::Receipt))
            .send(submission)
            .await
            .unwrap_err();
        assert!(matches!(err, As4Error::PModeNotFound(_)));
    }

    #[tokio::test]
    async fn test_submit_runs_in_background() {
        let transport = MockTransport::new(Behaviour::Receipt);
        let pipeline = Arc::new(pipeline(sample_pmode(), transport));
        let handle = pipeline.submit(submission());
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.is_delivered());
    }

    #[test]
    fn test_build_user_message_compresses() {
        let mut pmode = sample_pmode();
        pmode.compress = true;
        let mut submission = submission();
        submission.message_id = Some("fixed@as4".to_string());
        submission.action = Some("CreditNote".to_string());

        let message = build_user_message(&pmode, submission).unwrap();
        assert_eq!(message.message_info.message_id, "fixed@as4");
        assert_eq!(message.collaboration_info.action, "CreditNote");
        assert_eq!(message.payload_info[0].compression, Some(CompressionType::Gzip));
        assert_eq!(message.payload_info[0].mime_type.as_deref(), Some("application/xml"));
        assert_eq!(message.attachments[0].mime_type, "application/gzip");
        assert_eq!(
            CompressionType::Gzip.decompress(&message.attachments[0].data, u64::MAX).unwrap(),
            b"<Invoice/>"
        );
    }

    #[test]
    fn test_retry_state_transitions() {
        let mut retry = RetryState::new(2);
        assert_eq!(retry.begin_attempt().unwrap(), 1);
        assert!(retry.transition(DeliveryState::Pending).is_err());
        retry.transition(DeliveryState::ReceiptMissing).unwrap();
        retry.transition(DeliveryState::Pending).unwrap();
        assert_eq!(retry.begin_attempt().unwrap(), 2);
        assert!(!retry.attempts_left());
        retry.transition(DeliveryState::Delivered).unwrap();
        assert!(retry.state.is_terminal());
        assert!(retry.begin_attempt().is_err());
    }
}
