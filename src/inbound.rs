//! Inbound pipeline.
//!
//! Turns one HTTP request into exactly one signal message: a Receipt when the
//! user message was delivered (or a cached one for a duplicate), an Error
//! signal naming the first stage that rejected it otherwise.

use crate::compression::CompressionType;
use crate::config::{SettingsConfig, SoapVersion};
use crate::dedup::{DedupOutcome, MessageIdStore};
use crate::dump::DumpManager;
use crate::envelope::{unwrap, wrap, EnvelopeDocument, HeaderBlock};
use crate::error::{As4Error, ErrorCode};
use crate::handler::MessageHandler;
use crate::message::{
    user_message_xml, As4Message, Attachment, ErrorDetail, ErrorSignal, MessageKind, PartDigest,
    Receipt, ReceiptContent, UserMessage,
};
use crate::metadata::{IncomingMessageMetadata, IncomingState};
use crate::mime::{check_references, pack, split_entity};
use crate::pmode::{PMode, PModeResolver};
use crate::receiver::ReceiverCheck;
use crate::security::{part_digests, process_incoming, SecurityHeader, SecurityProvider};
use crate::validator::{EbmsHeaderValidator, SchemaValidator};
use crate::xml::EBMS_NS;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// HTTP response to an incoming request.
#[derive(Debug, Clone)]
pub struct InboundResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    /// Final metadata of the request
    pub metadata: IncomingMessageMetadata,
}

/// Counters of processed requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundStats {
    pub received: u64,
    pub accepted: u64,
    pub duplicates: u64,
    pub rejected: u64,
}

/// Successful outcome of a request.
struct Reply {
    content_type: String,
    body: Vec<u8>,
    duplicate: bool,
}

/// Errors to report back, with what is known about the faulty message.
struct Rejection {
    soap_version: SoapVersion,
    ref_to_message_id: Option<String>,
    errors: Vec<ErrorDetail>,
}

impl Rejection {
    fn new(
        code: ErrorCode,
        soap_version: SoapVersion,
        ref_to_message_id: Option<&str>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            soap_version,
            ref_to_message_id: ref_to_message_id.map(String::from),
            errors: vec![ErrorDetail::new(code, ref_to_message_id).with_detail(detail)],
        }
    }

    fn from_error(error: &As4Error, soap_version: SoapVersion, ref_to_message_id: Option<&str>) -> Self {
        Self::new(error.error_code(), soap_version, ref_to_message_id, error.to_string())
    }
}

/// Receives AS4 messages and produces their synchronous reply.
pub struct InboundPipeline {
    settings: SettingsConfig,
    pmodes: Arc<dyn PModeResolver>,
    security: Arc<dyn SecurityProvider>,
    dedup: Arc<dyn MessageIdStore>,
    handler: Arc<dyn MessageHandler>,
    validator: Box<dyn SchemaValidator>,
    receiver_check: Option<ReceiverCheck>,
    dump: DumpManager,
    received: AtomicU64,
    accepted: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
}

impl InboundPipeline {
    pub fn new(
        settings: SettingsConfig,
        pmodes: Arc<dyn PModeResolver>,
        security: Arc<dyn SecurityProvider>,
        dedup: Arc<dyn MessageIdStore>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            settings,
            pmodes,
            security,
            dedup,
            handler,
            validator: Box::new(EbmsHeaderValidator::new()),
            receiver_check: None,
            dump: DumpManager::default(),
            received: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn with_validator(mut self, validator: Box<dyn SchemaValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_receiver_check(mut self, check: ReceiverCheck) -> Self {
        self.receiver_check = Some(check);
        self
    }

    pub fn with_dump_manager(mut self, dump: DumpManager) -> Self {
        self.dump = dump;
        self
    }

    pub fn stats(&self) -> InboundStats {
        InboundStats {
            received: self.received.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn is_valid_content_type(&self, content_type: &str) -> bool {
        let ct_lower = content_type.to_lowercase();
        self.settings
            .allowed_content_types
            .iter()
            .any(|allowed| ct_lower.contains(&allowed.to_lowercase()))
    }

    /// Process one request. Never fails: every outcome is a signal message.
    pub async fn process(&self, content_type: &str, body: &[u8]) -> InboundResponse {
        self.received.fetch_add(1, Ordering::Relaxed);
        let mut metadata = IncomingMessageMetadata::new(content_type);

        debug!(
            incoming_id = %metadata.incoming_id,
            content_type = %content_type,
            size = body.len(),
            "Processing incoming message"
        );
        self.dump.incoming(&metadata, body).await;

        let (status, content_type, body) = match self.run(content_type, body, &mut metadata).await {
            Ok(reply) => {
                if reply.duplicate {
                    metadata.state = IncomingState::Duplicate;
                    self.duplicates.fetch_add(1, Ordering::Relaxed);
                } else {
                    metadata.state = IncomingState::Accepted;
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                }
                (200, reply.content_type, reply.body)
            }
            Err(rejection) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                for e in &rejection.errors {
                    warn!(
                        incoming_id = %metadata.incoming_id,
                        message_id = ?metadata.message_id,
                        code = %e.code.as_str(),
                        detail = ?e.detail,
                        "Incoming message rejected"
                    );
                }
                metadata.reject(rejection.errors.iter().map(|e| e.code));
                match error_reply(rejection) {
                    Ok(reply) => (200, reply.content_type, reply.body),
                    Err(e) => {
                        error!(incoming_id = %metadata.incoming_id, error = %e, "Cannot build error signal");
                        (500, "text/plain".to_string(), e.to_string().into_bytes())
                    }
                }
            }
        };

        self.dump.incoming_end(&metadata).await;

        InboundResponse {
            status,
            content_type,
            body,
            metadata,
        }
    }

    async fn run(
        &self,
        content_type: &str,
        body: &[u8],
        metadata: &mut IncomingMessageMetadata,
    ) -> Result<Reply, Rejection> {
        let default_version = self.settings.default_soap_version;

        if !self.is_valid_content_type(content_type) {
            return Err(Rejection::new(
                ErrorCode::MimeInconsistency,
                default_version,
                None,
                format!("Content type '{}' is not accepted", content_type),
            ));
        }

        let (root, attachments) = split_entity(content_type, body)
            .map_err(|e| Rejection::from_error(&e, default_version, None))?;

        let document = EnvelopeDocument::parse(&root).map_err(|e| {
            Rejection::new(ErrorCode::InvalidHeader, default_version, None, e.to_string())
        })?;
        let version = document.version;

        let (message, payload) = {
            let (block, payload) = unwrap(&document)
                .map_err(|e| Rejection::new(ErrorCode::InvalidHeader, version, None, e.to_string()))?;
            let hint = message_id_hint(block);

            let validation = self.validator.validate(block);
            if validation.has_violations() {
                return Err(Rejection {
                    soap_version: version,
                    errors: validation
                        .violations
                        .iter()
                        .map(|v| ErrorDetail::new(v.code, hint.as_deref()).with_detail(&v.message))
                        .collect(),
                    ref_to_message_id: hint,
                });
            }

            let message = As4Message::from_header_block(block, version)
                .map_err(|e| Rejection::new(ErrorCode::InvalidHeader, version, hint.as_deref(), e.to_string()))?;
            (message, payload.map(String::from))
        };

        let message_id = message.message_id().to_string();
        metadata.message_id = Some(message_id.clone());
        let reject = |code: ErrorCode, detail: String| {
            Rejection::new(code, version, Some(message_id.as_str()), detail)
        };

        let user = match message.into_kind() {
            MessageKind::User(user) => user,
            MessageKind::Receipt(_) | MessageKind::Error(_) => {
                return Err(reject(
                    ErrorCode::FeatureNotSupported,
                    "Signal messages are not accepted on this endpoint".to_string(),
                ));
            }
        };

        check_references(
            &user.payload_info,
            payload.is_some(),
            &attachments,
            self.settings.allow_unreferenced_parts,
        )
        .map_err(|e| reject(ErrorCode::MimeInconsistency, e.to_string()))?;

        let pmode = self.pmodes.resolve_for_message(&user).ok_or_else(|| {
            reject(
                ErrorCode::ProcessingModeMismatch,
                format!(
                    "No PMode for agreement '{}'",
                    user.collaboration_info.agreement_ref.as_deref().unwrap_or("")
                ),
            )
        })?;
        let mismatches = pmode.mismatches(&user);
        if !mismatches.is_empty() {
            return Err(reject(ErrorCode::ProcessingModeMismatch, mismatches.join("; ")));
        }
        metadata.pmode_id = Some(pmode.id.clone());

        let (document, attachments) =
            process_incoming(self.security.as_ref(), &pmode, document, attachments)
                .map_err(|e| reject(e.error_code(), e.to_string()))?;

        match self.dedup.try_begin(&message_id) {
            DedupOutcome::New => {}
            DedupOutcome::Duplicate(cached) => {
                info!(message_id = %message_id, "Duplicate message, resending receipt");
                return Ok(Reply {
                    content_type: signal_content_type(version),
                    body: cached,
                    duplicate: true,
                });
            }
            DedupOutcome::InProgress => {
                return Err(reject(
                    ErrorCode::Other,
                    "Message with this id is already being processed".to_string(),
                ));
            }
        }

        match self
            .deliver(&pmode, &document, user, payload, attachments, metadata)
            .await
        {
            Ok(reply) => {
                self.dedup.complete(&message_id, reply.body.clone());
                info!(message_id = %message_id, pmode = %pmode.id, "Message accepted");
                Ok(reply)
            }
            Err(rejection) => {
                self.dedup.abort(&message_id);
                Err(rejection)
            }
        }
    }

    /// Stages after the message id has been reserved.
    async fn deliver(
        &self,
        pmode: &PMode,
        document: &EnvelopeDocument,
        mut user: UserMessage,
        payload: Option<String>,
        attachments: Vec<Attachment>,
        metadata: &IncomingMessageMetadata,
    ) -> Result<Reply, Rejection> {
        let version = document.version;
        let message_id = user.message_info.message_id.clone();
        let reject = |code: ErrorCode, detail: String| {
            Rejection::new(code, version, Some(message_id.as_str()), detail)
        };

        // Digests cover the parts as they were sent, before decompression
        let digests = if non_repudiation(pmode) {
            Some(
                receipt_digests(document, &attachments)
                    .map_err(|e| reject(e.error_code(), e.to_string()))?,
            )
        } else {
            None
        };

        let attachments =
            decompress_attachments(&user, attachments, self.settings.max_decompressed_size)
            .map_err(|e| reject(ErrorCode::DecompressionFailure, e.to_string()))?;
        user.attach_payloads(payload, attachments, self.settings.allow_unreferenced_parts)
            .map_err(|e| reject(ErrorCode::MimeInconsistency, e.to_string()))?;

        if let Some(check) = &self.receiver_check {
            check
                .check(&user)
                .await
                .map_err(|e| reject(e.error_code(), e.to_string()))?;
        }

        self.handler
            .handle(&user, metadata)
            .await
            .map_err(|e| reject(e.error_code(), e.detail))?;

        let content = match digests {
            Some(digests) => ReceiptContent::NonRepudiation(digests),
            None => ReceiptContent::UserMessageEcho(user_message_xml(&user)),
        };
        let receipt = As4Message::receipt(version, Receipt::build(&message_id, content));
        let mut document =
            wrap(&receipt, None).map_err(|e| reject(ErrorCode::Other, e.to_string()))?;
        if pmode.security.sign {
            document = self
                .security
                .sign(document, &[], pmode.security.algorithm)
                .map_err(|e| reject(ErrorCode::Other, e.to_string()))?;
        }

        let entity = pack(&document, &[]);
        Ok(Reply {
            content_type: entity.content_type,
            body: entity.body,
            duplicate: false,
        })
    }
}

fn non_repudiation(pmode: &PMode) -> bool {
    pmode.reliability.as_ref().is_some_and(|r| r.non_repudiation)
}

/// Signed references when the message was signed, freshly computed digests otherwise.
fn receipt_digests(
    document: &EnvelopeDocument,
    attachments: &[Attachment],
) -> Result<Vec<PartDigest>, As4Error> {
    match SecurityHeader::from_document(document).signature {
        Some(signature) => Ok(signature.references),
        None => part_digests(document, attachments),
    }
}

/// Undo payload compression announced in the part info.
fn decompress_attachments(
    user: &UserMessage,
    attachments: Vec<Attachment>,
    limit: u64,
) -> Result<Vec<Attachment>, As4Error> {
    attachments
        .into_iter()
        .map(|mut attachment| {
            let Some(part) = user.part_for(&attachment.content_id) else {
                return Ok(attachment);
            };
            if let Some(compression) = part.compression {
                let declared = CompressionType::from_mime_type(&attachment.mime_type);
                if declared.is_some() && declared != Some(compression) {
                    return Err(As4Error::Compression(format!(
                        "Part '{}' is '{}', not {}",
                        attachment.content_id,
                        attachment.mime_type,
                        compression.mime_type()
                    )));
                }
                attachment.data = compression.decompress(&attachment.data, limit)?;
                if let Some(mime_type) = &part.mime_type {
                    attachment.mime_type = mime_type.clone();
                }
            }
            Ok(attachment)
        })
        .collect()
}

/// MessageId of a header block that may not parse completely.
fn message_id_hint(block: &HeaderBlock) -> Option<String> {
    let messaging = &block.element;
    let unit = messaging
        .child(EBMS_NS, "UserMessage")
        .or_else(|| messaging.child(EBMS_NS, "SignalMessage"))?;
    unit.child(EBMS_NS, "MessageInfo")?
        .child_text(EBMS_NS, "MessageId")
        .filter(|id| !id.is_empty())
}

fn signal_content_type(version: SoapVersion) -> String {
    format!("{}; charset=UTF-8", version.mime_type())
}

fn error_reply(rejection: Rejection) -> Result<Reply, As4Error> {
    let signal = ErrorSignal::build(rejection.ref_to_message_id, rejection.errors)?;
    let document = wrap(&As4Message::error(rejection.soap_version, signal), None)?;
    let entity = pack(&document, &[]);
    Ok(Reply {
        content_type: entity.content_type,
        body: entity.body,
        duplicate: false,
    })
}
