//! Message security.
//!
//! [`SecurityProvider`] is the sign/verify/encrypt/decrypt capability; the
//! pipelines never touch key material or primitives directly. The functions
//! [`secure_outgoing`] and [`process_incoming`] decide from the PMode when each
//! capability is used and which error code a failure maps to.
//!
//! The built-in [`Ed25519SecurityProvider`] writes a `wsse:Security` header
//! holding
//! - a `ds:Signature` whose references are SHA-256 digests of the exact
//!   `eb:Messaging` block, the SOAP body content and every attachment, signed
//!   with Ed25519 over the ordered reference list;
//! - one `xenc:EncryptedData` per attachment encrypted with AES-256-GCM under
//!   a key shared with the peer (nonce prepended to the ciphertext, the
//!   Content-ID bound as associated data).

use crate::config::{SecurityKeysConfig, SoapVersion};
use crate::envelope::{EnvelopeDocument, HeaderBlock};
use crate::error::{As4Error, ErrorCode};
use crate::message::{Attachment, PartDigest, SHA256_URI};
use crate::pmode::{PMode, SignatureAlgorithm};
use crate::xml::{escape, DS_NS, EBMS_NS, WSSE_NS, WSU_NS, XENC_NS};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// XML-Enc algorithm URI for AES-256-GCM.
pub const AES256_GCM_URI: &str = "http://www.w3.org/2009/xmlenc11#aes256-gcm";
/// SwA profile type of an encrypted attachment.
pub const ATTACHMENT_CONTENT_ONLY: &str =
    "http://docs.oasis-open.org/wss/oasis-wss-SwAProfile-1.1#Attachment-Content-Only";
/// MIME type of encrypted attachment parts.
pub const ENCRYPTED_MIME_TYPE: &str = "application/octet-stream";

const NONCE_LEN: usize = 12;

/// Public key material of a peer, as trusted through a PMode or the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate(Vec<u8>);

impl Certificate {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Decode a base64 certificate.
    pub fn from_base64(value: &str) -> Result<Self, As4Error> {
        STANDARD
            .decode(value.trim())
            .map(Self)
            .map_err(|e| As4Error::Config(format!("Certificate is not valid base64: {}", e)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// Short hex fingerprint for logs.
    pub fn fingerprint(&self) -> String {
        Sha256::digest(&self.0)[..8]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// Outcome of a signature verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub valid: bool,
    pub failure_reason: Option<String>,
}

impl VerificationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            failure_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            failure_reason: Some(reason.into()),
        }
    }
}

/// Cryptographic capability used by both pipelines.
pub trait SecurityProvider: Send + Sync {
    /// Sign the messaging block, body and attachments of a document.
    fn sign(
        &self,
        document: EnvelopeDocument,
        attachments: &[Attachment],
        algorithm: SignatureAlgorithm,
    ) -> Result<EnvelopeDocument, As4Error>;

    /// Verify the signature of a document against a trusted certificate.
    fn verify(
        &self,
        document: &EnvelopeDocument,
        attachments: &[Attachment],
        trusted: &Certificate,
    ) -> VerificationResult;

    /// Encrypt the attachments of a document.
    fn encrypt(
        &self,
        document: EnvelopeDocument,
        attachments: Vec<Attachment>,
    ) -> Result<(EnvelopeDocument, Vec<Attachment>), As4Error>;

    /// Decrypt the attachments of a document.
    fn decrypt(
        &self,
        document: EnvelopeDocument,
        attachments: Vec<Attachment>,
    ) -> Result<(EnvelopeDocument, Vec<Attachment>), As4Error>;

    /// Own certificate, to be handed to peers.
    fn certificate(&self) -> Option<Certificate>;
}

/// `ds:Signature` content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureInfo {
    pub algorithm: String,
    pub references: Vec<PartDigest>,
    /// Base64 signature value
    pub value: String,
}

/// `xenc:EncryptedData` for one attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPart {
    pub content_id: String,
    /// MIME type of the plaintext
    pub mime_type: String,
    pub algorithm: String,
}

/// Content of a `wsse:Security` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityHeader {
    pub signature: Option<SignatureInfo>,
    pub encrypted_parts: Vec<EncryptedPart>,
}

impl SecurityHeader {
    /// Read the security header of a document, if any.
    pub fn from_document(document: &EnvelopeDocument) -> Self {
        document
            .header(WSSE_NS, "Security")
            .map(Self::from_block)
            .unwrap_or_default()
    }

    fn from_block(block: &HeaderBlock) -> Self {
        let element = &block.element;

        let signature = element.child(DS_NS, "Signature").map(|sig| {
            let signed_info = sig.child(DS_NS, "SignedInfo");
            let algorithm = signed_info
                .and_then(|si| si.child(DS_NS, "SignatureMethod"))
                .and_then(|m| m.attr("Algorithm"))
                .unwrap_or_default()
                .to_string();
            let references = signed_info
                .map(|si| {
                    si.children_named(DS_NS, "Reference")
                        .map(|r| PartDigest {
                            uri: r.attr("URI").unwrap_or_default().to_string(),
                            digest_value: r.child_text(DS_NS, "DigestValue").unwrap_or_default(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            SignatureInfo {
                algorithm,
                references,
                value: sig.child_text(DS_NS, "SignatureValue").unwrap_or_default(),
            }
        });

        let encrypted_parts = element
            .children_named(XENC_NS, "EncryptedData")
            .filter_map(|data| {
                let uri = data
                    .child(XENC_NS, "CipherData")?
                    .child(XENC_NS, "CipherReference")?
                    .attr("URI")?;
                Some(EncryptedPart {
                    content_id: uri.strip_prefix("cid:").unwrap_or(uri).to_string(),
                    mime_type: data.attr("MimeType").unwrap_or(ENCRYPTED_MIME_TYPE).to_string(),
                    algorithm: data
                        .child(XENC_NS, "EncryptionMethod")
                        .and_then(|m| m.attr("Algorithm"))
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect();

        Self {
            signature,
            encrypted_parts,
        }
    }

    fn to_block(&self, version: SoapVersion) -> Result<HeaderBlock, As4Error> {
        let mut out = format!(
            r#"<wsse:Security xmlns:wsse="{}" xmlns:ds="{}" xmlns:xenc="{}" xmlns:{p}="{ns}" {p}:mustUnderstand="{mu}">"#,
            WSSE_NS,
            DS_NS,
            XENC_NS,
            p = version.prefix(),
            ns = version.namespace(),
            mu = version.must_understand_true()
        );

        for part in &self.encrypted_parts {
            out.push_str(&format!(
                r#"<xenc:EncryptedData Type="{}" MimeType="{}"><xenc:EncryptionMethod Algorithm="{}"/><xenc:CipherData><xenc:CipherReference URI="cid:{}"/></xenc:CipherData></xenc:EncryptedData>"#,
                ATTACHMENT_CONTENT_ONLY,
                escape(&part.mime_type),
                escape(&part.algorithm),
                escape(&part.content_id)
            ));
        }

        if let Some(signature) = &self.signature {
            out.push_str(&format!(
                r#"<ds:Signature><ds:SignedInfo><ds:SignatureMethod Algorithm="{}"/>"#,
                escape(&signature.algorithm)
            ));
            for reference in &signature.references {
                out.push_str(&format!(
                    r#"<ds:Reference URI="{}"><ds:DigestMethod Algorithm="{}"/><ds:DigestValue>{}</ds:DigestValue></ds:Reference>"#,
                    escape(&reference.uri),
                    SHA256_URI,
                    escape(&reference.digest_value)
                ));
            }
            out.push_str(&format!(
                "</ds:SignedInfo><ds:SignatureValue>{}</ds:SignatureValue></ds:Signature>",
                escape(&signature.value)
            ));
        }

        out.push_str("</wsse:Security>");
        HeaderBlock::parse(out)
    }

    fn apply(&self, mut document: EnvelopeDocument) -> Result<EnvelopeDocument, As4Error> {
        let block = self.to_block(document.version)?;
        document.set_security_header(block);
        Ok(document)
    }
}

/// Base64 SHA-256 digest.
pub fn digest(data: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(data))
}

/// Digests of every part of a message: messaging block, body, attachments.
pub fn part_digests(
    document: &EnvelopeDocument,
    attachments: &[Attachment],
) -> Result<Vec<PartDigest>, As4Error> {
    let messaging = document.header(EBMS_NS, "Messaging").ok_or_else(|| {
        As4Error::MalformedEnvelope("eb:Messaging header is missing".to_string())
    })?;
    let messaging_id = messaging.element.attr_ns(WSU_NS, "Id").ok_or_else(|| {
        As4Error::security(
            ErrorCode::PolicyNoncompliance,
            "eb:Messaging has no wsu:Id to reference",
        )
    })?;

    let mut digests = vec![PartDigest {
        uri: format!("#{}", messaging_id),
        digest_value: digest(messaging.raw.as_bytes()),
    }];
    if let (Some(body), Some(body_id)) = (&document.body, &document.body_id) {
        digests.push(PartDigest {
            uri: format!("#{}", body_id),
            digest_value: digest(body.as_bytes()),
        });
    }
    for attachment in attachments {
        digests.push(PartDigest {
            uri: format!("cid:{}", attachment.content_id),
            digest_value: digest(&attachment.data),
        });
    }
    Ok(digests)
}

/// Bytes referenced by a signature reference URI.
fn resolve_reference<'a>(
    document: &'a EnvelopeDocument,
    attachments: &'a [Attachment],
    uri: &str,
) -> Option<&'a [u8]> {
    if let Some(cid) = uri.strip_prefix("cid:") {
        return attachments
            .iter()
            .find(|a| a.content_id == cid)
            .map(|a| a.data.as_slice());
    }
    let id = uri.strip_prefix('#')?;
    if document.body_id.as_deref() == Some(id) {
        return Some(document.body.as_deref().unwrap_or_default().as_bytes());
    }
    document
        .header_blocks
        .iter()
        .find(|b| b.element.attr_ns(WSU_NS, "Id") == Some(id))
        .map(|b| b.raw.as_bytes())
}

fn signing_input(algorithm: &str, references: &[PartDigest]) -> Vec<u8> {
    let mut input = String::from(algorithm);
    input.push('\n');
    for reference in references {
        input.push_str(&reference.uri);
        input.push('\n');
        input.push_str(&reference.digest_value);
        input.push('\n');
    }
    input.into_bytes()
}

/// Built-in provider: Ed25519 signatures and AES-256-GCM attachment encryption.
pub struct Ed25519SecurityProvider {
    signing_key: Option<SigningKey>,
    encryption_key: Option<[u8; 32]>,
}

impl Ed25519SecurityProvider {
    pub fn new(signing_seed: Option<[u8; 32]>, encryption_key: Option<[u8; 32]>) -> Self {
        Self {
            signing_key: signing_seed.map(|seed| SigningKey::from_bytes(&seed)),
            encryption_key,
        }
    }

    /// Build from the `security` configuration section.
    pub fn from_config(config: &SecurityKeysConfig) -> Result<Self, As4Error> {
        Ok(Self::new(
            config.signing_key_bytes()?,
            config.encryption_key_bytes()?,
        ))
    }

    fn cipher(&self, code: ErrorCode) -> Result<Aes256Gcm, As4Error> {
        let key = self
            .encryption_key
            .ok_or_else(|| As4Error::security(code, "No encryption key configured"))?;
        Aes256Gcm::new_from_slice(&key).map_err(|e| As4Error::security(code, e.to_string()))
    }
}

impl std::fmt::Debug for Ed25519SecurityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519SecurityProvider")
            .field("certificate", &self.certificate().map(|c| c.fingerprint()))
            .field("encryption", &self.encryption_key.is_some())
            .finish()
    }
}

impl SecurityProvider for Ed25519SecurityProvider {
    fn sign(
        &self,
        document: EnvelopeDocument,
        attachments: &[Attachment],
        algorithm: SignatureAlgorithm,
    ) -> Result<EnvelopeDocument, As4Error> {
        let key = self.signing_key.as_ref().ok_or_else(|| {
            As4Error::Config("Signing required but no signing key configured".to_string())
        })?;

        let references = part_digests(&document, attachments)?;
        let algorithm = algorithm.uri().to_string();
        let signature = key.sign(&signing_input(&algorithm, &references));

        let mut header = SecurityHeader::from_document(&document);
        header.signature = Some(SignatureInfo {
            algorithm,
            references,
            value: STANDARD.encode(signature.to_bytes()),
        });
        debug!(references = header.signature.as_ref().map_or(0, |s| s.references.len()), "Document signed");
        header.apply(document)
    }

    fn verify(
        &self,
        document: &EnvelopeDocument,
        attachments: &[Attachment],
        trusted: &Certificate,
    ) -> VerificationResult {
        let header = SecurityHeader::from_document(document);
        let Some(signature) = header.signature else {
            return VerificationResult::failed("Message is not signed");
        };

        if signature.algorithm != SignatureAlgorithm::Ed25519.uri() {
            return VerificationResult::failed(format!(
                "Unsupported signature algorithm '{}'",
                signature.algorithm
            ));
        }

        for reference in &signature.references {
            let Some(data) = resolve_reference(document, attachments, &reference.uri) else {
                return VerificationResult::failed(format!(
                    "Reference '{}' cannot be resolved",
                    reference.uri
                ));
            };
            if digest(data) != reference.digest_value {
                return VerificationResult::failed(format!(
                    "Digest mismatch for '{}'",
                    reference.uri
                ));
            }
        }

        // Every part that will be processed must be covered
        let expected = match part_digests(document, attachments) {
            Ok(expected) => expected,
            Err(e) => return VerificationResult::failed(e.to_string()),
        };
        for part in &expected {
            if !signature.references.iter().any(|r| r.uri == part.uri) {
                return VerificationResult::failed(format!("Part '{}' is not signed", part.uri));
            }
        }

        let Ok(key_bytes) = <[u8; 32]>::try_from(trusted.as_bytes()) else {
            return VerificationResult::failed("Trusted certificate is not an Ed25519 key");
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
            return VerificationResult::failed("Trusted certificate is not an Ed25519 key");
        };
        let Ok(value) = STANDARD.decode(signature.value.trim()) else {
            return VerificationResult::failed("Signature value is not valid base64");
        };
        let Ok(sig) = Signature::from_slice(&value) else {
            return VerificationResult::failed("Signature value has the wrong length");
        };

        match verifying_key.verify(&signing_input(&signature.algorithm, &signature.references), &sig) {
            Ok(()) => VerificationResult::ok(),
            Err(_) => VerificationResult::failed("Signature value does not verify"),
        }
    }

    fn encrypt(
        &self,
        document: EnvelopeDocument,
        attachments: Vec<Attachment>,
    ) -> Result<(EnvelopeDocument, Vec<Attachment>), As4Error> {
        let cipher = self.cipher(ErrorCode::PolicyNoncompliance)?;
        let mut header = SecurityHeader::from_document(&document);

        let mut encrypted = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
            let ciphertext = cipher
                .encrypt(
                    &nonce,
                    Payload {
                        msg: &attachment.data,
                        aad: attachment.content_id.as_bytes(),
                    },
                )
                .map_err(|_| As4Error::Internal("Attachment encryption failed".to_string()))?;

            let mut data = nonce.to_vec();
            data.extend_from_slice(&ciphertext);

            header.encrypted_parts.push(EncryptedPart {
                content_id: attachment.content_id.clone(),
                mime_type: attachment.mime_type,
                algorithm: AES256_GCM_URI.to_string(),
            });
            encrypted.push(Attachment {
                content_id: attachment.content_id,
                mime_type: ENCRYPTED_MIME_TYPE.to_string(),
                data,
            });
        }

        Ok((header.apply(document)?, encrypted))
    }

    fn decrypt(
        &self,
        document: EnvelopeDocument,
        mut attachments: Vec<Attachment>,
    ) -> Result<(EnvelopeDocument, Vec<Attachment>), As4Error> {
        let header = SecurityHeader::from_document(&document);
        if header.encrypted_parts.is_empty() {
            return Ok((document, attachments));
        }
        let cipher = self.cipher(ErrorCode::FailedDecryption)?;

        for part in &header.encrypted_parts {
            if part.algorithm != AES256_GCM_URI {
                return Err(As4Error::security(
                    ErrorCode::FailedDecryption,
                    format!("Unsupported encryption algorithm '{}'", part.algorithm),
                ));
            }
            let attachment = attachments
                .iter_mut()
                .find(|a| a.content_id == part.content_id)
                .ok_or_else(|| {
                    As4Error::security(
                        ErrorCode::FailedDecryption,
                        format!("Encrypted part 'cid:{}' is missing", part.content_id),
                    )
                })?;
            if attachment.data.len() < NONCE_LEN {
                return Err(As4Error::security(
                    ErrorCode::FailedDecryption,
                    format!("Encrypted part 'cid:{}' is truncated", part.content_id),
                ));
            }

            let (nonce, ciphertext) = attachment.data.split_at(NONCE_LEN);
            let plaintext = cipher
                .decrypt(
                    Nonce::from_slice(nonce),
                    Payload {
                        msg: ciphertext,
                        aad: part.content_id.as_bytes(),
                    },
                )
                .map_err(|_| {
                    As4Error::security(
                        ErrorCode::FailedDecryption,
                        format!("Part 'cid:{}' could not be decrypted", part.content_id),
                    )
                })?;
            attachment.data = plaintext;
            attachment.mime_type = part.mime_type.clone();
        }

        // The encrypted data entries no longer describe the parts
        let remaining = SecurityHeader {
            signature: header.signature,
            encrypted_parts: Vec::new(),
        };
        Ok((remaining.apply(document)?, attachments))
    }

    fn certificate(&self) -> Option<Certificate> {
        self.signing_key
            .as_ref()
            .map(|k| Certificate(k.verifying_key().to_bytes().to_vec()))
    }
}

/// Apply the outbound security of a PMode: sign, then encrypt.
pub fn secure_outgoing(
    provider: &dyn SecurityProvider,
    pmode: &PMode,
    document: EnvelopeDocument,
    attachments: Vec<Attachment>,
) -> Result<(EnvelopeDocument, Vec<Attachment>), As4Error> {
    let mut document = document;
    if pmode.security.sign {
        document = provider.sign(document, &attachments, pmode.security.algorithm)?;
    }
    if pmode.security.encrypt && !attachments.is_empty() {
        return provider.encrypt(document, attachments);
    }
    Ok((document, attachments))
}

/// Check the inbound security of a message against a PMode: decrypt, then verify.
pub fn process_incoming(
    provider: &dyn SecurityProvider,
    pmode: &PMode,
    document: EnvelopeDocument,
    attachments: Vec<Attachment>,
) -> Result<(EnvelopeDocument, Vec<Attachment>), As4Error> {
    let header = SecurityHeader::from_document(&document);

    let (document, attachments) = if !header.encrypted_parts.is_empty() {
        provider.decrypt(document, attachments)?
    } else if pmode.security.encrypt && !attachments.is_empty() {
        return Err(As4Error::security(
            ErrorCode::PolicyNoncompliance,
            "Attachments must be encrypted",
        ));
    } else {
        (document, attachments)
    };

    if header.signature.is_none() {
        if pmode.security.sign {
            return Err(As4Error::security(
                ErrorCode::PolicyNoncompliance,
                "Message must be signed",
            ));
        }
        return Ok((document, attachments));
    }

    match pmode.trusted_certificate()? {
        Some(certificate) => {
            let result = provider.verify(&document, &attachments, &certificate);
            if !result.valid {
                return Err(As4Error::security(
                    ErrorCode::FailedAuthentication,
                    result
                        .failure_reason
                        .unwrap_or_else(|| "Signature verification failed".to_string()),
                ));
            }
            debug!(certificate = %certificate.fingerprint(), "Signature verified");
        }
        None if pmode.security.sign => {
            return Err(As4Error::security(
                ErrorCode::PolicyNoncompliance,
                format!("PMode '{}' has no trusted certificate", pmode.id),
            ));
        }
        None => {
            warn!(pmode = %pmode.id, "Signed message but no trusted certificate, signature not checked");
        }
    }

    Ok((document, attachments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::wrap;
    use crate::message::tests::invoice_message;
    use crate::message::As4Message;
    use crate::pmode::tests::sample_pmode;

    fn provider() -> Ed25519SecurityProvider {
        Ed25519SecurityProvider::new(Some([7u8; 32]), Some([9u8; 32]))
    }

    fn signed_pmode(provider: &Ed25519SecurityProvider) -> PMode {
        let mut pmode = sample_pmode();
        pmode.security.sign = true;
        pmode.security.peer_certificate = provider.certificate().map(|c| c.to_base64());
        pmode
    }

    fn document() -> (EnvelopeDocument, Vec<Attachment>) {
        let user = invoice_message();
        let attachments = user.attachments.clone();
        let message = As4Message::user(SoapVersion::Soap12, user);
        (wrap(&message, Some("<note>hello</note>")).unwrap(), attachments)
    }

    /// Serialize and parse again, as the receiving side sees it.
    fn transmit(document: &EnvelopeDocument) -> EnvelopeDocument {
        EnvelopeDocument::parse(document.to_xml().as_bytes()).unwrap()
    }

    #[test]
    fn test_sign_and_verify() {
        let provider = provider();
        let (doc, attachments) = document();
        let signed = provider.sign(doc, &attachments, SignatureAlgorithm::Ed25519).unwrap();

        let header = SecurityHeader::from_document(&signed);
        assert_eq!(header.signature.as_ref().unwrap().references.len(), 3);

        let received = transmit(&signed);
        let cert = provider.certificate().unwrap();
        assert_eq!(provider.verify(&received, &attachments, &cert), VerificationResult::ok());
    }

    #[test]
    fn test_tampered_attachment_fails() {
        let provider = provider();
        let (doc, mut attachments) = document();
        let signed = provider.sign(doc, &attachments, SignatureAlgorithm::Ed25519).unwrap();

        attachments[0].data = b"<Invoice><ID>43</ID></Invoice>".to_vec();
        let result = provider.verify(&transmit(&signed), &attachments, &provider.certificate().unwrap());
        assert!(!result.valid);
        assert!(result.failure_reason.unwrap().contains("Digest mismatch"));
    }

    #[test]
    fn test_wrong_key_fails() {
        let provider = provider();
        let other = Ed25519SecurityProvider::new(Some([8u8; 32]), None);
        let (doc, attachments) = document();
        let signed = provider.sign(doc, &attachments, SignatureAlgorithm::Ed25519).unwrap();

        let result = provider.verify(&transmit(&signed), &attachments, &other.certificate().unwrap());
        assert!(!result.valid);
    }

    #[test]
    fn test_unsigned_extra_attachment_fails() {
        let provider = provider();
        let (doc, mut attachments) = document();
        let signed = provider.sign(doc, &attachments, SignatureAlgorithm::Ed25519).unwrap();

        attachments.push(Attachment::new("extra", "text/plain", b"x".to_vec()));
        let result = provider.verify(&transmit(&signed), &attachments, &provider.certificate().unwrap());
        assert!(result.failure_reason.unwrap().contains("not signed"));
    }

    #[test]
    fn test_encrypt_decrypt() {
        let provider = provider();
        let (doc, attachments) = document();
        let (encrypted_doc, encrypted) = provider.encrypt(doc, attachments.clone()).unwrap();
        assert_ne!(encrypted[0].data, attachments[0].data);
        assert_eq!(encrypted[0].mime_type, ENCRYPTED_MIME_TYPE);

        let (decrypted_doc, decrypted) = provider.decrypt(transmit(&encrypted_doc), encrypted).unwrap();
        assert_eq!(decrypted, attachments);
        assert!(SecurityHeader::from_document(&decrypted_doc).encrypted_parts.is_empty());
    }

    #[test]
    fn test_decrypt_with_wrong_key() {
        let (doc, attachments) = document();
        let (encrypted_doc, encrypted) = provider().encrypt(doc, attachments).unwrap();

        let other = Ed25519SecurityProvider::new(None, Some([1u8; 32]));
        let err = other.decrypt(encrypted_doc, encrypted).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::FailedDecryption);
    }

    #[test]
    fn test_secure_outgoing_then_process_incoming() {
        let provider = provider();
        let mut pmode = signed_pmode(&provider);
        pmode.security.encrypt = true;

        let (doc, attachments) = document();
        let (secured, wire_attachments) =
            secure_outgoing(&provider, &pmode, doc, attachments.clone()).unwrap();
        let header = SecurityHeader::from_document(&secured);
        assert!(header.signature.is_some());
        assert_eq!(header.encrypted_parts.len(), 1);

        let (_, received) =
            process_incoming(&provider, &pmode, transmit(&secured), wire_attachments).unwrap();
        assert_eq!(received, attachments);
    }

    #[test]
    fn test_process_incoming_policy() {
        let provider = provider();
        let pmode = signed_pmode(&provider);
        let (doc, attachments) = document();

        // Unsigned message under a signing PMode
        let err = process_incoming(&provider, &pmode, doc.clone(), attachments.clone()).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::PolicyNoncompliance);

        // Unencrypted attachments under an encrypting PMode
        let mut encrypting = sample_pmode();
        encrypting.security.encrypt = true;
        let err = process_incoming(&provider, &encrypting, doc.clone(), attachments.clone()).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::PolicyNoncompliance);

        // No requirements, nothing to check
        assert!(process_incoming(&provider, &sample_pmode(), doc, attachments).is_ok());
    }

    #[test]
    fn test_process_incoming_tampered_signature() {
        let provider = provider();
        let pmode = signed_pmode(&provider);
        let (doc, attachments) = document();
        let (secured, attachments) = secure_outgoing(&provider, &pmode, doc, attachments).unwrap();

        let xml = secured.to_xml().replace("<note>hello</note>", "<note>hullo</note>");
        let tampered = EnvelopeDocument::parse(xml.as_bytes()).unwrap();
        let err = process_incoming(&provider, &pmode, tampered, attachments).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::FailedAuthentication);
    }

    #[test]
    fn test_certificate_helpers() {
        let cert = provider().certificate().unwrap();
        assert_eq!(cert.as_bytes().len(), 32);
        assert_eq!(Certificate::from_base64(&cert.to_base64()).unwrap(), cert);
        assert_eq!(cert.fingerprint().len(), 16);
        assert!(Certificate::from_base64("%%%").is_err());
    }
}
