//! Delivery of accepted user messages to the business application.

use crate::dump::file_name;
use crate::error::ErrorCode;
use crate::message::UserMessage;
use crate::metadata::IncomingMessageMetadata;
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

/// Failure reported by a handler; becomes an error signal to the sender.
#[derive(Debug, Error)]
#[error("{detail}")]
pub struct HandlerError {
    /// Code to report, `OTHER` when absent
    pub code: Option<ErrorCode>,
    pub detail: String,
}

impl HandlerError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            code: None,
            detail: detail.into(),
        }
    }

    pub fn with_code(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            detail: detail.into(),
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        self.code.unwrap_or(ErrorCode::Other)
    }
}

/// Downstream consumer of incoming user messages.
///
/// Called at most once per MessageId; payloads are already decrypted and
/// decompressed.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        message: &UserMessage,
        metadata: &IncomingMessageMetadata,
    ) -> Result<(), HandlerError>;
}

/// Handler writing every message into its own directory.
///
/// `<base>/<message-id>/message.json` describes the header, the body goes to
/// `body.xml` and each attachment to a file named after its Content-ID.
#[derive(Debug, Clone)]
pub struct DirectoryHandler {
    directory: PathBuf,
}

impl DirectoryHandler {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for DirectoryHandler {
    async fn handle(
        &self,
        message: &UserMessage,
        metadata: &IncomingMessageMetadata,
    ) -> Result<(), HandlerError> {
        let io_error = |e: std::io::Error| HandlerError::new(format!("Cannot store message: {}", e));
        let target = self.directory.join(file_name(&message.message_info.message_id));
        tokio::fs::create_dir_all(&target).await.map_err(io_error)?;

        let collaboration = &message.collaboration_info;
        let summary = json!({
            "message_id": message.message_info.message_id,
            "incoming_id": metadata.incoming_id,
            "pmode_id": metadata.pmode_id,
            "from": message.party_info.from.party_id.value,
            "to": message.party_info.to.party_id.value,
            "service": collaboration.service.value,
            "action": collaboration.action,
            "conversation_id": collaboration.conversation_id,
            "attachments": message.attachments.iter().map(|a| json!({
                "content_id": a.content_id,
                "mime_type": a.mime_type,
                "size": a.data.len(),
            })).collect::<Vec<_>>(),
        });
        let summary = serde_json::to_vec_pretty(&summary)
            .map_err(|e| HandlerError::new(e.to_string()))?;
        tokio::fs::write(target.join("message.json"), summary)
            .await
            .map_err(io_error)?;

        if let Some(body) = &message.body {
            tokio::fs::write(target.join("body.xml"), body)
                .await
                .map_err(io_error)?;
        }
        for attachment in &message.attachments {
            tokio::fs::write(target.join(file_name(&attachment.content_id)), &attachment.data)
                .await
                .map_err(io_error)?;
        }

        info!(
            message_id = %message.message_info.message_id,
            path = %target.display(),
            "Message delivered"
        );
        Ok(())
    }
}
