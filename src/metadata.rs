//! Metadata of one incoming request.

use crate::error::ErrorCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Processing state of an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncomingState {
    Received,
    Accepted,
    Duplicate,
    Rejected,
}

/// What is known about an incoming request, filled in as processing goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessageMetadata {
    /// Id of this request (not the ebMS MessageId)
    pub incoming_id: String,
    pub received_at: DateTime<Utc>,
    pub content_type: String,
    /// Wire MessageId, once parsed
    pub message_id: Option<String>,
    /// Governing PMode, once resolved
    pub pmode_id: Option<String>,
    pub state: IncomingState,
    /// Error codes sent back to the peer
    pub errors: Vec<ErrorCode>,
}

impl IncomingMessageMetadata {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            incoming_id: Uuid::new_v4().to_string(),
            received_at: Utc::now(),
            content_type: content_type.into(),
            message_id: None,
            pmode_id: None,
            state: IncomingState::Received,
            errors: Vec::new(),
        }
    }

    /// Mark as rejected with the given error codes.
    pub fn reject(&mut self, codes: impl IntoIterator<Item = ErrorCode>) {
        self.state = IncomingState::Rejected;
        self.errors.extend(codes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_json() {
        let mut metadata = IncomingMessageMetadata::new("application/soap+xml");
        metadata.message_id = Some("m1@as4".to_string());
        metadata.reject([ErrorCode::MimeInconsistency]);

        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["state"], "REJECTED");
        assert_eq!(json["errors"][0], "MIME_INCONSISTENCY");
        assert_eq!(json["message_id"], "m1@as4");

        let parsed: IncomingMessageMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, metadata);
    }
}
