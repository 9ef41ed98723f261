//! AS4 Message Service Handler
//!
//! Sends and receives business documents as AS4 (ebMS3 over SOAP) messages:
//! user messages carrying payloads, answered by signal messages carrying
//! receipts or errors.
//!
//! # Features
//!
//! - ebMS3 message model and `eb:Messaging` header (de)serialization
//! - SOAP 1.1 and 1.2 envelopes, MIME `multipart/related` packaging
//! - Signing (Ed25519) and attachment encryption (AES-256-GCM)
//! - Outbound retry/receipt state machine over HTTP
//! - Inbound pipeline with header validation, PMode matching, duplicate
//!   detection and non-repudiation receipts
//! - Payload compression, receiver checks and message dumping
//!
//! # Example
//!
//! ```ignore
//! use as4_msh::{InboundPipeline, MshConfig};
//!
//! let config = MshConfig::from_yaml(&yaml)?;
//! let pipeline = InboundPipeline::new(config.settings, pmodes, security, dedup, handler);
//! let response = pipeline.process(content_type, &body).await;
//! ```

pub mod compression;
pub mod config;
pub mod dedup;
pub mod dump;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod inbound;
pub mod message;
pub mod metadata;
pub mod mime;
pub mod outbound;
pub mod pmode;
pub mod receiver;
pub mod security;
pub mod validator;
pub mod xml;

pub use config::{MshConfig, SoapVersion};
pub use error::{As4Error, ErrorCode};
pub use inbound::{InboundPipeline, InboundResponse};
pub use message::{As4Message, Attachment, MessageKind, UserMessage};
pub use outbound::{DeliveryState, OutboundPipeline, SendOutcome, Submission};
pub use pmode::{InMemoryPModeResolver, PMode, PModeResolver};
