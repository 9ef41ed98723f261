//! AS4 payload compression.
//!
//! Compressed attachments keep their original MIME type in the `MimeType`
//! part property and are announced with a `CompressionType` part property;
//! the MIME part itself is sent as `application/gzip`.

use crate::error::As4Error;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Supported compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionType {
    Gzip,
}

impl CompressionType {
    /// MIME type used on the wire and in the `CompressionType` property.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Gzip => "application/gzip",
        }
    }

    pub fn from_mime_type(value: &str) -> Option<Self> {
        match value.trim() {
            "application/gzip" | "application/x-gzip" => Some(Self::Gzip),
            _ => None,
        }
    }

    /// Compress a payload.
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, As4Error> {
        match self {
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(data)
                    .map_err(|e| As4Error::Compression(e.to_string()))?;
                encoder
                    .finish()
                    .map_err(|e| As4Error::Compression(e.to_string()))
            }
        }
    }

    /// Decompress a payload, refusing output larger than `limit` bytes.
    pub fn decompress(&self, data: &[u8], limit: u64) -> Result<Vec<u8>, As4Error> {
        match self {
            Self::Gzip => {
                let mut out = Vec::new();
                GzDecoder::new(data)
                    .take(limit.saturating_add(1))
                    .read_to_end(&mut out)
                    .map_err(|e| As4Error::Compression(format!("Invalid gzip data: {}", e)))?;
                if out.len() as u64 > limit {
                    return Err(As4Error::Compression(format!(
                        "Decompressed payload exceeds {} bytes",
                        limit
                    )));
                }
                Ok(out)
            }
        }
    }
}
