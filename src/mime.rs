//! MIME packaging.
//!
//! A message without attachments travels as the bare SOAP document. With
//! attachments it becomes a `multipart/related` entity: the envelope is the
//! root part, every attachment follows as its own part keyed by Content-ID.
//! Parts are transferred in binary; base64 encoded parts are accepted on input.

use crate::config::SoapVersion;
use crate::envelope::EnvelopeDocument;
use crate::error::As4Error;
use crate::message::{check_payload_references, Attachment, PartInfo};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use uuid::Uuid;

/// Media type of multipart entities.
pub const MULTIPART_RELATED: &str = "multipart/related";

/// Bytes ready to be sent as an HTTP request or response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmissibleEntity {
    /// Value of the Content-Type header
    pub content_type: String,
    pub body: Vec<u8>,
}

impl TransmissibleEntity {
    /// Whether this entity is a MIME multipart.
    pub fn is_multipart(&self) -> bool {
        media_type(&self.content_type) == MULTIPART_RELATED
    }
}

/// Package an envelope and its attachments.
pub fn pack(document: &EnvelopeDocument, attachments: &[Attachment]) -> TransmissibleEntity {
    let envelope = document.to_xml();
    let root_type = format!("{}; charset=UTF-8", document.version.mime_type());

    if attachments.is_empty() {
        return TransmissibleEntity {
            content_type: root_type,
            body: envelope.into_bytes(),
        };
    }

    let boundary = format!("MIMEBoundary_{}", Uuid::new_v4().simple());
    let root_id = format!("root.{}@as4-msh", Uuid::new_v4().simple());

    let mut body = Vec::with_capacity(
        envelope.len() + attachments.iter().map(|a| a.data.len() + 256).sum::<usize>() + 512,
    );
    write_part(&mut body, &boundary, &root_type, &root_id, envelope.as_bytes());
    for attachment in attachments {
        write_part(
            &mut body,
            &boundary,
            &attachment.mime_type,
            &attachment.content_id,
            &attachment.data,
        );
    }
    body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

    TransmissibleEntity {
        content_type: format!(
            r#"{}; boundary="{}"; type="{}"; start="<{}>""#,
            MULTIPART_RELATED,
            boundary,
            document.version.mime_type(),
            root_id
        ),
        body,
    }
}

fn write_part(out: &mut Vec<u8>, boundary: &str, content_type: &str, content_id: &str, data: &[u8]) {
    out.extend_from_slice(
        format!(
            "--{}\r\nContent-Type: {}\r\nContent-Transfer-Encoding: binary\r\nContent-ID: <{}>\r\n\r\n",
            boundary, content_type, content_id
        )
        .as_bytes(),
    );
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Split an entity into the envelope and its attachments.
pub fn unpack(entity: &TransmissibleEntity) -> Result<(EnvelopeDocument, Vec<Attachment>), As4Error> {
    let (root, attachments) = split_entity(&entity.content_type, &entity.body)?;
    let document = EnvelopeDocument::parse(&root)?;
    Ok((document, attachments))
}

/// Split an entity into the raw root part and the attachments.
pub fn split_entity(content_type: &str, body: &[u8]) -> Result<(Vec<u8>, Vec<Attachment>), As4Error> {
    let media = media_type(content_type);
    if media == SoapVersion::Soap12.mime_type() || media == SoapVersion::Soap11.mime_type() {
        return Ok((body.to_vec(), Vec::new()));
    }
    if media != MULTIPART_RELATED {
        return Err(As4Error::MimeInconsistency(format!(
            "Unsupported content type '{}'",
            media
        )));
    }

    let boundary = parameter(content_type, "boundary").ok_or_else(|| {
        As4Error::MimeInconsistency("multipart/related without boundary".to_string())
    })?;
    let start = parameter(content_type, "start").map(|s| strip_angle(&s).to_string());

    let mut parts = Vec::new();
    for raw in split_parts(body, &boundary)? {
        parts.push(parse_part(raw)?);
    }

    let root_index = match &start {
        Some(start) => parts
            .iter()
            .position(|p| p.content_id.as_deref() == Some(start.as_str()))
            .ok_or_else(|| {
                As4Error::MimeInconsistency(format!("Root part <{}> not found", start))
            })?,
        None if !parts.is_empty() => 0,
        None => return Err(As4Error::MimeInconsistency("Multipart has no parts".to_string())),
    };

    let root = parts.remove(root_index);
    let attachments = parts
        .into_iter()
        .map(|part| {
            let content_id = part.content_id.ok_or_else(|| {
                As4Error::MimeInconsistency("Attachment part without Content-ID".to_string())
            })?;
            Ok(Attachment {
                content_id,
                mime_type: part
                    .content_type
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                data: part.data,
            })
        })
        .collect::<Result<Vec<_>, As4Error>>()?;

    Ok((root.data, attachments))
}

/// Check the payload references of a user message against the received parts.
pub fn check_references(
    payload_info: &[PartInfo],
    has_body: bool,
    attachments: &[Attachment],
    allow_unreferenced: bool,
) -> Result<(), As4Error> {
    check_payload_references(payload_info, has_body, attachments, allow_unreferenced)
        .map_err(As4Error::MimeInconsistency)
}

struct MimePart {
    content_type: Option<String>,
    content_id: Option<String>,
    data: Vec<u8>,
}

fn split_parts<'a>(body: &'a [u8], boundary: &str) -> Result<Vec<&'a [u8]>, As4Error> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut line_delimiter = b"\n".to_vec();
    line_delimiter.extend_from_slice(&delimiter);

    let first = if body.starts_with(&delimiter) {
        0
    } else {
        find(body, &line_delimiter, 0)
            .map(|i| i + 1)
            .ok_or_else(|| As4Error::MimeInconsistency("Boundary not found".to_string()))?
    };

    let mut parts = Vec::new();
    let mut pos = first + delimiter.len();
    loop {
        if body[pos..].starts_with(b"--") {
            break;
        }
        // Rest of the boundary line
        let line_end = find(body, b"\n", pos)
            .ok_or_else(|| As4Error::MimeInconsistency("Truncated multipart".to_string()))?;
        pos = line_end + 1;

        let next = find(body, &line_delimiter, pos).ok_or_else(|| {
            As4Error::MimeInconsistency("Missing closing boundary".to_string())
        })?;
        let end = if next > pos && body[next - 1] == b'\r' {
            next - 1
        } else {
            next
        };
        parts.push(&body[pos..end]);
        pos = next + line_delimiter.len();
    }
    Ok(parts)
}

fn parse_part(raw: &[u8]) -> Result<MimePart, As4Error> {
    let mut content_type = None;
    let mut content_id = None;
    let mut encoding = None;

    let mut pos = 0;
    loop {
        let line_end = find(raw, b"\n", pos)
            .ok_or_else(|| As4Error::MimeInconsistency("Part headers not terminated".to_string()))?;
        let line = std::str::from_utf8(&raw[pos..line_end])
            .map_err(|_| As4Error::MimeInconsistency("Part header is not UTF-8".to_string()))?
            .trim_end_matches('\r');
        pos = line_end + 1;
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(As4Error::MimeInconsistency(format!("Invalid part header '{}'", line)));
        };
        let value = value.trim().to_string();
        match name.trim().to_ascii_lowercase().as_str() {
            "content-type" => content_type = Some(value),
            "content-id" => content_id = Some(strip_angle(&value).to_string()),
            "content-transfer-encoding" => encoding = Some(value.to_ascii_lowercase()),
            _ => {}
        }
    }

    let body = &raw[pos..];
    let data = match encoding.as_deref() {
        None | Some("binary") | Some("8bit") | Some("7bit") => body.to_vec(),
        Some("base64") => {
            let compact: Vec<u8> = body.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
            STANDARD
                .decode(compact)
                .map_err(|e| As4Error::MimeInconsistency(format!("Invalid base64 part: {}", e)))?
        }
        Some(other) => {
            return Err(As4Error::MimeInconsistency(format!(
                "Unsupported transfer encoding '{}'",
                other
            )))
        }
    };

    Ok(MimePart {
        content_type,
        content_id,
        data,
    })
}

/// Lower-cased media type of a Content-Type value.
pub fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Value of a Content-Type parameter, unquoted.
pub fn parameter(content_type: &str, name: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

fn strip_angle(value: &str) -> &str {
    value.trim().trim_start_matches('<').trim_end_matches('>')
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}
