//! Message dumping.
//!
//! Every exchanged entity can be recorded for audit. Dumping is purely
//! observational: [`DumpManager`] logs failures and never returns them.

use crate::config::DumpConfig;
use crate::metadata::IncomingMessageMetadata;
use crate::mime::TransmissibleEntity;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Dump sink.
#[async_trait]
pub trait Dumper: Send + Sync {
    /// One send attempt of an outgoing message.
    async fn on_outgoing(
        &self,
        message_id: &str,
        attempt: u32,
        entity: &TransmissibleEntity,
    ) -> io::Result<()>;

    /// Raw bytes of an incoming request, before any processing.
    async fn on_incoming(&self, metadata: &IncomingMessageMetadata, raw: &[u8]) -> io::Result<()>;

    /// Final state of an incoming request.
    async fn on_incoming_end(&self, metadata: &IncomingMessageMetadata) -> io::Result<()>;
}

/// Dumper that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDumper;

#[async_trait]
impl Dumper for NoopDumper {
    async fn on_outgoing(&self, _: &str, _: u32, _: &TransmissibleEntity) -> io::Result<()> {
        Ok(())
    }

    async fn on_incoming(&self, _: &IncomingMessageMetadata, _: &[u8]) -> io::Result<()> {
        Ok(())
    }

    async fn on_incoming_end(&self, _: &IncomingMessageMetadata) -> io::Result<()> {
        Ok(())
    }
}

/// Dumper writing files below a base directory.
///
/// Layout:
/// - `outgoing/<message-id>-<attempt>.as4out`
/// - `incoming/<incoming-id>.as4in`
/// - `incoming/<incoming-id>.metadata` (JSON)
///
/// Entity files start with the `Content-Type` header line, followed by an
/// empty line and the body.
#[derive(Debug, Clone)]
pub struct FileDumper {
    directory: PathBuf,
}

impl FileDumper {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn outgoing_path(&self, message_id: &str, attempt: u32) -> PathBuf {
        self.directory
            .join("outgoing")
            .join(format!("{}-{}.as4out", file_name(message_id), attempt))
    }

    pub fn incoming_path(&self, incoming_id: &str, extension: &str) -> PathBuf {
        self.directory
            .join("incoming")
            .join(format!("{}.{}", file_name(incoming_id), extension))
    }
}

async fn write_file(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await
}

fn with_content_type(content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!("Content-Type: {}\r\n\r\n", content_type).into_bytes();
    out.extend_from_slice(body);
    out
}

/// Make a peer supplied id safe to use as a single path component.
///
/// The result never starts with a dot, so `.` and `..` cannot escape the
/// directory it is joined to.
pub(crate) fn file_name(id: &str) -> String {
    let name: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.starts_with('.') {
        format!("_{}", name)
    } else {
        name
    }
}

#[async_trait]
impl Dumper for FileDumper {
    async fn on_outgoing(
        &self,
        message_id: &str,
        attempt: u32,
        entity: &TransmissibleEntity,
    ) -> io::Result<()> {
        let path = self.outgoing_path(message_id, attempt);
        write_file(&path, &with_content_type(&entity.content_type, &entity.body)).await?;
        debug!(path = %path.display(), "Outgoing message dumped");
        Ok(())
    }

    async fn on_incoming(&self, metadata: &IncomingMessageMetadata, raw: &[u8]) -> io::Result<()> {
        let path = self.incoming_path(&metadata.incoming_id, "as4in");
        write_file(&path, &with_content_type(&metadata.content_type, raw)).await?;
        debug!(path = %path.display(), "Incoming message dumped");
        Ok(())
    }

    async fn on_incoming_end(&self, metadata: &IncomingMessageMetadata) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(metadata)?;
        write_file(&self.incoming_path(&metadata.incoming_id, "metadata"), &json).await
    }
}

/// Shared handle on the configured dumper; swallows dump failures.
#[derive(Clone)]
pub struct DumpManager {
    dumper: Arc<dyn Dumper>,
    enabled: bool,
}

impl Default for DumpManager {
    fn default() -> Self {
        Self {
            dumper: Arc::new(NoopDumper),
            enabled: false,
        }
    }
}

impl DumpManager {
    pub fn new(dumper: Arc<dyn Dumper>) -> Self {
        Self {
            dumper,
            enabled: true,
        }
    }

    /// Whether a real dumper is installed.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Dumper selected by configuration.
    pub fn from_config(config: &DumpConfig) -> Self {
        match (&config.enabled, &config.directory) {
            (true, Some(directory)) => Self::new(Arc::new(FileDumper::new(directory.clone()))),
            (true, None) => {
                warn!("Dumping enabled without a directory, nothing will be dumped");
                Self::default()
            }
            _ => Self::default(),
        }
    }

    pub async fn outgoing(&self, message_id: &str, attempt: u32, entity: &TransmissibleEntity) {
        if let Err(e) = self.dumper.on_outgoing(message_id, attempt, entity).await {
            warn!(message_id = %message_id, attempt, error = %e, "Failed to dump outgoing message");
        }
    }

    pub async fn incoming(&self, metadata: &IncomingMessageMetadata, raw: &[u8]) {
        if let Err(e) = self.dumper.on_incoming(metadata, raw).await {
            warn!(incoming_id = %metadata.incoming_id, error = %e, "Failed to dump incoming message");
        }
    }

    pub async fn incoming_end(&self, metadata: &IncomingMessageMetadata) {
        if let Err(e) = self.dumper.on_incoming_end(metadata).await {
            warn!(incoming_id = %metadata.incoming_id, error = %e, "Failed to dump incoming metadata");
        }
    }
}

impl std::fmt::Debug for DumpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DumpManager")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::IncomingState;

    fn entity() -> TransmissibleEntity {
        TransmissibleEntity {
            content_type: "application/soap+xml".to_string(),
            body: b"<Envelope/>".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_file_dumper_layout() {
        let dir = tempfile::tempdir().unwrap();
        let dumper = FileDumper::new(dir.path());

        dumper.on_outgoing("m1@as4", 2, &entity()).await.unwrap();
        let written = std::fs::read(dir.path().join("outgoing/m1@as4-2.as4out")).unwrap();
        assert_eq!(written, b"Content-Type: application/soap+xml\r\n\r\n<Envelope/>");

        let mut metadata = IncomingMessageMetadata::new("text/xml");
        dumper.on_incoming(&metadata, b"<raw/>").await.unwrap();
        metadata.state = IncomingState::Accepted;
        dumper.on_incoming_end(&metadata).await.unwrap();

        let raw = std::fs::read(dumper.incoming_path(&metadata.incoming_id, "as4in")).unwrap();
        assert!(raw.ends_with(b"<raw/>"));
        let json = std::fs::read_to_string(dumper.incoming_path(&metadata.incoming_id, "metadata"))
            .unwrap();
        assert!(json.contains("\"ACCEPTED\""));
    }

    #[test]
    fn test_file_name_sanitizing() {
        assert_eq!(file_name("a/b\\c:d@e.f"), "a_b_c_d@e.f");
    }

    #[test]
    fn test_file_name_stays_in_directory() {
        assert_eq!(file_name(".."), "_..");
        assert_eq!(file_name("."), "_.");
        assert_eq!(file_name(""), "_");
        assert_eq!(file_name(".hidden"), "_.hidden");
        assert_eq!(file_name("../../etc/passwd"), "_.._.._etc_passwd");

        let base = Path::new("/srv/inbox");
        for id in ["..", ".", "", "../x"] {
            let joined = base.join(file_name(id));
            assert_eq!(joined.parent(), Some(base));
            assert!(joined
                .components()
                .all(|c| !matches!(c, std::path::Component::ParentDir | std::path::Component::CurDir)));
        }
    }

    #[tokio::test]
    async fn test_manager_swallows_errors() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the dump directory should be
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"x").unwrap();

        let dumper = FileDumper::new(&blocker);
        let metadata = IncomingMessageMetadata::new("text/xml");
        assert!(dumper.on_outgoing("m1", 1, &entity()).await.is_err());
        assert!(dumper.on_incoming(&metadata, b"x").await.is_err());

        let manager = DumpManager::new(Arc::new(dumper));
        manager.outgoing("m1", 1, &entity()).await;
        manager.incoming(&metadata, b"x").await;
        manager.incoming_end(&metadata).await;

        assert!(manager.is_enabled());
        assert_eq!(std::fs::read(&blocker).unwrap(), b"x");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_from_config() {
        let without_directory = DumpManager::from_config(&DumpConfig {
            enabled: true,
            directory: None,
        });
        assert!(!without_directory.is_enabled());
        assert!(!DumpManager::from_config(&DumpConfig::default()).is_enabled());

        let dir = tempfile::tempdir().unwrap();
        let manager = DumpManager::from_config(&DumpConfig {
            enabled: true,
            directory: Some(dir.path().to_path_buf()),
        });
        assert!(manager.is_enabled());
        manager.outgoing("m1", 1, &entity()).await;
        assert!(dir.path().join("outgoing/m1-1.as4out").exists());
    }
}
