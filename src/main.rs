//! AS4 MSH command line.
//!
//! Run with: `as4-msh --config msh.yaml send --pmode invoice --payload invoice.xml`

use anyhow::{bail, Context, Result};
use as4_msh::dedup::InMemoryMessageIdStore;
use as4_msh::dump::DumpManager;
use as4_msh::handler::DirectoryHandler;
use as4_msh::inbound::InboundPipeline;
use as4_msh::message::Attachment;
use as4_msh::outbound::{HttpTransport, OutboundPipeline, Submission};
use as4_msh::pmode::InMemoryPModeResolver;
use as4_msh::receiver::ReceiverCheck;
use as4_msh::security::{Ed25519SecurityProvider, SecurityProvider};
use as4_msh::MshConfig;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// AS4 message service handler.
///
/// Sends a payload to a partner under a PMode, or processes a received
/// AS4 request and writes the synchronous reply.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long, default_value = "msh.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a payload as a user message
    Send {
        /// PMode id
        #[arg(long)]
        pmode: String,

        /// Payload file, sent as an attachment named after the file
        #[arg(long)]
        payload: PathBuf,

        /// MIME type of the payload
        #[arg(long, default_value = "application/xml")]
        mime_type: String,

        /// Conversation id (generated when absent)
        #[arg(long)]
        conversation_id: Option<String>,

        /// Action overriding the PMode action
        #[arg(long)]
        action: Option<String>,
    },

    /// Process a received request
    ///
    /// Duplicate detection only covers the requests of one invocation: the
    /// message id store is held in memory and starts empty on every run.
    Receive {
        /// Raw request body
        #[arg(long)]
        input: PathBuf,

        /// Content-Type header of the request
        #[arg(long)]
        content_type: String,

        /// Where to write the reply (stdout when absent)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Directory receiving accepted messages
        #[arg(long, default_value = "inbox")]
        deliver_to: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = args.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting AS4 MSH v{}", env!("CARGO_PKG_VERSION"));
    info!("Config file: {}", args.config.display());

    let config = load_config(&args.config).await?;

    let security = Arc::new(
        Ed25519SecurityProvider::from_config(&config.security)
            .context("Invalid security keys")?,
    );
    let pmodes = Arc::new(InMemoryPModeResolver::new(config.pmodes.clone()));
    let dump = DumpManager::from_config(&config.dump);
    // Refuses to start when the own certificate is not trusted
    let receiver_check = ReceiverCheck::from_config(&config, security.certificate())
        .context("Receiver check cannot be initialized")?;

    info!(
        pmodes = config.pmodes.len(),
        dump = dump.is_enabled(),
        receiver_check = receiver_check.is_some(),
        "Configuration loaded"
    );

    match args.command {
        Command::Send {
            pmode,
            payload,
            mime_type,
            conversation_id,
            action,
        } => {
            let data = tokio::fs::read(&payload)
                .await
                .with_context(|| format!("Failed to read payload {}", payload.display()))?;
            let content_id = payload
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "payload".to_string());

            let timeout = Duration::from_millis(config.settings.http_timeout_ms);
            let transport =
                Arc::new(HttpTransport::new(timeout).context("Failed to create HTTP client")?);
            let pipeline = Arc::new(
                OutboundPipeline::new(pmodes, security, transport)
                    .with_dump_manager(dump)
                    .with_attempt_timeout(timeout),
            );

            let submission = Submission {
                pmode_id: pmode,
                conversation_id,
                action,
                attachments: vec![Attachment::new(content_id, mime_type, data)],
                ..Default::default()
            };
            let outcome = pipeline
                .submit(submission)
                .await
                .context("Send task failed")?
                .context("Message could not be sent")?;

            info!(
                message_id = %outcome.message_id,
                state = ?outcome.state,
                attempts = outcome.attempts,
                "Send finished"
            );
            if !outcome.is_delivered() {
                bail!(
                    "Message {} not delivered: {:?} {}",
                    outcome.message_id,
                    outcome.errors,
                    outcome.detail.unwrap_or_default()
                );
            }
        }

        Command::Receive {
            input,
            content_type,
            output,
            deliver_to,
        } => {
            let body = tokio::fs::read(&input)
                .await
                .with_context(|| format!("Failed to read request {}", input.display()))?;

            let mut pipeline = InboundPipeline::new(
                config.settings.clone(),
                pmodes,
                security,
                Arc::new(InMemoryMessageIdStore::with_retention(
                    config.settings.duplicate_retention(),
                )),
                Arc::new(DirectoryHandler::new(deliver_to)),
            )
            .with_dump_manager(dump);
            if let Some(check) = receiver_check {
                pipeline = pipeline.with_receiver_check(check);
            }

            let response = pipeline.process(&content_type, &body).await;
            info!(
                incoming_id = %response.metadata.incoming_id,
                state = ?response.metadata.state,
                status = response.status,
                content_type = %response.content_type,
                "Request processed"
            );

            match output {
                Some(path) => tokio::fs::write(&path, &response.body)
                    .await
                    .with_context(|| format!("Failed to write reply {}", path.display()))?,
                None => println!("{}", String::from_utf8_lossy(&response.body)),
            }
        }
    }

    Ok(())
}

async fn load_config(path: &Path) -> Result<MshConfig> {
    if !path.exists() {
        info!("Config file not found, using defaults");
        return Ok(MshConfig::default());
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .context("Failed to read config file")?;
    MshConfig::from_yaml(&content).context("Failed to parse config file")
}
