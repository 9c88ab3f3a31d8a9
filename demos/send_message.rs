//! Loads configuration from the environment and optionally sends one message.
//!
//! ```text
//! BOT_TOKEN=... TEST_CHAT_ID=... cargo run --example send_message -- send
//! ```

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use sendx::prelude::{ParseMode, SendMessageRequest, Sender, SenderConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

fn init_tracing(log_file: File) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stdout),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Arc::new(log_file)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = SenderConfig::from_env()?;
    config.validate()?;
    init_tracing(open_log_file(&config.log_file_path)?);
    info!(?config, "configuration loaded");

    let sender = Sender::new(config)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, cancelling");
                cancel.cancel();
            }
        });
    }

    if std::env::args().nth(1).as_deref() != Some("send") {
        info!("sender ready; pass `send` with TEST_CHAT_ID set to deliver a message");
        return Ok(());
    }

    let chat_id: i64 = std::env::var("TEST_CHAT_ID")
        .map_err(|_| "TEST_CHAT_ID must be set")?
        .trim()
        .parse()?;
    let request = SendMessageRequest::new(chat_id, "<b>sendx</b> test message")
        .parse_mode(ParseMode::Html)
        .disable_web_page_preview(true);

    match sender.send_message(&cancel, &request).await {
        Ok(message) => {
            info!(message_id = message.message_id, "message sent");
        }
        Err(send_error) => {
            error!(error = %send_error, code = send_error.code().as_str(), "message failed");
            return Err(send_error.into());
        }
    }

    let metrics = sender.metrics_snapshot();
    info!(
        attempts = metrics.attempts,
        retries = metrics.retries,
        "send finished"
    );
    Ok(())
}
