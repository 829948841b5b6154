//! Client Rotator
//!
//! Drives a batch of HTTP requests through a rotating client so rotation
//! and cleanup behavior can be observed from the logs.

use anyhow::Result;
use clap::Parser;
use client_rotator::{
    client::{Created, HttpTransport},
    config::{LogFormat, Settings},
    logging::init_tracing,
    rotation::RotationManager,
    RotationError,
};
use futures::stream::{self, StreamExt};
use std::time::Duration;

/// Client Rotator
///
/// Issues GET requests through a single rotating HTTP client.
#[derive(Parser, Debug)]
#[command(name = "client-rotator")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL to request
    #[arg(long)]
    url: String,

    /// Total number of requests to issue
    #[arg(short = 'n', long, default_value_t = 100)]
    requests: usize,

    /// Requests in flight at once
    #[arg(short, long, default_value_t = 4)]
    concurrency: usize,

    /// Requests per client before rotation (overrides ROTATION_REQUEST_LIMIT)
    #[arg(long)]
    request_limit: Option<u64>,

    /// Client lifetime in seconds (overrides ROTATION_TIME_LIMIT_SECS)
    #[arg(long)]
    time_limit_secs: Option<u64>,

    /// Retire the client when a request fails
    #[arg(long)]
    invalidate_on_error: bool,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Log level: trace, debug, info, warn, error (overrides LOG_LEVEL env var)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (overrides LOG_FORMAT env var)
    #[arg(long)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (before logging, so we can use log_level)
    let mut settings = Settings::load()?;

    // Override settings with CLI arguments
    if let Some(limit) = args.request_limit {
        settings.rotation.request_limit = limit;
    }
    if let Some(secs) = args.time_limit_secs {
        settings.rotation.time_limit = Duration::from_secs(secs);
    }
    if args.invalidate_on_error {
        settings.rotation.invalidate_on_error = true;
    }
    if let Some(log_level) = args.log_level {
        settings.log_level = log_level;
    }
    if let Some(format) = args.log_format {
        settings.log_format = format;
    }
    settings.validate()?;

    init_tracing(&settings.log_level, settings.log_format)?;

    tracing::info!(
        app_name = %settings.app_name,
        version = %settings.app_version,
        url = %args.url,
        requests = args.requests,
        concurrency = args.concurrency,
        request_limit = settings.rotation.request_limit,
        time_limit_secs = settings.rotation.time_limit.as_secs(),
        "Starting client rotator"
    );

    let timeout = Duration::from_secs(args.timeout_secs);
    let manager = RotationManager::new(
        move || async move { Ok::<_, anyhow::Error>(Created::plain(HttpTransport::new(timeout)?)) },
        settings.rotation.clone(),
    )?;

    let url = args.url.as_str();
    let results: Vec<_> = stream::iter(0..args.requests)
        .map(|seq| {
            let manager = manager.clone();
            async move {
                let result = manager
                    .with_client(|client| async move { client.get(url).await })
                    .await;
                (seq, result)
            }
        })
        .buffer_unordered(args.concurrency.max(1))
        .collect()
        .await;

    let mut succeeded = 0usize;
    let mut failed = 0usize;
    for (seq, result) in results {
        match result {
            Ok(reply) => {
                succeeded += 1;
                tracing::debug!(seq, status = reply.status, body_len = reply.body_len, "Request finished");
            }
            Err(RotationError::Operation(err)) => {
                failed += 1;
                tracing::warn!(seq, error = %err, "Request failed");
            }
            Err(err) => {
                failed += 1;
                tracing::error!(seq, error = %err, "Request could not be issued");
            }
        }
    }

    let stats = manager.stats().await;
    manager.close(false).await;

    tracing::info!(succeeded, failed, "Client rotator finished");
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}
