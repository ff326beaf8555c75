//! Log-shipping transport: pipe newline-delimited JSON logs into it and it
//! forwards them in batches to the index server's bulk route.
//!
//! ```text
//! node app.js | log-transport
//! ```
//!
//! Batching and retry come from the `[transport]` section of `Config.toml`
//! (or the `APP__TRANSPORT_URL`, `APP__BATCH_SIZE`, … overrides). Logs of the
//! transport itself go to stderr so they never mix with piped data.

use anyhow::Context;
use tokio::io::{stdin, BufReader};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use rust_log_indexer::client::IndexClient;
use rust_log_indexer::config::Settings;
use rust_log_indexer::transport::{self, pipe_lines};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::new().context("loading configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.server.log_level));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let client = IndexClient::new(&settings.transport).context("building HTTP client")?;
    info!(
        target_url = %client.bulk_url(),
        batch_size = settings.transport.batch_size,
        flush_interval = ?settings.transport.flush_interval,
        max_retries = settings.transport.max_retries,
        "Starting log transport"
    );

    let handle = transport::spawn(client, &settings.transport);
    let piped = pipe_lines(BufReader::new(stdin()), &handle).await;

    // EOF or a failed read: ship whatever is still buffered before exiting
    let stats = handle.close().await.context("flushing transport")?;
    let piped = piped.context("reading stdin")?;
    info!(
        forwarded = piped.forwarded,
        skipped = piped.skipped,
        batches_sent = stats.batches_sent,
        records_dropped = stats.records_dropped,
        "Log transport finished"
    );
    Ok(())
}
