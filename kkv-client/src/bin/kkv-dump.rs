//! Stream every current value of a topic to stdout, one JSON document per line.
//!
//! Usage: `kkv-dump --config kkv.toml` (or set `KKV_CONFIG`).

use kkv_client::{init_tracing, ClientConfig, KkvClient, KkvError, TelemetryConfig};
use std::io::{self, BufWriter, Write};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), KkvError> {
    init_tracing(&TelemetryConfig::default())?;

    let config = ClientConfig::load()?;
    let client = KkvClient::from_config(config)?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut write_error: Option<io::Error> = None;

    let summary = client
        .stream_values(|value| {
            if write_error.is_some() {
                return;
            }
            if let Err(err) = serde_json::to_writer(&mut out, &value)
                .map_err(io::Error::from)
                .and_then(|()| out.write_all(b"\n"))
            {
                write_error = Some(err);
            }
        })
        .await?;

    if let Some(err) = write_error.or_else(|| out.flush().err()) {
        error!(error = %err, "Failed writing to stdout");
        return Err(KkvError::Codec {
            reason: err.to_string(),
        });
    }

    for offset in client.last_seen_offsets() {
        info!(partition = %offset.partition, offset = offset.offset, "Last seen offset");
    }
    info!(
        topic = client.topic(),
        records = summary.records,
        malformed = summary.malformed,
        "Dump complete"
    );
    Ok(())
}
