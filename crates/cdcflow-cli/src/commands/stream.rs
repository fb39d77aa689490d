use std::path::Path;

use anyhow::{Context, Result};

use cdcflow_engine::start_stream;

/// Execute the `stream` command: print each record as a JSON line until
/// Ctrl-C, then stop gracefully and print the summary.
pub async fn execute(capture_path: &Path, buffer: usize) -> Result<()> {
    let prepared = super::prepare(capture_path)?;
    let mut stream = start_stream(
        &prepared.config,
        prepared.connector.as_ref(),
        prepared.store,
        buffer,
    )?;
    let handle = stream.handle();

    let mut interrupt = std::pin::pin!(tokio::signal::ctrl_c());
    let mut stopping = false;
    loop {
        tokio::select! {
            signal = &mut interrupt, if !stopping => {
                signal.context("Failed to listen for Ctrl-C")?;
                tracing::info!("Interrupted, stopping stream");
                stopping = true;
                handle.stop();
            }
            record = stream.recv() => {
                let Some(record) = record else { break };
                println!(
                    "{}",
                    serde_json::to_string(&record).context("Failed to encode record")?
                );
            }
        }
    }

    let summary = stream.finish().await.context("Stream failed")?;
    for record in &summary.undelivered {
        println!(
            "{}",
            serde_json::to_string(record).context("Failed to encode record")?
        );
    }
    println!(
        "{}",
        serde_json::to_string(&summary).context("Failed to encode stream summary")?
    );
    Ok(())
}
