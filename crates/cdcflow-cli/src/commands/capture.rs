use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use cdcflow_engine::{run_capture, LocalStorage};

const DEFAULT_OUTPUT_DIR: &str = "output";

/// Execute the `capture` command: one bounded capture, summary as JSON.
pub async fn execute(capture_path: &Path) -> Result<()> {
    let prepared = super::prepare(capture_path)?;
    let directory = prepared
        .config
        .output
        .directory
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
    let storage = LocalStorage::new(directory);

    let output = match run_capture(
        &prepared.config,
        prepared.connector.as_ref(),
        prepared.store,
        &storage,
    )
    .await
    {
        Ok(output) => output,
        Err(e) => {
            let retryable = e.is_retryable();
            return Err(e).with_context(|| {
                format!(
                    "Capture failed ({})",
                    if retryable { "retryable" } else { "not retryable" }
                )
            });
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("Failed to encode capture summary")?
    );
    Ok(())
}
