//! Semantic validation for parsed capture definitions.

use std::time::Duration;

use anyhow::{bail, Result};

use crate::config::types::{CaptureConfig, OneOrMany};
use crate::resolve::KNOWN_CONNECTORS;
use crate::shape::{Format, MetadataMode};

fn validate_list(list: Option<&OneOrMany>, context: &str, errors: &mut Vec<String>) {
    let Some(list) = list else {
        return;
    };
    if list.as_slice().is_empty() {
        errors.push(format!("{context} must not be an empty list"));
    }
    for entry in list.as_slice() {
        if entry.trim().is_empty() {
            errors.push(format!("{context} contains an empty entry"));
        }
    }
}

fn validate_positive(value: Duration, context: &str, errors: &mut Vec<String>) {
    if value.is_zero() {
        errors.push(format!("{context} must be greater than 0"));
    }
}

/// Validate a parsed capture definition.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the definition.
pub fn validate_capture(config: &CaptureConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported capture version '{}', expected '1.0'",
            config.version
        ));
    }

    if let Some(flow) = &config.flow {
        if flow.trim().is_empty() {
            errors.push("Flow id must not be empty when set".to_string());
        }
    }

    // Source
    let use_ref = config.source.use_ref.trim();
    if use_ref.is_empty() {
        errors.push("Source connector reference (use) must not be empty".to_string());
    } else if !KNOWN_CONNECTORS.contains(&use_ref) {
        errors.push(format!(
            "Unknown source connector '{use_ref}', expected one of: {}",
            KNOWN_CONNECTORS.join(", ")
        ));
    }
    if config.source.topic_prefix.trim().is_empty() {
        errors.push("source.topic_prefix must not be empty".to_string());
    }
    for (list, context) in [
        (&config.source.include_databases, "source.include_databases"),
        (&config.source.exclude_databases, "source.exclude_databases"),
        (&config.source.include_tables, "source.include_tables"),
        (&config.source.exclude_tables, "source.exclude_tables"),
        (&config.source.include_columns, "source.include_columns"),
        (&config.source.exclude_columns, "source.exclude_columns"),
    ] {
        validate_list(list.as_ref(), context, &mut errors);
    }
    if config.source.include_databases.is_some() && config.source.exclude_databases.is_some() {
        errors.push(
            "source.include_databases and source.exclude_databases are mutually exclusive"
                .to_string(),
        );
    }
    if config.source.include_tables.is_some() && config.source.exclude_tables.is_some() {
        errors.push(
            "source.include_tables and source.exclude_tables are mutually exclusive".to_string(),
        );
    }

    // Output
    let shape = &config.output.shape;
    if shape.deleted_field_name.trim().is_empty() {
        errors.push("output.deleted_field_name must not be empty".to_string());
    }
    if shape.metadata_field_name.trim().is_empty() {
        errors.push("output.metadata_field_name must not be empty".to_string());
    }
    if shape.format != Format::Raw
        && shape.metadata == MetadataMode::AddField
        && shape.deleted_field_name == shape.metadata_field_name
    {
        errors.push(format!(
            "output.deleted_field_name and output.metadata_field_name are both '{}'",
            shape.deleted_field_name
        ));
    }
    if shape.format == Format::Wrap
        && (shape.deleted_field_name == "record"
            || (shape.metadata == MetadataMode::AddField && shape.metadata_field_name == "record"))
    {
        errors.push("output field name 'record' is reserved by the WRAP format".to_string());
    }

    // Limits
    if config.limits.max_records == Some(0) {
        errors.push("limits.max_records must be at least 1".to_string());
    }
    if let Some(max_duration) = config.limits.max_duration {
        validate_positive(max_duration, "limits.max_duration", &mut errors);
    }
    if let Some(max_wait) = config.limits.max_wait {
        validate_positive(max_wait, "limits.max_wait", &mut errors);
    }
    validate_positive(config.limits.poll_interval, "limits.poll_interval", &mut errors);
    validate_positive(config.limits.drain_grace, "limits.drain_grace", &mut errors);

    // State
    if config.state.name.trim().is_empty() {
        errors.push("state.name must not be empty".to_string());
    }
    if config.state.store.as_os_str().is_empty() {
        errors.push("state.store must not be empty".to_string());
    }
    if let Some(ttl) = config.state.ttl {
        validate_positive(ttl, "state.ttl", &mut errors);
    }
    if config.state.hash_task_run && config.state.task_run.is_none() {
        errors.push("state.hash_task_run requires state.task_run".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Capture validation failed:\n  - {}", errors.join("\n  - "));
    }
}
