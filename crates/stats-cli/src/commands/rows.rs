//! Listing of matching keystroke batches as JSON lines.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone};
use serde::Serialize;
use stats_core::{FilterSpec, KeystrokeBatch, PayloadDecryptor, QueryArgs, decrypt_text};
use stats_db::{Database, FilterPipeline};

#[derive(Serialize)]
struct RowLine<'a> {
    #[serde(flatten)]
    batch: &'a KeystrokeBatch,
    duration_secs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

pub fn run<W, D, Tz>(
    writer: &mut W,
    db: &Database,
    args: &QueryArgs,
    show_text: bool,
    decryptor: &D,
    now: &DateTime<Tz>,
) -> Result<()>
where
    W: Write,
    D: PayloadDecryptor,
    Tz: TimeZone,
{
    let spec = FilterSpec::from_args(args, now).context("invalid filter options")?;
    let pipeline = FilterPipeline::prepare(db, &spec).context("failed to resolve entity filters")?;
    let mut cursor = pipeline
        .keystrokes()
        .context("failed to query keystroke batches")?;

    let mut count = 0_usize;
    for batch in cursor.stream(spec.body(), decryptor)? {
        let batch = batch.context("failed to read keystroke batch")?;
        let text = if show_text {
            Some(decrypt_text(
                decryptor,
                batch.id,
                batch.encrypted_text.as_deref(),
            )?)
        } else {
            None
        };
        serde_json::to_writer(&mut *writer, &RowLine {
            batch: &batch,
            duration_secs: batch.duration().num_seconds(),
            text,
        })?;
        writeln!(writer)?;
        count += 1;
    }

    tracing::info!(rows = count, "listed keystroke batches");
    Ok(())
}
