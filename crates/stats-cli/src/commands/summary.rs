//! Aggregated activity summary as one JSON document.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use stats_core::{
    AggregationEngine, AggregationOptions, FilterSpec, PayloadDecryptor, QueryArgs, Summary,
    shared_cutoff,
};
use stats_db::{Database, DbError, FilterPipeline, QueryError};

use crate::cli::ReportArgs;
use crate::config::Config;

/// Serialized summary. The header counters are always present; sections
/// that were not requested are left out.
#[derive(Debug, Serialize)]
pub struct SummaryReport<'a> {
    pub keystroke_batches: u64,
    pub keystrokes: u64,
    pub clicks: u64,
    pub noscroll_clicks: u64,
    pub mousings: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub periods: Option<Vec<PeriodEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_activity: Option<Vec<NamedSeconds<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_activity: Option<Vec<NamedSeconds<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratios: Option<RatioEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buttons: Option<Vec<NamedCount<'static>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_frequencies: Option<Vec<NamedCount<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_keystrokes: Option<Vec<NamedCount<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_keystrokes: Option<Vec<NamedCount<'a>>>,
}

#[derive(Debug, Serialize)]
pub struct PeriodEntry {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub seconds: i64,
}

#[derive(Debug, Serialize)]
pub struct NamedSeconds<'a> {
    pub name: &'a str,
    pub seconds: i64,
}

#[derive(Debug, Serialize)]
pub struct NamedCount<'a> {
    pub name: &'a str,
    pub count: u64,
}

/// Ratios rounded to two decimals.
#[derive(Debug, Serialize)]
pub struct RatioEntry {
    pub keys_per_click: f64,
    pub active_seconds_per_key: f64,
    pub mousings_per_key: f64,
    pub mousings_per_click: f64,
}

impl<'a> SummaryReport<'a> {
    pub fn new(summary: &'a Summary, reports: &ReportArgs) -> Self {
        let global = &summary.global;
        Self {
            keystroke_batches: global.nr,
            keystrokes: global.keystrokes,
            clicks: global.clicks,
            noscroll_clicks: global.noscroll_clicks,
            mousings: global.mousings,
            active_seconds: reports
                .active
                .map(|_| summary.active_time().num_seconds()),
            periods: reports.periods.map(|_| {
                summary
                    .periods()
                    .iter()
                    .map(|period| PeriodEntry {
                        start: period.start,
                        end: period.end,
                        seconds: period.duration().num_seconds(),
                    })
                    .collect()
            }),
            process_activity: reports
                .pactive
                .map(|_| named_seconds(summary.processes_by_activity())),
            window_activity: reports
                .tactive
                .map(|_| named_seconds(summary.windows_by_activity())),
            ratios: reports.ratios.map(|_| {
                let ratios = summary.ratios();
                RatioEntry {
                    keys_per_click: round2(ratios.keys_per_click),
                    active_seconds_per_key: round2(ratios.active_seconds_per_key),
                    mousings_per_key: round2(ratios.mousings_per_key),
                    mousings_per_click: round2(ratios.mousings_per_click),
                }
            }),
            buttons: reports
                .clicks
                .then(|| named_counts(summary.named_button_counts())),
            key_frequencies: reports
                .key_freqs
                .then(|| named_counts(summary.key_frequencies_sorted())),
            process_keystrokes: reports
                .pkeys
                .then(|| named_counts(summary.processes_by_keystrokes())),
            window_keystrokes: reports
                .tkeys
                .then(|| named_counts(summary.windows_by_keystrokes())),
        }
    }
}

fn named_seconds(rows: Vec<(&str, Duration)>) -> Vec<NamedSeconds<'_>> {
    rows.into_iter()
        .map(|(name, active)| NamedSeconds {
            name,
            seconds: active.num_seconds(),
        })
        .collect()
}

fn named_counts(rows: Vec<(&str, u64)>) -> Vec<NamedCount<'_>> {
    rows.into_iter()
        .map(|(name, count)| NamedCount { name, count })
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Reads every matching row into an [`AggregationEngine`].
pub fn aggregate<D, Tz>(
    db: &Database,
    config: &Config,
    args: &QueryArgs,
    reports: &ReportArgs,
    decryptor: &D,
    now: &DateTime<Tz>,
) -> Result<Summary>
where
    D: PayloadDecryptor,
    Tz: TimeZone,
{
    let spec = FilterSpec::from_args(args, now).context("invalid filter options")?;
    let activity_cutoff = shared_cutoff(reports.cutoffs(config.active_cutoff_secs))
        .context("invalid activity options")?;

    let mut options = AggregationOptions::new(now.with_timezone(&Utc));
    options.activity_cutoff = activity_cutoff;
    options.per_process = reports.pkeys || reports.pactive.is_some();
    options.per_window = reports.tkeys || reports.tactive.is_some();
    options.key_frequencies = reports.key_freqs;

    let pipeline = FilterPipeline::prepare(db, &spec).context("failed to resolve entity filters")?;
    if pipeline.is_exhausted() {
        tracing::info!("no process or window matches the filters");
    }

    let mut engine = AggregationEngine::new(options, decryptor);

    let mut keystrokes = pipeline
        .keystrokes()
        .context("failed to query keystroke batches")?;
    let batches = engine
        .consume_keystrokes::<_, QueryError>(keystrokes.stream(spec.body(), decryptor)?)
        .context("failed to aggregate keystroke batches")?;

    let mut pointer = pipeline
        .pointer_actions()
        .context("failed to query pointer actions")?;
    let actions = engine
        .consume_pointer_actions::<_, DbError>(pointer.rows()?)
        .context("failed to aggregate pointer actions")?;

    tracing::info!(batches, actions, "aggregated activity");
    Ok(engine.finish())
}

pub fn run<W, D, Tz>(
    writer: &mut W,
    db: &Database,
    config: &Config,
    args: &QueryArgs,
    reports: &ReportArgs,
    decryptor: &D,
    now: &DateTime<Tz>,
) -> Result<()>
where
    W: Write,
    D: PayloadDecryptor,
    Tz: TimeZone,
{
    let summary = aggregate(db, config, args, reports, decryptor, now)?;
    let report = SummaryReport::new(&summary, reports);
    serde_json::to_writer_pretty(&mut *writer, &report)?;
    writeln!(writer)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use insta::assert_snapshot;
    use stats_core::Plaintext;

    use crate::commands::fixtures::{activity_db, ts};

    fn config() -> Config {
        Config {
            database_path: "unused.db".into(),
            active_cutoff_secs: 180,
        }
    }

    fn summarize(args: &QueryArgs, reports: &ReportArgs) -> Result<String> {
        let db = activity_db();
        let mut output = Vec::new();
        run(&mut output, &db, &config(), args, reports, &Plaintext, &ts(2000))?;
        Ok(String::from_utf8(output)?)
    }

    #[test]
    fn summary_command_outputs_requested_sections() {
        let reports = ReportArgs {
            active: Some(None),
            periods: Some(None),
            pactive: Some(None),
            ratios: Some(None),
            clicks: true,
            key_freqs: true,
            pkeys: true,
            ..ReportArgs::default()
        };
        assert_snapshot!(summarize(&QueryArgs::default(), &reports).unwrap());
    }

    #[test]
    fn summary_command_counts_only_by_default() {
        let output = summarize(&QueryArgs::default(), &ReportArgs::default()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "keystroke_batches": 3,
                "keystrokes": 9,
                "clicks": 3,
                "noscroll_clicks": 2,
                "mousings": 15
            })
        );
    }

    #[test]
    fn summary_command_uses_configured_cutoff() {
        let db = activity_db();
        let reports = ReportArgs {
            active: Some(None),
            ..ReportArgs::default()
        };
        let config = Config {
            active_cutoff_secs: 1,
            ..config()
        };
        let summary = aggregate(
            &db,
            &config,
            &QueryArgs::default(),
            &reports,
            &Plaintext,
            &ts(2000),
        )
        .unwrap();

        // Keystrokes at 58-60, 118-120, 997-1000 and clicks at 30, 90, 125,
        // each extended by one second.
        assert_eq!(summary.active_time(), Duration::seconds(3 + 2 + 1 + 1 + 1 + 4));
    }

    #[test]
    fn summary_command_rejects_conflicting_cutoffs() {
        let reports = ReportArgs {
            active: Some(Some(60)),
            periods: Some(Some(120)),
            ..ReportArgs::default()
        };
        let err = summarize(&QueryArgs::default(), &reports).unwrap_err();
        assert!(format!("{err:#}").contains("invalid activity options"));
    }

    #[test]
    fn summary_command_rejects_negative_cutoff() {
        let reports = ReportArgs {
            active: Some(Some(-30)),
            periods: Some(Some(-30)),
            ..ReportArgs::default()
        };
        let err = summarize(&QueryArgs::default(), &reports).unwrap_err();
        assert_eq!(
            format!("{err:#}"),
            "invalid activity options: --active is out of range: -30"
        );
    }

    #[test]
    fn summary_command_rejects_unrepresentable_cutoff() {
        let reports = ReportArgs {
            active: Some(Some(99_999_999_999_999_999)),
            ..ReportArgs::default()
        };
        let err = summarize(&QueryArgs::default(), &reports).unwrap_err();
        assert!(format!("{err:#}").contains("--active is out of range"));
    }

    #[test]
    fn summary_command_counts_clicks_without_click_section() {
        let reports = ReportArgs {
            pkeys: true,
            ..ReportArgs::default()
        };
        let output = summarize(&QueryArgs::default(), &reports).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();

        assert_eq!(value["clicks"], 3);
        assert_eq!(value["noscroll_clicks"], 2);
        assert_eq!(value["mousings"], 15);
        assert!(value.get("buttons").is_none());
    }

    #[test]
    fn summary_command_handles_unmatched_process() {
        let args = QueryArgs {
            process: Some("zsh".to_string()),
            ..QueryArgs::default()
        };
        let reports = ReportArgs {
            active: Some(None),
            pkeys: true,
            ..ReportArgs::default()
        };
        let output = summarize(&args, &reports).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "keystroke_batches": 0,
                "keystrokes": 0,
                "clicks": 0,
                "noscroll_clicks": 0,
                "mousings": 0,
                "active_seconds": 0,
                "process_keystrokes": []
            })
        );
    }

    #[test]
    fn summary_command_scopes_activity_to_time_bound() {
        let args = QueryArgs {
            back: Some("1005s".to_string()),
            ..QueryArgs::default()
        };
        let reports = ReportArgs {
            tactive: Some(Some(10)),
            ..ReportArgs::default()
        };
        let output = summarize(&args, &reports).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();

        // Only the last batch (997-1000) starts after 995s; every click is
        // older.
        assert_eq!(value["keystroke_batches"], 1);
        assert_eq!(
            value["window_activity"],
            serde_json::json!([{ "name": "cargo build", "seconds": 13 }])
        );
    }
}
