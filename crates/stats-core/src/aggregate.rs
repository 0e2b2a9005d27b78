//! Activity aggregation.
//!
//! An [`AggregationEngine`] is built once per query. It owns a [`Summary`]
//! with three kinds of scope: the global one, one per process name and one
//! per window title. Per-entity scopes are created on their first
//! contribution and are never removed during a run.
//!
//! Counters are plain sums, so rows may arrive in any order. Activity
//! intervals go through [`IntervalMerger`], which is order independent too.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::event::{Button, KeystrokeBatch, PointerAction};
use crate::filter::FilterError;
use crate::payload::{PayloadDecryptor, PayloadError, decrypt_keys};
use crate::period::{IntervalMerger, TimeInterval};

/// Idle cutoff used when an activity report does not name one.
pub const DEFAULT_ACTIVE_SECONDS: i64 = 180;

/// What the engine should track for one run.
#[derive(Debug, Clone)]
pub struct AggregationOptions {
    /// Track active intervals with this idle cutoff.
    pub activity_cutoff: Option<Duration>,
    /// Ceiling for inferred activity, usually the query time.
    pub max_time: DateTime<Utc>,
    /// Keep a scope per process name.
    pub per_process: bool,
    /// Keep a scope per window title.
    pub per_window: bool,
    /// Count individual keys (requires decrypting key payloads).
    pub key_frequencies: bool,
}

impl AggregationOptions {
    /// Counters for the global scope only.
    pub const fn new(max_time: DateTime<Utc>) -> Self {
        Self {
            activity_cutoff: None,
            max_time,
            per_process: false,
            per_window: false,
            key_frequencies: false,
        }
    }
}

/// Picks the idle cutoff shared by several activity reports.
///
/// Each report may carry its own cutoff in seconds; they must all agree
/// and be a non-negative, representable duration. Returns `None` when no
/// activity report was requested.
pub fn shared_cutoff<I>(cutoffs: I) -> Result<Option<Duration>, FilterError>
where
    I: IntoIterator<Item = i64>,
{
    let mut chosen: Option<i64> = None;
    for seconds in cutoffs {
        match chosen {
            None => chosen = Some(seconds),
            Some(first) if first != seconds => {
                return Err(FilterError::ConflictingCutoffs {
                    first,
                    second: seconds,
                });
            }
            Some(_) => {}
        }
    }
    let Some(seconds) = chosen else {
        return Ok(None);
    };
    let out_of_range = || FilterError::OutOfRange {
        flag: "active",
        value: seconds.to_string(),
    };
    if seconds < 0 {
        return Err(out_of_range());
    }
    Duration::try_seconds(seconds).map(Some).ok_or_else(out_of_range)
}

/// Counters and optional activity intervals for one scope.
#[derive(Debug, Clone, Default)]
pub struct SummaryScope {
    /// Keystroke batches seen.
    pub nr: u64,
    pub keystrokes: u64,
    pub clicks: u64,
    /// Clicks that were not scroll wheel steps.
    pub noscroll_clicks: u64,
    /// Pointer movements.
    pub mousings: u64,
    pub buttons: BTreeMap<Button, u64>,
    activity: Option<IntervalMerger>,
}

impl SummaryScope {
    /// Looks a counter up by name: `nr`, `keystrokes`, `clicks`,
    /// `noscroll_clicks`, `mousings` or `button<N>`.
    pub fn counter(&self, name: &str) -> Option<u64> {
        match name {
            "nr" => Some(self.nr),
            "keystrokes" => Some(self.keystrokes),
            "clicks" => Some(self.clicks),
            "noscroll_clicks" => Some(self.noscroll_clicks),
            "mousings" => Some(self.mousings),
            _ => {
                let button: u8 = name.strip_prefix("button")?.parse().ok()?;
                Some(self.button(Button(button)))
            }
        }
    }

    /// Clicks recorded for `button`.
    pub fn button(&self, button: Button) -> u64 {
        self.buttons.get(&button).copied().unwrap_or(0)
    }

    /// Active intervals, when activity tracking was requested.
    pub const fn activity(&self) -> Option<&IntervalMerger> {
        self.activity.as_ref()
    }

    /// Total active time; zero when nothing was tracked.
    pub fn active_time(&self) -> Duration {
        self.activity
            .as_ref()
            .map_or_else(Duration::zero, IntervalMerger::calc_total)
    }
}

/// Derived ratios between the global counters.
///
/// Denominators are floored at one so empty runs divide cleanly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ratios {
    pub keys_per_click: f64,
    pub active_seconds_per_key: f64,
    pub mousings_per_key: f64,
    pub mousings_per_click: f64,
}

/// Result of one aggregation run.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub global: SummaryScope,
    pub processes: BTreeMap<String, SummaryScope>,
    pub windows: BTreeMap<String, SummaryScope>,
    pub key_frequencies: BTreeMap<String, u64>,
}

impl Summary {
    /// Global active time.
    pub fn active_time(&self) -> Duration {
        self.global.active_time()
    }

    /// Global active intervals, ascending.
    pub fn periods(&self) -> &[TimeInterval] {
        match self.global.activity() {
            Some(merger) => merger.intervals(),
            None => &[],
        }
    }

    /// Click counts for the conventionally named buttons, in button order.
    pub fn named_button_counts(&self) -> Vec<(&'static str, u64)> {
        Button::NAMED
            .iter()
            .filter_map(|&button| Some((button.name()?, self.global.button(button))))
            .collect()
    }

    /// Keys ordered by how often they were pressed, most common first.
    pub fn key_frequencies_sorted(&self) -> Vec<(&str, u64)> {
        let mut keys: Vec<(&str, u64)> = self
            .key_frequencies
            .iter()
            .map(|(key, &count)| (key.as_str(), count))
            .collect();
        keys.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        keys
    }

    /// Processes ordered by keystrokes, highest first.
    pub fn processes_by_keystrokes(&self) -> Vec<(&str, u64)> {
        by_keystrokes(&self.processes)
    }

    /// Window titles ordered by keystrokes, highest first.
    pub fn windows_by_keystrokes(&self) -> Vec<(&str, u64)> {
        by_keystrokes(&self.windows)
    }

    /// Processes ordered by active time, highest first.
    pub fn processes_by_activity(&self) -> Vec<(&str, Duration)> {
        by_activity(&self.processes)
    }

    /// Window titles ordered by active time, highest first.
    pub fn windows_by_activity(&self) -> Vec<(&str, Duration)> {
        by_activity(&self.windows)
    }

    #[expect(
        clippy::cast_precision_loss,
        reason = "counts stay far below 2^52"
    )]
    pub fn ratios(&self) -> Ratios {
        let floor = |value: u64| value.max(1) as f64;
        let keys = floor(self.global.keystrokes);
        let clicks = floor(self.global.clicks);
        let mousings = floor(self.global.mousings);
        let active = self.active_time().num_seconds() as f64;

        Ratios {
            keys_per_click: keys / clicks,
            active_seconds_per_key: active / keys,
            mousings_per_key: mousings / keys,
            mousings_per_click: mousings / clicks,
        }
    }
}

fn by_keystrokes(scopes: &BTreeMap<String, SummaryScope>) -> Vec<(&str, u64)> {
    let mut rows: Vec<(&str, u64)> = scopes
        .iter()
        .map(|(name, scope)| (name.as_str(), scope.keystrokes))
        .collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1));
    rows
}

fn by_activity(scopes: &BTreeMap<String, SummaryScope>) -> Vec<(&str, Duration)> {
    let mut rows: Vec<(&str, Duration)> = scopes
        .iter()
        .map(|(name, scope)| (name.as_str(), scope.active_time()))
        .collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1));
    rows
}

/// Drives filtered rows into a [`Summary`].
pub struct AggregationEngine<D> {
    options: AggregationOptions,
    decryptor: D,
    summary: Summary,
}

impl<D: PayloadDecryptor> AggregationEngine<D> {
    /// Creates an engine for one run. `decryptor` is only used for key
    /// frequencies.
    pub fn new(options: AggregationOptions, decryptor: D) -> Self {
        Self {
            options,
            decryptor,
            summary: Summary::default(),
        }
    }

    /// Adds one keystroke batch.
    pub fn add_keystrokes(&mut self, batch: &KeystrokeBatch) -> Result<(), PayloadError> {
        let timestamps = if self.options.activity_cutoff.is_some() {
            batch.activity_timestamps()
        } else {
            Vec::new()
        };

        self.contribute(
            &batch.process.name,
            &batch.window.title,
            &timestamps,
            |scope| {
                scope.nr += 1;
                scope.keystrokes += u64::from(batch.key_count);
            },
        );

        if self.options.key_frequencies {
            let keys = decrypt_keys(&self.decryptor, batch.id, batch.encrypted_keys.as_deref())?;
            for key in keys {
                *self.summary.key_frequencies.entry(key).or_insert(0) += 1;
            }
        }
        Ok(())
    }

    /// Adds one pointer action.
    pub fn add_pointer_action(&mut self, action: &PointerAction) {
        let timestamps = if self.options.activity_cutoff.is_some() {
            vec![action.created_at]
        } else {
            Vec::new()
        };

        self.contribute(
            &action.process.name,
            &action.window.title,
            &timestamps,
            |scope| {
                scope.clicks += 1;
                *scope.buttons.entry(action.button).or_insert(0) += 1;
                if !action.button.is_scroll() {
                    scope.noscroll_clicks += 1;
                }
                scope.mousings += u64::from(action.move_count);
            },
        );
    }

    /// Pulls every batch from `rows`, stopping at the first error.
    ///
    /// Returns the number of batches added.
    pub fn consume_keystrokes<I, E>(&mut self, rows: I) -> Result<usize, E>
    where
        I: IntoIterator<Item = Result<KeystrokeBatch, E>>,
        E: From<PayloadError>,
    {
        let mut count = 0;
        for row in rows {
            self.add_keystrokes(&row?)?;
            count += 1;
        }
        Ok(count)
    }

    /// Pulls every action from `rows`, stopping at the first error.
    ///
    /// Returns the number of actions added.
    pub fn consume_pointer_actions<I, E>(&mut self, rows: I) -> Result<usize, E>
    where
        I: IntoIterator<Item = Result<PointerAction, E>>,
    {
        let mut count = 0;
        for row in rows {
            self.add_pointer_action(&row?);
            count += 1;
        }
        Ok(count)
    }

    /// The summary so far.
    pub const fn summary(&self) -> &Summary {
        &self.summary
    }

    /// Ends the run.
    pub fn finish(self) -> Summary {
        self.summary
    }

    /// Applies `update` and the activity timestamps to every requested
    /// scope for this row.
    fn contribute<F>(&mut self, process: &str, window: &str, timestamps: &[DateTime<Utc>], update: F)
    where
        F: Fn(&mut SummaryScope),
    {
        let Self {
            options, summary, ..
        } = self;

        let mut scopes: Vec<&mut SummaryScope> = Vec::with_capacity(3);
        scopes.push(&mut summary.global);
        if options.per_process {
            scopes.push(summary.processes.entry(process.to_string()).or_default());
        }
        if options.per_window {
            scopes.push(summary.windows.entry(window.to_string()).or_default());
        }

        for scope in scopes {
            update(scope);
            if let Some(cutoff) = options.activity_cutoff {
                scope
                    .activity
                    .get_or_insert_with(|| IntervalMerger::new(cutoff, options.max_time))
                    .extend(timestamps.iter().copied());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures::{click, keystrokes, ts};
    use crate::payload::Plaintext;
    use crate::payload::fixtures::Locked;

    fn options() -> AggregationOptions {
        AggregationOptions {
            activity_cutoff: Some(Duration::seconds(5)),
            max_time: ts(1000),
            per_process: true,
            per_window: true,
            key_frequencies: false,
        }
    }

    #[test]
    fn keystrokes_update_every_requested_scope() {
        let mut engine = AggregationEngine::new(options(), Plaintext);
        let mut batch = keystrokes(1, 100, &[1, 1, 1], "editor");
        batch.key_count = 42;
        engine.add_keystrokes(&batch).unwrap();

        let summary = engine.finish();
        assert_eq!(summary.global.nr, 1);
        assert_eq!(summary.global.keystrokes, 42);
        assert_eq!(summary.processes["editor"].keystrokes, 42);
        assert_eq!(summary.windows["editor window"].nr, 1);

        // Timestamps 97..=100 with a 5s cutoff: one span 97..105.
        let spans: Vec<_> = summary
            .periods()
            .iter()
            .map(|i| (i.start, i.end))
            .collect();
        assert_eq!(spans, vec![(ts(97), ts(105))]);
        assert_eq!(summary.processes["editor"].active_time(), Duration::seconds(8));
    }

    #[test]
    fn per_entity_scopes_are_optional() {
        let mut engine = AggregationEngine::new(AggregationOptions::new(ts(1000)), Plaintext);
        engine.add_keystrokes(&keystrokes(1, 10, &[1], "editor")).unwrap();
        engine.add_pointer_action(&click(2, 20, 1, "editor"));

        let summary = engine.summary();
        assert!(summary.processes.is_empty());
        assert!(summary.windows.is_empty());
        assert!(summary.global.activity().is_none());
        assert_eq!(summary.active_time(), Duration::zero());
    }

    #[test]
    fn pointer_actions_count_buttons_and_scrolls() {
        let mut engine = AggregationEngine::new(options(), Plaintext);
        let mut moved = click(1, 10, 1, "browser");
        moved.move_count = 12;
        engine.add_pointer_action(&moved);
        engine.add_pointer_action(&click(2, 11, 3, "browser"));
        engine.add_pointer_action(&click(3, 12, 4, "browser"));
        engine.add_pointer_action(&click(4, 13, 5, "terminal"));

        let summary = engine.finish();
        assert_eq!(summary.global.clicks, 4);
        assert_eq!(summary.global.noscroll_clicks, 2);
        assert_eq!(summary.global.mousings, 12);
        assert_eq!(summary.global.counter("button3"), Some(1));
        assert_eq!(summary.global.counter("button4"), Some(1));
        assert_eq!(summary.global.counter("button9"), Some(0));
        assert_eq!(summary.global.counter("unknown"), None);
        assert_eq!(summary.processes["browser"].clicks, 3);
        assert_eq!(summary.processes["terminal"].noscroll_clicks, 0);
        assert_eq!(
            summary.named_button_counts(),
            vec![("left", 1), ("middle", 0), ("right", 1), ("up", 1), ("down", 1)]
        );
    }

    #[test]
    fn keys_and_clicks_share_activity_intervals() {
        let mut engine = AggregationEngine::new(options(), Plaintext);
        engine.add_keystrokes(&keystrokes(1, 10, &[], "editor")).unwrap();
        engine.add_pointer_action(&click(1, 14, 1, "browser"));
        engine.add_pointer_action(&click(2, 40, 1, "browser"));

        let summary = engine.finish();
        // 10..15 and 14..19 merge; 40..45 stays apart.
        assert_eq!(summary.periods().len(), 2);
        assert_eq!(summary.active_time(), Duration::seconds(14));
        assert_eq!(
            summary.processes_by_activity(),
            vec![
                ("browser", Duration::seconds(10)),
                ("editor", Duration::seconds(5))
            ]
        );
    }

    #[test]
    fn key_frequencies_are_decrypted_and_counted() {
        let mut opts = options();
        opts.key_frequencies = true;
        let mut engine = AggregationEngine::new(opts, Plaintext);

        let mut first = keystrokes(1, 10, &[1, 1], "editor");
        first.encrypted_keys = Some(br#"["a","b","a"]"#.to_vec());
        let mut second = keystrokes(2, 20, &[1], "editor");
        second.encrypted_keys = Some(br#"["b","a"]"#.to_vec());
        engine.add_keystrokes(&first).unwrap();
        engine.add_keystrokes(&second).unwrap();

        assert_eq!(
            engine.summary().key_frequencies_sorted(),
            vec![("a", 3), ("b", 2)]
        );
    }

    #[test]
    fn key_frequency_decrypt_failure_aborts() {
        let mut opts = options();
        opts.key_frequencies = true;
        let mut engine = AggregationEngine::new(opts, Locked);

        let mut batch = keystrokes(5, 10, &[], "editor");
        batch.encrypted_keys = Some(b"sealed".to_vec());
        let err = engine.add_keystrokes(&batch).unwrap_err();
        assert!(matches!(err, PayloadError::Decrypt { row_id: 5, .. }));
    }

    #[test]
    fn consume_stops_at_first_error() {
        #[derive(Debug)]
        enum TestError {
            Store,
            Payload,
        }
        impl From<PayloadError> for TestError {
            fn from(_: PayloadError) -> Self {
                Self::Payload
            }
        }

        let mut engine = AggregationEngine::new(options(), Plaintext);
        let rows = vec![
            Ok(keystrokes(1, 10, &[], "editor")),
            Err(TestError::Store),
            Ok(keystrokes(3, 30, &[], "editor")),
        ];
        let result = engine.consume_keystrokes(rows);
        assert!(matches!(result, Err(TestError::Store)));
        assert_eq!(engine.summary().global.nr, 1);
    }

    #[test]
    fn empty_run_has_zero_counters_and_unit_ratios() {
        let engine = AggregationEngine::new(options(), Plaintext);
        let count = engine_consume_nothing(engine);
        assert_eq!(count.global.keystrokes, 0);
        assert_eq!(count.global.clicks, 0);
        assert!(count.periods().is_empty());

        let ratios = count.ratios();
        assert!((ratios.keys_per_click - 1.0).abs() < f64::EPSILON);
        assert!(ratios.active_seconds_per_key.abs() < f64::EPSILON);
    }

    fn engine_consume_nothing(mut engine: AggregationEngine<Plaintext>) -> Summary {
        let none: Vec<Result<PointerAction, PayloadError>> = Vec::new();
        assert_eq!(engine.consume_pointer_actions(none).unwrap(), 0);
        engine.finish()
    }

    #[test]
    fn ratios_use_global_counters() {
        let mut engine = AggregationEngine::new(options(), Plaintext);
        let mut batch = keystrokes(1, 100, &[1, 1, 1], "editor");
        batch.key_count = 8;
        engine.add_keystrokes(&batch).unwrap();
        let mut moved = click(2, 200, 1, "editor");
        moved.move_count = 20;
        engine.add_pointer_action(&moved);
        engine.add_pointer_action(&click(3, 300, 1, "editor"));

        let ratios = engine.finish().ratios();
        assert!((ratios.keys_per_click - 4.0).abs() < f64::EPSILON);
        assert!((ratios.mousings_per_key - 2.5).abs() < f64::EPSILON);
        assert!((ratios.mousings_per_click - 10.0).abs() < f64::EPSILON);
        // 97..105 (8s) + 200..205 + 300..305 = 18s over 8 keys.
        assert!((ratios.active_seconds_per_key - 2.25).abs() < f64::EPSILON);
    }

    #[test]
    fn entities_sort_by_keystrokes() {
        let mut engine = AggregationEngine::new(options(), Plaintext);
        engine.add_keystrokes(&keystrokes(1, 10, &[1], "editor")).unwrap();
        engine.add_keystrokes(&keystrokes(2, 20, &[1, 1, 1], "terminal")).unwrap();

        assert_eq!(
            engine.summary().processes_by_keystrokes(),
            vec![("terminal", 4), ("editor", 2)]
        );
    }

    #[test]
    fn shared_cutoff_requires_agreement() {
        assert_eq!(shared_cutoff(Vec::new()).unwrap(), None);
        assert_eq!(
            shared_cutoff([180, 180]).unwrap(),
            Some(Duration::seconds(180))
        );
        assert!(matches!(
            shared_cutoff([180, 60]),
            Err(FilterError::ConflictingCutoffs {
                first: 180,
                second: 60
            })
        ));
    }

    #[test]
    fn shared_cutoff_rejects_negative_seconds() {
        let err = shared_cutoff([-30, -30]).unwrap_err();
        assert!(matches!(
            &err,
            FilterError::OutOfRange { flag: "active", value } if value == "-30"
        ));
        assert_eq!(err.to_string(), "--active is out of range: -30");
    }

    #[test]
    fn shared_cutoff_rejects_unrepresentable_seconds() {
        assert!(matches!(
            shared_cutoff([99_999_999_999_999_999]),
            Err(FilterError::OutOfRange { flag: "active", .. })
        ));
        assert_eq!(shared_cutoff([0]).unwrap(), Some(Duration::zero()));
    }
}
