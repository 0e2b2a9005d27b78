//! Query filters over recorded activity.
//!
//! [`QueryArgs`] is the raw configuration surface handed over by the
//! argument parser. [`FilterSpec::from_args`] validates all of it up front
//! (regexes, periods, dates) so a bad flag is reported before the store is
//! touched.
//!
//! # Bound priority
//!
//! Only one row bound is ever applied. An explicit date or clock wins over
//! a start id, which wins over a look-back period. Supplying several is not
//! an error; the lower-priority forms are ignored.

use std::sync::LazyLock;

use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
};
use regex::{Regex, RegexBuilder};
use thiserror::Error;

/// Pre-compiled pattern for `<amount>[unit]` periods (whitespace removed).
static PERIOD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)([smhdw]?)$").expect("period pattern is valid"));

/// Invalid filter input. Always a caller defect, never retried.
#[derive(Debug, Error)]
pub enum FilterError {
    /// A regular expression failed to compile.
    #[error("invalid regular expression for --{flag}: {pattern}")]
    Regex {
        flag: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    /// A period did not match `<amount>[s|m|h|d|w]`.
    #[error("--{flag} has an unrecognizable format: {value} (expected <amount>[s|m|h|d|w])")]
    Period { flag: &'static str, value: String },
    /// A period or id range does not fit the time or id domain.
    #[error("--{flag} is out of range: {value}")]
    OutOfRange { flag: &'static str, value: String },
    /// With `--id`, the limit is a row count.
    #[error("--limit must be a row count when starting from --id, got {value}")]
    IdLimit { value: String },
    /// The date could not be resolved to a calendar day.
    #[error("malformed date: {value} ({reason})")]
    Date { value: String, reason: &'static str },
    /// The clock was not `HH:MM`.
    #[error("malformed clock: {value} (expected HH:MM)")]
    Clock { value: String },
    /// Activity reports requested with different idle cutoffs.
    #[error("activity reports must share one cutoff, got {first}s and {second}s")]
    ConflictingCutoffs { first: i64, second: i64 },
}

/// Unvalidated query options as supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryArgs {
    /// `[[YYYY] MM] DD`, as one or several whitespace separated words.
    pub date: Vec<String>,
    /// `HH:MM`, 24 hour clock.
    pub clock: Option<String>,
    /// First row id to include.
    pub id: Option<i64>,
    /// Look-back period, e.g. `2h`, `30 m`, `1w`.
    pub back: Option<String>,
    /// Period after the start, or a row count when starting from `id`.
    pub limit: Option<String>,
    /// Regex on process names.
    pub process: Option<String>,
    /// Regex on window titles.
    pub title: Option<String>,
    /// Regex on decrypted keystroke text.
    pub body: Option<String>,
    /// Minimum keystrokes per batch.
    pub min_keys: Option<u32>,
}

/// The single bound applied to the store query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RowBound {
    /// Every row.
    #[default]
    Unbounded,
    /// Rows that end at or after `from` and, when `until` is set, start at
    /// or before `until`.
    Time {
        from: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    },
    /// Rows that start at or after `from` and, when `until` is set, at or
    /// before `until`. Used for look-back periods.
    Since {
        from: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    },
    /// Rows with `from <= id`, and `id < until` when set.
    Id { from: i64, until: Option<i64> },
}

/// A validated, immutable filter for one query.
///
/// All parts are optional and combine with logical AND.
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    bound: RowBound,
    process: Option<Regex>,
    title: Option<Regex>,
    min_keys: Option<u32>,
    body: Option<Regex>,
}

impl FilterSpec {
    /// A filter with only a row bound.
    pub fn new(bound: RowBound) -> Self {
        Self {
            bound,
            ..Self::default()
        }
    }

    /// Validates `args` and resolves the row bound relative to `now`.
    ///
    /// `now` also fixes the time zone used to read dates and clocks.
    pub fn from_args<Tz: TimeZone>(args: &QueryArgs, now: &DateTime<Tz>) -> Result<Self, FilterError> {
        let process = compile_regex("process", args.process.as_deref())?;
        let title = compile_regex("title", args.title.as_deref())?;
        let body = compile_regex("body", args.body.as_deref())?;
        let bound = resolve_bound(args, now)?;

        Ok(Self {
            bound,
            process,
            title,
            min_keys: args.min_keys,
            body,
        })
    }

    pub fn with_process(mut self, pattern: &str) -> Result<Self, FilterError> {
        self.process = compile_regex("process", Some(pattern))?;
        Ok(self)
    }

    pub fn with_title(mut self, pattern: &str) -> Result<Self, FilterError> {
        self.title = compile_regex("title", Some(pattern))?;
        Ok(self)
    }

    pub fn with_body(mut self, pattern: &str) -> Result<Self, FilterError> {
        self.body = compile_regex("body", Some(pattern))?;
        Ok(self)
    }

    #[must_use]
    pub fn with_min_keys(mut self, min_keys: u32) -> Self {
        self.min_keys = Some(min_keys);
        self
    }

    pub const fn bound(&self) -> RowBound {
        self.bound
    }

    /// Case-insensitive regex on process names.
    pub const fn process(&self) -> Option<&Regex> {
        self.process.as_ref()
    }

    /// Case-insensitive regex on window titles.
    pub const fn title(&self) -> Option<&Regex> {
        self.title.as_ref()
    }

    pub const fn min_keys(&self) -> Option<u32> {
        self.min_keys
    }

    /// Case-insensitive regex on decrypted text. Requires decryption.
    pub const fn body(&self) -> Option<&Regex> {
        self.body.as_ref()
    }
}

/// Compiles an optional pattern case-insensitively.
fn compile_regex(flag: &'static str, pattern: Option<&str>) -> Result<Option<Regex>, FilterError> {
    pattern
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| FilterError::Regex {
                    flag,
                    pattern: pattern.to_string(),
                    source,
                })
        })
        .transpose()
}

fn resolve_bound<Tz: TimeZone>(args: &QueryArgs, now: &DateTime<Tz>) -> Result<RowBound, FilterError> {
    if !args.date.is_empty() || args.clock.is_some() {
        let from = resolve_start(&args.date, args.clock.as_deref(), now)?;
        let until = args
            .limit
            .as_deref()
            .map(|limit| offset(from, parse_period("limit", limit)?, "limit", limit))
            .transpose()?;
        return Ok(RowBound::Time { from, until });
    }

    if let Some(from) = args.id {
        let until = args
            .limit
            .as_deref()
            .map(|limit| {
                let count: i64 = limit
                    .trim()
                    .parse()
                    .map_err(|_| FilterError::IdLimit {
                        value: limit.to_string(),
                    })?;
                from.checked_add(count).ok_or_else(|| FilterError::OutOfRange {
                    flag: "limit",
                    value: limit.to_string(),
                })
            })
            .transpose()?;
        return Ok(RowBound::Id { from, until });
    }

    if let Some(back) = args.back.as_deref() {
        let period = parse_period("back", back)?;
        let from = now
            .with_timezone(&Utc)
            .checked_sub_signed(period)
            .ok_or_else(|| FilterError::OutOfRange {
                flag: "back",
                value: back.to_string(),
            })?;
        let until = args
            .limit
            .as_deref()
            .map(|limit| offset(from, parse_period("limit", limit)?, "limit", limit))
            .transpose()?;
        return Ok(RowBound::Since { from, until });
    }

    Ok(RowBound::Unbounded)
}

fn offset(
    start: DateTime<Utc>,
    period: Duration,
    flag: &'static str,
    value: &str,
) -> Result<DateTime<Utc>, FilterError> {
    start
        .checked_add_signed(period)
        .ok_or_else(|| FilterError::OutOfRange {
            flag,
            value: value.to_string(),
        })
}

/// Parses `<amount>[unit]` where unit is one of `s m h d w`.
///
/// Whitespace is ignored, so `"3 d"` equals `"3d"`. Without a unit the
/// amount is in hours.
pub fn parse_period(flag: &'static str, value: &str) -> Result<Duration, FilterError> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    let Some(caps) = PERIOD_RE.captures(&compact) else {
        return Err(FilterError::Period {
            flag,
            value: value.to_string(),
        });
    };

    let out_of_range = || FilterError::OutOfRange {
        flag,
        value: value.to_string(),
    };
    let amount: i64 = caps[1].parse().map_err(|_| out_of_range())?;
    let seconds_per_unit = match &caps[2] {
        "s" => 1,
        "m" => 60,
        "d" => 24 * 3600,
        "w" => 7 * 24 * 3600,
        _ => 3600,
    };

    amount
        .checked_mul(seconds_per_unit)
        .and_then(Duration::try_seconds)
        .ok_or_else(out_of_range)
}

/// Resolves `[[YYYY] MM] DD` and `HH:MM` to the closest matching instant in
/// the past.
///
/// - one date word is a day: this month, or last month if that is ahead.
/// - two words are month and day: this year, or last year if ahead.
/// - three words are year, month and day.
/// - without a date the day is today.
///
/// The time of day is kept from `now` unless a clock is given; a clock that
/// would land in the future moves back one day.
pub fn resolve_start<Tz: TimeZone>(
    date: &[String],
    clock: Option<&str>,
    now: &DateTime<Tz>,
) -> Result<DateTime<Utc>, FilterError> {
    let now_local = now.naive_local();
    let joined = date.join(" ");
    let words: Vec<&str> = joined.split_whitespace().collect();

    let malformed = |reason: &'static str| FilterError::Date {
        value: joined.clone(),
        reason,
    };

    let parts = words
        .iter()
        .map(|word| word.parse::<i32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| malformed("not a number"))?;

    let today = now_local.date();
    let day = match parts.as_slice() {
        [] => today,
        [year, month, day] => ymd(*year, *month, *day).ok_or_else(|| malformed("no such day"))?,
        [month, day] => {
            let candidate =
                ymd(today.year(), *month, *day).ok_or_else(|| malformed("no such day"))?;
            if candidate.and_time(now_local.time()) > now_local {
                ymd(today.year() - 1, *month, *day).ok_or_else(|| malformed("no such day"))?
            } else {
                candidate
            }
        }
        [day] => {
            let candidate = ymd(today.year(), month_i32(today), *day)
                .ok_or_else(|| malformed("no such day"))?;
            if candidate.and_time(now_local.time()) > now_local {
                let (year, month) = if today.month() == 1 {
                    (today.year() - 1, 12)
                } else {
                    (today.year(), month_i32(today) - 1)
                };
                ymd(year, month, *day).ok_or_else(|| malformed("no such day"))?
            } else {
                candidate
            }
        }
        _ => return Err(malformed("at most three numbers")),
    };

    let mut start = day.and_time(now_local.time());
    if let Some(clock) = clock {
        start = day.and_time(parse_clock(clock)?);
        if start > now_local {
            start -= Duration::days(1);
        }
    }

    localize(now, start).ok_or_else(|| FilterError::Date {
        value: start.to_string(),
        reason: "does not exist in the local time zone",
    })
}

fn parse_clock(clock: &str) -> Result<NaiveTime, FilterError> {
    let malformed = || FilterError::Clock {
        value: clock.to_string(),
    };
    let (hour, minute) = clock.trim().split_once(':').ok_or_else(malformed)?;
    let hour: u32 = hour.parse().map_err(|_| malformed())?;
    let minute: u32 = minute.parse().map_err(|_| malformed())?;
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(malformed)
}

fn ymd(year: i32, month: i32, day: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, u32::try_from(month).ok()?, u32::try_from(day).ok()?)
}

fn month_i32(date: NaiveDate) -> i32 {
    // Months are 1..=12.
    i32::try_from(date.month()).unwrap_or(1)
}

/// Interprets a wall-clock time in the zone of `now`, taking the earlier
/// instant when the clock is ambiguous.
fn localize<Tz: TimeZone>(now: &DateTime<Tz>, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    now.timezone()
        .from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}
