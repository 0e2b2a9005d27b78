//! Core domain logic for activity statistics.
//!
//! This crate contains the fundamental types and logic for:
//! - Periods: merging activity timestamps into disjoint active intervals
//! - Filters: validating query options into a row bound and entity regexes
//! - Aggregation: global, per-process and per-window counters and activity
//!
//! It performs no I/O and does not log; every failure is a typed error.

pub mod aggregate;
pub mod event;
pub mod filter;
pub mod payload;
pub mod period;

pub use aggregate::{
    AggregationEngine, AggregationOptions, DEFAULT_ACTIVE_SECONDS, Ratios, Summary, SummaryScope,
    shared_cutoff,
};
pub use event::{Button, Event, KeystrokeBatch, PointerAction, ProcessRef, WindowRef};
pub use filter::{FilterError, FilterSpec, QueryArgs, RowBound, parse_period, resolve_start};
pub use payload::{DecryptError, PayloadDecryptor, PayloadError, Plaintext, decrypt_keys, decrypt_text};
pub use period::{IntervalMerger, TimeInterval};
