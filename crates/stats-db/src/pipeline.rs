//! Filtered, lazily evaluated access to stored events.
//!
//! A [`FilterPipeline`] applies a [`FilterSpec`] in three stages:
//!
//! 1. The process and window tables are scanned for the name and title
//!    regexes, producing id sets. If either set is empty the pipeline is
//!    exhausted and no event query is ever issued.
//! 2. The row bound, the id sets and the minimum key count go into the SQL
//!    of each event cursor.
//! 3. The body regex runs last, over decrypted text, in [`KeystrokeStream`].
//!
//! Rows are read one at a time in ascending id order. Nothing is collected.

use std::marker::PhantomData;

use regex::Regex;
use rusqlite::types::Value;
use rusqlite::{Row, Statement, params_from_iter};
use stats_core::{
    FilterSpec, KeystrokeBatch, PayloadDecryptor, PayloadError, PointerAction, RowBound,
    decrypt_text,
};
use thiserror::Error;
use tracing::debug;

use crate::{Database, DbError, KeystrokeRow, PointerRow, format_timestamp};

/// Errors raised while reading filtered events.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Store(#[from] DbError),
    #[error(transparent)]
    Decrypt(#[from] PayloadError),
}

/// An event table and how its rows map to domain events.
pub trait EventTable {
    /// Columns as read from SQLite.
    type Stored;
    /// The domain event.
    type Event;

    /// Table name, for logs.
    const NAME: &'static str;
    /// Alias of the event table inside [`Self::SELECT`].
    const ALIAS: &'static str;
    /// Joined select, without `WHERE` or `ORDER BY`.
    const SELECT: &'static str;
    /// Column holding the first timestamp of the row.
    const STARTED: &'static str;
    /// Column holding the last timestamp of the row.
    const ENDED: &'static str;
    /// Column compared against the minimum key count, if the table has one.
    const KEY_COUNT: Option<&'static str>;

    fn read(row: &Row<'_>) -> rusqlite::Result<Self::Stored>;

    fn convert(stored: Self::Stored) -> Result<Self::Event, DbError>;
}

/// Keystroke batches joined with their process and window.
#[derive(Debug, Clone, Copy)]
pub struct KeystrokeTable;

impl EventTable for KeystrokeTable {
    type Stored = KeystrokeRow;
    type Event = KeystrokeBatch;

    const NAME: &'static str = "keystroke_batches";
    const ALIAS: &'static str = "k";
    const SELECT: &'static str = "
        SELECT k.id, k.started, k.created_at, p.id, p.name, w.id, w.title, w.process_id,
               k.key_count, k.inter_key_delays, k.text, k.keys
        FROM keystroke_batches k
        JOIN processes p ON p.id = k.process_id
        JOIN windows w ON w.id = k.window_id";
    const STARTED: &'static str = "k.started";
    const ENDED: &'static str = "k.created_at";
    const KEY_COUNT: Option<&'static str> = Some("k.key_count");

    fn read(row: &Row<'_>) -> rusqlite::Result<KeystrokeRow> {
        KeystrokeRow::read(row)
    }

    fn convert(stored: KeystrokeRow) -> Result<KeystrokeBatch, DbError> {
        stored.into_batch()
    }
}

/// Pointer actions joined with their process and window.
#[derive(Debug, Clone, Copy)]
pub struct PointerTable;

impl EventTable for PointerTable {
    type Stored = PointerRow;
    type Event = PointerAction;

    const NAME: &'static str = "pointer_actions";
    const ALIAS: &'static str = "c";
    const SELECT: &'static str = "
        SELECT c.id, c.created_at, p.id, p.name, w.id, w.title, w.process_id,
               c.button, c.press, c.x, c.y, c.move_count
        FROM pointer_actions c
        JOIN processes p ON p.id = c.process_id
        JOIN windows w ON w.id = c.window_id";
    const STARTED: &'static str = "c.created_at";
    const ENDED: &'static str = "c.created_at";
    const KEY_COUNT: Option<&'static str> = None;

    fn read(row: &Row<'_>) -> rusqlite::Result<PointerRow> {
        PointerRow::read(row)
    }

    fn convert(stored: PointerRow) -> Result<PointerAction, DbError> {
        stored.into_action()
    }
}

pub type KeystrokeCursor<'db> = EventCursor<'db, KeystrokeTable>;
pub type PointerCursor<'db> = EventCursor<'db, PointerTable>;

/// A prepared, bounded query over one event table.
///
/// [`rows`](Self::rows) may be called again to restart from the first row.
pub struct EventCursor<'db, T> {
    stmt: Option<Statement<'db>>,
    params: Vec<Value>,
    table: PhantomData<T>,
}

impl<T: EventTable> EventCursor<'_, T> {
    const fn exhausted() -> Self {
        Self {
            stmt: None,
            params: Vec::new(),
            table: PhantomData,
        }
    }

    /// Whether the cursor was short-circuited and will yield nothing.
    pub const fn is_exhausted(&self) -> bool {
        self.stmt.is_none()
    }

    /// Iterates over matching rows in ascending id order.
    pub fn rows(&mut self) -> Result<impl Iterator<Item = Result<T::Event, DbError>>, DbError> {
        let rows = match self.stmt.as_mut() {
            Some(stmt) => Some(stmt.query_map(params_from_iter(self.params.iter()), T::read)?),
            None => None,
        };
        Ok(rows
            .into_iter()
            .flatten()
            .map(|row| row.map_err(DbError::from).and_then(T::convert)))
    }
}

impl<'db> EventCursor<'db, KeystrokeTable> {
    /// Iterates over matching batches, keeping only those whose decrypted
    /// text matches `body` when it is set.
    pub fn stream<'r, D: PayloadDecryptor>(
        &mut self,
        body: Option<&'r Regex>,
        decryptor: D,
    ) -> Result<
        KeystrokeStream<'r, impl Iterator<Item = Result<KeystrokeBatch, DbError>>, D>,
        DbError,
    > {
        Ok(KeystrokeStream::new(self.rows()?, body, decryptor))
    }
}

/// Keystroke rows with the body filter applied.
///
/// The first error ends the stream: it is yielded once and every later call
/// returns `None`.
pub struct KeystrokeStream<'r, I, D> {
    rows: I,
    body: Option<&'r Regex>,
    decryptor: D,
    failed: bool,
}

impl<'r, I, D> KeystrokeStream<'r, I, D> {
    pub const fn new(rows: I, body: Option<&'r Regex>, decryptor: D) -> Self {
        Self {
            rows,
            body,
            decryptor,
            failed: false,
        }
    }
}

impl<I, D> Iterator for KeystrokeStream<'_, I, D>
where
    I: Iterator<Item = Result<KeystrokeBatch, DbError>>,
    D: PayloadDecryptor,
{
    type Item = Result<KeystrokeBatch, QueryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let batch = match self.rows.next()? {
                Ok(batch) => batch,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err.into()));
                }
            };
            let Some(body) = self.body else {
                return Some(Ok(batch));
            };
            match decrypt_text(&self.decryptor, batch.id, batch.encrypted_text.as_deref()) {
                Ok(text) if body.is_match(&text) => return Some(Ok(batch)),
                Ok(_) => {}
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err.into()));
                }
            }
        }
    }
}

/// Entity lookups resolved for one [`FilterSpec`].
pub struct FilterPipeline<'a> {
    db: &'a Database,
    spec: &'a FilterSpec,
    processes: Option<Vec<i64>>,
    windows: Option<Vec<i64>>,
}

impl<'a> FilterPipeline<'a> {
    /// Resolves the process and title regexes against the lookup tables.
    ///
    /// The window scan is skipped once the process scan matched nothing.
    pub fn prepare(db: &'a Database, spec: &'a FilterSpec) -> Result<Self, DbError> {
        let mut pipeline = Self {
            db,
            spec,
            processes: None,
            windows: None,
        };

        if let Some(regex) = spec.process() {
            let ids: Vec<i64> = db
                .processes()?
                .into_iter()
                .filter(|process| regex.is_match(&process.name))
                .map(|process| process.id)
                .collect();
            debug!(pattern = regex.as_str(), matched = ids.len(), "process filter");
            let empty = ids.is_empty();
            pipeline.processes = Some(ids);
            if empty {
                return Ok(pipeline);
            }
        }

        if let Some(regex) = spec.title() {
            let ids: Vec<i64> = db
                .windows()?
                .into_iter()
                .filter(|window| regex.is_match(&window.title))
                .map(|window| window.id)
                .collect();
            debug!(pattern = regex.as_str(), matched = ids.len(), "title filter");
            pipeline.windows = Some(ids);
        }

        Ok(pipeline)
    }

    /// Whether an entity filter matched nothing.
    pub fn is_exhausted(&self) -> bool {
        [&self.processes, &self.windows]
            .into_iter()
            .any(|ids| ids.as_ref().is_some_and(Vec::is_empty))
    }

    /// Ids of processes matching the process regex, if one was given.
    pub fn matched_processes(&self) -> Option<&[i64]> {
        self.processes.as_deref()
    }

    /// Ids of windows matching the title regex, if one was given and scanned.
    pub fn matched_windows(&self) -> Option<&[i64]> {
        self.windows.as_deref()
    }

    pub fn keystrokes(&self) -> Result<KeystrokeCursor<'a>, DbError> {
        self.cursor()
    }

    /// Pointer actions are not affected by the minimum key count or the body
    /// regex.
    pub fn pointer_actions(&self) -> Result<PointerCursor<'a>, DbError> {
        self.cursor()
    }

    fn cursor<T: EventTable>(&self) -> Result<EventCursor<'a, T>, DbError> {
        if self.is_exhausted() {
            debug!(table = T::NAME, "entity filter matched nothing, skipping query");
            return Ok(EventCursor::exhausted());
        }
        let (sql, params) = self.query::<T>();
        debug!(table = T::NAME, sql = sql.as_str(), "prepared event query");
        let stmt = self.db.connection().prepare(&sql)?;
        Ok(EventCursor {
            stmt: Some(stmt),
            params,
            table: PhantomData,
        })
    }

    fn query<T: EventTable>(&self) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();

        match self.spec.bound() {
            RowBound::Unbounded => {}
            RowBound::Time { from, until } => {
                clauses.push(format!("{} >= ?", T::ENDED));
                params.push(Value::Text(format_timestamp(from)));
                if let Some(until) = until {
                    clauses.push(format!("{} <= ?", T::STARTED));
                    params.push(Value::Text(format_timestamp(until)));
                }
            }
            RowBound::Since { from, until } => {
                clauses.push(format!("{} >= ?", T::STARTED));
                params.push(Value::Text(format_timestamp(from)));
                if let Some(until) = until {
                    clauses.push(format!("{} <= ?", T::STARTED));
                    params.push(Value::Text(format_timestamp(until)));
                }
            }
            RowBound::Id { from, until } => {
                clauses.push(format!("{}.id >= ?", T::ALIAS));
                params.push(Value::Integer(from));
                if let Some(until) = until {
                    clauses.push(format!("{}.id < ?", T::ALIAS));
                    params.push(Value::Integer(until));
                }
            }
        }

        // Ids come from our own tables, so they are inlined rather than bound
        // to stay clear of the host parameter limit.
        if let Some(ids) = &self.processes {
            clauses.push(format!("{}.process_id IN ({})", T::ALIAS, join_ids(ids)));
        }
        if let Some(ids) = &self.windows {
            clauses.push(format!("{}.window_id IN ({})", T::ALIAS, join_ids(ids)));
        }
        if let (Some(column), Some(min_keys)) = (T::KEY_COUNT, self.spec.min_keys()) {
            clauses.push(format!("{column} >= ?"));
            params.push(Value::Integer(i64::from(min_keys)));
        }

        let mut sql = T::SELECT.to_string();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY {}.id ASC", T::ALIAS));
        (sql, params)
    }
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
