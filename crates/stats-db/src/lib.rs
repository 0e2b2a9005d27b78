//! Storage layer for recorded input activity.
//!
//! Provides read access to keystroke batches and pointer actions using
//! `rusqlite`, plus the [`pipeline`] that narrows them by a
//! [`FilterSpec`](stats_core::FilterSpec).
//!
//! # Thread Safety
//!
//! The [`Database`] type wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! A query run holds one `Database` for its whole duration and only reads from it.
//!
//! # Schema
//!
//! ## Timestamp Format
//!
//! Timestamps are stored as TEXT in ISO 8601 format with millisecond precision
//! (e.g., `2024-01-15T10:30:00.000Z`), so lexicographic ordering matches
//! chronological ordering and range predicates can use the indexes.
//!
//! ## Row ids
//!
//! Ids are assigned in insertion order, so ascending id is ascending recording
//! time. Every listing is ordered by id.
//!
//! ## Payloads
//!
//! `keystroke_batches.text` and `keystroke_batches.keys` hold the typed text
//! and the key names (a JSON array once decrypted) as opaque BLOBs. They are
//! only opened through a [`PayloadDecryptor`](stats_core::PayloadDecryptor).

pub mod pipeline;

use std::path::Path;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use stats_core::{Button, KeystrokeBatch, PointerAction, ProcessRef, WindowRef};
use thiserror::Error;

pub use pipeline::{
    EventCursor, EventTable, FilterPipeline, KeystrokeCursor, KeystrokeStream, KeystrokeTable,
    PointerCursor, PointerTable, QueryError,
};

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Failed to parse a stored timestamp.
    #[error("invalid timestamp in {table} row {row_id}: {timestamp}")]
    TimestampParse {
        table: &'static str,
        row_id: i64,
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
    /// A stored column holds a value outside its domain.
    #[error("invalid {table} row {row_id}: {message}")]
    InvalidRow {
        table: &'static str,
        row_id: i64,
        message: String,
    },
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
}

/// A keystroke batch ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeystrokeRecord {
    pub started: DateTime<Utc>,
    pub ended: DateTime<Utc>,
    pub process_id: i64,
    pub window_id: i64,
    pub key_count: u32,
    pub inter_key_delays_ms: Vec<i64>,
    pub text: Option<Vec<u8>>,
    pub keys: Option<Vec<u8>>,
}

/// A pointer action ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerRecord {
    pub created_at: DateTime<Utc>,
    pub process_id: i64,
    pub window_id: i64,
    pub button: u8,
    pub press: bool,
    pub x: i32,
    pub y: i32,
    pub move_count: u32,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Opens an existing database for queries.
    ///
    /// The file is neither created nor migrated; every write through this
    /// handle fails.
    pub fn open_read_only(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS processes (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS windows (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                process_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (process_id) REFERENCES processes(id)
            );

            CREATE INDEX IF NOT EXISTS idx_windows_process ON windows(process_id);

            -- One row per run of keystrokes in a window
            -- started/created_at: first and last keystroke (ISO 8601)
            -- inter_key_delays: JSON array of milliseconds between keystrokes
            -- text/keys: opaque, possibly encrypted payloads
            CREATE TABLE IF NOT EXISTS keystroke_batches (
                id INTEGER PRIMARY KEY,
                started TEXT NOT NULL,
                created_at TEXT NOT NULL,
                process_id INTEGER NOT NULL,
                window_id INTEGER NOT NULL,
                key_count INTEGER NOT NULL,
                inter_key_delays TEXT NOT NULL DEFAULT '[]',
                text BLOB,
                keys BLOB,
                FOREIGN KEY (process_id) REFERENCES processes(id),
                FOREIGN KEY (window_id) REFERENCES windows(id)
            );

            CREATE INDEX IF NOT EXISTS idx_keystroke_batches_created ON keystroke_batches(created_at);
            CREATE INDEX IF NOT EXISTS idx_keystroke_batches_started ON keystroke_batches(started);

            CREATE TABLE IF NOT EXISTS pointer_actions (
                id INTEGER PRIMARY KEY,
                button INTEGER NOT NULL,
                press INTEGER NOT NULL,
                x INTEGER NOT NULL,
                y INTEGER NOT NULL,
                move_count INTEGER NOT NULL DEFAULT 0,
                process_id INTEGER NOT NULL,
                window_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (process_id) REFERENCES processes(id),
                FOREIGN KEY (window_id) REFERENCES windows(id)
            );

            CREATE INDEX IF NOT EXISTS idx_pointer_actions_created ON pointer_actions(created_at);
            ",
        )?;
        Ok(())
    }

    /// Returns the id of the process named `name`, adding it if unknown.
    pub fn ensure_process(&mut self, name: &str) -> Result<i64, DbError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO processes (name, created_at) VALUES (?, ?)",
            params![name, format_timestamp(Utc::now())],
        )?;
        let id = self
            .conn
            .query_row("SELECT id FROM processes WHERE name = ?", [name], |row| {
                row.get(0)
            })?;
        Ok(id)
    }

    /// Returns the id of the window `title` owned by `process_id`, adding it
    /// if unknown.
    pub fn ensure_window(&mut self, title: &str, process_id: i64) -> Result<i64, DbError> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM windows WHERE title = ? AND process_id = ? ORDER BY id LIMIT 1",
                params![title, process_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }
        self.conn.execute(
            "INSERT INTO windows (title, process_id, created_at) VALUES (?, ?, ?)",
            params![title, process_id, format_timestamp(Utc::now())],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Stores a keystroke batch and returns its id.
    pub fn insert_keystroke_batch(&mut self, record: &KeystrokeRecord) -> Result<i64, DbError> {
        let delays = serde_json::to_string(&record.inter_key_delays_ms).map_err(|err| {
            DbError::InvalidRow {
                table: "keystroke_batches",
                row_id: 0,
                message: err.to_string(),
            }
        })?;
        self.conn.execute(
            "
            INSERT INTO keystroke_batches
            (started, created_at, process_id, window_id, key_count, inter_key_delays, text, keys)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
            params![
                format_timestamp(record.started),
                format_timestamp(record.ended),
                record.process_id,
                record.window_id,
                record.key_count,
                delays,
                record.text,
                record.keys,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Stores a pointer action and returns its id.
    pub fn insert_pointer_action(&mut self, record: &PointerRecord) -> Result<i64, DbError> {
        self.conn.execute(
            "
            INSERT INTO pointer_actions
            (button, press, x, y, move_count, process_id, window_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
            params![
                record.button,
                record.press,
                record.x,
                record.y,
                record.move_count,
                record.process_id,
                record.window_id,
                format_timestamp(record.created_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Lists every process, ordered by id.
    pub fn processes(&self) -> Result<Vec<ProcessRef>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM processes ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(ProcessRef {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        let mut processes = Vec::new();
        for row in rows {
            processes.push(row?);
        }
        Ok(processes)
    }

    /// Lists every window, ordered by id.
    pub fn windows(&self) -> Result<Vec<WindowRef>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, title, process_id FROM windows ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(WindowRef {
                id: row.get(0)?,
                title: row.get(1)?,
                process_id: row.get(2)?,
            })
        })?;
        let mut windows = Vec::new();
        for row in rows {
            windows.push(row?);
        }
        Ok(windows)
    }

    pub(crate) const fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Keystroke batch columns as stored, before timestamp and JSON parsing.
#[derive(Debug)]
pub struct KeystrokeRow {
    id: i64,
    started: String,
    ended: String,
    process: ProcessRef,
    window: WindowRef,
    key_count: i64,
    inter_key_delays: String,
    text: Option<Vec<u8>>,
    keys: Option<Vec<u8>>,
}

impl KeystrokeRow {
    pub(crate) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            started: row.get(1)?,
            ended: row.get(2)?,
            process: ProcessRef {
                id: row.get(3)?,
                name: row.get(4)?,
            },
            window: WindowRef {
                id: row.get(5)?,
                title: row.get(6)?,
                process_id: row.get(7)?,
            },
            key_count: row.get(8)?,
            inter_key_delays: row.get(9)?,
            text: row.get(10)?,
            keys: row.get(11)?,
        })
    }

    pub(crate) fn into_batch(self) -> Result<KeystrokeBatch, DbError> {
        const TABLE: &str = "keystroke_batches";
        let started = parse_timestamp(&self.started, TABLE, self.id)?;
        let ended = parse_timestamp(&self.ended, TABLE, self.id)?;
        let key_count = u32::try_from(self.key_count).map_err(|_| DbError::InvalidRow {
            table: TABLE,
            row_id: self.id,
            message: format!("key count {} out of range", self.key_count),
        })?;
        let delays_ms: Vec<i64> =
            serde_json::from_str(&self.inter_key_delays).map_err(|err| DbError::InvalidRow {
                table: TABLE,
                row_id: self.id,
                message: format!("inter-key delays: {err}"),
            })?;

        Ok(KeystrokeBatch {
            id: self.id,
            started,
            ended,
            process: self.process,
            window: self.window,
            key_count,
            inter_key_delays: delays_ms.into_iter().map(Duration::milliseconds).collect(),
            encrypted_text: self.text,
            encrypted_keys: self.keys,
        })
    }
}

/// Pointer action columns as stored, before timestamp parsing.
#[derive(Debug)]
pub struct PointerRow {
    id: i64,
    created_at: String,
    process: ProcessRef,
    window: WindowRef,
    button: i64,
    press: bool,
    x: i32,
    y: i32,
    move_count: i64,
}

impl PointerRow {
    pub(crate) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            created_at: row.get(1)?,
            process: ProcessRef {
                id: row.get(2)?,
                name: row.get(3)?,
            },
            window: WindowRef {
                id: row.get(4)?,
                title: row.get(5)?,
                process_id: row.get(6)?,
            },
            button: row.get(7)?,
            press: row.get(8)?,
            x: row.get(9)?,
            y: row.get(10)?,
            move_count: row.get(11)?,
        })
    }

    pub(crate) fn into_action(self) -> Result<PointerAction, DbError> {
        const TABLE: &str = "pointer_actions";
        let out_of_range = |what: &str, value: i64| DbError::InvalidRow {
            table: TABLE,
            row_id: self.id,
            message: format!("{what} {value} out of range"),
        };
        let created_at = parse_timestamp(&self.created_at, TABLE, self.id)?;
        let button = u8::try_from(self.button).map_err(|_| out_of_range("button", self.button))?;
        let move_count =
            u32::try_from(self.move_count).map_err(|_| out_of_range("move count", self.move_count))?;

        Ok(PointerAction {
            id: self.id,
            created_at,
            process: self.process,
            window: self.window,
            button: Button(button),
            press: self.press,
            x: self.x,
            y: self.y,
            move_count,
        })
    }
}

fn parse_timestamp(timestamp: &str, table: &'static str, row_id: i64) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            table,
            row_id,
            timestamp: timestamp.to_string(),
            source,
        })
}

pub(crate) fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn open_in_memory_database() {
        let db = Database::open_in_memory();
        assert!(db.is_ok());
    }

    #[test]
    fn schema_matches_data_model() {
        let db = Database::open_in_memory().unwrap();

        assert_eq!(
            table_columns(&db.conn, "processes"),
            vec!["id", "name", "created_at"]
        );
        assert_eq!(
            table_columns(&db.conn, "windows"),
            vec!["id", "title", "process_id", "created_at"]
        );
        assert_eq!(
            table_columns(&db.conn, "keystroke_batches"),
            vec![
                "id",
                "started",
                "created_at",
                "process_id",
                "window_id",
                "key_count",
                "inter_key_delays",
                "text",
                "keys"
            ]
        );
        assert_eq!(
            table_columns(&db.conn, "pointer_actions"),
            vec![
                "id",
                "button",
                "press",
                "x",
                "y",
                "move_count",
                "process_id",
                "window_id",
                "created_at"
            ]
        );

        let indexes = index_names(&db.conn, "keystroke_batches");
        assert!(indexes.contains("idx_keystroke_batches_created"));
        assert!(indexes.contains("idx_keystroke_batches_started"));
        assert!(index_names(&db.conn, "pointer_actions").contains("idx_pointer_actions_created"));
    }

    fn table_columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .map(Result::unwrap)
            .collect()
    }

    fn index_names(conn: &Connection, table: &str) -> HashSet<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA index_list({table})"))
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .map(Result::unwrap)
            .collect()
    }

    #[test]
    fn init_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("stats.db");
        let mut db = Database::open(&path).unwrap();
        db.ensure_process("editor").unwrap();
        drop(db);

        let db = Database::open(&path).unwrap();
        assert_eq!(db.processes().unwrap().len(), 1);
    }

    #[test]
    fn read_only_open_reads_without_writing() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("stats.db");
        let mut db = Database::open(&path).unwrap();
        db.ensure_process("editor").unwrap();
        drop(db);

        let mut db = Database::open_read_only(&path).unwrap();
        assert_eq!(db.processes().unwrap().len(), 1);
        assert!(matches!(
            db.ensure_process("terminal"),
            Err(DbError::Sqlite(_))
        ));
    }

    #[test]
    fn read_only_open_does_not_create_the_store() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("absent.db");

        assert!(Database::open_read_only(&path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn ensure_process_reuses_existing_rows() {
        let mut db = Database::open_in_memory().unwrap();
        let first = db.ensure_process("firefox").unwrap();
        let second = db.ensure_process("chrome").unwrap();
        let again = db.ensure_process("firefox").unwrap();

        assert_eq!(first, again);
        assert_ne!(first, second);
        let names: Vec<String> = db.processes().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["firefox", "chrome"]);
    }

    #[test]
    fn ensure_window_is_scoped_to_process() {
        let mut db = Database::open_in_memory().unwrap();
        let a = db.ensure_process("a").unwrap();
        let b = db.ensure_process("b").unwrap();

        let w1 = db.ensure_window("Inbox", a).unwrap();
        let w2 = db.ensure_window("Inbox", b).unwrap();
        let w3 = db.ensure_window("Inbox", a).unwrap();

        assert_eq!(w1, w3);
        assert_ne!(w1, w2);
        let windows = db.windows().unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].process_id, b);
    }

    #[test]
    fn stored_rows_convert_to_events() {
        let mut db = Database::open_in_memory().unwrap();
        let p = db.ensure_process("editor").unwrap();
        let w = db.ensure_window("main.rs", p).unwrap();
        let id = db
            .insert_keystroke_batch(&keystroke_record(p, w, 60, &[250, 750], "abc"))
            .unwrap();

        let row = db
            .conn
            .query_row(
                &format!("{} WHERE k.id = ?", KeystrokeTable::SELECT),
                [id],
                KeystrokeRow::read,
            )
            .unwrap();
        let batch = row.into_batch().unwrap();

        assert_eq!(batch.id, id);
        assert_eq!(batch.ended, ts(60));
        assert_eq!(batch.started, ts(59));
        assert_eq!(batch.key_count, 3);
        assert_eq!(batch.process.name, "editor");
        assert_eq!(batch.window.title, "main.rs");
        assert_eq!(
            batch.inter_key_delays,
            vec![Duration::milliseconds(250), Duration::milliseconds(750)]
        );
        assert_eq!(batch.encrypted_text.as_deref(), Some(b"abc".as_slice()));
    }

    #[test]
    fn corrupt_timestamp_names_the_row() {
        let mut db = Database::open_in_memory().unwrap();
        let p = db.ensure_process("editor").unwrap();
        let w = db.ensure_window("main.rs", p).unwrap();
        let id = db
            .insert_pointer_action(&pointer_record(p, w, 0, 1))
            .unwrap();
        db.conn
            .execute(
                "UPDATE pointer_actions SET created_at = 'yesterday' WHERE id = ?",
                [id],
            )
            .unwrap();

        let row = db
            .conn
            .query_row(
                &format!("{} WHERE c.id = ?", PointerTable::SELECT),
                [id],
                PointerRow::read,
            )
            .unwrap();
        let err = row.into_action().unwrap_err();
        assert!(matches!(
            err,
            DbError::TimestampParse {
                table: "pointer_actions",
                ..
            }
        ));
    }
}
