//! Recorded input activity: keystroke batches and pointer actions.
//!
//! Rows are immutable once read from the store. Entity references carry the
//! resolved process name and window title so grouping never needs a second
//! lookup.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, Serializer};

/// A process that owned the focused window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ProcessRef {
    pub id: i64,
    pub name: String,
}

/// A window, identified by its title at recording time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WindowRef {
    pub id: i64,
    pub title: String,
    pub process_id: i64,
}

/// One recorded run of keystrokes in a single window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeystrokeBatch {
    pub id: i64,
    /// First keystroke of the run.
    pub started: DateTime<Utc>,
    /// Last keystroke of the run; the row's creation time.
    pub ended: DateTime<Utc>,
    pub process: ProcessRef,
    pub window: WindowRef,
    pub key_count: u32,
    /// Delay before each keystroke after the first, oldest first.
    #[serde(rename = "inter_key_delays_ms", serialize_with = "serialize_delays_ms")]
    pub inter_key_delays: Vec<Duration>,
    #[serde(skip)]
    pub encrypted_text: Option<Vec<u8>>,
    #[serde(skip)]
    pub encrypted_keys: Option<Vec<u8>>,
}

impl KeystrokeBatch {
    /// Absolute instant of every keystroke, ascending.
    ///
    /// Walks backward from `ended`, subtracting each delay from the most
    /// recent one, then reverses. Delays `[1s, 1s, 1s]` ending at `T`
    /// yield `[T-3s, T-2s, T-1s, T]`.
    pub fn activity_timestamps(&self) -> Vec<DateTime<Utc>> {
        let mut current = self.ended;
        let mut times = Vec::with_capacity(self.inter_key_delays.len() + 1);
        times.push(current);
        for delay in self.inter_key_delays.iter().rev() {
            current -= *delay;
            times.push(current);
        }
        times.reverse();
        times
    }

    /// Wall-clock span of the batch.
    pub fn duration(&self) -> Duration {
        self.ended - self.started
    }
}

/// A pointer button as reported by the input layer (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Button(pub u8);

impl Button {
    pub const LEFT: Self = Self(1);
    pub const MIDDLE: Self = Self(2);
    pub const RIGHT: Self = Self(3);
    pub const SCROLL_UP: Self = Self(4);
    pub const SCROLL_DOWN: Self = Self(5);

    /// Buttons with a conventional name, in report order.
    pub const NAMED: [Self; 5] = [
        Self::LEFT,
        Self::MIDDLE,
        Self::RIGHT,
        Self::SCROLL_UP,
        Self::SCROLL_DOWN,
    ];

    /// Whether the button is a scroll wheel step rather than a click.
    pub const fn is_scroll(self) -> bool {
        matches!(self.0, 4 | 5)
    }

    /// Conventional name (`left`, `middle`, `right`, `up`, `down`).
    pub const fn name(self) -> Option<&'static str> {
        match self.0 {
            1 => Some("left"),
            2 => Some("middle"),
            3 => Some("right"),
            4 => Some("up"),
            5 => Some("down"),
            _ => None,
        }
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "button{}", self.0)
    }
}

/// One mouse button press or release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointerAction {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub process: ProcessRef,
    pub window: WindowRef,
    pub button: Button,
    pub press: bool,
    pub x: i32,
    pub y: i32,
    /// Pointer movements recorded since the previous action.
    pub move_count: u32,
}

/// Either kind of recorded row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Keystrokes(KeystrokeBatch),
    Pointer(PointerAction),
}

impl Event {
    pub const fn id(&self) -> i64 {
        match self {
            Self::Keystrokes(batch) => batch.id,
            Self::Pointer(action) => action.id,
        }
    }

    /// When the row was recorded.
    pub const fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Keystrokes(batch) => batch.ended,
            Self::Pointer(action) => action.created_at,
        }
    }

    pub const fn process(&self) -> &ProcessRef {
        match self {
            Self::Keystrokes(batch) => &batch.process,
            Self::Pointer(action) => &action.process,
        }
    }

    pub const fn window(&self) -> &WindowRef {
        match self {
            Self::Keystrokes(batch) => &batch.window,
            Self::Pointer(action) => &action.window,
        }
    }
}

impl From<KeystrokeBatch> for Event {
    fn from(batch: KeystrokeBatch) -> Self {
        Self::Keystrokes(batch)
    }
}

impl From<PointerAction> for Event {
    fn from(action: PointerAction) -> Self {
        Self::Pointer(action)
    }
}

fn serialize_delays_ms<S>(delays: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_seq(delays.iter().map(Duration::num_milliseconds))
}
