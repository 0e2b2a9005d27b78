//! Activity store shared by the command tests.

use chrono::{DateTime, Duration, TimeZone, Utc};
use stats_db::{Database, KeystrokeRecord, PointerRecord};

pub fn ts(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 9, 0, 0).unwrap() + Duration::seconds(seconds)
}

/// Two processes with one window each:
///
/// | id | process   | ended | delays (ms)      | text   |
/// |----|-----------|-------|------------------|--------|
/// | 1  | firefox   | 60    | 1000, 1000       | `hi!`  |
/// | 2  | alacritty | 120   | 2000             | `ls`   |
/// | 3  | alacritty | 1000  | 1000, 1000, 1000 | `exit` |
///
/// Pointer actions: left click in firefox at 30 (10 moves), scroll up in
/// firefox at 90, right click in alacritty at 125 (5 moves).
pub fn activity_db() -> Database {
    let mut db = Database::open_in_memory().unwrap();
    let firefox = db.ensure_process("firefox").unwrap();
    let alacritty = db.ensure_process("alacritty").unwrap();
    let docs = db.ensure_window("Rust docs", firefox).unwrap();
    let build = db.ensure_window("cargo build", alacritty).unwrap();

    for (process_id, window_id, ended, delays, text) in [
        (firefox, docs, 60, vec![1000, 1000], "hi!"),
        (alacritty, build, 120, vec![2000], "ls"),
        (alacritty, build, 1000, vec![1000, 1000, 1000], "exit"),
    ] {
        let total: i64 = delays.iter().sum();
        let keys: Vec<String> = text.chars().map(String::from).collect();
        db.insert_keystroke_batch(&KeystrokeRecord {
            started: ts(ended) - Duration::milliseconds(total),
            ended: ts(ended),
            process_id,
            window_id,
            key_count: u32::try_from(delays.len() + 1).unwrap(),
            inter_key_delays_ms: delays,
            text: Some(text.as_bytes().to_vec()),
            keys: Some(serde_json::to_vec(&keys).unwrap()),
        })
        .unwrap();
    }

    for (process_id, window_id, at, button, move_count) in [
        (firefox, docs, 30, 1, 10),
        (firefox, docs, 90, 4, 0),
        (alacritty, build, 125, 3, 5),
    ] {
        db.insert_pointer_action(&PointerRecord {
            created_at: ts(at),
            process_id,
            window_id,
            button,
            press: true,
            x: 640,
            y: 480,
            move_count,
        })
        .unwrap();
    }
    db
}
