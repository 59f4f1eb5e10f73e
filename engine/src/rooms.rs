use anyhow::Result;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use sync_api::Room;

use crate::error::ValidationError;

static CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z0-9]{8}$").unwrap());

const CODE_LEN: usize = 8;
const CODE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generate a fresh shareable room code.
pub fn generate_code<R: Rng>(rng: &mut R) -> String {
    (0..CODE_LEN)
        .map(|_| CODE_CHARS[rng.gen_range(0..CODE_CHARS.len())] as char)
        .collect()
}

/// Sanitize user input into a canonical room code.
pub fn normalize_code(input: &str) -> Result<String, ValidationError> {
    let code = input.trim().to_ascii_uppercase();
    if code.is_empty() {
        return Err(ValidationError::EmptyRoomCode);
    }
    if !CODE_RE.is_match(&code) {
        return Err(ValidationError::InvalidRoomCode);
    }
    Ok(code)
}

/// Build a room owned by `creator` with an expiry horizon of `ttl_ms`.
pub fn new_room(
    code: String,
    creator: &str,
    question: &str,
    message_limit: u32,
    ttl_ms: i64,
    now_ms: i64,
) -> Room {
    Room {
        code,
        creator: creator.into(),
        question: question.into(),
        created_at: now_ms,
        expires_at: now_ms + ttl_ms,
        message_limit,
        messages: Vec::new(),
    }
}

/// Upsert the full room JSON into the fallback store.
pub fn save_snapshot(conn: &Connection, room: &Room, now_ms: i64) -> Result<()> {
    let payload = serde_json::to_string(room)?;
    conn.execute(
        "INSERT INTO room_snapshots (code, payload, saved_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(code) DO UPDATE SET payload = ?2, saved_at = ?3",
        params![room.code, payload, now_ms],
    )?;
    Ok(())
}

/// Load a room snapshot from the fallback store, if present.
pub fn load_snapshot(conn: &Connection, code: &str) -> Result<Option<Room>> {
    let mut stmt = conn.prepare("SELECT payload FROM room_snapshots WHERE code = ?1")?;
    let payload: Option<String> = stmt.query_row([code], |row| row.get(0)).optional()?;
    match payload {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn generated_codes_are_canonical() {
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let code = generate_code(&mut rng);
            assert_eq!(normalize_code(&code).unwrap(), code);
        }
    }

    #[test]
    fn normalization_rules() {
        assert_eq!(normalize_code(" roomab12 ").unwrap(), "ROOMAB12");
        assert_eq!(normalize_code(""), Err(ValidationError::EmptyRoomCode));
        assert_eq!(normalize_code("   "), Err(ValidationError::EmptyRoomCode));
        assert_eq!(normalize_code("abc"), Err(ValidationError::InvalidRoomCode));
        assert_eq!(
            normalize_code("ROOM-B12"),
            Err(ValidationError::InvalidRoomCode)
        );
    }

    #[test]
    fn snapshot_roundtrip() {
        let conn = db::init_db(":memory:").unwrap();
        let room = new_room("ROOMAB12".into(), "ana", "¿qué opinas?", 50, 3_600_000, 1_000);
        save_snapshot(&conn, &room, 1_000).unwrap();
        let loaded = load_snapshot(&conn, "ROOMAB12").unwrap().unwrap();
        assert_eq!(loaded, room);
        assert!(load_snapshot(&conn, "NOPE0000").unwrap().is_none());
    }

    #[test]
    fn expiry_horizon() {
        let room = new_room("ROOMAB12".into(), "ana", "q", 50, 1_000, 10_000);
        assert!(!room.is_expired(10_999));
        assert!(room.is_expired(11_000));
    }
}
