use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::RestoreFailure;

/// The local user inside a room.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Participant {
    pub name: String,
    pub is_creator: bool,
}

/// The active (room, user) pair persisted across reloads.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Session {
    pub room_code: String,
    pub user: Participant,
    /// Unix milliseconds, refreshed on activity.
    pub saved_at: i64,
}

/// Persist the session as the singleton row.
pub fn save_session(conn: &Connection, session: &Session) -> Result<()> {
    let payload = serde_json::to_string(session)?;
    conn.execute(
        "INSERT INTO session (id, payload) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET payload = ?1",
        params![payload],
    )?;
    Ok(())
}

/// Refresh the session timestamp, if a session exists.
pub fn touch_session(conn: &Connection, now_ms: i64) -> Result<()> {
    let mut stmt = conn.prepare("SELECT payload FROM session WHERE id = 1")?;
    let payload: Option<String> = stmt.query_row([], |row| row.get(0)).optional()?;
    if let Some(json) = payload {
        if let Ok(mut session) = serde_json::from_str::<Session>(&json) {
            session.saved_at = now_ms;
            save_session(conn, &session)?;
        }
    }
    Ok(())
}

pub fn clear_session(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM session WHERE id = 1", [])?;
    Ok(())
}

/// Restore the persisted session. Fails closed: a parse error or an
/// expired timestamp deletes the row before reporting the reason.
pub fn load_session(
    conn: &Connection,
    now_ms: i64,
    ttl_ms: i64,
) -> std::result::Result<Session, RestoreFailure> {
    let payload: Option<String> = conn
        .prepare("SELECT payload FROM session WHERE id = 1")
        .and_then(|mut stmt| stmt.query_row([], |row| row.get(0)).optional())
        .map_err(|_| RestoreFailure::RestoreError)?;
    let Some(json) = payload else {
        return Err(RestoreFailure::NoSession);
    };
    let session: Session = match serde_json::from_str(&json) {
        Ok(s) => s,
        Err(_) => {
            let _ = clear_session(conn);
            return Err(RestoreFailure::RestoreError);
        }
    };
    if now_ms - session.saved_at > ttl_ms {
        let _ = clear_session(conn);
        return Err(RestoreFailure::SessionExpired);
    }
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    const DAY_MS: i64 = 86_400_000;

    fn session(saved_at: i64) -> Session {
        Session {
            room_code: "ROOMAB12".into(),
            user: Participant {
                name: "ana".into(),
                is_creator: true,
            },
            saved_at,
        }
    }

    #[test]
    fn roundtrip_and_touch() {
        let conn = db::init_db(":memory:").unwrap();
        save_session(&conn, &session(1_000)).unwrap();
        let loaded = load_session(&conn, 2_000, DAY_MS).unwrap();
        assert_eq!(loaded, session(1_000));
        touch_session(&conn, 5_000).unwrap();
        let loaded = load_session(&conn, 6_000, DAY_MS).unwrap();
        assert_eq!(loaded.saved_at, 5_000);
    }

    #[test]
    fn expiry_boundary() {
        let conn = db::init_db(":memory:").unwrap();
        let now = 2 * DAY_MS;
        // 24h + 1s old: expired and cleared
        save_session(&conn, &session(now - DAY_MS - 1_000)).unwrap();
        assert_eq!(
            load_session(&conn, now, DAY_MS),
            Err(RestoreFailure::SessionExpired)
        );
        assert_eq!(
            load_session(&conn, now, DAY_MS),
            Err(RestoreFailure::NoSession)
        );
        // 23h59m old: still valid
        save_session(&conn, &session(now - DAY_MS + 60_000)).unwrap();
        assert!(load_session(&conn, now, DAY_MS).is_ok());
    }

    #[test]
    fn corrupt_payload_fails_closed() {
        let conn = db::init_db(":memory:").unwrap();
        conn.execute("INSERT INTO session (id, payload) VALUES (1, 'not json')", [])
            .unwrap();
        assert_eq!(
            load_session(&conn, 0, DAY_MS),
            Err(RestoreFailure::RestoreError)
        );
        assert_eq!(
            load_session(&conn, 0, DAY_MS),
            Err(RestoreFailure::NoSession)
        );
    }
}
