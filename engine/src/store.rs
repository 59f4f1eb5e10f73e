use std::sync::Arc;

use anyhow::Result;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use sync_api::{ChatBackend, Room};
use tracing::warn;

use crate::{rooms, session};

/// Persistence of rooms: remote store when reachable, rusqlite snapshot
/// otherwise. Remote failures degrade silently; callers only learn about
/// them through the connection-status channel.
#[derive(Clone)]
pub struct RoomStore {
    backend: Option<Arc<dyn ChatBackend>>,
    pool: Pool<SqliteConnectionManager>,
}

impl RoomStore {
    pub fn new(backend: Option<Arc<dyn ChatBackend>>, pool: Pool<SqliteConnectionManager>) -> Self {
        Self { backend, pool }
    }

    pub fn backend(&self) -> Option<&Arc<dyn ChatBackend>> {
        self.backend.as_ref()
    }

    /// Persist a freshly created room. The snapshot is written first so
    /// the room survives even if the remote create fails.
    pub async fn create(&self, room: &Room, now_ms: i64) -> Result<Room> {
        let conn = self.pool.get()?;
        rooms::save_snapshot(&conn, room, now_ms)?;
        drop(conn);
        if let Some(backend) = &self.backend {
            match backend.create_room(room).await {
                Ok(stored) => return Ok(stored),
                Err(e) => warn!(code = %room.code, error = %e, "remote create failed, room kept locally"),
            }
        }
        Ok(room.clone())
    }

    /// Upsert the room, remote best-effort. Also refreshes the session
    /// timestamp: every save is user activity.
    pub async fn save(&self, room: &Room, now_ms: i64) -> Result<()> {
        let conn = self.pool.get()?;
        rooms::save_snapshot(&conn, room, now_ms)?;
        session::touch_session(&conn, now_ms)?;
        drop(conn);
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.save_room(room).await {
                warn!(code = %room.code, error = %e, "remote save failed, snapshot only");
            }
        }
        Ok(())
    }

    /// Persist the snapshot and refresh the session without touching the
    /// remote store. Used when the remote copy is already authoritative
    /// (inbound messages) or mutated through a dedicated atomic call
    /// (votes); re-upserting the full room from a lagging local copy
    /// could erase concurrent writers.
    pub fn save_local(&self, room: &Room, now_ms: i64) -> Result<()> {
        let conn = self.pool.get()?;
        rooms::save_snapshot(&conn, room, now_ms)?;
        session::touch_session(&conn, now_ms)?;
        Ok(())
    }

    /// Load a room, remote first, snapshot second.
    pub async fn load(&self, code: &str) -> Result<Option<Room>> {
        if let Some(backend) = &self.backend {
            match backend.fetch_room(code).await {
                Ok(Some(room)) => return Ok(Some(room)),
                Ok(None) => {}
                Err(e) => warn!(code = %code, error = %e, "remote load failed, trying snapshot"),
            }
        }
        let conn = self.pool.get()?;
        rooms::load_snapshot(&conn, code)
    }
}
