use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;

/// Open the fallback database and run migrations.
pub fn init_db<P: AsRef<Path>>(path: P) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS room_snapshots (
  code TEXT PRIMARY KEY,
  payload TEXT NOT NULL,
  saved_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS user_votes (
  room_code TEXT NOT NULL,
  message_id INTEGER NOT NULL,
  vote TEXT NOT NULL,
  PRIMARY KEY (room_code, message_id)
);

CREATE TABLE IF NOT EXISTS session (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  payload TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS device (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  device_id TEXT NOT NULL,
  created_at INTEGER NOT NULL
);
"#;
