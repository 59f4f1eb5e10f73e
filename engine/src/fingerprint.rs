use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Fetch the per-device identifier, minting and persisting one on first
/// use. This is a soft identity: it scopes votes and authorship, nothing
/// more.
pub fn device_id(conn: &Connection, now_ms: i64) -> Result<String> {
    let mut stmt = conn.prepare("SELECT device_id FROM device WHERE id = 1")?;
    if let Some(id) = stmt.query_row([], |row| row.get::<_, String>(0)).optional()? {
        return Ok(id);
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO device (id, device_id, created_at) VALUES (1, ?1, ?2)",
        params![id, now_ms],
    )?;
    Ok(id)
}

/// Short shareable digest of the device id.
pub fn fingerprint(device_id: &str) -> String {
    let digest = Sha256::digest(device_id.as_bytes());
    let mut encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded.truncate(16);
    encoded
}
