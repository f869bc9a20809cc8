//! Relay-side device registry.
//!
//! The only durable state the relay keeps: which devices belong to which
//! vault group, their display names, tokens, and liveness timestamps.
//! Ciphertext is never written here.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use crate::error::Result;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS devices (
    device_id     TEXT NOT NULL,
    vault_id      TEXT NOT NULL,
    device_name   TEXT NOT NULL,
    device_token  TEXT NOT NULL,
    first_seen_ms INTEGER NOT NULL,
    last_seen_ms  INTEGER NOT NULL,
    PRIMARY KEY (device_id, vault_id)
);
CREATE INDEX IF NOT EXISTS idx_devices_vault ON devices(vault_id);

CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
";

/// One registered device, as the relay sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub device_id: String,
    pub vault_id: String,
    pub device_name: String,
    pub device_token: String,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
}

pub struct DeviceRegistry {
    conn: Mutex<Connection>,
}

impl DeviceRegistry {
    /// Open the registry database, or an in-memory one when no path is
    /// configured (state then lives only as long as the process).
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let conn = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let _mode: String =
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        Ok(DeviceRegistry {
            conn: Mutex::new(conn),
        })
    }

    /// The HMAC secret used for minting device tokens. Created once and
    /// persisted so tokens survive relay restarts.
    pub fn server_secret(&self) -> Result<Vec<u8>> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'server_secret'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(secret) = existing {
            return Ok(secret);
        }
        let secret = crate::crypto::generate_server_secret();
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('server_secret', ?1)",
            params![secret],
        )?;
        Ok(secret)
    }

    /// Insert or refresh a device row. Re-registering updates the name,
    /// token, and last-seen; first-seen is preserved.
    pub fn upsert_device(
        &self,
        device_id: &str,
        vault_id: &str,
        device_name: &str,
        device_token: &str,
        now_ms: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO devices \
             (device_id, vault_id, device_name, device_token, first_seen_ms, last_seen_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
             ON CONFLICT(device_id, vault_id) DO UPDATE SET \
               device_name = excluded.device_name, \
               device_token = excluded.device_token, \
               last_seen_ms = excluded.last_seen_ms",
            params![device_id, vault_id, device_name, device_token, now_ms],
        )?;
        Ok(())
    }

    pub fn touch_last_seen(&self, device_id: &str, vault_id: &str, now_ms: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE devices SET last_seen_ms = ?3 WHERE device_id = ?1 AND vault_id = ?2",
            params![device_id, vault_id, now_ms],
        )?;
        Ok(())
    }

    pub fn is_registered(&self, device_id: &str, vault_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM devices WHERE device_id = ?1 AND vault_id = ?2",
                params![device_id, vault_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Materialized vault-group size.
    pub fn device_count(&self, vault_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM devices WHERE vault_id = ?1",
            params![vault_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn devices_in_vault(&self, vault_id: &str) -> Result<Vec<DeviceRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT device_id, vault_id, device_name, device_token, first_seen_ms, last_seen_ms \
             FROM devices WHERE vault_id = ?1 ORDER BY device_id",
        )?;
        let rows = stmt.query_map(params![vault_id], |row| {
            Ok(DeviceRecord {
                device_id: row.get(0)?,
                vault_id: row.get(1)?,
                device_name: row.get(2)?,
                device_token: row.get(3)?,
                first_seen_ms: row.get(4)?,
                last_seen_ms: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Force pending WAL frames into the main database file. Called during
    /// graceful shutdown. The checkpoint pragma returns a status row, so it
    /// goes through query_row.
    pub fn flush(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }
}
