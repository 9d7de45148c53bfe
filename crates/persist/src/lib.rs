//! Fleet persistence: SQLite backend for the resource store.
//! One row per record, JSON values, one transaction per store mutation.

#![forbid(unsafe_code)]

use std::path::Path;
use std::time::Instant;

use anyhow::Context;
use fleet_core::{Error, Kind, Result};
use fleet_store::{Backend, Op};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use rusqlite::OptionalExtension;
use serde_json::Value as Json;
use tracing::{info, warn};

/// SQLite-backed store backend. Synchronous; callers hold the store lock around commits.
pub struct SqliteBackend {
    db: Mutex<rusqlite::Connection>,
}

fn db_err(e: rusqlite::Error) -> Error { Error::Internal(format!("sqlite: {}", e)) }

impl SqliteBackend {
    /// Open the database named by `FLEET_DB_PATH`, or `~/.fleet/fleet.db`.
    pub fn open_default() -> anyhow::Result<Self> {
        let path = std::env::var("FLEET_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let started = Instant::now();
        let path = path.as_ref();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path.display()))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS records (
                kind    TEXT NOT NULL,
                key     TEXT NOT NULL,
                value   BLOB NOT NULL,
                updated INTEGER NOT NULL,
                PRIMARY KEY (kind, key)
            )",
            [],
        )
        .context("creating records table")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(path = %path.display(), "sqlite backend opened");
        Ok(Self { db: Mutex::new(db) })
    }
}

impl Backend for SqliteBackend {
    fn get(&self, kind: Kind, key: &str) -> Result<Option<Json>> {
        let db = self.db.lock();
        let blob: Option<Vec<u8>> = db
            .query_row("SELECT value FROM records WHERE kind = ?1 AND key = ?2", (kind.as_str(), key), |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        Ok(blob.and_then(|b| decode(kind, key, &b)))
    }

    fn list(&self, kind: Kind) -> Result<Vec<(String, Json)>> {
        let started = Instant::now();
        let db = self.db.lock();
        let mut stmt = db.prepare("SELECT key, value FROM records WHERE kind = ?1 ORDER BY key").map_err(db_err)?;
        let mut rows = stmt.query([kind.as_str()]).map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            let key: String = row.get(0).map_err(db_err)?;
            let blob: Vec<u8> = row.get(1).map_err(db_err)?;
            if let Some(v) = decode(kind, &key, &blob) {
                out.push((key, v));
            }
        }
        histogram!("persist_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn commit(&self, ops: &[Op]) -> Result<()> {
        let started = Instant::now();
        let mut db = self.db.lock();
        let tx = db.transaction().map_err(db_err)?;
        let now = chrono::Utc::now().timestamp();
        for op in ops {
            match op {
                Op::Put { kind, key, value } => {
                    let blob = maybe_compress(&serde_json::to_vec(value)?);
                    tx.execute(
                        "INSERT INTO records(kind, key, value, updated) VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(kind, key) DO UPDATE SET value = excluded.value, updated = excluded.updated",
                        (kind.as_str(), key, &blob, now),
                    )
                    .map_err(db_err)?;
                }
                Op::Delete { kind, key } => {
                    tx.execute("DELETE FROM records WHERE kind = ?1 AND key = ?2", (kind.as_str(), key))
                        .map_err(db_err)?;
                }
            }
        }
        tx.commit().map_err(db_err)?;
        histogram!("persist_commit_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_ops_total", ops.len() as u64);
        Ok(())
    }

    fn name(&self) -> &'static str { "sqlite" }
}

fn decode(kind: Kind, key: &str, blob: &[u8]) -> Option<Json> {
    match serde_json::from_slice::<Json>(&maybe_decompress(blob)) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(%kind, key, error = %e, "undecodable row; skipped");
            counter!("persist_decode_errors_total", 1u64);
            None
        }
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".fleet");
        let _ = std::fs::create_dir_all(&p);
        p.push("fleet.db");
        return p.to_string_lossy().to_string();
    }
    "fleet.db".to_string()
}

fn maybe_compress(bytes: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("FLEET_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        if let Ok(z) = zstd::encode_all(bytes, lvl) {
            return z;
        }
    }
    bytes.to_vec()
}

fn maybe_decompress(blob: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return de;
        }
    }
    blob.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commit_is_transactional_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let b = SqliteBackend::open(dir.path().join("t.db")).unwrap();
        b.commit(&[
            Op::Put { kind: Kind::Source, key: "b".into(), value: json!({"n": 1}) },
            Op::Put { kind: Kind::Source, key: "a".into(), value: json!({"n": 0}) },
        ])
        .unwrap();
        b.commit(&[Op::Put { kind: Kind::Source, key: "b".into(), value: json!({"n": 2}) }]).unwrap();
        let rows = b.list(Kind::Source).unwrap();
        assert_eq!(rows, vec![("a".to_string(), json!({"n": 0})), ("b".to_string(), json!({"n": 2}))]);
        b.commit(&[Op::Delete { kind: Kind::Source, key: "a".into() }]).unwrap();
        assert_eq!(b.get(Kind::Source, "a").unwrap(), None);
        assert!(b.list(Kind::Agent).unwrap().is_empty());
    }

    #[test]
    fn garbage_rows_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let b = SqliteBackend::open(dir.path().join("t.db")).unwrap();
        b.db.lock()
            .execute(
                "INSERT INTO records(kind, key, value, updated) VALUES ('Agent', 'x', X'00FF', 0)",
                [],
            )
            .unwrap();
        b.commit(&[Op::Put { kind: Kind::Agent, key: "y".into(), value: json!({"id": "y"}) }]).unwrap();
        let keys: Vec<String> = b.list(Kind::Agent).unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["y"]);
        assert_eq!(b.get(Kind::Agent, "x").unwrap(), None);
    }
}
