//! Shared key-value store.
//!
//! Health sample windows, router caches, and sync locks all go through this
//! trait so tests can run against the in-memory implementation. The durable
//! implementation keeps sorted-set windows in SQLite and trims them with
//! native range deletes.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;

    /// Append `member` with `score` (callers use millisecond timestamps).
    fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()>;
    /// Members with `min_score <= score <= max_score`, ascending.
    fn zrange(&self, key: &str, min_score: f64, max_score: f64) -> Result<Vec<String>>;
    /// Range delete; the native trim for sliding windows.
    fn zremrange(&self, key: &str, min_score: f64, max_score: f64) -> Result<()>;
    /// Keep only the `max_len` highest-scored members.
    fn ztrim_to(&self, key: &str, max_len: usize) -> Result<()>;

    /// Best-effort lock with expiry; returns whether this caller won it.
    fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool>;
    fn unlock(&self, key: &str) -> Result<()>;
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

const KV_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS kv (
    k TEXT PRIMARY KEY,
    v TEXT NOT NULL,
    expires_at INTEGER
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS kv_zset (
    k TEXT NOT NULL,
    score REAL NOT NULL,
    member TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_kv_zset_key_score ON kv_zset(k, score);
"#;

/// SQLite-backed store shared by every component in the process.
pub struct SqliteKv {
    conn: Mutex<Connection>,
}

impl SqliteKv {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening kv store at {}", path.display()))?;
        conn.execute_batch(KV_SCHEMA).context("applying kv schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory kv store")?;
        conn.execute_batch(KV_SCHEMA).context("applying kv schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let row: Option<(String, Option<i64>)> = conn
            .query_row(
                "SELECT v, expires_at FROM kv WHERE k = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("kv get")?;
        match row {
            Some((_, Some(expires))) if expires <= now_ms() => {
                conn.execute("DELETE FROM kv WHERE k = ?1", params![key])
                    .context("kv expire")?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires = ttl.map(|d| now_ms() + d.as_millis() as i64);
        self.conn
            .lock()
            .execute(
                "INSERT INTO kv (k, v, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(k) DO UPDATE SET v = excluded.v, expires_at = excluded.expires_at",
                params![key, value, expires],
            )
            .context("kv set")?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM kv WHERE k = ?1", params![key])
            .context("kv delete")?;
        Ok(())
    }

    fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO kv_zset (k, score, member) VALUES (?1, ?2, ?3)",
                params![key, score, member],
            )
            .context("kv zadd")?;
        Ok(())
    }

    fn zrange(&self, key: &str, min_score: f64, max_score: f64) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT member FROM kv_zset
                 WHERE k = ?1 AND score >= ?2 AND score <= ?3 ORDER BY score ASC",
            )
            .context("kv zrange prepare")?;
        let members = stmt
            .query_map(params![key, min_score, max_score], |row| row.get(0))
            .context("kv zrange")?
            .collect::<rusqlite::Result<Vec<String>>>()
            .context("kv zrange rows")?;
        Ok(members)
    }

    fn zremrange(&self, key: &str, min_score: f64, max_score: f64) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM kv_zset WHERE k = ?1 AND score >= ?2 AND score <= ?3",
                params![key, min_score, max_score],
            )
            .context("kv zremrange")?;
        Ok(())
    }

    fn ztrim_to(&self, key: &str, max_len: usize) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM kv_zset WHERE k = ?1 AND rowid NOT IN (
                     SELECT rowid FROM kv_zset WHERE k = ?1
                     ORDER BY score DESC LIMIT ?2
                 )",
                params![key, max_len as i64],
            )
            .context("kv ztrim")?;
        Ok(())
    }

    fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM kv WHERE k = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
            params![key, now_ms()],
        )
        .context("kv lock sweep")?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO kv (k, v, expires_at) VALUES (?1, 'locked', ?2)",
                params![key, now_ms() + ttl.as_millis() as i64],
            )
            .context("kv lock insert")?;
        Ok(inserted == 1)
    }

    fn unlock(&self, key: &str) -> Result<()> {
        self.delete(key)
    }
}

#[derive(Default)]
struct MemoryInner {
    kv: HashMap<String, (String, Option<i64>)>,
    zsets: HashMap<String, Vec<(f64, String)>>,
}

/// In-memory store for tests and single-process fallback.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<MemoryInner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        match inner.kv.get(key) {
            Some((_, Some(expires))) if *expires <= now_ms() => {
                inner.kv.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires = ttl.map(|d| now_ms() + d.as_millis() as i64);
        self.inner
            .lock()
            .kv
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.lock().kv.remove(key);
        Ok(())
    }

    fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let set = inner.zsets.entry(key.to_string()).or_default();
        set.push((score, member.to_string()));
        set.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(())
    }

    fn zrange(&self, key: &str, min_score: f64, max_score: f64) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .zsets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(score, _)| *score >= min_score && *score <= max_score)
                    .map(|(_, member)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn zremrange(&self, key: &str, min_score: f64, max_score: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(set) = inner.zsets.get_mut(key) {
            set.retain(|(score, _)| *score < min_score || *score > max_score);
        }
        Ok(())
    }

    fn ztrim_to(&self, key: &str, max_len: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(set) = inner.zsets.get_mut(key) {
            if set.len() > max_len {
                let drop = set.len() - max_len;
                set.drain(..drop);
            }
        }
        Ok(())
    }

    fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock();
        let now = now_ms();
        if let Some((_, Some(expires))) = inner.kv.get(key) {
            if *expires <= now {
                inner.kv.remove(key);
            }
        }
        if inner.kv.contains_key(key) {
            return Ok(false);
        }
        inner.kv.insert(
            key.to_string(),
            ("locked".to_string(), Some(now + ttl.as_millis() as i64)),
        );
        Ok(true)
    }

    fn unlock(&self, key: &str) -> Result<()> {
        self.delete(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> Vec<Box<dyn KvStore>> {
        vec![
            Box::new(MemoryKv::new()),
            Box::new(SqliteKv::open_in_memory().unwrap()),
        ]
    }

    #[test]
    fn get_set_delete() {
        for store in stores() {
            store.set("a", "1", None).unwrap();
            assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
            store.delete("a").unwrap();
            assert_eq!(store.get("a").unwrap(), None);
        }
    }

    #[test]
    fn ttl_expiry() {
        for store in stores() {
            store
                .set("t", "1", Some(Duration::from_millis(0)))
                .unwrap();
            assert_eq!(store.get("t").unwrap(), None);
        }
    }

    #[test]
    fn zset_window_operations() {
        for store in stores() {
            for i in 0..10 {
                store.zadd("w", i as f64, &format!("m{}", i)).unwrap();
            }
            assert_eq!(store.zrange("w", 3.0, 5.0).unwrap().len(), 3);
            store.zremrange("w", 0.0, 4.0).unwrap();
            assert_eq!(store.zrange("w", 0.0, 100.0).unwrap().len(), 5);
            store.ztrim_to("w", 2).unwrap();
            let rest = store.zrange("w", 0.0, 100.0).unwrap();
            assert_eq!(rest, vec!["m8".to_string(), "m9".to_string()]);
        }
    }

    #[test]
    fn lock_is_exclusive_until_released() {
        for store in stores() {
            assert!(store.try_lock("l", Duration::from_secs(30)).unwrap());
            assert!(!store.try_lock("l", Duration::from_secs(30)).unwrap());
            store.unlock("l").unwrap();
            assert!(store.try_lock("l", Duration::from_secs(30)).unwrap());
        }
    }

    #[test]
    fn expired_lock_can_be_retaken() {
        for store in stores() {
            assert!(store.try_lock("l", Duration::from_millis(0)).unwrap());
            assert!(store.try_lock("l", Duration::from_secs(30)).unwrap());
        }
    }
}
