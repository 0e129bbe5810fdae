//! SQLite 回放存储：多进程共享回放日志与终态标记
//!
//! 连接放在 Mutex 中，所有查询经 spawn_blocking 执行，不阻塞运行时。

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::replay::{ReplayError, ReplayStore, DEFAULT_KEEP_LAST, DEFAULT_TTL};
use super::types::{EventType, ReplayEntry};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS replay_log (
    run_id     TEXT    NOT NULL,
    seq        INTEGER NOT NULL,
    kind       TEXT    NOT NULL,
    payload    TEXT    NOT NULL,
    created_ms INTEGER NOT NULL,
    PRIMARY KEY (run_id, seq)
);
CREATE TABLE IF NOT EXISTS replay_terminal (
    run_id     TEXT PRIMARY KEY,
    kind       TEXT    NOT NULL,
    created_ms INTEGER NOT NULL
);
";

pub struct SqliteReplayStore {
    conn: Arc<Mutex<Connection>>,
    keep_last: usize,
    ttl: Duration,
}

impl SqliteReplayStore {
    pub fn open(path: impl AsRef<Path>, keep_last: usize, ttl: Duration) -> Result<Self, ReplayError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ReplayError::Storage(format!("create {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, keep_last, ttl)
    }

    pub fn open_in_memory() -> Result<Self, ReplayError> {
        Self::with_connection(Connection::open_in_memory()?, DEFAULT_KEEP_LAST, DEFAULT_TTL)
    }

    fn with_connection(conn: Connection, keep_last: usize, ttl: Duration) -> Result<Self, ReplayError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            keep_last: keep_last.max(1),
            ttl,
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, ReplayError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, ReplayError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| ReplayError::Storage(format!("blocking task failed: {e}")))?
    }

    fn cutoff_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() - self.ttl.as_millis() as i64
    }
}

#[async_trait]
impl ReplayStore for SqliteReplayStore {
    async fn append(&self, run_id: &str, entry: ReplayEntry) -> Result<(), ReplayError> {
        let run_id = run_id.to_string();
        let keep_last = self.keep_last as i64;
        let cutoff = self.cutoff_ms();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO replay_log (run_id, seq, kind, payload, created_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run_id,
                    entry.seq as i64,
                    entry.kind.as_str(),
                    entry.payload,
                    chrono::Utc::now().timestamp_millis()
                ],
            )?;
            conn.execute(
                "DELETE FROM replay_log WHERE run_id = ?1 AND (created_ms < ?2 OR seq NOT IN (
                     SELECT seq FROM replay_log WHERE run_id = ?1 ORDER BY seq DESC LIMIT ?3))",
                params![run_id, cutoff, keep_last],
            )?;
            Ok(())
        })
        .await
    }

    async fn replay(
        &self,
        run_id: &str,
        after_seq: Option<u64>,
    ) -> Result<Vec<ReplayEntry>, ReplayError> {
        let run_id = run_id.to_string();
        let after = after_seq.map(|s| s as i64).unwrap_or(-1);
        let cutoff = self.cutoff_ms();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, kind, payload FROM replay_log
                 WHERE run_id = ?1 AND seq > ?2 AND created_ms >= ?3
                 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(params![run_id, after, cutoff], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (seq, kind, payload) = row?;
                let kind = EventType::parse(&kind)
                    .ok_or_else(|| ReplayError::Storage(format!("unknown event kind '{kind}'")))?;
                out.push(ReplayEntry {
                    seq: seq as u64,
                    kind,
                    payload,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn mark_terminal(&self, run_id: &str, kind: EventType) -> Result<bool, ReplayError> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO replay_terminal (run_id, kind, created_ms) VALUES (?1, ?2, ?3)",
                params![run_id, kind.as_str(), chrono::Utc::now().timestamp_millis()],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn is_terminal(&self, run_id: &str) -> Result<bool, ReplayError> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            let found: Option<String> = conn
                .query_row(
                    "SELECT kind FROM replay_terminal WHERE run_id = ?1",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: u64, kind: EventType) -> ReplayEntry {
        ReplayEntry {
            seq,
            kind,
            payload: format!("{{\"seq\":{seq}}}"),
        }
    }

    #[tokio::test]
    async fn test_sqlite_keep_last_and_after_seq() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SqliteReplayStore::open(dir.path().join("replay.db"), 5, DEFAULT_TTL).unwrap();
        for seq in 1..=10 {
            store
                .append("r1", entry(seq, EventType::StageProgress))
                .await
                .unwrap();
        }
        let all = store.replay("r1", None).await.unwrap();
        assert_eq!(all.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![6, 7, 8, 9, 10]);

        let tail = store.replay("r1", Some(8)).await.unwrap();
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![9, 10]);
        assert_eq!(tail[0].payload, "{\"seq\":9}");
    }

    #[tokio::test]
    async fn test_sqlite_terminal_marker() {
        let store = SqliteReplayStore::open_in_memory().unwrap();
        assert!(!store.is_terminal("r1").await.unwrap());
        assert!(store.mark_terminal("r1", EventType::RunFailed).await.unwrap());
        assert!(!store.mark_terminal("r1", EventType::RunCompleted).await.unwrap());
        assert!(store.is_terminal("r1").await.unwrap());
        assert!(!store.is_terminal("r2").await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("replay.db");
        {
            let store = SqliteReplayStore::open(&path, 100, DEFAULT_TTL).unwrap();
            store
                .append("r1", entry(1, EventType::RunStarted))
                .await
                .unwrap();
            store
                .append("r1", entry(2, EventType::RunCompleted))
                .await
                .unwrap();
            store.mark_terminal("r1", EventType::RunCompleted).await.unwrap();
        }
        let store = SqliteReplayStore::open(&path, 100, DEFAULT_TTL).unwrap();
        let all = store.replay("r1", None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[1].is_terminal());
        assert!(store.is_terminal("r1").await.unwrap());
    }
}
