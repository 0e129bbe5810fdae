//! 回放存储：按 run 追加 (seq, payload)，支持 after_seq 续传与终态标记
//!
//! 日志只保留最近 keep_last 条，条目超过 ttl 后过期。mark_terminal 对同一 run 只成功一次。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::types::{EventType, ReplayEntry};

pub const DEFAULT_KEEP_LAST: usize = 100;
pub const DEFAULT_TTL: Duration = Duration::from_secs(1800);

#[derive(thiserror::Error, Debug)]
pub enum ReplayError {
    #[error("Replay storage error: {0}")]
    Storage(String),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 回放存储后端，所有 run 共享同一实例
#[async_trait]
pub trait ReplayStore: Send + Sync {
    async fn append(&self, run_id: &str, entry: ReplayEntry) -> Result<(), ReplayError>;

    /// seq > after_seq 的条目（after_seq 为 None 时全部），按 seq 升序
    async fn replay(
        &self,
        run_id: &str,
        after_seq: Option<u64>,
    ) -> Result<Vec<ReplayEntry>, ReplayError>;

    /// 首次调用返回 true，之后对同一 run 均返回 false
    async fn mark_terminal(&self, run_id: &str, kind: EventType) -> Result<bool, ReplayError>;

    async fn is_terminal(&self, run_id: &str) -> Result<bool, ReplayError>;
}

#[derive(Debug)]
struct RunLog {
    entries: VecDeque<(ReplayEntry, Instant)>,
    terminal: Option<EventType>,
    last_write: Instant,
}

impl RunLog {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            terminal: None,
            last_write: Instant::now(),
        }
    }
}

/// 进程内回放存储
///
/// 条目过期后，整个 run（含终态标记）在最后一次写入超过 ttl 时被清除；append 时按 ttl/10 的间隔顺带清理。
#[derive(Debug)]
pub struct InMemoryReplayStore {
    keep_last: usize,
    ttl: Duration,
    runs: Mutex<HashMap<String, RunLog>>,
    last_sweep: Mutex<Instant>,
}

impl Default for InMemoryReplayStore {
    fn default() -> Self {
        Self::new(DEFAULT_KEEP_LAST, DEFAULT_TTL)
    }
}

impl InMemoryReplayStore {
    pub fn new(keep_last: usize, ttl: Duration) -> Self {
        Self {
            keep_last: keep_last.max(1),
            ttl,
            runs: Mutex::new(HashMap::new()),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunLog>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn prune(&self, log: &mut RunLog) {
        let ttl = self.ttl;
        log.entries.retain(|(_, at)| at.elapsed() < ttl);
        while log.entries.len() > self.keep_last {
            log.entries.pop_front();
        }
    }

    fn sweep_runs(&self, runs: &mut HashMap<String, RunLog>) -> usize {
        let before = runs.len();
        runs.retain(|_, log| {
            self.prune(log);
            !log.entries.is_empty() || log.last_write.elapsed() < self.ttl
        });
        *self.last_sweep.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        before - runs.len()
    }

    fn sweep_due(&self) -> bool {
        let last = *self.last_sweep.lock().unwrap_or_else(|e| e.into_inner());
        last.elapsed() >= self.ttl / 10
    }

    /// 清除已全部过期的 run，返回清除数量
    pub fn sweep(&self) -> usize {
        let mut runs = self.lock();
        self.sweep_runs(&mut runs)
    }

    /// 当前保存日志的 run 数
    pub fn run_count(&self) -> usize {
        self.lock().len()
    }
}

#[async_trait]
impl ReplayStore for InMemoryReplayStore {
    async fn append(&self, run_id: &str, entry: ReplayEntry) -> Result<(), ReplayError> {
        let mut runs = self.lock();
        if self.sweep_due() {
            let removed = self.sweep_runs(&mut runs);
            if removed > 0 {
                tracing::debug!(removed, "expired replay logs removed");
            }
        }
        let log = runs.entry(run_id.to_string()).or_insert_with(RunLog::new);
        log.last_write = Instant::now();
        // 并发写入可能乱序到达，按 seq 插入
        let pos = log
            .entries
            .iter()
            .rposition(|(e, _)| e.seq < entry.seq)
            .map_or(0, |i| i + 1);
        if log.entries.get(pos).is_some_and(|(e, _)| e.seq == entry.seq) {
            return Ok(());
        }
        log.entries.insert(pos, (entry, Instant::now()));
        self.prune(log);
        Ok(())
    }

    async fn replay(
        &self,
        run_id: &str,
        after_seq: Option<u64>,
    ) -> Result<Vec<ReplayEntry>, ReplayError> {
        let mut runs = self.lock();
        let Some(log) = runs.get_mut(run_id) else {
            return Ok(Vec::new());
        };
        self.prune(log);
        let after = after_seq.unwrap_or(0);
        Ok(log
            .entries
            .iter()
            .filter(|(e, _)| after_seq.is_none() || e.seq > after)
            .map(|(e, _)| e.clone())
            .collect())
    }

    async fn mark_terminal(&self, run_id: &str, kind: EventType) -> Result<bool, ReplayError> {
        let mut runs = self.lock();
        let log = runs.entry(run_id.to_string()).or_insert_with(RunLog::new);
        if log.terminal.is_some() {
            return Ok(false);
        }
        log.terminal = Some(kind);
        log.last_write = Instant::now();
        Ok(true)
    }

    async fn is_terminal(&self, run_id: &str) -> Result<bool, ReplayError> {
        Ok(self
            .lock()
            .get(run_id)
            .is_some_and(|log| log.terminal.is_some()))
    }
}
