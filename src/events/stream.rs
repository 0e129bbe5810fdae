//! 可续传事件流：先订阅实时通道，再回放 after_seq 之后的存储日志，最后转发 seq 更大的实时条目
//!
//! 发射器在广播之前已写入存储，所以"订阅 → 回放"之间不会漏掉条目；按 seq 去重避免重复。
//! 终态事件送出后流结束。

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::stream::{self, Stream};
use tokio::sync::broadcast;

use super::replay::ReplayStore;
use super::types::ReplayEntry;

struct ResumeState {
    store: Arc<dyn ReplayStore>,
    live: Option<broadcast::Receiver<ReplayEntry>>,
    run_id: String,
    backlog: VecDeque<ReplayEntry>,
    last_seq: u64,
    loaded: bool,
    done: bool,
}

impl ResumeState {
    async fn refill(&mut self) {
        self.loaded = true;
        // seq 从 1 开始，after_seq = 0 等价于全部回放
        match self.store.replay(&self.run_id, Some(self.last_seq)).await {
            Ok(entries) => {
                self.backlog = entries
                    .into_iter()
                    .filter(|e| e.seq > self.last_seq)
                    .collect();
            }
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, error = %e, "replay read failed");
            }
        }
    }

    fn take(&mut self, entry: ReplayEntry) -> ReplayEntry {
        self.last_seq = entry.seq;
        if entry.is_terminal() {
            self.done = true;
        }
        entry
    }
}

/// 构造续传流；live 为 None 表示 run 不在本进程活跃，只回放存储
pub fn resumable_stream(
    store: Arc<dyn ReplayStore>,
    live: Option<broadcast::Receiver<ReplayEntry>>,
    run_id: String,
    after_seq: Option<u64>,
) -> impl Stream<Item = ReplayEntry> + Send + 'static {
    let state = ResumeState {
        store,
        live,
        run_id,
        backlog: VecDeque::new(),
        last_seq: after_seq.unwrap_or(0),
        loaded: false,
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        if !st.loaded {
            st.refill().await;
        }
        if let Some(entry) = st.backlog.pop_front() {
            let entry = st.take(entry);
            return Some((entry, st));
        }

        loop {
            let received = match st.live.as_mut() {
                Some(rx) => rx.recv().await,
                None => return None,
            };
            match received {
                Ok(entry) if entry.seq > st.last_seq => {
                    let entry = st.take(entry);
                    return Some((entry, st));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(run_id = %st.run_id, skipped, "live stream lagged, refilling from replay");
                    st.refill().await;
                    if let Some(entry) = st.backlog.pop_front() {
                        let entry = st.take(entry);
                        return Some((entry, st));
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::emitter::EventEmitter;
    use crate::events::replay::InMemoryReplayStore;
    use crate::events::types::EventType;
    use futures_util::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_replay_then_live_until_terminal() {
        let store: Arc<dyn ReplayStore> = Arc::new(InMemoryReplayStore::default());
        let emitter = Arc::new(EventEmitter::new("r1", Arc::clone(&store)));
        for _ in 0..5 {
            emitter.emit(EventType::StageProgress, None, json!({})).await;
        }

        let stream = resumable_stream(Arc::clone(&store), Some(emitter.subscribe()), "r1".to_string(), Some(3));

        let producer = {
            let emitter = Arc::clone(&emitter);
            tokio::spawn(async move {
                emitter.emit(EventType::StageProgress, None, json!({})).await;
                emitter.emit(EventType::RunCompleted, None, json!({})).await;
            })
        };

        let seqs: Vec<u64> = stream.map(|e| e.seq).collect().await;
        producer.await.unwrap();
        assert_eq!(seqs, vec![4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn test_finished_run_replays_only() {
        let store: Arc<dyn ReplayStore> = Arc::new(InMemoryReplayStore::default());
        let emitter = EventEmitter::new("r1", Arc::clone(&store));
        emitter.emit(EventType::RunStarted, None, json!({})).await;
        emitter.emit(EventType::RunFailed, None, json!({"error": "x"})).await;

        let entries: Vec<ReplayEntry> = resumable_stream(Arc::clone(&store), None, "r1".to_string(), None)
            .collect()
            .await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].kind, EventType::RunFailed);
    }

    #[tokio::test]
    async fn test_no_duplicates_when_live_overlaps_replay() {
        let store: Arc<dyn ReplayStore> = Arc::new(InMemoryReplayStore::default());
        let emitter = EventEmitter::new("r1", Arc::clone(&store));
        let rx = emitter.subscribe();
        // 这些条目同时在存储与实时通道中
        emitter.emit(EventType::RunStarted, None, json!({})).await;
        emitter.emit(EventType::StageStarted, Some("planner"), json!({})).await;
        emitter.emit(EventType::RunCompleted, None, json!({})).await;

        let seqs: Vec<u64> = resumable_stream(Arc::clone(&store), Some(rx), "r1".to_string(), None)
            .map(|e| e.seq)
            .collect()
            .await;
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}
