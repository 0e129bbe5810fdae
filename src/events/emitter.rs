//! 事件发射器：每个 run 一个递增 seq，先写回放存储再广播给实时订阅者
//!
//! 递增、写存储、广播在同一把异步锁内完成，因此 seq 无缺口且实时流与存储顺序一致。
//! 终态事件先经 mark_terminal 裁决，输家的事件被丢弃且不消耗 seq。

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{broadcast, Mutex as AsyncMutex};

use super::replay::ReplayStore;
use super::types::{EventType, ReplayEntry, SseEvent};

const LIVE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct EmitterState {
    seq: u64,
    terminated: bool,
}

/// 单个 run 的事件发射器
pub struct EventEmitter {
    run_id: String,
    state: AsyncMutex<EmitterState>,
    live: broadcast::Sender<ReplayEntry>,
    store: Arc<dyn ReplayStore>,
}

impl EventEmitter {
    pub fn new(run_id: impl Into<String>, store: Arc<dyn ReplayStore>) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            run_id: run_id.into(),
            state: AsyncMutex::new(EmitterState::default()),
            live,
            store,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn store(&self) -> Arc<dyn ReplayStore> {
        Arc::clone(&self.store)
    }

    /// 订阅之后发出的实时条目
    pub fn subscribe(&self) -> broadcast::Receiver<ReplayEntry> {
        self.live.subscribe()
    }

    /// 已分配的最大 seq
    pub async fn last_seq(&self) -> u64 {
        self.state.lock().await.seq
    }

    /// 发出一条非终态事件；run 已终结时返回 None
    pub async fn emit(
        &self,
        event_type: EventType,
        stage: Option<&str>,
        payload: Value,
    ) -> Option<SseEvent> {
        if event_type.is_terminal() {
            return self.emit_terminal(event_type, stage, payload).await;
        }
        let mut state = self.state.lock().await;
        if state.terminated {
            tracing::debug!(run_id = %self.run_id, event = %event_type, "event dropped after terminal");
            return None;
        }
        Some(self.publish(&mut state, event_type, stage, payload).await)
    }

    /// 发出终态事件；只有赢得 mark_terminal 的调用者真正发出
    pub async fn emit_terminal(
        &self,
        event_type: EventType,
        stage: Option<&str>,
        payload: Value,
    ) -> Option<SseEvent> {
        let mut state = self.state.lock().await;
        if state.terminated {
            return None;
        }
        match self.store.mark_terminal(&self.run_id, event_type).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(run_id = %self.run_id, event = %event_type, "terminal event suppressed");
                state.terminated = true;
                return None;
            }
            // 存储不可用时仍以本地状态为准发出终态
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, error = %e, "mark_terminal failed");
            }
        }
        state.terminated = true;
        Some(self.publish(&mut state, event_type, stage, payload).await)
    }

    async fn publish(
        &self,
        state: &mut EmitterState,
        event_type: EventType,
        stage: Option<&str>,
        payload: Value,
    ) -> SseEvent {
        state.seq += 1;
        let event = SseEvent {
            run_id: self.run_id.clone(),
            seq: state.seq,
            event_type,
            stage: stage.map(str::to_string),
            payload,
            ts: chrono::Utc::now().timestamp_millis(),
        };

        match ReplayEntry::from_event(&event) {
            Ok(entry) => {
                if let Err(e) = self.store.append(&self.run_id, entry.clone()).await {
                    tracing::warn!(run_id = %self.run_id, seq = event.seq, error = %e, "replay append failed");
                }
                // 无订阅者时 send 返回 Err，忽略即可
                let _ = self.live.send(entry);
            }
            Err(e) => {
                tracing::error!(run_id = %self.run_id, seq = event.seq, error = %e, "event serialization failed");
            }
        }
        event
    }
}

/// 进程内 run_id → 发射器注册表，供 HTTP 层按 run 订阅
pub struct EventBus {
    store: Arc<dyn ReplayStore>,
    emitters: Mutex<HashMap<String, Arc<EventEmitter>>>,
}

impl EventBus {
    pub fn new(store: Arc<dyn ReplayStore>) -> Self {
        Self {
            store,
            emitters: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<EventEmitter>>> {
        self.emitters.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn store(&self) -> Arc<dyn ReplayStore> {
        Arc::clone(&self.store)
    }

    /// 获取或创建 run 的发射器
    pub fn emitter(&self, run_id: &str) -> Arc<EventEmitter> {
        let mut map = self.lock();
        Arc::clone(
            map.entry(run_id.to_string())
                .or_insert_with(|| Arc::new(EventEmitter::new(run_id, Arc::clone(&self.store)))),
        )
    }

    /// 仅当 run 尚无发射器时注册新的；已存在返回 None
    pub fn register(&self, run_id: &str) -> Option<Arc<EventEmitter>> {
        match self.lock().entry(run_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let emitter = Arc::new(EventEmitter::new(run_id, Arc::clone(&self.store)));
                Some(Arc::clone(slot.insert(emitter)))
            }
        }
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<EventEmitter>> {
        self.lock().get(run_id).cloned()
    }

    pub fn subscribe(&self, run_id: &str) -> Option<broadcast::Receiver<ReplayEntry>> {
        self.get(run_id).map(|e| e.subscribe())
    }

    /// run 结束后注销；已订阅的接收端在发射器释放后收到 Closed
    pub fn remove(&self, run_id: &str) {
        self.lock().remove(run_id);
    }

    pub fn active_runs(&self) -> usize {
        self.lock().len()
    }
}
