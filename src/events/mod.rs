//! 事件层：SSE 事件、发射器、回放存储（内存 / SQLite）与可续传流

pub mod emitter;
pub mod replay;
pub mod sqlite;
pub mod stream;
pub mod types;

use std::sync::Arc;

pub use emitter::{EventBus, EventEmitter};
pub use replay::{InMemoryReplayStore, ReplayError, ReplayStore};
pub use sqlite::SqliteReplayStore;
pub use stream::resumable_stream;
pub use types::{EventType, ReplayEntry, SseEvent};

use crate::config::{ReplayBackend, ReplaySection};

/// 按 [replay] 配置创建回放存储
pub fn create_replay_store(section: &ReplaySection) -> Result<Arc<dyn ReplayStore>, ReplayError> {
    let ttl = std::time::Duration::from_secs(section.ttl_seconds);
    match section.backend {
        ReplayBackend::Memory => Ok(Arc::new(InMemoryReplayStore::new(section.keep_last, ttl))),
        ReplayBackend::Sqlite => {
            tracing::info!(path = %section.sqlite_path.display(), "using sqlite replay store");
            Ok(Arc::new(SqliteReplayStore::open(
                &section.sqlite_path,
                section.keep_last,
                ttl,
            )?))
        }
    }
}
