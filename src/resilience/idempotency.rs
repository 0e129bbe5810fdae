//! 幂等守卫：同一 key 在进行中时拒绝重复获取；完成后在 TTL 内缓存结果
//!
//! 缓存条目超过容量时按完成时间淘汰最旧的；过期条目在访问时惰性清理。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug)]
enum Slot<T> {
    InProgress,
    Done { result: T, completed_at: Instant },
}

#[derive(Debug)]
pub struct IdempotencyGuard<T> {
    ttl: Duration,
    capacity: usize,
    slots: Mutex<HashMap<String, Slot<T>>>,
}

impl<T: Clone> Default for IdempotencyGuard<T> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }
}

impl<T: Clone> IdempotencyGuard<T> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot<T>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_expired(&self, completed_at: Instant) -> bool {
        completed_at.elapsed() >= self.ttl
    }

    /// 成功获取返回 true；key 正在进行或已有未过期结果时返回 false
    pub fn try_acquire(&self, key: &str) -> bool {
        let mut slots = self.lock();
        match slots.get(key) {
            Some(Slot::InProgress) => false,
            Some(Slot::Done { completed_at, .. }) if !self.is_expired(*completed_at) => false,
            _ => {
                slots.insert(key.to_string(), Slot::InProgress);
                true
            }
        }
    }

    /// 记录结果；超出容量时淘汰最旧的已完成条目
    pub fn complete(&self, key: &str, result: T) {
        let mut slots = self.lock();
        slots.insert(
            key.to_string(),
            Slot::Done {
                result,
                completed_at: Instant::now(),
            },
        );

        loop {
            let mut done = 0usize;
            let mut oldest: Option<(&String, Instant)> = None;
            for (k, slot) in slots.iter() {
                if let Slot::Done { completed_at, .. } = slot {
                    done += 1;
                    if oldest.map_or(true, |(_, t)| *completed_at < t) {
                        oldest = Some((k, *completed_at));
                    }
                }
            }
            if done <= self.capacity {
                break;
            }
            let Some((victim, _)) = oldest else { break };
            let victim = victim.clone();
            tracing::debug!(key = %victim, "idempotency cache evicted oldest entry");
            slots.remove(&victim);
        }
    }

    /// 失败时释放 key，允许重新获取；已完成的条目不受影响
    pub fn fail(&self, key: &str) {
        let mut slots = self.lock();
        if matches!(slots.get(key), Some(Slot::InProgress)) {
            slots.remove(key);
        }
    }

    /// 未过期的缓存结果
    pub fn get_result(&self, key: &str) -> Option<T> {
        let mut slots = self.lock();
        match slots.get(key) {
            Some(Slot::Done {
                result,
                completed_at,
            }) => {
                if self.is_expired(*completed_at) {
                    slots.remove(key);
                    None
                } else {
                    Some(result.clone())
                }
            }
            _ => None,
        }
    }

    pub fn is_in_progress(&self, key: &str) -> bool {
        matches!(self.lock().get(key), Some(Slot::InProgress))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acquire_twice_rejected() {
        let guard: IdempotencyGuard<String> = IdempotencyGuard::default();
        assert!(guard.try_acquire("k1"));
        assert!(!guard.try_acquire("k1"));
        assert!(guard.is_in_progress("k1"));
    }

    #[test]
    fn test_complete_then_cached() {
        let guard = IdempotencyGuard::default();
        assert!(guard.try_acquire("k1"));
        guard.complete("k1", "run-1".to_string());
        assert_eq!(guard.get_result("k1").as_deref(), Some("run-1"));
        assert!(!guard.try_acquire("k1"));
    }

    #[test]
    fn test_fail_releases_key() {
        let guard: IdempotencyGuard<String> = IdempotencyGuard::default();
        assert!(guard.try_acquire("k1"));
        guard.fail("k1");
        assert!(guard.get_result("k1").is_none());
        assert!(guard.try_acquire("k1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let guard = IdempotencyGuard::new(Duration::from_secs(300), 10);
        assert!(guard.try_acquire("k1"));
        guard.complete("k1", 7u32);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(guard.get_result("k1"), Some(7));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(guard.get_result("k1"), None);
        assert!(guard.try_acquire("k1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let guard = IdempotencyGuard::new(Duration::from_secs(300), 2);
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            assert!(guard.try_acquire(key));
            guard.complete(key, i);
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(guard.get_result("a"), None);
        assert_eq!(guard.get_result("b"), Some(1));
        assert_eq!(guard.get_result("c"), Some(2));
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let guard: Arc<IdempotencyGuard<u32>> = Arc::new(IdempotencyGuard::default());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let g = Arc::clone(&guard);
                std::thread::spawn(move || g.try_acquire("same"))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
