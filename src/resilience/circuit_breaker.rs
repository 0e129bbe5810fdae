//! 熔断器：按调用点统计连续失败，达到阈值后在冷却期内快速失败
//!
//! CLOSED → OPEN → HALF-OPEN → CLOSED。HALF-OPEN 不单独存储：冷却期过后 check() 放行，
//! 探测成功由 record_success() 复位，探测失败再次延长 open 窗口。所有读写在同一把锁内完成。

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// 对外可观察的熔断状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct BreakerState {
    failures: u32,
    open_until: Option<Instant>,
}

/// 单个调用点的熔断器，可在并发运行之间共享（Arc）
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 是否放行；open 期间返回 false，本身不改变状态
    pub fn check(&self) -> bool {
        match self.lock().open_until {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.open_until.is_some() {
            tracing::info!(breaker = %self.name, "circuit closed after successful half-open call");
        }
        state.failures = 0;
        state.open_until = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.lock();
        state.failures = state.failures.saturating_add(1);
        if state.failures >= self.failure_threshold {
            state.open_until = Some(Instant::now() + self.cooldown);
            tracing::warn!(
                breaker = %self.name,
                failures = state.failures,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit opened"
            );
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    pub fn state(&self) -> CircuitState {
        match self.lock().open_until {
            None => CircuitState::Closed,
            Some(until) if Instant::now() < until => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
        }
    }
}
