//! 指数退避重试
//!
//! 只重试瞬时错误（网络/超时、429/500/502/503、限流/服务端/连接错误，或其 source 链中包含此类错误）；
//! 其它错误首轮即返回。最后一次尝试失败时原样返回最后一个错误。

use std::error::Error;
use std::future::Future;
use std::time::Duration;

use crate::llm::LlmError;

/// 重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    /// 单次等待上限
    pub max_delay: Duration,
}

pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// backoff_factor 非有限或小于 1.0 时按 1.0（固定间隔）处理
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff_factor: f64) -> Self {
        let backoff_factor = if backoff_factor.is_finite() && backoff_factor >= 1.0 {
            backoff_factor
        } else {
            tracing::warn!(backoff_factor, "invalid backoff factor, using 1.0");
            1.0
        };
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            backoff_factor,
            max_delay: DEFAULT_MAX_DELAY.max(initial_delay),
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// 第 attempt 次（从 1 开始）失败后的等待时间，不超过 max_delay
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// 沿 source 链判断是否为瞬时错误
pub fn is_transient(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(llm) = e.downcast_ref::<LlmError>() {
            if llm.is_transient() {
                return true;
            }
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind::*;
            if matches!(
                io.kind(),
                TimedOut | ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected
                    | BrokenPipe
            ) {
                return true;
            }
        }
        if e.is::<tokio::time::error::Elapsed>() {
            return true;
        }
        current = e.source();
    }
    false
}

/// 用默认分类器重试
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T, E>
where
    E: Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_if(policy, |e: &E| is_transient(e), op).await
}

/// 自定义分类器的重试
pub async fn retry_if<T, E, F, Fut, C>(policy: &RetryPolicy, classify: C, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_attempts || !classify(&err) {
                    return Err(err);
                }
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use thiserror::Error;

    #[derive(Error, Debug)]
    #[error("agent call failed")]
    struct Wrapped(#[source] LlmError);

    #[test]
    fn test_delay_schedule() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_after(1), Duration::from_secs(1));
        assert_eq!(p.delay_after(2), Duration::from_secs(2));
        assert_eq!(p.delay_after(3), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_capped_for_large_attempts() {
        let p = RetryPolicy::new(3, Duration::from_millis(100), 2.0);
        assert_eq!(p.delay_after(70), DEFAULT_MAX_DELAY);
        assert_eq!(p.delay_after(u32::MAX), DEFAULT_MAX_DELAY);

        let p = p.with_max_delay(Duration::from_secs(5));
        assert_eq!(p.delay_after(3), Duration::from_millis(400));
        assert_eq!(p.delay_after(10), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_backoff_factor_falls_back_to_fixed_delay() {
        for factor in [f64::NAN, f64::INFINITY, -2.0, 0.5] {
            let p = RetryPolicy::new(3, Duration::from_millis(100), factor);
            assert_eq!(p.backoff_factor, 1.0);
            assert_eq!(p.delay_after(5), Duration::from_millis(100));
        }
    }

    #[test]
    fn test_is_transient_walks_source_chain() {
        assert!(is_transient(&Wrapped(LlmError::Timeout)));
        assert!(!is_transient(&Wrapped(LlmError::InvalidResponse("x".into()))));
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(is_transient(&io));
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(!is_transient(&io));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();
        let c = Arc::clone(&calls);
        let result: Result<(), LlmError> = retry(&RetryPolicy::default(), || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::Http {
                    status: 503,
                    message: "unavailable".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(LlmError::Http { status: 503, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 两次退避：1s + 2s
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();
        let c = Arc::clone(&calls);
        let result: Result<(), LlmError> = retry(&RetryPolicy::default(), || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::InvalidResponse("schema mismatch".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result = retry(&RetryPolicy::default(), || {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Wrapped(LlmError::RateLimited { retry_after_ms: None }))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
