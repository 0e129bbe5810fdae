//! 受保护的 Agent 调用：熔断检查 → 重试 → 记录成功/失败
//!
//! 熔断打开时快速失败为 CircuitOpen，不进入重试；重试耗尽或非瞬时错误计一次熔断失败。

use std::future::Future;

use serde_json::Value;

use crate::agents::{Agent, AgentError, AgentOutput};
use crate::core::StageError;
use crate::llm::Tier;
use crate::resilience::{retry, CircuitBreaker, RetryPolicy};

pub async fn guarded_call<T, F, Fut>(
    breaker: &CircuitBreaker,
    policy: &RetryPolicy,
    op: F,
) -> Result<T, StageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    if !breaker.check() {
        tracing::warn!(breaker = %breaker.name(), "circuit open, failing fast");
        return Err(StageError::CircuitOpen(breaker.name().to_string()));
    }
    match retry(policy, op).await {
        Ok(value) => {
            breaker.record_success();
            Ok(value)
        }
        Err(err) => {
            breaker.record_failure();
            tracing::warn!(breaker = %breaker.name(), error = %err, "guarded call failed");
            Err(StageError::from(err))
        }
    }
}

/// 经熔断与重试调用 Agent
pub async fn call_agent(
    agent: &dyn Agent,
    breaker: &CircuitBreaker,
    policy: &RetryPolicy,
    prompt: &str,
    context: &Value,
    provider_override: Option<Tier>,
) -> Result<AgentOutput, StageError> {
    guarded_call(breaker, policy, move || {
        agent.run(prompt, context, provider_override)
    })
    .await
}
