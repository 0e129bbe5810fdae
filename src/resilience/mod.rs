//! 容错原语：熔断器、指数退避重试、幂等守卫

pub mod circuit_breaker;
pub mod idempotency;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use idempotency::IdempotencyGuard;
pub use retry::{is_transient, retry, retry_if, RetryPolicy};
