//! 错误分类：阶段错误（StageError）与编排层错误（OrchestratorError）
//!
//! 四类：瞬时（已重试耗尽）、致命、熔断打开（快速失败）、工作流超时。
//! 推送给客户端的只有 public_message() 的简短描述，内部细节只进日志。

use thiserror::Error;

use crate::agents::AgentError;
use crate::resilience::is_transient;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Fatal,
    CircuitOpen,
    WorkflowTimeout,
}

/// 单个阶段的失败
#[derive(Error, Debug)]
pub enum StageError {
    /// 重试预算耗尽后仍失败的瞬时错误
    #[error("transient failure after retries: {0}")]
    Transient(#[source] AgentError),

    #[error("{0}")]
    Fatal(String),

    #[error("circuit open for '{0}'")]
    CircuitOpen(String),

    #[error("workflow exceeded {limit_secs}s before stage '{stage}'")]
    WorkflowTimeout { stage: String, limit_secs: u64 },
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Transient(_) => ErrorKind::Transient,
            StageError::Fatal(_) => ErrorKind::Fatal,
            StageError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            StageError::WorkflowTimeout { .. } => ErrorKind::WorkflowTimeout,
        }
    }

    /// 可推送给客户端的简短错误描述
    pub fn public_message(&self) -> String {
        match self {
            StageError::Transient(_) => "upstream model temporarily unavailable".to_string(),
            StageError::Fatal(_) => "stage failed".to_string(),
            StageError::CircuitOpen(name) => format!("service '{name}' temporarily disabled"),
            StageError::WorkflowTimeout { limit_secs, .. } => {
                format!("run exceeded {limit_secs}s time budget")
            }
        }
    }
}

impl From<AgentError> for StageError {
    fn from(err: AgentError) -> Self {
        if is_transient(&err) {
            StageError::Transient(err)
        } else {
            StageError::Fatal(err.to_string())
        }
    }
}

/// 引擎返回的失败：出错阶段 + 原因
#[derive(Error, Debug)]
#[error("stage '{stage}' failed: {error}")]
pub struct StageFailure {
    pub stage: String,
    #[source]
    pub error: StageError,
}

/// 编排层错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Transient error in stage '{stage}': {message}")]
    Transient { stage: String, message: String },

    #[error("Fatal error in stage '{stage}': {message}")]
    Fatal { stage: String, message: String },

    #[error("Circuit open in stage '{stage}': {service}")]
    CircuitOpen { stage: String, service: String },

    #[error("Workflow timeout before stage '{stage}' (limit {limit_secs}s)")]
    WorkflowTimeout { stage: String, limit_secs: u64 },

    /// 同一幂等键的运行仍在进行
    #[error("Duplicate run: {0} is already in progress")]
    DuplicateRun(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            OrchestratorError::Transient { .. } => Some(ErrorKind::Transient),
            OrchestratorError::Fatal { .. } => Some(ErrorKind::Fatal),
            OrchestratorError::CircuitOpen { .. } => Some(ErrorKind::CircuitOpen),
            OrchestratorError::WorkflowTimeout { .. } => Some(ErrorKind::WorkflowTimeout),
            OrchestratorError::DuplicateRun(_) | OrchestratorError::Config(_) => None,
        }
    }
}

impl From<StageFailure> for OrchestratorError {
    fn from(failure: StageFailure) -> Self {
        let stage = failure.stage;
        match failure.error {
            StageError::Transient(e) => OrchestratorError::Transient {
                stage,
                message: e.to_string(),
            },
            StageError::Fatal(message) => OrchestratorError::Fatal { stage, message },
            StageError::CircuitOpen(service) => OrchestratorError::CircuitOpen { stage, service },
            StageError::WorkflowTimeout { limit_secs, .. } => {
                OrchestratorError::WorkflowTimeout { stage, limit_secs }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;

    #[test]
    fn test_agent_error_classification() {
        let e: StageError = AgentError::Llm(LlmError::Server("502".into())).into();
        assert_eq!(e.kind(), ErrorKind::Transient);
        let e: StageError = AgentError::JsonParse("bad".into()).into();
        assert_eq!(e.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_public_message_hides_details() {
        let e = StageError::Fatal("provider body: secret-token-123".into());
        assert!(!e.public_message().contains("secret"));
        let e = StageError::Transient(AgentError::Llm(LlmError::Http {
            status: 503,
            message: "internal trace".into(),
        }));
        assert!(!e.public_message().contains("internal"));
    }

    #[test]
    fn test_failure_to_orchestrator_error() {
        let err: OrchestratorError = StageFailure {
            stage: "planner".into(),
            error: StageError::CircuitOpen("planner".into()),
        }
        .into();
        assert_eq!(err.kind(), Some(ErrorKind::CircuitOpen));

        let err: OrchestratorError = StageFailure {
            stage: "validate".into(),
            error: StageError::WorkflowTimeout {
                stage: "validate".into(),
                limit_secs: 300,
            },
        }
        .into();
        assert!(matches!(err, OrchestratorError::WorkflowTimeout { limit_secs: 300, .. }));
    }
}
