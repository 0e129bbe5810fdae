//! 阶段调用的外部协作者：Agent、确定性质量评分器、检索器
//!
//! 图引擎只依赖这里的 trait；LlmAgent 通过 ModelRouter 调用模型，其它实现可在测试中脚本化。

pub mod draft;
pub mod llm_agent;
pub mod quality;
pub mod retriever;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::llm::{LlmError, RouteMetrics, Tier};

pub use draft::{draft_schema, Activity, LessonPlanDraft};
pub use llm_agent::LlmAgent;
pub use quality::{ChecklistItem, ChecklistScorer, QualityReport, QualityScorer};
pub use retriever::{KeywordRetriever, Passage, Retriever};

/// 协作者调用错误；LLM 错误保留为 source，供重试分类器识别瞬时错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Invalid agent output: {0}")]
    InvalidOutput(String),

    #[error("Retrieval failed: {0}")]
    Retrieval(String),
}

/// Agent 一次调用的结构化输出，附带路由遥测（非 LLM 实现为 None）
#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub value: Value,
    pub route: Option<RouteMetrics>,
}

impl AgentOutput {
    pub fn new(value: Value) -> Self {
        Self { value, route: None }
    }

    pub fn with_route(mut self, route: RouteMetrics) -> Self {
        self.route = Some(route);
        self
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    /// provider_override 指定档位时跳过路由打分
    async fn run(
        &self,
        prompt: &str,
        context: &Value,
        provider_override: Option<Tier>,
    ) -> Result<AgentOutput, AgentError>;
}

/// 从 LLM 文本中提取 JSON（```json 代码块或首个 { 到末个 }）
pub fn extract_json(output: &str) -> Result<Value, AgentError> {
    let trimmed = output.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start <= end {
            &trimmed[start..=end]
        } else {
            trimmed
        }
    } else {
        trimmed
    };

    serde_json::from_str(json_str).map_err(|e| {
        let preview: String = json_str.chars().take(120).collect();
        AgentError::JsonParse(format!("{e}: {preview}"))
    })
}
