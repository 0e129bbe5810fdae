//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock / 路由器）实现 LlmClient：generate（非流式）、stream（流式 Token）、
//! capabilities（能力自省）。路由器只依赖此 trait。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

use super::LlmRequest;

/// 流式 Token
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// Provider 调用错误；is_transient 决定是否值得重试
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Rate limited")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Server error: {0}")]
    Server(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl LlmError {
    /// 连接/超时、429/500/502/503、限流、服务端与连接错误视为瞬时错误
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Network(_)
            | LlmError::Timeout
            | LlmError::RateLimited { .. }
            | LlmError::Server(_)
            | LlmError::Connection(_) => true,
            LlmError::Http { status, .. } => matches!(status, 429 | 500 | 502 | 503),
            LlmError::InvalidResponse(_) | LlmError::ApiError(_) | LlmError::NotConfigured(_) => {
                false
            }
        }
    }
}

/// 模型能力描述（能力自省）
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCapabilities {
    /// Provider 名称（如 openai / deepseek / mock）
    pub name: String,
    /// 模型标识
    pub model: String,
    /// 是否支持流式输出
    pub supports_streaming: bool,
    /// 是否支持显式 JSON Schema
    pub supports_json_schema: bool,
    /// 是否支持 tools
    pub supports_tools: bool,
}

impl ModelCapabilities {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            supports_streaming: true,
            supports_json_schema: false,
            supports_tools: false,
        }
    }

    pub fn with_streaming(mut self, enabled: bool) -> Self {
        self.supports_streaming = enabled;
        self
    }

    pub fn with_json_schema(mut self, enabled: bool) -> Self {
        self.supports_json_schema = enabled;
        self
    }

    pub fn with_tools(mut self, enabled: bool) -> Self {
        self.supports_tools = enabled;
        self
    }
}

/// LLM 客户端 trait：非流式完成与流式完成（返回 Token 流）
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 能力自省
    fn capabilities(&self) -> ModelCapabilities;

    /// 非流式完成
    async fn generate(&self, request: &LlmRequest) -> Result<String, LlmError>;

    /// 流式完成，返回 Token 流
    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream, LlmError>;
}
