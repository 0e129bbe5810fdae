//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! 按顺序吐出预置的脚本回复；脚本耗尽后回显最后一条 User 消息（要求结构化输出时包成 JSON 对象）。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{LlmClient, LlmError, LlmRequest, ModelCapabilities, ResponseFormat, TokenStream};

/// Mock 客户端：脚本回复 + 调用计数
#[derive(Debug)]
pub struct MockLlmClient {
    name: String,
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: AtomicUsize,
}

impl MockLlmClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// 追加一条脚本回复
    pub fn with_reply(self, reply: impl Into<String>) -> Self {
        self.push(Ok(reply.into()));
        self
    }

    /// 追加一条脚本错误
    pub fn with_error(self, err: LlmError) -> Self {
        self.push(Err(err));
        self
    }

    pub fn push(&self, item: Result<String, LlmError>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(item);
    }

    /// 已被调用次数
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new("mock")
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities::new(self.name.clone(), "mock")
            .with_json_schema(true)
            .with_tools(true)
    }

    async fn generate(&self, request: &LlmRequest) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match scripted {
            Some(item) => item,
            None if request.response_format == ResponseFormat::Text => {
                Ok(format!("Echo from Mock: {}", request.latest_user_message()))
            }
            None => Ok(serde_json::json!({ "echo": request.latest_user_message() }).to_string()),
        }
    }

    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream, LlmError> {
        let content = self.generate(request).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }
}
