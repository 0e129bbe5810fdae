//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! SDK 错误统一映射为 LlmError，便于重试层区分瞬时错误与致命错误。

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{LlmClient, LlmError, LlmRequest, Message, ModelCapabilities, Role, TokenStream};

/// OpenAI 兼容客户端：持有 Client、provider 名与 model 名
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    provider: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(provider: &str, base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            provider: provider.to_string(),
            model: model.to_string(),
        }
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        messages
            .iter()
            .map(|m| {
                let built = match m.role {
                    Role::System => ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::System),
                    // 工具结果按 user 透传，避免依赖 tool_call_id
                    Role::User | Role::Tool => ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::User),
                    Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::Assistant),
                };
                built.map_err(map_openai_error)
            })
            .collect()
    }
}

/// 将 SDK 错误映射为 LlmError：网络层错误一律视为连接错误，API 错误按 type/message 判断限流与服务端错误
fn map_openai_error(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::Reqwest(e) => {
            let text = e.to_string();
            if text.to_lowercase().contains("timed out") {
                LlmError::Timeout
            } else {
                LlmError::Connection(text)
            }
        }
        OpenAIError::ApiError(api) => {
            let kind = api.r#type.clone().unwrap_or_default().to_lowercase();
            let message = api.message.clone();
            let lower = message.to_lowercase();
            if kind.contains("rate_limit") || lower.contains("rate limit") {
                LlmError::RateLimited {
                    retry_after_ms: None,
                }
            } else if kind.contains("server_error") || lower.contains("overloaded") {
                LlmError::Server(message)
            } else {
                LlmError::ApiError(message)
            }
        }
        other => LlmError::InvalidResponse(other.to_string()),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities::new(self.provider.clone(), self.model.clone())
            .with_json_schema(true)
            .with_tools(true)
    }

    async fn generate(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(&request.messages)?)
            .build()
            .map_err(map_openai_error)?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(map_openai_error)?;

        if let Some(usage) = &response.usage {
            tracing::debug!(
                provider = %self.provider,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "llm usage"
            );
        }

        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| LlmError::InvalidResponse("empty choices".to_string()))
    }

    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream, LlmError> {
        let content = self.generate(request).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }
}
