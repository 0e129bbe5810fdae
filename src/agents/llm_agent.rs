//! LLM 驱动的 Agent：system prompt + 用户 prompt + 上下文 JSON，经 ModelRouter 调用

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde_json::Value;

use super::{extract_json, Agent, AgentError, AgentOutput};
use crate::llm::{LlmRequest, Message, ModelRouter, ResponseFormat, Tier};

pub struct LlmAgent {
    name: String,
    router: Arc<ModelRouter>,
    system_prompt: String,
    response_format: ResponseFormat,
}

impl LlmAgent {
    /// 自由文本输出，结果为 Value::String
    pub fn new(
        name: impl Into<String>,
        router: Arc<ModelRouter>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            router,
            system_prompt: system_prompt.into(),
            response_format: ResponseFormat::Text,
        }
    }

    /// JSON mode
    pub fn json_object(mut self) -> Self {
        self.response_format = ResponseFormat::JsonObject;
        self
    }

    /// 按类型 T 生成的 JSON Schema 请求结构化输出
    pub fn json_schema<T: JsonSchema>(mut self, schema_name: impl Into<String>) -> Self {
        let schema = schemars::schema_for!(T);
        self.response_format = ResponseFormat::JsonSchema {
            name: schema_name.into(),
            schema: serde_json::to_value(&schema).unwrap_or(Value::Null),
        };
        self
    }

    pub fn response_format(&self) -> &ResponseFormat {
        &self.response_format
    }

    /// context.history（若有）作为历史消息放在 system 与本轮 user 之间，其余字段附在 user 消息末尾
    fn build_request(&self, prompt: &str, context: &Value) -> LlmRequest {
        let mut context = context.clone();
        let history: Vec<Message> = context
            .as_object_mut()
            .and_then(|o| o.remove("history"))
            .and_then(|h| serde_json::from_value(h).ok())
            .unwrap_or_default();

        let mut user = prompt.to_string();
        if !context.is_null() && context.as_object().map_or(true, |o| !o.is_empty()) {
            let ctx = serde_json::to_string_pretty(&context).unwrap_or_default();
            user.push_str("\n\nContext:\n");
            user.push_str(&ctx);
        }

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(&self.system_prompt));
        messages.extend(history);
        messages.push(Message::user(user));
        LlmRequest::new(messages).with_response_format(self.response_format.clone())
    }
}

#[async_trait]
impl Agent for LlmAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        prompt: &str,
        context: &Value,
        provider_override: Option<Tier>,
    ) -> Result<AgentOutput, AgentError> {
        let request = self.build_request(prompt, context);
        let completion = self.router.generate_routed(&request, provider_override).await?;
        tracing::debug!(
            agent = %self.name,
            tier = %completion.metrics.tier,
            provider = %completion.metrics.provider,
            latency_ms = completion.metrics.latency_ms,
            "agent call completed"
        );

        let value = match self.response_format {
            ResponseFormat::Text => Value::String(completion.content.trim().to_string()),
            _ => extract_json(&completion.content)?,
        };
        Ok(AgentOutput::new(value).with_route(completion.metrics))
    }
}
