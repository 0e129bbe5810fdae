//! 请求消息与请求体
//!
//! Message / Role 与 LLM API 一致；LlmRequest 额外携带工具列表与结构化输出要求，供路由器计算复杂度。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 工具声明（仅用于路由计数与透传给支持 tools 的后端）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// 结构化输出要求
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseFormat {
    /// 自由文本
    #[default]
    Text,
    /// JSON mode：只要求输出合法 JSON
    JsonObject,
    /// 显式 JSON Schema
    JsonSchema {
        name: String,
        schema: serde_json::Value,
    },
}

/// 一次 generate / stream 调用的完整输入
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub response_format: ResponseFormat,
}

impl LlmRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = format;
        self
    }

    /// 最近一条 User 消息内容（无则为空串）
    pub fn latest_user_message(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }

    /// 全部消息字符数
    pub fn total_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }

    /// 粗略 token 估算（约 4 字符 / token）
    pub fn estimated_tokens(&self) -> u64 {
        (self.total_chars() as u64).div_ceil(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_user_message() {
        let req = LlmRequest::new(vec![
            Message::system("sys"),
            Message::user("first"),
            Message::assistant("reply"),
            Message::user("second"),
        ]);
        assert_eq!(req.latest_user_message(), "second");
    }

    #[test]
    fn test_latest_user_message_empty() {
        let req = LlmRequest::new(vec![Message::system("only system")]);
        assert_eq!(req.latest_user_message(), "");
    }

    #[test]
    fn test_estimated_tokens_rounds_up() {
        let req = LlmRequest::new(vec![Message::user("abcde")]);
        assert_eq!(req.total_chars(), 5);
        assert_eq!(req.estimated_tokens(), 2);
    }
}
