//! 模型网关抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 ChatModel：一次 converse 输入完整历史与工具目录，
//! 返回最终文本或一组工具调用请求。网关自身不持有任何会话状态，历史全部由调用方显式传入。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 发给模型的单条消息；tool_calls 仅用于 assistant，tool_call_id 仅用于 tool
#[derive(Clone, Debug)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub tool_call_id: Option<String>,
}

/// 消息角色（与 chat-completions 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(ChatRole::Assistant, content)
    }

    /// 携带工具调用请求的 assistant 消息，必须先于对应的 tool 消息入列
    pub fn assistant_with_tools(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: String::new(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// 单条工具结果消息，tool_call_id 对应触发它的请求
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn text(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// 模型请求的一次工具调用；arguments 已解析为 JSON 值
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// 一次 converse 的产出：终态文本，或需要先执行的一组工具调用
#[derive(Clone, Debug)]
pub enum ModelReply {
    Final(String),
    ToolCalls(Vec<ToolCallRequest>),
}

/// 暴露给模型的工具描述（仅 name + description + 参数 schema，不含 handler）
#[derive(Clone, Debug, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 模型网关错误；编排器对其做有界退避重试
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Model request timed out after {0}s")]
    Timeout(u64),

    #[error("Model transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Model API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// 输出既不是文本也不是合法工具调用；按传输失败同样重试
    #[error("Malformed model output: {0}")]
    Malformed(String),
}

/// 模型网关 trait：无内部会话状态，可被任意多个请求并发调用
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// 单次模型调用：历史 + 工具目录 -> 文本或工具调用
    async fn converse(
        &self,
        history: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelReply, ProviderError>;
}
