//! OpenAI 兼容 API 客户端
//!
//! 直接按 chat-completions 线上格式（messages + tools + tool_calls）收发 JSON，
//! 可配置 base_url，支持 DeepSeek、OpenAI 及自建代理。每次 converse 携带硬超时，
//! 超时与传输失败统一转为 ProviderError，由编排器决定重试。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::{ChatMessage, ChatModel, ModelReply, ProviderError, ToolCallRequest, ToolSpec};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI 兼容客户端：仅持有配置（model、base_url、key、超时），无任何可变会话状态
pub struct OpenAiChatModel {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
}

impl OpenAiChatModel {
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: Option<&str>,
        timeout_secs: u64,
    ) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        Self {
            http: reqwest::Client::new(),
            base_url: base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            model: model.to_string(),
            timeout_secs,
        }
    }

    fn to_wire_messages(history: &[ChatMessage]) -> Vec<WireMessage> {
        history
            .iter()
            .map(|m| WireMessage {
                role: m.role.as_str(),
                content: m.content.clone(),
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(m.tool_calls.iter().map(to_wire_tool_call).collect())
                },
                tool_call_id: m.tool_call_id.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn converse(
        &self,
        history: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ModelReply, ProviderError> {
        let body = WireRequest {
            model: &self.model,
            messages: Self::to_wire_messages(history),
            tools: if tools.is_empty() {
                None
            } else {
                Some(
                    tools
                        .iter()
                        .map(|t| WireTool {
                            kind: "function",
                            function: WireFunction {
                                name: &t.name,
                                description: &t.description,
                                parameters: &t.parameters,
                            },
                        })
                        .collect(),
                )
            },
            tool_choice: if tools.is_empty() { None } else { Some("auto") },
        };

        let url = format!("{}/chat/completions", self.base_url);
        let send = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let response = tokio::time::timeout(Duration::from_secs(self.timeout_secs), send)
            .await
            .map_err(|_| ProviderError::Timeout(self.timeout_secs))??;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<WireErrorBody>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: WireResponse = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Malformed("response contained no choices".to_string()))?;

        if let Some(calls) = choice.message.tool_calls.filter(|c| !c.is_empty()) {
            let mut requests = Vec::with_capacity(calls.len());
            for call in calls {
                // arguments 是 JSON 字符串；解析失败视为模型输出损坏
                let arguments: Value = serde_json::from_str(&call.function.arguments)
                    .map_err(|e| {
                        ProviderError::Malformed(format!(
                            "tool call '{}' arguments are not valid JSON: {e}",
                            call.function.name
                        ))
                    })?;
                requests.push(ToolCallRequest {
                    id: call.id,
                    name: call.function.name,
                    arguments,
                });
            }
            return Ok(ModelReply::ToolCalls(requests));
        }

        match choice.message.content {
            Some(text) if !text.is_empty() => Ok(ModelReply::Final(text)),
            _ => Err(ProviderError::Malformed(
                "response had neither text content nor tool calls".to_string(),
            )),
        }
    }
}

fn to_wire_tool_call(call: &ToolCallRequest) -> WireToolCall {
    WireToolCall {
        id: call.id.clone(),
        kind: "function".to_string(),
        function: WireFunctionCall {
            name: call.name.clone(),
            arguments: call.arguments.to_string(),
        },
    }
}

// 线上格式结构体，仅本模块使用

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction<'a>,
}

#[derive(Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    /// 参数以 JSON 字符串下发
    arguments: String,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireErrorBody {
    error: WireErrorDetail,
}

#[derive(Deserialize)]
struct WireErrorDetail {
    message: String,
}
