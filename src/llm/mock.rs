//! Mock 模型网关（测试与无 Key 环境）
//!
//! 按脚本顺序返回预设回复或错误，并记录每次调用收到的历史快照，
//! 便于测试断言工具结果是否被正确追加到下一轮上下文。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{ChatMessage, ChatModel, ModelReply, ProviderError, ToolCallRequest, ToolSpec};

/// 脚本化 Mock：push 的条目按 FIFO 消费，脚本耗尽后恒定返回一句兜底文本
#[derive(Default)]
pub struct MockChatModel {
    script: Mutex<VecDeque<Result<ModelReply, ProviderError>>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockChatModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条终态文本回复
    pub fn push_final(&self, text: impl Into<String>) {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(ModelReply::Final(text.into())));
    }

    /// 追加一轮工具调用请求
    pub fn push_tool_calls(&self, calls: Vec<ToolCallRequest>) {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(ModelReply::ToolCalls(calls)));
    }

    /// 追加一次失败（超时、格式损坏等）
    pub fn push_error(&self, err: ProviderError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    /// 到目前为止的调用次数
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// 第 n 次调用收到的历史快照
    pub fn history_at(&self, n: usize) -> Option<Vec<ChatMessage>> {
        self.calls.lock().unwrap().get(n).cloned()
    }
}

#[async_trait]
impl ChatModel for MockChatModel {
    async fn converse(
        &self,
        history: &[ChatMessage],
        _tools: &[ToolSpec],
    ) -> Result<ModelReply, ProviderError> {
        self.calls.lock().unwrap().push(history.to_vec());

        match self.script.lock().unwrap().pop_front() {
            Some(entry) => entry,
            None => Ok(ModelReply::Final(
                "I'm a mock assistant without a script for this turn.".to_string(),
            )),
        }
    }
}

/// 构造一条工具调用请求；id 为空时自动生成
pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCallRequest {
    let id = if id.is_empty() {
        format!("call_{}", uuid::Uuid::new_v4().simple())
    } else {
        id.to_string()
    };
    ToolCallRequest {
        id,
        name: name.to_string(),
        arguments,
    }
}
