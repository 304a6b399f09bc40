//! Agent 编排器：单回合状态机
//!
//! 接收一条已认证的用户消息，从存储重建完整上下文（进程内不保留任何会话状态），
//! 驱动 模型调用 -> 工具派发 -> 审计 循环直到拿到终态文本或触顶回合上限，
//! 最后把用户消息与 assistant 消息作为一个事务持久化并返回应答。
//! 进程在任意两条消息之间重启都不丢失连续性。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, ConversationLocks};
use crate::llm::{ChatMessage, ChatModel, ModelReply, ProviderError, ToolSpec};
use crate::store::models::{Conversation, StoredMessage, StoredRole};
use crate::store::{AuditLog, ConversationStore};
use crate::tools::{catalog, ToolDispatcher, ToolName, ToolResult, ToolStatus};

/// 默认系统提示词：约束模型只通过工具操作任务，意图不明时先澄清而不是瞎猜
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Ant, a personal task list assistant. \
You manage the user's tasks exclusively through the provided tools: add_task, list_tasks, \
update_task, complete_task, delete_task. Never invent task ids; list tasks first if you \
need one. If the user's intent is ambiguous, ask a clarifying question instead of guessing. \
Keep replies short and factual about what was actually done.";

/// Provider 重试耗尽后的确定性兜底回复；不编造任何「已执行」的说法
pub const PROVIDER_FALLBACK_REPLY: &str =
    "I'm temporarily unable to process that request. Please try again in a moment.";

/// 触顶回合上限时附加的说明
pub const TURN_LIMIT_NOTE: &str =
    "This request needed more steps than I can take in one turn, so I stopped here. \
Please break it into smaller requests.";

/// 编排参数；均可通过配置覆盖
#[derive(Clone, Debug)]
pub struct AgentSettings {
    /// 每条用户消息最多的模型调用轮数（工具回合）
    pub turn_limit: usize,
    /// Provider 失败的最大重试次数
    pub provider_max_retries: usize,
    /// 重试退避基数（毫秒），按次数翻倍
    pub provider_backoff_ms: u64,
    /// 退避上限（毫秒）
    pub provider_backoff_cap_ms: u64,
    /// 单条用户消息的最大字符数
    pub max_message_chars: usize,
    pub system_prompt: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            turn_limit: 4,
            provider_max_retries: 2,
            provider_backoff_ms: 500,
            provider_backoff_cap_ms: 2000,
            max_message_chars: 10_000,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// 入站请求；user_id 来自外部认证协作方，编排器无条件信任且只信任它
#[derive(Clone, Debug, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub message: String,
}

/// 单次工具调用的摘要；随 assistant 消息持久化，也原样返回给调用方
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallSummary {
    pub tool: String,
    pub parameters: Value,
    pub status: ToolStatus,
    pub result: Value,
}

/// 首个工具调用的意图摘要
#[derive(Clone, Debug, Serialize)]
pub struct ToolUsage {
    pub intent: String,
    pub parameters: Value,
    pub success: bool,
}

/// 本回合最后一次写操作的摘要
#[derive(Clone, Debug, Serialize)]
pub struct TaskOperation {
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 出站应答
#[derive(Clone, Debug, Serialize)]
pub struct ChatResponse {
    pub conversation_id: String,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_usage: Option<ToolUsage>,
    pub tool_calls: Vec<ToolCallSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_operation: Option<TaskOperation>,
}

/// 编排器：组件均为不可变配置或共享存储句柄，可被任意多请求并发使用
pub struct Orchestrator {
    store: Arc<ConversationStore>,
    audit: Arc<AuditLog>,
    dispatcher: ToolDispatcher,
    model: Arc<dyn ChatModel>,
    locks: ConversationLocks,
    settings: AgentSettings,
    tool_specs: Vec<ToolSpec>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<ConversationStore>,
        audit: Arc<AuditLog>,
        dispatcher: ToolDispatcher,
        model: Arc<dyn ChatModel>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            store,
            audit,
            dispatcher,
            model,
            locks: ConversationLocks::new(),
            settings,
            // 目录运行时不可变，构造时生成一次
            tool_specs: catalog(),
        }
    }

    /// 处理一条用户消息：完整跑完 重建 -> 模型 -> 派发 -> 持久化 流程。
    /// 取消只在回合间生效，已派发的工具调用一定会完成并落审计；
    /// 被取消的回合持久化用户消息本身，审计行不会指向不存在的消息。
    pub async fn handle_message(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatResponse, AgentError> {
        // 1. 请求校验；失败即拒绝，不产生任何持久化
        let text = request.message.trim();
        if text.is_empty() {
            return Err(AgentError::Validation("message must not be empty".to_string()));
        }
        if text.chars().count() > self.settings.max_message_chars {
            return Err(AgentError::Validation(format!(
                "message exceeds {} characters",
                self.settings.max_message_chars
            )));
        }

        // 进门即已取消的请求不创建任何东西
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        // 2. 同一对话的并发回合串行化；不同对话互不阻塞。
        //    锁必须先于读取 revision，否则并发回合会拿到过期的乐观检查基线。
        let (conversation, _guard) = match &request.conversation_id {
            Some(id) => {
                let guard = self.locks.acquire(id).await;
                let conversation = self.store.get(&request.user_id, id).await?;
                (conversation, guard)
            }
            None => {
                let conversation = self.store.create(&request.user_id, text).await?;
                let guard = self.locks.acquire(&conversation.id).await;
                (conversation, guard)
            }
        };

        // 3. 上下文重建：全部连续性来自存储
        let history = self
            .store
            .load_messages(&request.user_id, &conversation.id)
            .await?;

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(self.settings.system_prompt.clone()));
        for stored in &history {
            messages.push(match stored.role {
                StoredRole::User => ChatMessage::user(stored.content.clone()),
                StoredRole::Assistant => ChatMessage::assistant(stored.content.clone()),
            });
        }
        messages.push(ChatMessage::user(text.to_string()));

        // 用户消息 id 先行生成：回合内的审计行都挂在它名下
        let user_message_id = uuid::Uuid::new_v4().to_string();
        let received_at = chrono::Utc::now();
        let user_message = StoredMessage::user(
            user_message_id.clone(),
            &conversation.id,
            &request.user_id,
            text,
            received_at,
        );

        // 4. 模型 <-> 工具循环，回合数有界
        let mut summaries: Vec<ToolCallSummary> = Vec::new();
        let mut final_text: Option<String> = None;

        for round in 0..self.settings.turn_limit {
            if cancel.is_cancelled() {
                tracing::info!(conversation = %conversation.id, round, "turn cancelled between rounds");
                // 与 provider 耗尽同一规则：只持久化用户消息，不编造 assistant 回复。
                // 本回合已落的审计行由此保持可归属。
                self.store
                    .persist_turn(&conversation, &user_message, None)
                    .await?;
                return Err(AgentError::Cancelled);
            }

            let reply = match self.call_model_with_retry(&messages).await {
                Ok(reply) => reply,
                Err(e) => {
                    // 重试预算耗尽：确定性兜底，只持久化用户消息，不编造 assistant 回复
                    tracing::error!(error = %e, conversation = %conversation.id, "provider exhausted retries");
                    self.store
                        .persist_turn(&conversation, &user_message, None)
                        .await?;
                    return Ok(self.build_response(
                        &conversation,
                        PROVIDER_FALLBACK_REPLY.to_string(),
                        summaries,
                    ));
                }
            };

            match reply {
                ModelReply::Final(text) => {
                    final_text = Some(text);
                    break;
                }
                ModelReply::ToolCalls(calls) => {
                    tracing::debug!(
                        conversation = %conversation.id,
                        round,
                        count = calls.len(),
                        "model requested tool calls"
                    );
                    // 工具调用严格按模型给出的顺序串行执行，后面的调用要能看到前面的副作用
                    messages.push(ChatMessage::assistant_with_tools(calls.clone()));
                    for call in calls {
                        let log_id = self
                            .audit
                            .begin(
                                &request.user_id,
                                &conversation.id,
                                &user_message_id,
                                &call.name,
                                &call.arguments,
                            )
                            .await?;

                        // dispatch 不会失败为硬错误，任何结果都能回填审计
                        let result = self
                            .dispatcher
                            .dispatch(&request.user_id, &call.name, call.arguments.clone())
                            .await;
                        self.audit.finalize(&log_id, &result).await?;

                        summaries.push(ToolCallSummary {
                            tool: call.name.clone(),
                            parameters: call.arguments.clone(),
                            status: result.status,
                            result: result_payload(&result),
                        });
                        messages.push(ChatMessage::tool(call.id, result.to_model_payload()));
                    }
                }
            }
        }

        // 5. 触顶回合上限：非致命，带上说明正常持久化
        let final_text = final_text.unwrap_or_else(|| {
            tracing::warn!(conversation = %conversation.id, "turn limit exceeded");
            TURN_LIMIT_NOTE.to_string()
        });

        // 6. 持久化本回合：用户消息 + assistant 消息（携带工具摘要），bump updated_at
        let tool_call_results = if summaries.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&summaries)?)
        };
        let assistant_message = StoredMessage::assistant(
            &conversation.id,
            &request.user_id,
            final_text.clone(),
            tool_call_results,
        );
        self.store
            .persist_turn(&conversation, &user_message, Some(&assistant_message))
            .await?;

        Ok(self.build_response(&conversation, final_text, summaries))
    }

    /// 带有界退避的模型调用：超时 / 传输失败 / 输出损坏同一套重试策略
    async fn call_model_with_retry(
        &self,
        history: &[ChatMessage],
    ) -> Result<ModelReply, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.model.converse(history, &self.tool_specs).await {
                Ok(reply) => return Ok(reply),
                Err(e) if attempt < self.settings.provider_max_retries => {
                    let delay = (self.settings.provider_backoff_ms << attempt)
                        .min(self.settings.provider_backoff_cap_ms);
                    tracing::warn!(error = %e, attempt, delay_ms = delay, "provider error, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn build_response(
        &self,
        conversation: &Conversation,
        response: String,
        summaries: Vec<ToolCallSummary>,
    ) -> ChatResponse {
        let tool_usage = summaries.first().map(|s| ToolUsage {
            intent: s.tool.clone(),
            parameters: s.parameters.clone(),
            success: s.status == ToolStatus::Success,
        });

        let task_operation = summaries
            .iter()
            .rev()
            .find(|s| {
                ToolName::parse(&s.tool)
                    .map(|t| t.is_mutation())
                    .unwrap_or(false)
            })
            .map(|s| TaskOperation {
                operation: s.tool.clone(),
                result: (s.status == ToolStatus::Success).then(|| s.result.clone()),
                error: (s.status == ToolStatus::Error)
                    .then(|| s.result["message"].as_str().unwrap_or("error").to_string()),
            });

        ChatResponse {
            conversation_id: conversation.id.clone(),
            response,
            tool_usage,
            tool_calls: summaries,
            task_operation,
        }
    }
}

/// 摘要里的 result 字段：成功放 data，失败放 {error_kind, message}
fn result_payload(result: &ToolResult) -> Value {
    if result.is_success() {
        result.data.clone().unwrap_or(Value::Null)
    } else {
        serde_json::json!({
            "error_kind": result.error_kind,
            "message": result.message,
        })
    }
}
