//! 编排器端到端测试
//!
//! 用脚本化 Mock 模型 + 临时 SQLite 跑完整回合，覆盖：工具调用场景、
//! 失败恢复、重试与兜底、用户隔离、顺序性、无状态重建与审计不变式。

use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use ant::core::{
    AgentError, AgentSettings, ChatRequest, Orchestrator, PROVIDER_FALLBACK_REPLY, TURN_LIMIT_NOTE,
};
use ant::llm::mock::tool_call;
use ant::llm::{
    ChatMessage, ChatModel, ChatRole, MockChatModel, ModelReply, ProviderError, ToolSpec,
};
use ant::store::{connect_sqlite, AuditLog, AuditStatus, ConversationStore, StoredRole};
use ant::tasks::{SqliteTaskStore, StatusFilter, TaskStore};
use ant::tools::{ToolDispatcher, ToolStatus};

struct Harness {
    _dir: TempDir,
    orchestrator: Orchestrator,
    model: Arc<MockChatModel>,
    store: Arc<ConversationStore>,
    audit: Arc<AuditLog>,
    tasks: Arc<SqliteTaskStore>,
}

/// 重试退避调小，测试不用等真实秒级延迟
fn fast_settings() -> AgentSettings {
    AgentSettings {
        provider_backoff_ms: 5,
        provider_backoff_cap_ms: 20,
        ..AgentSettings::default()
    }
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let pool = connect_sqlite(dir.path().join("ant.db")).await.unwrap();

    let store = Arc::new(ConversationStore::new(pool.clone()).await.unwrap());
    let audit = Arc::new(AuditLog::new(pool.clone()).await.unwrap());
    let tasks = Arc::new(SqliteTaskStore::new(pool).await.unwrap());
    let model = Arc::new(MockChatModel::new());

    let orchestrator = Orchestrator::new(
        store.clone(),
        audit.clone(),
        ToolDispatcher::new(tasks.clone()),
        model.clone(),
        fast_settings(),
    );

    Harness {
        _dir: dir,
        orchestrator,
        model,
        store,
        audit,
        tasks,
    }
}

fn request(user_id: &str, conversation_id: Option<String>, message: &str) -> ChatRequest {
    ChatRequest {
        user_id: user_id.to_string(),
        conversation_id,
        message: message.to_string(),
    }
}

#[tokio::test]
async fn scenario_a_add_task_via_chat() {
    let h = harness().await;
    h.model.push_tool_calls(vec![tool_call(
        "call_1",
        "add_task",
        serde_json::json!({"title": "Buy groceries"}),
    )]);
    h.model.push_final("Added \"Buy groceries\" to your list.");

    let response = h
        .orchestrator
        .handle_message(
            request("u1", None, "Add a task to buy groceries"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.response, "Added \"Buy groceries\" to your list.");
    let usage = response.tool_usage.unwrap();
    assert_eq!(usage.intent, "add_task");
    assert!(usage.success);

    // 恰好一条审计行，参数与请求一致，状态 success
    let logs = h.audit.for_conversation(&response.conversation_id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].tool_name, "add_task");
    assert_eq!(logs[0].parameters["title"], "Buy groceries");
    assert_eq!(logs[0].status, AuditStatus::Success);

    // 任务确实落库
    let tasks = h.tasks.list_tasks("u1", StatusFilter::All).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].title, "Buy groceries");

    // 本回合恰好持久化两条消息：user + assistant，assistant 带工具摘要
    let messages = h
        .store
        .load_messages("u1", &response.conversation_id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, StoredRole::User);
    assert_eq!(messages[1].role, StoredRole::Assistant);
    assert!(messages[1].tool_call_results.is_some());
}

#[tokio::test]
async fn scenario_b_complete_missing_task() {
    let h = harness().await;
    h.model.push_tool_calls(vec![tool_call(
        "call_1",
        "complete_task",
        serde_json::json!({"task_id": "3"}),
    )]);
    h.model
        .push_final("I couldn't find task 3 in your list, so nothing was completed.");

    let response = h
        .orchestrator
        .handle_message(request("u1", None, "Complete task 3"), CancellationToken::new())
        .await
        .unwrap();

    // 领域错误不致命：回合正常结束并解释原因
    assert!(response.response.contains("couldn't find"));
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].status, ToolStatus::Error);

    let op = response.task_operation.unwrap();
    assert_eq!(op.operation, "complete_task");
    assert!(op.error.unwrap().contains("not found"));

    let logs = h.audit.for_conversation(&response.conversation_id).await.unwrap();
    assert_eq!(logs[0].status, AuditStatus::Error);
}

#[tokio::test]
async fn scenario_c_provider_recovers_within_retry_budget() {
    let h = harness().await;
    // 超时两次，第三次（预算内最后一次）成功
    h.model.push_error(ProviderError::Timeout(10));
    h.model.push_error(ProviderError::Timeout(10));
    h.model.push_final("Hello! How can I help with your tasks?");

    let response = h
        .orchestrator
        .handle_message(request("u1", None, "hi"), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.response, "Hello! How can I help with your tasks?");
    assert_eq!(h.model.call_count(), 3);
}

#[tokio::test]
async fn scenario_c_provider_exhausted_falls_back() {
    let h = harness().await;
    h.model.push_error(ProviderError::Timeout(10));
    h.model.push_error(ProviderError::Timeout(10));
    h.model.push_error(ProviderError::Timeout(10));

    let response = h
        .orchestrator
        .handle_message(
            request("u1", None, "Add a task to water the plants"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.response, PROVIDER_FALLBACK_REPLY);

    // 用户消息仍被持久化，但没有编造的 assistant 消息
    let messages = h
        .store
        .load_messages("u1", &response.conversation_id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, StoredRole::User);
    assert_eq!(messages[0].content, "Add a task to water the plants");
}

#[tokio::test]
async fn malformed_output_retries_like_transport_failure() {
    let h = harness().await;
    h.model
        .push_error(ProviderError::Malformed("no content".to_string()));
    h.model.push_final("Recovered.");

    let response = h
        .orchestrator
        .handle_message(request("u1", None, "hi"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.response, "Recovered.");
    assert_eq!(h.model.call_count(), 2);
}

#[tokio::test]
async fn cross_user_conversation_is_rejected_without_side_effects() {
    let h = harness().await;
    h.model.push_final("Hi!");
    let owned = h
        .orchestrator
        .handle_message(request("alice", None, "hello"), CancellationToken::new())
        .await
        .unwrap();

    let err = h
        .orchestrator
        .handle_message(
            request("bob", Some(owned.conversation_id.clone()), "show my tasks"),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Authorization));
    // 对外文案与「不存在」一致
    assert_eq!(err.user_message(), "Conversation not found.");

    // 没有写入任何消息或审计行
    let messages = h
        .store
        .load_messages("alice", &owned.conversation_id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    let logs = h.audit.for_conversation(&owned.conversation_id).await.unwrap();
    assert!(logs.is_empty());
}

#[tokio::test]
async fn unknown_conversation_is_not_found() {
    let h = harness().await;
    let err = h
        .orchestrator
        .handle_message(
            request("u1", Some("no-such-conversation".to_string()), "hi"),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::ConversationNotFound(_)));
}

#[tokio::test]
async fn tool_calls_execute_sequentially_in_model_order() {
    let h = harness().await;
    h.model.push_tool_calls(vec![
        tool_call("call_1", "add_task", serde_json::json!({"title": "Buy milk"})),
        tool_call("call_2", "list_tasks", serde_json::json!({"status": "all"})),
    ]);
    h.model.push_final("Added and listed.");

    let response = h
        .orchestrator
        .handle_message(
            request("u1", None, "Add milk to my list and show everything"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // list 的结果必须包含同回合先执行的 add 产生的任务
    assert_eq!(response.tool_calls.len(), 2);
    assert_eq!(response.tool_calls[0].tool, "add_task");
    assert_eq!(response.tool_calls[1].tool, "list_tasks");
    assert!(response.tool_calls[1].status == ToolStatus::Success);
    let listed = response.tool_calls[1].result.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["title"], "Buy milk");

    // 审计行按执行顺序排列，N 次请求恰好 N 行
    let logs = h.audit.for_conversation(&response.conversation_id).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].tool_name, "add_task");
    assert_eq!(logs[1].tool_name, "list_tasks");

    // 第二次模型调用的上下文里带有两条工具结果消息
    let second_call = h.model.history_at(1).unwrap();
    let tool_messages: Vec<_> = second_call
        .iter()
        .filter(|m| m.role == ChatRole::Tool)
        .collect();
    assert_eq!(tool_messages.len(), 2);
    assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(tool_messages[1].tool_call_id.as_deref(), Some("call_2"));
}

#[tokio::test]
async fn context_survives_process_restart() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("ant.db");

    let first_conversation_id;
    {
        let pool = connect_sqlite(&db_path).await.unwrap();
        let store = Arc::new(ConversationStore::new(pool.clone()).await.unwrap());
        let audit = Arc::new(AuditLog::new(pool.clone()).await.unwrap());
        let tasks = Arc::new(SqliteTaskStore::new(pool).await.unwrap());
        let model = Arc::new(MockChatModel::new());
        model.push_final("Noted: you prefer morning workouts.");

        let orchestrator = Orchestrator::new(
            store,
            audit,
            ToolDispatcher::new(tasks),
            model,
            fast_settings(),
        );
        let response = orchestrator
            .handle_message(
                request("u1", None, "I prefer working out in the morning"),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        first_conversation_id = response.conversation_id;
    }

    // 「重启」：全新的池与编排器，只有磁盘上的数据库是共同的
    let pool = connect_sqlite(&db_path).await.unwrap();
    let store = Arc::new(ConversationStore::new(pool.clone()).await.unwrap());
    let audit = Arc::new(AuditLog::new(pool.clone()).await.unwrap());
    let tasks = Arc::new(SqliteTaskStore::new(pool).await.unwrap());
    let model = Arc::new(MockChatModel::new());
    model.push_final("Yes, you said you prefer mornings.");

    let orchestrator = Orchestrator::new(
        store.clone(),
        audit,
        ToolDispatcher::new(tasks),
        model.clone(),
        fast_settings(),
    );
    let response = orchestrator
        .handle_message(
            request("u1", Some(first_conversation_id.clone()), "When do I like to work out?"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(response.conversation_id, first_conversation_id);

    // 重启后的模型调用能看到第一回合的完整历史
    let history = model.history_at(0).unwrap();
    let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
    assert!(contents.contains(&"I prefer working out in the morning"));
    assert!(contents.contains(&"Noted: you prefer morning workouts."));

    // 两次重建给出完全一致的消息序列
    let first = store.load_messages("u1", &first_conversation_id).await.unwrap();
    let second = store.load_messages("u1", &first_conversation_id).await.unwrap();
    assert_eq!(first.len(), 4);
    let ids_a: Vec<_> = first.iter().map(|m| m.id.clone()).collect();
    let ids_b: Vec<_> = second.iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids_a, ids_b);
}

#[tokio::test]
async fn unknown_tool_recovers_in_loop() {
    let h = harness().await;
    h.model.push_tool_calls(vec![tool_call(
        "call_1",
        "send_email",
        serde_json::json!({"to": "mom"}),
    )]);
    h.model
        .push_final("I can only manage tasks, I can't send emails.");

    let response = h
        .orchestrator
        .handle_message(request("u1", None, "Email my mom"), CancellationToken::new())
        .await
        .unwrap();

    // 未知工具不是系统故障：循环继续，模型得到纠正机会
    assert!(response.response.contains("can't send emails"));
    let logs = h.audit.for_conversation(&response.conversation_id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].tool_name, "send_email");
    assert_eq!(logs[0].status, AuditStatus::Error);
}

#[tokio::test]
async fn turn_limit_is_not_fatal() {
    let h = harness().await;
    // 模型每轮都要求列任务，永不给终态文本
    for _ in 0..4 {
        h.model.push_tool_calls(vec![tool_call(
            "",
            "list_tasks",
            serde_json::json!({"status": "all"}),
        )]);
    }

    let response = h
        .orchestrator
        .handle_message(
            request("u1", None, "Keep checking my list"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.response, TURN_LIMIT_NOTE);
    assert_eq!(h.model.call_count(), 4);

    // 回合照常持久化，审计行等于实际尝试次数
    let logs = h.audit.for_conversation(&response.conversation_id).await.unwrap();
    assert_eq!(logs.len(), 4);
    let messages = h
        .store
        .load_messages("u1", &response.conversation_id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
}

#[tokio::test]
async fn precancelled_turn_creates_nothing() {
    let h = harness().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h
        .orchestrator
        .handle_message(request("u1", None, "add something"), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Cancelled));
    assert_eq!(h.model.call_count(), 0);

    // 连空对话行都不留
    let conversations = h.store.list("u1").await.unwrap();
    assert!(conversations.is_empty());
}

/// 第一轮就取消令牌并请求一次 add_task，之后不再被调用
struct CancelAfterToolsModel {
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl ChatModel for CancelAfterToolsModel {
    async fn converse(
        &self,
        _history: &[ChatMessage],
        _tools: &[ToolSpec],
    ) -> Result<ModelReply, ProviderError> {
        self.cancel.cancel();
        Ok(ModelReply::ToolCalls(vec![tool_call(
            "call_1",
            "add_task",
            serde_json::json!({"title": "Water the plants"}),
        )]))
    }
}

#[tokio::test]
async fn cancellation_after_dispatch_keeps_audit_attributable() {
    let dir = TempDir::new().unwrap();
    let pool = connect_sqlite(dir.path().join("ant.db")).await.unwrap();
    let store = Arc::new(ConversationStore::new(pool.clone()).await.unwrap());
    let audit = Arc::new(AuditLog::new(pool.clone()).await.unwrap());
    let tasks = Arc::new(SqliteTaskStore::new(pool).await.unwrap());

    let cancel = CancellationToken::new();
    let model = Arc::new(CancelAfterToolsModel {
        cancel: cancel.clone(),
    });
    let orchestrator = Orchestrator::new(
        store.clone(),
        audit.clone(),
        ToolDispatcher::new(tasks.clone()),
        model,
        fast_settings(),
    );

    let err = orchestrator
        .handle_message(
            request("u1", None, "Add a task to water the plants"),
            cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Cancelled));

    // 已派发的调用执行完毕：任务真实存在，审计行已回填而非悬挂 pending
    let created = tasks.list_tasks("u1", StatusFilter::All).await.unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].title, "Water the plants");

    let conversations = store.list("u1").await.unwrap();
    assert_eq!(conversations.len(), 1);
    let logs = audit.for_conversation(&conversations[0].id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, AuditStatus::Success);

    // 触发消息已持久化，审计行的 message_id 指向它，归属链完整
    let messages = store
        .load_messages("u1", &conversations[0].id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, StoredRole::User);
    assert_eq!(logs[0].message_id, messages[0].id);
}

#[tokio::test]
async fn empty_message_rejected_before_any_persistence() {
    let h = harness().await;
    let err = h
        .orchestrator
        .handle_message(request("u1", None, "   "), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Validation(_)));

    let conversations = h.store.list("u1").await.unwrap();
    assert!(conversations.is_empty());
}

#[tokio::test]
async fn oversized_message_rejected() {
    let h = harness().await;
    let big = "x".repeat(10_001);
    let err = h
        .orchestrator
        .handle_message(request("u1", None, &big), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Validation(_)));
}

#[tokio::test]
async fn concurrent_turns_on_same_conversation_serialize() {
    let h = harness().await;
    h.model.push_final("first");
    let first = h
        .orchestrator
        .handle_message(request("u1", None, "one"), CancellationToken::new())
        .await
        .unwrap();

    let orchestrator = Arc::new(h.orchestrator);
    h.model.push_final("second");
    h.model.push_final("third");

    let a = {
        let o = orchestrator.clone();
        let id = first.conversation_id.clone();
        tokio::spawn(async move {
            o.handle_message(request("u1", Some(id), "two"), CancellationToken::new())
                .await
        })
    };
    let b = {
        let o = orchestrator.clone();
        let id = first.conversation_id.clone();
        tokio::spawn(async move {
            o.handle_message(request("u1", Some(id), "three"), CancellationToken::new())
                .await
        })
    };

    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    // 锁保证两回合串行落盘：3 个回合共 6 条消息，无交错丢失
    let messages = h
        .store
        .load_messages("u1", &first.conversation_id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 6);
}
