//! 持久化数据模型
//!
//! Conversation / StoredMessage / ToolCallLog 三张表的行类型。
//! 消息一旦写入，content 与 timestamp 不再变化；审计行只增不删。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 一段对话；revision 在每次持久化回合时 +1，用于并发写入的乐观检查
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: i64,
}

/// 持久化消息角色；工具调用元数据挂在消息上，不单独成角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoredRole {
    User,
    Assistant,
}

impl StoredRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoredRole::User => "user",
            StoredRole::Assistant => "assistant",
        }
    }
}

/// 持久化的单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub role: StoredRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// 本回合工具调用结果摘要；仅 assistant 消息携带
    pub tool_call_results: Option<Value>,
}

impl StoredMessage {
    pub fn user(
        id: impl Into<String>,
        conversation_id: &str,
        user_id: &str,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            role: StoredRole::User,
            content: content.into(),
            timestamp,
            tool_call_results: None,
        }
    }

    pub fn assistant(
        conversation_id: &str,
        user_id: &str,
        content: impl Into<String>,
        tool_call_results: Option<Value>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            role: StoredRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            tool_call_results,
        }
    }
}

/// 工具调用审计状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Pending,
    Success,
    Error,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Pending => "pending",
            AuditStatus::Success => "success",
            AuditStatus::Error => "error",
        }
    }
}

/// 一条工具调用审计记录：每次模型请求且编排器尝试的调用恰好一行，重试产生新行
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallLog {
    pub id: String,
    pub user_id: String,
    pub conversation_id: String,
    /// 触发本次调用的用户消息 id
    pub message_id: String,
    pub tool_name: String,
    pub parameters: Value,
    /// pending 期间为 None
    pub result: Option<Value>,
    pub status: AuditStatus,
    pub timestamp: DateTime<Utc>,
}

/// 解析存储的 rfc3339 时间戳；损坏的值作为解码错误上报，
/// 绝不静默替换（替换会悄悄打乱重建历史的顺序）
pub(crate) fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::ColumnDecode {
            index: "timestamp".to_string(),
            source: Box::new(e),
        })
}
